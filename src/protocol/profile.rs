//! Instrument profiles.
//!
//! Every profile starts from the same base registry and applies an ordered
//! list of registry edits. Where two types can claim the same file the
//! edit states which one is probed first.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::config::{ClassifierConfig, Settings};
use crate::error::{EngineError, EngineResult};
use crate::protocol::element::{ElementType, TypeGuesser};
use crate::protocol::handlers::{HeaderFileHandler, ResourceHandler};
use crate::protocol::registry::{ContentProbe, DispatchRegistry, RegistryEntry};

const MICROSCOPE_PICTURES: &[&str] = &[r"\.tiff?$"];
const OPTICAL_IMAGES: &[&str] = &[r"\.jpe?g$", r"\.png$", r"\.bmp$"];
const YAML_MANIFESTS: &[&str] = &[r"\.ya?ml$"];
const ATTACHMENTS: &[&str] = &[
    r"\.pdf$",
    r"\.docx?$",
    r"\.xlsx?$",
    r"\.pptx?$",
    r"\.odt$",
    r"\.txt$",
    r"\.csv$",
    r"\.md$",
];

const NAVIGATION_PICTURES: &[&str] = &[r"(^|/)nav(cam)?[^/]*\.(tiff?|jpe?g|png)$"];
const VEGA_PICTURES: &[&str] = &[r"\.tiff?$", r"\.jpe?g$"];
const VEGA_HEADERS: &[&str] = &[r"\.hdr$"];
const VIDEOS: &[&str] = &[r"\.mp4$", r"\.avi$", r"\.wmv$", r"\.mov$"];

/// Bytes of a JPEG searched for the acquisition header.
const JPEG_SCAN_LIMIT: u64 = 64 * 1024;
/// First section of the header the microscope embeds in its JPEGs.
const VEGA_JPEG_MARKER: &[u8] = b"[MAIN]";

/// Which instrument writes into the watched tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentProfile {
    /// Pictures, optical images, manifests and attachments.
    #[default]
    Generic,
    /// Adds chamber navigation pictures.
    Quattro,
    /// Adds header sidecars and content based JPEG routing.
    Vega,
    /// Adds video captures.
    Versa,
}

impl InstrumentProfile {
    pub const ALL: [InstrumentProfile; 4] = [
        InstrumentProfile::Generic,
        InstrumentProfile::Quattro,
        InstrumentProfile::Vega,
        InstrumentProfile::Versa,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentProfile::Generic => "generic",
            InstrumentProfile::Quattro => "quattro",
            InstrumentProfile::Vega => "vega",
            InstrumentProfile::Versa => "versa",
        }
    }

    /// Build this profile's registry.
    pub fn registry(&self, case_sensitive: bool) -> EngineResult<DispatchRegistry> {
        let mut registry = base_registry(case_sensitive)?;
        let guesser = |include: &[&str]| TypeGuesser::new(include, &[], case_sensitive);

        match self {
            InstrumentProfile::Generic => {}
            InstrumentProfile::Quattro => {
                registry.insert_before(
                    ElementType::MicroscopePicture,
                    ElementType::NavigationPicture,
                    resource_entry(guesser(NAVIGATION_PICTURES)?),
                )?;
            }
            InstrumentProfile::Vega => {
                registry.replace_guesser(ElementType::MicroscopePicture, guesser(VEGA_PICTURES)?)?;
                registry.replace_handler(
                    ElementType::MicroscopePicture,
                    Arc::new(ResourceHandler::with_sidecar("hdr")),
                )?;
                registry.set_probe(
                    ElementType::MicroscopePicture,
                    Arc::new(JpegMarkerProbe::new(VEGA_JPEG_MARKER)),
                )?;
                registry.insert_before(
                    ElementType::Attachment,
                    ElementType::HeaderFile,
                    RegistryEntry::new(guesser(VEGA_HEADERS)?, Arc::new(HeaderFileHandler)),
                )?;
            }
            InstrumentProfile::Versa => {
                registry.insert_before(
                    ElementType::Attachment,
                    ElementType::Video,
                    resource_entry(guesser(VIDEOS)?),
                )?;
            }
        }

        Ok(registry)
    }
}

impl fmt::Display for InstrumentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn resource_entry(guesser: TypeGuesser) -> RegistryEntry {
    RegistryEntry::new(guesser, Arc::new(ResourceHandler::new()))
}

/// Registry shared by every profile.
///
/// Microscope pictures come before optical images and attachments come
/// last, as the broadest catch.
pub fn base_registry(case_sensitive: bool) -> EngineResult<DispatchRegistry> {
    let guesser = |include: &[&str]| TypeGuesser::new(include, &[], case_sensitive);

    let mut registry = DispatchRegistry::new();
    registry.register(
        ElementType::MicroscopePicture,
        resource_entry(guesser(MICROSCOPE_PICTURES)?),
    )?;
    registry.register(ElementType::OpticalImage, resource_entry(guesser(OPTICAL_IMAGES)?))?;
    registry.register(ElementType::YamlManifest, resource_entry(guesser(YAML_MANIFESTS)?))?;
    registry.register(ElementType::Attachment, resource_entry(guesser(ATTACHMENTS)?))?;
    Ok(registry)
}

/// Replace guessers with the configured patterns.
///
/// A type the profile already has keeps its position; an unknown type is
/// appended with the plain resource handler.
pub fn apply_overrides(
    registry: &mut DispatchRegistry,
    overrides: &ClassifierConfig,
    case_sensitive: bool,
) -> EngineResult<()> {
    let mut kinds: Vec<_> = overrides.overrides.keys().copied().collect();
    kinds.sort();

    for kind in kinds {
        let Some(config) = overrides.overrides.get(&kind) else {
            continue;
        };
        let guesser = TypeGuesser::new(config.include.as_slice(), config.exclude.as_slice(), case_sensitive)?;
        if registry.contains(kind) {
            registry.replace_guesser(kind, guesser)?;
        } else {
            registry.register(kind, resource_entry(guesser))?;
        }
        crate::debug_event!("profile", "override", "{kind}: {:?}", config.include);
    }
    Ok(())
}

/// Registry for the configured profile with overrides applied.
pub fn registry_from_settings(settings: &Settings) -> EngineResult<DispatchRegistry> {
    let case_sensitive = settings.watch.case_sensitive;
    let mut registry = settings.protocol.instrument.registry(case_sensitive)?;
    apply_overrides(&mut registry, &settings.classifier, case_sensitive)?;
    Ok(registry)
}

/// Routes JPEGs by looking for the microscope's embedded header.
///
/// A JPEG carrying the marker is a microscope picture, any other is an
/// optical image. Non-JPEG files keep their guess.
#[derive(Debug, Clone)]
pub struct JpegMarkerProbe {
    marker: Vec<u8>,
}

impl JpegMarkerProbe {
    pub fn new(marker: &[u8]) -> Self {
        Self {
            marker: marker.to_vec(),
        }
    }

    fn is_jpeg(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
    }
}

impl ContentProbe for JpegMarkerProbe {
    fn resolve(&self, path: &Path, guessed: ElementType) -> EngineResult<ElementType> {
        if !Self::is_jpeg(path) || self.marker.is_empty() {
            return Ok(guessed);
        }

        let file = File::open(path).map_err(|e| EngineError::io("opening", path, e))?;
        let mut head = Vec::new();
        file.take(JPEG_SCAN_LIMIT)
            .read_to_end(&mut head)
            .map_err(|e| EngineError::io("reading", path, e))?;

        let found = head.windows(self.marker.len()).any(|w| w == self.marker.as_slice());
        Ok(if found {
            ElementType::MicroscopePicture
        } else {
            ElementType::OpticalImage
        })
    }
}

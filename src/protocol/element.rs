//! Semantic element types and the pattern guessers recognising them.

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::EngineResult;
use crate::watcher::filter::{compile_set, path_key};

/// Semantic classification of a file in the watched tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    /// Image acquired by the microscope itself.
    MicroscopePicture,
    /// Photograph taken with an optical camera or stereo microscope.
    OpticalImage,
    /// Any document the operator drops next to the pictures.
    Attachment,
    /// Protocol customisation manifest.
    YamlManifest,
    Video,
    /// Overview image from the chamber navigation camera.
    NavigationPicture,
    /// Sidecar file carrying the metadata of a paired picture.
    HeaderFile,
}

impl ElementType {
    pub const ALL: [ElementType; 7] = [
        ElementType::MicroscopePicture,
        ElementType::OpticalImage,
        ElementType::Attachment,
        ElementType::YamlManifest,
        ElementType::Video,
        ElementType::NavigationPicture,
        ElementType::HeaderFile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::MicroscopePicture => "microscope_picture",
            ElementType::OpticalImage => "optical_image",
            ElementType::Attachment => "attachment",
            ElementType::YamlManifest => "yaml_manifest",
            ElementType::Video => "video",
            ElementType::NavigationPicture => "navigation_picture",
            ElementType::HeaderFile => "header_file",
        }
    }

    /// Whether the file content must be a decodable image.
    pub fn is_image(&self) -> bool {
        matches!(
            self,
            ElementType::MicroscopePicture
                | ElementType::OpticalImage
                | ElementType::NavigationPicture
        )
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Include/exclude pattern pair recognising one element type.
///
/// `matches(path)` is `included AND NOT excluded`.
#[derive(Debug, Clone)]
pub struct TypeGuesser {
    include_patterns: Vec<String>,
    include: RegexSet,
    exclude: Option<RegexSet>,
}

impl TypeGuesser {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S], case_sensitive: bool) -> EngineResult<Self> {
        let exclude = if exclude.is_empty() {
            None
        } else {
            Some(compile_set(exclude, case_sensitive)?)
        };

        Ok(Self {
            include_patterns: include.iter().map(|p| p.as_ref().to_string()).collect(),
            include: compile_set(include, case_sensitive)?,
            exclude,
        })
    }

    /// Guesser without exclusions, case insensitive.
    pub fn including<S: AsRef<str>>(include: &[S]) -> EngineResult<Self> {
        Self::new(include, &[], false)
    }

    pub fn matches(&self, path: &Path) -> bool {
        let key = path_key(path);
        self.include.is_match(&key) && !self.exclude.as_ref().is_some_and(|set| set.is_match(&key))
    }

    /// The raw include patterns, used to build the classification filter.
    pub fn include_patterns(&self) -> &[String] {
        &self.include_patterns
    }
}

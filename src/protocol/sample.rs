//! Samples and the resources they own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::protocol::element::ElementType;

const TIFF_LE: &[u8] = b"II*\0";
const TIFF_BE: &[u8] = b"MM\0*";
const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF];
const JPEG_END: &[u8] = &[0xFF, 0xD9];
const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const BMP: &[u8] = b"BM";

/// A file attached to the protocol, either at top level or under a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ElementType,
    pub path: PathBuf,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    /// Metadata merged from sidecar files, keyed by field name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Resource {
    /// Read `path` from disk as an element of type `kind`.
    ///
    /// Image kinds must carry a known signature; JPEGs must also be
    /// complete, which catches files the instrument has not finished writing.
    pub fn load(path: &Path, kind: ElementType) -> EngineResult<Self> {
        let meta = std::fs::metadata(path).map_err(|e| EngineError::io("reading", path, e))?;

        if kind.is_image() {
            check_image(path, meta.len())?;
        }

        Ok(Self {
            kind,
            path: path.to_path_buf(),
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            metadata: BTreeMap::new(),
        })
    }

    /// Re-read size and modification time, keeping collected metadata.
    pub fn update(&mut self) -> EngineResult<()> {
        let fresh = Self::load(&self.path, self.kind)?;
        self.size = fresh.size;
        self.modified = fresh.modified;
        Ok(())
    }
}

/// Validate the signature (and JPEG trailer) of an image file.
pub fn check_image(path: &Path, len: u64) -> EngineResult<()> {
    let corrupt = |reason: &str| EngineError::CorruptImage {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if len == 0 {
        return Err(corrupt("file is empty"));
    }

    let mut file = File::open(path).map_err(|e| EngineError::io("opening", path, e))?;
    let mut head = [0u8; 8];
    let read = file
        .read(&mut head)
        .map_err(|e| EngineError::io("reading", path, e))?;
    let head = &head[..read];

    if head.starts_with(TIFF_LE) || head.starts_with(TIFF_BE) || head.starts_with(PNG) || head.starts_with(BMP) {
        return Ok(());
    }

    if head.starts_with(JPEG) {
        let mut tail = [0u8; 2];
        file.seek(SeekFrom::End(-2))
            .and_then(|_| file.read_exact(&mut tail))
            .map_err(|e| EngineError::io("reading", path, e))?;
        if tail != JPEG_END {
            return Err(corrupt("truncated JPEG stream"));
        }
        return Ok(());
    }

    Err(corrupt("unknown image signature"))
}

/// A node of the protocol hierarchy, named after its directory path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// `/` joined path segments relative to the protocol root.
    pub full_name: String,
    pub resources: BTreeMap<PathBuf, Resource>,
}

impl Sample {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            resources: BTreeMap::new(),
        }
    }

    /// Last segment of the full name.
    pub fn short_name(&self) -> &str {
        self.full_name.rsplit('/').next().unwrap_or(&self.full_name)
    }

    /// Full name of the parent sample, `None` for top-level samples.
    pub fn parent_name(&self) -> Option<&str> {
        self.full_name.rsplit_once('/').map(|(parent, _)| parent)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn resources_of(&self, kind: ElementType) -> impl Iterator<Item = &Resource> {
        self.resources.values().filter(move |r| r.kind == kind)
    }
}

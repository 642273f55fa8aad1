//! Pushing the protocol document to its external store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::protocol::document::ProtocolDocument;
use crate::protocol::element::ElementType;

/// Result of a successful post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The remote entry no longer accepts edits.
    ReadOnly,
}

/// External document store.
///
/// Posting is expected to be repeatable. Transient failures are returned
/// as errors and leave the scheduler's pending flag set.
pub trait DocumentPublisher: Send + Sync {
    fn name(&self) -> &str;

    fn post(&self, document: &ProtocolDocument, skip_attachments: bool) -> EngineResult<PublishOutcome>;
}

/// Copy of `document` without attachment resources.
pub fn without_attachments(document: &ProtocolDocument) -> ProtocolDocument {
    let mut copy = document.snapshot();
    copy.resources.retain(|_, r| r.kind != ElementType::Attachment);
    for sample in copy.samples.values_mut() {
        sample
            .resources
            .retain(|_, r| r.kind != ElementType::Attachment);
    }
    copy
}

#[derive(Serialize)]
struct Envelope<'a> {
    published_at: DateTime<Utc>,
    attachments_included: bool,
    document: &'a ProtocolDocument,
}

/// Writes the document as pretty JSON to a local file.
///
/// The file is written next to its final location and renamed over it, so
/// readers never see a partial document. A read-only target file is
/// reported as a read-only remote entry.
#[derive(Debug, Clone)]
pub struct SnapshotPublisher {
    path: PathBuf,
}

impl SnapshotPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_locked(&self) -> bool {
        fs::metadata(&self.path)
            .map(|m| m.permissions().readonly())
            .unwrap_or(false)
    }
}

impl DocumentPublisher for SnapshotPublisher {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn post(&self, document: &ProtocolDocument, skip_attachments: bool) -> EngineResult<PublishOutcome> {
        if self.is_locked() {
            return Ok(PublishOutcome::ReadOnly);
        }

        let filtered;
        let document = if skip_attachments {
            filtered = without_attachments(document);
            &filtered
        } else {
            document
        };

        let envelope = Envelope {
            published_at: Utc::now(),
            attachments_included: !skip_attachments,
            document,
        };
        let json = serde_json::to_string_pretty(&envelope).map_err(|e| EngineError::Publish {
            reason: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io("creating", parent, e))?;
        }
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, json).map_err(|e| EngineError::io("writing", &temp, e))?;
        fs::rename(&temp, &self.path).map_err(|e| EngineError::io("renaming", &temp, e))?;

        crate::log_event!("publish", "snapshot written", "{}", self.path.display());
        Ok(PublishOutcome::Published)
    }
}

/// Publisher that only logs, used when no store is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

impl DocumentPublisher for NullPublisher {
    fn name(&self) -> &str {
        "null"
    }

    fn post(&self, document: &ProtocolDocument, skip_attachments: bool) -> EngineResult<PublishOutcome> {
        crate::debug_event!(
            "publish",
            "skipped",
            "{} samples, skip_attachments={skip_attachments}",
            document.samples.len()
        );
        Ok(PublishOutcome::Published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sample::Resource;
    use tempfile::TempDir;

    fn document() -> ProtocolDocument {
        let mut doc = ProtocolDocument::new("session", "/root");
        for (path, kind) in [
            ("/root/S1/img.tif", ElementType::MicroscopePicture),
            ("/root/S1/notes.pdf", ElementType::Attachment),
            ("/root/overview.pdf", ElementType::Attachment),
        ] {
            doc.attach(Resource {
                kind,
                path: PathBuf::from(path),
                size: 1,
                modified: None,
                metadata: Default::default(),
            })
            .unwrap();
        }
        doc
    }

    #[test]
    fn test_without_attachments() {
        let filtered = without_attachments(&document());
        assert!(filtered.resources.is_empty());
        assert_eq!(filtered.sample("S1").unwrap().resources.len(), 1);
    }

    #[test]
    fn test_snapshot_written_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out/protocol.json");
        let publisher = SnapshotPublisher::new(&path);

        let outcome = publisher.post(&document(), true).unwrap();
        assert_eq!(outcome, PublishOutcome::Published);
        assert!(!path.with_extension("json.tmp").exists());

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["attachments_included"], false);
        assert_eq!(value["document"]["title"], "session");
        assert!(value["document"]["resources"].as_object().unwrap().is_empty());

        publisher.post(&document(), false).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["document"]["resources"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_locked_snapshot_reports_read_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("protocol.json");
        fs::write(&path, "{}").unwrap();
        let mut permissions = fs::metadata(&path).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&path, permissions).unwrap();

        let outcome = SnapshotPublisher::new(&path).post(&document(), true).unwrap();
        assert_eq!(outcome, PublishOutcome::ReadOnly);
    }
}

//! The in-memory protocol record.
//!
//! Samples are keyed by full name in a sorted map so parents always sort
//! before their children. Resources outside any sample hang off the
//! protocol itself.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::protocol::hierarchy;
use crate::protocol::sample::{Resource, Sample};

/// Document handle shared between the engine and its readers.
///
/// Several watched roots may feed one document; the lock serialises their
/// mutations. Readers should take a [`ProtocolDocument::snapshot`] rather
/// than hold the lock.
pub type SharedDocument = Arc<Mutex<ProtocolDocument>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolDocument {
    pub title: String,
    pub root: PathBuf,
    pub samples: BTreeMap<String, Sample>,
    /// Resources found directly under the root.
    pub resources: BTreeMap<PathBuf, Resource>,
    /// Set once the remote entry refuses edits.
    #[serde(default)]
    pub read_only: bool,
}

impl ProtocolDocument {
    pub fn new(title: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            title: title.into(),
            root: root.into(),
            samples: BTreeMap::new(),
            resources: BTreeMap::new(),
            read_only: false,
        }
    }

    pub fn shared(self) -> SharedDocument {
        Arc::new(Mutex::new(self))
    }

    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    pub fn sample(&self, name: &str) -> Option<&Sample> {
        self.samples.get(name)
    }

    pub fn sample_names(&self) -> impl Iterator<Item = &str> {
        self.samples.keys().map(String::as_str)
    }

    /// Name of the sample owning `path`, `None` for protocol-level files.
    pub fn owner_of(&self, path: &Path) -> Option<String> {
        hierarchy::ancestor_names(&self.root, path).pop()
    }

    /// Whether `path`, taken as a directory, names an existing sample.
    pub fn sample_for_directory(&self, path: &Path) -> Option<String> {
        hierarchy::sample_name_of(&self.root, path).filter(|name| self.samples.contains_key(name))
    }

    pub fn resource(&self, path: &Path) -> Option<&Resource> {
        match self.owner_of(path) {
            Some(owner) => self.samples.get(&owner)?.resources.get(path),
            None => self.resources.get(path),
        }
    }

    pub fn resource_mut(&mut self, path: &Path) -> Option<&mut Resource> {
        match self.owner_of(path) {
            Some(owner) => self.samples.get_mut(&owner)?.resources.get_mut(path),
            None => self.resources.get_mut(path),
        }
    }

    /// Every resource in the document, protocol-level ones first.
    pub fn all_resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources
            .values()
            .chain(self.samples.values().flat_map(|s| s.resources.values()))
    }

    pub fn ensure_writable(&self, path: &Path) -> EngineResult<()> {
        if self.read_only {
            return Err(EngineError::ReadOnlyEntry {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Attach `resource`, creating its sample ancestry first.
    ///
    /// An existing resource at the same path is replaced.
    pub fn attach(&mut self, resource: Resource) -> EngineResult<()> {
        self.ensure_writable(&resource.path)?;
        hierarchy::ensure_ancestors(self, &resource.path);

        let path = resource.path.clone();
        match self.owner_of(&path) {
            Some(owner) => {
                if let Some(sample) = self.samples.get_mut(&owner) {
                    sample.resources.insert(path, resource);
                }
            }
            None => {
                self.resources.insert(path, resource);
            }
        }
        Ok(())
    }

    /// Detach the resource at `path` and prune emptied ancestors.
    ///
    /// Returns the removed resource, `None` if nothing was attached there.
    pub fn detach(&mut self, path: &Path) -> EngineResult<Option<Resource>> {
        self.ensure_writable(path)?;

        let removed = match self.owner_of(path) {
            Some(owner) => self
                .samples
                .get_mut(&owner)
                .and_then(|sample| sample.resources.remove(path)),
            None => self.resources.remove(path),
        };

        if removed.is_some() {
            hierarchy::prune_if_empty(self, path);
        }
        Ok(removed)
    }

    /// Remove a single sample. Fails unless it is empty.
    pub fn remove_sample(&mut self, name: &str) -> EngineResult<bool> {
        match self.samples.get(name) {
            None => Ok(false),
            Some(sample) if !sample.is_empty() => Err(EngineError::SampleNotEmpty {
                name: name.to_string(),
            }),
            Some(_) => {
                self.samples.remove(name);
                Ok(true)
            }
        }
    }

    /// Remove `name`, every sample below it and all their resources, then
    /// prune ancestors left empty.
    ///
    /// Returns the number of resources dropped.
    pub fn remove_sample_subtree(&mut self, name: &str) -> EngineResult<usize> {
        self.ensure_writable(&self.root.join(name))?;

        let prefix = format!("{name}/");
        let doomed: Vec<String> = self
            .samples
            .keys()
            .filter(|key| key.as_str() == name || key.starts_with(&prefix))
            .cloned()
            .collect();

        let mut dropped = 0;
        // Innermost first so every sample is empty when it goes
        for key in doomed.iter().rev() {
            if let Some(sample) = self.samples.get_mut(key) {
                dropped += sample.resources.len();
                sample.resources.clear();
            }
            self.remove_sample(key)?;
        }

        let mut ancestors = hierarchy::directory_names(&self.root, &self.root.join(name));
        ancestors.pop();
        hierarchy::prune_names(self, ancestors);

        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::element::ElementType;

    fn resource(path: &str, kind: ElementType) -> Resource {
        Resource {
            kind,
            path: PathBuf::from(path),
            size: 4,
            modified: None,
            metadata: Default::default(),
        }
    }

    fn picture(path: &str) -> Resource {
        resource(path, ElementType::MicroscopePicture)
    }

    #[test]
    fn test_attach_creates_ancestry() {
        let mut doc = ProtocolDocument::new("session", "/root");
        doc.attach(picture("/root/A/B/C/pic.tif")).unwrap();

        let names: Vec<_> = doc.sample_names().collect();
        assert_eq!(names, vec!["A", "A/B", "A/B/C"]);
        assert!(doc.resource(Path::new("/root/A/B/C/pic.tif")).is_some());
        assert!(doc.sample("A/B").unwrap().is_empty());
    }

    #[test]
    fn test_root_level_resources_belong_to_protocol() {
        let mut doc = ProtocolDocument::new("session", "/root");
        doc.attach(resource("/root/notes.txt", ElementType::Attachment))
            .unwrap();

        assert!(doc.samples.is_empty());
        assert_eq!(doc.resources.len(), 1);
        assert!(doc.detach(Path::new("/root/notes.txt")).unwrap().is_some());
        assert!(doc.resources.is_empty());
    }

    #[test]
    fn test_detach_prunes_ancestry() {
        let mut doc = ProtocolDocument::new("session", "/root");
        doc.attach(picture("/root/A/B/C/pic.tif")).unwrap();
        doc.attach(picture("/root/A/a.tif")).unwrap();

        doc.detach(Path::new("/root/A/B/C/pic.tif")).unwrap();

        let names: Vec<_> = doc.sample_names().collect();
        assert_eq!(names, vec!["A"]);
    }

    #[test]
    fn test_detach_unknown_path_is_noop() {
        let mut doc = ProtocolDocument::new("session", "/root");
        doc.attach(picture("/root/A/a.tif")).unwrap();

        assert!(doc.detach(Path::new("/root/A/missing.tif")).unwrap().is_none());
        assert!(doc.sample("A").is_some());
    }

    #[test]
    fn test_remove_non_empty_sample_fails() {
        let mut doc = ProtocolDocument::new("session", "/root");
        doc.attach(picture("/root/A/a.tif")).unwrap();

        assert!(matches!(
            doc.remove_sample("A"),
            Err(EngineError::SampleNotEmpty { .. })
        ));
    }

    #[test]
    fn test_remove_sample_subtree() {
        let mut doc = ProtocolDocument::new("session", "/root");
        doc.attach(picture("/root/A/B/one.tif")).unwrap();
        doc.attach(picture("/root/A/B/C/two.tif")).unwrap();
        doc.attach(picture("/root/A/BB/three.tif")).unwrap();

        let dropped = doc.remove_sample_subtree("A/B").unwrap();

        assert_eq!(dropped, 2);
        let names: Vec<_> = doc.sample_names().collect();
        assert_eq!(names, vec!["A", "A/BB"]);
    }

    #[test]
    fn test_remove_sample_subtree_prunes_parent() {
        let mut doc = ProtocolDocument::new("session", "/root");
        doc.attach(picture("/root/A/B/one.tif")).unwrap();

        doc.remove_sample_subtree("A/B").unwrap();
        assert!(doc.samples.is_empty());
    }

    #[test]
    fn test_read_only_document_refuses_mutation() {
        let mut doc = ProtocolDocument::new("session", "/root");
        doc.attach(picture("/root/A/a.tif")).unwrap();
        doc.read_only = true;

        assert!(matches!(
            doc.attach(picture("/root/A/b.tif")),
            Err(EngineError::ReadOnlyEntry { .. })
        ));
        assert!(matches!(
            doc.detach(Path::new("/root/A/a.tif")),
            Err(EngineError::ReadOnlyEntry { .. })
        ));
        assert!(doc.resource(Path::new("/root/A/a.tif")).is_some());
    }

    #[test]
    fn test_shared_snapshot_is_detached() {
        let shared = ProtocolDocument::new("session", "/root").shared();
        let snapshot = shared.lock().snapshot();

        shared.lock().attach(picture("/root/A/a.tif")).unwrap();

        assert!(snapshot.samples.is_empty());
        assert_eq!(shared.lock().samples.len(), 1);
    }
}

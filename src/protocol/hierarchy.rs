//! Sample ancestry derived from directory structure.
//!
//! A resource at `<root>/A/B/C/pic.tif` lives in sample `A/B/C`, which needs
//! `A` and `A/B` to exist first. Samples appear outermost first and are
//! pruned innermost first as soon as they become empty.

use std::path::{Component, Path};

use crate::protocol::document::ProtocolDocument;
use crate::protocol::sample::Sample;

/// Sample names implied by the directories of `path`, outermost first.
///
/// `path` is a file; its own name is not a sample. Paths outside `root`
/// yield no names.
pub fn ancestor_names(root: &Path, path: &Path) -> Vec<String> {
    match path.parent() {
        Some(parent) => directory_names(root, parent),
        None => Vec::new(),
    }
}

/// Sample names for a directory, including the directory itself.
pub fn directory_names(root: &Path, dir: &Path) -> Vec<String> {
    let Ok(rel) = dir.strip_prefix(root) else {
        return Vec::new();
    };

    let mut names = Vec::new();
    let mut current = String::new();
    for component in rel.components() {
        if let Component::Normal(segment) = component {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(&segment.to_string_lossy());
            names.push(current.clone());
        }
    }
    names
}

/// The sample name a directory would carry, if it lies below `root`.
pub fn sample_name_of(root: &Path, dir: &Path) -> Option<String> {
    directory_names(root, dir).pop()
}

/// Create the samples implied by `path` that do not exist yet.
///
/// Returns the names created, outermost first.
pub fn ensure_ancestors(doc: &mut ProtocolDocument, path: &Path) -> Vec<String> {
    let mut created = Vec::new();
    for name in ancestor_names(&doc.root, path) {
        if !doc.samples.contains_key(&name) {
            crate::debug_event!("hierarchy", "sample created", "{name}");
            doc.samples.insert(name.clone(), Sample::new(name.clone()));
            created.push(name);
        }
    }
    created
}

/// Remove empty samples on the ancestry of `path`, innermost first.
///
/// Stops at the first ancestor that still owns resources; nothing above it
/// is examined. Missing samples are stepped over.
pub fn prune_if_empty(doc: &mut ProtocolDocument, path: &Path) -> Vec<String> {
    prune_names(doc, ancestor_names(&doc.root, path))
}

/// Same as [`prune_if_empty`] for an explicit outermost-first name list.
pub(crate) fn prune_names(doc: &mut ProtocolDocument, names: Vec<String>) -> Vec<String> {
    let mut removed = Vec::new();
    for name in names.into_iter().rev() {
        match doc.samples.get(&name) {
            Some(sample) if !sample.is_empty() => break,
            Some(_) => {
                if has_children(doc, &name) {
                    break;
                }
                doc.samples.remove(&name);
                crate::debug_event!("hierarchy", "sample pruned", "{name}");
                removed.push(name);
            }
            None => continue,
        }
    }
    removed
}

/// Whether any other sample lives below `name`.
fn has_children(doc: &ProtocolDocument, name: &str) -> bool {
    let prefix = format!("{name}/");
    doc.samples
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(key, _)| key.starts_with(&prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::element::ElementType;
    use crate::protocol::sample::Resource;
    use std::path::PathBuf;

    fn resource(path: &str) -> Resource {
        Resource {
            kind: ElementType::MicroscopePicture,
            path: PathBuf::from(path),
            size: 1,
            modified: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_ancestor_names() {
        let names = ancestor_names(Path::new("/root"), Path::new("/root/A/B/C/pic.tif"));
        assert_eq!(names, vec!["A", "A/B", "A/B/C"]);

        assert!(ancestor_names(Path::new("/root"), Path::new("/root/pic.tif")).is_empty());
        assert!(ancestor_names(Path::new("/root"), Path::new("/other/A/pic.tif")).is_empty());
    }

    #[test]
    fn test_sample_name_of_directory() {
        assert_eq!(
            sample_name_of(Path::new("/root"), Path::new("/root/A/B")),
            Some("A/B".to_string())
        );
        assert_eq!(sample_name_of(Path::new("/root"), Path::new("/root")), None);
    }

    #[test]
    fn test_ensure_ancestors_outermost_first() {
        let mut doc = ProtocolDocument::new("test", "/root");
        doc.samples.insert("A".to_string(), Sample::new("A"));

        let created = ensure_ancestors(&mut doc, Path::new("/root/A/B/C/pic.tif"));
        assert_eq!(created, vec!["A/B", "A/B/C"]);
        assert_eq!(doc.samples.len(), 3);

        assert!(ensure_ancestors(&mut doc, Path::new("/root/A/B/C/pic.tif")).is_empty());
    }

    #[test]
    fn test_prune_stops_at_non_empty_ancestor() {
        let mut doc = ProtocolDocument::new("test", "/root");
        ensure_ancestors(&mut doc, Path::new("/root/A/B/C/pic.tif"));
        doc.samples
            .get_mut("A")
            .unwrap()
            .resources
            .insert(PathBuf::from("/root/A/a.tif"), resource("/root/A/a.tif"));

        let removed = prune_if_empty(&mut doc, Path::new("/root/A/B/C/pic.tif"));
        assert_eq!(removed, vec!["A/B/C", "A/B"]);
        assert!(doc.samples.contains_key("A"));
    }

    #[test]
    fn test_prune_does_not_skip_a_non_empty_parent() {
        let mut doc = ProtocolDocument::new("test", "/root");
        ensure_ancestors(&mut doc, Path::new("/root/A/B/C/pic.tif"));
        doc.samples
            .get_mut("A/B")
            .unwrap()
            .resources
            .insert(PathBuf::from("/root/A/B/b.tif"), resource("/root/A/B/b.tif"));

        let removed = prune_if_empty(&mut doc, Path::new("/root/A/B/C/pic.tif"));
        assert_eq!(removed, vec!["A/B/C"]);
        // `A` is empty but sits above a non-empty sample
        assert!(doc.samples.contains_key("A"));
    }

    #[test]
    fn test_prune_keeps_sample_with_child_samples() {
        let mut doc = ProtocolDocument::new("test", "/root");
        ensure_ancestors(&mut doc, Path::new("/root/A/B/pic.tif"));
        ensure_ancestors(&mut doc, Path::new("/root/A/X/pic.tif"));
        doc.samples
            .get_mut("A/X")
            .unwrap()
            .resources
            .insert(PathBuf::from("/root/A/X/pic.tif"), resource("/root/A/X/pic.tif"));

        let removed = prune_if_empty(&mut doc, Path::new("/root/A/B/pic.tif"));
        assert_eq!(removed, vec!["A/B"]);
        assert!(doc.samples.contains_key("A"));
    }
}

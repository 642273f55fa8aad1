//! Per element type create/modify/delete logic.
//!
//! Handlers run inside the engine's dispatch retry. They mutate the
//! document through a [`DispatchContext`] and flag it changed so the
//! scheduler knows a push is due.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::mirror::MirrorSynchronizer;
use crate::protocol::document::ProtocolDocument;
use crate::protocol::element::ElementType;
use crate::protocol::sample::Resource;

/// Extensions a header sidecar may be paired with.
const PICTURE_EXTENSIONS: &[&str] = &["tif", "tiff", "jpg", "jpeg", "png", "bmp"];

/// What a handler may touch while processing one event.
pub struct DispatchContext<'a> {
    pub document: &'a mut ProtocolDocument,
    pub mirror: Option<&'a MirrorSynchronizer>,
    changed: bool,
}

impl<'a> DispatchContext<'a> {
    pub fn new(document: &'a mut ProtocolDocument, mirror: Option<&'a MirrorSynchronizer>) -> Self {
        Self {
            document,
            mirror,
            changed: false,
        }
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Pass `err` through, re-copying the mirror first when it reports a
    /// corrupt image. The mirrored copy may be the broken one.
    pub fn recover(&self, path: &Path, err: EngineError) -> EngineError {
        if let (EngineError::CorruptImage { .. }, Some(mirror)) = (&err, self.mirror) {
            if let Err(copy_err) = mirror.recopy(path) {
                tracing::warn!("[dispatch] re-copy of {} failed: {copy_err}", path.display());
            }
        }
        err
    }
}

/// Create/modify/delete logic for one element type.
pub trait ElementHandler: Send + Sync {
    /// Handler name for logging.
    fn name(&self) -> &str;

    fn on_create(&self, ctx: &mut DispatchContext<'_>, path: &Path, kind: ElementType) -> EngineResult<()>;

    fn on_modify(&self, ctx: &mut DispatchContext<'_>, path: &Path, kind: ElementType) -> EngineResult<()>;

    fn on_delete(&self, ctx: &mut DispatchContext<'_>, path: &Path, kind: ElementType) -> EngineResult<()>;
}

/// Attaches files as resources of their sample.
///
/// Pictures, optical images, attachments, videos and manifests all share
/// this behaviour. With a sidecar extension set, a header file lying next
/// to a new resource is merged into its metadata.
#[derive(Debug, Default, Clone)]
pub struct ResourceHandler {
    sidecar_extension: Option<String>,
}

impl ResourceHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sidecar(extension: impl Into<String>) -> Self {
        Self {
            sidecar_extension: Some(extension.into()),
        }
    }

    fn sidecar_metadata(&self, path: &Path) -> EngineResult<Option<BTreeMap<String, String>>> {
        let Some(extension) = &self.sidecar_extension else {
            return Ok(None);
        };
        let sidecar = siblings_with_extension(path, &[extension.as_str()])
            .into_iter()
            .find(|candidate| candidate.is_file());
        match sidecar {
            Some(sidecar) => read_header(&sidecar).map(Some),
            None => Ok(None),
        }
    }
}

impl ElementHandler for ResourceHandler {
    fn name(&self) -> &str {
        "resource"
    }

    fn on_create(&self, ctx: &mut DispatchContext<'_>, path: &Path, kind: ElementType) -> EngineResult<()> {
        ctx.document.ensure_writable(path)?;

        let mut resource = Resource::load(path, kind).map_err(|e| ctx.recover(path, e))?;
        if let Some(metadata) = self.sidecar_metadata(path)? {
            resource.metadata.extend(metadata);
        }

        ctx.document.attach(resource)?;
        ctx.mark_changed();
        crate::log_event!("dispatch", "attached", "{kind} {}", path.display());
        Ok(())
    }

    fn on_modify(&self, ctx: &mut DispatchContext<'_>, path: &Path, kind: ElementType) -> EngineResult<()> {
        ctx.document.ensure_writable(path)?;

        if !ctx.document.resource(path).is_some_and(|r| r.kind == kind) {
            return self.on_create(ctx, path, kind);
        }
        let result = match ctx.document.resource_mut(path) {
            Some(resource) => resource.update(),
            None => Ok(()),
        };
        result.map_err(|e| ctx.recover(path, e))?;

        ctx.mark_changed();
        crate::debug_event!("dispatch", "updated", "{kind} {}", path.display());
        Ok(())
    }

    fn on_delete(&self, ctx: &mut DispatchContext<'_>, path: &Path, kind: ElementType) -> EngineResult<()> {
        if ctx.document.detach(path)?.is_some() {
            ctx.mark_changed();
            crate::log_event!("dispatch", "detached", "{kind} {}", path.display());
        }
        Ok(())
    }
}

/// Merges `key=value` sidecar files into the paired picture.
///
/// Header files are never attached themselves. When the picture arrives
/// after its header, the picture's [`ResourceHandler::with_sidecar`] picks
/// the header up instead.
#[derive(Debug, Default, Clone)]
pub struct HeaderFileHandler;

impl HeaderFileHandler {
    fn paired_picture(doc: &ProtocolDocument, header: &Path) -> Option<PathBuf> {
        siblings_with_extension(header, PICTURE_EXTENSIONS)
            .into_iter()
            .find(|candidate| doc.resource(candidate).is_some_and(|r| r.kind.is_image()))
    }

    fn merge(&self, ctx: &mut DispatchContext<'_>, path: &Path) -> EngineResult<()> {
        ctx.document.ensure_writable(path)?;

        let Some(picture) = Self::paired_picture(ctx.document, path) else {
            crate::debug_event!("dispatch", "header without picture", "{}", path.display());
            return Ok(());
        };

        let metadata = read_header(path)?;
        if let Some(resource) = ctx.document.resource_mut(&picture) {
            resource.metadata.extend(metadata);
            ctx.mark_changed();
            crate::debug_event!("dispatch", "metadata merged", "{}", picture.display());
        }
        Ok(())
    }
}

impl ElementHandler for HeaderFileHandler {
    fn name(&self) -> &str {
        "header"
    }

    fn on_create(&self, ctx: &mut DispatchContext<'_>, path: &Path, _kind: ElementType) -> EngineResult<()> {
        self.merge(ctx, path)
    }

    fn on_modify(&self, ctx: &mut DispatchContext<'_>, path: &Path, _kind: ElementType) -> EngineResult<()> {
        self.merge(ctx, path)
    }

    fn on_delete(&self, ctx: &mut DispatchContext<'_>, path: &Path, _kind: ElementType) -> EngineResult<()> {
        let Some(picture) = Self::paired_picture(ctx.document, path) else {
            return Ok(());
        };
        ctx.document.ensure_writable(path)?;
        if let Some(resource) = ctx.document.resource_mut(&picture) {
            if !resource.metadata.is_empty() {
                resource.metadata.clear();
                ctx.mark_changed();
            }
        }
        Ok(())
    }
}

/// Files next to `path` with the same stem and one of `extensions`. The
/// extension comparison ignores case, so `IMG.HDR` finds `IMG.TIF`.
fn siblings_with_extension(path: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let (Some(dir), Some(stem)) = (path.parent(), path.file_stem()) else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut found: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|candidate| candidate != path && candidate.file_stem() == Some(stem))
        .filter(|candidate| {
            candidate
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(ext)))
        })
        .collect();
    found.sort();
    found
}

/// Read and parse a header sidecar.
pub fn read_header(path: &Path) -> EngineResult<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path).map_err(|e| EngineError::io("reading", path, e))?;
    Ok(parse_header(&text))
}

/// Parse INI style `key=value` lines, ignoring sections and comments.
pub fn parse_header(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(['#', ';', '[']))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ProtocolDocument) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("S1")).unwrap();
        let doc = ProtocolDocument::new("test", dir.path());
        (dir, doc)
    }

    #[test]
    fn test_parse_header() {
        let parsed = parse_header(
            "[MAIN]\nDevice=VEGA\n; comment\nHV = 15000\n\n# other\nnot a pair\n=orphan\n",
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["Device"], "VEGA");
        assert_eq!(parsed["HV"], "15000");
    }

    #[test]
    fn test_create_modify_delete_cycle() {
        let (dir, mut doc) = setup();
        let path = dir.path().join("S1/img.tif");
        fs::write(&path, b"II*\0abc").unwrap();
        let handler = ResourceHandler::new();

        let mut ctx = DispatchContext::new(&mut doc, None);
        handler
            .on_create(&mut ctx, &path, ElementType::MicroscopePicture)
            .unwrap();
        assert!(ctx.changed());

        fs::write(&path, b"II*\0abcdef").unwrap();
        let mut ctx = DispatchContext::new(&mut doc, None);
        handler
            .on_modify(&mut ctx, &path, ElementType::MicroscopePicture)
            .unwrap();
        assert!(ctx.changed());
        assert_eq!(doc.resource(&path).unwrap().size, 10);

        let mut ctx = DispatchContext::new(&mut doc, None);
        handler
            .on_delete(&mut ctx, &path, ElementType::MicroscopePicture)
            .unwrap();
        assert!(ctx.changed());
        assert!(doc.samples.is_empty());
    }

    #[test]
    fn test_delete_of_unknown_resource_leaves_flag_clear() {
        let (dir, mut doc) = setup();
        let mut ctx = DispatchContext::new(&mut doc, None);

        ResourceHandler::new()
            .on_delete(&mut ctx, &dir.path().join("S1/none.tif"), ElementType::Attachment)
            .unwrap();
        assert!(!ctx.changed());
    }

    #[test]
    fn test_corrupt_picture_is_not_attached() {
        let (dir, mut doc) = setup();
        let path = dir.path().join("S1/img.jpg");
        fs::write(&path, [0xFF, 0xD8, 0xFF, 0x00]).unwrap();

        let mut ctx = DispatchContext::new(&mut doc, None);
        let err = ResourceHandler::new()
            .on_create(&mut ctx, &path, ElementType::MicroscopePicture)
            .unwrap_err();

        assert!(matches!(err, EngineError::CorruptImage { .. }));
        assert!(!ctx.changed());
        assert!(doc.samples.is_empty());
    }

    #[test]
    fn test_header_merges_into_existing_picture() {
        let (dir, mut doc) = setup();
        let picture = dir.path().join("S1/img.tif");
        let header = dir.path().join("S1/img.hdr");
        fs::write(&picture, b"II*\0abc").unwrap();
        fs::write(&header, "[MAIN]\nMagnification=5000\n").unwrap();

        let mut ctx = DispatchContext::new(&mut doc, None);
        ResourceHandler::new()
            .on_create(&mut ctx, &picture, ElementType::MicroscopePicture)
            .unwrap();
        let mut ctx = DispatchContext::new(&mut doc, None);
        HeaderFileHandler
            .on_create(&mut ctx, &header, ElementType::HeaderFile)
            .unwrap();

        assert!(ctx.changed());
        assert_eq!(doc.resource(&picture).unwrap().metadata["Magnification"], "5000");

        let mut ctx = DispatchContext::new(&mut doc, None);
        HeaderFileHandler
            .on_delete(&mut ctx, &header, ElementType::HeaderFile)
            .unwrap();
        assert!(doc.resource(&picture).unwrap().metadata.is_empty());
    }

    #[test]
    fn test_picture_picks_up_earlier_header() {
        let (dir, mut doc) = setup();
        let picture = dir.path().join("S1/img.tif");
        let header = dir.path().join("S1/img.hdr");
        fs::write(&header, "WD=10.2\n").unwrap();

        let mut ctx = DispatchContext::new(&mut doc, None);
        HeaderFileHandler
            .on_create(&mut ctx, &header, ElementType::HeaderFile)
            .unwrap();
        assert!(!ctx.changed());

        fs::write(&picture, b"II*\0abc").unwrap();
        let mut ctx = DispatchContext::new(&mut doc, None);
        ResourceHandler::with_sidecar("hdr")
            .on_create(&mut ctx, &picture, ElementType::MicroscopePicture)
            .unwrap();
        assert_eq!(doc.resource(&picture).unwrap().metadata["WD"], "10.2");
    }

    #[test]
    fn test_upper_case_header_pairs_with_picture() {
        let (dir, mut doc) = setup();
        let picture = dir.path().join("S1/IMG.TIF");
        let header = dir.path().join("S1/IMG.HDR");
        fs::write(&picture, b"II*\0abc").unwrap();
        fs::write(&header, "HV=20000\n").unwrap();

        let mut ctx = DispatchContext::new(&mut doc, None);
        ResourceHandler::with_sidecar("hdr")
            .on_create(&mut ctx, &picture, ElementType::MicroscopePicture)
            .unwrap();
        assert_eq!(doc.resource(&picture).unwrap().metadata["HV"], "20000");

        fs::write(&header, "HV=25000\n").unwrap();
        let mut ctx = DispatchContext::new(&mut doc, None);
        HeaderFileHandler
            .on_modify(&mut ctx, &header, ElementType::HeaderFile)
            .unwrap();
        assert!(ctx.changed());
        assert_eq!(doc.resource(&picture).unwrap().metadata["HV"], "25000");
    }

    #[test]
    fn test_read_only_document_rejects_create() {
        let (dir, mut doc) = setup();
        doc.read_only = true;
        let path = dir.path().join("S1/notes.txt");
        fs::write(&path, b"hello").unwrap();

        let mut ctx = DispatchContext::new(&mut doc, None);
        assert!(matches!(
            ResourceHandler::new().on_create(&mut ctx, &path, ElementType::Attachment),
            Err(EngineError::ReadOnlyEntry { .. })
        ));
    }
}

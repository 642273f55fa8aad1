//! Ordered registry of element types and the classifier over it.
//!
//! Classification walks the entries in registration order and stops at the
//! first guesser that matches, so every mutation here states where the
//! entry ends up. Existing entries never move relative to each other.

use indexmap::IndexMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::protocol::element::{ElementType, TypeGuesser};
use crate::protocol::handlers::ElementHandler;

/// Refines a name-based guess by looking at the file content.
pub trait ContentProbe: Send + Sync {
    /// Return the type `path` should be handled as, given the name-based
    /// guess. Returning `guessed` keeps the guess.
    fn resolve(&self, path: &Path, guessed: ElementType) -> EngineResult<ElementType>;
}

/// Guesser, handler and optional content probe of one element type.
#[derive(Clone)]
pub struct RegistryEntry {
    pub guesser: TypeGuesser,
    pub handler: Arc<dyn ElementHandler>,
    pub probe: Option<Arc<dyn ContentProbe>>,
}

impl RegistryEntry {
    pub fn new(guesser: TypeGuesser, handler: Arc<dyn ElementHandler>) -> Self {
        Self {
            guesser,
            handler,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ContentProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("guesser", &self.guesser)
            .field("handler", &self.handler.name())
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchRegistry {
    entries: IndexMap<ElementType, RegistryEntry>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, kind: ElementType) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Append `kind` after every existing entry.
    pub fn register(&mut self, kind: ElementType, entry: RegistryEntry) -> EngineResult<()> {
        if self.entries.contains_key(&kind) {
            return Err(already_registered(kind));
        }
        self.entries.insert(kind, entry);
        Ok(())
    }

    /// Insert `kind` directly in front of `anchor`, so it is probed first.
    pub fn insert_before(
        &mut self,
        anchor: ElementType,
        kind: ElementType,
        entry: RegistryEntry,
    ) -> EngineResult<()> {
        if self.entries.contains_key(&kind) {
            return Err(already_registered(kind));
        }
        let index = self
            .entries
            .get_index_of(&anchor)
            .ok_or_else(|| not_registered(anchor))?;
        self.entries.shift_insert(index, kind, entry);
        Ok(())
    }

    /// Swap the handler of `kind` in place.
    pub fn replace_handler(
        &mut self,
        kind: ElementType,
        handler: Arc<dyn ElementHandler>,
    ) -> EngineResult<()> {
        self.entry_mut(kind)?.handler = handler;
        Ok(())
    }

    /// Swap the guesser of `kind` in place.
    pub fn replace_guesser(&mut self, kind: ElementType, guesser: TypeGuesser) -> EngineResult<()> {
        self.entry_mut(kind)?.guesser = guesser;
        Ok(())
    }

    pub fn set_probe(&mut self, kind: ElementType, probe: Arc<dyn ContentProbe>) -> EngineResult<()> {
        self.entry_mut(kind)?.probe = Some(probe);
        Ok(())
    }

    /// Remove `kind`; the remaining entries keep their order.
    pub fn remove(&mut self, kind: ElementType) -> EngineResult<RegistryEntry> {
        self.entries
            .shift_remove(&kind)
            .ok_or_else(|| not_registered(kind))
    }

    pub fn get(&self, kind: ElementType) -> Option<&RegistryEntry> {
        self.entries.get(&kind)
    }

    pub fn handler(&self, kind: ElementType) -> Option<Arc<dyn ElementHandler>> {
        self.entries.get(&kind).map(|entry| Arc::clone(&entry.handler))
    }

    /// Registered types in probing order.
    pub fn order(&self) -> Vec<ElementType> {
        self.entries.keys().copied().collect()
    }

    /// First type whose guesser matches `path`, by name only.
    pub fn classify(&self, path: &Path) -> Option<ElementType> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.guesser.matches(path))
            .map(|(kind, _)| *kind)
    }

    /// Classify `path` and let the matching entry's probe inspect the file.
    ///
    /// A probe may reroute to another registered type; anything else keeps
    /// the name-based guess.
    pub fn effective_type(&self, path: &Path) -> EngineResult<Option<ElementType>> {
        let Some(guessed) = self.classify(path) else {
            return Ok(None);
        };
        let Some(probe) = self.entries.get(&guessed).and_then(|e| e.probe.as_ref()) else {
            return Ok(Some(guessed));
        };

        let resolved = probe.resolve(path, guessed)?;
        if resolved != guessed && !self.entries.contains_key(&resolved) {
            tracing::warn!(
                "[registry] probe picked unregistered type {resolved} for {}, keeping {guessed}",
                path.display()
            );
            return Ok(Some(guessed));
        }
        Ok(Some(resolved))
    }

    /// Include patterns of every entry, in registry order.
    pub fn include_patterns(&self) -> Vec<String> {
        self.entries
            .values()
            .flat_map(|entry| entry.guesser.include_patterns().iter().cloned())
            .collect()
    }

    fn entry_mut(&mut self, kind: ElementType) -> EngineResult<&mut RegistryEntry> {
        self.entries.get_mut(&kind).ok_or_else(|| not_registered(kind))
    }
}

fn already_registered(kind: ElementType) -> EngineError {
    EngineError::AlreadyRegistered {
        element: kind.to_string(),
    }
}

fn not_registered(kind: ElementType) -> EngineError {
    EngineError::NotRegistered {
        element: kind.to_string(),
    }
}

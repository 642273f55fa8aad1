//! Regex based event filtering.
//!
//! Two filters run in the pipeline: a broad one in front of the mirror and a
//! narrower one in front of classification. Both use the same rules:
//! directories pass unless ignored, an excluded path suppresses the event,
//! and a move whose destination comes into scope is dispatched even when its
//! source was excluded (temp file renamed to its final name).

use regex::{RegexSet, RegexSetBuilder};
use std::borrow::Cow;
use std::path::Path;

use crate::error::EngineResult;
use crate::watcher::event::{EventKind, FileSystemEvent};

/// Normalise a path for pattern matching (always `/` separated).
pub fn path_key(path: &Path) -> Cow<'_, str> {
    let text = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        text
    } else {
        Cow::Owned(text.replace(std::path::MAIN_SEPARATOR, "/"))
    }
}

/// Compile a list of patterns into a set honouring case sensitivity.
pub(crate) fn compile_set<S: AsRef<str>>(patterns: &[S], case_sensitive: bool) -> EngineResult<RegexSet> {
    let set = RegexSetBuilder::new(patterns.iter().map(|p| p.as_ref()))
        .case_insensitive(!case_sensitive)
        .build()?;
    Ok(set)
}

/// Accepts or rejects raw events by path pattern.
#[derive(Debug, Clone)]
pub struct EventFilter {
    include: RegexSet,
    exclude: Option<RegexSet>,
    ignore_directories: bool,
}

impl EventFilter {
    pub fn builder() -> EventFilterBuilder {
        EventFilterBuilder::default()
    }

    /// A filter letting every file and directory through.
    pub fn accept_all() -> Self {
        Self {
            include: RegexSet::new([".*"]).unwrap_or_else(|_| RegexSet::empty()),
            exclude: None,
            ignore_directories: false,
        }
    }

    pub fn is_included(&self, path: &Path) -> bool {
        self.include.is_match(&path_key(path))
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude
            .as_ref()
            .is_some_and(|set| set.is_match(&path_key(path)))
    }

    fn in_scope(&self, path: &Path) -> bool {
        self.is_included(path) && !self.is_excluded(path)
    }

    /// Whether `event` should continue down the pipeline.
    pub fn should_dispatch(&self, event: &FileSystemEvent) -> bool {
        if event.is_directory {
            return !self.ignore_directories;
        }

        if event.kind == EventKind::Moved {
            if let Some(dest) = event.dest_path.as_deref() {
                if self.in_scope(dest) {
                    return true;
                }
            }
        }

        let mut included = false;
        for path in event.paths() {
            if self.is_excluded(path) {
                return false;
            }
            included |= self.is_included(path);
        }
        included
    }
}

/// Builder for [`EventFilter`].
#[derive(Debug, Default)]
pub struct EventFilterBuilder {
    include: Vec<String>,
    exclude: Vec<String>,
    case_sensitive: bool,
    ignore_directories: bool,
}

impl EventFilterBuilder {
    pub fn include<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.case_sensitive = yes;
        self
    }

    pub fn ignore_directories(mut self, yes: bool) -> Self {
        self.ignore_directories = yes;
        self
    }

    pub fn build(self) -> EngineResult<EventFilter> {
        let include = compile_set(&self.include, self.case_sensitive)?;
        let exclude = if self.exclude.is_empty() {
            None
        } else {
            Some(compile_set(&self.exclude, self.case_sensitive)?)
        };

        Ok(EventFilter {
            include,
            exclude,
            ignore_directories: self.ignore_directories,
        })
    }
}

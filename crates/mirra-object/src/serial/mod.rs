//! Schema-tolerant tagged serialization
//!
//! Instances are saved as a stream of self-describing property records:
//! each record carries the property's name, wire type, and byte size, and
//! the stream ends with a sentinel. Because every record is skippable by
//! its recorded size, data written by an older or newer schema still loads:
//! matching properties are applied, renamed ones resolve through the
//! redirect table, and everything else is skipped and counted.
//!
//! Save diffs against a default instance and emits only properties that
//! differ, unless the struct is atomic or the context forces a full write.

pub mod json;
mod reader;
mod tag;
mod writer;

pub use reader::load_instance;
pub use tag::{PropertyTag, TagAux, WireType};
pub use writer::{save_instance, save_instance_buffered};

use crate::registry::redirects::RedirectTable;
use rustc_hash::FxHashSet;

/// Knobs for one save pass.
///
/// `defaults` points at the default instance bytes to diff against (usually
/// the class default object); without it every eligible property is
/// written. Cooked saves drop load-time affordances (guid hints) that only
/// matter when schemas drift.
pub struct SaveContext<'a> {
    /// Optimized output: omit guid rename hints
    pub cooked: bool,
    /// Include editor-only properties
    pub editor_data: bool,
    /// Write every eligible property even when it matches the defaults
    pub force_full: bool,
    /// Default instance bytes to diff against
    pub defaults: Option<&'a [u8]>,
    /// Restrict the save to these top-level property names
    pub subset: Option<&'a FxHashSet<String>>,
}

impl Default for SaveContext<'_> {
    fn default() -> Self {
        Self {
            cooked: false,
            editor_data: false,
            force_full: false,
            defaults: None,
            subset: None,
        }
    }
}

impl<'a> SaveContext<'a> {
    /// Context with no defaults: a full (non-diffed) editor-style save
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff against the given default instance bytes
    pub fn with_defaults(mut self, defaults: &'a [u8]) -> Self {
        self.defaults = Some(defaults);
        self
    }

    /// Produce cooked (optimized, hint-free) output
    pub fn cooked(mut self) -> Self {
        self.cooked = true;
        self
    }

    /// Include editor-only properties
    pub fn editor_data(mut self) -> Self {
        self.editor_data = true;
        self
    }

    /// Ignore the defaults and write everything eligible
    pub fn force_full(mut self) -> Self {
        self.force_full = true;
        self
    }

    /// Restrict to a top-level property-name subset
    pub fn subset(mut self, names: &'a FxHashSet<String>) -> Self {
        self.subset = Some(names);
        self
    }
}

/// Knobs for one load pass.
pub struct LoadContext<'r> {
    /// Data came from a cooked save: schemas are known to match, so guid
    /// hints and redirects are not consulted
    pub cooked: bool,
    /// Apply editor-only records instead of skipping them
    pub editor_data: bool,
    /// Rename redirects, consulted for non-cooked data
    pub redirects: Option<&'r RedirectTable>,
}

impl Default for LoadContext<'_> {
    fn default() -> Self {
        Self {
            cooked: false,
            editor_data: false,
            redirects: None,
        }
    }
}

impl<'r> LoadContext<'r> {
    /// Context for non-cooked data without redirects
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust the data to match the current schema exactly
    pub fn cooked(mut self) -> Self {
        self.cooked = true;
        self
    }

    /// Apply editor-only records
    pub fn editor_data(mut self) -> Self {
        self.editor_data = true;
        self
    }

    /// Consult a redirect table for renamed properties/structs/enums
    pub fn redirects(mut self, table: &'r RedirectTable) -> Self {
        self.redirects = Some(table);
        self
    }
}

/// Degradation counters from one load pass.
///
/// Schema drift is expected in the field; these let callers observe how
/// much of the stream actually landed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadStats {
    /// Records applied to the instance
    pub properties_loaded: usize,
    /// Records skipped (unresolved, retyped, out of range, editor-only)
    pub properties_skipped: usize,
    /// Records that needed a conversion (rename, enum/struct drift)
    pub tags_converted: usize,
}

impl LoadStats {
    /// Whether every record applied cleanly
    pub fn is_clean(&self) -> bool {
        self.properties_skipped == 0 && self.tags_converted == 0
    }
}

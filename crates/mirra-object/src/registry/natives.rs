//! Deferred native ops
//!
//! Reflected metadata is bound to separately compiled native code through a
//! name-keyed table: registration populates it during an init phase, and a
//! struct's first link consumes its entry exactly once. The registry is
//! explicit process state passed through registration; teardown is explicit
//! too, so leftover (never-consumed) entries are visible instead of leaking
//! silently.

use rustc_hash::FxHashMap;

/// Native construction hook: runs over the zeroed instance region.
pub type NativeConstructFn = fn(*mut u8);

/// Native destruction hook: runs over the constructed instance region.
pub type NativeDestructFn = fn(*mut u8);

/// Function set binding one reflected struct to native code.
#[derive(Debug, Clone, Copy)]
pub struct NativeOps {
    /// Invoked after the zero fill, before reflected property construction
    pub construct: Option<NativeConstructFn>,
    /// Invoked after reflected destruction of uncovered properties
    pub destruct: Option<NativeDestructFn>,
    /// Whether `destruct` owns destruction of this struct's properties and
    /// everything inherited below it
    pub destroys_self_and_supers: bool,
}

/// Name-keyed table of deferred native ops.
#[derive(Debug, Default)]
pub struct NativeOpsRegistry {
    entries: FxHashMap<String, NativeOps>,
}

impl NativeOpsRegistry {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register ops under a name during the init phase.
    ///
    /// Re-registering a name replaces the previous entry; the last
    /// registration before first link wins.
    pub fn register(&mut self, name: impl Into<String>, ops: NativeOps) {
        self.entries.insert(name.into(), ops);
    }

    /// One-time lookup: removes and returns the entry.
    ///
    /// Called by the linker on a struct's first link.
    pub fn consume(&mut self, name: &str) -> Option<NativeOps> {
        self.entries.remove(name)
    }

    /// Whether a name is still registered (not yet consumed)
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of unconsumed entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Explicit teardown: drops all unconsumed entries and returns their
    /// names, letting callers log types that never linked.
    pub fn teardown(&mut self) -> Vec<String> {
        let mut leftover: Vec<String> = self.entries.drain().map(|(name, _)| name).collect();
        leftover.sort();
        leftover
    }
}

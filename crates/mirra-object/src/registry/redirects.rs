//! Rename redirects
//!
//! Historical renames of properties, structs, and enums, consulted only when
//! loading non-optimized (non-cooked) data. Property redirects are scoped to
//! an owning struct name; lookup walks the loading struct's super chain
//! nearest-first and the first hit wins.

use rustc_hash::FxHashMap;
use serde::Deserialize;

/// One redirect entry as carried in configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RedirectEntry {
    /// `{Struct}.{OldName}` -> `{NewName}`
    Property {
        owner: String,
        old: String,
        new: String,
    },
    /// Struct rename
    Struct { old: String, new: String },
    /// Enum rename
    Enum { old: String, new: String },
}

/// Redirect table for properties, structs, and enums.
#[derive(Debug, Default)]
pub struct RedirectTable {
    properties: FxHashMap<(String, String), String>,
    structs: FxHashMap<String, String>,
    enums: FxHashMap<String, String>,
}

impl RedirectTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a property rename scoped to its owning struct
    pub fn add_property(
        &mut self,
        owner: impl Into<String>,
        old: impl Into<String>,
        new: impl Into<String>,
    ) {
        self.properties
            .insert((owner.into(), old.into()), new.into());
    }

    /// Record a struct rename
    pub fn add_struct(&mut self, old: impl Into<String>, new: impl Into<String>) {
        self.structs.insert(old.into(), new.into());
    }

    /// Record an enum rename
    pub fn add_enum(&mut self, old: impl Into<String>, new: impl Into<String>) {
        self.enums.insert(old.into(), new.into());
    }

    /// Load entries from a JSON configuration document: an array of
    /// [`RedirectEntry`] objects.
    pub fn load_json(&mut self, text: &str) -> Result<usize, serde_json::Error> {
        let entries: Vec<RedirectEntry> = serde_json::from_str(text)?;
        let count = entries.len();
        for entry in entries {
            match entry {
                RedirectEntry::Property { owner, old, new } => self.add_property(owner, old, new),
                RedirectEntry::Struct { old, new } => self.add_struct(old, new),
                RedirectEntry::Enum { old, new } => self.add_enum(old, new),
            }
        }
        Ok(count)
    }

    /// Look up a property rename for one specific owning struct name.
    pub fn property(&self, owner: &str, old: &str) -> Option<&str> {
        self.properties
            .get(&(owner.to_string(), old.to_string()))
            .map(String::as_str)
    }

    /// Look up a property rename along an owning-struct chain,
    /// nearest-struct-first; the first hit wins.
    pub fn property_in_chain<'a, I>(&self, chain: I, old: &str) -> Option<&str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for owner in chain {
            if let Some(new) = self.property(owner, old) {
                return Some(new);
            }
        }
        None
    }

    /// Look up a struct rename
    pub fn struct_name(&self, old: &str) -> Option<&str> {
        self.structs.get(old).map(String::as_str)
    }

    /// Look up an enum rename
    pub fn enum_name(&self, old: &str) -> Option<&str> {
        self.enums.get(old).map(String::as_str)
    }

    /// Whether the table holds no entries
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.structs.is_empty() && self.enums.is_empty()
    }
}

//! # Resolved Profiles
//!
//! A [`Profile`] is the read model produced once capture has stopped: a
//! [`StackStash`] keyed by interned symbol names plus the [`SymbolTable`]
//! that names them. It is built once and never mutated afterwards.
//!
//! Every trace is rooted at `"[Everything]"`, followed by the process name,
//! then the frames from outermost to innermost.
//!
//! ## Views
//!
//! - [`Profile::objects`]: flat list, one entry per symbol
//! - [`Profile::callers`]: who calls a symbol, recursion-aware
//! - [`Profile::descendants`]: the call tree below a symbol, recursion folded

pub mod file_format;
pub mod views;

pub use views::{Descendant, DescendantTree};

use std::collections::HashMap;

use serde::Serialize;

use crate::domain::SymbolId;
use crate::stackstash::StackStash;

/// Root frame of every resolved trace
pub const EVERYTHING: &str = "[Everything]";

/// Caller name for occurrences at the root of the tree
pub const SPONTANEOUS: &str = "<spontaneous>";

/// Interner mapping symbol names to dense ids
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    names: Vec<String>,
    ids: HashMap<String, SymbolId>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `name`, allocating one on first sight
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = SymbolId(u32::try_from(self.names.len()).unwrap_or(u32::MAX));
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<SymbolId> {
        self.ids.get(name).copied()
    }

    /// Name of `id`; empty for ids this table never handed out
    #[must_use]
    pub fn name(&self, id: SymbolId) -> &str {
        self.names.get(id.0 as usize).map_or("", String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// All `(id, name)` pairs in id order
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &str)> + '_ {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| (SymbolId(u32::try_from(i).unwrap_or(u32::MAX)), name.as_str()))
    }
}

/// One row of a flat or caller listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileObject {
    pub name: String,
    #[serde(rename = "self")]
    pub self_weight: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Profile {
    symbols: SymbolTable,
    stash: StackStash<SymbolId>,
}

impl Profile {
    #[must_use]
    pub fn new(symbols: SymbolTable, stash: StackStash<SymbolId>) -> Self {
        Self { symbols, stash }
    }

    #[must_use]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    #[must_use]
    pub fn stash(&self) -> &StackStash<SymbolId> {
        &self.stash
    }

    /// Total sample weight
    #[must_use]
    pub fn size(&self) -> u64 {
        self.stash.total_weight()
    }

    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<SymbolId> {
        self.symbols.get(name)
    }

    /// Every symbol with its self and total weight, heaviest total first
    #[must_use]
    pub fn objects(&self) -> Vec<ProfileObject> {
        let mut objects = Vec::with_capacity(self.symbols.len());
        self.stash.foreach_by_address(|id, self_weight, total| {
            objects.push(ProfileObject {
                name: self.symbols.name(id).to_string(),
                self_weight,
                total,
            });
        });
        sort_objects(&mut objects);
        objects
    }

    /// Callers of `callee`; see [`views::callers`]
    #[must_use]
    pub fn callers(&self, callee: SymbolId) -> Vec<ProfileObject> {
        let mut objects: Vec<ProfileObject> = views::callers(&self.stash, callee)
            .into_iter()
            .map(|(caller, self_weight, total)| ProfileObject {
                name: caller.map_or(SPONTANEOUS, |id| self.symbols.name(id)).to_string(),
                self_weight,
                total,
            })
            .collect();
        sort_objects(&mut objects);
        objects
    }

    /// Call tree below `symbol`; see [`views::descendants`]
    #[must_use]
    pub fn descendants(&self, symbol: SymbolId) -> DescendantTree {
        views::descendants(&self.stash, symbol)
    }
}

fn sort_objects(objects: &mut [ProfileObject]) {
    objects.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));
}

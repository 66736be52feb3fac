//! Run-wide duplicate suppression keyed by record id.
//!
//! The seen-set is never persisted on its own. On resume it is rebuilt from
//! the ids already present in the output, so the output stays the only source
//! of truth for what has been emitted.

use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<String>,
    suppressed: u64,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with ids that were emitted by an earlier run.
    pub fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            seen: ids.into_iter().collect(),
            suppressed: 0,
        }
    }

    /// `true` the first time `id` is offered, marking it seen; `false` afterwards.
    pub fn is_new(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            self.suppressed += 1;
            return false;
        }
        self.seen.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Duplicates rejected so far.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

//! Trait abstractions for state storage operations.
//!
//! `StateStore` covers the configuration and the in-progress operation
//! record; `ObsoleteStore` is the query interface over obsolescence
//! markers. Both are implemented by [`crate::Store`] on disk and by
//! in-memory mocks in tests.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;

use rebar_git::RevId;

use crate::Result;
use crate::config::Config;
use crate::obsolete::Marker;
use crate::state::{OperationRecord, Transaction};

/// Trait for state storage operations.
#[allow(clippy::missing_errors_doc)]
pub trait StateStore {
    // === Initialization ===

    /// Check if rebar is initialized in this repository.
    fn is_initialized(&self) -> bool;

    /// Initialize the .git/rebar/ directory structure.
    fn init(&self) -> Result<()>;

    /// Get the path to the rebar directory.
    fn rebar_dir(&self) -> &Path;

    // === Config Operations ===

    /// Load the config from disk.
    fn load_config(&self) -> Result<Config>;

    /// Save the config to disk.
    fn save_config(&self, config: &Config) -> Result<()>;

    // === Operation Lock ===

    /// Take the exclusive operation lock.
    fn begin(&self) -> Result<Transaction>;

    // === Rebase State Operations ===

    /// Check if a rebase is in progress.
    fn is_rebase_in_progress(&self) -> bool;

    /// Load the persisted operation record.
    fn load_record(&self) -> Result<OperationRecord>;

    /// Persist the operation record. Requires the lock.
    fn save_record(&self, tx: &Transaction, record: &OperationRecord) -> Result<()>;

    /// Remove the operation record. Requires the lock.
    fn clear_record(&self, tx: &Transaction) -> Result<()>;
}

/// Query interface over obsolescence markers.
#[allow(clippy::missing_errors_doc)]
pub trait ObsoleteStore {
    /// Every marker recorded so far.
    fn markers(&self) -> Result<Vec<Marker>>;

    /// Record new markers.
    fn add_markers(&self, markers: &[Marker]) -> Result<()>;

    /// Direct successors of `rev`. Empty for pruned or live revisions.
    fn successors_of(&self, rev: RevId) -> Result<Vec<RevId>> {
        Ok(self
            .markers()?
            .into_iter()
            .filter(|marker| marker.predecessor == rev)
            .flat_map(|marker| marker.successors)
            .collect())
    }

    /// Whether some marker names `rev` as predecessor.
    fn is_obsolete(&self, rev: RevId) -> Result<bool> {
        Ok(self
            .markers()?
            .iter()
            .any(|marker| marker.predecessor == rev))
    }

    /// Transitive successors of `rev`, excluding `rev` itself.
    fn all_successors(&self, rev: RevId) -> Result<BTreeSet<RevId>> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([rev]);
        while let Some(current) = queue.pop_front() {
            for successor in self.successors_of(current)? {
                if successor != rev && seen.insert(successor) {
                    queue.push_back(successor);
                }
            }
        }
        Ok(seen)
    }
}

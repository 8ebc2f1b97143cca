//! Trait abstractions for the revision store and the working copy.
//!
//! The rebase engine only ever talks to these traits, which keeps it
//! independent of the storage format and lets tests drive it with an
//! in-memory graph.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, FixedOffset};

use crate::{Result, RevId};

/// Up to two parents of a revision. A root revision has neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Parents {
    /// First parent.
    pub first: Option<RevId>,
    /// Second parent, only set for merges.
    pub second: Option<RevId>,
}

impl Parents {
    /// Parents of a root revision.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            first: None,
            second: None,
        }
    }

    /// Parents of an ordinary revision.
    #[must_use]
    pub const fn one(first: RevId) -> Self {
        Self {
            first: Some(first),
            second: None,
        }
    }

    /// Parents of a merge revision.
    #[must_use]
    pub const fn two(first: RevId, second: RevId) -> Self {
        Self {
            first: Some(first),
            second: Some(second),
        }
    }

    /// Both parent slots, absent parents included.
    #[must_use]
    pub const fn slots(self) -> [Option<RevId>; 2] {
        [self.first, self.second]
    }

    /// Whether this revision merges two lines of history.
    #[must_use]
    pub const fn is_merge(self) -> bool {
        self.second.is_some()
    }

    /// Present parents, first parent first.
    pub fn iter(self) -> impl Iterator<Item = RevId> {
        self.slots().into_iter().flatten()
    }

    /// Whether `rev` is one of the parents.
    #[must_use]
    pub fn contains(self, rev: RevId) -> bool {
        self.iter().any(|p| p == rev)
    }
}

/// Name and email of whoever wrote a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// Metadata of a stored revision.
#[derive(Debug, Clone)]
pub struct Revision {
    pub id: RevId,
    pub parents: Parents,
    pub description: String,
    pub author: Author,
    pub date: DateTime<FixedOffset>,
    /// Opaque key/value metadata carried along by rewrites.
    pub extra: BTreeMap<String, String>,
}

impl Revision {
    /// First line of the description.
    #[must_use]
    pub fn summary(&self) -> &str {
        self.description.lines().next().unwrap_or_default()
    }
}

/// Read-only queries over the revision DAG.
#[allow(clippy::missing_errors_doc)]
pub trait RevisionGraph {
    /// Load a revision's metadata.
    fn revision(&self, rev: RevId) -> Result<Revision>;

    /// Parents of a revision.
    fn parents(&self, rev: RevId) -> Result<Parents>;

    /// Whether the revision is present in the store.
    fn exists(&self, rev: RevId) -> bool;

    /// The one revision whose hex id starts with `prefix`, if exactly one
    /// does.
    fn resolve_prefix(&self, prefix: &str) -> Result<Option<RevId>>;

    /// Whether `ancestor` is reachable from `descendant`. A revision is its
    /// own ancestor.
    fn is_ancestor(&self, ancestor: RevId, descendant: RevId) -> Result<bool>;

    /// All ancestors of the given revisions, the revisions included.
    fn ancestors(&self, revs: &[RevId]) -> Result<BTreeSet<RevId>>;

    /// Best common ancestor of two revisions, if they share history.
    fn common_ancestor(&self, a: RevId, b: RevId) -> Result<Option<RevId>>;

    /// All visible descendants of the given revisions, the revisions
    /// included.
    fn descendants(&self, revs: &[RevId]) -> Result<BTreeSet<RevId>>;

    /// Whether the revision has been published and must not be rewritten.
    fn is_immutable(&self, rev: RevId) -> Result<bool>;

    /// Ancestors of `heads` that are not ancestors of `excluded`.
    fn only(&self, heads: &[RevId], excluded: &[RevId]) -> Result<BTreeSet<RevId>> {
        let hidden = self.ancestors(excluded)?;
        Ok(self
            .ancestors(heads)?
            .into_iter()
            .filter(|rev| !hidden.contains(rev))
            .collect())
    }
}

/// Where a merge is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Merge trees in memory without touching the working copy.
    InMemory,
    /// Check out the first parent and merge into the working copy, so
    /// conflicts can be resolved by the user.
    OnDisk,
}

/// Apply the changes of `rev` (relative to `base`) on top of `p1`.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub rev: RevId,
    pub p1: RevId,
    pub p2: Option<RevId>,
    /// Merge base; `None` merges against the empty tree.
    pub base: Option<RevId>,
    /// Accumulate on top of earlier merges instead of starting from `p1`.
    pub collapsing: bool,
    pub strategy: MergeStrategy,
}

/// Outcome of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeResult {
    /// Paths left with conflict markers.
    pub unresolved: Vec<String>,
}

impl MergeResult {
    /// Number of conflicted paths.
    #[must_use]
    pub fn unresolved_count(&self) -> usize {
        self.unresolved.len()
    }

    /// Whether the merge finished without conflicts.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Commit the result of the preceding merge(s).
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub parents: Vec<RevId>,
    pub description: String,
    pub author: Author,
    pub date: DateTime<FixedOffset>,
    pub extra: BTreeMap<String, String>,
    /// Create the revision even if it changes nothing relative to its
    /// first parent.
    pub allow_empty: bool,
    pub strategy: MergeStrategy,
}

/// A revision created by [`WorkingCopy::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub id: RevId,
    /// The new revision has the same content as its first parent.
    pub empty: bool,
}

/// Mutating operations on the working copy and references.
///
/// Note: like the graph queries, these are synchronous; the merge is the
/// only long-running step and it blocks the caller.
#[allow(clippy::missing_errors_doc)]
pub trait WorkingCopy: RevisionGraph {
    /// Revision the working copy is based on.
    fn working_position(&self) -> Result<RevId>;

    /// Name of the reference the working copy follows, if any.
    fn active_ref(&self) -> Result<Option<String>>;

    /// Discard working-copy changes and check out `rev`.
    fn update_to(&self, rev: RevId) -> Result<()>;

    /// Make the working copy follow `name` again.
    fn activate_ref(&self, name: &str) -> Result<()>;

    /// Whether the working copy has uncommitted changes to tracked files.
    fn is_clean(&self) -> Result<bool>;

    /// Whether conflict markers from an on-disk merge remain.
    fn has_unresolved(&self) -> Result<bool>;

    /// Paths still holding conflict markers from an on-disk merge.
    fn unresolved(&self) -> Result<Vec<String>>;

    /// Materialize a merge.
    fn merge(&self, request: &MergeRequest) -> Result<MergeResult>;

    /// Commit the materialized merge. Returns `None` when the result would
    /// be an empty non-merge revision and empty revisions are not allowed.
    fn commit(&self, request: &CommitRequest) -> Result<Option<Committed>>;

    /// Names of references pointing at `rev`.
    fn refs_at(&self, rev: RevId) -> Result<Vec<String>>;

    /// Point reference `name` at `rev`.
    fn move_ref(&self, name: &str, rev: RevId) -> Result<()>;

    /// Drop revisions produced by an abandoned operation.
    ///
    /// Refs are left alone. Stores that cannot delete revisions outright
    /// only forget their own bookkeeping of them, so the revisions become
    /// garbage once nothing else points at them.
    fn discard(&self, revs: &[RevId]) -> Result<()>;
}

//! Error types for rebar-git.

use crate::RevId;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the revision store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not inside a git repository.
    #[error("not a git repository")]
    NotARepository,

    /// Revision lookup failed.
    #[error("unknown revision: {0}")]
    RevisionNotFound(String),

    /// A string could not be parsed as a full revision id.
    #[error("invalid revision id '{0}'")]
    InvalidRevision(String),

    /// Reference not found.
    #[error("reference not found: {0}")]
    RefNotFound(String),

    /// Revisions with more than two parents cannot be rewritten.
    #[error("revision {0} has more than two parents")]
    OctopusMerge(RevId),

    /// A timestamp stored in a revision cannot be represented.
    #[error("invalid timestamp {0} in revision metadata")]
    InvalidDate(i64),

    /// The working copy still has conflicted paths.
    #[error("unresolved merge conflicts in: {0:?}")]
    UnresolvedConflicts(Vec<String>),

    /// An extra field name that cannot be stored as a commit header.
    #[error("invalid extra field name '{0}'")]
    InvalidExtraKey(String),

    /// IO error while maintaining working-copy bookkeeping.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying git2 error.
    #[error("git error: {0}")]
    Git2(#[from] git2::Error),
}

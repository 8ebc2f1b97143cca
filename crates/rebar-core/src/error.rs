//! Error types for rebar-core.

use std::fmt::Write as _;
use std::path::PathBuf;

use rebar_git::RevId;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used for exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request; nothing was changed.
    Input,
    /// Rewriting would create divergent successors.
    Divergence,
    /// The repository or operation is in the wrong state for the request.
    State,
    /// Internal invariant violated; the operation record is left in place.
    Consistency,
    /// Anything else (IO, storage).
    Other,
}

/// Errors that can occur in rebar-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not inside a Git repository.
    #[error("not a git repository (or any parent up to mount point)")]
    NotARepository,

    /// A source is already an ancestor of its destination.
    #[error("source is ancestor of destination")]
    SourceIsAncestor,

    /// The destination map loops back on itself.
    #[error("source and destination form a cycle")]
    Cycle,

    /// The selection resolved to revisions that cannot be rebased.
    #[error("{0}")]
    InvalidSelection(String),

    /// Collapse needs every source to share a destination.
    #[error("--collapse does not work with multiple destinations")]
    CollapseMultipleDestinations,

    /// Collapse would need more than one parent from outside the set.
    #[error("unable to collapse on top of {dest}, there is more than one external parent: {}", join(.parents))]
    MultipleExternalParents { dest: RevId, parents: Vec<RevId> },

    /// A merge revision whose parents all stay in place.
    #[error("cannot rebase {0} without moving at least one of its parents")]
    UnmovedParents(RevId),

    /// Every merge base candidate would drag unrelated revisions along.
    #[error("rebasing {rev} will include unwanted changes from {}", join(.unwanted))]
    UnwantedMergeBase { rev: RevId, unwanted: Vec<RevId> },

    /// Rewriting a published revision.
    #[error("cannot rebase immutable revision {0}\nhint: use --keep to keep original revisions")]
    ImmutableRevision(RevId),

    /// Obsolete revisions whose successors live elsewhere.
    #[error("this rebase will cause divergences from: {}\nhint: to force the rebase set rebase.allow_divergence = true", join(.0))]
    Divergence(Vec<RevId>),

    /// `--continue` or `--abort` without a rebase in progress.
    #[error("no rebase in progress")]
    NoRebaseInProgress,

    /// A new rebase while another is suspended.
    #[error("rebase in progress\nhint: use `rebar rebase --continue` or `rebar rebase --abort`")]
    RebaseInProgress,

    /// The working copy has changes that a merge would clobber.
    #[error("uncommitted changes in working copy")]
    DirtyWorkingCopy,

    /// Conflict markers remain in the working copy.
    #[error("unresolved merge conflicts in: {}\nhint: edit the files, then run `rebar rebase --continue`", .0.join(", "))]
    UnresolvedConflicts(Vec<String>),

    /// The persisted record no longer matches the repository.
    #[error("cannot continue inconsistent rebase: {0}\nhint: use `rebar rebase --abort` to clear broken state")]
    InconsistentState(String),

    /// A destination was scheduled before it was resolved.
    #[error("revision {rev} should be rebased already at this time (destination of {dependent})")]
    PendingDestination { rev: RevId, dependent: RevId },

    /// Another process holds the operation lock.
    #[error("another rebar process is running (lock held at {})", .0.display())]
    LockHeld(PathBuf),

    /// Lock file could not be opened or taken.
    #[error("failed to lock {}: {message}", .path.display())]
    Lock { path: PathBuf, message: String },

    /// State file parsing error.
    #[error("failed to parse {file}: {message}")]
    StateParseError { file: PathBuf, message: String },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Git operation error.
    #[error("git error: {0}")]
    Git(#[from] rebar_git::Error),
}

impl Error {
    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceIsAncestor
            | Self::Cycle
            | Self::InvalidSelection(_)
            | Self::CollapseMultipleDestinations
            | Self::UnmovedParents(_)
            | Self::UnwantedMergeBase { .. }
            | Self::ImmutableRevision(_)
            | Self::Git(rebar_git::Error::RevisionNotFound(_) | rebar_git::Error::RefNotFound(_)) => {
                ErrorKind::Input
            }
            Self::Divergence(_) => ErrorKind::Divergence,
            Self::MultipleExternalParents { .. }
            | Self::NotARepository
            | Self::NoRebaseInProgress
            | Self::RebaseInProgress
            | Self::DirtyWorkingCopy
            | Self::UnresolvedConflicts(_)
            | Self::InconsistentState(_)
            | Self::LockHeld(_)
            | Self::Git(
                rebar_git::Error::UnresolvedConflicts(_) | rebar_git::Error::NotARepository,
            ) => ErrorKind::State,
            Self::PendingDestination { .. } => ErrorKind::Consistency,
            _ => ErrorKind::Other,
        }
    }
}

fn join(revs: &[RevId]) -> String {
    let mut out = String::new();
    for (i, rev) in revs.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}", rev.short());
    }
    out
}

//! Rebase-set validation and the initial state of an operation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rebar_git::{RevId, RevisionGraph};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::schedule::{sort_sources, sort_topological};
use crate::state::{RevState, StateMap};

/// Source revision to the revision it should be moved onto.
pub type DestMap = BTreeMap<RevId, RevId>;

/// Why a request ended without rewriting anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NothingToRebase {
    /// The selection named no revisions.
    EmptySelection { option: &'static str },
    /// `--base` (or the working position) is the destination itself.
    BaseIsDestination { base: RevId, explicit: bool },
    /// `--base` (or the working position) is already behind the destination.
    BaseIsAncestor {
        base: Vec<RevId>,
        dest: RevId,
        explicit: bool,
    },
    /// No revisions between base and destination.
    NoBranch { base: Vec<RevId>, dest: RevId },
    /// Every root already sits directly on its destination.
    AlreadyInPlace,
}

impl fmt::Display for NothingToRebase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySelection { option } => {
                write!(f, "empty \"{option}\" revision set - nothing to rebase")
            }
            Self::BaseIsDestination { base, explicit: true } => write!(
                f,
                "nothing to rebase - {} is both \"base\" and destination",
                base.short()
            ),
            Self::BaseIsDestination { explicit: false, .. } => write!(
                f,
                "nothing to rebase - working directory parent is also destination"
            ),
            Self::BaseIsAncestor {
                base,
                dest,
                explicit: true,
            } => write!(
                f,
                "nothing to rebase - \"base\" {} is already an ancestor of destination {}",
                join_plus(base),
                dest.short()
            ),
            Self::BaseIsAncestor {
                dest,
                explicit: false,
                ..
            } => write!(
                f,
                "nothing to rebase - working directory parent is already an ancestor of destination {}",
                dest.short()
            ),
            Self::NoBranch { base, dest } => write!(
                f,
                "nothing to rebase from {} to {}",
                join_plus(base),
                dest.short()
            ),
            Self::AlreadyInPlace => write!(f, "nothing to rebase"),
        }
    }
}

fn join_plus(revs: &[RevId]) -> String {
    revs.iter().map(|rev| rev.short()).collect::<Vec<_>>().join("+")
}

/// A validated rebase ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebasePlan {
    pub original_position: RevId,
    pub destinations: DestMap,
    pub state: StateMap,
    /// Second parent of the collapsed revision, if any.
    pub external_parent: Option<RevId>,
}

/// Result of planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Planned {
    Ready(RebasePlan),
    Nothing(NothingToRebase),
}

/// Validate `destinations` and compute the initial state.
///
/// Roots of the first batch that already sit directly on their destination
/// are marked done, along with every revision whose parents are all done.
///
/// # Errors
/// Returns an input error for cycles, sources that are ancestors of their
/// destination, or collapse requests with several destinations.
#[instrument(skip_all, fields(sources = destinations.len(), collapse))]
pub fn build_plan<G: RevisionGraph>(
    graph: &G,
    destinations: DestMap,
    original_position: RevId,
    collapse: bool,
) -> Result<Planned> {
    if destinations.is_empty() {
        return Ok(Planned::Nothing(NothingToRebase::AlreadyInPlace));
    }

    let batches = sort_sources(&destinations)?;
    let first_batch = batches.first().cloned().unwrap_or_default();
    let roots = roots_of(graph, &first_batch)?;
    if roots.is_empty() {
        return Err(Error::InvalidSelection("no matching revisions".into()));
    }

    let mut state: StateMap = destinations
        .keys()
        .map(|rev| (*rev, RevState::Pending))
        .collect();

    let mut empty_rebase = batches.len() == 1;
    for root in roots {
        let dest = destinations[&root];
        let common = graph.common_ancestor(root, dest)?;
        if common == Some(root) {
            return Err(Error::SourceIsAncestor);
        }
        if common == Some(dest) && !collapse && graph.parents(root)?.contains(dest) {
            debug!(root = %root.short(), "source is a child of destination");
            state.insert(root, RevState::Rebased(root));
            continue;
        }
        empty_rebase = false;
        debug!(root = %root.short(), dest = %dest.short(), "rebase onto destination");
    }
    if empty_rebase {
        return Ok(Planned::Nothing(NothingToRebase::AlreadyInPlace));
    }

    let keys: Vec<RevId> = state.keys().copied().collect();
    for rev in sort_topological(graph, &keys)? {
        let parents = graph.parents(rev)?;
        if parents.first.is_some()
            && parents
                .iter()
                .all(|p| state.get(&p) == Some(&RevState::Rebased(p)))
        {
            state.insert(rev, RevState::Rebased(rev));
        }
    }

    let external_parent = if collapse {
        let dests: Vec<RevId> = destinations
            .values()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let &[dest] = dests.as_slice() else {
            return Err(Error::CollapseMultipleDestinations);
        };
        external_parent(graph, &state, dest)?
    } else {
        None
    };

    Ok(Planned::Ready(RebasePlan {
        original_position,
        destinations,
        state,
        external_parent,
    }))
}

/// Members of `revs` without a parent in `revs`.
fn roots_of<G: RevisionGraph + ?Sized>(graph: &G, revs: &[RevId]) -> Result<Vec<RevId>> {
    let members: BTreeSet<RevId> = revs.iter().copied().collect();
    let mut roots = vec![];
    for &rev in &members {
        if !graph.parents(rev)?.iter().any(|p| members.contains(&p)) {
            roots.push(rev);
        }
    }
    Ok(roots)
}

/// The single parent from outside the set that a collapsed revision must
/// keep, if any.
///
/// # Errors
/// Returns `MultipleExternalParents` when members reach outside the set in
/// more than one place.
pub fn external_parent<G: RevisionGraph + ?Sized>(
    graph: &G,
    state: &StateMap,
    dest: RevId,
) -> Result<Option<RevId>> {
    let members: Vec<RevId> = state.keys().copied().collect();
    let ordered = sort_topological(graph, &members)?;
    let Some((_, rest)) = ordered.split_first() else {
        return Ok(None);
    };

    let mut parents = BTreeSet::new();
    for &rev in rest {
        for parent in graph.parents(rev)?.iter() {
            if !state.contains_key(&parent) && !graph.is_ancestor(parent, dest)? {
                parents.insert(parent);
            }
        }
    }

    match parents.len() {
        0 => Ok(None),
        1 => Ok(parents.pop_first()),
        _ => Err(Error::MultipleExternalParents {
            dest,
            parents: parents.into_iter().collect(),
        }),
    }
}

/// Refuse to rewrite published revisions.
///
/// # Errors
/// Returns `ImmutableRevision` for the first immutable member of `revs`.
pub fn check_immutable<G: RevisionGraph + ?Sized>(
    graph: &G,
    revs: impl IntoIterator<Item = RevId>,
) -> Result<()> {
    for rev in revs {
        if graph.is_immutable(rev)? {
            return Err(Error::ImmutableRevision(rev));
        }
    }
    Ok(())
}

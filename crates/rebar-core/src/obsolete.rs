//! Obsolescence markers and the resolver that decides which obsolete
//! revisions in a rebase set can be skipped.
//!
//! An obsolete revision is handled one of three ways:
//!
//! - it has no live successor, or one already reachable from its
//!   destination: skip it, recording where it landed
//!   ([`ObsoleteResolution::successor_in_destination`]);
//! - its successor is itself being rebased, or it is extinct: skip it and
//!   its descendants, since rewriting it would diverge
//!   ([`ObsoleteResolution::successor_in_rebase_set`]);
//! - anything else is a divergence error unless divergence is allowed.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rebar_git::{RevId, RevisionGraph};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::plan::DestMap;
use crate::state::StateMap;
use crate::traits::ObsoleteStore;

/// Records that `predecessor` was rewritten into `successors`. No successors
/// means it was pruned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub predecessor: RevId,
    #[serde(default)]
    pub successors: Vec<RevId>,
    pub date: DateTime<Utc>,
    /// Command that created the marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl Marker {
    /// Create a marker dated now.
    #[must_use]
    pub fn new(predecessor: RevId, successors: Vec<RevId>) -> Self {
        Self {
            predecessor,
            successors,
            date: Utc::now(),
            operation: None,
        }
    }

    /// Tag the marker with the command that produced it.
    #[must_use]
    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }
}

/// Where the obsolete members of a rebase set went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObsoleteResolution {
    /// Obsolete sources to skip, with the successor found in the destination
    /// (or `None` when they have no live successor).
    pub successor_in_destination: BTreeMap<RevId, Option<RevId>>,
    /// Obsolete sources whose rewrite would create divergence.
    pub successor_in_rebase_set: BTreeSet<RevId>,
}

impl ObsoleteResolution {
    /// Classify the obsolete sources of `destinations`.
    ///
    /// # Errors
    /// Returns error if a graph or marker query fails.
    #[instrument(skip_all, fields(sources = destinations.len()))]
    pub fn compute<G, O>(graph: &G, store: &O, destinations: &DestMap) -> Result<Self>
    where
        G: RevisionGraph,
        O: ObsoleteStore + ?Sized,
    {
        let mut resolution = Self::default();

        for (&rev, &dest) in destinations {
            if !store.is_obsolete(rev)? {
                continue;
            }

            let successors: BTreeSet<RevId> = store
                .all_successors(rev)?
                .into_iter()
                .filter(|succ| graph.exists(*succ))
                .collect();

            let mut all_extinct = true;
            for succ in &successors {
                if !is_extinct(graph, store, *succ)? {
                    all_extinct = false;
                    break;
                }
            }
            if successors.is_empty() || all_extinct {
                debug!(rev = %rev.short(), "obsolete without live successor");
                resolution.successor_in_destination.insert(rev, None);
                continue;
            }

            let mut landed = None;
            for succ in &successors {
                if graph.is_ancestor(*succ, dest)? {
                    landed = Some(*succ);
                    break;
                }
            }
            if let Some(succ) = landed {
                debug!(rev = %rev.short(), successor = %succ.short(), "already in destination");
                resolution.successor_in_destination.insert(rev, Some(succ));
                continue;
            }

            if successors.iter().any(|succ| destinations.contains_key(succ))
                || is_extinct(graph, store, rev)?
            {
                debug!(rev = %rev.short(), "successor in rebase set");
                resolution.successor_in_rebase_set.insert(rev);
            }
        }

        Ok(resolution)
    }

    /// Obsolete sources this resolution does not account for.
    ///
    /// # Errors
    /// Returns error if a marker query fails.
    pub fn divergent<O: ObsoleteStore + ?Sized>(
        &self,
        store: &O,
        destinations: &DestMap,
    ) -> Result<Vec<RevId>> {
        let mut divergent = vec![];
        for &rev in destinations.keys() {
            if store.is_obsolete(rev)?
                && !self.successor_in_destination.contains_key(&rev)
                && !self.successor_in_rebase_set.contains(&rev)
            {
                divergent.push(rev);
            }
        }
        Ok(divergent)
    }

    /// Whether `rev` is skipped because of obsolescence.
    #[must_use]
    pub fn skips(&self, rev: RevId) -> bool {
        self.successor_in_destination.contains_key(&rev)
            || self.successor_in_rebase_set.contains(&rev)
    }
}

/// Compute the resolution for a rebase, enforce the divergence policy and
/// drop descendants of divergence-unsafe revisions from the operation.
///
/// # Errors
/// Returns `Divergence` for obsolete sources whose successors are neither
/// in the destination nor in the rebase set, unless divergence is allowed.
pub fn handle_skipping_obsolete<G, O>(
    graph: &G,
    store: &O,
    destinations: &mut DestMap,
    state: &mut StateMap,
    allow_divergence: bool,
) -> Result<ObsoleteResolution>
where
    G: RevisionGraph,
    O: ObsoleteStore + ?Sized,
{
    let mut resolution = ObsoleteResolution::compute(graph, store, destinations)?;

    if allow_divergence {
        resolution.successor_in_rebase_set.clear();
        return Ok(resolution);
    }

    let divergent = resolution.divergent(store, destinations)?;
    if !divergent.is_empty() {
        return Err(Error::Divergence(divergent));
    }

    let unsafe_revs: Vec<RevId> = resolution.successor_in_rebase_set.iter().copied().collect();
    if !unsafe_revs.is_empty() {
        for rev in graph.descendants(&unsafe_revs)? {
            if resolution.successor_in_rebase_set.contains(&rev) {
                continue;
            }
            if destinations.remove(&rev).is_some() {
                debug!(rev = %rev.short(), "dropping descendant of divergent revision");
            }
            state.remove(&rev);
        }
    }

    Ok(resolution)
}

/// Obsolete, and so are all of its descendants.
fn is_extinct<G, O>(graph: &G, store: &O, rev: RevId) -> Result<bool>
where
    G: RevisionGraph,
    O: ObsoleteStore + ?Sized,
{
    if !store.is_obsolete(rev)? {
        return Ok(false);
    }
    for desc in graph.descendants(&[rev])? {
        if !store.is_obsolete(desc)? {
            return Ok(false);
        }
    }
    Ok(true)
}

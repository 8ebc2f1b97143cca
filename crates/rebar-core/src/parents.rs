//! New parents and merge base for each rebased revision.
//!
//! The requested destination cannot always be used directly because earlier
//! results change where a revision should land:
//!
//! ```text
//!       D E    rebase -r C+D+E -d B
//!       |/     C is rebased to C'
//!     B C      D's new destination is C' instead of B
//!     |/       E's new destination is C' instead of B
//!     A
//! ```

use std::collections::{BTreeMap, BTreeSet};

use rebar_git::{RevId, RevisionGraph};
use tracing::debug;

use crate::error::{Error, Result};
use crate::obsolete::ObsoleteResolution;
use crate::plan::DestMap;
use crate::schedule::latest;
use crate::state::{RevState, StateMap};
use crate::traits::ObsoleteStore;

/// Where a revision will be recreated, and what to merge it against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewParents {
    pub p1: RevId,
    pub p2: Option<RevId>,
    /// Merge base; `None` merges against the empty tree.
    pub base: Option<RevId>,
}

impl NewParents {
    /// Parents in commit order.
    #[must_use]
    pub fn to_vec(self) -> Vec<RevId> {
        std::iter::once(self.p1).chain(self.p2).collect()
    }
}

/// Computes parents against a snapshot of the operation's progress.
pub struct ParentResolver<'a, G: RevisionGraph + ?Sized, O: ObsoleteStore + ?Sized> {
    graph: &'a G,
    obsolete: &'a O,
    destinations: &'a DestMap,
    state: &'a StateMap,
    skipped: &'a BTreeSet<RevId>,
    successor_in_destination: &'a BTreeMap<RevId, Option<RevId>>,
}

impl<'a, G: RevisionGraph + ?Sized, O: ObsoleteStore + ?Sized> ParentResolver<'a, G, O> {
    /// Create a resolver over the current progress.
    #[must_use]
    pub const fn new(
        graph: &'a G,
        obsolete: &'a O,
        destinations: &'a DestMap,
        state: &'a StateMap,
        skipped: &'a BTreeSet<RevId>,
        resolution: &'a ObsoleteResolution,
    ) -> Self {
        Self {
            graph,
            obsolete,
            destinations,
            state,
            skipped,
            successor_in_destination: &resolution.successor_in_destination,
        }
    }

    fn destination(&self, rev: RevId) -> Result<RevId> {
        self.destinations.get(&rev).copied().ok_or_else(|| {
            Error::InconsistentState(format!("{} has no destination", rev.short()))
        })
    }

    /// Destination of each parent slot of `rev`.
    ///
    /// A slot whose parent descends from an already rebased source with the
    /// same destination follows that source's new position. Otherwise it uses
    /// the destination, itself resolved through the state when the
    /// destination is part of this operation.
    ///
    /// # Errors
    /// Returns `PendingDestination` if the destination has not been rebased
    /// yet, which the scheduler should have prevented.
    pub fn adjust_destination(&self, rev: RevId) -> Result<[RevId; 2]> {
        let dest = self.destination(rev)?;
        let sources: Vec<RevId> = self
            .state
            .iter()
            .filter(|(source, state)| {
                matches!(state, RevState::Rebased(_))
                    && self.destinations.get(source) == Some(&dest)
                    && !self.skipped.contains(source)
            })
            .map(|(source, _)| *source)
            .collect();

        let mut result = [dest; 2];
        for (slot, parent) in self.graph.parents(rev)?.slots().into_iter().enumerate() {
            let mut adjusted = dest;
            if let Some(parent) = parent {
                let mut candidates = vec![];
                for &source in &sources {
                    if self.graph.is_ancestor(source, parent)? {
                        candidates.push(source);
                    }
                }
                if let Some(new) = latest(self.graph, candidates)?
                    .and_then(|candidate| self.state.get(&candidate))
                    .and_then(|state| state.rebased())
                {
                    adjusted = new;
                }
            }

            if adjusted == dest {
                match self.state.get(&dest) {
                    Some(RevState::Rebased(new)) => adjusted = *new,
                    Some(RevState::Pending) => {
                        return Err(Error::PendingDestination {
                            rev: dest,
                            dependent: rev,
                        });
                    }
                    Some(RevState::Ignored) | None => {}
                }
            }
            result[slot] = adjusted;
        }
        Ok(result)
    }

    /// Whether `parent`, or one of its live successors, is an ancestor of
    /// `dest`.
    fn moves_to(&self, parent: RevId, dest: RevId) -> Result<bool> {
        if self.graph.is_ancestor(parent, dest)? {
            return Ok(true);
        }
        for successor in self.obsolete.all_successors(parent)? {
            if self.graph.exists(successor) && self.graph.is_ancestor(successor, dest)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// New parents and merge base of `rev`.
    ///
    /// A merge only moves a parent when that parent (or a successor) is an
    /// ancestor of its destination, or when the parent was itself rebased;
    /// moving both unconditionally would make the merge lose a parent.
    ///
    /// # Errors
    /// Returns an input error if the merge cannot move, if a new parent
    /// descends from `rev`, or if every merge base would pull in unrelated
    /// changes.
    pub fn define_parents(&self, rev: RevId) -> Result<NewParents> {
        let dest = self.destination(rev)?;
        let old = self.graph.parents(rev)?;
        let old_slots = old.slots();
        let dests = self.adjust_destination(rev)?;

        let mut new: [Option<RevId>; 2] = [None, None];
        let mut bases = old_slots;

        if old.is_merge() {
            for i in 0..2 {
                let Some(parent) = old_slots[i] else {
                    continue;
                };
                let mut candidate = if self.moves_to(parent, dests[i])? {
                    Some(dests[i])
                } else if let Some(RevState::Rebased(moved)) = self.state.get(&parent) {
                    Some(*moved)
                } else {
                    Some(parent)
                };

                // If one parent becomes an ancestor of the other, drop the
                // ancestor.
                for j in 0..i {
                    let (Some(other), Some(np)) = (new[j], candidate) else {
                        continue;
                    };
                    if self.graph.is_ancestor(np, other)? {
                        candidate = None;
                    } else if self.graph.is_ancestor(other, np)? {
                        new[j] = Some(np);
                        candidate = None;
                        // Old parents need not share the relationship, so
                        // keep both bases and just swap them.
                        bases.swap(i, j);
                    }
                }
                new[i] = candidate;
            }

            // The merge runs against the old p1; if only p2 moved, swap so the
            // unchanged side is not used as the base.
            if new[1].is_some() && old_slots[0] == new[0] {
                new.reverse();
                bases.reverse();
            }

            let old_set: BTreeSet<Option<RevId>> = old_slots.into_iter().collect();
            let new_set: BTreeSet<Option<RevId>> = new.into_iter().collect();
            if old_set == new_set && !new.contains(&Some(dest)) {
                return Err(Error::UnmovedParents(rev));
            }
        } else {
            new[0] = Some(dests[0]);
        }

        for parent in new.iter().flatten() {
            if self.graph.is_ancestor(rev, *parent)? {
                return Err(Error::SourceIsAncestor);
            }
        }

        self.choose_merge_base(rev, dest, &mut new, &mut bases)?;

        let p1 = new[0].ok_or_else(|| {
            Error::InconsistentState(format!("{} lost its first parent", rev.short()))
        })?;
        debug!(
            rev = %rev.short(),
            p1 = %p1.short(),
            p2 = ?new[1],
            base = ?bases[0],
            "future parents"
        );
        Ok(NewParents {
            p1,
            p2: new[1],
            base: bases[0],
        })
    }

    /// With several usable merge bases, pick the one whose side branch brings
    /// in the fewest revisions that are not being rebased.
    ///
    /// ```text
    ///      F
    ///     /|
    ///    D E  # "rebase -r D+E+F -d Z": with D as base, F's diff includes
    ///    | |  # C; with E as base it includes B.
    ///    B C
    ///    |/
    ///    A Z
    /// ```
    fn choose_merge_base(
        &self,
        rev: RevId,
        dest: RevId,
        new: &mut [Option<RevId>; 2],
        bases: &mut [Option<RevId>; 2],
    ) -> Result<()> {
        let usable: BTreeSet<RevId> = bases
            .iter()
            .flatten()
            .filter(|base| !new.contains(&Some(**base)))
            .copied()
            .collect();
        if usable.len() <= 1 {
            return Ok(());
        }

        let rebase_set: BTreeSet<RevId> = self
            .state
            .iter()
            .filter(|(source, state)| {
                matches!(state, RevState::Rebased(_))
                    && !self.successor_in_destination.contains_key(source)
            })
            .map(|(source, _)| *source)
            .collect();
        let mut merges = vec![];
        for &source in &rebase_set {
            if self.graph.parents(source)?.is_merge() {
                merges.push(source);
            }
        }
        let covered = self.graph.ancestors(&merges)?;

        let mut unwanted: [Option<Vec<RevId>>; 2] = [None, None];
        for i in 0..2 {
            let Some(base) = bases[i] else {
                continue;
            };
            if new.contains(&Some(base)) {
                continue;
            }
            let others: Vec<RevId> = bases
                .iter()
                .flatten()
                .filter(|other| **other != base)
                .copied()
                .collect();
            let side = self.graph.only(&others, &[base, dest])?;
            unwanted[i] = Some(
                side.into_iter()
                    .filter(|r| !covered.contains(r) && !rebase_set.contains(r))
                    .collect(),
            );
        }

        let best = unwanted
            .iter()
            .enumerate()
            .filter_map(|(i, revs)| revs.as_ref().map(|revs| (revs.len(), i)))
            .min();
        if let Some((count, i)) = best {
            if count > 0 {
                return Err(Error::UnwantedMergeBase {
                    rev,
                    unwanted: unwanted[i].take().unwrap_or_default(),
                });
            }
            if i != 0 {
                if new[i].is_some() {
                    new.swap(0, i);
                }
                bases.swap(0, i);
            }
        }
        Ok(())
    }
}

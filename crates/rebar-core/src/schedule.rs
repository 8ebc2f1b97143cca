//! Ordering of rebase sources.

use std::collections::{BTreeMap, BTreeSet};

use rebar_git::{RevId, RevisionGraph};
use tracing::debug;

use crate::error::{Error, Result};
use crate::plan::DestMap;

/// Split the sources of `destinations` into batches. Every batch only holds
/// sources whose destination is not a source of this or a later batch, so
/// destinations are always rebased before the revisions moving onto them.
///
/// # Errors
/// Returns `Cycle` if the remaining sources all wait on each other.
pub fn sort_sources(destinations: &DestMap) -> Result<Vec<Vec<RevId>>> {
    let mut pending: BTreeSet<RevId> = destinations.keys().copied().collect();
    let mut batches = vec![];

    while !pending.is_empty() {
        let batch: Vec<RevId> = pending
            .iter()
            .copied()
            .filter(|rev| {
                destinations
                    .get(rev)
                    .is_none_or(|dest| !pending.contains(dest))
            })
            .collect();
        if batch.is_empty() {
            return Err(Error::Cycle);
        }
        for rev in &batch {
            pending.remove(rev);
        }
        batches.push(batch);
    }

    debug!(batches = batches.len(), "sorted sources");
    Ok(batches)
}

/// Order `revs` so ancestors come before descendants, breaking ties by id.
///
/// # Errors
/// Returns error if a parent lookup fails.
pub fn sort_topological<G: RevisionGraph + ?Sized>(graph: &G, revs: &[RevId]) -> Result<Vec<RevId>> {
    let members: BTreeSet<RevId> = revs.iter().copied().collect();

    let mut waiting_on: BTreeMap<RevId, usize> = BTreeMap::new();
    let mut children: BTreeMap<RevId, Vec<RevId>> = BTreeMap::new();
    for &rev in &members {
        let in_set: Vec<RevId> = graph
            .parents(rev)?
            .iter()
            .filter(|p| members.contains(p) && *p != rev)
            .collect();
        waiting_on.insert(rev, in_set.len());
        for parent in in_set {
            children.entry(parent).or_default().push(rev);
        }
    }

    let mut ready: BTreeSet<RevId> = waiting_on
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(rev, _)| *rev)
        .collect();
    let mut sorted = Vec::with_capacity(members.len());

    while let Some(rev) = ready.pop_first() {
        sorted.push(rev);
        for child in children.get(&rev).into_iter().flatten() {
            if let Some(count) = waiting_on.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*child);
                }
            }
        }
    }

    Ok(sorted)
}

/// The topologically latest of `candidates`.
///
/// Among unrelated candidates the first one wins.
///
/// # Errors
/// Returns error if an ancestry query fails.
pub fn latest<G: RevisionGraph + ?Sized>(
    graph: &G,
    candidates: impl IntoIterator<Item = RevId>,
) -> Result<Option<RevId>> {
    let mut best: Option<RevId> = None;
    for candidate in candidates {
        best = match best {
            Some(current) if !graph.is_ancestor(current, candidate)? => Some(current),
            _ => Some(candidate),
        };
    }
    Ok(best)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_mocks::MockRepo;

    #[test]
    fn test_cycle_is_rejected() {
        let repo = MockRepo::new();
        let a = repo.commit("A", &[], &[("a", "1")]);
        let b = repo.commit("B", &[], &[("b", "1")]);

        let destinations = DestMap::from([(a, b), (b, a)]);
        assert!(matches!(sort_sources(&destinations), Err(Error::Cycle)));
    }

    #[test]
    fn test_destinations_inside_the_set_come_first() {
        let repo = MockRepo::new();
        let a = repo.commit("A", &[], &[("a", "1")]);
        let b = repo.commit("B", &[a], &[("b", "1")]);
        let x = repo.commit("X", &[a], &[("x", "1")]);
        let d = repo.commit("D", &[], &[("d", "1")]);

        // X moves onto B, which itself moves onto D.
        let destinations = DestMap::from([(b, d), (x, b)]);
        let batches = sort_sources(&destinations).unwrap();
        assert_eq!(batches, vec![vec![b], vec![x]]);
    }

    #[test]
    fn test_topological_order_within_batch() {
        let repo = MockRepo::new();
        let a = repo.commit("A", &[], &[("a", "1")]);
        let b = repo.commit("B", &[a], &[("b", "1")]);
        let c = repo.commit("C", &[b], &[("c", "1")]);
        let m = repo.commit("M", &[c, a], &[("m", "1")]);

        let sorted = sort_topological(&repo, &[m, c, b]).unwrap();
        assert_eq!(sorted, vec![b, c, m]);
    }

    #[test]
    fn test_latest_prefers_descendant() {
        let repo = MockRepo::new();
        let a = repo.commit("A", &[], &[("a", "1")]);
        let b = repo.commit("B", &[a], &[("b", "1")]);

        assert_eq!(latest(&repo, [b, a]).unwrap(), Some(b));
        assert_eq!(latest(&repo, [a, b]).unwrap(), Some(b));
        assert_eq!(latest(&repo, []).unwrap(), None);
    }
}

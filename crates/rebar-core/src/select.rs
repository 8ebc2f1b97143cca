//! Turning a user selection into a destination map.

use std::collections::BTreeSet;

use rebar_git::{RevId, RevisionGraph};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::plan::{DestMap, NothingToRebase};

/// Which revisions to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Exactly these revisions.
    Revisions(Vec<RevId>),
    /// These revisions and all their descendants.
    Sources(Vec<RevId>),
    /// The whole branch containing each base, relative to the destination.
    /// `explicit` is false when the base defaulted to the working position.
    Bases { revs: Vec<RevId>, explicit: bool },
}

/// Result of resolving a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selected {
    Rebase(DestMap),
    Nothing(NothingToRebase),
}

/// Resolve `selection` into sources that all move onto `dest`.
///
/// # Errors
/// Returns error if a graph query fails.
#[instrument(skip(graph))]
pub fn destination_map<G: RevisionGraph + ?Sized>(
    graph: &G,
    selection: &Selection,
    dest: RevId,
) -> Result<Selected> {
    let revs: BTreeSet<RevId> = match selection {
        Selection::Revisions(revs) => {
            if revs.is_empty() {
                return Ok(Selected::Nothing(NothingToRebase::EmptySelection {
                    option: "rev",
                }));
            }
            revs.iter().copied().collect()
        }
        Selection::Sources(sources) => {
            if sources.is_empty() {
                return Ok(Selected::Nothing(NothingToRebase::EmptySelection {
                    option: "source",
                }));
            }
            graph.descendants(sources)?
        }
        Selection::Bases { revs, explicit } => {
            if revs.is_empty() {
                return Ok(Selected::Nothing(NothingToRebase::EmptySelection {
                    option: "base",
                }));
            }
            let set = branch_of(graph, revs, dest)?;
            if set.is_empty() {
                return Ok(Selected::Nothing(nothing_for_bases(
                    graph, revs, dest, *explicit,
                )?));
            }
            set
        }
    };

    debug!(count = revs.len(), dest = %dest.short(), "selected revisions");
    Ok(Selected::Rebase(revs.into_iter().map(|rev| (rev, dest)).collect()))
}

/// Descendants of the children of each base's branching point with `dest`
/// that lead to the base.
fn branch_of<G: RevisionGraph + ?Sized>(
    graph: &G,
    bases: &[RevId],
    dest: RevId,
) -> Result<BTreeSet<RevId>> {
    let mut by_branch_point: Vec<(RevId, Vec<RevId>)> = vec![];
    for &base in bases {
        let Some(point) = graph.common_ancestor(base, dest)? else {
            // Unrelated histories; there is no branch to move.
            return Ok(BTreeSet::new());
        };
        match by_branch_point.iter_mut().find(|(p, _)| *p == point) {
            Some((_, group)) => group.push(base),
            None => by_branch_point.push((point, vec![base])),
        }
    }

    let mut roots = vec![];
    for (point, group) in &by_branch_point {
        for rev in graph.ancestors(group)? {
            if rev != *point && graph.parents(rev)?.contains(*point) {
                roots.push(rev);
            }
        }
    }
    if roots.is_empty() {
        return Ok(BTreeSet::new());
    }
    Ok(graph.descendants(&roots)?)
}

fn nothing_for_bases<G: RevisionGraph + ?Sized>(
    graph: &G,
    bases: &[RevId],
    dest: RevId,
    explicit: bool,
) -> Result<NothingToRebase> {
    if bases == [dest] {
        return Ok(NothingToRebase::BaseIsDestination {
            base: dest,
            explicit,
        });
    }

    let mut all_behind = true;
    for &base in bases {
        if !graph.is_ancestor(base, dest)? {
            all_behind = false;
            break;
        }
    }
    Ok(if all_behind {
        NothingToRebase::BaseIsAncestor {
            base: bases.to_vec(),
            dest,
            explicit,
        }
    } else {
        NothingToRebase::NoBranch {
            base: bases.to_vec(),
            dest,
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_mocks::MockRepo;

    /// A - B - C on one side, A - D on the other.
    fn graph() -> (MockRepo, [RevId; 4]) {
        let repo = MockRepo::new();
        let a = repo.commit("A", &[], &[("a", "1")]);
        let b = repo.commit("B", &[a], &[("b", "1")]);
        let c = repo.commit("C", &[b], &[("c", "1")]);
        let d = repo.commit("D", &[a], &[("d", "1")]);
        (repo, [a, b, c, d])
    }

    fn rebase(selected: Selected) -> DestMap {
        match selected {
            Selected::Rebase(map) => map,
            Selected::Nothing(reason) => panic!("expected revisions, got: {reason}"),
        }
    }

    #[test]
    fn test_exact_revisions() {
        let (repo, [_, b, _, d]) = graph();
        let map = rebase(destination_map(&repo, &Selection::Revisions(vec![b]), d).unwrap());
        assert_eq!(map, DestMap::from([(b, d)]));
    }

    #[test]
    fn test_sources_include_descendants() {
        let (repo, [_, b, c, d]) = graph();
        let map = rebase(destination_map(&repo, &Selection::Sources(vec![b]), d).unwrap());
        assert_eq!(map, DestMap::from([(b, d), (c, d)]));
    }

    #[test]
    fn test_base_selects_whole_branch() {
        let (repo, [_, b, c, d]) = graph();
        let selection = Selection::Bases {
            revs: vec![c],
            explicit: false,
        };
        let map = rebase(destination_map(&repo, &selection, d).unwrap());
        assert_eq!(map, DestMap::from([(b, d), (c, d)]));
    }

    #[test]
    fn test_empty_selection() {
        let (repo, [.., d]) = graph();
        let selected = destination_map(&repo, &Selection::Sources(vec![]), d).unwrap();
        assert_eq!(
            selected,
            Selected::Nothing(NothingToRebase::EmptySelection { option: "source" })
        );
        assert_eq!(
            selected_message(&selected),
            "empty \"source\" revision set - nothing to rebase"
        );
    }

    #[test]
    fn test_base_is_destination() {
        let (repo, [.., d]) = graph();
        let selection = Selection::Bases {
            revs: vec![d],
            explicit: false,
        };
        let selected = destination_map(&repo, &selection, d).unwrap();
        assert_eq!(
            selected_message(&selected),
            "nothing to rebase - working directory parent is also destination"
        );
    }

    #[test]
    fn test_base_already_behind_destination() {
        let (repo, [a, .., d]) = graph();
        let selection = Selection::Bases {
            revs: vec![a],
            explicit: true,
        };
        let selected = destination_map(&repo, &selection, d).unwrap();
        assert_eq!(
            selected,
            Selected::Nothing(NothingToRebase::BaseIsAncestor {
                base: vec![a],
                dest: d,
                explicit: true,
            })
        );
    }

    #[test]
    fn test_unrelated_base_has_no_branch() {
        let (repo, [.., d]) = graph();
        let x = repo.commit("X", &[], &[("x", "1")]);
        let selection = Selection::Bases {
            revs: vec![x],
            explicit: true,
        };
        let selected = destination_map(&repo, &selection, d).unwrap();
        assert!(matches!(
            selected,
            Selected::Nothing(NothingToRebase::NoBranch { .. })
        ));
    }

    fn selected_message(selected: &Selected) -> String {
        match selected {
            Selected::Nothing(reason) => reason.to_string(),
            Selected::Rebase(map) => panic!("expected nothing to rebase, got {map:?}"),
        }
    }
}

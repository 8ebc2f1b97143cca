//! Wrapping up a finished rebase: collapse messages, hash references in
//! descriptions, ref moves and replacement markers.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use rebar_git::{RevId, Revision, RevisionGraph, WorkingCopy};
use regex::Regex;
use tracing::debug;

use crate::error::Result;
use crate::obsolete::Marker;
use crate::state::{OperationRecord, RevState};
use crate::traits::ObsoleteStore;

#[allow(clippy::unwrap_used)]
static HASH_REF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[0-9a-f]{12,40}\b").unwrap());

/// Marker operation name for rebase rewrites.
const OPERATION: &str = "rebase";

/// Rewrite abbreviated or full hashes of rewritten revisions in `message`
/// to the new revision's hash, keeping the abbreviation length.
///
/// Hashes are resolved against the whole graph, so a prefix that is
/// ambiguous in the repository is left alone.
///
/// # Errors
/// Returns an error if the graph lookup fails.
pub fn update_hash_refs<G: RevisionGraph + ?Sized>(
    graph: &G,
    message: &str,
    rewrites: &BTreeMap<RevId, RevId>,
) -> Result<String> {
    if rewrites.is_empty() {
        return Ok(message.to_string());
    }

    let mut updated = String::with_capacity(message.len());
    let mut copied = 0;
    for found in HASH_REF.find_iter(message) {
        let prefix = found.as_str();
        let Some(old) = graph.resolve_prefix(prefix)? else {
            continue;
        };
        let Some(new) = rewrites.get(&old) else {
            continue;
        };
        let mut hex = new.to_string();
        hex.truncate(prefix.len());
        debug!(old = %old.short(), new = %new.short(), "updating hash reference");
        updated.push_str(&message[copied..found.start()]);
        updated.push_str(&hex);
        copied = found.end();
    }
    updated.push_str(&message[copied..]);
    Ok(updated)
}

/// Description of a collapsed revision built from its members.
#[must_use]
pub fn collapsed_description(members: &[Revision]) -> String {
    let mut message = String::from("Collapsed revision");
    for member in members {
        message.push_str("\n* ");
        message.push_str(&member.description);
    }
    message
}

/// Ref moves and markers produced by a finished rebase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cleanup {
    /// Old revision to where its refs should go.
    pub moves: BTreeMap<RevId, RevId>,
    /// Replacement markers to record.
    pub markers: Vec<Marker>,
}

/// Work out how rewritten revisions are replaced.
///
/// Skipped revisions are pruned unless they are already obsolete. Under
/// collapse every member is replaced by the collapsed revision. With `keep`
/// no markers are written but refs still move.
///
/// # Errors
/// Returns error if a marker query fails.
pub fn plan_cleanup<O: ObsoleteStore + ?Sized>(
    store: &O,
    record: &OperationRecord,
    collapsed_into: Option<RevId>,
) -> Result<Cleanup> {
    let mut cleanup = Cleanup::default();

    for (&rev, state) in &record.state {
        let RevState::Rebased(new) = *state else {
            continue;
        };
        if new == rev {
            continue;
        }

        let target = collapsed_into.unwrap_or(new);
        cleanup.moves.insert(rev, target);

        let successors = if record.skipped.contains(&rev) {
            if store.is_obsolete(rev)? {
                continue;
            }
            vec![]
        } else {
            vec![target]
        };
        cleanup
            .markers
            .push(Marker::new(rev, successors).with_operation(OPERATION));
    }

    if record.keep {
        cleanup.markers.clear();
    }
    Ok(cleanup)
}

/// Move refs and record markers. Returns the refs that moved.
///
/// # Errors
/// Returns error if a ref cannot be moved or markers cannot be written.
pub fn apply_cleanup<W, O>(repo: &W, store: &O, cleanup: &Cleanup) -> Result<Vec<(String, RevId)>>
where
    W: WorkingCopy + ?Sized,
    O: ObsoleteStore + ?Sized,
{
    // Collect first so a ref moved onto another old revision is not moved
    // twice.
    let mut moved = vec![];
    for (&old, &new) in &cleanup.moves {
        for name in repo.refs_at(old)? {
            moved.push((name, new));
        }
    }
    for (name, new) in &moved {
        debug!(name = %name, new = %new.short(), "moving ref");
        repo.move_ref(name, *new)?;
    }

    store.add_markers(&cleanup.markers)?;
    Ok(moved)
}

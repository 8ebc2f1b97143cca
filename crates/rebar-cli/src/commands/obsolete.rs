//! `rebar obsolete` command - Record that a revision was rewritten or pruned.

use anyhow::{Context, Result, bail};
use rebar_core::{Marker, ObsoleteStore};

use super::utils;
use crate::output;

/// Run the obsolete command.
pub fn run(rev: &str, successors: &[String]) -> Result<i32> {
    let (repo, store) = utils::open_repo_and_store()?;

    let predecessor = repo
        .resolve(rev)
        .with_context(|| format!("Unknown revision: {rev}"))?;
    let successors = utils::resolve_revs(&repo, successors)?;
    if successors.contains(&predecessor) {
        bail!("{} cannot succeed itself", predecessor.short());
    }

    let marker = Marker::new(predecessor, successors.clone()).with_operation("obsolete");
    store.add_markers(&[marker])?;

    if successors.is_empty() {
        output::success(&format!("Marked {} as pruned", predecessor.short()));
    } else {
        let names: Vec<String> = successors.iter().map(|s| s.short()).collect();
        output::success(&format!(
            "Marked {} as replaced by {}",
            predecessor.short(),
            names.join(", ")
        ));
    }

    Ok(0)
}

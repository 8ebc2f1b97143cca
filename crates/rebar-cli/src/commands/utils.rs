use anyhow::{Context, Result};
use rebar_core::Store;
use rebar_git::{RevId, RevisionGraph, Repository};

/// Helper to open repo and store.
pub fn open_repo_and_store() -> Result<(Repository, Store)> {
    let repo = Repository::open_current().context("Not inside a git repository")?;
    let store = Store::new(repo.git_dir())?;
    Ok((repo, store))
}

/// Resolve revision arguments. `A..B` expands to the ancestors of `B` that
/// are not ancestors of `A`.
pub fn resolve_revs(repo: &Repository, specs: &[String]) -> Result<Vec<RevId>> {
    let mut revs = vec![];
    for spec in specs {
        match spec.split_once("..") {
            Some((from, to)) => {
                let from = repo.resolve(if from.is_empty() { "HEAD" } else { from })?;
                let to = repo.resolve(if to.is_empty() { "HEAD" } else { to })?;
                revs.extend(repo.only(&[to], &[from])?);
            }
            None => revs.push(repo.resolve(spec)?),
        }
    }
    revs.sort();
    revs.dedup();
    Ok(revs)
}


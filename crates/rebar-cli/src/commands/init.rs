//! `rebar init` command - Initialize rebar in the current repository.

use anyhow::Result;
use rebar_core::StateStore;

use super::utils;
use crate::output;

/// Run the init command.
pub fn run() -> Result<i32> {
    let (_repo, store) = utils::open_repo_and_store()?;

    if store.is_initialized() {
        output::warn("Rebar is already initialized in this repository");
        return Ok(0);
    }

    store.init()?;

    output::success("Initialized rebar in this repository");
    output::info(&format!("State stored in: {}", store.rebar_dir().display()));

    Ok(0)
}

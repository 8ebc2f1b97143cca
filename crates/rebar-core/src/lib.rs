//! # rebar-core
//!
//! Core library for Rebar, providing the rebase engine:
//!
//! - [`select`]: turn `--rev`/`--source`/`--base` into a destination map
//! - [`plan`]: validate the rebase set and compute the initial state
//! - [`schedule`]: order sources so destinations are resolved first
//! - [`obsolete`]: obsolescence markers and the skip/divergence resolver
//! - [`parents`]: new parents and merge base of each revision
//! - [`runtime`]: the merge-and-commit state machine with continue/abort
//! - [`finalize`]: collapse, ref moves and replacement markers
//! - [`state`]: `.git/rebar/` persistence and the operation lock

pub mod config;
pub mod error;
pub mod finalize;
pub mod obsolete;
pub mod parents;
pub mod plan;
pub mod runtime;
pub mod schedule;
pub mod select;
pub mod state;
pub mod traits;

#[cfg(test)]
mod test_mocks;

pub use config::{Config, RebaseConfig};
pub use error::{Error, ErrorKind, Result};
pub use obsolete::{Marker, ObsoleteResolution};
pub use plan::{DestMap, NothingToRebase};
pub use runtime::{
    NoopObserver, Note, Outcome, Phase, RebaseObserver, RebaseOptions, RebaseRuntime,
    RebaseSummary, describe,
};
pub use select::{Selected, Selection, destination_map};
pub use state::{OperationRecord, RevState, StateMap, Store, Transaction};
pub use traits::{ObsoleteStore, StateStore};

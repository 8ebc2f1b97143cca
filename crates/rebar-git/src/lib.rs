//! # rebar-git
//!
//! Collaborator layer for Rebar. Defines how the rebase engine sees the
//! revision graph and the working copy, and provides a git2-rs backed
//! implementation of both.

mod error;
mod repository;
mod rev;
mod traits;

pub use error::{Error, Result};
pub use repository::Repository;
pub use rev::RevId;
pub use traits::{
    Author, CommitRequest, Committed, MergeRequest, MergeResult, MergeStrategy, Parents,
    Revision, RevisionGraph, WorkingCopy,
};

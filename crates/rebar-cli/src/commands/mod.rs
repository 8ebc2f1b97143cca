//! Command definitions and dispatch helpers.

use clap::{ArgAction, Args, Parser, Subcommand};
use clap_complete::Shell;
use rebar_core::ErrorKind;

pub mod completions;
pub mod init;
pub mod obsolete;
pub mod rebase;
pub mod utils;

/// Nothing was rebased.
pub const EXIT_NOTHING_TO_DO: i32 = 1;
/// The request was invalid; nothing changed.
pub const EXIT_INPUT: i32 = 10;
/// The repository or operation was in the wrong state.
pub const EXIT_STATE: i32 = 20;
/// A merge stopped for conflicts that need resolving.
pub const EXIT_CONFLICT: i32 = 240;

/// Rebar - move revisions and their descendants onto a new destination.
#[derive(Debug, Parser)]
#[command(name = "rebar", version, about, long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Suppress informational output.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Initialize rebar in the current repository.
    Init,

    /// Move revisions (with descendants) to a different destination.
    Rebase(RebaseArgs),

    /// Record that a revision was rewritten or pruned.
    Obsolete {
        /// The revision that is now obsolete.
        rev: String,

        /// Revision that replaces it (repeatable). None means pruned.
        #[arg(short, long = "successor")]
        successors: Vec<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Arguments of `rebar rebase`.
#[derive(Debug, Default, Args)]
#[allow(clippy::struct_excessive_bools)]
pub struct RebaseArgs {
    /// Rebase these revisions (`A..B` selects B's ancestors not in A).
    #[arg(short, long = "rev", conflicts_with_all = ["source", "base"])]
    pub revs: Vec<String>,

    /// Rebase these revisions and their descendants.
    #[arg(short, long, conflicts_with = "base")]
    pub source: Vec<String>,

    /// Rebase everything from the branching point of the base.
    #[arg(short, long)]
    pub base: Vec<String>,

    /// Destination to rebase onto.
    #[arg(short, long)]
    pub dest: Option<String>,

    /// Collapse the rebased revisions into one.
    #[arg(long)]
    pub collapse: bool,

    /// Description of the collapsed revision.
    #[arg(short, long, requires = "collapse")]
    pub message: Option<String>,

    /// Keep the original revisions.
    #[arg(short, long)]
    pub keep: bool,

    /// Date for the new revisions (RFC 3339).
    #[arg(long)]
    pub date: Option<String>,

    /// Merge in memory and only touch the working copy on conflicts.
    #[arg(long)]
    pub in_memory: bool,

    /// Keep revisions whose changes are already in the destination.
    #[arg(long)]
    pub allow_empty: bool,

    /// Continue an interrupted rebase.
    #[arg(long = "continue", conflicts_with = "abort")]
    pub continue_: bool,

    /// Abort an interrupted rebase.
    #[arg(long)]
    pub abort: bool,

    /// Output the result as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Exit code for a failed command.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    if let Some(error) = error.downcast_ref::<rebar_core::Error>() {
        return match error.kind() {
            ErrorKind::Input => EXIT_INPUT,
            ErrorKind::Divergence | ErrorKind::State => EXIT_STATE,
            ErrorKind::Consistency | ErrorKind::Other => 1,
        };
    }
    match error.downcast_ref::<rebar_git::Error>() {
        Some(rebar_git::Error::RevisionNotFound(_) | rebar_git::Error::RefNotFound(_)) => {
            EXIT_INPUT
        }
        Some(rebar_git::Error::NotARepository) => EXIT_STATE,
        _ => 1,
    }
}

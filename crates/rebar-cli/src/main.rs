//! Rebar CLI - move revisions and their descendants onto a new destination.

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

mod commands;
mod output;

use commands::{Cli, Commands};

/// Log to stderr, at `warn` unless `RUST_LOG` or `--verbose` says otherwise.
fn install_tracing(verbose: u8) {
    let default = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    install_tracing(cli.verbose);
    output::set_quiet(cli.quiet);

    let result = match cli.command {
        Commands::Init => commands::init::run(),
        Commands::Rebase(args) => commands::rebase::run(&args),
        Commands::Obsolete { rev, successors } => commands::obsolete::run(&rev, &successors),
        Commands::Completions { shell } => commands::completions::run(shell),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            output::error(&format!("{e:#}"));
            std::process::exit(commands::exit_code(&e));
        }
    }
}

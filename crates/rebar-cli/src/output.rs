//! Terminal output formatting utilities.

use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rebar_core::{Note, RebaseObserver, describe};
use rebar_git::{RevId, Revision};

static QUIET_MODE: AtomicBool = AtomicBool::new(false);

/// Set quiet mode globally. Call once at startup.
pub fn set_quiet(quiet: bool) {
    QUIET_MODE.store(quiet, Ordering::Relaxed);
}

fn is_quiet() -> bool {
    QUIET_MODE.load(Ordering::Relaxed)
}

/// Print a success message (suppressed in quiet mode).
pub fn success(msg: &str) {
    if !is_quiet() {
        println!("{} {}", "✓".green(), msg);
    }
}

/// Print an error message (always prints to stderr).
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a warning message (always prints to stderr).
pub fn warn(msg: &str) {
    eprintln!("{} {}", "!".yellow(), msg);
}

/// Print an info message (suppressed in quiet mode).
pub fn info(msg: &str) {
    if !is_quiet() {
        println!("{} {}", "→".blue(), msg);
    }
}

/// Print a detail line without prefix (suppressed in quiet mode).
///
/// Use for indented detail lines that accompany info or warn messages.
pub fn detail(msg: &str) {
    if !is_quiet() {
        println!("{msg}");
    }
}

/// Print essential machine-readable output (always prints).
pub fn essential(msg: &str) {
    println!("{msg}");
}

/// Colored short id of a revision.
#[must_use]
pub fn rev_id(rev: RevId) -> String {
    rev.short().yellow().to_string()
}

/// Old and new revision on one line.
#[must_use]
pub fn rewrite_line(old: RevId, new: RevId) -> String {
    format!("  {} → {}", rev_id(old), rev_id(new))
}

/// Whether a note reports something the user should look at.
const fn is_warning(note: &Note) -> bool {
    !matches!(note, Note::Rebased { .. } | Note::AlreadyRebased { .. })
}

/// Progress bar and status lines for a running rebase.
///
/// Hidden in quiet mode; indicatif also hides it when stderr is not a
/// terminal.
pub struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    #[must_use]
    pub fn new() -> Self {
        let bar = if is_quiet() {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        let style = ProgressStyle::default_bar()
            .template("{spinner} rebasing {wide_msg} {bar:20} {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }
}

impl Default for ProgressObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl RebaseObserver for ProgressObserver {
    fn started(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn rebasing(&self, revision: &Revision) {
        self.bar.set_message(describe(revision));
        self.bar.inc(1);
    }

    fn note(&self, note: &Note) {
        let text = note.to_string();
        self.bar.suspend(|| {
            if is_warning(note) {
                warn(&text);
            } else {
                info(&text);
            }
        });
    }

    fn finished(&self) {
        self.bar.finish_and_clear();
    }
}

impl Drop for ProgressObserver {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}

//! `rebar rebase` command - Move revisions onto a new destination.

use anyhow::Result;
use chrono::DateTime;
use rebar_core::{
    NoopObserver, Outcome, RebaseConfig, RebaseObserver, RebaseOptions, RebaseRuntime,
    RebaseSummary, Selected, Selection, StateStore, destination_map,
};
use rebar_git::{RevId, Repository, WorkingCopy};
use serde::Serialize;
use tracing::debug;

use super::{EXIT_CONFLICT, EXIT_NOTHING_TO_DO, RebaseArgs, utils};
use crate::output::{self, ProgressObserver};

/// Run the rebase command.
pub fn run(args: &RebaseArgs) -> Result<i32> {
    let (repo, store) = utils::open_repo_and_store()?;
    let config = store.load_config()?;
    let options = build_options(args, &config.rebase)?;

    // The progress bar is cleared when the observer drops, before the report.
    let outcome = {
        let observer: Box<dyn RebaseObserver> = if args.json {
            Box::new(NoopObserver)
        } else {
            Box::new(ProgressObserver::new())
        };
        let mut runtime =
            RebaseRuntime::new(&repo, &store, options).with_observer(observer.as_ref());

        if args.abort {
            runtime.abort()?
        } else if args.continue_ {
            runtime.resume()?
        } else {
            if store.is_rebase_in_progress() {
                return Err(rebar_core::Error::RebaseInProgress.into());
            }
            let dest = resolve_dest(&repo, args)?;
            let selection = build_selection(&repo, args)?;
            debug!(?selection, dest = %dest.short(), "resolved selection");
            match destination_map(&repo, &selection, dest)? {
                Selected::Nothing(reason) => Outcome::NothingToDo(reason),
                Selected::Rebase(destinations) => runtime.start(destinations)?,
            }
        }
    };

    report(&outcome, args.json)
}

/// Repository defaults overridden by command-line flags.
fn build_options(args: &RebaseArgs, config: &RebaseConfig) -> Result<RebaseOptions> {
    let mut options = RebaseOptions::from_config(config);
    options.collapse = args.collapse;
    options.keep = args.keep;
    options.collapse_message.clone_from(&args.message);
    options.in_memory |= args.in_memory;
    options.allow_empty |= args.allow_empty;
    if let Some(date) = &args.date {
        let parsed = DateTime::parse_from_rfc3339(date).map_err(|e| {
            rebar_core::Error::InvalidSelection(format!("invalid date '{date}': {e}"))
        })?;
        options.date = Some(parsed);
    }
    Ok(options)
}

fn resolve_dest(repo: &Repository, args: &RebaseArgs) -> Result<RevId> {
    let Some(dest) = &args.dest else {
        return Err(rebar_core::Error::InvalidSelection(
            "no destination given\nhint: use --dest <rev>".into(),
        )
        .into());
    };
    Ok(repo.resolve(dest)?)
}

/// `--rev`, then `--source`, then `--base`; the working position when none
/// is given.
fn build_selection(repo: &Repository, args: &RebaseArgs) -> Result<Selection> {
    if !args.revs.is_empty() {
        return Ok(Selection::Revisions(utils::resolve_revs(repo, &args.revs)?));
    }
    if !args.source.is_empty() {
        return Ok(Selection::Sources(utils::resolve_revs(repo, &args.source)?));
    }
    if !args.base.is_empty() {
        return Ok(Selection::Bases {
            revs: utils::resolve_revs(repo, &args.base)?,
            explicit: true,
        });
    }
    Ok(Selection::Bases {
        revs: vec![repo.working_position()?],
        explicit: false,
    })
}

/// Print the outcome and pick the exit code.
fn report(outcome: &Outcome, json: bool) -> Result<i32> {
    if json {
        output::essential(&serde_json::to_string_pretty(&RebaseOutput::from(outcome))?);
    }

    let code = match outcome {
        Outcome::Finished(summary) => {
            if !json {
                print_summary(summary);
            }
            0
        }
        Outcome::NothingToDo(reason) => {
            if !json {
                output::info(&reason.to_string());
            }
            EXIT_NOTHING_TO_DO
        }
        Outcome::ConflictPending { rev, paths } => {
            if !json {
                output::warn(&format!("Conflicts while rebasing {}", rev.short()));
                for path in paths {
                    output::detail(&format!("  {path}"));
                }
                output::detail(
                    "Resolve the conflicts, then run `rebar rebase --continue` (or `--abort`)",
                );
            }
            EXIT_CONFLICT
        }
        Outcome::Aborted { cleaned_up } => {
            if !json {
                if *cleaned_up {
                    output::success("Rebase aborted");
                } else {
                    output::success("Rebase aborted (rebased revisions were kept)");
                }
            }
            0
        }
    };
    Ok(code)
}

fn print_summary(summary: &RebaseSummary) {
    match summary.collapsed_into {
        Some(new) => output::success(&format!(
            "Collapsed {} revisions into {}",
            summary.rebased.len(),
            output::rev_id(new)
        )),
        None => output::success(&format!("Rebased {} revisions", summary.rebased.len())),
    }
    for (old, new) in &summary.rebased {
        if old != new {
            output::detail(&output::rewrite_line(*old, *new));
        }
    }
    if !summary.skipped.is_empty() {
        output::info(&format!("Skipped {} revisions", summary.skipped.len()));
    }
    for (name, rev) in &summary.moved_refs {
        output::detail(&format!("  {name} → {}", output::rev_id(*rev)));
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum RebaseStatus {
    Finished,
    NothingToDo,
    Conflict,
    Aborted,
}

#[derive(Debug, Serialize)]
struct RebaseOutput {
    status: RebaseStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    rebased: Vec<RewriteInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    skipped: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    collapsed_into: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    moved_refs: Vec<RefInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    conflicts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct RewriteInfo {
    old: String,
    new: String,
}

#[derive(Debug, Serialize)]
struct RefInfo {
    name: String,
    target: String,
}

impl RebaseOutput {
    const fn new(status: RebaseStatus) -> Self {
        Self {
            status,
            rebased: vec![],
            skipped: vec![],
            collapsed_into: None,
            moved_refs: vec![],
            conflicts: vec![],
            message: None,
        }
    }
}

impl From<&Outcome> for RebaseOutput {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Finished(summary) => Self {
                rebased: summary
                    .rebased
                    .iter()
                    .map(|(old, new)| RewriteInfo {
                        old: old.to_string(),
                        new: new.to_string(),
                    })
                    .collect(),
                skipped: summary.skipped.iter().map(ToString::to_string).collect(),
                collapsed_into: summary.collapsed_into.map(|rev| rev.to_string()),
                moved_refs: summary
                    .moved_refs
                    .iter()
                    .map(|(name, rev)| RefInfo {
                        name: name.clone(),
                        target: rev.to_string(),
                    })
                    .collect(),
                ..Self::new(RebaseStatus::Finished)
            },
            Outcome::NothingToDo(reason) => Self {
                message: Some(reason.to_string()),
                ..Self::new(RebaseStatus::NothingToDo)
            },
            Outcome::ConflictPending { rev, paths } => Self {
                conflicts: paths.clone(),
                message: Some(format!("conflicts while rebasing {rev}")),
                ..Self::new(RebaseStatus::Conflict)
            },
            Outcome::Aborted { cleaned_up } => Self {
                message: (!cleaned_up).then(|| "rebased revisions were kept".to_string()),
                ..Self::new(RebaseStatus::Aborted)
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rebar_core::NothingToRebase;

    fn rev(byte: u8) -> RevId {
        RevId::from_bytes(&[byte; 20]).unwrap()
    }

    #[test]
    fn test_flags_override_config() {
        let config = RebaseConfig {
            single_transaction: true,
            ..RebaseConfig::default()
        };
        let args = RebaseArgs {
            collapse: true,
            message: Some("squashed".into()),
            in_memory: true,
            date: Some("2024-01-02T03:04:05+01:00".into()),
            ..RebaseArgs::default()
        };

        let options = build_options(&args, &config).unwrap();
        assert!(options.collapse);
        assert!(options.in_memory);
        assert!(options.single_transaction);
        assert_eq!(options.collapse_message.as_deref(), Some("squashed"));
        assert_eq!(
            options.date.map(|d| d.to_rfc3339()).as_deref(),
            Some("2024-01-02T03:04:05+01:00")
        );
    }

    #[test]
    fn test_invalid_date_is_input_error() {
        let args = RebaseArgs {
            date: Some("yesterday".into()),
            ..RebaseArgs::default()
        };
        let err = build_options(&args, &RebaseConfig::default()).unwrap_err();
        assert_eq!(super::super::exit_code(&err), super::super::EXIT_INPUT);
    }

    #[test]
    fn test_json_output_for_finished_rebase() {
        let summary = RebaseSummary {
            rebased: [(rev(1), rev(2))].into(),
            moved_refs: vec![("feature".into(), rev(2))],
            ..RebaseSummary::default()
        };
        let json = serde_json::to_value(RebaseOutput::from(&Outcome::Finished(summary))).unwrap();

        assert_eq!(json["status"], "finished");
        assert_eq!(json["rebased"][0]["old"], rev(1).to_string());
        assert_eq!(json["moved_refs"][0]["name"], "feature");
        assert!(json.get("conflicts").is_none());
    }

    #[test]
    fn test_json_output_for_nothing_to_do() {
        let outcome = Outcome::NothingToDo(NothingToRebase::AlreadyInPlace);
        let json = serde_json::to_value(RebaseOutput::from(&outcome)).unwrap();
        assert_eq!(json["status"], "nothing_to_do");
        assert!(json["message"].is_string());
    }

    #[test]
    fn test_json_output_for_conflict() {
        let outcome = Outcome::ConflictPending {
            rev: rev(3),
            paths: vec!["a.txt".into()],
        };
        let json = serde_json::to_value(RebaseOutput::from(&outcome)).unwrap();
        assert_eq!(json["status"], "conflict");
        assert_eq!(json["conflicts"][0], "a.txt");
    }
}

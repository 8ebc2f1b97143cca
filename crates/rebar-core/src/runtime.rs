//! The rebase state machine: start, continue after conflicts, and abort.
//!
//! A runtime moves through [`Phase`]s. Every public entry point takes the
//! operation lock first and keeps it until it returns, including when it
//! stops for conflicts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, FixedOffset};
use rebar_git::{
    CommitRequest, Committed, MergeRequest, MergeStrategy, RevId, Revision, WorkingCopy,
};
use tracing::{debug, info, instrument, warn};

use crate::config::RebaseConfig;
use crate::error::{Error, Result};
use crate::finalize::{apply_cleanup, collapsed_description, plan_cleanup, update_hash_refs};
use crate::obsolete::{ObsoleteResolution, handle_skipping_obsolete};
use crate::parents::{NewParents, ParentResolver};
use crate::plan::{DestMap, NothingToRebase, Planned, RebasePlan, build_plan, check_immutable};
use crate::schedule::{latest, sort_sources, sort_topological};
use crate::state::{OperationRecord, RevState, Transaction};
use crate::traits::{ObsoleteStore, StateStore};

/// Extra key recording the revision a rewrite came from.
pub const SOURCE_EXTRA: &str = "rebase_source";

/// Options for one rebase invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct RebaseOptions {
    /// Fold every source into a single new revision.
    pub collapse: bool,
    /// Leave the original revisions in place.
    pub keep: bool,
    /// Description of the collapsed revision.
    pub collapse_message: Option<String>,
    /// Date for every new revision instead of the original's.
    pub date: Option<DateTime<FixedOffset>>,
    pub in_memory: bool,
    pub allow_empty: bool,
    pub single_transaction: bool,
    pub allow_divergence: bool,
    pub skip_obsolete: bool,
    pub store_source: bool,
}

impl Default for RebaseOptions {
    fn default() -> Self {
        Self::from_config(&RebaseConfig::default())
    }
}

impl RebaseOptions {
    /// Options seeded from the repository configuration.
    #[must_use]
    pub fn from_config(config: &RebaseConfig) -> Self {
        Self {
            collapse: false,
            keep: false,
            collapse_message: None,
            date: None,
            in_memory: config.in_memory,
            allow_empty: config.allow_empty_commits,
            single_transaction: config.single_transaction,
            allow_divergence: config.allow_divergence,
            skip_obsolete: config.skip_obsolete,
            store_source: config.store_source,
        }
    }
}

/// Lifecycle of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    Prepared,
    Running,
    Finished,
    Aborted,
    StoppedForConflict,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Prepared => "prepared",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Aborted => "aborted",
            Self::StoppedForConflict => "stopped for conflict",
        };
        f.write_str(name)
    }
}

/// What a finished rebase did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebaseSummary {
    /// Source to the revision that replaced it.
    pub rebased: BTreeMap<RevId, RevId>,
    /// Sources that did not produce a revision of their own.
    pub skipped: BTreeSet<RevId>,
    pub collapsed_into: Option<RevId>,
    /// References moved to rewritten revisions.
    pub moved_refs: Vec<(String, RevId)>,
}

/// How a runtime entry point ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Finished(RebaseSummary),
    NothingToDo(NothingToRebase),
    /// A merge left conflicts in the working copy; resolve them and continue.
    ConflictPending { rev: RevId, paths: Vec<String> },
    Aborted { cleaned_up: bool },
}

/// Status messages emitted while rebasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    AlreadyRebased { desc: String, new: Option<RevId> },
    WouldDiverge { desc: String },
    NoSuccessor { desc: String },
    InDestination { desc: String, successor: RevId },
    AlreadyHasChanges { desc: String },
    CreatedEmpty { desc: String },
    Rebased { desc: String, new: RevId },
    InMemoryFallback,
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRebased { desc, new: None } => write!(f, "already rebased {desc}"),
            Self::AlreadyRebased {
                desc,
                new: Some(new),
            } => write!(f, "already rebased {desc} as {}", new.short()),
            Self::WouldDiverge { desc } => write!(
                f,
                "note: not rebasing {desc} and its descendants as this would cause divergence"
            ),
            Self::NoSuccessor { desc } => {
                write!(f, "note: not rebasing {desc}, it has no successor")
            }
            Self::InDestination { desc, successor } => write!(
                f,
                "note: not rebasing {desc}, already in destination as {}",
                successor.short()
            ),
            Self::AlreadyHasChanges { desc } => write!(
                f,
                "note: not rebasing {desc}, its destination already has all its changes"
            ),
            Self::CreatedEmpty { desc } => write!(
                f,
                "note: created empty successor for {desc}, its destination already has all its changes"
            ),
            Self::Rebased { desc, new } => write!(f, "rebased {desc} as {}", new.short()),
            Self::InMemoryFallback => {
                write!(f, "hit merge conflicts; re-running rebase without in-memory merge")
            }
        }
    }
}

/// Progress callbacks. Every method defaults to doing nothing.
pub trait RebaseObserver {
    /// The run is about to process `total` pending revisions.
    fn started(&self, _total: usize) {}

    /// `revision` is being processed.
    fn rebasing(&self, _revision: &Revision) {}

    fn note(&self, _note: &Note) {}

    /// The run completed.
    fn finished(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RebaseObserver for NoopObserver {}

/// Short id and summary line, as shown in status messages.
#[must_use]
pub fn describe(revision: &Revision) -> String {
    format!("{} \"{}\"", revision.id.short(), revision.summary())
}

/// Drives a rebase against a working copy and a state store.
pub struct RebaseRuntime<'a, W: WorkingCopy, S: StateStore + ObsoleteStore> {
    repo: &'a W,
    store: &'a S,
    options: RebaseOptions,
    observer: &'a dyn RebaseObserver,
    phase: Phase,
    strategy: MergeStrategy,
    resolution: ObsoleteResolution,
}

impl<'a, W: WorkingCopy, S: StateStore + ObsoleteStore> RebaseRuntime<'a, W, S> {
    /// Create a runtime in the [`Phase::New`] phase.
    #[must_use]
    pub fn new(repo: &'a W, store: &'a S, options: RebaseOptions) -> Self {
        Self {
            repo,
            store,
            options,
            observer: &NoopObserver,
            phase: Phase::New,
            strategy: MergeStrategy::OnDisk,
            resolution: ObsoleteResolution::default(),
        }
    }

    /// Report progress to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: &'a dyn RebaseObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    fn transition(&mut self, next: Phase) {
        debug!(from = %self.phase, to = %next, "rebase phase");
        self.phase = next;
    }

    const fn handles_obsolete(&self, keep: bool) -> bool {
        self.options.skip_obsolete && !keep
    }

    fn require_clean(&self) -> Result<()> {
        if self.repo.is_clean()? {
            Ok(())
        } else {
            Err(Error::DirtyWorkingCopy)
        }
    }

    fn resolver<'r>(&'r self, record: &'r OperationRecord) -> ParentResolver<'r, W, S> {
        ParentResolver::new(
            self.repo,
            self.store,
            &record.destinations,
            &record.state,
            &record.skipped,
            &self.resolution,
        )
    }

    /// Start a new rebase moving each source in `destinations` onto its
    /// destination.
    ///
    /// # Errors
    /// Returns an input error for invalid requests, `Divergence` when
    /// obsolete sources would diverge, and state errors when another rebase
    /// is in progress or the working copy is dirty. Nothing is changed in
    /// those cases.
    #[instrument(skip_all, fields(sources = destinations.len()))]
    pub fn start(&mut self, destinations: DestMap) -> Result<Outcome> {
        let tx = self.store.begin()?;
        if self.store.is_rebase_in_progress() {
            return Err(Error::RebaseInProgress);
        }

        let original = self.repo.working_position()?;
        let RebasePlan {
            original_position,
            mut destinations,
            mut state,
            external_parent,
        } = match build_plan(self.repo, destinations, original, self.options.collapse)? {
            Planned::Ready(plan) => plan,
            Planned::Nothing(reason) => {
                info!(%reason, "nothing to do");
                return Ok(Outcome::NothingToDo(reason));
            }
        };

        self.resolution = if self.handles_obsolete(self.options.keep) {
            handle_skipping_obsolete(
                self.repo,
                self.store,
                &mut destinations,
                &mut state,
                self.options.allow_divergence,
            )?
        } else {
            ObsoleteResolution::default()
        };

        if !self.options.keep {
            check_immutable(
                self.repo,
                state
                    .keys()
                    .copied()
                    .filter(|rev| !self.resolution.skips(*rev)),
            )?;
        }

        self.strategy = if self.options.in_memory && !self.options.collapse {
            // The working copy only moves at the end, when it was rebased.
            if state.contains_key(&original_position) {
                self.require_clean()?;
            }
            MergeStrategy::InMemory
        } else {
            self.require_clean()?;
            MergeStrategy::OnDisk
        };

        let mut record = OperationRecord::new(original_position, destinations, state);
        record.collapse = self.options.collapse;
        record.keep = self.options.keep;
        record.external_parent = external_parent;
        record.collapse_message.clone_from(&self.options.collapse_message);
        record.date = self.options.date;
        record.active_ref = self.repo.active_ref()?;

        self.store.save_record(&tx, &record)?;
        self.transition(Phase::Prepared);
        self.run(&tx, record)
    }

    /// Continue a rebase stopped for conflicts, committing the resolved
    /// working copy for the interrupted revision.
    ///
    /// # Errors
    /// Returns `NoRebaseInProgress`, `UnresolvedConflicts` while conflict
    /// markers remain, or `InconsistentState` when the record no longer
    /// matches the repository.
    #[instrument(skip_all)]
    pub fn resume(&mut self) -> Result<Outcome> {
        let tx = self.store.begin()?;
        if !self.store.is_rebase_in_progress() {
            return Err(Error::NoRebaseInProgress);
        }
        if self.repo.has_unresolved()? {
            return Err(Error::UnresolvedConflicts(self.repo.unresolved()?));
        }

        let record = self.store.load_record().map_err(|e| match e {
            Error::Io(_) => e,
            other => Error::InconsistentState(other.to_string()),
        })?;
        record.validate(self.repo)?;

        self.resolution = if self.handles_obsolete(record.keep) {
            let mut resolution =
                ObsoleteResolution::compute(self.repo, self.store, &record.destinations)?;
            if self.options.allow_divergence {
                resolution.successor_in_rebase_set.clear();
            }
            resolution
        } else {
            ObsoleteResolution::default()
        };
        self.strategy = MergeStrategy::OnDisk;

        info!(pending = record.pending_count(), "continuing rebase");
        self.transition(Phase::Prepared);
        self.run(&tx, record)
    }

    /// Abandon the rebase in progress, discarding what it produced when that
    /// is safe, and restore the original working position.
    ///
    /// # Errors
    /// Returns `NoRebaseInProgress` or an error from the repository.
    #[instrument(skip_all)]
    pub fn abort(&mut self) -> Result<Outcome> {
        let tx = self.store.begin()?;
        if !self.store.is_rebase_in_progress() {
            return Err(Error::NoRebaseInProgress);
        }

        let record = match self.store.load_record().and_then(|record| {
            record.validate(self.repo)?;
            Ok(record)
        }) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "rebase aborted (no revision is removed, only broken state is cleared)");
                self.store.clear_record(&tx)?;
                self.transition(Phase::Aborted);
                return Ok(Outcome::Aborted { cleaned_up: false });
            }
        };

        let rebased: Vec<RevId> = record
            .state
            .iter()
            .filter(|(rev, _)| !record.skipped.contains(*rev))
            .filter_map(|(rev, state)| {
                state
                    .rebased()
                    .filter(|new| new != rev && Some(new) != record.destinations.get(rev))
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut cleaned_up = true;
        let mut immutable = vec![];
        for &rev in &rebased {
            if self.repo.is_immutable(rev)? {
                immutable.push(rev.short());
            }
        }
        if !immutable.is_empty() {
            warn!(revs = %immutable.join(", "), "can't clean up public revisions");
            cleaned_up = false;
        } else if !rebased.is_empty() {
            let produced: BTreeSet<RevId> = rebased.iter().copied().collect();
            let foreign = self
                .repo
                .descendants(&rebased)?
                .into_iter()
                .any(|rev| !produced.contains(&rev));
            if foreign {
                warn!("new revisions detected on destination branch, can't strip");
                cleaned_up = false;
            }
        }

        if cleaned_up {
            let position = self.repo.working_position()?;
            let moved_from = rebased.contains(&position)
                || record.destinations.values().any(|dest| *dest == position)
                || position == record.original_position;
            if moved_from {
                self.repo.update_to(record.original_position)?;
            }
            self.repo.discard(&rebased)?;
        }

        self.reactivate(&record)?;
        self.store.clear_record(&tx)?;
        self.transition(Phase::Aborted);
        info!(cleaned_up, "rebase aborted");
        Ok(Outcome::Aborted { cleaned_up })
    }

    fn run(&mut self, tx: &Transaction, mut record: OperationRecord) -> Result<Outcome> {
        self.transition(Phase::Running);
        self.observer.started(record.pending_count());

        for batch in sort_sources(&record.destinations)? {
            for rev in sort_topological(self.repo, &batch)? {
                if let Some(outcome) = self.rebase_node(tx, &mut record, rev)? {
                    return Ok(outcome);
                }
                if !self.options.single_transaction {
                    self.store.save_record(tx, &record)?;
                }
            }
        }

        self.finish(tx, record)
    }

    /// Process one source. Returns an outcome only when the run must stop.
    fn rebase_node(
        &mut self,
        tx: &Transaction,
        record: &mut OperationRecord,
        rev: RevId,
    ) -> Result<Option<Outcome>> {
        let state = record.state.get(&rev).copied().ok_or_else(|| {
            Error::InconsistentState(format!("{} is not part of the rebase", rev.short()))
        })?;
        let revision = self.repo.revision(rev)?;
        let desc = describe(&revision);

        if state != RevState::Pending {
            let new = state.rebased().filter(|new| *new != rev);
            info!(rev = %rev.short(), "already rebased");
            self.observer.note(&Note::AlreadyRebased { desc, new });
            return Ok(None);
        }

        self.observer.rebasing(&revision);

        if self.resolution.successor_in_rebase_set.contains(&rev) {
            self.observer.note(&Note::WouldDiverge { desc });
            info!(rev = %rev.short(), "not rebasing, would cause divergence");
            record.skipped.insert(rev);
            record.state.insert(rev, RevState::Ignored);
            return Ok(None);
        }

        if let Some(successor) = self.resolution.successor_in_destination.get(&rev).copied() {
            let note = match successor {
                Some(successor) => Note::InDestination { desc, successor },
                None => Note::NoSuccessor { desc },
            };
            self.observer.note(&note);
            record.skipped.insert(rev);
            let dests = self.resolver(record).adjust_destination(rev)?;
            let dest = latest(self.repo, dests)?.unwrap_or(dests[0]);
            record.state.insert(rev, RevState::Rebased(dest));
            return Ok(None);
        }

        info!(rev = %rev.short(), "rebasing {desc}");
        let parents = self.resolver(record).define_parents(rev)?;

        let resuming =
            record.interrupted == Some(rev) && self.repo.working_position()? == parents.p1;
        if resuming {
            debug!(rev = %rev.short(), "resuming interrupted rebase");
        } else {
            let request = MergeRequest {
                rev,
                p1: parents.p1,
                p2: parents.p2,
                base: parents.base,
                collapsing: record.collapse,
                strategy: self.strategy,
            };
            let result = self.repo.merge(&request)?;
            if !result.is_clean() {
                if self.strategy == MergeStrategy::InMemory {
                    info!(rev = %rev.short(), "in-memory merge hit conflicts, switching to the working copy");
                    self.observer.note(&Note::InMemoryFallback);
                    self.require_clean()?;
                    self.strategy = MergeStrategy::OnDisk;
                    return self.rebase_node(tx, record, rev);
                }

                record.interrupted = Some(rev);
                self.store.save_record(tx, record)?;
                self.transition(Phase::StoppedForConflict);
                info!(rev = %rev.short(), conflicts = result.unresolved_count(), "stopped for conflicts");
                return Ok(Some(Outcome::ConflictPending {
                    rev,
                    paths: result.unresolved,
                }));
            }
        }

        let committed = if record.collapse {
            None
        } else {
            self.conclude_node(record, &revision, parents)?
        };

        match committed {
            Some(committed) => {
                record.state.insert(rev, RevState::Rebased(committed.id));
                if committed.empty {
                    self.observer.note(&Note::CreatedEmpty { desc: desc.clone() });
                }
                debug!(rev = %rev.short(), new = %committed.id.short(), "rebased");
                self.observer.note(&Note::Rebased {
                    desc,
                    new: committed.id,
                });
            }
            None => {
                if !record.collapse {
                    info!(rev = %rev.short(), "destination already has all its changes");
                    self.observer.note(&Note::AlreadyHasChanges { desc });
                    record.skipped.insert(rev);
                }
                record.state.insert(rev, RevState::Rebased(parents.p1));
                debug!(next = %parents.p1.short(), "next revision set to p1");
            }
        }
        record.interrupted = None;
        Ok(None)
    }

    /// Commit the merged result for `revision`.
    fn conclude_node(
        &self,
        record: &OperationRecord,
        revision: &Revision,
        parents: NewParents,
    ) -> Result<Option<Committed>> {
        // Skipped revisions map to whatever replaced them.
        let rewrites: BTreeMap<RevId, RevId> = record
            .state
            .iter()
            .filter_map(|(old, state)| {
                state
                    .rebased()
                    .filter(|new| new != old)
                    .map(|new| (*old, new))
            })
            .collect();

        let mut extra = revision.extra.clone();
        if self.options.store_source {
            extra.insert(SOURCE_EXTRA.to_string(), revision.id.to_string());
        }

        let request = CommitRequest {
            parents: parents.to_vec(),
            description: update_hash_refs(self.repo, &revision.description, &rewrites)?,
            author: revision.author.clone(),
            date: record.date.unwrap_or(revision.date),
            extra,
            allow_empty: self.options.allow_empty,
            strategy: self.strategy,
        };
        Ok(self.repo.commit(&request)?)
    }

    /// Commit a collapsed revision, returning its id.
    fn commit_collapsed(&self, record: &OperationRecord) -> Result<Option<RevId>> {
        let keys: Vec<RevId> = record.state.keys().copied().collect();
        let members = sort_topological(self.repo, &keys)?;
        let (Some(&first), Some(&last)) = (members.first(), members.last()) else {
            return Ok(None);
        };

        let parents = self.resolver(record).define_parents(first)?;
        let mut commit_parents = vec![parents.p1];
        commit_parents.extend(record.external_parent);

        let message = match &record.collapse_message {
            Some(message) => message.clone(),
            None => {
                let mut included = vec![];
                for &rev in &members {
                    if !record.skipped.contains(&rev) {
                        included.push(self.repo.revision(rev)?);
                    }
                }
                collapsed_description(&included)
            }
        };

        let last = self.repo.revision(last)?;
        let mut extra = last.extra.clone();
        if self.options.store_source {
            extra.insert(SOURCE_EXTRA.to_string(), last.id.to_string());
        }
        let request = CommitRequest {
            parents: commit_parents,
            description: message,
            author: last.author.clone(),
            date: record.date.unwrap_or(last.date),
            extra,
            allow_empty: self.options.allow_empty,
            strategy: MergeStrategy::OnDisk,
        };
        Ok(self.repo.commit(&request)?.map(|committed| committed.id))
    }

    fn finish(&mut self, tx: &Transaction, mut record: OperationRecord) -> Result<Outcome> {
        let mut collapsed_into = None;
        if record.collapse {
            if let Some(new) = self.commit_collapsed(&record)? {
                info!(new = %new.short(), "collapsed");
                for state in record.state.values_mut() {
                    *state = RevState::Rebased(new);
                }
                collapsed_into = Some(new);
            }
        }

        let original = record.original_position;
        let target = record
            .state
            .get(&original)
            .and_then(|state| state.rebased())
            .unwrap_or(original);
        if self.repo.working_position()? != target {
            debug!(target = %target.short(), "updating working copy");
            self.repo.update_to(target)?;
        }

        let cleanup = plan_cleanup(
            self.store,
            &record,
            if record.keep { None } else { collapsed_into },
        )?;
        let moved_refs = apply_cleanup(self.repo, self.store, &cleanup)?;

        self.store.clear_record(tx)?;
        self.reactivate(&record)?;

        let rebased = record
            .state
            .iter()
            .filter(|(rev, _)| !record.skipped.contains(*rev))
            .filter_map(|(rev, state)| {
                state
                    .rebased()
                    .filter(|new| new != rev)
                    .map(|new| (*rev, new))
            })
            .collect();

        self.transition(Phase::Finished);
        self.observer.finished();
        Ok(Outcome::Finished(RebaseSummary {
            rebased,
            skipped: record.skipped,
            collapsed_into,
            moved_refs,
        }))
    }

    /// Follow the reference active before the rebase again, if it points at
    /// the working position.
    fn reactivate(&self, record: &OperationRecord) -> Result<()> {
        let Some(name) = &record.active_ref else {
            return Ok(());
        };
        let position = self.repo.working_position()?;
        if self.repo.refs_at(position)?.contains(name) {
            debug!(name = %name, "reactivating ref");
            self.repo.activate_ref(name)?;
        }
        Ok(())
    }
}

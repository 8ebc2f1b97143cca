//! State persistence for .git/rebar/ directory.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use fslock::LockFile;
use rebar_git::{RevId, RevisionGraph};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::obsolete::Marker;
use crate::plan::DestMap;
use crate::traits::{ObsoleteStore, StateStore};

/// Progress of a single source revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevState {
    /// Not processed yet.
    Pending,
    /// Processed; the revision now lives at this id. Equal to the source when
    /// it was already in place, or to a destination when it was skipped.
    Rebased(RevId),
    /// Left alone for the rest of the operation.
    Ignored,
}

impl RevState {
    /// The produced revision, if any.
    #[must_use]
    pub const fn rebased(self) -> Option<RevId> {
        match self {
            Self::Rebased(rev) => Some(rev),
            Self::Pending | Self::Ignored => None,
        }
    }
}

/// Source revision to progress.
pub type StateMap = BTreeMap<RevId, RevState>;

/// Everything needed to continue or abort an interrupted rebase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Format version; bumped on incompatible changes.
    pub version: u32,

    /// When the rebase started.
    pub started_at: DateTime<Utc>,

    /// Working position before the rebase.
    pub original_position: RevId,

    /// Source to requested destination.
    pub destinations: DestMap,

    /// Source to progress.
    pub state: StateMap,

    /// Sources that will not produce a new revision.
    #[serde(default)]
    pub skipped: BTreeSet<RevId>,

    pub collapse: bool,
    pub keep: bool,

    /// Reference the working copy followed before the rebase.
    pub active_ref: Option<String>,

    /// Second parent of the collapsed revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_parent: Option<RevId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapse_message: Option<String>,

    /// Date override for new revisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<FixedOffset>>,

    /// Revision whose merge stopped on conflicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<RevId>,
}

impl OperationRecord {
    /// Current record format.
    pub const VERSION: u32 = 1;

    /// Create a record for a rebase about to start.
    #[must_use]
    pub fn new(original_position: RevId, destinations: DestMap, state: StateMap) -> Self {
        Self {
            version: Self::VERSION,
            started_at: Utc::now(),
            original_position,
            destinations,
            state,
            skipped: BTreeSet::new(),
            collapse: false,
            keep: false,
            active_ref: None,
            external_parent: None,
            collapse_message: None,
            date: None,
            interrupted: None,
        }
    }

    /// Number of sources still pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state
            .values()
            .filter(|state| **state == RevState::Pending)
            .count()
    }

    /// Check the record against the repository it was written for.
    ///
    /// # Errors
    /// Returns `InconsistentState` if the destination and state maps disagree
    /// or a referenced revision no longer exists.
    pub fn validate<G: RevisionGraph>(&self, graph: &G) -> Result<()> {
        if !self.destinations.keys().eq(self.state.keys()) {
            return Err(Error::InconsistentState(
                "destination and state maps cover different revisions".into(),
            ));
        }

        let referenced = self
            .destinations
            .iter()
            .flat_map(|(source, dest)| [*source, *dest])
            .chain(self.state.values().filter_map(|state| state.rebased()))
            .chain(self.external_parent)
            .chain([self.original_position]);
        for rev in referenced {
            if !graph.exists(rev) {
                return Err(Error::InconsistentState(format!(
                    "revision {} is missing",
                    rev.short()
                )));
            }
        }
        Ok(())
    }
}

/// Exclusive hold on the operation lock.
///
/// Mutating store calls take a `&Transaction` so the lock is provably held;
/// it is released when the guard is dropped.
#[derive(Debug)]
pub struct Transaction {
    lock: Option<LockFile>,
}

impl Transaction {
    /// Take the lock file at `path`.
    ///
    /// # Errors
    /// Returns `LockHeld` if another process owns the lock.
    pub fn acquire(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let lock_error = |e: &dyn std::fmt::Display| Error::Lock {
            path: path.clone(),
            message: e.to_string(),
        };

        let mut lock = LockFile::open(&path).map_err(|e| lock_error(&e))?;
        if !lock.try_lock_with_pid().map_err(|e| lock_error(&e))? {
            return Err(Error::LockHeld(path));
        }
        debug!(path = %path.display(), "acquired operation lock");
        Ok(Self { lock: Some(lock) })
    }

    /// A transaction for stores that have nothing to lock.
    #[must_use]
    pub const fn unlocked() -> Self {
        Self { lock: None }
    }

    /// Whether a lock file backs this transaction.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.as_ref().is_some_and(LockFile::owns_lock)
    }
}

/// Manages the .git/rebar/ directory state.
#[derive(Debug)]
pub struct Store {
    /// Path to the .git/rebar/ directory.
    rebar_dir: PathBuf,
    markers: RefCell<Option<Vec<Marker>>>,
}

impl Store {
    /// File names within .git/rebar/
    const CONFIG_FILE: &'static str = "config.toml";
    const RECORD_FILE: &'static str = "rebasestate.json";
    const OBSSTORE_FILE: &'static str = "obsstore.json";
    const LOCK_FILE: &'static str = "lock";

    /// Create a store for the repository whose git directory is `git_dir`.
    ///
    /// # Errors
    /// Returns error if `git_dir` does not exist.
    pub fn new(git_dir: impl AsRef<Path>) -> Result<Self> {
        let git_dir = git_dir.as_ref();
        if !git_dir.is_dir() {
            return Err(Error::NotARepository);
        }

        Ok(Self {
            rebar_dir: git_dir.join("rebar"),
            markers: RefCell::new(None),
        })
    }

    fn config_path(&self) -> PathBuf {
        self.rebar_dir.join(Self::CONFIG_FILE)
    }

    fn record_path(&self) -> PathBuf {
        self.rebar_dir.join(Self::RECORD_FILE)
    }

    fn obsstore_path(&self) -> PathBuf {
        self.rebar_dir.join(Self::OBSSTORE_FILE)
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.rebar_dir)?;
        Ok(())
    }

    fn load_markers(&self) -> Result<Vec<Marker>> {
        let path = self.obsstore_path();
        if !path.exists() {
            return Ok(vec![]);
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| Error::StateParseError {
            file: path,
            message: e.to_string(),
        })
    }
}

impl StateStore for Store {
    fn is_initialized(&self) -> bool {
        self.config_path().exists()
    }

    fn init(&self) -> Result<()> {
        self.ensure_dir()?;
        if !self.config_path().exists() {
            Config::default().save(self.config_path())?;
        }
        Ok(())
    }

    fn rebar_dir(&self) -> &Path {
        &self.rebar_dir
    }

    fn load_config(&self) -> Result<Config> {
        Config::load(self.config_path())
    }

    fn save_config(&self, config: &Config) -> Result<()> {
        self.ensure_dir()?;
        config.save(self.config_path())
    }

    fn begin(&self) -> Result<Transaction> {
        self.ensure_dir()?;
        Transaction::acquire(&self.rebar_dir.join(Self::LOCK_FILE))
    }

    fn is_rebase_in_progress(&self) -> bool {
        self.record_path().exists()
    }

    fn load_record(&self) -> Result<OperationRecord> {
        let path = self.record_path();
        if !path.exists() {
            return Err(Error::NoRebaseInProgress);
        }

        let content = fs::read_to_string(&path)?;
        let record: OperationRecord =
            serde_json::from_str(&content).map_err(|e| Error::StateParseError {
                file: path.clone(),
                message: e.to_string(),
            })?;
        if record.version != OperationRecord::VERSION {
            return Err(Error::StateParseError {
                file: path,
                message: format!("unsupported record version {}", record.version),
            });
        }
        Ok(record)
    }

    fn save_record(&self, _tx: &Transaction, record: &OperationRecord) -> Result<()> {
        self.ensure_dir()?;
        let content = serde_json::to_string_pretty(record)?;
        fs::write(self.record_path(), content)?;
        Ok(())
    }

    fn clear_record(&self, _tx: &Transaction) -> Result<()> {
        let path = self.record_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl ObsoleteStore for Store {
    fn markers(&self) -> Result<Vec<Marker>> {
        if let Some(markers) = self.markers.borrow().as_ref() {
            return Ok(markers.clone());
        }
        let markers = self.load_markers()?;
        self.markers.replace(Some(markers.clone()));
        Ok(markers)
    }

    fn add_markers(&self, markers: &[Marker]) -> Result<()> {
        if markers.is_empty() {
            return Ok(());
        }
        let mut all = self.load_markers()?;
        all.extend_from_slice(markers);

        self.ensure_dir()?;
        fs::write(self.obsstore_path(), serde_json::to_string_pretty(&all)?)?;
        self.markers.replace(Some(all));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_repo() -> (TempDir, Store) {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();
        let store = Store::new(temp.path().join(".git")).unwrap();
        (temp, store)
    }

    fn rev(byte: u8) -> RevId {
        RevId::from_bytes(&[byte; 20]).unwrap()
    }

    fn sample_record() -> OperationRecord {
        let destinations = DestMap::from([(rev(1), rev(9)), (rev(2), rev(9))]);
        let state = StateMap::from([
            (rev(1), RevState::Rebased(rev(5))),
            (rev(2), RevState::Pending),
        ]);
        let mut record = OperationRecord::new(rev(2), destinations, state);
        record.active_ref = Some("feature".into());
        record.interrupted = Some(rev(2));
        record
    }

    #[test]
    fn test_init_and_check() {
        let (_temp, store) = setup_test_repo();

        assert!(!store.is_initialized());
        store.init().unwrap();
        assert!(store.is_initialized());
        assert!(store.load_config().unwrap().rebase.skip_obsolete);
    }

    #[test]
    fn test_missing_git_dir() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            Store::new(temp.path().join(".git")),
            Err(Error::NotARepository)
        ));
    }

    #[test]
    fn test_record_persistence() {
        let (_temp, store) = setup_test_repo();
        let tx = store.begin().unwrap();
        assert!(!store.is_rebase_in_progress());

        let record = sample_record();
        store.save_record(&tx, &record).unwrap();
        assert!(store.is_rebase_in_progress());
        assert_eq!(store.load_record().unwrap(), record);

        store.clear_record(&tx).unwrap();
        assert!(!store.is_rebase_in_progress());
        assert!(matches!(
            store.load_record(),
            Err(Error::NoRebaseInProgress)
        ));
    }

    #[test]
    fn test_record_rejects_unknown_version() {
        let (_temp, store) = setup_test_repo();
        let tx = store.begin().unwrap();
        let mut record = sample_record();
        record.version = 99;
        store.save_record(&tx, &record).unwrap();

        let err = store.load_record().unwrap_err();
        assert!(err.to_string().contains("unsupported record version 99"));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let (_temp, store) = setup_test_repo();
        let tx = store.begin().unwrap();
        assert!(tx.is_locked());
        assert!(matches!(store.begin(), Err(Error::LockHeld(_))));

        drop(tx);
        assert!(store.begin().is_ok());
    }

    #[test]
    fn test_markers_persist() {
        let (temp, store) = setup_test_repo();
        store
            .add_markers(&[Marker::new(rev(1), vec![rev(2)]), Marker::new(rev(2), vec![rev(3)])])
            .unwrap();

        let reopened = Store::new(temp.path().join(".git")).unwrap();
        assert!(reopened.is_obsolete(rev(1)).unwrap());
        assert!(!reopened.is_obsolete(rev(3)).unwrap());
        assert_eq!(
            reopened.all_successors(rev(1)).unwrap(),
            BTreeSet::from([rev(2), rev(3)])
        );
    }
}

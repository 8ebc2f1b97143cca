//! Mock implementations for testing the engine.
//!
//! `MockRepo` is a small in-memory revision DAG where every revision is a
//! snapshot of text files, with a per-file three-way merge so conflicts and
//! empty results behave like they would in a real repository. `MockStore`
//! keeps the operation record serialized, so every load is a fresh copy.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{FixedOffset, TimeZone};
use rebar_git::{
    Author, CommitRequest, Committed, MergeRequest, MergeResult, MergeStrategy, Parents,
    Result as GitResult, RevId, Revision, RevisionGraph, WorkingCopy,
};

use crate::config::Config;
use crate::obsolete::Marker;
use crate::state::{OperationRecord, Transaction};
use crate::traits::{ObsoleteStore, StateStore};
use crate::{Error, Result};

type Files = BTreeMap<String, String>;

struct MockCommit {
    revision: Revision,
    files: Files,
}

#[derive(Debug, Clone)]
enum Head {
    Detached(RevId),
    Ref(String),
}

/// Mock implementation of `RevisionGraph` and `WorkingCopy` for testing.
pub struct MockRepo {
    commits: RefCell<BTreeMap<RevId, MockCommit>>,
    next_id: Cell<u32>,
    refs: RefCell<BTreeMap<String, RevId>>,
    head: RefCell<Option<Head>>,
    working: RefCell<Files>,
    index: RefCell<Files>,
    conflicts: RefCell<Vec<String>>,
    staged: RefCell<Option<(RevId, Files)>>,
    immutable: RefCell<BTreeSet<RevId>>,
    discarded: RefCell<BTreeSet<RevId>>,
    pub merges: Cell<usize>,
}

impl Default for MockRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRepo {
    pub fn new() -> Self {
        Self {
            commits: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
            refs: RefCell::new(BTreeMap::new()),
            head: RefCell::new(None),
            working: RefCell::new(Files::new()),
            index: RefCell::new(Files::new()),
            conflicts: RefCell::new(vec![]),
            staged: RefCell::new(None),
            immutable: RefCell::new(BTreeSet::new()),
            discarded: RefCell::new(BTreeSet::new()),
            merges: Cell::new(0),
        }
    }

    fn next_rev(&self) -> RevId {
        let n = self.next_id.get() + 1;
        self.next_id.set(n);
        let mut bytes = [0u8; 20];
        bytes[0] = 0x5e;
        bytes[2..6].copy_from_slice(&n.to_be_bytes());
        RevId::from_bytes(&bytes).unwrap()
    }

    fn insert(&self, parents: &[RevId], description: &str, files: Files) -> RevId {
        let id = self.next_rev();
        self.insert_as(id, parents, description, files)
    }

    fn insert_as(&self, id: RevId, parents: &[RevId], description: &str, files: Files) -> RevId {
        let parents = match parents {
            [] => Parents::none(),
            [p1] => Parents::one(*p1),
            [p1, p2] => Parents::two(*p1, *p2),
            _ => panic!("mock revisions have at most two parents"),
        };
        let date = FixedOffset::east_opt(0)
            .unwrap()
            .timestamp_opt(1_700_000_000 + i64::from(self.next_id.get()), 0)
            .single()
            .unwrap();
        let revision = Revision {
            id,
            parents,
            description: description.to_string(),
            author: Author {
                name: "Test User".into(),
                email: "test@example.com".into(),
            },
            date,
            extra: BTreeMap::new(),
        };
        self.commits
            .borrow_mut()
            .insert(id, MockCommit { revision, files });
        id
    }

    /// Create a revision whose files are its parents' files plus `changes`.
    pub fn commit(&self, description: &str, parents: &[RevId], changes: &[(&str, &str)]) -> RevId {
        let files = self.files_with(parents, changes);
        self.insert(parents, description, files)
    }

    /// Like `commit`, but with a chosen id.
    pub fn commit_as(
        &self,
        id: RevId,
        description: &str,
        parents: &[RevId],
        changes: &[(&str, &str)],
    ) -> RevId {
        let files = self.files_with(parents, changes);
        self.insert_as(id, parents, description, files)
    }

    fn files_with(&self, parents: &[RevId], changes: &[(&str, &str)]) -> Files {
        let mut files = Files::new();
        for parent in parents.iter().rev() {
            files.extend(self.files(*parent));
        }
        for (path, content) in changes {
            files.insert((*path).to_string(), (*content).to_string());
        }
        files
    }

    fn files(&self, rev: RevId) -> Files {
        self.commits
            .borrow()
            .get(&rev)
            .map(|commit| commit.files.clone())
            .unwrap_or_default()
    }

    pub fn file(&self, rev: RevId, path: &str) -> Option<String> {
        self.files(rev).get(path).cloned()
    }

    pub fn revision_of(&self, rev: RevId) -> Revision {
        self.revision(rev).unwrap()
    }

    pub fn description(&self, rev: RevId) -> String {
        self.revision_of(rev).description
    }

    pub fn commit_count(&self) -> usize {
        self.commits.borrow().len()
    }

    /// Mark `rev` and its ancestors as published.
    pub fn publish(&self, rev: RevId) {
        self.immutable.borrow_mut().insert(rev);
    }

    pub fn set_ref(&self, name: &str, rev: RevId) {
        self.refs.borrow_mut().insert(name.to_string(), rev);
    }

    pub fn ref_target(&self, name: &str) -> Option<RevId> {
        self.refs.borrow().get(name).copied()
    }

    /// Check out `rev` with a detached head.
    pub fn checkout(&self, rev: RevId) {
        self.update_to(rev).unwrap();
    }

    /// Check out the target of `name` and follow it.
    pub fn checkout_ref(&self, name: &str) {
        let rev = self.ref_target(name).unwrap();
        self.update_to(rev).unwrap();
        self.activate_ref(name).unwrap();
    }

    pub fn write_file(&self, path: &str, content: &str) {
        self.working
            .borrow_mut()
            .insert(path.to_string(), content.to_string());
    }

    pub fn working_file(&self, path: &str) -> Option<String> {
        self.working.borrow().get(path).cloned()
    }

    pub fn is_discarded(&self, rev: RevId) -> bool {
        self.discarded.borrow().contains(&rev)
    }

    /// Copy resolved conflict paths from the working copy into the index.
    fn stage_resolved(&self) -> GitResult<()> {
        let unresolved = self.unresolved()?;
        if !unresolved.is_empty() {
            return Err(rebar_git::Error::UnresolvedConflicts(unresolved));
        }
        let working = self.working.borrow();
        let mut index = self.index.borrow_mut();
        for path in self.conflicts.borrow().iter() {
            match working.get(path) {
                Some(content) => index.insert(path.clone(), content.clone()),
                None => index.remove(path),
            };
        }
        Ok(())
    }

    fn head_rev(&self) -> Option<RevId> {
        match self.head.borrow().as_ref()? {
            Head::Detached(rev) => Some(*rev),
            Head::Ref(name) => self.ref_target(name),
        }
    }
}

fn merge3(base: &Files, ours: &Files, theirs: &Files) -> (Files, Vec<String>) {
    let paths: BTreeSet<&String> = base.keys().chain(ours.keys()).chain(theirs.keys()).collect();
    let mut merged = Files::new();
    let mut conflicts = vec![];

    for path in paths {
        let (b, o, t) = (base.get(path), ours.get(path), theirs.get(path));
        let result = if o == t || b == t {
            o.cloned()
        } else if b == o {
            t.cloned()
        } else {
            conflicts.push(path.clone());
            Some(format!(
                "<<<<<<< dest\n{}\n=======\n{}\n>>>>>>> source\n",
                o.map_or("", String::as_str),
                t.map_or("", String::as_str)
            ))
        };
        if let Some(content) = result {
            merged.insert(path.clone(), content);
        }
    }
    (merged, conflicts)
}

impl RevisionGraph for MockRepo {
    fn revision(&self, rev: RevId) -> GitResult<Revision> {
        self.commits
            .borrow()
            .get(&rev)
            .map(|commit| commit.revision.clone())
            .ok_or_else(|| rebar_git::Error::RevisionNotFound(rev.to_string()))
    }

    fn parents(&self, rev: RevId) -> GitResult<Parents> {
        Ok(self.revision(rev)?.parents)
    }

    fn resolve_prefix(&self, prefix: &str) -> GitResult<Option<RevId>> {
        let commits = self.commits.borrow();
        let mut found = commits
            .keys()
            .filter(|rev| rev.to_string().starts_with(prefix));
        Ok(match (found.next(), found.next()) {
            (Some(rev), None) => Some(*rev),
            _ => None,
        })
    }

    fn exists(&self, rev: RevId) -> bool {
        self.commits.borrow().contains_key(&rev)
    }

    fn is_ancestor(&self, ancestor: RevId, descendant: RevId) -> GitResult<bool> {
        Ok(self.ancestors(&[descendant])?.contains(&ancestor))
    }

    fn ancestors(&self, revs: &[RevId]) -> GitResult<BTreeSet<RevId>> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<RevId> = revs.to_vec();
        while let Some(rev) = stack.pop() {
            if seen.insert(rev) {
                stack.extend(self.parents(rev)?.iter());
            }
        }
        Ok(seen)
    }

    fn common_ancestor(&self, a: RevId, b: RevId) -> GitResult<Option<RevId>> {
        let left = self.ancestors(&[a])?;
        let right = self.ancestors(&[b])?;
        let common: Vec<RevId> = left.intersection(&right).copied().collect();
        let mut heads = vec![];
        for &candidate in &common {
            let mut dominated = false;
            for &other in &common {
                if other != candidate && self.is_ancestor(candidate, other)? {
                    dominated = true;
                    break;
                }
            }
            if !dominated {
                heads.push(candidate);
            }
        }
        Ok(heads.into_iter().max())
    }

    fn descendants(&self, revs: &[RevId]) -> GitResult<BTreeSet<RevId>> {
        let candidates: Vec<RevId> = self
            .commits
            .borrow()
            .keys()
            .copied()
            .filter(|rev| !self.is_discarded(*rev))
            .collect();
        let mut result = BTreeSet::new();
        for candidate in candidates {
            let ancestors = self.ancestors(&[candidate])?;
            if revs.iter().any(|rev| ancestors.contains(rev)) {
                result.insert(candidate);
            }
        }
        Ok(result)
    }

    fn is_immutable(&self, rev: RevId) -> GitResult<bool> {
        let published: Vec<RevId> = self.immutable.borrow().iter().copied().collect();
        for head in published {
            if self.is_ancestor(rev, head)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl WorkingCopy for MockRepo {
    fn working_position(&self) -> GitResult<RevId> {
        self.head_rev()
            .ok_or_else(|| rebar_git::Error::RefNotFound("HEAD".into()))
    }

    fn active_ref(&self) -> GitResult<Option<String>> {
        Ok(match self.head.borrow().as_ref() {
            Some(Head::Ref(name)) => Some(name.clone()),
            _ => None,
        })
    }

    fn update_to(&self, rev: RevId) -> GitResult<()> {
        if !self.exists(rev) {
            return Err(rebar_git::Error::RevisionNotFound(rev.to_string()));
        }
        self.head.replace(Some(Head::Detached(rev)));
        self.working.replace(self.files(rev));
        self.index.replace(self.files(rev));
        self.conflicts.borrow_mut().clear();
        self.staged.replace(None);
        Ok(())
    }

    fn activate_ref(&self, name: &str) -> GitResult<()> {
        if self.ref_target(name).is_none() {
            return Err(rebar_git::Error::RefNotFound(name.into()));
        }
        self.head.replace(Some(Head::Ref(name.to_string())));
        Ok(())
    }

    fn is_clean(&self) -> GitResult<bool> {
        let head = self.working_position()?;
        Ok(*self.working.borrow() == self.files(head))
    }

    fn has_unresolved(&self) -> GitResult<bool> {
        let working = self.working.borrow();
        Ok(self.conflicts.borrow().iter().any(|path| {
            working
                .get(path)
                .is_some_and(|content| content.contains("<<<<<<<"))
        }))
    }

    fn unresolved(&self) -> GitResult<Vec<String>> {
        let working = self.working.borrow();
        Ok(self
            .conflicts
            .borrow()
            .iter()
            .filter(|path| {
                working
                    .get(*path)
                    .is_some_and(|content| content.contains("<<<<<<<"))
            })
            .cloned()
            .collect())
    }

    fn merge(&self, request: &MergeRequest) -> GitResult<MergeResult> {
        self.merges.set(self.merges.get() + 1);
        let base = request.base.map(|b| self.files(b)).unwrap_or_default();
        let theirs = self.files(request.rev);

        match request.strategy {
            MergeStrategy::InMemory => {
                let staged = self.staged.borrow().clone();
                let ours = match staged {
                    Some((p1, files)) if request.collapsing && p1 == request.p1 => files,
                    _ => self.files(request.p1),
                };
                let (merged, conflicts) = merge3(&base, &ours, &theirs);
                if conflicts.is_empty() {
                    self.staged.replace(Some((request.p1, merged)));
                } else {
                    self.staged.replace(None);
                }
                Ok(MergeResult {
                    unresolved: conflicts,
                })
            }
            MergeStrategy::OnDisk => {
                if self.working_position()? != request.p1 {
                    self.update_to(request.p1)?;
                }
                // Like git, merge onto the index; edits in the working copy
                // only count once staged.
                self.stage_resolved()?;
                let ours = self.index.borrow().clone();
                let (merged, conflicts) = merge3(&base, &ours, &theirs);
                let mut index = merged.clone();
                for path in &conflicts {
                    match ours.get(path).or_else(|| theirs.get(path)) {
                        Some(content) => index.insert(path.clone(), content.clone()),
                        None => index.remove(path),
                    };
                }
                self.index.replace(index);
                self.working.replace(merged);
                self.conflicts.replace(conflicts.clone());
                Ok(MergeResult {
                    unresolved: conflicts,
                })
            }
        }
    }

    fn commit(&self, request: &CommitRequest) -> GitResult<Option<Committed>> {
        let first = request.parents.first().copied();
        let files = match request.strategy {
            MergeStrategy::InMemory => self
                .staged
                .borrow_mut()
                .take()
                .map(|(_, files)| files)
                .unwrap_or_else(|| first.map(|p| self.files(p)).unwrap_or_default()),
            MergeStrategy::OnDisk => {
                if self.has_unresolved()? {
                    return Err(rebar_git::Error::UnresolvedConflicts(
                        self.conflicts.borrow().clone(),
                    ));
                }
                self.conflicts.borrow_mut().clear();
                let files = self.working.borrow().clone();
                self.index.replace(files.clone());
                files
            }
        };

        let empty = first.is_some_and(|p| self.files(p) == files);
        if empty && request.parents.len() < 2 && !request.allow_empty {
            return Ok(None);
        }

        let id = self.insert(&request.parents, &request.description, files);
        {
            let mut commits = self.commits.borrow_mut();
            let commit = commits.get_mut(&id).unwrap();
            commit.revision.author = request.author.clone();
            commit.revision.date = request.date;
            commit.revision.extra = request.extra.clone();
        }
        if request.strategy == MergeStrategy::OnDisk {
            self.head.replace(Some(Head::Detached(id)));
        }
        Ok(Some(Committed { id, empty }))
    }

    fn refs_at(&self, rev: RevId) -> GitResult<Vec<String>> {
        Ok(self
            .refs
            .borrow()
            .iter()
            .filter(|(_, target)| **target == rev)
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn move_ref(&self, name: &str, rev: RevId) -> GitResult<()> {
        self.set_ref(name, rev);
        Ok(())
    }

    fn discard(&self, revs: &[RevId]) -> GitResult<()> {
        self.discarded.borrow_mut().extend(revs.iter().copied());
        Ok(())
    }
}

/// Mock implementation of `StateStore` and `ObsoleteStore` for testing.
pub struct MockStore {
    pub config: RefCell<Config>,
    record: RefCell<Option<String>>,
    markers: RefCell<Vec<Marker>>,
    pub saves: Cell<usize>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            config: RefCell::new(Config::default()),
            record: RefCell::new(None),
            markers: RefCell::new(vec![]),
            saves: Cell::new(0),
        }
    }

    pub fn with_marker(self, predecessor: RevId, successors: &[RevId]) -> Self {
        self.markers
            .borrow_mut()
            .push(Marker::new(predecessor, successors.to_vec()));
        self
    }

    /// Serialized record, as it would sit on disk.
    pub fn raw_record(&self) -> Option<String> {
        self.record.borrow().clone()
    }

    pub fn set_raw_record(&self, raw: Option<String>) {
        self.record.replace(raw);
    }

    pub fn marker_count(&self) -> usize {
        self.markers.borrow().len()
    }
}

impl StateStore for MockStore {
    fn is_initialized(&self) -> bool {
        true
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn rebar_dir(&self) -> &Path {
        Path::new("/tmp/rebar-test")
    }

    fn load_config(&self) -> Result<Config> {
        Ok(self.config.borrow().clone())
    }

    fn save_config(&self, config: &Config) -> Result<()> {
        self.config.replace(config.clone());
        Ok(())
    }

    fn begin(&self) -> Result<Transaction> {
        Ok(Transaction::unlocked())
    }

    fn is_rebase_in_progress(&self) -> bool {
        self.record.borrow().is_some()
    }

    fn load_record(&self) -> Result<OperationRecord> {
        let raw = self.record.borrow().clone().ok_or(Error::NoRebaseInProgress)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save_record(&self, _tx: &Transaction, record: &OperationRecord) -> Result<()> {
        self.saves.set(self.saves.get() + 1);
        self.record.replace(Some(serde_json::to_string(record)?));
        Ok(())
    }

    fn clear_record(&self, _tx: &Transaction) -> Result<()> {
        self.record.replace(None);
        Ok(())
    }
}

impl ObsoleteStore for MockStore {
    fn markers(&self) -> Result<Vec<Marker>> {
        Ok(self.markers.borrow().clone())
    }

    fn add_markers(&self, markers: &[Marker]) -> Result<()> {
        self.markers.borrow_mut().extend_from_slice(markers);
        Ok(())
    }
}

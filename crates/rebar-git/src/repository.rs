//! Repository wrapper implementing the revision graph and working copy on
//! top of git.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, TimeZone};
use git2::build::CheckoutBuilder;
use git2::{BranchType, ErrorCode, ObjectType, Oid, ResetType, Signature, StatusOptions};
use tracing::debug;

use crate::error::{Error, Result};
use crate::traits::{
    Author, CommitRequest, Committed, MergeRequest, MergeResult, MergeStrategy, Parents,
    Revision, RevisionGraph, WorkingCopy,
};
use crate::RevId;

/// Paths left conflicted by the last on-disk merge, one per line.
const CONFLICTS_FILE: &str = "REBAR_CONFLICTS";

const CONFLICT_MARKER: &str = "<<<<<<<";

/// Stage bits of an index entry's flags.
const STAGE_MASK: u16 = 0x3000;
const STAGE_SHIFT: u16 = 12;

/// Result of an in-memory merge waiting to be committed.
#[derive(Debug, Clone, Copy)]
struct StagedTree {
    /// First parent the tree was merged onto.
    base: RevId,
    tree: Oid,
}

/// High-level wrapper around a git repository.
pub struct Repository {
    inner: git2::Repository,
    staged: RefCell<Option<StagedTree>>,
}

impl Repository {
    /// Open a repository at the given path.
    ///
    /// # Errors
    /// Returns error if no repository found at path or any parent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let inner = git2::Repository::discover(path).map_err(|e| match e.code() {
            ErrorCode::NotFound => Error::NotARepository,
            _ => Error::Git2(e),
        })?;
        Ok(Self::from_git2(inner))
    }

    /// Open the repository containing the current directory.
    ///
    /// # Errors
    /// Returns error if not inside a git repository.
    pub fn open_current() -> Result<Self> {
        Self::open(".")
    }

    fn from_git2(inner: git2::Repository) -> Self {
        Self {
            inner,
            staged: RefCell::new(None),
        }
    }

    /// Get the path to the repository root (workdir).
    #[must_use]
    pub fn workdir(&self) -> Option<&Path> {
        self.inner.workdir()
    }

    /// Get the path to the .git directory.
    #[must_use]
    pub fn git_dir(&self) -> &Path {
        self.inner.path()
    }

    /// Resolve a user-supplied revision expression (`HEAD~2`, a branch
    /// name, an abbreviated hash, ...) to a revision.
    ///
    /// # Errors
    /// Returns `RevisionNotFound` if the expression names no commit.
    pub fn resolve(&self, spec: &str) -> Result<RevId> {
        let commit = self
            .inner
            .revparse_single(spec)
            .and_then(|object| object.peel_to_commit())
            .map_err(|_| Error::RevisionNotFound(spec.into()))?;
        Ok(commit.id().into())
    }

    /// Get a reference to the underlying git2 repository.
    ///
    /// Use sparingly - prefer high-level methods.
    #[must_use]
    pub fn inner(&self) -> &git2::Repository {
        &self.inner
    }

    fn find_commit(&self, rev: RevId) -> Result<git2::Commit<'_>> {
        self.inner
            .find_commit(rev.oid())
            .map_err(|_| Error::RevisionNotFound(rev.to_string()))
    }

    fn empty_tree(&self) -> Result<git2::Tree<'_>> {
        let oid = self.inner.treebuilder(None)?.write()?;
        Ok(self.inner.find_tree(oid)?)
    }

    /// Tips of local branches plus HEAD.
    fn visible_heads(&self) -> Result<Vec<Oid>> {
        let mut heads = Vec::new();
        for branch in self.inner.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(oid) = branch.get().target() {
                heads.push(oid);
            }
        }
        if let Some(oid) = self.inner.head().ok().and_then(|head| head.target()) {
            heads.push(oid);
        }
        Ok(heads)
    }

    // === Conflict bookkeeping ===

    fn conflicts_path(&self) -> PathBuf {
        self.inner.path().join(CONFLICTS_FILE)
    }

    fn recorded_conflicts(&self) -> Result<Vec<String>> {
        match fs::read_to_string(self.conflicts_path()) {
            Ok(content) => Ok(content
                .lines()
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }

    fn record_conflicts(&self, paths: &[String]) -> Result<()> {
        fs::write(self.conflicts_path(), paths.join("\n"))?;
        Ok(())
    }

    fn clear_conflicts(&self) -> Result<()> {
        match fs::remove_file(self.conflicts_path()) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Recorded conflict paths whose working-copy file still has markers.
    fn unresolved_paths(&self) -> Result<Vec<String>> {
        let Some(workdir) = self.inner.workdir() else {
            return Ok(vec![]);
        };

        let mut unresolved = vec![];
        for path in self.recorded_conflicts()? {
            match fs::read(workdir.join(&path)) {
                Ok(bytes) => {
                    if String::from_utf8_lossy(&bytes)
                        .lines()
                        .any(|line| line.starts_with(CONFLICT_MARKER))
                    {
                        unresolved.push(path);
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(unresolved)
    }

    // === Merge helpers ===

    fn merge_in_memory(
        &self,
        request: &MergeRequest,
        base: &git2::Tree<'_>,
        theirs: &git2::Tree<'_>,
    ) -> Result<MergeResult> {
        let staged = *self.staged.borrow();
        let ours = match staged {
            Some(staged) if request.collapsing && staged.base == request.p1 => {
                self.inner.find_tree(staged.tree)?
            }
            _ => self.find_commit(request.p1)?.tree()?,
        };

        let mut merged = self.inner.merge_trees(base, &ours, theirs, None)?;
        if merged.has_conflicts() {
            self.staged.replace(None);
            return Ok(MergeResult {
                unresolved: conflicted_paths(&merged)?,
            });
        }

        let tree = merged.write_tree_to(&self.inner)?;
        self.staged.replace(Some(StagedTree {
            base: request.p1,
            tree,
        }));
        Ok(MergeResult::default())
    }

    fn merge_on_disk(
        &self,
        request: &MergeRequest,
        base: &git2::Tree<'_>,
        theirs: &git2::Tree<'_>,
    ) -> Result<MergeResult> {
        if self.working_position()? == request.p1 {
            debug!("already in destination");
        } else {
            debug!(p1 = %request.p1.short(), "update to first parent");
            self.update_to(request.p1)?;
        }

        let mut index = self.inner.index()?;
        if index.has_conflicts() {
            return Err(Error::UnresolvedConflicts(conflicted_paths(&index)?));
        }
        // Conflicts resolved during a collapse are only in the working copy.
        self.stage_resolved(&mut index)?;
        // The index carries earlier collapsed merges, so merge onto it
        // rather than onto the first parent's tree.
        let ours = self.inner.find_tree(index.write_tree()?)?;

        let mut merged = self.inner.merge_trees(base, &ours, theirs, None)?;
        let unresolved = conflicted_paths(&merged)?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force().allow_conflicts(true).conflict_style_merge(true);
        self.inner
            .checkout_index(Some(&mut merged), Some(&mut checkout))?;

        // Stage everything that merged cleanly; conflicted paths keep our
        // side in the index so a hard reset restores them.
        index.clear()?;
        for entry in merged.iter() {
            if (entry.flags & STAGE_MASK) >> STAGE_SHIFT == 0 {
                index.add(&entry)?;
            }
        }
        for conflict in merged.conflicts()? {
            let conflict = conflict?;
            if let Some(mut entry) = conflict.our.or(conflict.their) {
                entry.flags &= !STAGE_MASK;
                index.add(&entry)?;
            }
        }
        index.write()?;

        if unresolved.is_empty() {
            self.clear_conflicts()?;
        } else {
            self.record_conflicts(&unresolved)?;
        }
        Ok(MergeResult { unresolved })
    }

    /// Copy the user's resolution of recorded conflicts into `index`.
    fn stage_resolved(&self, index: &mut git2::Index) -> Result<()> {
        let recorded = self.recorded_conflicts()?;
        if recorded.is_empty() {
            return Ok(());
        }
        let unresolved = self.unresolved_paths()?;
        if !unresolved.is_empty() {
            return Err(Error::UnresolvedConflicts(unresolved));
        }
        if let Some(workdir) = self.inner.workdir() {
            for path in recorded {
                if workdir.join(&path).exists() {
                    index.add_path(Path::new(&path))?;
                } else {
                    index.remove_path(Path::new(&path))?;
                }
            }
        }
        Ok(())
    }

    /// Stage the working copy after an on-disk merge and return its tree.
    fn stage_working_copy(&self) -> Result<Oid> {
        let unresolved = self.unresolved_paths()?;
        if !unresolved.is_empty() {
            return Err(Error::UnresolvedConflicts(unresolved));
        }

        let mut index = self.inner.index()?;
        if index.has_conflicts() {
            return Err(Error::UnresolvedConflicts(conflicted_paths(&index)?));
        }
        self.stage_resolved(&mut index)?;
        index.update_all(["*"], None)?;
        index.write()?;
        self.clear_conflicts()?;
        Ok(index.write_tree()?)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("path", &self.git_dir())
            .finish_non_exhaustive()
    }
}

fn conflicted_paths(index: &git2::Index) -> Result<Vec<String>> {
    let mut paths = BTreeSet::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
            paths.insert(String::from_utf8_lossy(&entry.path).into_owned());
        }
    }
    Ok(paths.into_iter().collect())
}

fn parents_of(rev: RevId, commit: &git2::Commit<'_>) -> Result<Parents> {
    let ids: Vec<Oid> = commit.parent_ids().collect();
    match ids.as_slice() {
        [] => Ok(Parents::none()),
        [first] => Ok(Parents::one((*first).into())),
        [first, second] => Ok(Parents::two((*first).into(), (*second).into())),
        _ => Err(Error::OctopusMerge(rev)),
    }
}

fn to_datetime(time: git2::Time) -> Result<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(time.offset_minutes() * 60)
        .ok_or(Error::InvalidDate(time.seconds()))?;
    offset
        .timestamp_opt(time.seconds(), 0)
        .single()
        .ok_or(Error::InvalidDate(time.seconds()))
}

fn to_signature(author: &Author, date: DateTime<FixedOffset>) -> Result<Signature<'static>> {
    let time = git2::Time::new(date.timestamp(), date.offset().local_minus_utc() / 60);
    Ok(Signature::new(&author.name, &author.email, &time)?)
}

/// Header fields git writes itself. Anything else in a commit header is extra.
const STANDARD_HEADERS: &[&str] = &[
    "tree",
    "parent",
    "author",
    "committer",
    "encoding",
    "mergetag",
    "gpgsig",
    "gpgsig-sha256",
];

/// Insert `extra` as header fields before the message of a raw commit.
///
/// Multi-line values use git's continuation lines.
fn with_extra_headers(buffer: &[u8], extra: &BTreeMap<String, String>) -> Result<Vec<u8>> {
    let header_end = buffer
        .windows(2)
        .position(|pair| pair == b"\n\n")
        .map_or(buffer.len(), |pos| pos + 1);

    let mut content = Vec::with_capacity(buffer.len() + extra.len() * 64);
    content.extend_from_slice(&buffer[..header_end]);
    for (key, value) in extra {
        if key.is_empty()
            || key.bytes().any(|b| b.is_ascii_whitespace())
            || STANDARD_HEADERS.contains(&key.as_str())
        {
            return Err(Error::InvalidExtraKey(key.clone()));
        }
        content.extend_from_slice(key.as_bytes());
        content.push(b' ');
        content.extend_from_slice(value.replace('\n', "\n ").as_bytes());
        content.push(b'\n');
    }
    content.extend_from_slice(&buffer[header_end..]);
    Ok(content)
}

fn parse_extra_headers(header: &[u8]) -> BTreeMap<String, String> {
    let mut extra: BTreeMap<String, String> = BTreeMap::new();
    let mut current: Option<String> = None;
    for line in String::from_utf8_lossy(header).lines() {
        if let Some(continued) = line.strip_prefix(' ') {
            if let Some(value) = current.as_ref().and_then(|key| extra.get_mut(key)) {
                value.push('\n');
                value.push_str(continued);
            }
            continue;
        }
        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        if STANDARD_HEADERS.contains(&key) {
            current = None;
        } else {
            extra.insert(key.to_string(), value.to_string());
            current = Some(key.to_string());
        }
    }
    extra
}

impl RevisionGraph for Repository {
    fn revision(&self, rev: RevId) -> Result<Revision> {
        let commit = self.find_commit(rev)?;
        let author = commit.author();
        Ok(Revision {
            id: rev,
            parents: parents_of(rev, &commit)?,
            description: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
            author: Author {
                name: String::from_utf8_lossy(author.name_bytes()).into_owned(),
                email: String::from_utf8_lossy(author.email_bytes()).into_owned(),
            },
            date: to_datetime(author.when())?,
            extra: parse_extra_headers(commit.raw_header_bytes()),
        })
    }

    fn parents(&self, rev: RevId) -> Result<Parents> {
        parents_of(rev, &self.find_commit(rev)?)
    }

    fn exists(&self, rev: RevId) -> bool {
        self.inner.find_commit(rev.oid()).is_ok()
    }

    fn resolve_prefix(&self, prefix: &str) -> Result<Option<RevId>> {
        match self
            .inner
            .find_object_by_prefix(prefix, Some(ObjectType::Commit))
        {
            Ok(object) => Ok(Some(object.id().into())),
            Err(e) if matches!(e.code(), ErrorCode::NotFound | ErrorCode::Ambiguous) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_ancestor(&self, ancestor: RevId, descendant: RevId) -> Result<bool> {
        if ancestor == descendant {
            return Ok(true);
        }
        Ok(self
            .inner
            .graph_descendant_of(descendant.oid(), ancestor.oid())?)
    }

    fn ancestors(&self, revs: &[RevId]) -> Result<BTreeSet<RevId>> {
        let mut walk = self.inner.revwalk()?;
        for rev in revs {
            walk.push(rev.oid())?;
        }
        walk.map(|oid| oid.map(RevId::from).map_err(Error::from))
            .collect()
    }

    fn common_ancestor(&self, a: RevId, b: RevId) -> Result<Option<RevId>> {
        match self.inner.merge_base(a.oid(), b.oid()) {
            Ok(oid) => Ok(Some(oid.into())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn descendants(&self, revs: &[RevId]) -> Result<BTreeSet<RevId>> {
        let mut result: BTreeSet<RevId> =
            revs.iter().copied().filter(|rev| self.exists(*rev)).collect();

        let mut walk = self.inner.revwalk()?;
        for head in self.visible_heads()? {
            walk.push(head)?;
        }
        for oid in walk {
            let oid = oid?;
            for rev in revs {
                if self.inner.graph_descendant_of(oid, rev.oid())? {
                    result.insert(oid.into());
                    break;
                }
            }
        }
        Ok(result)
    }

    fn is_immutable(&self, rev: RevId) -> Result<bool> {
        for reference in self.inner.references_glob("refs/remotes/*")? {
            let Some(target) = reference?.target() else {
                continue;
            };
            if target == rev.oid() || self.inner.graph_descendant_of(target, rev.oid())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn only(&self, heads: &[RevId], excluded: &[RevId]) -> Result<BTreeSet<RevId>> {
        let mut walk = self.inner.revwalk()?;
        for rev in heads {
            walk.push(rev.oid())?;
        }
        for rev in excluded {
            walk.hide(rev.oid())?;
        }
        walk.map(|oid| oid.map(RevId::from).map_err(Error::from))
            .collect()
    }
}

impl WorkingCopy for Repository {
    fn working_position(&self) -> Result<RevId> {
        Ok(self.inner.head()?.peel_to_commit()?.id().into())
    }

    fn active_ref(&self) -> Result<Option<String>> {
        let head = self.inner.head()?;
        if !head.is_branch() {
            return Ok(None);
        }
        Ok(head.shorthand().map(String::from))
    }

    fn update_to(&self, rev: RevId) -> Result<()> {
        let commit = self.find_commit(rev)?;
        self.inner.set_head_detached(commit.id())?;
        self.inner
            .reset(commit.as_object(), ResetType::Hard, None)?;
        self.clear_conflicts()?;
        self.staged.replace(None);
        debug!(rev = %rev.short(), "updated working copy");
        Ok(())
    }

    fn activate_ref(&self, name: &str) -> Result<()> {
        self.inner
            .find_branch(name, BranchType::Local)
            .map_err(|_| Error::RefNotFound(name.into()))?;
        self.inner.set_head(&format!("refs/heads/{name}"))?;
        Ok(())
    }

    fn is_clean(&self) -> Result<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        Ok(self.inner.statuses(Some(&mut opts))?.is_empty())
    }

    fn has_unresolved(&self) -> Result<bool> {
        if self.inner.index()?.has_conflicts() {
            return Ok(true);
        }
        Ok(!self.unresolved_paths()?.is_empty())
    }

    fn unresolved(&self) -> Result<Vec<String>> {
        self.unresolved_paths()
    }

    fn merge(&self, request: &MergeRequest) -> Result<MergeResult> {
        let theirs = self.find_commit(request.rev)?.tree()?;
        let base = match request.base {
            Some(base) => self.find_commit(base)?.tree()?,
            None => self.empty_tree()?,
        };
        debug!(
            rev = %request.rev.short(),
            p1 = %request.p1.short(),
            base = ?request.base,
            strategy = ?request.strategy,
            "merge"
        );

        match request.strategy {
            MergeStrategy::InMemory => self.merge_in_memory(request, &base, &theirs),
            MergeStrategy::OnDisk => self.merge_on_disk(request, &base, &theirs),
        }
    }

    fn commit(&self, request: &CommitRequest) -> Result<Option<Committed>> {
        let first = request.parents.first().copied();
        let tree_oid = match request.strategy {
            MergeStrategy::InMemory => match self.staged.borrow_mut().take() {
                Some(staged) => staged.tree,
                None => match first {
                    Some(parent) => self.find_commit(parent)?.tree_id(),
                    None => self.empty_tree()?.id(),
                },
            },
            MergeStrategy::OnDisk => self.stage_working_copy()?,
        };

        let first_tree = match first {
            Some(parent) => Some(self.find_commit(parent)?.tree_id()),
            None => None,
        };
        let empty = first_tree == Some(tree_oid);
        if empty && request.parents.len() < 2 && !request.allow_empty {
            debug!("nothing changed, not committing");
            return Ok(None);
        }

        let tree = self.inner.find_tree(tree_oid)?;
        let author = to_signature(&request.author, request.date)?;
        let committer = self.inner.signature().unwrap_or_else(|_| author.clone());
        let parents = request
            .parents
            .iter()
            .map(|parent| self.find_commit(*parent))
            .collect::<Result<Vec<_>>>()?;
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();

        let buffer = self.inner.commit_create_buffer(
            &author,
            &committer,
            &request.description,
            &tree,
            &parent_refs,
        )?;
        let content = with_extra_headers(&buffer, &request.extra)?;
        let oid = self.inner.odb()?.write(ObjectType::Commit, &content)?;
        if request.strategy == MergeStrategy::OnDisk {
            self.inner.set_head_detached(oid)?;
        }

        Ok(Some(Committed {
            id: oid.into(),
            empty,
        }))
    }

    fn refs_at(&self, rev: RevId) -> Result<Vec<String>> {
        let mut names = vec![];
        for branch in self.inner.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if branch.get().target() == Some(rev.oid()) {
                if let Some(name) = branch.name()? {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn move_ref(&self, name: &str, rev: RevId) -> Result<()> {
        self.inner.reference(
            &format!("refs/heads/{name}"),
            rev.oid(),
            true, // force
            &format!("rebar: move to {}", rev.short()),
        )?;
        Ok(())
    }

    fn discard(&self, revs: &[RevId]) -> Result<()> {
        // Commits cannot be deleted from the object store. Dropping them from
        // the HEAD reflog leaves them unreachable, so `git gc` prunes them.
        let discarded: BTreeSet<Oid> = revs.iter().map(|rev| rev.oid()).collect();
        let mut reflog = self.inner.reflog("HEAD")?;
        let mut removed = 0usize;
        for i in (0..reflog.len()).rev() {
            let mentions = reflog.get(i).is_some_and(|entry| {
                discarded.contains(&entry.id_new()) || discarded.contains(&entry.id_old())
            });
            if mentions {
                reflog.remove(i, true)?;
                removed += 1;
            }
        }
        if removed > 0 {
            reflog.write()?;
        }
        debug!(count = revs.len(), removed, "discarded revisions");
        Ok(())
    }
}

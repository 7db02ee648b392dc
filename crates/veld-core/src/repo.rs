//! Repository: the main entry point for veld operations.
//!
//! A Repository owns one replica: its changesets, DAG indexes and record
//! registries, plus its remote configuration and sync memory. Every
//! mutation runs through [`Repository::transact`], which stages the
//! change on a copy of the state and swaps it in only when the whole
//! operation succeeded. On disk the swap is preceded by writing the new
//! changesets and then, atomically, the DAG manifest.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::branch::{new_ambiguities, BranchInfo, HeadStatus};
use crate::changeset::{Changeset, ChangesetId, CommitPayload, DagId, Payload};
use crate::comments::{comment_delta, comments_on, CommentRecord};
use crate::error::{VeldError, VeldResult};
use crate::fsutil::RepoLock;
use crate::lock::{LockInfo, LockState};
use crate::records::{Audit, RecordDelta};
use crate::remote::{RemoteEntry, RepoConfig, SyncMemory, SyncReport, SyncSettings};
use crate::state::{RepoState, RevSpec};
use crate::store::{ChangesetStore, DagManifest};
use crate::sync::{
    topo_order, ApplySummary, Dagfrag, FragSink, FragSource, OfferReply, PushOptions, Reconciler,
    SessionId,
};
use crate::tags::TagRecord;
use crate::tree::{diff_trees, PathChange, Tree};
use crate::users::{create_user_delta, UserId, UserRecord};

/// The `.veld` directory name.
pub const VELD_DIR: &str = ".veld";

/// A new version-control commit.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub parents: Vec<ChangesetId>,
    pub tree: Tree,
    pub author: UserId,
    pub message: String,
    /// Branch to advance to the new commit.
    pub branch: Option<String>,
}

impl CommitRequest {
    pub fn new(author: &UserId, message: &str, tree: Tree) -> Self {
        Self {
            parents: Vec::new(),
            tree,
            author: author.clone(),
            message: message.to_string(),
            branch: None,
        }
    }

    pub fn parent(mut self, id: &ChangesetId) -> Self {
        self.parents.push(id.clone());
        self
    }

    pub fn on_branch(mut self, branch: &str) -> Self {
        self.branch = Some(branch.to_string());
        self
    }
}

/// Per-DAG ids held by only one of two replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareReport {
    pub only_here: BTreeMap<DagId, Vec<ChangesetId>>,
    pub only_there: BTreeMap<DagId, Vec<ChangesetId>>,
}

impl CompareReport {
    pub fn identical(&self) -> bool {
        self.only_here.is_empty() && self.only_there.is_empty()
    }
}

/// On-disk locations of a repository.
struct Disk {
    veld_dir: PathBuf,
    store: ChangesetStore,
}

impl Disk {
    fn manifest_path(&self) -> PathBuf {
        self.veld_dir.join("dags.json")
    }

    fn config_path(&self) -> PathBuf {
        self.veld_dir.join("config.json")
    }

    fn sync_path(&self) -> PathBuf {
        self.veld_dir.join("sync.json")
    }

    /// Reload if another process committed since we last looked.
    fn refresh(&self, state: &mut RepoState) -> VeldResult<()> {
        let manifest = DagManifest::load(&self.manifest_path())?;
        if manifest != DagManifest::from_state(state) {
            debug!("manifest changed on disk, reloading");
            *state = manifest.load_state(&self.store);
        }
        Ok(())
    }

    /// Write changesets `staged` added over `before`, then the manifest.
    fn persist(&self, before: &RepoState, staged: &RepoState) -> VeldResult<()> {
        for dag in DagId::ALL {
            let known = before.dag(dag).len();
            for id in staged.dag(dag).ids().skip(known) {
                if let Some(cs) = staged.changeset(id) {
                    self.store.put(cs)?;
                }
            }
        }
        DagManifest::from_state(staged).save(&self.manifest_path())
    }
}

/// Changesets a sink has received for one session but not applied.
#[derive(Default)]
struct Staging {
    changesets: BTreeMap<DagId, Vec<Changeset>>,
    ids: HashSet<ChangesetId>,
}

/// A veld repository.
pub struct Repository {
    name: String,
    disk: Option<Disk>,
    state: Mutex<RepoState>,
    config: Mutex<RepoConfig>,
    memory: Mutex<SyncMemory>,
    sessions: Mutex<HashMap<SessionId, Staging>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Repository {
    /// Initialize a new repository in the given directory.
    pub fn init(root: &Path) -> VeldResult<Self> {
        let veld_dir = root.join(VELD_DIR);
        if veld_dir.exists() {
            return Err(VeldError::AlreadyExists(root.display().to_string()));
        }
        fs::create_dir_all(veld_dir.join("changesets"))?;
        RepoConfig::default().save(&veld_dir.join("config.json"))?;
        DagManifest::default().save(&veld_dir.join("dags.json"))?;
        info!(path = %root.display(), "initialized repository");
        Self::open(root)
    }

    /// Open an existing repository rooted at `root`.
    pub fn open(root: &Path) -> VeldResult<Self> {
        let veld_dir = root.join(VELD_DIR);
        if !veld_dir.is_dir() {
            return Err(VeldError::NotARepo);
        }
        let disk = Disk {
            store: ChangesetStore::new(&veld_dir.join("changesets")),
            veld_dir,
        };
        let state = DagManifest::load(&disk.manifest_path())?.load_state(&disk.store);
        let config = RepoConfig::load(&disk.config_path())?;
        let memory = SyncMemory::load(&disk.sync_path())?;
        Ok(Self {
            name: root.display().to_string(),
            disk: Some(disk),
            state: Mutex::new(state),
            config: Mutex::new(config),
            memory: Mutex::new(memory),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// A repository that lives only in this process.
    pub fn in_memory(name: &str) -> Self {
        Self {
            name: name.to_string(),
            disk: None,
            state: Mutex::new(RepoState::new()),
            config: Mutex::new(RepoConfig::default()),
            memory: Mutex::new(SyncMemory::default()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_on_disk(&self) -> bool {
        self.disk.is_some()
    }

    /// Run a read-only query against the current state.
    pub fn read<T>(&self, f: impl FnOnce(&RepoState) -> T) -> T {
        f(&guard(&self.state))
    }

    fn settings(&self) -> SyncSettings {
        guard(&self.config).sync.clone()
    }

    /// Run `f` on a staged copy of the state and swap it in on success.
    ///
    /// `f` also sees the state as it was before the transaction. Any error
    /// leaves the repository, in memory and on disk, exactly as it was.
    pub fn transact<T>(
        &self,
        f: impl FnOnce(&RepoState, &mut RepoState) -> VeldResult<T>,
    ) -> VeldResult<T> {
        let _file_lock = match &self.disk {
            Some(disk) => Some(RepoLock::acquire(
                &disk.veld_dir,
                Duration::from_millis(self.settings().repo_lock_timeout_ms),
            )?),
            None => None,
        };
        let mut current = guard(&self.state);
        if let Some(disk) = &self.disk {
            disk.refresh(&mut current)?;
        }
        let mut staged = current.clone();
        let out = f(&current, &mut staged)?;
        if let Some(disk) = &self.disk {
            disk.persist(&current, &staged)?;
        }
        *current = staged;
        Ok(out)
    }

    /// Append a record changeset on top of every leaf of `dag`.
    fn record(state: &mut RepoState, dag: DagId, delta: RecordDelta) -> VeldResult<Option<ChangesetId>> {
        if delta.is_empty() {
            return Ok(None);
        }
        let cs = state.record_changeset(dag, delta);
        if let Some(user) = state.first_unknown_user([&cs]) {
            return Err(VeldError::UnknownUser(user.to_string()));
        }
        let id = cs.id.clone();
        state.insert(cs)?;
        Ok(Some(id))
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Create a user. Names are unique within a replica.
    pub fn create_user(&self, name: &str) -> VeldResult<UserId> {
        self.transact(|_, state| {
            if state.users().by_name(name).is_some() {
                return Err(VeldError::AlreadyExists(format!("user {name}")));
            }
            let (id, delta) = create_user_delta(name);
            Self::record(state, DagId::Users, delta)?;
            Ok(id)
        })
    }

    pub fn users(&self) -> Vec<UserRecord> {
        self.read(|s| s.users().list())
    }

    pub fn user_by_name(&self, name: &str) -> VeldResult<UserId> {
        self.read(|s| {
            s.users()
                .by_name(name)
                .map(|u| u.id.clone())
                .ok_or_else(|| VeldError::UnknownUser(name.to_string()))
        })
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Record a commit, advance its branch and resolve the author's locks.
    pub fn commit(&self, request: CommitRequest) -> VeldResult<ChangesetId> {
        self.transact(|_, state| {
            state.require_user(&request.author)?;
            let cs = Changeset::new(
                DagId::VersionControl,
                request.parents.clone(),
                Payload::Commit(CommitPayload {
                    author: request.author.clone(),
                    when: Utc::now(),
                    message: request.message.clone(),
                    tree: request.tree.clone(),
                }),
            );
            let id = cs.id.clone();
            state.insert(cs)?;

            if let Some(branch) = &request.branch {
                let delta = state
                    .branches()
                    .advance_delta(branch, &id, Audit::now(&request.author));
                Self::record(state, DagId::Branches, delta)?;
            }

            let changes = state.changes(&id).unwrap_or_default();
            let delta = state.locks().resolve_on_commit(
                &id,
                &request.author,
                request.branch.as_deref(),
                &changes,
            );
            Self::record(state, DagId::Locks, delta)?;

            info!(id = %id.short(), changes = changes.len(), "committed");
            Ok(id)
        })
    }

    pub fn resolve(&self, spec: &RevSpec) -> VeldResult<ChangesetId> {
        self.read(|s| s.resolve(spec))
    }

    pub fn changeset(&self, id: &ChangesetId) -> VeldResult<Changeset> {
        self.read(|s| {
            s.changeset(id)
                .cloned()
                .ok_or_else(|| VeldError::ChangesetNotFound(id.to_string()))
        })
    }

    pub fn tree(&self, spec: &RevSpec) -> VeldResult<Tree> {
        self.read(|s| {
            let id = s.resolve(spec)?;
            s.tree(&id)
                .cloned()
                .ok_or_else(|| VeldError::ChangesetNotFound(id.to_string()))
        })
    }

    /// Object changes between two committed trees.
    pub fn status(&self, from: &RevSpec, to: &RevSpec) -> VeldResult<Vec<PathChange>> {
        let old = self.tree(from)?;
        let new = self.tree(to)?;
        Ok(diff_trees(&old, &new))
    }

    /// Changes a commit made relative to its first parent.
    pub fn changes(&self, spec: &RevSpec) -> VeldResult<Vec<PathChange>> {
        self.read(|s| {
            let id = s.resolve(spec)?;
            s.changes(&id)
                .ok_or_else(|| VeldError::ChangesetNotFound(id.to_string()))
        })
    }

    pub fn leaves(&self, dag: DagId) -> Vec<ChangesetId> {
        self.read(|s| s.leaves(dag))
    }

    pub fn contains(&self, id: &ChangesetId) -> bool {
        self.read(|s| s.contains(id))
    }

    pub fn is_ancestor(&self, a: &ChangesetId, b: &ChangesetId) -> bool {
        self.read(|s| s.dag(DagId::VersionControl).is_ancestor(a, b))
    }

    pub fn revno(&self, id: &ChangesetId) -> Option<u64> {
        self.read(|s| s.dag(DagId::VersionControl).id_to_revno(id))
    }

    /// Version-control history, newest first.
    pub fn log(&self) -> Vec<(u64, Changeset)> {
        self.read(|s| {
            let vc = s.dag(DagId::VersionControl);
            let mut out: Vec<(u64, Changeset)> = vc
                .ids()
                .filter_map(|id| Some((vc.id_to_revno(id)?, s.changeset(id)?.clone())))
                .collect();
            out.reverse();
            out
        })
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    fn require_changeset(state: &RepoState, id: &ChangesetId) -> VeldResult<()> {
        if state.dag(DagId::VersionControl).contains(id) {
            Ok(())
        } else {
            Err(VeldError::ChangesetNotFound(id.to_string()))
        }
    }

    pub fn add_head(&self, branch: &str, csid: &ChangesetId, user: &UserId) -> VeldResult<()> {
        self.transact(|_, state| {
            Self::require_changeset(state, csid)?;
            let delta = state.branches().add_head_delta(branch, csid, Audit::now(user));
            Self::record(state, DagId::Branches, delta)?;
            Ok(())
        })
    }

    pub fn remove_head(&self, branch: &str, csid: &ChangesetId, user: &UserId) -> VeldResult<()> {
        self.transact(|_, state| {
            state.require_user(user)?;
            let delta = state.branches().remove_head_delta(branch, csid)?;
            Self::record(state, DagId::Branches, delta)?;
            Ok(())
        })
    }

    /// Replace one head with another in a single record changeset.
    pub fn move_head(
        &self,
        branch: &str,
        from: &ChangesetId,
        to: &ChangesetId,
        user: &UserId,
    ) -> VeldResult<()> {
        self.transact(|_, state| {
            Self::require_changeset(state, to)?;
            let delta = state
                .branches()
                .move_head_delta(branch, from, to, Audit::now(user))?;
            Self::record(state, DagId::Branches, delta)?;
            Ok(())
        })
    }

    pub fn close_branch(&self, branch: &str, user: &UserId) -> VeldResult<()> {
        self.transact(|_, state| {
            let delta = state.branches().close_delta(branch, Audit::now(user))?;
            Self::record(state, DagId::Branches, delta)?;
            Ok(())
        })
    }

    pub fn reopen_branch(&self, branch: &str, user: &UserId) -> VeldResult<()> {
        self.transact(|_, state| {
            state.require_user(user)?;
            let delta = state.branches().reopen_delta(branch)?;
            Self::record(state, DagId::Branches, delta)?;
            Ok(())
        })
    }

    /// Drop stale head records of a branch. Returns how many were dropped.
    pub fn prune_branch(&self, branch: &str, user: &UserId) -> VeldResult<usize> {
        self.transact(|_, state| {
            state.require_user(user)?;
            let delta = state.branches().prune_stale_delta(branch);
            let pruned = delta.removed.len();
            Self::record(state, DagId::Branches, delta)?;
            Ok(pruned)
        })
    }

    pub fn branch(&self, name: &str) -> VeldResult<BranchInfo> {
        self.read(|s| s.branches().info(name))
    }

    pub fn branches(&self) -> Vec<BranchInfo> {
        self.read(|s| s.branches().list())
    }

    pub fn named_branches(&self) -> BTreeMap<ChangesetId, BTreeMap<String, bool>> {
        self.read(|s| s.branches().named_branches())
    }

    pub fn heads_report(&self) -> Vec<HeadStatus> {
        self.read(|s| s.branches().heads_report())
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    pub fn lock(&self, path: &str, user: &UserId, branch: &str) -> VeldResult<LockInfo> {
        self.transact(|_, state| {
            let delta = state.locks().acquire_delta(path, user, branch)?;
            let new_lock = delta.added.first().map(|r| r.id());
            Self::record(state, DagId::Locks, delta)?;
            let locks = state.locks();
            match new_lock {
                Some(id) => locks.get(&id),
                None => locks
                    .at_path(path)
                    .into_iter()
                    .find(|l| &l.holder == user)
                    .ok_or_else(|| VeldError::LockNotFound(path.to_string())),
            }
        })
    }

    pub fn unlock(&self, path: &str, user: &UserId) -> VeldResult<()> {
        self.transact(|_, state| {
            state.require_user(user)?;
            let delta = state.locks().release_delta(path, user)?;
            Self::record(state, DagId::Locks, delta)?;
            Ok(())
        })
    }

    /// Held locks (open, waiting or violated).
    pub fn locks(&self) -> Vec<LockInfo> {
        self.read(|s| s.locks().held())
    }

    /// Every lock record, completed ones included.
    pub fn all_locks(&self) -> Vec<LockInfo> {
        self.read(|s| s.locks().all())
    }

    pub fn locks_at(&self, path: &str) -> Vec<LockInfo> {
        self.read(|s| s.locks().at_path(path))
    }

    // -----------------------------------------------------------------------
    // Tags and comments
    // -----------------------------------------------------------------------

    pub fn add_tag(&self, name: &str, csid: &ChangesetId, user: &UserId) -> VeldResult<()> {
        self.transact(|_, state| {
            Self::require_changeset(state, csid)?;
            let delta = state.tags().add_delta(name, csid, Audit::now(user))?;
            Self::record(state, DagId::Tags, delta)?;
            Ok(())
        })
    }

    pub fn remove_tag(&self, name: &str, user: &UserId) -> VeldResult<()> {
        self.transact(|_, state| {
            state.require_user(user)?;
            let delta = state.tags().remove_delta(name)?;
            Self::record(state, DagId::Tags, delta)?;
            Ok(())
        })
    }

    pub fn tags(&self) -> Vec<TagRecord> {
        self.read(|s| s.tags().list())
    }

    pub fn add_comment(&self, csid: &ChangesetId, text: &str, user: &UserId) -> VeldResult<()> {
        self.transact(|_, state| {
            Self::require_changeset(state, csid)?;
            let delta = comment_delta(csid, text, Audit::now(user));
            Self::record(state, DagId::Comments, delta)?;
            Ok(())
        })
    }

    pub fn comments(&self, csid: &ChangesetId) -> Vec<CommentRecord> {
        self.read(|s| comments_on(s.records(DagId::Comments), csid))
    }

    // -----------------------------------------------------------------------
    // Replica comparison and cloning
    // -----------------------------------------------------------------------

    fn id_sets(&self) -> BTreeMap<DagId, BTreeSet<ChangesetId>> {
        self.read(|s| {
            DagId::ALL
                .iter()
                .map(|&dag| (dag, s.dag(dag).ids().cloned().collect()))
                .collect()
        })
    }

    pub fn compare_report(&self, other: &Repository) -> CompareReport {
        let here = self.id_sets();
        let there = other.id_sets();
        let mut report = CompareReport::default();
        for dag in DagId::ALL {
            let empty = BTreeSet::new();
            let a = here.get(&dag).unwrap_or(&empty);
            let b = there.get(&dag).unwrap_or(&empty);
            let only_a: Vec<ChangesetId> = a.difference(b).cloned().collect();
            let only_b: Vec<ChangesetId> = b.difference(a).cloned().collect();
            if !only_a.is_empty() {
                report.only_here.insert(dag, only_a);
            }
            if !only_b.is_empty() {
                report.only_there.insert(dag, only_b);
            }
        }
        report
    }

    /// True if both replicas hold exactly the same changesets in every DAG.
    pub fn compare(&self, other: &Repository) -> bool {
        self.compare_report(other).identical()
    }

    /// Copy every changeset into `target` without ambiguity validation.
    /// Returns how many were new there.
    pub fn clone_into(&self, target: &Repository) -> VeldResult<usize> {
        let source = self.read(|s| s.clone());
        let copied = target.transact(|_, state| {
            let mut copied = 0;
            for dag in DagId::ALL {
                for id in source.dag(dag).ids() {
                    if let Some(cs) = source.changeset(id) {
                        if state.insert(cs.clone())? {
                            copied += 1;
                        }
                    }
                }
            }
            Ok(copied)
        })?;
        info!(from = %self.name, to = %target.name, copied, "cloned");
        Ok(copied)
    }

    // -----------------------------------------------------------------------
    // Remotes
    // -----------------------------------------------------------------------

    fn save_config(&self, config: &RepoConfig) -> VeldResult<()> {
        if let Some(disk) = &self.disk {
            config.save(&disk.config_path())?;
        }
        Ok(())
    }

    fn save_memory(&self, memory: &SyncMemory) -> VeldResult<()> {
        if let Some(disk) = &self.disk {
            memory.save(&disk.sync_path())?;
        }
        Ok(())
    }

    pub fn remote_add(&self, name: &str, path: &str) -> VeldResult<()> {
        let mut config = guard(&self.config);
        if config.remotes.contains_key(name) {
            return Err(VeldError::RemoteAlreadyExists(name.to_string()));
        }
        config.remotes.insert(
            name.to_string(),
            RemoteEntry {
                path: path.to_string(),
            },
        );
        self.save_config(&config)
    }

    pub fn remote_remove(&self, name: &str) -> VeldResult<()> {
        let mut config = guard(&self.config);
        if config.remotes.remove(name).is_none() {
            return Err(VeldError::RemoteNotFound(name.to_string()));
        }
        self.save_config(&config)?;
        drop(config);
        let mut memory = guard(&self.memory);
        memory.forget(name);
        self.save_memory(&memory)
    }

    pub fn remote_list(&self) -> BTreeMap<String, RemoteEntry> {
        guard(&self.config).remotes.clone()
    }

    fn open_remote(&self, name: &str) -> VeldResult<Repository> {
        let path = guard(&self.config)
            .remotes
            .get(name)
            .map(|e| PathBuf::from(&e.path))
            .ok_or_else(|| VeldError::RemoteNotFound(name.to_string()))?;
        Repository::open(&path)
    }

    /// Push to a configured remote, remembering it under its name.
    pub fn push_remote(&self, name: &str, options: &PushOptions) -> VeldResult<SyncReport> {
        let remote = self.open_remote(name)?;
        self.push_as(name, &remote, options)
    }

    pub fn pull_remote(&self, name: &str, options: &PushOptions) -> VeldResult<SyncReport> {
        let remote = self.open_remote(name)?;
        self.pull_as(name, &remote, options)
    }

    // -----------------------------------------------------------------------
    // Push / pull
    // -----------------------------------------------------------------------

    /// Push this replica's history into `peer`.
    pub fn push(&self, peer: &dyn FragSink, options: &PushOptions) -> VeldResult<SyncReport> {
        self.push_as(&peer.peer_name(), peer, options)
    }

    /// Pull `peer`'s history into this replica.
    pub fn pull(&self, peer: &dyn FragSource, options: &PushOptions) -> VeldResult<SyncReport> {
        self.pull_as(&peer.peer_name(), peer, options)
    }

    fn push_as(&self, key: &str, peer: &dyn FragSink, options: &PushOptions) -> VeldResult<SyncReport> {
        let seed = {
            let memory = guard(&self.memory);
            DagId::ALL
                .iter()
                .map(|&dag| (dag, memory.leaves(key, dag)))
                .collect()
        };
        let session = Reconciler::new(&self.settings()).run(self, peer, options, seed)?;
        let summary = session.summary.clone().unwrap_or_default();

        let mut memory = guard(&self.memory);
        for (dag, leaves) in &summary.leaves {
            memory.remember(key, *dag, leaves.clone());
        }
        memory.peers.entry(key.to_string()).or_default().last_push_at = Some(Utc::now());
        self.save_memory(&memory)?;

        Ok(SyncReport {
            peer: key.to_string(),
            applied: summary.applied,
            round_trips: session.round_trips,
            forced: options.forced,
            ambiguous: summary.ambiguous,
        })
    }

    fn pull_as(&self, key: &str, peer: &dyn FragSource, options: &PushOptions) -> VeldResult<SyncReport> {
        // What we have is known exactly, so the first guess is never stale.
        let seed = self.read(|s| DagId::ALL.iter().map(|&dag| (dag, s.leaves(dag))).collect());
        let session = Reconciler::new(&self.settings()).run(peer, self, options, seed)?;
        let summary = session.summary.clone().unwrap_or_default();

        let mut memory = guard(&self.memory);
        for (dag, leaves) in &session.source_leaves {
            memory.remember(key, *dag, leaves.clone());
        }
        memory.peers.entry(key.to_string()).or_default().last_pull_at = Some(Utc::now());
        self.save_memory(&memory)?;

        Ok(SyncReport {
            peer: key.to_string(),
            applied: summary.applied,
            round_trips: session.round_trips,
            forced: options.forced,
            ambiguous: summary.ambiguous,
        })
    }

    /// Apply everything staged for a session. Validation runs on the
    /// complete result before anything becomes visible.
    fn apply_staging(&self, staging: Staging, options: &PushOptions) -> VeldResult<ApplySummary> {
        self.transact(|before, state| {
            let mut applied = Vec::new();
            for dag in DagId::ALL {
                let incoming = staging.changesets.get(&dag).cloned().unwrap_or_default();
                for cs in topo_order(incoming) {
                    let id = cs.id.clone();
                    if state.insert(cs)? {
                        applied.push(id);
                    }
                }
            }

            let new_changesets: Vec<&Changeset> =
                applied.iter().filter_map(|id| state.changeset(id)).collect();
            if let Some(user) = state.first_unknown_user(new_changesets) {
                return Err(VeldError::UnknownUser(user.to_string()));
            }

            let ambiguous: Vec<String> = new_ambiguities(
                &before.branches(),
                &state.branches(),
                options.branch.as_deref(),
            )
            .into_iter()
            .map(|a| a.branch)
            .collect();
            if !ambiguous.is_empty() {
                if !options.forced {
                    warn!(branches = ?ambiguous, "rejecting sync: ambiguous branch heads");
                    return Err(VeldError::AmbiguousHeads {
                        branches: ambiguous,
                    });
                }
                warn!(branches = ?ambiguous, "forced sync leaves branches ambiguous");
            }

            let received: Vec<ChangesetId> = applied
                .iter()
                .filter(|id| state.dag(DagId::VersionControl).contains(id))
                .cloned()
                .collect();
            let before_locks = before.locks();
            for lock in state.locks().resolve_on_receive(&received) {
                if before_locks.get(&lock.id).is_ok_and(|l| l.state.is_held()) {
                    info!(path = %lock.path, lock = %lock.id.short(), "lock completed");
                }
            }
            for lock in state.locks().held() {
                if lock.state == LockState::Waiting {
                    debug!(path = %lock.path, lock = %lock.id.short(), "lock waiting for its commit");
                }
            }

            let leaves = DagId::ALL.iter().map(|&dag| (dag, state.leaves(dag))).collect();
            Ok(ApplySummary {
                applied,
                ambiguous,
                leaves,
            })
        })
    }
}

impl FragSource for Repository {
    fn peer_name(&self) -> String {
        self.name.clone()
    }

    fn leaves(&self, dag: DagId) -> VeldResult<Vec<ChangesetId>> {
        Ok(Repository::leaves(self, dag))
    }

    fn branch_heads(&self, branch: &str) -> VeldResult<Vec<ChangesetId>> {
        Ok(self.read(|s| s.branches().available_heads(branch).into_iter().collect()))
    }

    fn build_frag(
        &self,
        dag: DagId,
        from: &[ChangesetId],
        guess: &BTreeSet<ChangesetId>,
        sent: &BTreeSet<ChangesetId>,
    ) -> VeldResult<Dagfrag> {
        self.read(|s| {
            Dagfrag::build(
                dag,
                s.dag(dag),
                |id| s.changeset(id).cloned(),
                from,
                guess,
                sent,
            )
        })
    }
}

impl FragSink for Repository {
    fn peer_name(&self) -> String {
        self.name.clone()
    }

    fn begin(&self) -> VeldResult<SessionId> {
        let id = SessionId::generate();
        guard(&self.sessions).insert(id.clone(), Staging::default());
        debug!(session = %id, repo = %self.name, "staging opened");
        Ok(id)
    }

    fn offer(&self, session: &SessionId, frag: &Dagfrag) -> VeldResult<OfferReply> {
        let mut sessions = guard(&self.sessions);
        let staging = sessions
            .get_mut(session)
            .ok_or_else(|| VeldError::SessionNotFound(session.to_string()))?;

        for cs in &frag.changesets {
            if cs.dag != frag.dag || !cs.verify() {
                return Err(VeldError::CorruptChangeset(cs.id.to_string()));
            }
        }

        self.read(|state| {
            for cs in &frag.changesets {
                if !state.contains(&cs.id) && staging.ids.insert(cs.id.clone()) {
                    staging
                        .changesets
                        .entry(frag.dag)
                        .or_default()
                        .push(cs.clone());
                }
            }
            let missing = frag
                .boundary
                .iter()
                .filter(|id| !state.contains(id) && !staging.ids.contains(*id))
                .cloned()
                .collect();
            Ok(OfferReply {
                missing,
                leaves: state.leaves(frag.dag),
            })
        })
    }

    fn commit(&self, session: &SessionId, options: &PushOptions) -> VeldResult<ApplySummary> {
        let staging = guard(&self.sessions)
            .remove(session)
            .ok_or_else(|| VeldError::SessionNotFound(session.to_string()))?;
        self.apply_staging(staging, options)
    }

    fn abort(&self, session: &SessionId) -> VeldResult<()> {
        if guard(&self.sessions).remove(session).is_some() {
            debug!(session = %session, repo = %self.name, "staging dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (Repository, UserId, ChangesetId) {
        let repo = Repository::in_memory("test");
        let user = repo.create_user("alice").unwrap();
        let mut tree = Tree::new();
        tree.add_file("a.txt", b"hello").unwrap();
        let root = repo
            .commit(CommitRequest::new(&user, "initial", tree).on_branch("master"))
            .unwrap();
        (repo, user, root)
    }

    #[test]
    fn test_init_and_open() {
        let dir = tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        assert!(dir.path().join(".veld/changesets").is_dir());
        assert!(dir.path().join(".veld/dags.json").exists());
        assert!(matches!(
            Repository::init(dir.path()),
            Err(VeldError::AlreadyExists(_))
        ));
        Repository::open(dir.path()).unwrap();
    }

    #[test]
    fn test_open_non_repo() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Repository::open(dir.path()),
            Err(VeldError::NotARepo)
        ));
    }

    #[test]
    fn test_commit_advances_branch() {
        let (repo, user, root) = setup();
        let mut tree = repo.tree(&RevSpec::Id(root.to_string())).unwrap();
        tree.modify("a.txt", b"changed").unwrap();
        let next = repo
            .commit(CommitRequest::new(&user, "second", tree).parent(&root).on_branch("master"))
            .unwrap();

        assert_eq!(repo.branch("master").unwrap().heads, vec![next.clone()]);
        assert_eq!(repo.resolve(&RevSpec::Branch("master".into())).unwrap(), next);
        assert_eq!(repo.revno(&next), Some(2));
        assert!(repo.is_ancestor(&root, &next));
        assert_eq!(repo.log()[0].0, 2);
    }

    #[test]
    fn test_commit_unknown_user_changes_nothing() {
        let (repo, _user, root) = setup();
        let before = repo.leaves(DagId::VersionControl);
        let err = repo
            .commit(CommitRequest::new(&UserId::generate(), "x", Tree::new()).parent(&root))
            .unwrap_err();
        assert!(matches!(err, VeldError::UnknownUser(_)));
        assert_eq!(repo.leaves(DagId::VersionControl), before);
    }

    #[test]
    fn test_commit_missing_parent_is_rejected() {
        let (repo, user, _root) = setup();
        let ghost = ChangesetId::parse(&"ef".repeat(32)).unwrap();
        let err = repo
            .commit(CommitRequest::new(&user, "x", Tree::new()).parent(&ghost))
            .unwrap_err();
        assert!(matches!(err, VeldError::MissingParent { .. }));
    }

    #[test]
    fn test_status_between_revisions() {
        let (repo, user, root) = setup();
        let mut tree = repo.tree(&RevSpec::Branch("master".into())).unwrap();
        tree.rename("a.txt", "b.txt").unwrap();
        tree.add_file("c.txt", b"c").unwrap();
        let next = repo
            .commit(CommitRequest::new(&user, "move", tree).parent(&root).on_branch("master"))
            .unwrap();

        let changes = repo
            .status(&RevSpec::Id(root.to_string()), &RevSpec::Id(next.to_string()))
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path, "b.txt");
        assert_eq!(changes[0].old_path.as_deref(), Some("a.txt"));
        assert_eq!(changes[1].path, "c.txt");
    }

    #[test]
    fn test_branch_operations() {
        let (repo, user, root) = setup();
        // an unrelated root, so the two heads are mutually unreachable
        let other = repo
            .commit(CommitRequest::new(&user, "side", Tree::new()))
            .unwrap();

        repo.add_head("master", &other, &user).unwrap();
        assert!(repo.branch("master").unwrap().needs_merge);

        repo.move_head("master", &other, &root, &user).unwrap();
        assert_eq!(repo.branch("master").unwrap().heads, vec![root.clone()]);

        repo.close_branch("master", &user).unwrap();
        assert!(repo.branch("master").unwrap().closed);
        repo.reopen_branch("master", &user).unwrap();
        assert!(!repo.branch("master").unwrap().closed);

        assert!(matches!(
            repo.remove_head("master", &other, &user),
            Err(VeldError::HeadNotFound { .. })
        ));
        assert_eq!(repo.named_branches()[&root].len(), 1);
    }

    #[test]
    fn test_lock_and_unlock() {
        let (repo, user, _root) = setup();
        let info = repo.lock("a.txt", &user, "master").unwrap();
        assert_eq!(info.state, LockState::Open);
        assert_eq!(repo.locks().len(), 1);
        // re-lock returns the same lock
        assert_eq!(repo.lock("a.txt", &user, "master").unwrap().id, info.id);
        repo.unlock("a.txt", &user).unwrap();
        assert!(repo.locks().is_empty());
        assert!(matches!(
            repo.unlock("a.txt", &user),
            Err(VeldError::AlreadyUnlocked(_))
        ));
    }

    #[test]
    fn test_tags_and_comments() {
        let (repo, user, root) = setup();
        repo.add_tag("v1", &root, &user).unwrap();
        assert_eq!(repo.resolve(&RevSpec::Tag("v1".into())).unwrap(), root);
        repo.add_comment(&root, "looks good", &user).unwrap();
        assert_eq!(repo.comments(&root)[0].text, "looks good");
        repo.remove_tag("v1", &user).unwrap();
        assert!(repo.tags().is_empty());
    }

    #[test]
    fn test_clone_and_compare() {
        let (repo, _user, _root) = setup();
        let copy = Repository::in_memory("copy");
        assert!(!repo.compare(&copy));
        let copied = repo.clone_into(&copy).unwrap();
        assert!(copied >= 3);
        assert!(repo.compare(&copy));
        assert_eq!(repo.clone_into(&copy).unwrap(), 0);
    }

    #[test]
    fn test_on_disk_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let root_id = {
            let repo = Repository::init(dir.path()).unwrap();
            let user = repo.create_user("alice").unwrap();
            let mut tree = Tree::new();
            tree.add_file("a.txt", b"x").unwrap();
            let id = repo
                .commit(CommitRequest::new(&user, "first", tree).on_branch("master"))
                .unwrap();
            repo.lock("a.txt", &user, "master").unwrap();
            id
        };
        let repo = Repository::open(dir.path()).unwrap();
        assert_eq!(repo.resolve(&RevSpec::Branch("master".into())).unwrap(), root_id);
        assert_eq!(repo.locks().len(), 1);
        assert_eq!(repo.users().len(), 1);
    }

    #[test]
    fn test_remote_config() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        repo.remote_add("origin", "/srv/origin").unwrap();
        assert!(matches!(
            repo.remote_add("origin", "/elsewhere"),
            Err(VeldError::RemoteAlreadyExists(_))
        ));
        let reopened = Repository::open(dir.path()).unwrap();
        assert_eq!(reopened.remote_list()["origin"].path, "/srv/origin");
        reopened.remote_remove("origin").unwrap();
        assert!(matches!(
            reopened.remote_remove("origin"),
            Err(VeldError::RemoteNotFound(_))
        ));
    }
}

//! Locks: advisory, eventually consistent claims on versioned objects.
//!
//! A lock is a pair of records in the locks DAG: the acquisition, and
//! zero or more end records naming the commit that completed it. Lock
//! state is never stored; it is derived on every query from those
//! records and from what the version-control DAG of this replica knows:
//!
//! - **Open**: no end record.
//! - **Waiting**: an end record exists, but its commit is not present
//!   here or is not yet an ancestor of an available head of the lock's
//!   branch (including the case where the branch has no heads at all).
//! - **Completed**: the end commit is an ancestor of an available head
//!   of the lock's branch. Completed locks are no longer held.
//! - **Violated**: an open lock whose object was changed by another user
//!   in a commit that is not an ancestor of the lock's start. Reported,
//!   never enforced.
//!
//! Locks are keyed by object identity; the path shown is recomputed from
//! the branch head's tree, so renames keep the lock.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::changeset::{ChangesetId, DagId};
use crate::error::{VeldError, VeldResult};
use crate::records::{Audit, Record, RecordDelta, RecordId};
use crate::state::{RepoState, RevSpec};
use crate::tree::{ChangeKind, ObjectId, PathChange};
use crate::users::UserId;

/// `audit.user` locked `object` on `branch`, as of head `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockRecord {
    pub object: ObjectId,
    /// Path at acquisition. Display uses the current path when known.
    pub path: String,
    pub branch: String,
    pub start: ChangesetId,
    pub audit: Audit,
}

/// Lock `lock` was completed by commit `end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockEndRecord {
    pub lock: RecordId,
    pub end: ChangesetId,
    pub audit: Audit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Open,
    Waiting,
    Completed,
    Violated,
}

impl LockState {
    pub fn is_held(self) -> bool {
        self != LockState::Completed
    }
}

/// A lock as seen from this replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: RecordId,
    pub object: ObjectId,
    pub path: String,
    pub holder: UserId,
    pub branch: String,
    pub start: ChangesetId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<ChangesetId>,
    pub state: LockState,
    pub acquired_at: DateTime<Utc>,
    /// The one lock that wins precedence among the held locks on its object.
    pub effective: bool,
}

/// Read view over the locks DAG, plus builders for record deltas.
pub struct LockRegistry<'a> {
    state: &'a RepoState,
}

impl<'a> LockRegistry<'a> {
    pub fn new(state: &'a RepoState) -> Self {
        Self { state }
    }

    fn acquisitions(&self) -> impl Iterator<Item = (&'a RecordId, &'a LockRecord)> {
        self.state
            .records(DagId::Locks)
            .iter()
            .filter_map(|(id, r)| match r {
                Record::LockAcquired(l) => Some((id, l)),
                _ => None,
            })
    }

    fn ends(&self) -> BTreeMap<&'a RecordId, Vec<(&'a RecordId, &'a LockEndRecord)>> {
        let mut out: BTreeMap<&RecordId, Vec<(&RecordId, &LockEndRecord)>> = BTreeMap::new();
        for (id, r) in self.state.records(DagId::Locks).iter() {
            if let Record::LockEnded(e) = r {
                out.entry(&e.lock).or_default().push((id, e));
            }
        }
        out
    }

    fn display_path(&self, lock: &LockRecord) -> String {
        for head in self.state.branches().available_heads(&lock.branch) {
            if let Some(path) = self.state.tree(&head).and_then(|t| t.path_of(&lock.object)) {
                return path.to_string();
            }
        }
        lock.path.clone()
    }

    fn is_violated(&self, lock: &LockRecord) -> bool {
        let vc = self.state.dag(DagId::VersionControl);
        if !vc.contains(&lock.start) {
            return false;
        }
        self.state.content_touches(&lock.object).iter().any(|csid| {
            self.state.author(csid) != Some(&lock.audit.user) && !vc.is_ancestor(csid, &lock.start)
        })
    }

    fn evaluate(&self, id: &RecordId, lock: &LockRecord, ends: &[(&RecordId, &LockEndRecord)]) -> LockInfo {
        let vc = self.state.dag(DagId::VersionControl);
        let heads = self.state.branches().available_heads(&lock.branch);

        let completed_by = ends
            .iter()
            .map(|(_, e)| &e.end)
            .find(|end| vc.contains(end) && vc.is_ancestor_of_any(end, heads.iter()));
        let (state, end) = match (completed_by, ends.first()) {
            (Some(end), _) => (LockState::Completed, Some(end.clone())),
            (None, Some((_, e))) => (LockState::Waiting, Some(e.end.clone())),
            (None, None) if self.is_violated(lock) => (LockState::Violated, None),
            (None, None) => (LockState::Open, None),
        };

        LockInfo {
            id: id.clone(),
            object: lock.object.clone(),
            path: self.display_path(lock),
            holder: lock.audit.user.clone(),
            branch: lock.branch.clone(),
            start: lock.start.clone(),
            end,
            state,
            acquired_at: lock.audit.when,
            effective: false,
        }
    }

    /// Every lock record, completed ones included, with precedence marked.
    pub fn all(&self) -> Vec<LockInfo> {
        let ends = self.ends();
        let mut locks: Vec<LockInfo> = self
            .acquisitions()
            .map(|(id, lock)| {
                let lock_ends = ends.get(id).map(Vec::as_slice).unwrap_or(&[]);
                self.evaluate(id, lock, lock_ends)
            })
            .collect();
        mark_effective(&mut locks);
        locks.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| precedence(a, b)));
        locks
    }

    /// Locks that are still held (not completed).
    pub fn held(&self) -> Vec<LockInfo> {
        self.all().into_iter().filter(|l| l.state.is_held()).collect()
    }

    pub fn held_on(&self, object: &ObjectId) -> Vec<LockInfo> {
        self.held().into_iter().filter(|l| &l.object == object).collect()
    }

    pub fn at_path(&self, path: &str) -> Vec<LockInfo> {
        self.held().into_iter().filter(|l| l.path == path).collect()
    }

    pub fn get(&self, id: &RecordId) -> VeldResult<LockInfo> {
        self.all()
            .into_iter()
            .find(|l| &l.id == id)
            .ok_or_else(|| VeldError::LockNotFound(id.to_string()))
    }

    /// Delta locking `path` on the single available head of `branch`.
    ///
    /// Fails with `LockHeld` if a different user holds a non-violated lock
    /// on the object. Re-locking something the user already holds open on
    /// the same branch yields an empty delta.
    pub fn acquire_delta(&self, path: &str, user: &UserId, branch: &str) -> VeldResult<RecordDelta> {
        self.state.require_user(user)?;
        let start = self.state.resolve(&RevSpec::Branch(branch.to_string()))?;
        let tree = self
            .state
            .tree(&start)
            .ok_or_else(|| VeldError::ChangesetNotFound(start.to_string()))?;
        let object = tree
            .object_at(path)
            .ok_or_else(|| VeldError::NotVersioned(path.to_string()))?;

        let mut delta = RecordDelta::default();
        for held in self.held_on(object) {
            if held.holder != *user && held.state != LockState::Violated {
                return Err(VeldError::LockHeld {
                    path: path.to_string(),
                    holder: self.state.users().display(&held.holder),
                });
            }
            if held.holder == *user && held.state == LockState::Open && held.branch == branch {
                return Ok(delta);
            }
        }

        delta.add(Record::LockAcquired(LockRecord {
            object: object.clone(),
            path: tree.path_of(object).unwrap_or(path).to_string(),
            branch: branch.to_string(),
            start,
            audit: Audit::now(user),
        }));
        Ok(delta)
    }

    /// Delta dropping the user's held locks on `path`.
    ///
    /// Succeeds with an empty delta when the user's lock there was already
    /// completed by a commit. Otherwise fails with `LockNotFound` when only
    /// other users hold locks on the path and `AlreadyUnlocked` when
    /// nobody does.
    pub fn release_delta(&self, path: &str, user: &UserId) -> VeldResult<RecordDelta> {
        let all = self.all();
        let mut delta = RecordDelta::default();
        let mut completed = false;
        let mut others = false;
        for lock in all.iter().filter(|l| l.path == path) {
            if lock.holder != *user {
                others |= lock.state.is_held();
            } else if lock.state.is_held() {
                delta.extend(self.remove_lock_delta(&lock.id));
            } else {
                completed = true;
            }
        }
        if !delta.is_empty() || completed {
            return Ok(delta);
        }
        if others {
            Err(VeldError::LockNotFound(path.to_string()))
        } else {
            Err(VeldError::AlreadyUnlocked(path.to_string()))
        }
    }

    /// Delta removing a lock record and all its end records.
    pub fn remove_lock_delta(&self, lock: &RecordId) -> RecordDelta {
        let mut delta = RecordDelta::default();
        if self.state.records(DagId::Locks).contains(lock) {
            delta.remove(lock.clone());
        }
        if let Some(ends) = self.ends().get(lock) {
            for (id, _) in ends {
                delta.remove((*id).clone());
            }
        }
        delta
    }

    /// Delta resolving the committer's locks against a new commit.
    ///
    /// Deleting an object drops every lock the author holds on it.
    /// Changing its content ends the author's open or violated locks on
    /// it, which completes them as soon as the commit is an ancestor of a
    /// head of the lock's branch. Moves leave locks alone. With `branch` set, only
    /// locks on that branch are considered.
    pub fn resolve_on_commit(
        &self,
        commit: &ChangesetId,
        author: &UserId,
        branch: Option<&str>,
        changes: &[PathChange],
    ) -> RecordDelta {
        let mut delta = RecordDelta::default();
        let mine: Vec<LockInfo> = self
            .all()
            .into_iter()
            .filter(|l| &l.holder == author && branch.map_or(true, |b| l.branch == b))
            .collect();

        for change in changes {
            for lock in mine.iter().filter(|l| l.object == change.object) {
                match change.kind {
                    ChangeKind::Deleted => delta.extend(self.remove_lock_delta(&lock.id)),
                    ChangeKind::Modified | ChangeKind::MovedModified
                        if matches!(lock.state, LockState::Open | LockState::Violated) =>
                    {
                        delta.add(Record::LockEnded(LockEndRecord {
                            lock: lock.id.clone(),
                            end: commit.clone(),
                            audit: Audit::now(author),
                        }));
                    }
                    _ => {}
                }
            }
        }
        delta
    }

    /// Locks completed by the arrival of `received`: those whose end
    /// commit is one of them or an ancestor of one.
    pub fn resolve_on_receive(&self, received: &[ChangesetId]) -> Vec<LockInfo> {
        let vc = self.state.dag(DagId::VersionControl);
        self.all()
            .into_iter()
            .filter(|l| l.state == LockState::Completed)
            .filter(|l| {
                l.end
                    .as_ref()
                    .is_some_and(|end| received.iter().any(|r| vc.is_ancestor(end, r)))
            })
            .collect()
    }
}

/// Non-violated first, then open before waiting, then oldest, then by id.
fn precedence(a: &LockInfo, b: &LockInfo) -> std::cmp::Ordering {
    let rank = |l: &LockInfo| match l.state {
        LockState::Open => 0,
        LockState::Waiting => 1,
        LockState::Violated => 2,
        LockState::Completed => 3,
    };
    rank(a)
        .cmp(&rank(b))
        .then_with(|| a.acquired_at.cmp(&b.acquired_at))
        .then_with(|| a.id.cmp(&b.id))
}

fn mark_effective(locks: &mut [LockInfo]) {
    let mut best: BTreeMap<ObjectId, usize> = BTreeMap::new();
    for (i, lock) in locks.iter().enumerate() {
        if !lock.state.is_held() {
            continue;
        }
        match best.get(&lock.object) {
            Some(&j) if precedence(&locks[j], lock).is_le() => {}
            _ => {
                best.insert(lock.object.clone(), i);
            }
        }
    }
    for i in best.into_values() {
        locks[i].effective = true;
    }
}

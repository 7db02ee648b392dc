//! Replica state: changesets, per-DAG indexes and folded record sets.
//!
//! `RepoState` is the unit a transaction stages: the repository clones
//! it, applies every change to the clone and swaps the clone in only when
//! the whole operation succeeded. Changesets are shared behind `Arc`, so
//! a clone copies pointers, not payloads.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::branch::BranchRegistry;
use crate::changeset::{Changeset, ChangesetId, DagId, Payload};
use crate::dag::DagIndex;
use crate::error::{VeldError, VeldResult};
use crate::lock::LockRegistry;
use crate::records::{RecordDelta, RecordSet};
use crate::tags::TagRegistry;
use crate::tree::{diff_trees, ObjectId, PathChange, Tree};
use crate::users::{UserDirectory, UserId};

/// A way of naming a version-control changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "lowercase")]
pub enum RevSpec {
    /// Full id or unique hex prefix.
    Id(String),
    /// Replica-local revision number.
    Revno(u64),
    /// The single available head of a branch.
    Branch(String),
    Tag(String),
}

impl FromStr for RevSpec {
    type Err = String;

    /// `r:<n>`, `b:<branch>`, `t:<tag>`, or a hex id prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(n) = s.strip_prefix("r:") {
            return n
                .parse::<u64>()
                .map(RevSpec::Revno)
                .map_err(|_| format!("invalid revno: '{n}'"));
        }
        if let Some(b) = s.strip_prefix("b:") {
            return Ok(RevSpec::Branch(b.to_string()));
        }
        if let Some(t) = s.strip_prefix("t:") {
            return Ok(RevSpec::Tag(t.to_string()));
        }
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(RevSpec::Id(s.to_lowercase()));
        }
        Err(format!("invalid revision spec: '{s}'"))
    }
}

/// Everything one replica knows.
#[derive(Debug, Clone, Default)]
pub struct RepoState {
    changesets: HashMap<ChangesetId, Arc<Changeset>>,
    dags: [DagIndex; 6],
    records: [RecordSet; 6],
    /// Commits that changed or deleted each object, in insertion order.
    touches: HashMap<ObjectId, Vec<ChangesetId>>,
}

impl RepoState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a changeset. Returns `false` if it was already present.
    pub fn insert(&mut self, cs: Changeset) -> VeldResult<bool> {
        if self.changesets.contains_key(&cs.id) {
            return Ok(false);
        }
        if !cs.verify() {
            return Err(VeldError::CorruptChangeset(cs.id.to_string()));
        }
        self.dags[cs.dag.index()].add_node(&cs.id, &cs.parents)?;

        match &cs.payload {
            Payload::Commit(commit) => {
                let touched: Vec<ObjectId> = {
                    let empty = Tree::new();
                    let base = cs
                        .parents
                        .first()
                        .and_then(|p| self.tree(p))
                        .unwrap_or(&empty);
                    diff_trees(base, &commit.tree)
                        .into_iter()
                        .filter(|c| c.kind.touches_content())
                        .map(|c| c.object)
                        .collect()
                };
                for object in touched {
                    self.touches.entry(object).or_default().push(cs.id.clone());
                }
            }
            Payload::Records(delta) => self.records[cs.dag.index()].apply(delta),
        }

        self.changesets.insert(cs.id.clone(), Arc::new(cs));
        Ok(true)
    }

    pub fn contains(&self, id: &ChangesetId) -> bool {
        self.changesets.contains_key(id)
    }

    pub fn changeset(&self, id: &ChangesetId) -> Option<&Changeset> {
        self.changesets.get(id).map(|cs| cs.as_ref())
    }

    pub fn dag(&self, dag: DagId) -> &DagIndex {
        &self.dags[dag.index()]
    }

    pub fn records(&self, dag: DagId) -> &RecordSet {
        &self.records[dag.index()]
    }

    /// Leaves of a DAG, sorted.
    pub fn leaves(&self, dag: DagId) -> Vec<ChangesetId> {
        self.dag(dag).leaves().iter().cloned().collect()
    }

    pub fn tree(&self, csid: &ChangesetId) -> Option<&Tree> {
        self.changeset(csid).and_then(|cs| cs.commit()).map(|c| &c.tree)
    }

    pub fn author(&self, csid: &ChangesetId) -> Option<&UserId> {
        self.changeset(csid).and_then(|cs| cs.commit()).map(|c| &c.author)
    }

    /// Object changes a commit made relative to its first parent.
    pub fn changes(&self, csid: &ChangesetId) -> Option<Vec<PathChange>> {
        let cs = self.changeset(csid)?;
        let commit = cs.commit()?;
        let empty = Tree::new();
        let base = cs
            .parents
            .first()
            .and_then(|p| self.tree(p))
            .unwrap_or(&empty);
        Some(diff_trees(base, &commit.tree))
    }

    pub fn content_touches(&self, object: &ObjectId) -> &[ChangesetId] {
        self.touches.get(object).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn branches(&self) -> BranchRegistry<'_> {
        BranchRegistry::new(self.records(DagId::Branches), self.dag(DagId::VersionControl))
    }

    pub fn users(&self) -> UserDirectory<'_> {
        UserDirectory::new(self.records(DagId::Users))
    }

    pub fn tags(&self) -> TagRegistry<'_> {
        TagRegistry::new(self.records(DagId::Tags))
    }

    pub fn locks(&self) -> LockRegistry<'_> {
        LockRegistry::new(self)
    }

    /// A record changeset on top of every current leaf of `dag`.
    pub fn record_changeset(&self, dag: DagId, delta: RecordDelta) -> Changeset {
        Changeset::new(dag, self.leaves(dag), Payload::Records(delta))
    }

    /// First user referenced by `changesets` that this state does not know.
    pub fn first_unknown_user<'c>(
        &self,
        changesets: impl IntoIterator<Item = &'c Changeset>,
    ) -> Option<UserId> {
        let users = self.users();
        changesets
            .into_iter()
            .flat_map(|cs| cs.referenced_users())
            .find(|u| !users.contains(u))
            .cloned()
    }

    pub fn require_user(&self, user: &UserId) -> VeldResult<()> {
        if self.users().contains(user) {
            Ok(())
        } else {
            Err(VeldError::UnknownUser(user.to_string()))
        }
    }

    /// Resolve a revision spec to a version-control changeset.
    pub fn resolve(&self, spec: &RevSpec) -> VeldResult<ChangesetId> {
        let vc = self.dag(DagId::VersionControl);
        match spec {
            RevSpec::Id(prefix) => {
                let mut matches = vc.ids().filter(|id| id.as_str().starts_with(prefix.as_str()));
                match (matches.next(), matches.next()) {
                    (Some(id), None) => Ok(id.clone()),
                    (Some(_), Some(_)) => Err(VeldError::UnknownRevision(format!(
                        "ambiguous prefix {prefix}"
                    ))),
                    (None, _) => Err(VeldError::UnknownRevision(prefix.clone())),
                }
            }
            RevSpec::Revno(n) => vc
                .revno_to_id(*n)
                .cloned()
                .ok_or_else(|| VeldError::UnknownRevision(format!("r:{n}"))),
            RevSpec::Branch(name) => {
                let branches = self.branches();
                if !branches.exists(name) {
                    return Err(VeldError::BranchNotFound(name.clone()));
                }
                let heads = branches.available_heads(name);
                let mut iter = heads.into_iter();
                match (iter.next(), iter.next()) {
                    (Some(head), None) => Ok(head),
                    (Some(_), Some(_)) => Err(VeldError::AmbiguousHeads {
                        branches: vec![name.clone()],
                    }),
                    (None, _) => Err(VeldError::UnknownRevision(format!(
                        "branch {name} has no available head"
                    ))),
                }
            }
            RevSpec::Tag(name) => self
                .tags()
                .resolve(name)
                .filter(|id| vc.contains(id))
                .cloned()
                .ok_or_else(|| VeldError::UnknownRevision(format!("tag {name}"))),
        }
    }
}

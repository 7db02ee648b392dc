//! Branches: named, mutable sets of head changesets.
//!
//! Head membership lives in the branches DAG as records. A branch may
//! have no heads, one head, or several (needs merge). A recorded head is
//! stale when another recorded head of the same branch descends from it;
//! stale heads are hidden from every query and dropped from the record
//! set the next time this replica moves the branch.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::changeset::ChangesetId;
use crate::dag::DagIndex;
use crate::error::{VeldError, VeldResult};
use crate::records::{Audit, Record, RecordDelta, RecordId, RecordSet};

/// `branch` has `csid` as a head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeadRecord {
    pub branch: String,
    pub csid: ChangesetId,
    pub audit: Audit,
}

/// `branch` is closed. Closing keeps the head records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClosedRecord {
    pub branch: String,
    pub audit: Audit,
}

/// Summary of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub heads: Vec<ChangesetId>,
    pub closed: bool,
    pub needs_merge: bool,
}

/// One recorded head and whether this replica has its changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadStatus {
    pub branch: String,
    pub csid: ChangesetId,
    pub available: bool,
}

/// A branch whose heads are not mutually reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiguity {
    pub branch: String,
    pub heads: Vec<ChangesetId>,
}

/// Read view over the branches DAG, plus builders for record deltas.
pub struct BranchRegistry<'a> {
    records: &'a RecordSet,
    vc: &'a DagIndex,
}

impl<'a> BranchRegistry<'a> {
    pub fn new(records: &'a RecordSet, vc: &'a DagIndex) -> Self {
        Self { records, vc }
    }

    fn head_records(&self, branch: &str) -> Vec<(&'a RecordId, &'a HeadRecord)> {
        self.records
            .iter()
            .filter_map(|(id, r)| match r {
                Record::BranchHead(h) if h.branch == branch => Some((id, h)),
                _ => None,
            })
            .collect()
    }

    fn closed_records(&self, branch: &str) -> Vec<&'a RecordId> {
        self.records
            .iter()
            .filter_map(|(id, r)| match r {
                Record::BranchClosed(c) if c.branch == branch => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Every branch name with head or closed records.
    pub fn names(&self) -> BTreeSet<String> {
        self.records
            .iter()
            .filter_map(|(_, r)| match r {
                Record::BranchHead(h) => Some(h.branch.clone()),
                Record::BranchClosed(c) => Some(c.branch.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn exists(&self, branch: &str) -> bool {
        self.names().contains(branch)
    }

    /// Head ids as recorded, stale ones included.
    pub fn recorded_heads(&self, branch: &str) -> BTreeSet<ChangesetId> {
        self.head_records(branch)
            .into_iter()
            .map(|(_, h)| h.csid.clone())
            .collect()
    }

    /// Heads whose changesets are present here, stale ones removed.
    pub fn available_heads(&self, branch: &str) -> BTreeSet<ChangesetId> {
        self.vc.reduce_to_heads(&self.recorded_heads(branch))
    }

    /// Effective heads: available non-stale heads plus heads whose
    /// changesets this replica does not have yet.
    pub fn heads(&self, branch: &str) -> BTreeSet<ChangesetId> {
        let recorded = self.recorded_heads(branch);
        let mut heads = self.vc.reduce_to_heads(&recorded);
        heads.extend(recorded.into_iter().filter(|id| !self.vc.contains(id)));
        heads
    }

    pub fn is_closed(&self, branch: &str) -> bool {
        !self.closed_records(branch).is_empty()
    }

    pub fn info(&self, branch: &str) -> VeldResult<BranchInfo> {
        if !self.exists(branch) {
            return Err(VeldError::BranchNotFound(branch.to_string()));
        }
        let heads: Vec<ChangesetId> = self.heads(branch).into_iter().collect();
        Ok(BranchInfo {
            name: branch.to_string(),
            needs_merge: self.available_heads(branch).len() > 1,
            closed: self.is_closed(branch),
            heads,
        })
    }

    pub fn list(&self) -> Vec<BranchInfo> {
        self.names()
            .iter()
            .filter_map(|name| self.info(name).ok())
            .collect()
    }

    /// Reverse index: changeset -> branches it heads.
    pub fn named_branches(&self) -> BTreeMap<ChangesetId, BTreeMap<String, bool>> {
        let mut out: BTreeMap<ChangesetId, BTreeMap<String, bool>> = BTreeMap::new();
        for name in self.names() {
            for head in self.heads(&name) {
                out.entry(head).or_default().insert(name.clone(), true);
            }
        }
        out
    }

    /// Every effective head of every branch with its availability.
    pub fn heads_report(&self) -> Vec<HeadStatus> {
        let mut out = Vec::new();
        for name in self.names() {
            for csid in self.heads(&name) {
                out.push(HeadStatus {
                    branch: name.clone(),
                    available: self.vc.contains(&csid),
                    csid,
                });
            }
        }
        out
    }

    /// Append a head record. Other heads are left alone.
    pub fn add_head_delta(&self, branch: &str, csid: &ChangesetId, audit: Audit) -> RecordDelta {
        let mut delta = RecordDelta::default();
        if self.recorded_heads(branch).contains(csid) {
            return delta;
        }
        delta.add(Record::BranchHead(HeadRecord {
            branch: branch.to_string(),
            csid: csid.clone(),
            audit,
        }));
        delta
    }

    pub fn remove_head_delta(&self, branch: &str, csid: &ChangesetId) -> VeldResult<RecordDelta> {
        let mut delta = RecordDelta::default();
        for (id, head) in self.head_records(branch) {
            if &head.csid == csid {
                delta.remove(id.clone());
            }
        }
        if delta.is_empty() {
            return Err(VeldError::HeadNotFound {
                branch: branch.to_string(),
                csid: csid.to_string(),
            });
        }
        Ok(delta)
    }

    /// Remove `from` and add `to` in a single delta.
    pub fn move_head_delta(
        &self,
        branch: &str,
        from: &ChangesetId,
        to: &ChangesetId,
        audit: Audit,
    ) -> VeldResult<RecordDelta> {
        let mut delta = self.remove_head_delta(branch, from)?;
        if from == to {
            return Ok(RecordDelta::default());
        }
        delta.extend(self.add_head_delta(branch, to, audit));
        Ok(delta)
    }

    /// Record `csid` as the branch's new tip: drop every recorded head it
    /// descends from (stale ones included) and add it.
    pub fn advance_delta(&self, branch: &str, csid: &ChangesetId, audit: Audit) -> RecordDelta {
        let mut delta = RecordDelta::default();
        for (id, head) in self.head_records(branch) {
            if &head.csid != csid && self.vc.is_ancestor(&head.csid, csid) {
                delta.remove(id.clone());
            }
        }
        delta.extend(self.add_head_delta(branch, csid, audit));
        delta
    }

    /// Drop head records that are ancestors of other heads of the branch.
    pub fn prune_stale_delta(&self, branch: &str) -> RecordDelta {
        let live = self.available_heads(branch);
        let mut delta = RecordDelta::default();
        for (id, head) in self.head_records(branch) {
            if self.vc.contains(&head.csid) && !live.contains(&head.csid) {
                delta.remove(id.clone());
            }
        }
        delta
    }

    pub fn close_delta(&self, branch: &str, audit: Audit) -> VeldResult<RecordDelta> {
        if !self.exists(branch) {
            return Err(VeldError::BranchNotFound(branch.to_string()));
        }
        let mut delta = RecordDelta::default();
        if !self.is_closed(branch) {
            delta.add(Record::BranchClosed(ClosedRecord {
                branch: branch.to_string(),
                audit,
            }));
        }
        Ok(delta)
    }

    pub fn reopen_delta(&self, branch: &str) -> VeldResult<RecordDelta> {
        if !self.exists(branch) {
            return Err(VeldError::BranchNotFound(branch.to_string()));
        }
        let mut delta = RecordDelta::default();
        for id in self.closed_records(branch) {
            delta.remove(id.clone());
        }
        Ok(delta)
    }
}

/// Branches that `after` leaves ambiguous where `before` did not.
///
/// A branch is reported when its available heads in `after` are two or
/// more (mutually unreachable by construction) and at least one of them
/// is new: neither a head in `before` nor a descendant of one. Reachability
/// is judged against `after`'s DAG. Fast-forwards of any existing head,
/// merges and no-ops therefore never count, whatever the raw leaf counts
/// are. With `only` set, every other branch is ignored.
pub fn new_ambiguities(
    before: &BranchRegistry<'_>,
    after: &BranchRegistry<'_>,
    only: Option<&str>,
) -> Vec<Ambiguity> {
    let names: Vec<String> = match only {
        Some(b) => vec![b.to_string()],
        None => after.names().into_iter().collect(),
    };
    let mut out = Vec::new();
    for name in names {
        let heads = after.available_heads(&name);
        if heads.len() < 2 {
            continue;
        }
        let prior = before.heads(&name);
        let is_new = |h: &ChangesetId| !prior.iter().any(|p| after.vc.is_ancestor(p, h));
        if heads.iter().any(is_new) {
            out.push(Ambiguity {
                branch: name,
                heads: heads.into_iter().collect(),
            });
        }
    }
    out
}

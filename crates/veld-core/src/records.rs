//! Record DAGs: users, branches, locks, tags and comments.
//!
//! Each changeset in a record DAG carries a [`RecordDelta`]. The state of
//! the DAG is every record added anywhere minus every record removed
//! anywhere. Tombstones win, which makes the merge of divergent leaves a
//! plain set union and independent of the order replicas saw them in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::branch::{ClosedRecord, HeadRecord};
use crate::changeset::DagId;
use crate::comments::CommentRecord;
use crate::hash::hash_json;
use crate::lock::{LockEndRecord, LockRecord};
use crate::tags::TagRecord;
use crate::users::{UserId, UserRecord};

/// Content hash of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who made a record change, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Audit {
    pub user: UserId,
    pub when: DateTime<Utc>,
}

impl Audit {
    pub fn now(user: &UserId) -> Self {
        Audit {
            user: user.clone(),
            when: Utc::now(),
        }
    }
}

/// A single record in one of the record DAGs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    User(UserRecord),
    BranchHead(HeadRecord),
    BranchClosed(ClosedRecord),
    LockAcquired(LockRecord),
    LockEnded(LockEndRecord),
    Tag(TagRecord),
    Comment(CommentRecord),
}

impl Record {
    pub fn id(&self) -> RecordId {
        RecordId(hash_json(self))
    }

    /// The DAG this kind of record lives in.
    pub fn dag(&self) -> DagId {
        match self {
            Record::User(_) => DagId::Users,
            Record::BranchHead(_) | Record::BranchClosed(_) => DagId::Branches,
            Record::LockAcquired(_) | Record::LockEnded(_) => DagId::Locks,
            Record::Tag(_) => DagId::Tags,
            Record::Comment(_) => DagId::Comments,
        }
    }

    /// The user the record's audit names, if any.
    pub fn user(&self) -> Option<&UserId> {
        match self {
            Record::User(_) => None,
            Record::BranchHead(r) => Some(&r.audit.user),
            Record::BranchClosed(r) => Some(&r.audit.user),
            Record::LockAcquired(r) => Some(&r.audit.user),
            Record::LockEnded(r) => Some(&r.audit.user),
            Record::Tag(r) => Some(&r.audit.user),
            Record::Comment(r) => Some(&r.audit.user),
        }
    }
}

/// Records added and removed by one changeset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordDelta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<Record>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<RecordId>,
}

impl RecordDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn add(&mut self, record: Record) {
        self.added.push(record);
    }

    pub fn remove(&mut self, id: RecordId) {
        if !self.removed.contains(&id) {
            self.removed.push(id);
        }
    }

    /// Append another delta's changes.
    pub fn extend(&mut self, other: RecordDelta) {
        self.added.extend(other.added);
        for id in other.removed {
            self.remove(id);
        }
    }

    /// All records in a delta must belong to the same DAG.
    pub fn dag(&self) -> Option<DagId> {
        self.added.first().map(Record::dag)
    }
}

/// Folded state of one record DAG.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    live: BTreeMap<RecordId, Record>,
    removed: BTreeSet<RecordId>,
}

impl RecordSet {
    pub fn apply(&mut self, delta: &RecordDelta) {
        for id in &delta.removed {
            self.live.remove(id);
            self.removed.insert(id.clone());
        }
        for record in &delta.added {
            let id = record.id();
            if !self.removed.contains(&id) {
                self.live.insert(id, record.clone());
            }
        }
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.live.get(id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.live.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordId, &Record)> {
        self.live.iter()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

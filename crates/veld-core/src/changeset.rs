//! Changesets: immutable, content-addressed DAG vertices.
//!
//! A changeset's id is the SHA-256 of its canonical body (`dag`,
//! `parents`, `payload`). It is derived, never assigned, so replicas
//! agree on ids without coordination.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{VeldError, VeldResult};
use crate::hash::{canonical_bytes, hash_bytes, is_full_hash};
use crate::records::RecordDelta;
use crate::tree::Tree;
use crate::users::UserId;

/// Content hash of a changeset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangesetId(String);

impl ChangesetId {
    pub(crate) fn from_hash(hash: String) -> Self {
        ChangesetId(hash)
    }

    /// Parse a full 64-character id.
    pub fn parse(s: &str) -> VeldResult<Self> {
        if is_full_hash(s) {
            Ok(ChangesetId(s.to_string()))
        } else {
            Err(VeldError::UnknownRevision(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for display.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ChangesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The named partitions of history. Each is synchronized independently.
///
/// Declaration order is dependency order: records in later DAGs may
/// refer to users and version-control changesets, never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DagId {
    Users,
    VersionControl,
    Branches,
    Locks,
    Tags,
    Comments,
}

impl DagId {
    pub const ALL: [DagId; 6] = [
        DagId::Users,
        DagId::VersionControl,
        DagId::Branches,
        DagId::Locks,
        DagId::Tags,
        DagId::Comments,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DagId::Users => "users",
            DagId::VersionControl => "version-control",
            DagId::Branches => "branches",
            DagId::Locks => "locks",
            DagId::Tags => "tags",
            DagId::Comments => "comments",
        }
    }

    /// Every DAG except version control holds record deltas.
    pub fn is_record_dag(self) -> bool {
        self != DagId::VersionControl
    }
}

impl fmt::Display for DagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DagId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "users" => Ok(DagId::Users),
            "version-control" | "vc" | "history" => Ok(DagId::VersionControl),
            "branches" => Ok(DagId::Branches),
            "locks" => Ok(DagId::Locks),
            "tags" => Ok(DagId::Tags),
            "comments" => Ok(DagId::Comments),
            other => Err(format!("unknown dag: '{other}'")),
        }
    }
}

/// A version-control commit: who, when, why, and the full resulting tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitPayload {
    pub author: UserId,
    pub when: DateTime<Utc>,
    pub message: String,
    pub tree: Tree,
}

/// What a changeset carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Commit(CommitPayload),
    Records(RecordDelta),
}

#[derive(Serialize)]
struct BodyRef<'a> {
    dag: DagId,
    parents: &'a [ChangesetId],
    payload: &'a Payload,
}

#[derive(Deserialize)]
struct Body {
    dag: DagId,
    parents: Vec<ChangesetId>,
    payload: Payload,
}

/// An immutable DAG vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: ChangesetId,
    pub dag: DagId,
    /// Ordered; the first parent is the one a commit's changes are
    /// computed against.
    pub parents: Vec<ChangesetId>,
    pub payload: Payload,
}

impl Changeset {
    /// Build a changeset and derive its id. Duplicate parents are dropped,
    /// keeping first occurrence order.
    pub fn new(dag: DagId, parents: Vec<ChangesetId>, payload: Payload) -> Self {
        let mut unique: Vec<ChangesetId> = Vec::with_capacity(parents.len());
        for p in parents {
            if !unique.contains(&p) {
                unique.push(p);
            }
        }
        let bytes = canonical_bytes(&BodyRef {
            dag,
            parents: &unique,
            payload: &payload,
        });
        Changeset {
            id: ChangesetId(hash_bytes(&bytes)),
            dag,
            parents: unique,
            payload,
        }
    }

    /// The canonical body whose hash is the id.
    pub fn body_bytes(&self) -> Vec<u8> {
        canonical_bytes(&BodyRef {
            dag: self.dag,
            parents: &self.parents,
            payload: &self.payload,
        })
    }

    /// Decode a stored body, deriving the id from the bytes.
    pub fn from_body_bytes(bytes: &[u8]) -> VeldResult<Self> {
        let body: Body = serde_json::from_slice(bytes)?;
        Ok(Changeset {
            id: ChangesetId(hash_bytes(bytes)),
            dag: body.dag,
            parents: body.parents,
            payload: body.payload,
        })
    }

    /// True if the id matches the content and the payload kind fits the DAG.
    pub fn verify(&self) -> bool {
        let kind_ok = match &self.payload {
            Payload::Commit(_) => self.dag == DagId::VersionControl,
            Payload::Records(delta) => {
                self.dag.is_record_dag() && delta.added.iter().all(|r| r.dag() == self.dag)
            }
        };
        kind_ok && hash_bytes(&self.body_bytes()) == self.id.0
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn commit(&self) -> Option<&CommitPayload> {
        match &self.payload {
            Payload::Commit(c) => Some(c),
            Payload::Records(_) => None,
        }
    }

    /// Users this changeset refers to (commit author, record audits).
    pub fn referenced_users(&self) -> Vec<&UserId> {
        match &self.payload {
            Payload::Commit(c) => vec![&c.author],
            Payload::Records(d) => d.added.iter().filter_map(|r| r.user()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn commit_payload(message: &str) -> Payload {
        Payload::Commit(CommitPayload {
            author: UserId::from_raw("u1"),
            when: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            message: message.to_string(),
            tree: Tree::new(),
        })
    }

    #[test]
    fn test_id_is_pure_function_of_content() {
        let a = Changeset::new(DagId::VersionControl, vec![], commit_payload("root"));
        let b = Changeset::new(DagId::VersionControl, vec![], commit_payload("root"));
        assert_eq!(a.id, b.id);

        let c = Changeset::new(DagId::VersionControl, vec![], commit_payload("other"));
        assert_ne!(a.id, c.id);

        let child = Changeset::new(DagId::VersionControl, vec![a.id.clone()], commit_payload("root"));
        assert_ne!(child.id, a.id);
    }

    #[test]
    fn test_body_bytes_hash_to_id() {
        let cs = Changeset::new(DagId::VersionControl, vec![], commit_payload("x"));
        let decoded = Changeset::from_body_bytes(&cs.body_bytes()).unwrap();
        assert_eq!(decoded, cs);
        assert!(decoded.verify());
    }

    #[test]
    fn test_tampered_changeset_fails_verify() {
        let mut cs = Changeset::new(DagId::VersionControl, vec![], commit_payload("x"));
        cs.payload = commit_payload("y");
        assert!(!cs.verify());
    }

    #[test]
    fn test_commit_in_record_dag_fails_verify() {
        let cs = Changeset::new(DagId::Branches, vec![], commit_payload("x"));
        assert!(!cs.verify());
    }

    #[test]
    fn test_duplicate_parents_dropped() {
        let root = Changeset::new(DagId::VersionControl, vec![], commit_payload("r"));
        let cs = Changeset::new(
            DagId::VersionControl,
            vec![root.id.clone(), root.id.clone()],
            commit_payload("c"),
        );
        assert_eq!(cs.parents.len(), 1);
        assert!(!cs.is_merge());
    }

    #[test]
    fn test_dag_id_parse() {
        assert_eq!("vc".parse::<DagId>(), Ok(DagId::VersionControl));
        assert_eq!("Locks".parse::<DagId>(), Ok(DagId::Locks));
        assert!("nope".parse::<DagId>().is_err());
    }
}

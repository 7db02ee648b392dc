//! Remote: configuration and sync memory for veld push/pull.
//!
//! A veld remote is another repository directory. Push and pull open it
//! in-process and run the reconciler against it; nothing here knows how
//! bytes move, only what this replica remembers about its peers.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::changeset::{ChangesetId, DagId};
use crate::error::VeldResult;
use crate::fsutil::atomic_write;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Repository configuration stored at `.veld/config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Named remotes (e.g. "origin" -> path).
    #[serde(default)]
    pub remotes: BTreeMap<String, RemoteEntry>,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// A single remote entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Filesystem path to the remote repository root.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Offers per DAG before a sync gives up as incomplete.
    pub max_round_trips: u32,
    pub repo_lock_timeout_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_round_trips: 16,
            repo_lock_timeout_ms: 10_000,
        }
    }
}

impl RepoConfig {
    /// Missing config means defaults.
    pub fn load(path: &Path) -> VeldResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> VeldResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        atomic_write(path, json.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Sync memory
// ---------------------------------------------------------------------------

/// What this replica last learned about each peer, stored at
/// `.veld/sync.json`. The remembered leaves seed the next sync's guess of
/// what the peer already has; they may be stale, which only costs an
/// extra round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMemory {
    #[serde(default)]
    pub peers: BTreeMap<String, PeerMemory>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMemory {
    #[serde(default)]
    pub leaves: BTreeMap<DagId, Vec<ChangesetId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_push_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pull_at: Option<DateTime<Utc>>,
}

impl SyncMemory {
    pub fn load(path: &Path) -> VeldResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> VeldResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        atomic_write(path, json.as_bytes())
    }

    /// Last-known leaves of `dag` at `peer`; empty when never synced.
    pub fn leaves(&self, peer: &str, dag: DagId) -> Vec<ChangesetId> {
        self.peers
            .get(peer)
            .and_then(|p| p.leaves.get(&dag))
            .cloned()
            .unwrap_or_default()
    }

    pub fn remember(&mut self, peer: &str, dag: DagId, leaves: Vec<ChangesetId>) {
        self.peers
            .entry(peer.to_string())
            .or_default()
            .leaves
            .insert(dag, leaves);
    }

    pub fn forget(&mut self, peer: &str) {
        self.peers.remove(peer);
    }
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Result of a push or pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub peer: String,
    /// Changesets newly applied at the destination, in dependency order.
    pub applied: Vec<ChangesetId>,
    pub round_trips: u32,
    pub forced: bool,
    /// Branches left ambiguous by a forced sync.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguous: Vec<String>,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_defaults_and_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = RepoConfig::load(&path).unwrap();
        assert_eq!(config.sync.max_round_trips, 16);
        assert_eq!(config.sync.repo_lock_timeout_ms, 10_000);

        config.remotes.insert(
            "origin".to_string(),
            RemoteEntry {
                path: "/srv/origin".to_string(),
            },
        );
        config.save(&path).unwrap();
        assert_eq!(RepoConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_sync_settings_fill_defaults() {
        let config: RepoConfig =
            serde_json::from_str(r#"{"sync": {"max_round_trips": 3}}"#).unwrap();
        assert_eq!(config.sync.max_round_trips, 3);
        assert_eq!(config.sync.repo_lock_timeout_ms, 10_000);
    }

    #[test]
    fn test_sync_memory_remembers_leaves() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");
        let mut memory = SyncMemory::load(&path).unwrap();
        assert!(memory.leaves("origin", DagId::VersionControl).is_empty());

        let id = ChangesetId::parse(&"ab".repeat(32)).unwrap();
        memory.remember("origin", DagId::VersionControl, vec![id.clone()]);
        memory.save(&path).unwrap();

        let memory = SyncMemory::load(&path).unwrap();
        assert_eq!(memory.leaves("origin", DagId::VersionControl), vec![id]);
        assert!(memory.leaves("origin", DagId::Locks).is_empty());
    }
}

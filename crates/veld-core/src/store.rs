//! Content-addressed changeset storage.
//!
//! Changesets are stored in `.veld/changesets/` using a 2-character prefix
//! directory scheme. The file body is the canonical JSON body, so its
//! SHA-256 is the changeset id and every read can be verified.
//!
//! Objects on disk are not part of the repository until `dags.json` lists
//! them. Writing that manifest atomically is the commit point of every
//! transaction; objects left behind by an aborted one are ignored.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::changeset::{Changeset, ChangesetId, DagId};
use crate::error::{VeldError, VeldResult};
use crate::fsutil::atomic_write;
use crate::hash::is_full_hash;
use crate::state::RepoState;

pub struct ChangesetStore {
    /// Root path: `.veld/changesets/`
    root: PathBuf,
}

impl ChangesetStore {
    pub fn new(changesets_dir: &Path) -> Self {
        Self {
            root: changesets_dir.to_path_buf(),
        }
    }

    /// Write a changeset body. Returns `false` if it was already stored.
    pub fn put(&self, cs: &Changeset) -> VeldResult<bool> {
        let path = self.object_path(&cs.id)?;
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(&path, &cs.body_bytes())?;
        Ok(true)
    }

    /// Read and verify a changeset.
    pub fn get(&self, id: &ChangesetId) -> VeldResult<Changeset> {
        let path = self.object_path(id)?;
        if !path.exists() {
            return Err(VeldError::ChangesetNotFound(id.to_string()));
        }
        let bytes = fs::read(&path)?;
        let cs = Changeset::from_body_bytes(&bytes)
            .map_err(|_| VeldError::CorruptChangeset(id.to_string()))?;
        if &cs.id != id || !cs.verify() {
            return Err(VeldError::CorruptChangeset(id.to_string()));
        }
        Ok(cs)
    }

    pub fn exists(&self, id: &ChangesetId) -> bool {
        self.object_path(id).is_ok_and(|p| p.exists())
    }

    /// Hash `abcdef...` -> `ab/cdef...`
    /// Ids that are not full hashes (a hand-edited manifest) are corrupt.
    fn object_path(&self, id: &ChangesetId) -> VeldResult<PathBuf> {
        if !is_full_hash(id.as_str()) {
            return Err(VeldError::CorruptChangeset(id.to_string()));
        }
        let (prefix, rest) = id.as_str().split_at(2);
        Ok(self.root.join(prefix).join(rest))
    }
}

/// Persistent DAG membership stored at `.veld/dags.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagManifest {
    /// Member ids of each DAG in local insertion (revno) order.
    #[serde(default)]
    pub dags: BTreeMap<DagId, Vec<ChangesetId>>,
}

impl DagManifest {
    pub fn from_state(state: &RepoState) -> Self {
        let dags = DagId::ALL
            .iter()
            .map(|&dag| (dag, state.dag(dag).ids().cloned().collect()))
            .collect();
        Self { dags }
    }

    /// Missing manifest means an empty repository.
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

    /// Rebuild replica state from the store.
    ///
    /// A listed changeset that is missing or fails verification is
    /// skipped with a warning and treated as absent, along with any
    /// listed descendant that can no longer be attached.
    pub fn load_state(&self, store: &ChangesetStore) -> RepoState {
        let mut state = RepoState::new();
        for dag in DagId::ALL {
            let Some(ids) = self.dags.get(&dag) else {
                continue;
            };
            for id in ids {
                let cs = match store.get(id) {
                    Ok(cs) => cs,
                    Err(e) => {
                        warn!(%dag, id = %id.short(), error = %e, "skipping unreadable changeset");
                        continue;
                    }
                };
                if let Err(e) = state.insert(cs) {
                    warn!(%dag, id = %id.short(), error = %e, "skipping changeset");
                }
            }
        }
        state
    }
}

//! Tree snapshots carried by version-control changesets.
//!
//! A tree maps stable object ids to their current path and content hash.
//! Locks and history follow the object id, so a rename changes the path
//! attribute but not the identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{VeldError, VeldResult};
use crate::hash::hash_bytes;

/// Stable identity of a versioned object, independent of its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Mint a fresh object id.
    pub fn generate() -> Self {
        ObjectId(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One object in a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeEntry {
    /// Slash-separated path relative to the repository root.
    pub path: String,
    /// SHA-256 of the object's content.
    pub content: String,
}

/// A full snapshot of versioned objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tree {
    entries: BTreeMap<ObjectId, TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new object at `path` and return its fresh id.
    pub fn add_file(&mut self, path: &str, content: &[u8]) -> VeldResult<ObjectId> {
        let path = normalize_path(path)?;
        if self.object_at(&path).is_some() {
            return Err(VeldError::PathExists(path));
        }
        let id = ObjectId::generate();
        self.entries.insert(
            id.clone(),
            TreeEntry {
                path,
                content: hash_bytes(content),
            },
        );
        Ok(id)
    }

    /// Replace the content of the object at `path`.
    pub fn modify(&mut self, path: &str, content: &[u8]) -> VeldResult<()> {
        let id = self
            .object_at(path)
            .cloned()
            .ok_or_else(|| VeldError::NotVersioned(path.to_string()))?;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.content = hash_bytes(content);
        }
        Ok(())
    }

    /// Remove the object at `path`, returning its id.
    pub fn remove(&mut self, path: &str) -> VeldResult<ObjectId> {
        let id = self
            .object_at(path)
            .cloned()
            .ok_or_else(|| VeldError::NotVersioned(path.to_string()))?;
        self.entries.remove(&id);
        Ok(id)
    }

    /// Move or rename the object at `from` to `to`. Identity is preserved.
    pub fn rename(&mut self, from: &str, to: &str) -> VeldResult<()> {
        let to = normalize_path(to)?;
        if self.object_at(&to).is_some() {
            return Err(VeldError::PathExists(to));
        }
        let id = self
            .object_at(from)
            .cloned()
            .ok_or_else(|| VeldError::NotVersioned(from.to_string()))?;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.path = to;
        }
        Ok(())
    }

    /// The object currently at `path`.
    pub fn object_at(&self, path: &str) -> Option<&ObjectId> {
        self.entries
            .iter()
            .find(|(_, e)| e.path == path)
            .map(|(id, _)| id)
    }

    /// The current path of an object.
    pub fn path_of(&self, id: &ObjectId) -> Option<&str> {
        self.entries.get(id).map(|e| e.path.as_str())
    }

    pub fn get(&self, id: &ObjectId) -> Option<&TreeEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ObjectId, &TreeEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_path(path: &str) -> VeldResult<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() || trimmed.split('/').any(|seg| seg.is_empty() || seg == "..") {
        return Err(VeldError::NotVersioned(path.to_string()));
    }
    Ok(trimmed.to_string())
}

/// How an object differs between two trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Moved,
    MovedModified,
}

impl ChangeKind {
    /// True if the object's content changed or the object went away.
    pub fn touches_content(self) -> bool {
        matches!(
            self,
            ChangeKind::Modified | ChangeKind::MovedModified | ChangeKind::Deleted
        )
    }
}

/// A single object change between two trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathChange {
    pub object: ObjectId,
    /// Path in the newer tree (the old path for deletions).
    pub path: String,
    /// Previous path, for moves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    pub kind: ChangeKind,
}

/// Compare two trees object by object. Output is sorted by path.
pub fn diff_trees(old: &Tree, new: &Tree) -> Vec<PathChange> {
    let mut changes = Vec::new();

    for (id, entry) in &new.entries {
        let kind = match old.entries.get(id) {
            None => Some(ChangeKind::Added),
            Some(prev) => {
                let moved = prev.path != entry.path;
                let modified = prev.content != entry.content;
                match (moved, modified) {
                    (false, false) => None,
                    (false, true) => Some(ChangeKind::Modified),
                    (true, false) => Some(ChangeKind::Moved),
                    (true, true) => Some(ChangeKind::MovedModified),
                }
            }
        };
        if let Some(kind) = kind {
            let old_path = match kind {
                ChangeKind::Moved | ChangeKind::MovedModified => {
                    old.path_of(id).map(str::to_string)
                }
                _ => None,
            };
            changes.push(PathChange {
                object: id.clone(),
                path: entry.path.clone(),
                old_path,
                kind,
            });
        }
    }

    for (id, entry) in &old.entries {
        if !new.entries.contains_key(id) {
            changes.push(PathChange {
                object: id.clone(),
                path: entry.path.clone(),
                old_path: None,
                kind: ChangeKind::Deleted,
            });
        }
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut tree = Tree::new();
        let id = tree.add_file("src/main.rs", b"fn main() {}").unwrap();
        assert_eq!(tree.object_at("src/main.rs"), Some(&id));
        assert_eq!(tree.path_of(&id), Some("src/main.rs"));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_add_duplicate_path_fails() {
        let mut tree = Tree::new();
        tree.add_file("a.txt", b"a").unwrap();
        assert!(matches!(
            tree.add_file("a.txt", b"b"),
            Err(VeldError::PathExists(_))
        ));
    }

    #[test]
    fn test_rejects_bad_paths() {
        let mut tree = Tree::new();
        assert!(tree.add_file("", b"x").is_err());
        assert!(tree.add_file("a/../b", b"x").is_err());
        assert!(tree.add_file("a//b", b"x").is_err());
    }

    #[test]
    fn test_rename_keeps_identity() {
        let mut tree = Tree::new();
        let id = tree.add_file("old.txt", b"x").unwrap();
        tree.rename("old.txt", "dir/new.txt").unwrap();
        assert_eq!(tree.object_at("dir/new.txt"), Some(&id));
        assert!(tree.object_at("old.txt").is_none());
    }

    #[test]
    fn test_modify_missing_is_not_versioned() {
        let mut tree = Tree::new();
        assert!(matches!(
            tree.modify("nope.txt", b"x"),
            Err(VeldError::NotVersioned(_))
        ));
    }

    #[test]
    fn test_diff_trees_classifies_changes() {
        let mut old = Tree::new();
        old.add_file("keep.txt", b"same").unwrap();
        old.add_file("edit.txt", b"v1").unwrap();
        old.add_file("gone.txt", b"bye").unwrap();
        old.add_file("move.txt", b"m").unwrap();

        let mut new = old.clone();
        new.modify("edit.txt", b"v2").unwrap();
        new.remove("gone.txt").unwrap();
        new.rename("move.txt", "moved.txt").unwrap();
        new.add_file("fresh.txt", b"new").unwrap();

        let changes = diff_trees(&old, &new);
        let summary: Vec<(&str, ChangeKind)> =
            changes.iter().map(|c| (c.path.as_str(), c.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("edit.txt", ChangeKind::Modified),
                ("fresh.txt", ChangeKind::Added),
                ("gone.txt", ChangeKind::Deleted),
                ("moved.txt", ChangeKind::Moved),
            ]
        );
        let moved = changes.iter().find(|c| c.path == "moved.txt").unwrap();
        assert_eq!(moved.old_path.as_deref(), Some("move.txt"));
        assert!(!ChangeKind::Moved.touches_content());
        assert!(ChangeKind::Deleted.touches_content());
    }
}

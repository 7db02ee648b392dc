//! Closet: a directory of named repositories.
//!
//! Each entry is a subdirectory holding an ordinary repository. Closing a
//! repository is dropping its handle.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{VeldError, VeldResult};
use crate::repo::{Repository, VELD_DIR};

pub struct Closet {
    root: PathBuf,
}

impl Closet {
    /// Use `root` as a closet, creating it if needed.
    pub fn new(root: &Path) -> VeldResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_of(&self, name: &str) -> VeldResult<PathBuf> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if !valid {
            return Err(VeldError::NotARepo);
        }
        Ok(self.root.join(name))
    }

    pub fn create(&self, name: &str) -> VeldResult<Repository> {
        let path = self.path_of(name)?;
        if path.join(VELD_DIR).exists() {
            return Err(VeldError::AlreadyExists(name.to_string()));
        }
        fs::create_dir_all(&path)?;
        let repo = Repository::init(&path)?;
        info!(name, "created repository in closet");
        Ok(repo)
    }

    pub fn open(&self, name: &str) -> VeldResult<Repository> {
        Repository::open(&self.path_of(name)?)
    }

    /// Names of every repository in the closet, sorted.
    pub fn list(&self) -> VeldResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().join(VELD_DIR).is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn delete(&self, name: &str) -> VeldResult<()> {
        let path = self.path_of(name)?;
        if !path.join(VELD_DIR).is_dir() {
            return Err(VeldError::NotARepo);
        }
        fs::remove_dir_all(&path)?;
        info!(name, "deleted repository from closet");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_closet_lifecycle() {
        let dir = tempdir().unwrap();
        let closet = Closet::new(dir.path()).unwrap();
        closet.create("alpha").unwrap();
        closet.create("beta").unwrap();
        fs::create_dir(dir.path().join("not-a-repo")).unwrap();

        assert_eq!(closet.list().unwrap(), vec!["alpha", "beta"]);
        assert!(matches!(
            closet.create("alpha"),
            Err(VeldError::AlreadyExists(_))
        ));
        closet.open("beta").unwrap();

        closet.delete("alpha").unwrap();
        assert_eq!(closet.list().unwrap(), vec!["beta"]);
        assert!(matches!(closet.open("alpha"), Err(VeldError::NotARepo)));
        assert!(closet.open("../escape").is_err());
    }
}

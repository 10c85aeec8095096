//! read-only path lookup into a historical commit, backing the virtual
//! `/.snapshot/<name>/...` tree

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::repo::{lookup_path, Repo};
use crate::types::{Commit, EntryType, TreeEntry};

/// a resolved named snapshot
pub struct SnapshotView<'a> {
    repo: &'a Repo,
    hash: Hash,
    commit: Commit,
}

impl<'a> SnapshotView<'a> {
    /// resolve a snapshot by name
    pub fn resolve(repo: &'a Repo, name: &str) -> Result<Self> {
        let snapshots = repo.list_snapshots()?;
        let hash = *snapshots
            .get(name)
            .ok_or_else(|| Error::SnapshotNotFound(name.to_string()))?;
        let commit = repo.get_commit(&hash)?;
        Ok(Self { repo, hash, commit })
    }

    /// view an arbitrary commit (used by checkout of historical states)
    pub fn of_commit(repo: &'a Repo, hash: Hash) -> Result<Self> {
        let commit = repo.get_commit(&hash)?;
        Ok(Self { repo, hash, commit })
    }

    pub fn commit_hash(&self) -> Hash {
        self.hash
    }

    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    /// look up a path relative to the snapshot root
    pub fn lookup(&self, path: &str) -> Result<TreeEntry> {
        lookup_path(self.repo, self.commit.tree, path)
    }

    /// directory listing at a path inside the snapshot
    pub fn list(&self, path: &str) -> Result<Vec<String>> {
        let entry = self.lookup(path)?;
        if !entry.entry_type.is_tree() {
            return Err(Error::InvalidArgument(format!(
                "not a directory: {}",
                path
            )));
        }
        let tree = self.repo.get_tree(&entry.hash)?;
        Ok(tree.entries().map(|(name, _)| name.clone()).collect())
    }

    /// full content of a file inside the snapshot
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let entry = self.lookup(path)?;
        self.repo.read_content(entry.entry_type, &entry.hash)
    }

    /// ranged read of a file inside the snapshot
    pub fn read_at(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let entry = self.lookup(path)?;
        self.repo.read_content_at(entry.entry_type, &entry.hash, offset, len)
    }

    /// file size without reading content
    pub fn size_of(&self, entry: &TreeEntry) -> Result<u64> {
        match entry.entry_type {
            EntryType::Blob => Ok(self.repo.get_blob(&entry.hash)?.len() as u64),
            EntryType::LargeBlob => Ok(self.repo.get_large_blob(&entry.hash)?.total_size()),
            EntryType::Tree => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttrMap, Tree};
    use tempfile::tempdir;

    fn snapshot_repo() -> (tempfile::TempDir, Repo, Hash) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();

        let blob = repo.add_blob(b"snapshot content").unwrap();
        let mut sub = Tree::new();
        sub.insert(
            "file.txt",
            TreeEntry::new(EntryType::Blob, 0o644, blob, AttrMap::new()),
        )
        .unwrap();
        let sub_hash = repo.add_tree(&sub).unwrap();

        let mut root = Tree::new();
        root.insert(
            "d",
            TreeEntry::new(EntryType::Tree, 0o755, sub_hash, AttrMap::new()),
        )
        .unwrap();
        let root_hash = repo.add_tree(&root).unwrap();

        let mut commit = Commit::new(root_hash, Hash::ZERO, "t", 1, "snap");
        commit.set_snapshot("v1");
        let hash = repo.add_commit(&commit).unwrap();
        repo.update_head(&hash).unwrap();

        (dir, repo, hash)
    }

    #[test]
    fn test_resolve_by_name() {
        let (_dir, repo, hash) = snapshot_repo();
        let view = SnapshotView::resolve(&repo, "v1").unwrap();
        assert_eq!(view.commit_hash(), hash);
    }

    #[test]
    fn test_resolve_unknown_name() {
        let (_dir, repo, _) = snapshot_repo();
        assert!(matches!(
            SnapshotView::resolve(&repo, "nope"),
            Err(Error::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_lookup_and_read() {
        let (_dir, repo, _) = snapshot_repo();
        let view = SnapshotView::resolve(&repo, "v1").unwrap();

        assert_eq!(view.read("d/file.txt").unwrap(), b"snapshot content");
        assert_eq!(view.read_at("d/file.txt", 9, 7).unwrap(), b"content");
        assert!(matches!(
            view.read("d/missing"),
            Err(Error::PathNotFound(_))
        ));
    }

    #[test]
    fn test_list() {
        let (_dir, repo, _) = snapshot_repo();
        let view = SnapshotView::resolve(&repo, "v1").unwrap();

        assert_eq!(view.list("").unwrap(), vec!["d"]);
        assert_eq!(view.list("d").unwrap(), vec!["file.txt"]);
        assert!(view.list("d/file.txt").is_err());
    }
}

//! working-directory commit: scan everything under the repository root and
//! fold it into a new commit on HEAD

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::error::{IoResultExt, Result};
use crate::hash::Hash;
use crate::overlay::info::{MODE_DIR, MODE_REG, MODE_SYMLINK};
use crate::repo::{current_user, unix_now, Repo};
use crate::types::{AttrMap, Commit, EntryType, Tree, TreeEntry};

/// commit the working directory, advancing HEAD
pub fn commit(repo: &Repo, message: &str, snapshot: Option<&str>) -> Result<Hash> {
    let user = current_user();
    let tree_hash = commit_tree(repo, repo.root(), &user)?;

    let mut commit = Commit::new(tree_hash, repo.head()?, user, unix_now(), message);
    if let Some(name) = snapshot {
        commit.set_snapshot(name);
    }

    let commit_hash = repo.add_commit(&commit)?;
    repo.update_head(&commit_hash)?;
    Ok(commit_hash)
}

/// recursively store a directory as a tree
fn commit_tree(repo: &Repo, dir: &Path, user: &str) -> Result<Hash> {
    let mut entries = fs::read_dir(dir)
        .with_path(dir)?
        .collect::<std::io::Result<Vec<_>>>()
        .with_path(dir)?;
    entries.sort_by_key(|e| e.file_name());

    let mut tree = Tree::new();
    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == ".ori" {
            continue;
        }
        let path = entry.path();
        let meta = fs::symlink_metadata(&path).with_path(&path)?;
        let perms = (meta.mode() & 0o7777) as u16;

        let (entry_type, mode, hash) = if meta.file_type().is_symlink() {
            let target = fs::read_link(&path).with_path(&path)?;
            let hash = repo.add_blob(target.to_string_lossy().as_bytes())?;
            (EntryType::Blob, MODE_SYMLINK | 0o777, hash)
        } else if meta.is_dir() {
            let hash = commit_tree(repo, &path, user)?;
            (EntryType::Tree, MODE_DIR | perms, hash)
        } else {
            let (entry_type, hash) = repo.add_file(&path)?;
            (entry_type, MODE_REG | perms, hash)
        };

        let attrs = AttrMap::for_file(user, perms as u64, meta.len(), meta.mtime(), meta.ctime());
        tree.insert(name, TreeEntry::new(entry_type, mode, hash, attrs))?;
    }

    repo.add_tree(&tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_commit_working_dir() {
        let (_dir, repo) = test_repo();
        fs::write(repo.root().join("a.txt"), "hello").unwrap();

        let hash = commit(&repo, "m1", None).unwrap();

        assert_eq!(repo.head().unwrap(), hash);
        let c = repo.get_commit(&hash).unwrap();
        assert_eq!(c.message, "m1");

        let tree = repo.get_tree(&c.tree).unwrap();
        assert_eq!(tree.len(), 1);
        let entry = tree.get("a.txt").unwrap();
        assert_eq!(entry.hash, Hash::digest(b"hello"));
    }

    #[test]
    fn test_commit_skips_ori_dir() {
        let (_dir, repo) = test_repo();
        fs::write(repo.root().join("f"), "x").unwrap();

        let hash = commit(&repo, "m", None).unwrap();
        let tree = repo.get_tree(&repo.get_commit(&hash).unwrap().tree).unwrap();

        assert!(tree.get(".ori").is_none());
        assert!(tree.get("f").is_some());
    }

    #[test]
    fn test_commit_nested_and_chained() {
        let (_dir, repo) = test_repo();
        fs::create_dir_all(repo.root().join("a/b")).unwrap();
        fs::write(repo.root().join("a/b/deep.txt"), "deep").unwrap();

        let h1 = commit(&repo, "first", None).unwrap();

        fs::write(repo.root().join("top.txt"), "top").unwrap();
        let h2 = commit(&repo, "second", None).unwrap();

        let c2 = repo.get_commit(&h2).unwrap();
        assert_eq!(c2.parent1, h1);

        let root = repo.get_tree(&c2.tree).unwrap();
        let a = root.get("a").unwrap();
        assert!(a.entry_type.is_tree());
        let a_tree = repo.get_tree(&a.hash).unwrap();
        let b = a_tree.get("b").unwrap();
        let b_tree = repo.get_tree(&b.hash).unwrap();
        assert_eq!(
            repo.get_blob(&b_tree.get("deep.txt").unwrap().hash).unwrap(),
            b"deep"
        );
    }

    #[test]
    fn test_commit_symlink() {
        let (_dir, repo) = test_repo();
        std::os::unix::fs::symlink("/elsewhere", repo.root().join("link")).unwrap();

        let hash = commit(&repo, "m", None).unwrap();
        let tree = repo.get_tree(&repo.get_commit(&hash).unwrap().tree).unwrap();
        let entry = tree.get("link").unwrap();

        assert_eq!(entry.mode & 0o170000, MODE_SYMLINK);
        assert_eq!(repo.get_blob(&entry.hash).unwrap(), b"/elsewhere");
    }

    #[test]
    fn test_commit_snapshot_name() {
        let (_dir, repo) = test_repo();
        fs::write(repo.root().join("f"), "x").unwrap();

        let hash = commit(&repo, "snapshot", Some("nightly")).unwrap();
        let snapshots = repo.list_snapshots().unwrap();
        assert_eq!(snapshots.get("nightly"), Some(&hash));
    }
}

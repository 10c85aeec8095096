//! working directory vs HEAD comparison

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{IoResultExt, Result};
use crate::hash::Hash;
use crate::repo::{content_hash, Repo};
use crate::types::Tree;

/// what happened to a path relative to the HEAD tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn label(&self) -> char {
        match self {
            ChangeKind::Added => 'A',
            ChangeKind::Modified => 'M',
            ChangeKind::Deleted => 'D',
        }
    }
}

/// the recorded state of one path, for comparison
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PathState {
    Dir,
    File(Hash),
}

/// compare the working directory against the HEAD tree
pub fn status(repo: &Repo) -> Result<Vec<(ChangeKind, String)>> {
    let tip = tip_state(repo)?;
    let dir = dir_state(repo)?;

    let mut changes = Vec::new();
    for (path, state) in &dir {
        match tip.get(path) {
            None => changes.push((ChangeKind::Added, path.clone())),
            Some(tip_state) if tip_state != state => {
                changes.push((ChangeKind::Modified, path.clone()));
            }
            Some(_) => {}
        }
    }
    for path in tip.keys() {
        if !dir.contains_key(path) {
            changes.push((ChangeKind::Deleted, path.clone()));
        }
    }

    changes.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(changes)
}

/// path -> state map for the HEAD tree
pub(crate) fn tip_state(repo: &Repo) -> Result<BTreeMap<String, PathState>> {
    let mut state = BTreeMap::new();
    let head = repo.head()?;
    if head.is_empty() {
        return Ok(state);
    }
    let commit = repo.get_commit(&head)?;
    let tree = repo.get_tree(&commit.tree)?;
    walk_tree(repo, &tree, "", &mut state)?;
    Ok(state)
}

fn walk_tree(
    repo: &Repo,
    tree: &Tree,
    prefix: &str,
    state: &mut BTreeMap<String, PathState>,
) -> Result<()> {
    for (name, entry) in tree.entries() {
        let path = format!("{}/{}", prefix, name);
        if entry.entry_type.is_tree() {
            state.insert(path.clone(), PathState::Dir);
            let subtree = repo.get_tree(&entry.hash)?;
            walk_tree(repo, &subtree, &path, state)?;
        } else {
            state.insert(path, PathState::File(entry.hash));
        }
    }
    Ok(())
}

/// path -> state map for the working directory
pub(crate) fn dir_state(repo: &Repo) -> Result<BTreeMap<String, PathState>> {
    let mut state = BTreeMap::new();
    walk_dir(repo.root(), "", &mut state)?;
    Ok(state)
}

fn walk_dir(
    dir: &Path,
    prefix: &str,
    state: &mut BTreeMap<String, PathState>,
) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_path(dir)?
        .collect::<std::io::Result<Vec<_>>>()
        .with_path(dir)?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == ".ori" {
            continue;
        }
        let path = entry.path();
        let rel = format!("{}/{}", prefix, name);
        let meta = fs::symlink_metadata(&path).with_path(&path)?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(&path).with_path(&path)?;
            state.insert(
                rel,
                PathState::File(Hash::digest(target.to_string_lossy().as_bytes())),
            );
        } else if meta.is_dir() {
            state.insert(rel.clone(), PathState::Dir);
            walk_dir(&path, &rel, state)?;
        } else {
            let content = fs::read(&path).with_path(&path)?;
            state.insert(rel, PathState::File(content_hash(&content)?));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::commit::commit;
    use tempfile::tempdir;

    fn test_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_status_clean() {
        let (_dir, repo) = test_repo();
        fs::write(repo.root().join("f"), "content").unwrap();
        commit(&repo, "m", None).unwrap();

        assert!(status(&repo).unwrap().is_empty());
    }

    #[test]
    fn test_status_added_modified_deleted() {
        let (_dir, repo) = test_repo();
        fs::write(repo.root().join("keep"), "same").unwrap();
        fs::write(repo.root().join("change"), "before").unwrap();
        fs::write(repo.root().join("remove"), "bye").unwrap();
        commit(&repo, "m", None).unwrap();

        fs::write(repo.root().join("change"), "after").unwrap();
        fs::write(repo.root().join("new"), "hello").unwrap();
        fs::remove_file(repo.root().join("remove")).unwrap();

        let changes = status(&repo).unwrap();
        assert_eq!(
            changes,
            vec![
                (ChangeKind::Modified, "/change".to_string()),
                (ChangeKind::Added, "/new".to_string()),
                (ChangeKind::Deleted, "/remove".to_string()),
            ]
        );
    }

    #[test]
    fn test_status_empty_repo_all_added() {
        let (_dir, repo) = test_repo();
        fs::write(repo.root().join("f"), "x").unwrap();

        let changes = status(&repo).unwrap();
        assert_eq!(changes, vec![(ChangeKind::Added, "/f".to_string())]);
    }

    #[test]
    fn test_status_nested_dirs() {
        let (_dir, repo) = test_repo();
        fs::create_dir_all(repo.root().join("d/e")).unwrap();
        fs::write(repo.root().join("d/e/f"), "x").unwrap();
        commit(&repo, "m", None).unwrap();

        fs::remove_file(repo.root().join("d/e/f")).unwrap();
        fs::remove_dir(repo.root().join("d/e")).unwrap();

        let changes = status(&repo).unwrap();
        assert_eq!(
            changes,
            vec![
                (ChangeKind::Deleted, "/d/e".to_string()),
                (ChangeKind::Deleted, "/d/e/f".to_string()),
            ]
        );
    }
}

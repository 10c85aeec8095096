//! materialize a commit's tree into the working directory
//!
//! missing files are recreated and changed files overwritten from the
//! store; files added to the working directory are left intact.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;

use crate::error::{IoResultExt, Result};
use crate::hash::Hash;
use crate::object::ObjectType;
use crate::ops::status::{dir_state, PathState};
use crate::overlay::info::{kind_from_mode, FileKind};
use crate::repo::Repo;
use crate::types::TreeEntry;

/// one checkout action, labelled the way `ori checkout` prints them:
/// `N` new directory, `U` restored file, `M` overwritten file, `A` local-only
#[derive(Clone, Debug)]
pub struct CheckoutEntry {
    pub label: char,
    pub path: String,
}

#[derive(Debug, Default)]
pub struct CheckoutReport {
    pub entries: Vec<CheckoutEntry>,
    /// paths whose blobs were purged and could not be restored
    pub purged: Vec<String>,
}

/// restore the working directory from HEAD (or an explicit commit)
pub fn checkout(repo: &Repo, commit: Option<Hash>) -> Result<CheckoutReport> {
    let mut report = CheckoutReport::default();

    let tip_hash = match commit {
        Some(hash) => hash,
        None => repo.head()?,
    };
    if tip_hash.is_empty() {
        return Ok(report);
    }

    let mut tip = BTreeMap::new();
    let root_tree = repo.get_commit(&tip_hash)?.tree;
    collect_entries(repo, &root_tree, "", &mut tip)?;

    let dir = dir_state(repo)?;

    for (path, state) in &dir {
        match tip.get(path) {
            None => report.entries.push(CheckoutEntry {
                label: 'A',
                path: path.clone(),
            }),
            Some(entry) => {
                let matches = match state {
                    PathState::Dir => entry.entry_type.is_tree(),
                    PathState::File(hash) => *hash == entry.hash,
                };
                if !matches {
                    restore_file(repo, path, entry, &mut report)?;
                    report.entries.push(CheckoutEntry {
                        label: 'M',
                        path: path.clone(),
                    });
                }
            }
        }
    }

    for (path, entry) in &tip {
        if dir.contains_key(path) {
            continue;
        }
        if entry.entry_type.is_tree() {
            let abs = repo.root().join(&path[1..]);
            fs::create_dir_all(&abs).with_path(&abs)?;
            report.entries.push(CheckoutEntry {
                label: 'N',
                path: path.clone(),
            });
        } else {
            restore_file(repo, path, entry, &mut report)?;
            report.entries.push(CheckoutEntry {
                label: 'U',
                path: path.clone(),
            });
        }
    }

    Ok(report)
}

fn collect_entries(
    repo: &Repo,
    tree_hash: &Hash,
    prefix: &str,
    out: &mut BTreeMap<String, TreeEntry>,
) -> Result<()> {
    let tree = repo.get_tree(tree_hash)?;
    for (name, entry) in tree.entries() {
        let path = format!("{}/{}", prefix, name);
        if entry.entry_type.is_tree() {
            collect_entries(repo, &entry.hash, &path, out)?;
        }
        out.insert(path, entry.clone());
    }
    Ok(())
}

fn restore_file(
    repo: &Repo,
    path: &str,
    entry: &TreeEntry,
    report: &mut CheckoutReport,
) -> Result<()> {
    // directories are created by the caller; only file content lands here
    if entry.entry_type.is_tree() {
        return Ok(());
    }

    if repo.store().type_of(&entry.hash)? == ObjectType::Purged {
        report.purged.push(path.to_string());
        return Ok(());
    }

    let abs = repo.root().join(&path[1..]);
    let content = repo.read_content(entry.entry_type, &entry.hash)?;

    if kind_from_mode(entry.mode) == FileKind::Symlink {
        let target = String::from_utf8_lossy(&content).to_string();
        if abs.symlink_metadata().is_ok() {
            fs::remove_file(&abs).with_path(&abs)?;
        }
        std::os::unix::fs::symlink(&target, &abs).with_path(&abs)?;
        return Ok(());
    }

    fs::write(&abs, &content).with_path(&abs)?;
    fs::set_permissions(&abs, fs::Permissions::from_mode((entry.mode & 0o7777) as u32))
        .with_path(&abs)?;
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
    fn test_checkout_restores_deleted_file() {
        let (_dir, repo) = test_repo();
        fs::create_dir(repo.root().join("d")).unwrap();
        fs::write(repo.root().join("d/f"), "restore me").unwrap();
        commit(&repo, "m", None).unwrap();

        fs::remove_file(repo.root().join("d/f")).unwrap();
        fs::remove_dir(repo.root().join("d")).unwrap();

        let report = checkout(&repo, None).unwrap();

        assert_eq!(
            fs::read_to_string(repo.root().join("d/f")).unwrap(),
            "restore me"
        );
        assert!(report.entries.iter().any(|e| e.label == 'N' && e.path == "/d"));
        assert!(report.entries.iter().any(|e| e.label == 'U' && e.path == "/d/f"));
    }

    #[test]
    fn test_checkout_overwrites_modified_file() {
        let (_dir, repo) = test_repo();
        fs::write(repo.root().join("f"), "committed").unwrap();
        commit(&repo, "m", None).unwrap();

        fs::write(repo.root().join("f"), "local edit").unwrap();
        let report = checkout(&repo, None).unwrap();

        assert_eq!(fs::read_to_string(repo.root().join("f")).unwrap(), "committed");
        assert!(report.entries.iter().any(|e| e.label == 'M' && e.path == "/f"));
    }

    #[test]
    fn test_checkout_leaves_added_files() {
        let (_dir, repo) = test_repo();
        fs::write(repo.root().join("f"), "x").unwrap();
        commit(&repo, "m", None).unwrap();

        fs::write(repo.root().join("extra"), "keep me").unwrap();
        let report = checkout(&repo, None).unwrap();

        assert_eq!(fs::read_to_string(repo.root().join("extra")).unwrap(), "keep me");
        assert!(report
            .entries
            .iter()
            .any(|e| e.label == 'A' && e.path == "/extra"));
    }

    #[test]
    fn test_checkout_historical_commit() {
        let (_dir, repo) = test_repo();
        fs::write(repo.root().join("f"), "v1").unwrap();
        let c1 = commit(&repo, "v1", None).unwrap();

        fs::write(repo.root().join("f"), "v2").unwrap();
        commit(&repo, "v2", None).unwrap();

        checkout(&repo, Some(c1)).unwrap();
        assert_eq!(fs::read_to_string(repo.root().join("f")).unwrap(), "v1");
    }

    #[test]
    fn test_checkout_reports_purged() {
        let (_dir, repo) = test_repo();
        fs::write(repo.root().join("gone"), "purged content").unwrap();
        fs::write(repo.root().join("kept"), "intact content").unwrap();
        commit(&repo, "m", None).unwrap();

        let head = repo.head().unwrap();
        let tree = repo.get_tree(&repo.get_commit(&head).unwrap().tree).unwrap();
        let purged_hash = tree.get("gone").unwrap().hash;
        repo.store().purge(&purged_hash).unwrap();

        fs::remove_file(repo.root().join("gone")).unwrap();
        fs::remove_file(repo.root().join("kept")).unwrap();

        let report = checkout(&repo, None).unwrap();

        assert_eq!(report.purged, vec!["/gone".to_string()]);
        // the intact file came back
        assert_eq!(
            fs::read_to_string(repo.root().join("kept")).unwrap(),
            "intact content"
        );
        assert!(!repo.root().join("gone").exists());
    }
}

//! pull: transitive closure over the commit DAG, fetching only missing
//! objects from a peer that honors the store read contract

use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::object::ObjectType;
use crate::repo::Repo;
use crate::transport::RemoteSource;
use crate::types::{Commit, EntryType, LargeBlob, Tree};

/// transfer counters for reporting
#[derive(Debug, Default)]
pub struct PullStats {
    pub fetched: usize,
    pub skipped: usize,
    pub bytes: u64,
}

/// pull everything reachable from the source's HEAD, then advance HEAD.
///
/// objects are inserted referenced-first, so the local store stays
/// referentially closed at every step; HEAD advance is the commit point,
/// which makes an interrupted pull safe to re-run.
pub fn pull(repo: &Repo, src: &mut dyn RemoteSource) -> Result<(Hash, PullStats)> {
    let remote_head = src.head()?;
    let mut stats = PullStats::default();

    if remote_head.is_empty() {
        return Ok((repo.head()?, stats));
    }

    // walk the commit DAG down to what we already have; postorder puts
    // ancestors before descendants
    let mut order: Vec<(Hash, Commit)> = Vec::new();
    let mut seen = HashSet::new();
    collect_commits(repo, src, &remote_head, &mut order, &mut seen, &mut stats)?;

    for (hash, commit) in &order {
        pull_tree(repo, src, &commit.tree, &mut stats)?;

        let stored = repo.add_commit(commit)?;
        if stored != *hash {
            return Err(Error::IntegrityError(*hash));
        }
        stats.fetched += 1;
        debug!(commit = %hash, "pulled commit");
    }

    repo.update_head(&remote_head)?;
    info!(head = %remote_head, fetched = stats.fetched, skipped = stats.skipped, "pull complete");
    Ok((remote_head, stats))
}

fn collect_commits(
    repo: &Repo,
    src: &mut dyn RemoteSource,
    hash: &Hash,
    order: &mut Vec<(Hash, Commit)>,
    seen: &mut HashSet<Hash>,
    stats: &mut PullStats,
) -> Result<()> {
    if !seen.insert(*hash) {
        return Ok(());
    }
    if repo.store().contains(hash) {
        stats.skipped += 1;
        return Ok(());
    }

    let payload = fetch_verified(src, hash, stats)?;
    let commit = Commit::decode(&payload)?;

    for parent in commit.parents() {
        collect_commits(repo, src, &parent, order, seen, stats)?;
    }

    order.push((*hash, commit));
    Ok(())
}

/// fetch a tree and everything below it, children before the tree itself
fn pull_tree(
    repo: &Repo,
    src: &mut dyn RemoteSource,
    hash: &Hash,
    stats: &mut PullStats,
) -> Result<()> {
    if repo.store().contains(hash) {
        stats.skipped += 1;
        return Ok(());
    }

    let payload = fetch_verified(src, hash, stats)?;
    let tree = Tree::decode(&payload)?;

    for (_, entry) in tree.entries() {
        match entry.entry_type {
            EntryType::Blob => pull_blob(repo, src, &entry.hash, stats)?,
            EntryType::LargeBlob => pull_large_blob(repo, src, &entry.hash, stats)?,
            EntryType::Tree => pull_tree(repo, src, &entry.hash, stats)?,
        }
    }

    let stored = repo.add_tree(&tree)?;
    if stored != *hash {
        return Err(Error::IntegrityError(*hash));
    }
    stats.fetched += 1;
    Ok(())
}

fn pull_large_blob(
    repo: &Repo,
    src: &mut dyn RemoteSource,
    hash: &Hash,
    stats: &mut PullStats,
) -> Result<()> {
    if repo.store().contains(hash) {
        stats.skipped += 1;
        return Ok(());
    }

    let payload = fetch_verified(src, hash, stats)?;
    let large = LargeBlob::decode(&payload)?;

    for frag in large.fragments() {
        pull_blob(repo, src, &frag.hash, stats)?;
    }

    let stored = repo.add_large_blob(&large)?;
    if stored != *hash {
        return Err(Error::IntegrityError(*hash));
    }
    stats.fetched += 1;
    Ok(())
}

fn pull_blob(
    repo: &Repo,
    src: &mut dyn RemoteSource,
    hash: &Hash,
    stats: &mut PullStats,
) -> Result<()> {
    if repo.store().contains(hash) {
        stats.skipped += 1;
        return Ok(());
    }

    // an already-purged remote blob replicates as a tombstone
    if src.object_type(hash)? == ObjectType::Purged {
        repo.store().put_purged(hash)?;
        stats.fetched += 1;
        return Ok(());
    }

    let payload = fetch_verified(src, hash, stats)?;
    let stored = repo.add_blob(&payload)?;
    if stored != *hash {
        return Err(Error::IntegrityError(*hash));
    }
    stats.fetched += 1;
    Ok(())
}

/// fetch a payload and check it against the name it travels under
fn fetch_verified(
    src: &mut dyn RemoteSource,
    hash: &Hash,
    stats: &mut PullStats,
) -> Result<Vec<u8>> {
    let payload = src.get_object(hash)?;
    if Hash::digest(&payload) != *hash {
        return Err(Error::IntegrityError(*hash));
    }
    stats.bytes += payload.len() as u64;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalSource;
    use crate::types::{AttrMap, TreeEntry};
    use std::fs;
    use tempfile::tempdir;

    fn commit_file(repo: &Repo, name: &str, content: &[u8], msg: &str) -> Hash {
        let (etype, hash) = repo.add_content(content).unwrap();
        let mut tree = Tree::new();
        tree.insert(name, TreeEntry::new(etype, 0o644, hash, AttrMap::new()))
            .unwrap();
        let tree_hash = repo.add_tree(&tree).unwrap();
        let commit = Commit::new(tree_hash, repo.head().unwrap(), "t", 1, msg);
        let commit_hash = repo.add_commit(&commit).unwrap();
        repo.update_head(&commit_hash).unwrap();
        commit_hash
    }

    #[test]
    fn test_pull_full_history() {
        let dir = tempdir().unwrap();
        let src_repo = Repo::init(&dir.path().join("src")).unwrap();
        let dst_repo = Repo::init(&dir.path().join("dst")).unwrap();

        commit_file(&src_repo, "a.txt", b"v1", "m1");
        let head = commit_file(&src_repo, "a.txt", b"v2", "m2");

        let mut src = LocalSource::new(src_repo);
        let (pulled_head, stats) = pull(&dst_repo, &mut src).unwrap();

        assert_eq!(pulled_head, head);
        assert_eq!(dst_repo.head().unwrap(), head);
        assert!(stats.fetched > 0);

        // every reachable object landed, and both sides verify clean
        let src_objects = src.repo().store().list_objects().unwrap();
        let dst_objects = dst_repo.store().list_objects().unwrap();
        for hash in &src_objects {
            assert!(dst_objects.contains(hash), "missing {}", hash);
        }
        assert!(dst_repo.verify().unwrap().is_empty());
        assert!(src.repo().verify().unwrap().is_empty());

        // both versions of the file content arrived
        let c2 = dst_repo.get_commit(&head).unwrap();
        let c1 = dst_repo.get_commit(&c2.parent1).unwrap();
        let t1 = dst_repo.get_tree(&c1.tree).unwrap();
        assert_eq!(
            dst_repo.get_blob(&t1.get("a.txt").unwrap().hash).unwrap(),
            b"v1"
        );
    }

    #[test]
    fn test_pull_is_incremental() {
        let dir = tempdir().unwrap();
        let src_repo = Repo::init(&dir.path().join("src")).unwrap();
        let dst_repo = Repo::init(&dir.path().join("dst")).unwrap();

        commit_file(&src_repo, "f", b"one", "m1");
        let mut src = LocalSource::new(src_repo);
        pull(&dst_repo, &mut src).unwrap();

        commit_file(src.repo(), "f", b"two", "m2");
        let (_, stats) = pull(&dst_repo, &mut src).unwrap();

        // the first commit's objects were not refetched
        assert!(stats.skipped > 0);
        assert_eq!(dst_repo.head().unwrap(), src.repo().head().unwrap());
    }

    #[test]
    fn test_pull_empty_source() {
        let dir = tempdir().unwrap();
        let src_repo = Repo::init(&dir.path().join("src")).unwrap();
        let dst_repo = Repo::init(&dir.path().join("dst")).unwrap();

        let mut src = LocalSource::new(src_repo);
        let (head, stats) = pull(&dst_repo, &mut src).unwrap();

        assert!(head.is_empty());
        assert_eq!(stats.fetched, 0);
        assert!(dst_repo.head().unwrap().is_empty());
    }

    #[test]
    fn test_pull_detects_corruption() {
        let dir = tempdir().unwrap();
        let src_repo = Repo::init(&dir.path().join("src")).unwrap();
        let dst_repo = Repo::init(&dir.path().join("dst")).unwrap();

        commit_file(&src_repo, "f", b"will be damaged", "m");

        // damage the blob payload in the source store
        let head = src_repo.head().unwrap();
        let tree = src_repo
            .get_tree(&src_repo.get_commit(&head).unwrap().tree)
            .unwrap();
        let blob = tree.get("f").unwrap().hash;
        let path = src_repo.store().object_path(&blob);
        let mut bytes = fs::read(&path).unwrap();
        bytes[6] ^= 0x55; // inside the payload region
        fs::write(&path, &bytes).unwrap();

        let mut src = LocalSource::new(src_repo);
        let result = pull(&dst_repo, &mut src);
        assert!(matches!(result, Err(Error::IntegrityError(_))));

        // HEAD did not advance
        assert!(dst_repo.head().unwrap().is_empty());
    }

    #[test]
    fn test_pull_replicates_purged_blob() {
        let dir = tempdir().unwrap();
        let src_repo = Repo::init(&dir.path().join("src")).unwrap();
        let dst_repo = Repo::init(&dir.path().join("dst")).unwrap();

        commit_file(&src_repo, "f", b"purge me", "m");
        let head = src_repo.head().unwrap();
        let tree = src_repo
            .get_tree(&src_repo.get_commit(&head).unwrap().tree)
            .unwrap();
        let blob = tree.get("f").unwrap().hash;
        src_repo.store().purge(&blob).unwrap();

        let mut src = LocalSource::new(src_repo);
        pull(&dst_repo, &mut src).unwrap();

        assert_eq!(
            dst_repo.store().type_of(&blob).unwrap(),
            ObjectType::Purged
        );
        assert!(dst_repo.verify().unwrap().is_empty());
    }

    #[test]
    fn test_pull_merge_history() {
        let dir = tempdir().unwrap();
        let src_repo = Repo::init(&dir.path().join("src")).unwrap();
        let dst_repo = Repo::init(&dir.path().join("dst")).unwrap();

        let a = commit_file(&src_repo, "f", b"a", "a");
        let b = {
            // a sibling commit off the root
            let (etype, h) = src_repo.add_content(b"b").unwrap();
            let mut tree = Tree::new();
            tree.insert("g", TreeEntry::new(etype, 0o644, h, AttrMap::new()))
                .unwrap();
            let th = src_repo.add_tree(&tree).unwrap();
            src_repo
                .add_commit(&Commit::new(th, Hash::ZERO, "t", 2, "b"))
                .unwrap()
        };

        // merge the two lines
        let merge_tree = src_repo.get_commit(&a).unwrap().tree;
        let mut merge = Commit::new(merge_tree, a, "t", 3, "merge");
        merge.set_parents(a, b);
        let merge_hash = src_repo.add_commit(&merge).unwrap();
        src_repo.update_head(&merge_hash).unwrap();

        let mut src = LocalSource::new(src_repo);
        let (head, _) = pull(&dst_repo, &mut src).unwrap();

        assert_eq!(head, merge_hash);
        let pulled = dst_repo.get_commit(&merge_hash).unwrap();
        assert!(pulled.is_merge());
        assert!(dst_repo.get_commit(&a).is_ok());
        assert!(dst_repo.get_commit(&b).is_ok());
        assert!(dst_repo.verify().unwrap().is_empty());
    }
}

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use fastcdc::v2020::FastCDC;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::object::{BackrefRole, ObjectType};
use crate::store::{fsync_dir, Store};
use crate::types::{AttrMap, Commit, EntryType, Fragment, LargeBlob, Tree, TreeEntry};

/// repository format version written to `.ori/version`
pub const ORI_VERSION: &str = "ORI1.0";

/// files at or below this size are stored as a single Blob; larger files
/// are chunked into a LargeBlob descriptor
pub const LARGE_BLOB_THRESHOLD: u64 = 1024 * 1024;

const CHUNK_MIN: u32 = 32 * 1024;
const CHUNK_AVG: u32 = 128 * 1024;
const CHUNK_MAX: u32 = 512 * 1024;

/// an open ori repository
pub struct Repo {
    root: PathBuf,
    store: Store,
    uuid: String,
    version: String,
}

impl Repo {
    /// initialize a new repository at the given path
    pub fn init(root: &Path) -> Result<Self> {
        let ori_dir = root.join(".ori");
        if ori_dir.exists() {
            return Err(Error::RepoExists(root.to_path_buf()));
        }

        fs::create_dir_all(root).with_path(root)?;
        fs::create_dir(&ori_dir).with_path(&ori_dir)?;
        fs::create_dir(ori_dir.join("objs")).with_path(ori_dir.join("objs"))?;
        fs::create_dir(ori_dir.join("tmp")).with_path(ori_dir.join("tmp"))?;

        // repository identity, read-only once written
        let uuid = uuid::Uuid::new_v4().to_string();
        let id_path = ori_dir.join("id");
        fs::write(&id_path, &uuid).with_path(&id_path)?;
        fs::set_permissions(&id_path, Permissions::from_mode(0o440)).with_path(&id_path)?;

        let version_path = ori_dir.join("version");
        fs::write(&version_path, ORI_VERSION).with_path(&version_path)?;

        let head_path = ori_dir.join("HEAD");
        fs::write(&head_path, format!("{}\n", Hash::ZERO.to_hex())).with_path(&head_path)?;

        info!(root = %root.display(), %uuid, "initialized repository");

        Ok(Self {
            root: root.to_path_buf(),
            store: Store::new(ori_dir),
            uuid,
            version: ORI_VERSION.to_string(),
        })
    }

    /// open an existing repository
    pub fn open(root: &Path) -> Result<Self> {
        let ori_dir = root.join(".ori");
        if !ori_dir.is_dir() {
            return Err(Error::NoRepo(root.to_path_buf()));
        }

        let uuid = fs::read_to_string(ori_dir.join("id"))
            .with_path(ori_dir.join("id"))?
            .trim()
            .to_string();
        let version = fs::read_to_string(ori_dir.join("version"))
            .with_path(ori_dir.join("version"))?
            .trim()
            .to_string();
        if version != ORI_VERSION {
            return Err(Error::Malformed(format!(
                "unsupported repository version: {}",
                version
            )));
        }

        Ok(Self {
            root: root.to_path_buf(),
            store: Store::new(ori_dir),
            uuid,
            version,
        })
    }

    /// walk upward from `start` to the nearest directory containing `.ori`
    pub fn find_root(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            if dir.join(".ori").is_dir() {
                return Some(dir);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ori_path(&self) -> PathBuf {
        self.root.join(".ori")
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn log_path(&self) -> PathBuf {
        self.ori_path().join("ori.log")
    }

    /// acquire the single-writer repository lock.
    /// the guard releases the lock on drop.
    pub fn lock(&self) -> Result<RepoLock> {
        let lock_path = self.ori_path().join("lock");
        let file = File::create(&lock_path).with_path(&lock_path)?;
        let flock =
            Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|_| Error::LockContention)?;
        Ok(RepoLock { _flock: flock })
    }

    /// try to acquire the lock, returning None when already held
    pub fn try_lock(&self) -> Result<Option<RepoLock>> {
        let lock_path = self.ori_path().join("lock");
        let file = File::create(&lock_path).with_path(&lock_path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(RepoLock { _flock: flock })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err(_) => Err(Error::LockContention),
        }
    }

    // ------------------------------------------------------------------
    // HEAD

    /// read the current HEAD (ZERO when the repository has no commits)
    pub fn head(&self) -> Result<Hash> {
        let path = self.ori_path().join("HEAD");
        let content = fs::read_to_string(&path).with_path(&path)?;
        Hash::from_hex(content.trim())
    }

    /// advance HEAD; a single atomic rename is the commit point
    pub fn update_head(&self, hash: &Hash) -> Result<()> {
        let path = self.ori_path().join("HEAD");
        let tmp_path = self.store.tmp_path().join(uuid::Uuid::new_v4().to_string());
        {
            let mut tmp = File::create(&tmp_path).with_path(&tmp_path)?;
            writeln!(tmp, "{}", hash.to_hex()).with_path(&tmp_path)?;
            tmp.sync_all().with_path(&tmp_path)?;
        }
        fs::rename(&tmp_path, &path).with_path(&path)?;
        fsync_dir(&self.ori_path())?;
        debug!(head = %hash, "HEAD advanced");
        Ok(())
    }

    // ------------------------------------------------------------------
    // object insertion

    /// store raw content as a Blob
    pub fn add_blob(&self, content: &[u8]) -> Result<Hash> {
        self.store.put_bytes(ObjectType::Blob, content)
    }

    /// store a file from disk; large files are chunked into a LargeBlob
    pub fn add_file(&self, path: &Path) -> Result<(EntryType, Hash)> {
        let content = fs::read(path).with_path(path)?;
        self.add_content(&content)
    }

    /// store content, choosing Blob or LargeBlob by the size threshold
    pub fn add_content(&self, content: &[u8]) -> Result<(EntryType, Hash)> {
        if content.len() as u64 <= LARGE_BLOB_THRESHOLD {
            return Ok((EntryType::Blob, self.add_blob(content)?));
        }

        let mut fragments = Vec::new();
        for chunk in FastCDC::new(content, CHUNK_MIN, CHUNK_AVG, CHUNK_MAX) {
            let data = &content[chunk.offset..chunk.offset + chunk.length];
            let hash = self.add_blob(data)?;
            fragments.push(Fragment {
                offset: chunk.offset as u64,
                length: chunk.length as u64,
                hash,
            });
        }

        let large = LargeBlob::new(fragments)?;
        let hash = self.add_large_blob(&large)?;
        Ok((EntryType::LargeBlob, hash))
    }

    /// store a LargeBlob descriptor and record chunk backrefs
    pub fn add_large_blob(&self, large: &LargeBlob) -> Result<Hash> {
        let hash = self.store.put_bytes(ObjectType::LargeBlob, &large.encode())?;
        for frag in large.fragments() {
            self.record_ref(&frag.hash, &hash)?;
        }
        Ok(hash)
    }

    /// store a Tree and record entry backrefs
    pub fn add_tree(&self, tree: &Tree) -> Result<Hash> {
        let hash = self.store.put_bytes(ObjectType::Tree, &tree.encode())?;
        for (_, entry) in tree.entries() {
            self.record_ref(&entry.hash, &hash)?;
        }
        Ok(hash)
    }

    /// store a Commit and record backrefs for every outgoing reference
    pub fn add_commit(&self, commit: &Commit) -> Result<Hash> {
        let bytes = commit.encode()?;
        let hash = Hash::digest(&bytes);

        // a cycle would need this commit to name its own hash; refuse it
        let mut targets = vec![commit.tree];
        targets.extend(commit.parents());
        if targets.contains(&hash) || commit.graft_commit == hash {
            return Err(Error::Corrupted(format!(
                "commit {} references itself",
                hash
            )));
        }

        self.store.put_bytes(ObjectType::Commit, &bytes)?;
        for target in &targets {
            self.record_ref(target, &hash)?;
        }
        // the graft source commit lives in the source repository; record
        // the edge only when it is also present here
        if !commit.graft_commit.is_empty() && self.store.contains(&commit.graft_commit) {
            self.record_ref(&commit.graft_commit, &hash)?;
        }
        Ok(hash)
    }

    /// add a backref from -> target, with the role matching the target's state
    fn record_ref(&self, target: &Hash, from: &Hash) -> Result<()> {
        let role = match self.store.type_of(target)? {
            ObjectType::Purged => BackrefRole::Purged,
            _ => BackrefRole::Ref,
        };
        self.store.add_backref(target, from, role)
    }

    // ------------------------------------------------------------------
    // typed retrieval

    /// read raw blob content
    pub fn get_blob(&self, hash: &Hash) -> Result<Vec<u8>> {
        self.expect_type(hash, ObjectType::Blob)?;
        self.store.get_bytes(hash)
    }

    pub fn get_tree(&self, hash: &Hash) -> Result<Tree> {
        self.expect_type(hash, ObjectType::Tree)?;
        Tree::decode(&self.store.get_bytes(hash)?)
    }

    pub fn get_commit(&self, hash: &Hash) -> Result<Commit> {
        self.expect_type(hash, ObjectType::Commit)?;
        Commit::decode(&self.store.get_bytes(hash)?)
    }

    pub fn get_large_blob(&self, hash: &Hash) -> Result<LargeBlob> {
        self.expect_type(hash, ObjectType::LargeBlob)?;
        LargeBlob::decode(&self.store.get_bytes(hash)?)
    }

    fn expect_type(&self, hash: &Hash, expected: ObjectType) -> Result<()> {
        let found = self.store.type_of(hash)?;
        if found != expected {
            return Err(Error::WrongType {
                expected: expected.name(),
                found: found.name(),
            });
        }
        Ok(())
    }

    /// full logical content of a Blob or LargeBlob entry
    pub fn read_content(&self, entry_type: EntryType, hash: &Hash) -> Result<Vec<u8>> {
        match entry_type {
            EntryType::Blob => self.get_blob(hash),
            EntryType::LargeBlob => {
                let large = self.get_large_blob(hash)?;
                let mut out = Vec::with_capacity(large.total_size() as usize);
                for frag in large.fragments() {
                    out.extend_from_slice(&self.get_blob(&frag.hash)?);
                }
                Ok(out)
            }
            EntryType::Tree => Err(Error::WrongType {
                expected: "Blob",
                found: "Tree",
            }),
        }
    }

    /// ranged read of a Blob or LargeBlob entry
    pub fn read_content_at(
        &self,
        entry_type: EntryType,
        hash: &Hash,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        match entry_type {
            EntryType::Blob => {
                let content = self.get_blob(hash)?;
                let start = (offset as usize).min(content.len());
                let end = (start + len).min(content.len());
                Ok(content[start..end].to_vec())
            }
            EntryType::LargeBlob => {
                let large = self.get_large_blob(hash)?;
                let total = large.total_size();
                let start = offset.min(total);
                let end = (offset + len as u64).min(total);

                let mut out = Vec::with_capacity((end - start) as usize);
                let mut pos = start;
                while pos < end {
                    let idx = match large.fragment_at(pos) {
                        Some(i) => i,
                        None => break,
                    };
                    let frag = large.fragments()[idx];
                    let chunk = self.get_blob(&frag.hash)?;
                    let inner_start = (pos - frag.offset) as usize;
                    let inner_end = ((end - frag.offset) as usize).min(chunk.len());
                    out.extend_from_slice(&chunk[inner_start..inner_end]);
                    pos = frag.offset + inner_end as u64;
                }
                Ok(out)
            }
            EntryType::Tree => Err(Error::WrongType {
                expected: "Blob",
                found: "Tree",
            }),
        }
    }

    // ------------------------------------------------------------------
    // history

    /// commits with a non-empty snapshot name, reachable from HEAD
    pub fn list_snapshots(&self) -> Result<BTreeMap<String, Hash>> {
        let mut snapshots = BTreeMap::new();
        let head = self.head()?;
        if head.is_empty() {
            return Ok(snapshots);
        }

        let mut to_visit = vec![head];
        let mut visited = HashSet::new();
        while let Some(hash) = to_visit.pop() {
            if !visited.insert(hash) {
                continue;
            }
            let commit = self.get_commit(&hash)?;
            if !commit.snapshot_name.is_empty() {
                snapshots.entry(commit.snapshot_name.clone()).or_insert(hash);
            }
            to_visit.extend(commit.parents());
        }

        Ok(snapshots)
    }

    // ------------------------------------------------------------------
    // reference counting

    /// full store walk producing the incoming-edge index for every object
    pub fn compute_ref_counts(&self) -> Result<BTreeMap<Hash, BTreeSet<Hash>>> {
        let mut refs: BTreeMap<Hash, BTreeSet<Hash>> = BTreeMap::new();

        for hash in self.store.list_objects()? {
            refs.entry(hash).or_default();

            match self.store.type_of(&hash)? {
                ObjectType::Commit => {
                    let commit = Commit::decode(&self.store.get_bytes(&hash)?)?;
                    refs.entry(commit.tree).or_default().insert(hash);
                    for parent in commit.parents() {
                        refs.entry(parent).or_default().insert(hash);
                    }
                    // graft provenance may point outside this store
                    if !commit.graft_commit.is_empty()
                        && self.store.contains(&commit.graft_commit)
                    {
                        refs.entry(commit.graft_commit).or_default().insert(hash);
                    }
                }
                ObjectType::Tree => {
                    let tree = Tree::decode(&self.store.get_bytes(&hash)?)?;
                    for (_, entry) in tree.entries() {
                        refs.entry(entry.hash).or_default().insert(hash);
                    }
                }
                ObjectType::LargeBlob => {
                    let large = LargeBlob::decode(&self.store.get_bytes(&hash)?)?;
                    for frag in large.fragments() {
                        refs.entry(frag.hash).or_default().insert(hash);
                    }
                }
                ObjectType::Blob | ObjectType::Purged => {}
            }
        }

        Ok(refs)
    }

    /// rewrite every object's backref index from a full walk
    pub fn rebuild_refs(&self) -> Result<()> {
        let refs = self.compute_ref_counts()?;
        for (hash, froms) in &refs {
            if !self.store.contains(hash) {
                return Err(Error::Corrupted(format!(
                    "referenced object missing: {}",
                    hash
                )));
            }
            let role = match self.store.type_of(hash)? {
                ObjectType::Purged => BackrefRole::Purged,
                _ => BackrefRole::Ref,
            };
            let backrefs: Vec<_> = froms.iter().map(|f| (*f, role)).collect();
            self.store.set_backrefs(hash, &backrefs)?;
        }
        info!(objects = refs.len(), "rebuilt backref indexes");
        Ok(())
    }

    /// read an object's incoming-edge index
    pub fn get_refs(&self, hash: &Hash) -> Result<BTreeMap<Hash, BackrefRole>> {
        self.store.get_refs(hash)
    }

    // ------------------------------------------------------------------
    // verification

    /// re-hash one object and sanity-check its outgoing references.
    /// returns a description of the problem, or None when the object is good.
    pub fn verify_object(&self, hash: &Hash) -> Option<String> {
        let object_type = match self.store.verify(hash) {
            Ok(ObjectType::Purged) => return None,
            Ok(t) => t,
            Err(Error::IntegrityError(_)) => {
                return Some("payload digest does not match object name".to_string());
            }
            Err(e) => return Some(e.to_string()),
        };

        let payload = match self.store.get_bytes(hash) {
            Ok(p) => p,
            Err(e) => return Some(e.to_string()),
        };

        let targets: Vec<Hash> = match object_type {
            ObjectType::Commit => match Commit::decode(&payload) {
                Ok(c) => {
                    // graft provenance is not required to resolve locally
                    let mut t = vec![c.tree];
                    t.extend(c.parents());
                    t
                }
                Err(e) => return Some(e.to_string()),
            },
            ObjectType::Tree => match Tree::decode(&payload) {
                Ok(t) => t.entries().map(|(_, e)| e.hash).collect(),
                Err(e) => return Some(e.to_string()),
            },
            ObjectType::LargeBlob => match LargeBlob::decode(&payload) {
                Ok(l) => l.fragments().iter().map(|f| f.hash).collect(),
                Err(e) => return Some(e.to_string()),
            },
            ObjectType::Blob | ObjectType::Purged => vec![],
        };

        for target in targets {
            if !self.store.contains(&target) {
                return Some(format!("missing referenced object: {}", target));
            }
        }

        None
    }

    /// verify every object; collects per-object errors and keeps going
    pub fn verify(&self) -> Result<Vec<(Hash, String)>> {
        let mut problems = Vec::new();
        for hash in self.store.list_objects()? {
            if let Some(problem) = self.verify_object(&hash) {
                problems.push((hash, problem));
            }
        }
        Ok(problems)
    }

    /// commits with no incoming Ref backrefs, HEAD excluded
    pub fn find_lost_heads(&self) -> Result<Vec<Hash>> {
        let refs = self.compute_ref_counts()?;
        let head = self.head()?;
        let mut lost = Vec::new();

        for (hash, froms) in &refs {
            if *hash == head || !froms.is_empty() {
                continue;
            }
            if self.store.type_of(hash)? == ObjectType::Commit {
                lost.push(*hash);
            }
        }

        Ok(lost)
    }

    // ------------------------------------------------------------------
    // graft

    /// copy the subtree at `src_path` in the source repository's HEAD into
    /// this repository at `dst_path`, recording provenance in a new commit
    pub fn graft_subtree(&self, src: &Repo, src_path: &str, dst_path: &str) -> Result<Hash> {
        let src_head = src.head()?;
        if src_head.is_empty() {
            return Err(Error::InvalidArgument(
                "source repository has no commits".to_string(),
            ));
        }
        let src_commit = src.get_commit(&src_head)?;

        // resolve the source entry
        let src_entry = lookup_path(src, src_commit.tree, src_path)?;

        // import the transitive closure of the grafted entry
        self.import_entry(src, &src_entry)?;

        // splice it over the current HEAD tree
        let dst_components: Vec<&str> =
            dst_path.split('/').filter(|c| !c.is_empty()).collect();
        if dst_components.is_empty() {
            return Err(Error::InvalidArgument(
                "graft destination must name an entry".to_string(),
            ));
        }

        let head = self.head()?;
        let base_tree = if head.is_empty() {
            None
        } else {
            Some(self.get_commit(&head)?.tree)
        };
        let new_root = self.splice(base_tree, &dst_components, &src_entry)?;

        let mut commit = Commit::new(
            new_root,
            head,
            current_user(),
            unix_now(),
            format!("Graft of {} from {}", src_path, src.uuid()),
        );
        commit.set_graft(src.uuid(), src_path, src_head);

        let commit_hash = self.add_commit(&commit)?;
        self.update_head(&commit_hash)?;
        info!(src = src.uuid(), %src_path, %dst_path, commit = %commit_hash, "grafted subtree");
        Ok(commit_hash)
    }

    /// copy an entry and everything it references from another repository
    fn import_entry(&self, src: &Repo, entry: &TreeEntry) -> Result<()> {
        match entry.entry_type {
            EntryType::Blob => {
                self.import_object(src, &entry.hash, ObjectType::Blob)?;
            }
            EntryType::LargeBlob => {
                let large = src.get_large_blob(&entry.hash)?;
                for frag in large.fragments() {
                    self.import_object(src, &frag.hash, ObjectType::Blob)?;
                }
                self.import_object(src, &entry.hash, ObjectType::LargeBlob)?;
            }
            EntryType::Tree => {
                let tree = src.get_tree(&entry.hash)?;
                for (_, child) in tree.entries() {
                    self.import_entry(src, child)?;
                }
                self.import_object(src, &entry.hash, ObjectType::Tree)?;
            }
        }
        Ok(())
    }

    fn import_object(&self, src: &Repo, hash: &Hash, object_type: ObjectType) -> Result<()> {
        if self.store.contains(hash) {
            return Ok(());
        }
        let payload = src.store.get_bytes(hash)?;
        let stored = self.store.put_bytes(object_type, &payload)?;
        if stored != *hash {
            return Err(Error::IntegrityError(*hash));
        }
        Ok(())
    }

    /// rebuild the tree spine so `components` resolves to `entry`
    fn splice(
        &self,
        base: Option<Hash>,
        components: &[&str],
        entry: &TreeEntry,
    ) -> Result<Hash> {
        let mut tree = match base {
            Some(hash) => self.get_tree(&hash)?,
            None => Tree::new(),
        };

        let name = components[0];
        if components.len() == 1 {
            tree.insert(name, entry.clone())?;
        } else {
            let child_base = match tree.get(name) {
                Some(e) if e.entry_type.is_tree() => Some(e.hash),
                _ => None,
            };
            let child_hash = self.splice(child_base, &components[1..], entry)?;
            tree.insert(
                name,
                TreeEntry::new(EntryType::Tree, 0o755, child_hash, AttrMap::new()),
            )?;
        }

        self.add_tree(&tree)
    }
}

/// look up a slash-separated path inside a commit's tree
pub fn lookup_path(repo: &Repo, root_tree: Hash, path: &str) -> Result<TreeEntry> {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        return Ok(TreeEntry::new(
            EntryType::Tree,
            0o040755,
            root_tree,
            AttrMap::new(),
        ));
    }

    let mut current = root_tree;
    for (i, component) in components.iter().enumerate() {
        let tree = repo.get_tree(&current)?;
        let entry = tree
            .get(component)
            .ok_or_else(|| Error::PathNotFound(path.to_string()))?;
        if i == components.len() - 1 {
            return Ok(entry.clone());
        }
        if !entry.entry_type.is_tree() {
            return Err(Error::PathNotFound(path.to_string()));
        }
        current = entry.hash;
    }
    unreachable!("loop returns on the last component")
}

/// guard that holds the repository lock until dropped
pub struct RepoLock {
    _flock: Flock<File>,
}

/// hash content exactly as `add_content` would, without storing anything
pub fn content_hash(content: &[u8]) -> Result<Hash> {
    if content.len() as u64 <= LARGE_BLOB_THRESHOLD {
        return Ok(Hash::digest(content));
    }
    let mut fragments = Vec::new();
    for chunk in FastCDC::new(content, CHUNK_MIN, CHUNK_AVG, CHUNK_MAX) {
        fragments.push(Fragment {
            offset: chunk.offset as u64,
            length: chunk.length as u64,
            hash: Hash::digest(&content[chunk.offset..chunk.offset + chunk.length]),
        });
    }
    Ok(LargeBlob::new(fragments)?.hash())
}

/// the committing user's name
pub fn current_user() -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::current())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "ori".to_string())
}

/// seconds since the unix epoch
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

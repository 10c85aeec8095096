//! the mutable working set layered above a base commit
//!
//! the overlay keeps an in-memory namespace of FileInfo records guarded by a
//! single read-write lock. dirty content is backed by spill files under
//! `.ori/tmp/`; `commit` folds the namespace back into immutable store
//! objects and advances HEAD.

pub mod info;
pub mod journal;
pub mod snapshot;

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::repo::{current_user, unix_now, Repo, RepoLock};
use crate::types::{
    AttrMap, Commit, EntryType, Tree, TreeEntry, ATTR_CTIME, ATTR_FILESIZE, ATTR_MTIME,
    ATTR_USERNAME,
};

pub use info::{kind_from_mode, FileInfo, FileKind, FileState};
pub use journal::{Journal, JournalMode};
pub use snapshot::SnapshotView;

/// control file that reads back the repository root
pub const CONTROL_PATH: &str = "/.ori_control";
/// read-only virtual tree of named snapshots
pub const SNAPSHOT_DIR: &str = "/.snapshot";

/// stat-like view of one namespace entry
#[derive(Clone, Debug)]
pub struct FileAttr {
    pub id: u64,
    pub kind: FileKind,
    pub mode: u16,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
}

struct Namespace {
    /// absolute overlay path -> live entry ("/" included)
    entries: HashMap<String, Arc<Mutex<FileInfo>>>,
    /// directory path -> child names
    dirs: HashMap<String, BTreeSet<String>>,
    /// open handles
    handles: HashMap<u64, Arc<Mutex<FileInfo>>>,
    next_id: u64,
    next_fh: u64,
}

impl Namespace {
    fn new() -> Self {
        let mut entries = HashMap::new();
        let mut root = FileInfo::new_dir(1, 0o755, unix_now());
        root.state = FileState::Committed;
        entries.insert("/".to_string(), Arc::new(Mutex::new(root)));

        let mut dirs = HashMap::new();
        dirs.insert("/".to_string(), BTreeSet::new());

        Self {
            entries,
            dirs,
            handles: HashMap::new(),
            next_id: 2,
            next_fh: 1,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn alloc_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }

    fn get(&self, path: &str) -> Result<Arc<Mutex<FileInfo>>> {
        self.entries
            .get(path)
            .cloned()
            .ok_or_else(|| Error::PathNotFound(path.to_string()))
    }

    /// register a new entry under its parent directory
    fn link(&mut self, path: &str, info: FileInfo) -> Result<Arc<Mutex<FileInfo>>> {
        let is_dir = info.is_dir();
        let arc = Arc::new(Mutex::new(info));
        let parent = parent_path(path);
        let children = self
            .dirs
            .get_mut(parent)
            .ok_or_else(|| Error::PathNotFound(parent.to_string()))?;
        children.insert(basename(path).to_string());
        self.entries.insert(path.to_string(), arc.clone());
        if is_dir {
            self.dirs.insert(path.to_string(), BTreeSet::new());
        }
        Ok(arc)
    }

    /// drop an entry from the namespace
    fn unlink(&mut self, path: &str) {
        self.entries.remove(path);
        self.dirs.remove(path);
        if let Some(children) = self.dirs.get_mut(parent_path(path)) {
            children.remove(basename(path));
        }
    }
}

/// the live working set over an open repository
pub struct Overlay {
    repo: Repo,
    _lock: RepoLock,
    base: Mutex<Hash>,
    ns: RwLock<Namespace>,
    journal: Mutex<Journal>,
}

impl Overlay {
    /// open the overlay over the repository's HEAD.
    /// holds the repository lock for the overlay's lifetime (single writer).
    pub fn open(repo: Repo, journal_mode: JournalMode) -> Result<Self> {
        let lock = repo.lock()?;

        let mut ns = Namespace::new();
        let base = repo.head()?;
        if !base.is_empty() {
            let commit = repo.get_commit(&base)?;
            load_tree(&repo, &commit.tree, "/", &mut ns)?;
        }

        let journal = Journal::open(&repo.ori_path().join("journal"), journal_mode)?;

        info!(base = %base, root = %repo.root().display(), "overlay opened");

        Ok(Self {
            repo,
            _lock: lock,
            base: Mutex::new(base),
            ns: RwLock::new(ns),
            journal: Mutex::new(journal),
        })
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    /// the commit this overlay is layered on
    pub fn base(&self) -> Hash {
        *self.base.lock().unwrap()
    }

    fn journal(&self, op: &str, arg: &str) -> Result<()> {
        self.journal.lock().unwrap().record(op, arg)
    }

    // ------------------------------------------------------------------
    // creation

    /// create a new regular file, returning an open writing handle
    pub fn add_file(&self, path: &str, mode: u16) -> Result<u64> {
        check_mutable(path)?;
        let mut ns = self.ns.write().unwrap();
        self.check_create(&ns, path)?;

        let id = ns.alloc_id();
        let mut info = FileInfo::new_file(id, mode & 0o7777, unix_now());
        let spill = self.spill_path(id);
        info.file = Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&spill)
                .with_path(&spill)?,
        );
        info.spill = Some(spill);

        let arc = ns.link(path, info)?;
        self.mark_parent_dirty(&ns, path);

        let fh = ns.alloc_fh();
        ns.handles.insert(fh, arc);
        drop(ns);

        self.journal("create", path)?;
        debug!(%path, fh, "created file");
        Ok(fh)
    }

    /// create a directory
    pub fn add_dir(&self, path: &str, mode: u16) -> Result<()> {
        check_mutable(path)?;
        let mut ns = self.ns.write().unwrap();
        self.check_create(&ns, path)?;

        let id = ns.alloc_id();
        ns.link(path, FileInfo::new_dir(id, mode & 0o7777, unix_now()))?;
        self.mark_parent_dirty(&ns, path);
        drop(ns);

        self.journal("mkdir", path)?;
        Ok(())
    }

    /// create a symbolic link
    pub fn add_symlink(&self, path: &str, target: &str) -> Result<()> {
        check_mutable(path)?;
        let mut ns = self.ns.write().unwrap();
        self.check_create(&ns, path)?;

        let id = ns.alloc_id();
        ns.link(path, FileInfo::new_symlink(id, target, unix_now()))?;
        self.mark_parent_dirty(&ns, path);
        drop(ns);

        self.journal("symlink", &format!("{}:{}", path, target))?;
        Ok(())
    }

    fn check_create(&self, ns: &Namespace, path: &str) -> Result<()> {
        if ns.entries.contains_key(path) {
            return Err(Error::PathExists(path.to_string()));
        }
        let parent = parent_path(path);
        let parent_info = ns.get(parent)?;
        if !parent_info.lock().unwrap().is_dir() {
            return Err(Error::PathNotFound(parent.to_string()));
        }
        Ok(())
    }

    fn mark_parent_dirty(&self, ns: &Namespace, path: &str) {
        if let Ok(parent) = ns.get(parent_path(path)) {
            parent.lock().unwrap().mark_dirty(unix_now());
        }
    }

    // ------------------------------------------------------------------
    // open / read / write

    /// open an existing file. a writing open of committed content
    /// materializes a spill file streamed from the store.
    pub fn open_file(&self, path: &str, writing: bool, trunc: bool) -> Result<u64> {
        if is_reserved(path) {
            if writing {
                return Err(Error::AccessDenied(path.to_string()));
            }
            // virtual paths are served statelessly through read_path
            return Ok(0);
        }

        let mut ns = self.ns.write().unwrap();
        let arc = ns.get(path)?;
        {
            let mut fi = arc.lock().unwrap();
            if fi.is_dir() {
                return Err(Error::InvalidArgument(format!(
                    "cannot open directory: {}",
                    path
                )));
            }

            if writing {
                if fi.file.is_none() {
                    let spill = self.spill_path(fi.id);
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create_new(true)
                        .open(&spill)
                        .with_path(&spill)?;

                    if !trunc && !fi.hash.is_empty() {
                        let content = self.repo.read_content(fi.entry_type, &fi.hash)?;
                        file.write_all_at(&content, 0).with_path(&spill)?;
                    }
                    fi.file = Some(file);
                    fi.spill = Some(spill);
                }
                if trunc {
                    let file = fi.file.as_ref().expect("materialized above");
                    file.set_len(0).with_path(path)?;
                    fi.size = 0;
                    fi.mark_dirty(unix_now());
                }
            }
        }

        let fh = ns.alloc_fh();
        ns.handles.insert(fh, arc);
        debug!(%path, fh, writing, trunc, "opened file");
        Ok(fh)
    }

    /// read through an open handle: spill file when materialized,
    /// store objects otherwise
    pub fn read(&self, fh: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let arc = {
            let ns = self.ns.read().unwrap();
            ns.handles
                .get(&fh)
                .cloned()
                .ok_or_else(|| Error::InvalidArgument(format!("bad file handle: {}", fh)))?
        };

        // spill I/O happens outside the namespace lock
        let fi = arc.lock().unwrap();
        read_info(&self.repo, &fi, offset, len)
    }

    /// write through an open handle; the file must be open for writing
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let arc = {
            let ns = self.ns.write().unwrap();
            ns.handles
                .get(&fh)
                .cloned()
                .ok_or_else(|| Error::InvalidArgument(format!("bad file handle: {}", fh)))?
        };

        let mut fi = arc.lock().unwrap();
        let file = fi
            .file
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("file not open for writing".to_string()))?;
        file.write_all_at(data, offset)
            .with_path(PathBuf::from("<spill>"))?;
        fi.size = fi.size.max(offset + data.len() as u64);
        fi.mark_dirty(unix_now());
        Ok(data.len())
    }

    /// shrink or extend a file by path
    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        check_mutable(path)?;
        let arc = {
            let ns = self.ns.write().unwrap();
            ns.get(path)?
        };

        let mut fi = arc.lock().unwrap();
        if fi.is_dir() {
            return Err(Error::InvalidArgument(format!("not a file: {}", path)));
        }

        if fi.file.is_none() {
            let spill = self.spill_path(fi.id);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&spill)
                .with_path(&spill)?;
            if len > 0 && !fi.hash.is_empty() {
                let content = self.repo.read_content(fi.entry_type, &fi.hash)?;
                file.write_all_at(&content, 0).with_path(&spill)?;
            }
            fi.file = Some(file);
            fi.spill = Some(spill);
        }

        let file = fi.file.as_ref().expect("materialized above");
        file.set_len(len).with_path(path)?;
        fi.size = len;
        fi.mark_dirty(unix_now());
        drop(fi);

        self.journal("truncate", &format!("{}:{}", path, len))
    }

    /// drop an open handle
    pub fn release(&self, fh: u64) {
        let mut ns = self.ns.write().unwrap();
        ns.handles.remove(&fh);
    }

    // ------------------------------------------------------------------
    // path reads (also serve the virtual control/snapshot trees)

    /// stateless ranged read by path
    pub fn read_path(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        if path == CONTROL_PATH {
            let root = self.repo.root().display().to_string().into_bytes();
            let start = (offset as usize).min(root.len());
            let end = (start + len).min(root.len());
            return Ok(root[start..end].to_vec());
        }

        if let Some((name, rest)) = snapshot_parts(path) {
            let view = SnapshotView::resolve(&self.repo, &name)?;
            return view.read_at(&rest, offset, len);
        }

        let arc = {
            let ns = self.ns.read().unwrap();
            ns.get(path)?
        };
        let fi = arc.lock().unwrap();
        read_info(&self.repo, &fi, offset, len)
    }

    /// stat an overlay or virtual path
    pub fn getattr(&self, path: &str) -> Result<FileAttr> {
        if path == CONTROL_PATH {
            return Ok(FileAttr {
                id: 0,
                kind: FileKind::Regular,
                mode: 0o444,
                size: self.repo.root().display().to_string().len() as u64,
                mtime: 0,
                ctime: 0,
            });
        }

        if path == SNAPSHOT_DIR {
            return Ok(FileAttr {
                id: 0,
                kind: FileKind::Directory,
                mode: 0o555,
                size: 0,
                mtime: 0,
                ctime: 0,
            });
        }

        if let Some((name, rest)) = snapshot_parts(path) {
            let view = SnapshotView::resolve(&self.repo, &name)?;
            let entry = view.lookup(&rest)?;
            let kind = if entry.entry_type.is_tree() {
                FileKind::Directory
            } else {
                kind_from_mode(entry.mode)
            };
            let size = match kind {
                FileKind::Directory => 0,
                _ => entry
                    .attrs
                    .get_uint(ATTR_FILESIZE)
                    .map(Ok)
                    .unwrap_or_else(|| view.size_of(&entry))?,
            };
            return Ok(FileAttr {
                id: 0,
                kind,
                mode: entry.mode & 0o7777,
                size,
                mtime: entry.attrs.get_time(ATTR_MTIME).unwrap_or(0),
                ctime: entry.attrs.get_time(ATTR_CTIME).unwrap_or(0),
            });
        }

        let arc = {
            let ns = self.ns.read().unwrap();
            ns.get(path)?
        };
        let fi = arc.lock().unwrap();
        Ok(FileAttr {
            id: fi.id,
            kind: fi.kind,
            mode: fi.mode,
            size: fi.size,
            mtime: fi.mtime,
            ctime: fi.ctime,
        })
    }

    /// list a directory; the root listing includes the virtual names
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        if path == SNAPSHOT_DIR {
            return Ok(self.repo.list_snapshots()?.into_keys().collect());
        }
        if let Some((name, rest)) = snapshot_parts(path) {
            let view = SnapshotView::resolve(&self.repo, &name)?;
            return view.list(&rest);
        }

        let ns = self.ns.read().unwrap();
        let children = ns
            .dirs
            .get(path)
            .ok_or_else(|| Error::PathNotFound(path.to_string()))?;
        let mut names: Vec<String> = children.iter().cloned().collect();
        if path == "/" {
            names.push(".ori_control".to_string());
            names.push(".snapshot".to_string());
        }
        Ok(names)
    }

    /// read a symlink target
    pub fn readlink(&self, path: &str) -> Result<String> {
        let arc = {
            let ns = self.ns.read().unwrap();
            ns.get(path)?
        };
        let fi = arc.lock().unwrap();
        if fi.kind != FileKind::Symlink {
            return Err(Error::InvalidArgument(format!("not a symlink: {}", path)));
        }
        Ok(fi.link.clone())
    }

    // ------------------------------------------------------------------
    // metadata mutation

    pub fn chmod(&self, path: &str, mode: u16) -> Result<()> {
        check_mutable(path)?;
        let arc = {
            let ns = self.ns.write().unwrap();
            ns.get(path)?
        };
        let mut fi = arc.lock().unwrap();
        fi.mode = mode & 0o7777;
        fi.mark_dirty(unix_now());
        drop(fi);
        self.journal("chmod", path)
    }

    pub fn utimens(&self, path: &str, mtime: i64, ctime: i64) -> Result<()> {
        check_mutable(path)?;
        let arc = {
            let ns = self.ns.write().unwrap();
            ns.get(path)?
        };
        let mut fi = arc.lock().unwrap();
        fi.mtime = mtime;
        fi.ctime = ctime;
        fi.state = FileState::Dirty;
        drop(fi);
        self.journal("utimens", path)
    }

    /// change ownership; recorded as the USERNAME attribute on commit
    pub fn chown(&self, path: &str, uid: u32) -> Result<()> {
        check_mutable(path)?;
        let username = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_else(|| uid.to_string());

        let arc = {
            let ns = self.ns.write().unwrap();
            ns.get(path)?
        };
        let mut fi = arc.lock().unwrap();
        fi.username = username;
        fi.mark_dirty(unix_now());
        drop(fi);
        self.journal("chown", path)
    }

    // ------------------------------------------------------------------
    // namespace mutation

    /// rename a file or symlink; directory rename is refused
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        check_mutable(from)?;
        check_mutable(to)?;

        let mut ns = self.ns.write().unwrap();
        let from_arc = ns.get(from)?;
        if from_arc.lock().unwrap().is_dir() {
            return Err(Error::InvalidArgument(format!(
                "directory rename not supported: {}",
                from
            )));
        }

        let to_parent = parent_path(to);
        let to_parent_arc = ns.get(to_parent)?;
        if !to_parent_arc.lock().unwrap().is_dir() {
            return Err(Error::PathNotFound(to_parent.to_string()));
        }

        // replacing an existing destination
        if let Some(existing) = ns.entries.get(to).cloned() {
            let ex = existing.lock().unwrap();
            if ex.is_dir() {
                if !ns.dirs.get(to).map(|c| c.is_empty()).unwrap_or(true) {
                    return Err(Error::NotEmpty(to.to_string()));
                }
                return Err(Error::InvalidArgument(format!(
                    "cannot replace directory: {}",
                    to
                )));
            }
            if let Some(spill) = &ex.spill {
                let _ = fs::remove_file(spill);
            }
            drop(ex);
            ns.unlink(to);
        }

        ns.entries.remove(from);
        if let Some(children) = ns.dirs.get_mut(parent_path(from)) {
            children.remove(basename(from));
        }
        ns.entries.insert(to.to_string(), from_arc);
        ns.dirs
            .get_mut(to_parent)
            .expect("destination parent is a dir")
            .insert(basename(to).to_string());

        self.mark_parent_dirty(&ns, from);
        self.mark_parent_dirty(&ns, to);
        drop(ns);

        self.journal("rename", &format!("{}:{}", from, to))?;
        debug!(%from, %to, "renamed");
        Ok(())
    }

    /// remove a file or symlink
    pub fn unlink(&self, path: &str) -> Result<()> {
        check_mutable(path)?;
        let mut ns = self.ns.write().unwrap();
        let arc = ns.get(path)?;
        {
            let fi = arc.lock().unwrap();
            if fi.is_dir() {
                return Err(Error::InvalidArgument(format!(
                    "cannot unlink directory: {}",
                    path
                )));
            }
            if let Some(spill) = &fi.spill {
                let _ = fs::remove_file(spill);
            }
        }
        ns.unlink(path);
        self.mark_parent_dirty(&ns, path);
        drop(ns);

        self.journal("unlink", path)
    }

    /// remove an empty directory
    pub fn rmdir(&self, path: &str) -> Result<()> {
        check_mutable(path)?;
        let mut ns = self.ns.write().unwrap();
        let arc = ns.get(path)?;
        if !arc.lock().unwrap().is_dir() {
            return Err(Error::InvalidArgument(format!("not a directory: {}", path)));
        }
        if !ns.dirs.get(path).map(|c| c.is_empty()).unwrap_or(true) {
            return Err(Error::NotEmpty(path.to_string()));
        }
        ns.unlink(path);
        self.mark_parent_dirty(&ns, path);
        drop(ns);

        self.journal("rmdir", path)
    }

    // ------------------------------------------------------------------
    // commit pipeline

    /// fold the dirty working set into a new commit and advance HEAD.
    /// returns the base commit unchanged when nothing is dirty.
    pub fn commit(&self, message: &str, snapshot_name: Option<&str>) -> Result<Hash> {
        let ns = self.ns.write().unwrap();
        let base = *self.base.lock().unwrap();

        let any_dirty = ns
            .entries
            .values()
            .any(|arc| arc.lock().unwrap().is_dirty());
        if !any_dirty && !base.is_empty() && snapshot_name.is_none() {
            return Ok(base);
        }

        let user = current_user();

        // deepest directories first, so every child tree hash is ready
        // when its parent is encoded
        let mut dir_paths: Vec<String> = ns.dirs.keys().cloned().collect();
        dir_paths.sort_by_key(|p| std::cmp::Reverse(depth_of(p)));

        let mut tree_hashes: HashMap<String, Hash> = HashMap::new();
        for dir in &dir_paths {
            let mut tree = Tree::new();
            let children = &ns.dirs[dir];
            for name in children {
                let child_path = join_path(dir, name);
                let arc = ns.get(&child_path)?;
                let mut fi = arc.lock().unwrap();

                let (entry_type, hash) = match fi.kind {
                    FileKind::Directory => (
                        EntryType::Tree,
                        *tree_hashes
                            .get(&child_path)
                            .expect("child trees encoded before parents"),
                    ),
                    FileKind::Regular => {
                        if fi.is_dirty() {
                            let content = match &fi.spill {
                                Some(spill) => fs::read(spill).with_path(spill)?,
                                None => Vec::new(),
                            };
                            let (etype, hash) = self.repo.add_content(&content)?;
                            fi.entry_type = etype;
                            fi.hash = hash;
                            fi.size = content.len() as u64;
                            (etype, hash)
                        } else {
                            (fi.entry_type, fi.hash)
                        }
                    }
                    FileKind::Symlink => {
                        if fi.is_dirty() {
                            let hash = self.repo.add_blob(fi.link.as_bytes())?;
                            fi.entry_type = EntryType::Blob;
                            fi.hash = hash;
                        }
                        (EntryType::Blob, fi.hash)
                    }
                };

                let attrs = AttrMap::for_file(
                    &fi.username,
                    (fi.mode & 0o7777) as u64,
                    fi.size,
                    fi.mtime,
                    fi.ctime,
                );
                tree.insert(
                    name.clone(),
                    TreeEntry::new(entry_type, fi.tree_mode(), hash, attrs),
                )?;
            }
            tree_hashes.insert(dir.clone(), self.repo.add_tree(&tree)?);
        }

        let root_hash = tree_hashes["/"];
        let mut commit = Commit::new(root_hash, base, user, unix_now(), message);
        if let Some(name) = snapshot_name {
            commit.set_snapshot(name);
        }

        // every object above is durable before HEAD moves
        let commit_hash = self.repo.add_commit(&commit)?;
        self.repo.update_head(&commit_hash)?;

        // flip the namespace to committed and drop the spill area
        for arc in ns.entries.values() {
            let mut fi = arc.lock().unwrap();
            fi.state = FileState::Committed;
            fi.file = None;
            if let Some(spill) = fi.spill.take() {
                let _ = fs::remove_file(spill);
            }
        }
        *self.base.lock().unwrap() = commit_hash;
        drop(ns);

        self.journal.lock().unwrap().truncate()?;
        info!(commit = %commit_hash, %message, "overlay committed");
        Ok(commit_hash)
    }

    // ------------------------------------------------------------------
    // dirstate

    /// snapshot the namespace for crash recovery
    pub fn save_dirstate(&self) -> Result<()> {
        let ns = self.ns.read().unwrap();
        let mut entries = Vec::new();
        for (path, arc) in &ns.entries {
            if path == "/" {
                continue;
            }
            let fi = arc.lock().unwrap();
            entries.push(DirstateEntry {
                path: path.clone(),
                kind: fi.kind,
                mode: fi.mode,
                size: fi.size,
                mtime: fi.mtime,
                ctime: fi.ctime,
                username: fi.username.clone(),
                link: fi.link.clone(),
                spill: fi.spill.clone(),
                entry_type: entry_type_code(fi.entry_type),
                hash: fi.hash.to_hex(),
                state: fi.state,
            });
        }
        drop(ns);

        let dirstate = Dirstate {
            base: self.base().to_hex(),
            entries,
        };

        let mut buf = Vec::new();
        ciborium::into_writer(&dirstate, &mut buf)?;

        let path = self.repo.ori_path().join("dirstate");
        let tmp = self
            .repo
            .store()
            .tmp_path()
            .join(uuid::Uuid::new_v4().to_string());
        {
            let mut f = File::create(&tmp).with_path(&tmp)?;
            f.write_all(&buf).with_path(&tmp)?;
            f.sync_all().with_path(&tmp)?;
        }
        fs::rename(&tmp, &path).with_path(&path)?;
        Ok(())
    }

    /// restore the namespace from a saved dirstate, replacing live state
    pub fn load_dirstate(&self) -> Result<()> {
        let path = self.repo.ori_path().join("dirstate");
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::PathNotFound(path.display().to_string())
            } else {
                Error::Io {
                    path: path.clone(),
                    source: e,
                }
            }
        })?;
        let dirstate: Dirstate = ciborium::from_reader(&bytes[..])?;

        let mut ns = Namespace::new();
        let mut sorted = dirstate.entries;
        sorted.sort_by_key(|e| depth_of(&e.path));
        for entry in sorted {
            let id = ns.alloc_id();
            let mut fi = match entry.kind {
                FileKind::Regular => FileInfo::new_file(id, entry.mode, entry.mtime),
                FileKind::Directory => FileInfo::new_dir(id, entry.mode, entry.mtime),
                FileKind::Symlink => FileInfo::new_symlink(id, &entry.link, entry.mtime),
            };
            fi.size = entry.size;
            fi.mtime = entry.mtime;
            fi.ctime = entry.ctime;
            fi.username = entry.username;
            fi.entry_type = entry_type_from_code(entry.entry_type)?;
            fi.hash = Hash::from_hex(&entry.hash)?;
            fi.state = entry.state;
            if let Some(spill) = entry.spill {
                if spill.exists() {
                    fi.file = Some(
                        OpenOptions::new()
                            .read(true)
                            .write(true)
                            .open(&spill)
                            .with_path(&spill)?,
                    );
                    fi.spill = Some(spill);
                }
            }
            ns.link(&entry.path, fi)?;
        }

        *self.ns.write().unwrap() = ns;
        *self.base.lock().unwrap() = Hash::from_hex(&dirstate.base)?;
        Ok(())
    }

    fn spill_path(&self, id: u64) -> PathBuf {
        self.repo
            .store()
            .tmp_path()
            .join(format!("spill-{}-{}", id, uuid::Uuid::new_v4()))
    }
}

/// read a file's content through its FileInfo: spill when present,
/// store objects otherwise
fn read_info(repo: &Repo, fi: &FileInfo, offset: u64, len: usize) -> Result<Vec<u8>> {
    if fi.is_dir() {
        return Err(Error::InvalidArgument("cannot read a directory".to_string()));
    }
    if let Some(file) = &fi.file {
        if offset >= fi.size {
            return Ok(Vec::new());
        }
        let want = len.min((fi.size - offset) as usize);
        let mut buf = vec![0u8; want];
        let n = file.read_at(&mut buf, offset).with_path(PathBuf::from("<spill>"))?;
        buf.truncate(n);
        return Ok(buf);
    }
    if fi.hash.is_empty() {
        return Ok(Vec::new());
    }
    repo.read_content_at(fi.entry_type, &fi.hash, offset, len)
}

/// populate the namespace from a committed tree
fn load_tree(repo: &Repo, tree_hash: &Hash, prefix: &str, ns: &mut Namespace) -> Result<()> {
    let tree = repo.get_tree(tree_hash)?;
    for (name, entry) in tree.entries() {
        let path = join_path(prefix, name);
        let id = ns.alloc_id();
        let now = entry.attrs.get_time(ATTR_MTIME).unwrap_or(0);
        let username = entry.attrs.get_str(ATTR_USERNAME).map(str::to_string);

        match kind_from_mode(entry.mode) {
            FileKind::Directory => {
                let mut fi = FileInfo::new_dir(id, entry.mode & 0o7777, now);
                fi.state = FileState::Committed;
                fi.ctime = entry.attrs.get_time(ATTR_CTIME).unwrap_or(now);
                if let Some(username) = username {
                    fi.username = username;
                }
                ns.link(&path, fi)?;
                load_tree(repo, &entry.hash, &path, ns)?;
            }
            FileKind::Symlink => {
                let target = String::from_utf8_lossy(&repo.get_blob(&entry.hash)?).to_string();
                let mut fi = FileInfo::new_symlink(id, &target, now);
                fi.state = FileState::Committed;
                fi.entry_type = entry.entry_type;
                fi.hash = entry.hash;
                if let Some(username) = username {
                    fi.username = username;
                }
                ns.link(&path, fi)?;
            }
            FileKind::Regular => {
                let mut fi = FileInfo::new_file(id, entry.mode & 0o7777, now);
                fi.state = FileState::Committed;
                fi.entry_type = entry.entry_type;
                fi.hash = entry.hash;
                fi.ctime = entry.attrs.get_time(ATTR_CTIME).unwrap_or(now);
                fi.size = match entry.attrs.get_uint(ATTR_FILESIZE) {
                    Some(size) => size,
                    None => content_size(repo, entry)?,
                };
                if let Some(username) = username {
                    fi.username = username;
                }
                ns.link(&path, fi)?;
            }
        }
    }
    Ok(())
}

/// size of a committed entry when the FILESIZE attribute is absent
fn content_size(repo: &Repo, entry: &TreeEntry) -> Result<u64> {
    match entry.entry_type {
        EntryType::Blob => match repo.get_blob(&entry.hash) {
            Ok(content) => Ok(content.len() as u64),
            // purged blobs keep their place with unknown size
            Err(Error::WrongType { .. }) => Ok(0),
            Err(e) => Err(e),
        },
        EntryType::LargeBlob => Ok(repo.get_large_blob(&entry.hash)?.total_size()),
        EntryType::Tree => Ok(0),
    }
}

/// reserved paths refuse mutation
fn check_mutable(path: &str) -> Result<()> {
    if is_reserved(path) {
        return Err(Error::AccessDenied(path.to_string()));
    }
    if path == "/" {
        return Err(Error::InvalidArgument("cannot modify root".to_string()));
    }
    Ok(())
}

fn is_reserved(path: &str) -> bool {
    path == CONTROL_PATH
        || path == SNAPSHOT_DIR
        || path.starts_with("/.snapshot/")
}

/// split "/.snapshot/<name>/<rest>" into (name, rest)
fn snapshot_parts(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix("/.snapshot/")?;
    match rest.split_once('/') {
        Some((name, inner)) => Some((name.to_string(), inner.to_string())),
        None => Some((rest.to_string(), String::new())),
    }
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "/",
    }
}

fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn depth_of(path: &str) -> usize {
    if path == "/" {
        0
    } else {
        path.matches('/').count()
    }
}

fn entry_type_code(t: EntryType) -> u8 {
    match t {
        EntryType::Blob => 1,
        EntryType::LargeBlob => 2,
        EntryType::Tree => 3,
    }
}

fn entry_type_from_code(code: u8) -> Result<EntryType> {
    match code {
        1 => Ok(EntryType::Blob),
        2 => Ok(EntryType::LargeBlob),
        3 => Ok(EntryType::Tree),
        _ => Err(Error::Malformed(format!("bad entry type code: {}", code))),
    }
}

#[derive(Serialize, Deserialize)]
struct DirstateEntry {
    path: String,
    kind: FileKind,
    mode: u16,
    size: u64,
    mtime: i64,
    ctime: i64,
    username: String,
    link: String,
    spill: Option<PathBuf>,
    entry_type: u8,
    hash: String,
    state: FileState,
}

#[derive(Serialize, Deserialize)]
struct Dirstate {
    base: String,
    entries: Vec<DirstateEntry>,
}

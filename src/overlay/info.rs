use std::fs::File;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::hash::Hash;
use crate::types::EntryType;

/// mode-bit masks mirrored from st_mode
pub const MODE_TYPE_MASK: u16 = 0o170000;
pub const MODE_REG: u16 = 0o100000;
pub const MODE_DIR: u16 = 0o040000;
pub const MODE_SYMLINK: u16 = 0o120000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

/// dirty files fold into the next commit; committed files are backed by
/// store objects. commit is the only transition back to Committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    Committed,
    Dirty,
}

/// one live entry in the overlay namespace
pub struct FileInfo {
    pub id: u64,
    pub kind: FileKind,
    /// permission bits (no type bits)
    pub mode: u16,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
    /// owner recorded in the USERNAME attribute on commit
    pub username: String,
    /// symlink target
    pub link: String,
    /// spill file backing dirty content
    pub spill: Option<PathBuf>,
    /// open handle onto the spill file
    pub file: Option<File>,
    /// committed content kind (meaningful when hash is set)
    pub entry_type: EntryType,
    /// committed content hash, ZERO while dirty
    pub hash: Hash,
    pub state: FileState,
}

impl FileInfo {
    pub fn new_file(id: u64, mode: u16, now: i64) -> Self {
        Self {
            id,
            kind: FileKind::Regular,
            mode,
            size: 0,
            mtime: now,
            ctime: now,
            username: crate::repo::current_user(),
            link: String::new(),
            spill: None,
            file: None,
            entry_type: EntryType::Blob,
            hash: Hash::ZERO,
            state: FileState::Dirty,
        }
    }

    pub fn new_dir(id: u64, mode: u16, now: i64) -> Self {
        Self {
            kind: FileKind::Directory,
            ..Self::new_file(id, mode, now)
        }
    }

    pub fn new_symlink(id: u64, target: &str, now: i64) -> Self {
        Self {
            kind: FileKind::Symlink,
            mode: 0o777,
            size: target.len() as u64,
            link: target.to_string(),
            ..Self::new_file(id, 0o777, now)
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_dirty(&self) -> bool {
        self.state == FileState::Dirty
    }

    /// mark modified; the committed hash no longer describes this entry
    pub fn mark_dirty(&mut self, now: i64) {
        self.state = FileState::Dirty;
        self.mtime = now;
    }

    /// full st_mode-style bits for tree entries
    pub fn tree_mode(&self) -> u16 {
        match self.kind {
            FileKind::Regular => MODE_REG | (self.mode & 0o7777),
            FileKind::Directory => MODE_DIR | (self.mode & 0o7777),
            FileKind::Symlink => MODE_SYMLINK | 0o777,
        }
    }
}

/// kind recovered from tree-entry mode bits
pub fn kind_from_mode(mode: u16) -> FileKind {
    match mode & MODE_TYPE_MASK {
        MODE_DIR => FileKind::Directory,
        MODE_SYMLINK => FileKind::Symlink,
        _ => FileKind::Regular,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_file_is_dirty() {
        let info = FileInfo::new_file(1, 0o644, 100);
        assert!(info.is_dirty());
        assert!(info.hash.is_empty());
        assert_eq!(info.kind, FileKind::Regular);
    }

    #[test]
    fn test_tree_mode_bits() {
        let f = FileInfo::new_file(1, 0o644, 0);
        assert_eq!(f.tree_mode(), 0o100644);

        let d = FileInfo::new_dir(2, 0o755, 0);
        assert_eq!(d.tree_mode(), 0o040755);

        let l = FileInfo::new_symlink(3, "/t", 0);
        assert_eq!(l.tree_mode(), 0o120777);
    }

    #[test]
    fn test_kind_from_mode_roundtrip() {
        for kind in [FileKind::Regular, FileKind::Directory, FileKind::Symlink] {
            let info = match kind {
                FileKind::Regular => FileInfo::new_file(1, 0o600, 0),
                FileKind::Directory => FileInfo::new_dir(1, 0o700, 0),
                FileKind::Symlink => FileInfo::new_symlink(1, "x", 0),
            };
            assert_eq!(kind_from_mode(info.tree_mode()), kind);
        }
    }

    #[test]
    fn test_symlink_size_tracks_target() {
        let info = FileInfo::new_symlink(1, "/some/target", 0);
        assert_eq!(info.size, 12);
        assert_eq!(info.link, "/some/target");
    }
}

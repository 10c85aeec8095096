//! directory-sharded repository of object files keyed by hash
//!
//! objects live at `.ori/objs/<xx>/<rest>`; insertion stages into
//! `.ori/tmp/` and renames into place, so a crash never leaves a partial
//! object visible and duplicate insertion is a no-op.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::object::{
    encode_object, frame_payload, parse_frame, reframe_object, BackrefRole, ObjectFile, ObjectType,
};
use crate::stream::ByteStream;

/// content-addressed object store rooted at a `.ori` directory
pub struct Store {
    ori_dir: PathBuf,
}

impl Store {
    pub fn new(ori_dir: impl Into<PathBuf>) -> Self {
        Self {
            ori_dir: ori_dir.into(),
        }
    }

    pub fn objs_path(&self) -> PathBuf {
        self.ori_dir.join("objs")
    }

    pub fn tmp_path(&self) -> PathBuf {
        self.ori_dir.join("tmp")
    }

    /// filesystem path for an object
    pub fn object_path(&self, hash: &Hash) -> PathBuf {
        let (dir, file) = hash.to_path_components();
        self.objs_path().join(dir).join(file)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.object_path(hash).exists()
    }

    /// insert canonical payload bytes, returning their hash.
    /// inserting bytes already present is a no-op.
    pub fn put_bytes(&self, object_type: ObjectType, payload: &[u8]) -> Result<Hash> {
        let hash = Hash::digest(payload);
        let path = self.object_path(&hash);
        if path.exists() {
            return Ok(hash);
        }

        let bytes = encode_object(object_type, payload, &[])?;
        self.stage_and_rename(&path, &bytes)?;
        Ok(hash)
    }

    /// stream over an object's decompressed payload
    pub fn get(&self, hash: &Hash) -> Result<Box<dyn ByteStream>> {
        let obj = self.open_object(hash)?;
        obj.payload_stream()
    }

    /// read an object's decompressed payload into memory
    pub fn get_bytes(&self, hash: &Hash) -> Result<Vec<u8>> {
        let bytes = self.read_raw(hash)?;
        let frame = parse_frame(&bytes)?;
        frame_payload(&bytes, &frame)
    }

    /// read the object's type tag
    pub fn type_of(&self, hash: &Hash) -> Result<ObjectType> {
        Ok(self.open_object(hash)?.object_type())
    }

    /// enumerate every object in the shard directories
    pub fn list_objects(&self) -> Result<Vec<Hash>> {
        let dir = self.objs_path();
        let mut hashes = Vec::new();

        if !dir.exists() {
            return Ok(hashes);
        }

        for entry in WalkDir::new(&dir).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| Error::Io {
                path: dir.clone(),
                source: e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walkdir error")
                }),
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let parent_name = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or("");

            let hex = format!("{}{}", parent_name, file_name);
            if let Ok(hash) = Hash::from_hex(&hex) {
                hashes.push(hash);
            }
        }

        hashes.sort();
        Ok(hashes)
    }

    /// insert a purged tombstone under a known hash (replication of an
    /// already-purged remote object)
    pub fn put_purged(&self, hash: &Hash) -> Result<()> {
        let path = self.object_path(hash);
        if path.exists() {
            return Ok(());
        }
        let bytes = encode_object(ObjectType::Purged, &[], &[])?;
        self.stage_and_rename(&path, &bytes)
    }

    /// replace a blob's payload with a tombstone, keeping hash and backrefs
    pub fn purge(&self, hash: &Hash) -> Result<()> {
        let bytes = self.read_raw(hash)?;
        let frame = parse_frame(&bytes)?;
        if frame.object_type != ObjectType::Blob {
            return Err(Error::InvalidArgument(format!(
                "only Blob objects can be purged, {} is {}",
                hash,
                frame.object_type.name()
            )));
        }

        let purged = reframe_object(&frame, ObjectType::Purged, &[], &frame.backrefs);
        self.stage_and_rename(&self.object_path(hash), &purged)
    }

    /// record that `from` names this object in the given role
    pub fn add_backref(&self, hash: &Hash, from: &Hash, role: BackrefRole) -> Result<()> {
        let bytes = self.read_raw(hash)?;
        let frame = parse_frame(&bytes)?;

        if frame.backrefs.iter().any(|(h, r)| h == from && *r == role) {
            return Ok(());
        }

        let mut backrefs = frame.backrefs.clone();
        backrefs.push((*from, role));

        let region = &bytes[frame.payload_start..frame.payload_end];
        let updated = reframe_object(&frame, frame.object_type, region, &backrefs);
        self.stage_and_rename(&self.object_path(hash), &updated)
    }

    /// wholesale replacement of the backref index (rebuildrefs)
    pub fn set_backrefs(&self, hash: &Hash, backrefs: &[(Hash, BackrefRole)]) -> Result<()> {
        let bytes = self.read_raw(hash)?;
        let frame = parse_frame(&bytes)?;
        let region = &bytes[frame.payload_start..frame.payload_end];
        let updated = reframe_object(&frame, frame.object_type, region, backrefs);
        self.stage_and_rename(&self.object_path(hash), &updated)
    }

    /// drop the backref index
    pub fn clear_metadata(&self, hash: &Hash) -> Result<()> {
        self.set_backrefs(hash, &[])
    }

    /// read the per-object backref index
    pub fn get_refs(&self, hash: &Hash) -> Result<BTreeMap<Hash, BackrefRole>> {
        let bytes = self.read_raw(hash)?;
        let frame = parse_frame(&bytes)?;
        Ok(frame.backrefs.into_iter().collect())
    }

    /// recompute the digest over the decoded payload and compare it to the
    /// object's name. purged objects pass without a digest check.
    pub fn verify(&self, hash: &Hash) -> Result<ObjectType> {
        let bytes = self.read_raw(hash)?;
        let frame = parse_frame(&bytes)?;

        if frame.object_type == ObjectType::Purged {
            return Ok(ObjectType::Purged);
        }

        let payload = frame_payload(&bytes, &frame)?;
        if Hash::digest(&payload) != *hash {
            return Err(Error::IntegrityError(*hash));
        }
        Ok(frame.object_type)
    }

    fn open_object(&self, hash: &Hash) -> Result<ObjectFile> {
        let path = self.object_path(hash);
        ObjectFile::open(&path).map_err(|e| match e {
            Error::PathNotFound(_) => Error::ObjectNotFound(*hash),
            other => other,
        })
    }

    fn read_raw(&self, hash: &Hash) -> Result<Vec<u8>> {
        let path = self.object_path(hash);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ObjectNotFound(*hash)
            } else {
                Error::Io { path, source: e }
            }
        })
    }

    /// atomic write: temp file in tmp/ -> fsync -> rename -> fsync parent dir
    fn stage_and_rename(&self, final_path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = final_path
            .parent()
            .expect("object path always has a shard parent");
        fs::create_dir_all(parent).with_path(parent)?;

        let tmp_path = self.tmp_path().join(uuid::Uuid::new_v4().to_string());
        {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp_file.write_all(bytes).with_path(&tmp_path)?;
            tmp_file.sync_all().with_path(&tmp_path)?;
        }

        fs::rename(&tmp_path, final_path).with_path(final_path)?;
        fsync_dir(parent)
    }
}

/// fsync a directory
pub(crate) fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let ori = dir.path().join(".ori");
        fs::create_dir_all(ori.join("objs")).unwrap();
        fs::create_dir_all(ori.join("tmp")).unwrap();
        let store = Store::new(ori);
        (dir, store)
    }

    #[test]
    fn test_put_and_get() {
        let (_dir, store) = test_store();

        let hash = store.put_bytes(ObjectType::Blob, b"hello").unwrap();
        assert_eq!(
            hash.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(store.contains(&hash));
        assert_eq!(store.get_bytes(&hash).unwrap(), b"hello");
        assert_eq!(store.get(&hash).unwrap().read_all().unwrap(), b"hello");
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let (_dir, store) = test_store();

        let h1 = store.put_bytes(ObjectType::Blob, b"same bytes").unwrap();
        let mtime1 = fs::metadata(store.object_path(&h1)).unwrap().modified().unwrap();

        let h2 = store.put_bytes(ObjectType::Blob, b"same bytes").unwrap();
        assert_eq!(h1, h2);

        let mtime2 = fs::metadata(store.object_path(&h1)).unwrap().modified().unwrap();
        assert_eq!(mtime1, mtime2);

        // exactly one object on disk
        assert_eq!(store.list_objects().unwrap().len(), 1);
    }

    #[test]
    fn test_type_of() {
        let (_dir, store) = test_store();

        let b = store.put_bytes(ObjectType::Blob, b"blob").unwrap();
        let t = store.put_bytes(ObjectType::Tree, b"tree-bytes").unwrap();

        assert_eq!(store.type_of(&b).unwrap(), ObjectType::Blob);
        assert_eq!(store.type_of(&t).unwrap(), ObjectType::Tree);
    }

    #[test]
    fn test_get_missing() {
        let (_dir, store) = test_store();
        let missing = Hash::digest(b"never stored");
        assert!(matches!(
            store.get_bytes(&missing),
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_list_objects() {
        let (_dir, store) = test_store();

        let mut expected = vec![
            store.put_bytes(ObjectType::Blob, b"one").unwrap(),
            store.put_bytes(ObjectType::Blob, b"two").unwrap(),
            store.put_bytes(ObjectType::Tree, b"three").unwrap(),
        ];
        expected.sort();

        assert_eq!(store.list_objects().unwrap(), expected);
    }

    #[test]
    fn test_backref_maintenance() {
        let (_dir, store) = test_store();

        let target = store.put_bytes(ObjectType::Blob, b"target").unwrap();
        let from = Hash::digest(b"commit-a");

        store.add_backref(&target, &from, BackrefRole::Ref).unwrap();
        // duplicate add is a no-op
        store.add_backref(&target, &from, BackrefRole::Ref).unwrap();

        let refs = store.get_refs(&target).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs.get(&from), Some(&BackrefRole::Ref));

        // index mutation leaves payload intact
        assert_eq!(store.get_bytes(&target).unwrap(), b"target");

        store.clear_metadata(&target).unwrap();
        assert!(store.get_refs(&target).unwrap().is_empty());
    }

    #[test]
    fn test_purge_preserves_identity() {
        let (_dir, store) = test_store();

        let hash = store.put_bytes(ObjectType::Blob, b"doomed").unwrap();
        let from = Hash::digest(b"tree-x");
        store.add_backref(&hash, &from, BackrefRole::Ref).unwrap();

        store.purge(&hash).unwrap();

        assert_eq!(store.type_of(&hash).unwrap(), ObjectType::Purged);
        assert!(store.get_bytes(&hash).unwrap().is_empty());
        // backrefs survive the purge
        let refs = store.get_refs(&hash).unwrap();
        assert_eq!(refs.get(&from), Some(&BackrefRole::Ref));
        // verify reports purged, not corrupt
        assert_eq!(store.verify(&hash).unwrap(), ObjectType::Purged);
    }

    #[test]
    fn test_purge_rejects_non_blob() {
        let (_dir, store) = test_store();
        let hash = store.put_bytes(ObjectType::Tree, b"a tree").unwrap();
        assert!(matches!(
            store.purge(&hash),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let (_dir, store) = test_store();

        let good = store.put_bytes(ObjectType::Blob, b"intact").unwrap();
        let bad = store.put_bytes(ObjectType::Blob, b"to be damaged").unwrap();

        // flip one payload byte
        let path = store.object_path(&bad);
        let mut bytes = fs::read(&path).unwrap();
        bytes[6] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(store.verify(&good).is_ok());
        assert!(matches!(
            store.verify(&bad),
            Err(Error::IntegrityError(h)) if h == bad
        ));
    }

    #[test]
    fn test_large_payload_compressed_hash_unchanged() {
        let (_dir, store) = test_store();

        let payload = b"compress me ".repeat(4096);
        let hash = store.put_bytes(ObjectType::Blob, &payload).unwrap();

        // hash covers the uncompressed canonical bytes
        assert_eq!(hash, Hash::digest(&payload));
        assert_eq!(store.get_bytes(&hash).unwrap(), payload);

        // on-disk file is smaller than the payload
        let disk = fs::metadata(store.object_path(&hash)).unwrap().len();
        assert!(disk < payload.len() as u64);

        assert!(store.verify(&hash).is_ok());
    }
}

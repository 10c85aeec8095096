//! on-disk framing of a single immutable object
//!
//! layout: `[4B ASCII tag][1B compression flag][payload][backref index]`.
//! the backref index is a list of 33-byte `(from hash, role)` records with
//! the u32 record count in the final four bytes, so the payload boundary is
//! recoverable without decoding the payload.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::stream::{ByteStream, FdStream, LzmaStream};

/// framing header size: 4-byte tag + 1-byte compression flag
pub const ORI_OBJECT_HDRSIZE: u64 = 5;

/// payloads at or above this size are LZMA-compressed on disk.
/// compression is observable only in framing; hashes cover the raw payload.
pub const COMPRESS_THRESHOLD: usize = 4096;

const COMPRESS_NONE: u8 = 0;
const COMPRESS_LZMA: u8 = 1;

const BACKREF_RECORD_SIZE: usize = 33;

/// object kind, stored as a 4-byte ASCII tag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    Commit,
    Tree,
    Blob,
    LargeBlob,
    Purged,
}

impl ObjectType {
    pub fn tag(&self) -> &'static [u8; 4] {
        match self {
            ObjectType::Commit => b"CMMT",
            ObjectType::Tree => b"TREE",
            ObjectType::Blob => b"BLOB",
            ObjectType::LargeBlob => b"LGBL",
            ObjectType::Purged => b"PURG",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Result<Self> {
        match tag {
            b"CMMT" => Ok(ObjectType::Commit),
            b"TREE" => Ok(ObjectType::Tree),
            b"BLOB" => Ok(ObjectType::Blob),
            b"LGBL" => Ok(ObjectType::LargeBlob),
            b"PURG" => Ok(ObjectType::Purged),
            _ => Err(Error::Malformed(format!(
                "unknown object tag: {:?}",
                String::from_utf8_lossy(tag)
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ObjectType::Commit => "Commit",
            ObjectType::Tree => "Tree",
            ObjectType::Blob => "Blob",
            ObjectType::LargeBlob => "LargeBlob",
            ObjectType::Purged => "Purged",
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// role of a recorded incoming edge
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackrefRole {
    Ref,
    Purged,
}

impl BackrefRole {
    fn code(&self) -> u8 {
        match self {
            BackrefRole::Ref => 0,
            BackrefRole::Purged => 1,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(BackrefRole::Ref),
            1 => Ok(BackrefRole::Purged),
            _ => Err(Error::Malformed(format!("unknown backref role: {}", code))),
        }
    }
}

/// parsed object frame: header fields plus region offsets into the raw bytes
#[derive(Debug)]
pub struct Frame {
    pub object_type: ObjectType,
    pub compression: u8,
    pub payload_start: usize,
    pub payload_end: usize,
    pub backrefs: Vec<(Hash, BackrefRole)>,
}

/// encode a full object file: header, (possibly compressed) payload, index
pub fn encode_object(
    object_type: ObjectType,
    payload: &[u8],
    backrefs: &[(Hash, BackrefRole)],
) -> Result<Vec<u8>> {
    let (flag, stored) = if payload.len() >= COMPRESS_THRESHOLD {
        (COMPRESS_LZMA, crate::stream::lzma_compress(payload)?)
    } else {
        (COMPRESS_NONE, payload.to_vec())
    };

    let mut out = Vec::with_capacity(ORI_OBJECT_HDRSIZE as usize + stored.len());
    out.extend_from_slice(object_type.tag());
    out.push(flag);
    out.extend_from_slice(&stored);
    append_backref_index(&mut out, backrefs);
    Ok(out)
}

/// re-frame an object keeping its payload region byte-for-byte, with a new
/// tag and backref index (used by purge and backref maintenance)
pub fn reframe_object(
    frame: &Frame,
    object_type: ObjectType,
    payload_region: &[u8],
    backrefs: &[(Hash, BackrefRole)],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(ORI_OBJECT_HDRSIZE as usize + payload_region.len());
    out.extend_from_slice(object_type.tag());
    out.push(if payload_region.is_empty() {
        COMPRESS_NONE
    } else {
        frame.compression
    });
    out.extend_from_slice(payload_region);
    append_backref_index(&mut out, backrefs);
    out
}

fn append_backref_index(out: &mut Vec<u8>, backrefs: &[(Hash, BackrefRole)]) {
    for (hash, role) in backrefs {
        out.extend_from_slice(hash.as_bytes());
        out.push(role.code());
    }
    out.extend_from_slice(&(backrefs.len() as u32).to_le_bytes());
}

/// parse a complete object file held in memory
pub fn parse_frame(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < ORI_OBJECT_HDRSIZE as usize + 4 {
        return Err(Error::Malformed("object file too short".to_string()));
    }

    let object_type = ObjectType::from_tag(&bytes[..4])?;
    let compression = bytes[4];
    if compression != COMPRESS_NONE && compression != COMPRESS_LZMA {
        return Err(Error::Malformed(format!(
            "unknown compression flag: {}",
            compression
        )));
    }

    let count_pos = bytes.len() - 4;
    let count = u32::from_le_bytes([
        bytes[count_pos],
        bytes[count_pos + 1],
        bytes[count_pos + 2],
        bytes[count_pos + 3],
    ]) as usize;
    let index_len = count * BACKREF_RECORD_SIZE;
    let payload_end = count_pos
        .checked_sub(index_len)
        .ok_or_else(|| Error::Malformed("backref index overruns file".to_string()))?;
    if payload_end < ORI_OBJECT_HDRSIZE as usize {
        return Err(Error::Malformed("backref index overruns file".to_string()));
    }

    let mut backrefs = Vec::with_capacity(count);
    for i in 0..count {
        let rec = &bytes[payload_end + i * BACKREF_RECORD_SIZE..];
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&rec[..32]);
        backrefs.push((Hash::from_bytes(arr), BackrefRole::from_code(rec[32])?));
    }

    Ok(Frame {
        object_type,
        compression,
        payload_start: ORI_OBJECT_HDRSIZE as usize,
        payload_end,
        backrefs,
    })
}

/// extract the decompressed payload from a parsed frame
pub fn frame_payload(bytes: &[u8], frame: &Frame) -> Result<Vec<u8>> {
    let region = &bytes[frame.payload_start..frame.payload_end];
    if frame.compression == COMPRESS_LZMA {
        let inner = Box::new(crate::stream::MemStream::new(region.to_vec()));
        LzmaStream::new(inner, 0).read_all()
    } else {
        Ok(region.to_vec())
    }
}

/// an object file opened for streaming reads
pub struct ObjectFile {
    path: PathBuf,
    object_type: ObjectType,
    compression: u8,
    payload_len: u64,
}

impl ObjectFile {
    /// open and validate the framing without reading the payload
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::PathNotFound(path.display().to_string())
            } else {
                Error::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        let size = file.metadata().with_path(path)?.len();
        if size < ORI_OBJECT_HDRSIZE + 4 {
            return Err(Error::Malformed("object file too short".to_string()));
        }

        let mut header = [0u8; 5];
        file.read_exact(&mut header).with_path(path)?;
        let object_type = ObjectType::from_tag(&header[..4])?;
        let compression = header[4];
        if compression != COMPRESS_NONE && compression != COMPRESS_LZMA {
            return Err(Error::Malformed(format!(
                "unknown compression flag: {}",
                compression
            )));
        }

        file.seek(SeekFrom::End(-4)).with_path(path)?;
        let mut count_buf = [0u8; 4];
        file.read_exact(&mut count_buf).with_path(path)?;
        let index_len = u32::from_le_bytes(count_buf) as u64 * BACKREF_RECORD_SIZE as u64;

        let payload_len = size
            .checked_sub(ORI_OBJECT_HDRSIZE + 4 + index_len)
            .ok_or_else(|| Error::Malformed("backref index overruns file".to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            object_type,
            compression,
            payload_len,
        })
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// on-disk payload region length (compressed size when flag is set)
    pub fn payload_disk_len(&self) -> u64 {
        self.payload_len
    }

    /// stream over the decompressed payload
    pub fn payload_stream(&self) -> Result<Box<dyn ByteStream>> {
        let file = File::open(&self.path).with_path(&self.path)?;
        let raw = FdStream::new(file, ORI_OBJECT_HDRSIZE, self.payload_len)?;
        if self.compression == COMPRESS_LZMA {
            Ok(Box::new(LzmaStream::new(Box::new(raw), 0)))
        } else {
            Ok(Box::new(raw))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip_raw() {
        let payload = b"small payload";
        let from = Hash::digest(b"referrer");
        let bytes = encode_object(ObjectType::Blob, payload, &[(from, BackrefRole::Ref)]).unwrap();

        let frame = parse_frame(&bytes).unwrap();
        assert_eq!(frame.object_type, ObjectType::Blob);
        assert_eq!(frame.compression, COMPRESS_NONE);
        assert_eq!(frame.backrefs, vec![(from, BackrefRole::Ref)]);
        assert_eq!(frame_payload(&bytes, &frame).unwrap(), payload);
    }

    #[test]
    fn test_frame_roundtrip_compressed() {
        let payload = b"repetitive payload ".repeat(1024);
        let bytes = encode_object(ObjectType::Tree, &payload, &[]).unwrap();

        let frame = parse_frame(&bytes).unwrap();
        assert_eq!(frame.compression, COMPRESS_LZMA);
        // compressed region must be shorter than the payload
        assert!(frame.payload_end - frame.payload_start < payload.len());
        assert_eq!(frame_payload(&bytes, &frame).unwrap(), payload);
    }

    #[test]
    fn test_all_tags_roundtrip() {
        for t in [
            ObjectType::Commit,
            ObjectType::Tree,
            ObjectType::Blob,
            ObjectType::LargeBlob,
            ObjectType::Purged,
        ] {
            assert_eq!(ObjectType::from_tag(t.tag()).unwrap(), t);
        }
        assert!(ObjectType::from_tag(b"XXXX").is_err());
    }

    #[test]
    fn test_parse_rejects_short_file() {
        assert!(matches!(
            parse_frame(b"CMMT"),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_index_count() {
        let mut bytes = encode_object(ObjectType::Blob, b"x", &[]).unwrap();
        let n = bytes.len();
        bytes[n - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(parse_frame(&bytes), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_object_file_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj");
        let payload = b"streamed object payload".to_vec();
        let bytes = encode_object(ObjectType::Blob, &payload, &[]).unwrap();
        std::fs::write(&path, &bytes).unwrap();

        let obj = ObjectFile::open(&path).unwrap();
        assert_eq!(obj.object_type(), ObjectType::Blob);
        assert_eq!(obj.payload_stream().unwrap().read_all().unwrap(), payload);
    }

    #[test]
    fn test_object_file_compressed_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj");
        let payload = b"large and compressible ".repeat(512);
        let bytes = encode_object(ObjectType::LargeBlob, &payload, &[]).unwrap();
        std::fs::write(&path, &bytes).unwrap();

        let obj = ObjectFile::open(&path).unwrap();
        assert_eq!(obj.payload_stream().unwrap().read_all().unwrap(), payload);
    }

    #[test]
    fn test_reframe_preserves_backrefs() {
        let payload = b"to be purged";
        let from = Hash::digest(b"tree-referrer");
        let bytes = encode_object(ObjectType::Blob, payload, &[(from, BackrefRole::Ref)]).unwrap();
        let frame = parse_frame(&bytes).unwrap();

        // purge: empty payload, PURG tag, index preserved
        let purged = reframe_object(&frame, ObjectType::Purged, &[], &frame.backrefs);
        let pframe = parse_frame(&purged).unwrap();
        assert_eq!(pframe.object_type, ObjectType::Purged);
        assert_eq!(pframe.backrefs, vec![(from, BackrefRole::Ref)]);
        assert!(frame_payload(&purged, &pframe).unwrap().is_empty());
    }
}

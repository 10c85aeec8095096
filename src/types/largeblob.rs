use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::types::wire::{WireReader, WireWriter};

/// one chunk of a large file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub offset: u64,
    pub length: u64,
    pub hash: Hash,
}

/// a file too large to address as a single blob: an ordered fragment list
/// whose chunk concatenation is the logical file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LargeBlob {
    fragments: Vec<Fragment>,
}

impl LargeBlob {
    /// build from fragments; they must be contiguous from offset 0
    pub fn new(fragments: Vec<Fragment>) -> Result<Self> {
        let mut expected = 0u64;
        for frag in &fragments {
            if frag.offset != expected {
                return Err(Error::InvalidArgument(format!(
                    "fragment gap at offset {}",
                    frag.offset
                )));
            }
            if frag.length == 0 {
                return Err(Error::InvalidArgument("zero-length fragment".to_string()));
            }
            expected += frag.length;
        }
        Ok(Self { fragments })
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// logical file size
    pub fn total_size(&self) -> u64 {
        self.fragments
            .last()
            .map(|f| f.offset + f.length)
            .unwrap_or(0)
    }

    /// index of the fragment containing `offset`, if any
    pub fn fragment_at(&self, offset: u64) -> Option<usize> {
        if offset >= self.total_size() {
            return None;
        }
        let idx = self
            .fragments
            .partition_point(|f| f.offset + f.length <= offset);
        Some(idx)
    }

    /// canonical byte encoding; the large-blob hash is the digest of these
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_u32(self.fragments.len() as u32);
        for frag in &self.fragments {
            w.write_u64(frag.offset);
            w.write_u64(frag.length);
            w.write_hash(&frag.hash);
        }
        w.into_bytes()
    }

    /// decode from canonical bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let count = r.read_u32()?;
        let mut fragments = Vec::with_capacity(count as usize);
        let mut expected = 0u64;
        for _ in 0..count {
            let offset = r.read_u64()?;
            let length = r.read_u64()?;
            let hash = r.read_hash()?;
            if offset != expected || length == 0 {
                return Err(Error::Malformed(format!(
                    "discontiguous fragment at offset {}",
                    offset
                )));
            }
            expected = offset + length;
            fragments.push(Fragment {
                offset,
                length,
                hash,
            });
        }
        r.expect_end()?;
        Ok(Self { fragments })
    }

    /// hash of the canonical bytes
    pub fn hash(&self) -> Hash {
        Hash::digest(&self.encode())
    }
}

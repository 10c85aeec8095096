use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::types::attrs::AttrMap;
use crate::types::wire::{WireReader, WireWriter};

const TAG_BLOB: u8 = 1;
const TAG_LARGE_BLOB: u8 = 2;
const TAG_TREE: u8 = 3;

/// what a tree entry points at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    Blob,
    LargeBlob,
    Tree,
}

impl EntryType {
    fn tag(&self) -> u8 {
        match self {
            EntryType::Blob => TAG_BLOB,
            EntryType::LargeBlob => TAG_LARGE_BLOB,
            EntryType::Tree => TAG_TREE,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            TAG_BLOB => Ok(EntryType::Blob),
            TAG_LARGE_BLOB => Ok(EntryType::LargeBlob),
            TAG_TREE => Ok(EntryType::Tree),
            _ => Err(Error::Malformed(format!("unknown entry tag: {}", tag))),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, EntryType::Tree)
    }
}

/// one directory record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub entry_type: EntryType,
    pub mode: u16,
    pub hash: Hash,
    pub attrs: AttrMap,
}

impl TreeEntry {
    pub fn new(entry_type: EntryType, mode: u16, hash: Hash, attrs: AttrMap) -> Self {
        Self {
            entry_type,
            mode,
            hash,
            attrs,
        }
    }
}

/// an ordered mapping from entry name to TreeEntry
///
/// BTreeMap keeps names sorted and unique, so the canonical encoding is
/// deterministic regardless of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// add or replace an entry; the name must be a single path component
    pub fn insert(&mut self, name: impl Into<String>, entry: TreeEntry) -> Result<()> {
        let name = name.into();
        validate_entry_name(&name)?;
        self.entries.insert(name, entry);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &TreeEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// canonical byte encoding; the tree hash is the digest of these bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_u32(self.entries.len() as u32);
        for (name, entry) in &self.entries {
            w.write_u8(entry.entry_type.tag());
            w.write_u16(entry.mode);
            w.write_pstr(name);
            w.write_hash(&entry.hash);
            entry.attrs.encode_into(&mut w);
        }
        w.into_bytes()
    }

    /// decode from canonical bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let count = r.read_u32()?;
        let mut entries = BTreeMap::new();
        let mut last_name: Option<String> = None;

        for _ in 0..count {
            let entry_type = EntryType::from_tag(r.read_u8()?)?;
            let mode = r.read_u16()?;
            let name = r.read_pstr()?;
            let hash = r.read_hash()?;
            let attrs = AttrMap::decode_from(&mut r)?;

            validate_entry_name(&name).map_err(|_| {
                Error::Malformed(format!("invalid entry name: {}", name))
            })?;

            // names must be strictly ascending: rejects both unsorted
            // and duplicate entries
            if let Some(prev) = &last_name {
                if name.as_bytes() <= prev.as_bytes() {
                    return Err(Error::Malformed(format!(
                        "entry out of order or duplicated: {}",
                        name
                    )));
                }
            }
            last_name = Some(name.clone());

            entries.insert(
                name,
                TreeEntry {
                    entry_type,
                    mode,
                    hash,
                    attrs,
                },
            );
        }
        r.expect_end()?;

        Ok(Self { entries })
    }

    /// hash of the canonical bytes
    pub fn hash(&self) -> Hash {
        Hash::digest(&self.encode())
    }
}

/// validate a directory entry name
fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty entry name".to_string()));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidArgument(format!(
            "invalid character in entry name: {}",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!(
            "reserved entry name: {}",
            name
        )));
    }
    Ok(())
}

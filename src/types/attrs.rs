use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::wire::{WireReader, WireWriter};

/// the fixed attribute name set carried on tree entries
pub const ATTR_USERNAME: &str = "USERNAME";
pub const ATTR_PERMS: &str = "PERMS";
pub const ATTR_FILESIZE: &str = "FILESIZE";
pub const ATTR_MTIME: &str = "MTIME";
pub const ATTR_CTIME: &str = "CTIME";

const KNOWN_NAMES: [&str; 5] = [ATTR_USERNAME, ATTR_PERMS, ATTR_FILESIZE, ATTR_MTIME, ATTR_CTIME];

const TYPE_STR: u8 = 1;
const TYPE_UINT: u8 = 2;
const TYPE_TIME: u8 = 3;

/// a typed attribute value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrValue {
    Str(String),
    UInt(u64),
    Time(i64),
}

/// typed attribute map on a tree entry
///
/// BTreeMap keeps names sorted so encoding is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttrMap {
    map: BTreeMap<String, AttrValue>,
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// set an attribute; the name must be one of the fixed set
    pub fn set(&mut self, name: &str, value: AttrValue) -> Result<()> {
        if !KNOWN_NAMES.contains(&name) {
            return Err(Error::InvalidArgument(format!(
                "unknown attribute name: {}",
                name
            )));
        }
        self.map.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.map.get(name)
    }

    pub fn get_uint(&self, name: &str) -> Option<u64> {
        match self.map.get(name) {
            Some(AttrValue::UInt(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_time(&self, name: &str) -> Option<i64> {
        match self.map.get(name) {
            Some(AttrValue::Time(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.map.get(name) {
            Some(AttrValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// the standard attribute set for a file entry
    pub fn for_file(username: &str, perms: u64, size: u64, mtime: i64, ctime: i64) -> Self {
        let mut attrs = Self::new();
        attrs
            .set(ATTR_USERNAME, AttrValue::Str(username.to_string()))
            .unwrap();
        attrs.set(ATTR_PERMS, AttrValue::UInt(perms)).unwrap();
        attrs.set(ATTR_FILESIZE, AttrValue::UInt(size)).unwrap();
        attrs.set(ATTR_MTIME, AttrValue::Time(mtime)).unwrap();
        attrs.set(ATTR_CTIME, AttrValue::Time(ctime)).unwrap();
        attrs
    }

    pub(crate) fn encode_into(&self, w: &mut WireWriter) {
        w.write_u32(self.map.len() as u32);
        for (name, value) in &self.map {
            w.write_pstr(name);
            match value {
                AttrValue::Str(s) => {
                    w.write_u8(TYPE_STR);
                    w.write_pstr(s);
                }
                AttrValue::UInt(v) => {
                    w.write_u8(TYPE_UINT);
                    w.write_u64(*v);
                }
                AttrValue::Time(v) => {
                    w.write_u8(TYPE_TIME);
                    w.write_i64(*v);
                }
            }
        }
    }

    pub(crate) fn decode_from(r: &mut WireReader) -> Result<Self> {
        let count = r.read_u32()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let name = r.read_pstr()?;
            if !KNOWN_NAMES.contains(&name.as_str()) {
                return Err(Error::Malformed(format!("unknown attribute: {}", name)));
            }
            let value = match r.read_u8()? {
                TYPE_STR => AttrValue::Str(r.read_pstr()?),
                TYPE_UINT => AttrValue::UInt(r.read_u64()?),
                TYPE_TIME => AttrValue::Time(r.read_i64()?),
                code => {
                    return Err(Error::Malformed(format!(
                        "unknown attribute type code: {}",
                        code
                    )))
                }
            };
            if map.insert(name.clone(), value).is_some() {
                return Err(Error::Malformed(format!("duplicate attribute: {}", name)));
            }
        }
        Ok(Self { map })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(attrs: &AttrMap) -> AttrMap {
        let mut w = WireWriter::new();
        attrs.encode_into(&mut w);
        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        let parsed = AttrMap::decode_from(&mut r).unwrap();
        r.expect_end().unwrap();
        parsed
    }

    #[test]
    fn test_attr_roundtrip() {
        let attrs = AttrMap::for_file("alice", 0o644, 1234, 1700000000, 1700000001);
        assert_eq!(roundtrip(&attrs), attrs);
    }

    #[test]
    fn test_attr_accessors() {
        let attrs = AttrMap::for_file("bob", 0o755, 99, 10, 20);
        assert_eq!(attrs.get_str(ATTR_USERNAME), Some("bob"));
        assert_eq!(attrs.get_uint(ATTR_PERMS), Some(0o755));
        assert_eq!(attrs.get_uint(ATTR_FILESIZE), Some(99));
        assert_eq!(attrs.get_time(ATTR_MTIME), Some(10));
        assert_eq!(attrs.get_time(ATTR_CTIME), Some(20));
    }

    #[test]
    fn test_attr_rejects_unknown_name() {
        let mut attrs = AttrMap::new();
        let result = attrs.set("COLOR", AttrValue::Str("blue".into()));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_attr_encoding_deterministic() {
        // insertion order must not affect the bytes
        let mut a = AttrMap::new();
        a.set(ATTR_MTIME, AttrValue::Time(5)).unwrap();
        a.set(ATTR_PERMS, AttrValue::UInt(0o600)).unwrap();

        let mut b = AttrMap::new();
        b.set(ATTR_PERMS, AttrValue::UInt(0o600)).unwrap();
        b.set(ATTR_MTIME, AttrValue::Time(5)).unwrap();

        let mut wa = WireWriter::new();
        a.encode_into(&mut wa);
        let mut wb = WireWriter::new();
        b.encode_into(&mut wb);

        assert_eq!(wa.into_bytes(), wb.into_bytes());
    }

    #[test]
    fn test_attr_decode_unknown_type_code() {
        let mut w = WireWriter::new();
        w.write_u32(1);
        w.write_pstr(ATTR_PERMS);
        w.write_u8(9);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert!(matches!(
            AttrMap::decode_from(&mut r),
            Err(Error::Malformed(_))
        ));
    }
}

//! Meta cluster codec.
//!
//! The meta cluster is a plaintext key-value document stored right after the
//! root block, in a fixed region of whole blocks covering at least 64 KiB.
//! The document is a list of `key = value` lines; `#` starts a comment line.
//! The first NUL byte terminates the text, the rest of the region is zero.

use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::util::ceil_division;
use std::collections::BTreeMap;
use std::str;

/// Minimum size of the meta cluster region in bytes.
pub const META_CLUSTER_SIZE: u64 = 64 * 1024;

/// Returns the number of physical blocks the meta cluster spans.
pub fn cluster_blocks(block_size: u64) -> u64 {
    ceil_division(META_CLUSTER_SIZE, block_size)
}

/// Returns the size of the meta cluster region in bytes.
pub fn region_size(block_size: u64) -> u64 {
    cluster_blocks(block_size) * block_size
}

/// The in-memory meta cluster document.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Meta {
    entries: BTreeMap<String, String>,
}

impl Meta {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of the entry with the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Sets the entry with the given key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Removes the entry with the given key, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Iterates over the entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serializes the document into a zero-terminated region of
    /// `region_size` bytes.
    pub fn serialize(&self, region_size: usize) -> Result<Vec<u8>> {
        self.encode(region_size)
            .map_err(|e| e.wrap(ErrorKind::MetaSerializeFailed))
    }

    fn encode(&self, region_size: usize) -> Result<Vec<u8>> {
        let mut text = String::new();
        for (key, value) in &self.entries {
            let malformed = key.is_empty()
                || key.contains(['=', '\n', '\0', '#'])
                || value.contains(['\n', '\0']);
            if malformed {
                return Err(ErrorKind::OutOfBounds.into());
            }
            text.push_str(key);
            text.push_str(" = ");
            text.push_str(value);
            text.push('\n');
        }
        // One byte is reserved for the terminator
        if text.len() >= region_size {
            return Err(ErrorKind::OutOfBounds.into());
        }
        let mut buf = vec![0u8; region_size];
        buf[..text.len()].copy_from_slice(text.as_bytes());
        Ok(buf)
    }

    /// Deserializes a document from a meta cluster region.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        Self::decode(buf).map_err(|e| e.wrap(ErrorKind::MetaDeserializeFailed))
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        let text = str::from_utf8(&buf[..end])
            .map_err(|e| Error::with_cause(ErrorKind::InvalidUtf8, e))?;

        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(ErrorKind::OutOfBounds)?;
            entries.insert(key.trim().to_owned(), value.trim().to_owned());
        }
        Ok(Self { entries })
    }
}

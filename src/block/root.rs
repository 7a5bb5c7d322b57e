/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of IBFS.
 *
 * IBFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * IBFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * IBFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! Root block codec.
//!
//! The root block sits at address 0 and carries the critical volume
//! configuration. It is neither encrypted nor checksummed: without it there is
//! no way to derive the key or the geometry in the first place.
//!
//! Layout, little-endian:
//!
//! ```text
//! off size field
//! 0   2    format major
//! 2   2    format minor
//! 4   8    filesystem root address
//! 12  1    cipher selector
//! 13  16   IV seed
//! 29  16   key check
//! 45  1    compatibility flag
//! 46  1    block size level
//! 47  8    block count
//! 55  16   volume UUID
//! 71  ..   reserved, zero
//! ```

use crate::crypto::CipherKind;
use crate::cursor::Cursor;
use crate::error::ErrorKind;
use crate::error::Result;

/// Current on-disk format version, major part.
pub const FORMAT_MAJOR: u16 = 1;
/// Current on-disk format version, minor part.
pub const FORMAT_MINOR: u16 = 0;

/// Lowest valid block size level (1 KiB blocks).
pub const BLOCK_SIZE_LEVEL_MIN: u8 = 1;
/// Highest valid block size level (16 MiB blocks).
pub const BLOCK_SIZE_LEVEL_MAX: u8 = 15;

/// Number of bytes the root record occupies at the start of its block.
const ROOT_RECORD_SIZE: usize = 71;

/// Returns the physical block size of the given level.
///
/// Levels run from 1 (1 KiB) to 15 (16 MiB), each doubling the previous one.
/// An out-of-range level yields `None`.
pub fn block_size_of_level(level: u8) -> Option<u64> {
    if (BLOCK_SIZE_LEVEL_MIN..=BLOCK_SIZE_LEVEL_MAX).contains(&level) {
        Some(1024u64 << (level - 1))
    } else {
        None
    }
}

/// The root block: immutable critical volume configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RootBlock {
    /// Format version of the volume, major part.
    pub major: u16,
    /// Format version of the volume, minor part.
    pub minor: u16,
    /// Address of the head block of the filesystem root directory.
    pub fs_root_address: u64,
    /// Cipher used for block bodies.
    pub cipher: CipherKind,
    /// Seed of the per-block IVs.
    pub iv_seed: [u8; 16],
    /// 16 zero bytes enciphered under the volume key at address 0.
    pub key_check: [u8; 16],
    /// Whether this driver may mutate the volume.
    pub compatibility: bool,
    /// Block size level (see [`block_size_of_level`]).
    pub block_size_level: u8,
    /// Total number of physical blocks, root and meta cluster included.
    pub block_count: u64,
    /// Unique identifier of the volume.
    pub uuid: [u8; 16],
}

impl RootBlock {
    /// Returns the physical block size of the volume.
    pub fn block_size(&self) -> u64 {
        // The level was validated when the root was built or parsed
        block_size_of_level(self.block_size_level).unwrap_or(0)
    }

    /// Serializes the root block into one full physical block.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.encode()
            .map_err(|e| e.wrap(ErrorKind::RootSerializeFailed))
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let block_size =
            block_size_of_level(self.block_size_level).ok_or(ErrorKind::OutOfBounds)?;
        let mut buf = vec![0u8; block_size as usize];
        let mut cur = Cursor::new(&mut buf);
        cur.write_u16(self.major)?;
        cur.write_u16(self.minor)?;
        cur.write_u64(self.fs_root_address)?;
        cur.write_u8(self.cipher.as_raw())?;
        cur.write_bytes(&self.iv_seed)?;
        cur.write_bytes(&self.key_check)?;
        cur.write_bool(self.compatibility)?;
        cur.write_u8(self.block_size_level)?;
        cur.write_u64(self.block_count)?;
        cur.write_bytes(&self.uuid)?;
        Ok(buf)
    }

    /// Deserializes a root block from the start of `buf`.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        Self::decode(buf).map_err(|e| e.wrap(ErrorKind::RootDeserializeFailed))
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ROOT_RECORD_SIZE {
            return Err(ErrorKind::OutOfBounds.into());
        }
        let mut copy = buf[..ROOT_RECORD_SIZE].to_vec();
        let mut cur = Cursor::new(&mut copy);

        let major = cur.read_u16()?;
        let minor = cur.read_u16()?;
        let fs_root_address = cur.read_u64()?;
        let cipher = CipherKind::from_raw(cur.read_u8()?).ok_or(ErrorKind::OutOfBounds)?;
        let mut iv_seed = [0u8; 16];
        cur.read_into(&mut iv_seed)?;
        let mut key_check = [0u8; 16];
        cur.read_into(&mut key_check)?;
        let compatibility = cur.read_bool()?;
        let block_size_level = cur.read_u8()?;
        block_size_of_level(block_size_level).ok_or(ErrorKind::OutOfBounds)?;
        let block_count = cur.read_u64()?;
        let mut uuid = [0u8; 16];
        cur.read_into(&mut uuid)?;

        Ok(Self {
            major,
            minor,
            fs_root_address,
            cipher,
            iv_seed,
            key_check,
            compatibility,
            block_size_level,
            block_count,
            uuid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RootBlock {
        RootBlock {
            major: FORMAT_MAJOR,
            minor: FORMAT_MINOR,
            fs_root_address: 65,
            cipher: CipherKind::Aes256Xts,
            iv_seed: [9; 16],
            key_check: [3; 16],
            compatibility: true,
            block_size_level: 1,
            block_count: 1000,
            uuid: [0xaa; 16],
        }
    }

    #[test]
    fn levels() {
        assert_eq!(block_size_of_level(0), None);
        assert_eq!(block_size_of_level(1), Some(1024));
        assert_eq!(block_size_of_level(2), Some(2048));
        assert_eq!(block_size_of_level(15), Some(16 * 1024 * 1024));
        assert_eq!(block_size_of_level(16), None);
    }

    #[test]
    fn roundtrip() {
        let root = sample();
        let buf = root.serialize().unwrap();
        assert_eq!(buf.len(), 1024);
        assert_eq!(RootBlock::deserialize(&buf).unwrap(), root);
    }

    #[test]
    fn field_offsets() {
        let buf = sample().serialize().unwrap();
        // cipher selector
        assert_eq!(buf[12], 2);
        // compatibility flag
        assert_eq!(buf[45], 1);
        // block size level
        assert_eq!(buf[46], 1);
        // block count
        assert_eq!(
            u64::from_le_bytes(buf[47..55].try_into().unwrap()),
            1000
        );
        // reserved tail stays zero
        assert!(buf[71..].iter().all(|b| *b == 0));
    }

    #[test]
    fn invalid_level_rejected() {
        let mut buf = sample().serialize().unwrap();
        buf[46] = 0;
        let err = RootBlock::deserialize(&buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RootDeserializeFailed);
    }

    #[test]
    fn invalid_root_too_short() {
        let err = RootBlock::deserialize(&[0u8; 32]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RootDeserializeFailed);
    }
}

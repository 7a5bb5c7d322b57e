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

//! Head block codec.
//!
//! A head block starts every file or directory. Its 64 byte header carries
//! the resource metadata; the body is the beginning of the resource's address
//! array.
//!
//! Layout, little-endian:
//!
//! ```text
//! off size field
//! 0   1    tag (1)
//! 1   4    CRC-32 of the plaintext body
//! 5   8    next link address (0 terminates)
//! 13  8    creation timestamp, Unix seconds
//! 21  8    modification timestamp, Unix seconds
//! 29  4    body length in bytes
//! 33  1    resource type
//! 34  ..   reserved, zero up to 64
//! 64  ..   body, encrypted
//! ```

use super::head_body;
use super::open_body;
use super::seal_body;
use super::Decoded;
use super::HEAD_HEADER_SIZE;
use super::TAG_HEAD;
use crate::crypto::BlockCipher;
use crate::cursor::Cursor;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::util::get_timestamp;

/// The kind of resource a head block starts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    /// Opaque user data.
    File,
    /// A serialized directory table.
    Directory,
}

impl ResourceKind {
    /// Returns the kind for the given raw header value.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::File),
            2 => Some(Self::Directory),
            _ => None,
        }
    }

    /// Returns the raw header value of the kind.
    pub fn as_raw(self) -> u8 {
        match self {
            Self::File => 1,
            Self::Directory => 2,
        }
    }
}

/// A parsed head block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Head {
    /// Address of the first link block, 0 if there is none.
    pub next: u64,
    /// Creation timestamp, Unix seconds.
    pub created: u64,
    /// Last modification timestamp, Unix seconds.
    pub modified: u64,
    /// The kind of resource the block starts.
    pub resource: ResourceKind,
    /// The plaintext body, at most [`head_body`] bytes.
    pub body: Vec<u8>,
}

impl Head {
    /// Creates an empty head for a fresh resource, timestamped now.
    pub fn new(resource: ResourceKind) -> Self {
        let now = get_timestamp().as_secs();
        Self {
            next: 0,
            created: now,
            modified: now,
            resource,
            body: Vec::new(),
        }
    }

    /// Serializes the head into one encrypted physical block.
    ///
    /// The returned buffer is the full block: the body was checksummed in the
    /// clear, then encrypted in place for `address`.
    pub fn serialize(
        &self,
        block_size: u64,
        cipher: &BlockCipher,
        address: u64,
    ) -> Result<Vec<u8>> {
        self.encode(block_size, cipher, address)
            .map_err(|e| e.wrap(ErrorKind::HeadSerializeFailed))
    }

    fn encode(&self, block_size: u64, cipher: &BlockCipher, address: u64) -> Result<Vec<u8>> {
        if self.body.len() > head_body(block_size) {
            return Err(ErrorKind::OutOfBounds.into());
        }
        let mut buf = vec![0u8; block_size as usize];
        let mut cur = Cursor::new(&mut buf);
        cur.write_u8_at(0, TAG_HEAD)?;
        cur.write_u64_at(5, self.next)?;
        cur.write_u64_at(13, self.created)?;
        cur.write_u64_at(21, self.modified)?;
        cur.write_u32_at(29, self.body.len() as u32)?;
        cur.write_u8_at(33, self.resource.as_raw())?;
        cur.sub(HEAD_HEADER_SIZE, self.body.len())?
            .copy_from_slice(&self.body);

        let crc = seal_body(&mut buf, HEAD_HEADER_SIZE, cipher, address);
        Cursor::new(&mut buf).write_u32_at(1, crc)?;
        Ok(buf)
    }

    /// Deserializes the head block read from `address`.
    ///
    /// The buffer is taken over and its body decrypted in place. The caller
    /// decides what to do with a checksum mismatch.
    pub fn deserialize(
        buf: Vec<u8>,
        cipher: &BlockCipher,
        address: u64,
    ) -> Result<Decoded<Self>> {
        Self::decode(buf, cipher, address).map_err(|e| e.wrap(ErrorKind::HeadDeserializeFailed))
    }

    fn decode(mut buf: Vec<u8>, cipher: &BlockCipher, address: u64) -> Result<Decoded<Self>> {
        if buf.len() <= HEAD_HEADER_SIZE {
            return Err(ErrorKind::OutOfBounds.into());
        }
        let cur = Cursor::new(&mut buf);
        if cur.read_u8_at(0)? != TAG_HEAD {
            return Err(ErrorKind::IntegrityMismatch.into());
        }
        let crc_stored = cur.read_u32_at(1)?;
        let next = cur.read_u64_at(5)?;
        let created = cur.read_u64_at(13)?;
        let modified = cur.read_u64_at(21)?;
        let body_length = cur.read_u32_at(29)? as usize;
        let resource =
            ResourceKind::from_raw(cur.read_u8_at(33)?).ok_or(ErrorKind::IntegrityMismatch)?;
        if body_length > buf.len() - HEAD_HEADER_SIZE {
            return Err(ErrorKind::IntegrityMismatch.into());
        }

        let crc_computed = open_body(&mut buf, HEAD_HEADER_SIZE, cipher, address);
        let body = buf[HEAD_HEADER_SIZE..HEAD_HEADER_SIZE + body_length].to_vec();
        Ok(Decoded {
            block: Head {
                next,
                created,
                modified,
                resource,
                body,
            },
            crc_stored,
            crc_computed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherKind;
    use crate::util::get_random;

    fn cipher() -> BlockCipher {
        BlockCipher::derive(CipherKind::Aes256Xts, [5; 16], Some(b"some key")).unwrap()
    }

    #[test]
    fn roundtrip() {
        let cipher = cipher();
        let head = Head {
            next: 81,
            created: 1700000000,
            modified: 1700000001,
            resource: ResourceKind::File,
            body: (1u64..=5)
                .flat_map(|v| v.to_be_bytes())
                .collect(),
        };

        let buf = head.serialize(1024, &cipher, 80).unwrap();
        assert_eq!(buf.len(), 1024);
        let dec = Head::deserialize(buf, &cipher, 80).unwrap();
        assert!(dec.crc_ok());
        assert_eq!(dec.block, head);
    }

    #[test]
    fn full_random_body() {
        let cipher = cipher();
        let mut body = vec![0u8; 1024 - 64];
        get_random(&mut body);
        let head = Head {
            body: body.clone(),
            ..Head::new(ResourceKind::File)
        };

        let dec =
            Head::deserialize(head.serialize(1024, &cipher, 3).unwrap(), &cipher, 3).unwrap();
        assert!(dec.crc_ok());
        assert_eq!(dec.block.body, body);
    }

    #[test]
    fn bit_flip_breaks_crc() {
        let cipher = cipher();
        let head = Head {
            body: vec![0x11; 100],
            ..Head::new(ResourceKind::Directory)
        };
        let mut buf = head.serialize(1024, &cipher, 7).unwrap();
        buf[200] ^= 0x01;

        let dec = Head::deserialize(buf, &cipher, 7).unwrap();
        assert!(!dec.crc_ok());
    }

    #[test]
    fn wrong_address_breaks_crc() {
        let cipher = cipher();
        let head = Head {
            body: vec![0x11; 100],
            ..Head::new(ResourceKind::File)
        };
        let buf = head.serialize(1024, &cipher, 7).unwrap();

        let dec = Head::deserialize(buf, &cipher, 8).unwrap();
        assert!(!dec.crc_ok());
    }

    #[test]
    fn wrong_tag_rejected() {
        let cipher = cipher();
        let head = Head::new(ResourceKind::File);
        let mut buf = head.serialize(1024, &cipher, 0).unwrap();
        buf[0] = 3;

        let err = Head::deserialize(buf, &cipher, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HeadDeserializeFailed);
    }

    #[test]
    fn oversized_body_rejected() {
        let cipher = cipher();
        let head = Head {
            body: vec![0; 1024 - 63],
            ..Head::new(ResourceKind::File)
        };
        let err = head.serialize(1024, &cipher, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HeadSerializeFailed);
    }
}

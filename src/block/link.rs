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

//! Link block codec.
//!
//! A link block continues the address array started by a head block.
//!
//! Layout, little-endian:
//!
//! ```text
//! off size field
//! 0   1    tag (2)
//! 1   4    CRC-32 of the plaintext body
//! 5   8    next link address (0 terminates)
//! 13  4    body length in bytes
//! 17  ..   reserved, zero up to 32
//! 32  ..   body, encrypted
//! ```

use super::link_body;
use super::open_body;
use super::seal_body;
use super::Decoded;
use super::LINK_HEADER_SIZE;
use super::TAG_LINK;
use crate::crypto::BlockCipher;
use crate::cursor::Cursor;
use crate::error::ErrorKind;
use crate::error::Result;

/// A parsed link block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Link {
    /// Address of the next link block, 0 if this is the last one.
    pub next: u64,
    /// The plaintext body, at most [`link_body`] bytes.
    pub body: Vec<u8>,
}

impl Link {
    /// Serializes the link into one encrypted physical block.
    pub fn serialize(
        &self,
        block_size: u64,
        cipher: &BlockCipher,
        address: u64,
    ) -> Result<Vec<u8>> {
        self.encode(block_size, cipher, address)
            .map_err(|e| e.wrap(ErrorKind::LinkSerializeFailed))
    }

    fn encode(&self, block_size: u64, cipher: &BlockCipher, address: u64) -> Result<Vec<u8>> {
        if self.body.len() > link_body(block_size) {
            return Err(ErrorKind::OutOfBounds.into());
        }
        let mut buf = vec![0u8; block_size as usize];
        let mut cur = Cursor::new(&mut buf);
        cur.write_u8_at(0, TAG_LINK)?;
        cur.write_u64_at(5, self.next)?;
        cur.write_u32_at(13, self.body.len() as u32)?;
        cur.sub(LINK_HEADER_SIZE, self.body.len())?
            .copy_from_slice(&self.body);

        let crc = seal_body(&mut buf, LINK_HEADER_SIZE, cipher, address);
        Cursor::new(&mut buf).write_u32_at(1, crc)?;
        Ok(buf)
    }

    /// Deserializes the link block read from `address`.
    ///
    /// The buffer is taken over and its body decrypted in place.
    pub fn deserialize(
        buf: Vec<u8>,
        cipher: &BlockCipher,
        address: u64,
    ) -> Result<Decoded<Self>> {
        Self::decode(buf, cipher, address).map_err(|e| e.wrap(ErrorKind::LinkDeserializeFailed))
    }

    fn decode(mut buf: Vec<u8>, cipher: &BlockCipher, address: u64) -> Result<Decoded<Self>> {
        if buf.len() <= LINK_HEADER_SIZE {
            return Err(ErrorKind::OutOfBounds.into());
        }
        let cur = Cursor::new(&mut buf);
        if cur.read_u8_at(0)? != TAG_LINK {
            return Err(ErrorKind::IntegrityMismatch.into());
        }
        let crc_stored = cur.read_u32_at(1)?;
        let next = cur.read_u64_at(5)?;
        let body_length = cur.read_u32_at(13)? as usize;
        if body_length > buf.len() - LINK_HEADER_SIZE {
            return Err(ErrorKind::IntegrityMismatch.into());
        }

        let crc_computed = open_body(&mut buf, LINK_HEADER_SIZE, cipher, address);
        let body = buf[LINK_HEADER_SIZE..LINK_HEADER_SIZE + body_length].to_vec();
        Ok(Decoded {
            block: Link { next, body },
            crc_stored,
            crc_computed,
        })
    }
}

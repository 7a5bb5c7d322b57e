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

//! Data block codec.
//!
//! A data block carries opaque user bytes.
//!
//! Layout, little-endian:
//!
//! ```text
//! off size field
//! 0   1    tag (3)
//! 1   4    CRC-32 of the plaintext body
//! 5   4    body length in bytes
//! 9   ..   reserved, zero up to 32
//! 32  ..   body, encrypted
//! ```

use super::data_body;
use super::open_body;
use super::seal_body;
use super::Decoded;
use super::DATA_HEADER_SIZE;
use super::TAG_DATA;
use crate::crypto::BlockCipher;
use crate::cursor::Cursor;
use crate::error::ErrorKind;
use crate::error::Result;

/// A parsed data block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Data {
    /// The plaintext body, at most [`data_body`] bytes.
    pub body: Vec<u8>,
}

impl Data {
    /// Serializes the data block into one encrypted physical block.
    pub fn serialize(
        &self,
        block_size: u64,
        cipher: &BlockCipher,
        address: u64,
    ) -> Result<Vec<u8>> {
        self.encode(block_size, cipher, address)
            .map_err(|e| e.wrap(ErrorKind::DataSerializeFailed))
    }

    fn encode(&self, block_size: u64, cipher: &BlockCipher, address: u64) -> Result<Vec<u8>> {
        if self.body.len() > data_body(block_size) {
            return Err(ErrorKind::OutOfBounds.into());
        }
        let mut buf = vec![0u8; block_size as usize];
        let mut cur = Cursor::new(&mut buf);
        cur.write_u8_at(0, TAG_DATA)?;
        cur.write_u32_at(5, self.body.len() as u32)?;
        cur.sub(DATA_HEADER_SIZE, self.body.len())?
            .copy_from_slice(&self.body);

        let crc = seal_body(&mut buf, DATA_HEADER_SIZE, cipher, address);
        Cursor::new(&mut buf).write_u32_at(1, crc)?;
        Ok(buf)
    }

    /// Deserializes the data block read from `address`.
    ///
    /// The buffer is taken over and its body decrypted in place.
    pub fn deserialize(
        buf: Vec<u8>,
        cipher: &BlockCipher,
        address: u64,
    ) -> Result<Decoded<Self>> {
        Self::decode(buf, cipher, address).map_err(|e| e.wrap(ErrorKind::DataDeserializeFailed))
    }

    fn decode(mut buf: Vec<u8>, cipher: &BlockCipher, address: u64) -> Result<Decoded<Self>> {
        if buf.len() <= DATA_HEADER_SIZE {
            return Err(ErrorKind::OutOfBounds.into());
        }
        let cur = Cursor::new(&mut buf);
        if cur.read_u8_at(0)? != TAG_DATA {
            return Err(ErrorKind::IntegrityMismatch.into());
        }
        let crc_stored = cur.read_u32_at(1)?;
        let body_length = cur.read_u32_at(5)? as usize;
        if body_length > buf.len() - DATA_HEADER_SIZE {
            return Err(ErrorKind::IntegrityMismatch.into());
        }

        let crc_computed = open_body(&mut buf, DATA_HEADER_SIZE, cipher, address);
        let body = buf[DATA_HEADER_SIZE..DATA_HEADER_SIZE + body_length].to_vec();
        Ok(Decoded {
            block: Data { body },
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

    #[test]
    fn roundtrip() {
        let cipher =
            BlockCipher::derive(CipherKind::Aes256Xts, [8; 16], Some(b"hello world")).unwrap();
        let mut body = vec![0u8; 992];
        get_random(&mut body);
        let data = Data { body };

        let buf = data.serialize(1024, &cipher, 90).unwrap();
        let dec = Data::deserialize(buf, &cipher, 90).unwrap();
        assert!(dec.crc_ok());
        assert_eq!(dec.block, data);
    }

    #[test]
    fn wrong_key_breaks_crc() {
        let good =
            BlockCipher::derive(CipherKind::Aes256Xts, [8; 16], Some(b"right key")).unwrap();
        let bad = BlockCipher::derive(CipherKind::Aes256Xts, [8; 16], Some(b"wrong key")).unwrap();
        let data = Data {
            body: vec![0x42; 500],
        };

        let buf = data.serialize(1024, &good, 12).unwrap();
        let dec = Data::deserialize(buf, &bad, 12).unwrap();
        assert!(!dec.crc_ok());
    }

    #[test]
    fn empty_body() {
        let cipher = BlockCipher::derive(CipherKind::None, [0; 16], None).unwrap();
        let data = Data { body: Vec::new() };

        let buf = data.serialize(1024, &cipher, 2).unwrap();
        let dec = Data::deserialize(buf, &cipher, 2).unwrap();
        assert!(dec.crc_ok());
        assert!(dec.block.body.is_empty());
    }
}

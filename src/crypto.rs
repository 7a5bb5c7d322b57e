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

//! Block cipher context and key derivation.
//!
//! Block bodies are encrypted with AES-XTS. The cipher backend has no notion
//! of the volume geometry, so the XTS sector tweak is emulated: the tweak of a
//! block is the first 8 bytes of the volume's IV seed followed by the block
//! address as a little-endian `u64`. Encrypting the same plaintext at two
//! addresses therefore yields unrelated ciphertexts.

use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use aes::cipher::KeyInit;
use aes::Aes128;
use aes::Aes256;
use sha2::Digest;
use sha2::Sha256;
use sha2::Sha512;
use xts_mode::Xts128;

/// Cipher selector, as stored in the root block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CipherKind {
    /// No encryption: block bodies are stored in the clear.
    #[default]
    None,
    /// AES-128 in XTS mode (32 bytes of composite key material).
    Aes128Xts,
    /// AES-256 in XTS mode (64 bytes of composite key material).
    Aes256Xts,
}

impl CipherKind {
    /// Returns the selector for the given raw root block value.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Aes128Xts),
            2 => Some(Self::Aes256Xts),
            _ => None,
        }
    }

    /// Returns the raw root block value of the selector.
    pub fn as_raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Aes128Xts => 1,
            Self::Aes256Xts => 2,
        }
    }
}

/// Derives the key material for the given cipher from a user key.
///
/// The derivation hashes the user key down to the exact composite key length
/// XTS wants: SHA-256 for AES-128 (32 bytes), SHA-512 for AES-256 (64 bytes).
/// With no cipher selected the derived key is empty.
pub fn derive_key(cipher: CipherKind, user_key: Option<&[u8]>) -> Result<Vec<u8>> {
    match cipher {
        CipherKind::None => Ok(Vec::new()),
        _ => {
            let user_key = user_key.ok_or(ErrorKind::KeyRequired)?;
            let key = match cipher {
                CipherKind::Aes128Xts => Sha256::digest(user_key).to_vec(),
                CipherKind::Aes256Xts => Sha512::digest(user_key).to_vec(),
                CipherKind::None => unreachable!(),
            };
            Ok(key)
        }
    }
}

enum Inner {
    Plain,
    Xts128(Xts128<Aes128>),
    Xts256(Xts128<Aes256>),
}

/// A cipher keyed for one volume.
///
/// Encryption and decryption operate in place on the body of a single block,
/// tweaked by the block's address.
pub struct BlockCipher {
    iv_seed: [u8; 16],
    inner: Inner,
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher").finish_non_exhaustive()
    }
}

impl BlockCipher {
    /// Creates a cipher context from derived key material.
    ///
    /// Arguments:
    /// - `cipher` is the cipher selector.
    /// - `iv_seed` is the volume's IV seed.
    /// - `key` is the derived key material (see [`derive_key`]).
    pub fn new(cipher: CipherKind, iv_seed: [u8; 16], key: &[u8]) -> Result<Self> {
        let inner = match cipher {
            CipherKind::None => Inner::Plain,
            CipherKind::Aes128Xts => {
                if key.len() != 32 {
                    return Err(ErrorKind::KeyDerivationFailed.into());
                }
                let c1 = Aes128::new_from_slice(&key[..16])
                    .map_err(|_| Error::new(ErrorKind::KeyDerivationFailed))?;
                let c2 = Aes128::new_from_slice(&key[16..])
                    .map_err(|_| Error::new(ErrorKind::KeyDerivationFailed))?;
                Inner::Xts128(Xts128::new(c1, c2))
            }
            CipherKind::Aes256Xts => {
                if key.len() != 64 {
                    return Err(ErrorKind::KeyDerivationFailed.into());
                }
                let c1 = Aes256::new_from_slice(&key[..32])
                    .map_err(|_| Error::new(ErrorKind::KeyDerivationFailed))?;
                let c2 = Aes256::new_from_slice(&key[32..])
                    .map_err(|_| Error::new(ErrorKind::KeyDerivationFailed))?;
                Inner::Xts256(Xts128::new(c1, c2))
            }
        };
        Ok(Self { iv_seed, inner })
    }

    /// Derives key material from `user_key` and creates the cipher context in
    /// one go.
    pub fn derive(cipher: CipherKind, iv_seed: [u8; 16], user_key: Option<&[u8]>) -> Result<Self> {
        let key = derive_key(cipher, user_key)?;
        Self::new(cipher, iv_seed, &key)
    }

    /// Returns the cipher selector of the context.
    pub fn kind(&self) -> CipherKind {
        match self.inner {
            Inner::Plain => CipherKind::None,
            Inner::Xts128(_) => CipherKind::Aes128Xts,
            Inner::Xts256(_) => CipherKind::Aes256Xts,
        }
    }

    /// Builds the XTS tweak of the block at the given address.
    fn tweak(&self, address: u64) -> [u8; 16] {
        let mut tweak = [0u8; 16];
        tweak[..8].copy_from_slice(&self.iv_seed[..8]);
        tweak[8..].copy_from_slice(&address.to_le_bytes());
        tweak
    }

    /// Encrypts `buf` in place as the body of the block at `address`.
    ///
    /// With no cipher selected this is the identity.
    pub fn encrypt(&self, buf: &mut [u8], address: u64) {
        match &self.inner {
            Inner::Plain => {}
            Inner::Xts128(xts) => xts.encrypt_sector(buf, self.tweak(address)),
            Inner::Xts256(xts) => xts.encrypt_sector(buf, self.tweak(address)),
        }
    }

    /// Decrypts `buf` in place as the body of the block at `address`.
    pub fn decrypt(&self, buf: &mut [u8], address: u64) {
        match &self.inner {
            Inner::Plain => {}
            Inner::Xts128(xts) => xts.decrypt_sector(buf, self.tweak(address)),
            Inner::Xts256(xts) => xts.decrypt_sector(buf, self.tweak(address)),
        }
    }

    /// Returns the key check value: 16 zero bytes enciphered at address 0.
    ///
    /// The value is stored in the root block so a wrong key can be detected
    /// before any block is interpreted.
    pub fn key_check(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        self.encrypt(&mut buf, 0);
        buf
    }
}

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

//! Error values shared by every fallible operation of the crate.
//!
//! Errors are values, not panics: an [`Error`] carries an [`ErrorKind`] and an
//! optional cause, so a failure deep in the stack keeps its whole chain up to
//! the single root cause.

use std::error;
use std::fmt;
use std::result;

/// Result alias used across the crate.
pub type Result<T> = result::Result<T, Error>;

/// The kind of an [`Error`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A key is required to use the selected cipher.
    #[error("a key is required to use the selected cipher")]
    KeyRequired,
    /// Key material could not be derived or loaded into the cipher.
    #[error("key derivation failed")]
    KeyDerivationFailed,
    /// The provided key does not match the volume's key check.
    #[error("the provided key does not match the volume key")]
    KeyMismatch,

    /// Root block serialization failed.
    #[error("root block serialization failed")]
    RootSerializeFailed,
    /// Root block deserialization failed.
    #[error("root block deserialization failed")]
    RootDeserializeFailed,
    /// Meta cluster serialization failed.
    #[error("meta cluster serialization failed")]
    MetaSerializeFailed,
    /// Meta cluster deserialization failed.
    #[error("meta cluster deserialization failed")]
    MetaDeserializeFailed,
    /// Head block serialization failed.
    #[error("head block serialization failed")]
    HeadSerializeFailed,
    /// Head block deserialization failed.
    #[error("head block deserialization failed")]
    HeadDeserializeFailed,
    /// Link block serialization failed.
    #[error("link block serialization failed")]
    LinkSerializeFailed,
    /// Link block deserialization failed.
    #[error("link block deserialization failed")]
    LinkDeserializeFailed,
    /// Data block serialization failed.
    #[error("data block serialization failed")]
    DataSerializeFailed,
    /// Data block deserialization failed.
    #[error("data block deserialization failed")]
    DataDeserializeFailed,

    /// A block read back with a wrong checksum or an unexpected tag.
    #[error("block integrity check failed")]
    IntegrityMismatch,
    /// The volume file could not be opened.
    #[error("opening the volume file failed")]
    OpenFailed,
    /// A physical read failed.
    #[error("read I/O failed")]
    ReadIoFailed,
    /// A physical write failed.
    #[error("write I/O failed")]
    WriteIoFailed,
    /// An I/O lease expired before its holder released it.
    #[error("I/O lease timed out")]
    LeaseTimedOut,
    /// The volume was created in an incompatible mode.
    #[error("the volume is marked incompatible with this driver")]
    ModeIncompatible,
    /// The volume file size does not match the root block geometry.
    #[error("volume file size does not match the root block")]
    SizeMismatch,

    /// A file block map could not be loaded.
    #[error("could not open the file block map")]
    FbmOpenFailed,
    /// A file block map chain loops back on itself.
    #[error("the file block map links form a cycle")]
    FbmCircularReference,
    /// Appending addresses to a file block map failed.
    #[error("appending to the file block map failed")]
    FbmAppendFailed,
    /// Growing a file block map by a link block failed.
    #[error("growing the file block map failed")]
    FbmGrowFailed,
    /// More addresses were popped than the file block map holds.
    #[error("truncation exceeds the file block map length")]
    FbmTruncOutOfRange,
    /// Popping addresses from a file block map failed.
    #[error("truncating the file block map failed")]
    FbmTruncFailed,
    /// Dropping the tail block of a file block map failed.
    #[error("shrinking the file block map failed")]
    FbmShrinkFailed,

    /// No free block address remains.
    #[error("no free block address remains")]
    AddressExhausted,
    /// A buffer or address access fell outside its valid range.
    #[error("access out of bounds")]
    OutOfBounds,
    /// A text field did not hold valid UTF-8.
    #[error("invalid UTF-8")]
    InvalidUtf8,
}

/// An error value with its cause chain.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    cause: Option<Box<dyn error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error of the given kind, without a cause.
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, cause: None }
    }

    /// Creates a new error of the given kind, caused by `cause`.
    pub fn with_cause<E: Into<Box<dyn error::Error + Send + Sync>>>(
        kind: ErrorKind,
        cause: E,
    ) -> Self {
        Self {
            kind,
            cause: Some(cause.into()),
        }
    }

    /// Wraps the error into a new error of the given kind, keeping `self` as
    /// the cause.
    pub fn wrap(self, kind: ErrorKind) -> Self {
        Self {
            kind,
            cause: Some(Box::new(self)),
        }
    }

    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the root cause of the error.
    ///
    /// If the error has no cause, the error itself is returned.
    pub fn root_cause(&self) -> &(dyn error::Error + 'static) {
        let mut cur: &(dyn error::Error + 'static) = self;
        while let Some(next) = cur.source() {
            cur = next;
        }
        cur
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.kind)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as _)
    }
}

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

//! Memory cursor over a fixed byte buffer.
//!
//! The cursor keeps two independent positions, one for reads and one for
//! writes, so a serializer can lay a header down while the body is being
//! consumed elsewhere in the same buffer. Every primitive accessor exists in
//! two forms: the plain form advances the matching position, the `_at` form
//! takes an explicit index and leaves both positions alone.
//!
//! All multi-byte integers are little-endian.

use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use std::mem::size_of;
use std::str;

/// A cursor over a fixed buffer.
pub struct Cursor<'b> {
    buf: &'b mut [u8],
    /// The read position.
    read: usize,
    /// The write position.
    write: usize,
}

macro_rules! primitive {
    ($ty:ty, $read:ident, $read_at:ident, $write:ident, $write_at:ident) => {
        #[doc = concat!("Reads a `", stringify!($ty), "` at the read position and advances it.")]
        pub fn $read(&mut self) -> Result<$ty> {
            let val = self.$read_at(self.read)?;
            self.read += size_of::<$ty>();
            Ok(val)
        }

        #[doc = concat!("Reads a `", stringify!($ty), "` at `index` without moving the cursor.")]
        pub fn $read_at(&self, index: usize) -> Result<$ty> {
            let end = self.range(index, size_of::<$ty>())?;
            let mut bytes = [0u8; size_of::<$ty>()];
            bytes.copy_from_slice(&self.buf[index..end]);
            Ok(<$ty>::from_le_bytes(bytes))
        }

        #[doc = concat!("Writes a `", stringify!($ty), "` at the write position and advances it.")]
        pub fn $write(&mut self, value: $ty) -> Result<()> {
            self.$write_at(self.write, value)?;
            self.write += size_of::<$ty>();
            Ok(())
        }

        #[doc = concat!("Writes a `", stringify!($ty), "` at `index` without moving the cursor.")]
        pub fn $write_at(&mut self, index: usize, value: $ty) -> Result<()> {
            let end = self.range(index, size_of::<$ty>())?;
            self.buf[index..end].copy_from_slice(&value.to_le_bytes());
            Ok(())
        }
    };
}

impl<'b> Cursor<'b> {
    /// Creates a cursor over the given buffer, both positions at zero.
    pub fn new(buf: &'b mut [u8]) -> Self {
        Self {
            buf,
            read: 0,
            write: 0,
        }
    }

    /// Returns the length of the underlying buffer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Tells whether the underlying buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the current read position.
    pub fn read_pos(&self) -> usize {
        self.read
    }

    /// Returns the current write position.
    pub fn write_pos(&self) -> usize {
        self.write
    }

    /// Moves the read position to `pos`.
    pub fn seek_read(&mut self, pos: usize) {
        self.read = pos;
    }

    /// Moves the write position to `pos`.
    pub fn seek_write(&mut self, pos: usize) {
        self.write = pos;
    }

    /// Checks that `len` bytes starting at `index` fit in the buffer and
    /// returns the end of the range.
    fn range(&self, index: usize, len: usize) -> Result<usize> {
        index
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| ErrorKind::OutOfBounds.into())
    }

    primitive!(u8, read_u8, read_u8_at, write_u8, write_u8_at);
    primitive!(u16, read_u16, read_u16_at, write_u16, write_u16_at);
    primitive!(u32, read_u32, read_u32_at, write_u32, write_u32_at);
    primitive!(u64, read_u64, read_u64_at, write_u64, write_u64_at);
    primitive!(i64, read_i64, read_i64_at, write_i64, write_i64_at);

    /// Reads a boolean (one byte, zero or one) at the read position.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a boolean at `index` without moving the cursor.
    pub fn read_bool_at(&self, index: usize) -> Result<bool> {
        Ok(self.read_u8_at(index)? != 0)
    }

    /// Writes a boolean at the write position.
    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(value as u8)
    }

    /// Writes a boolean at `index` without moving the cursor.
    pub fn write_bool_at(&mut self, index: usize, value: bool) -> Result<()> {
        self.write_u8_at(index, value as u8)
    }

    /// Reads `len` raw bytes at the read position and advances it.
    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8]> {
        let end = self.range(self.read, len)?;
        let slice = &self.buf[self.read..end];
        self.read = end;
        Ok(slice)
    }

    /// Reads bytes at the read position into `dest`, filling it entirely.
    pub fn read_into(&mut self, dest: &mut [u8]) -> Result<()> {
        let end = self.range(self.read, dest.len())?;
        dest.copy_from_slice(&self.buf[self.read..end]);
        self.read = end;
        Ok(())
    }

    /// Writes raw bytes at the write position and advances it.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.range(self.write, bytes.len())?;
        self.buf[self.write..end].copy_from_slice(bytes);
        self.write = end;
        Ok(())
    }

    /// Reads `len` bytes at the read position as a UTF-8 string.
    pub fn read_str(&mut self, len: usize) -> Result<&str> {
        let bytes = self.read_bytes(len)?;
        str::from_utf8(bytes).map_err(|e| Error::with_cause(ErrorKind::InvalidUtf8, e))
    }

    /// Writes a UTF-8 string at the write position and advances it.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Returns a mutable view of `len` bytes starting at `index`.
    ///
    /// The view aliases the cursor's buffer; neither position moves.
    pub fn sub(&mut self, index: usize, len: usize) -> Result<&mut [u8]> {
        let end = self.range(index, len)?;
        Ok(&mut self.buf[index..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_roundtrip() {
        let mut buf = [0u8; 32];
        let mut cur = Cursor::new(&mut buf);

        cur.write_u8(0xab).unwrap();
        cur.write_u16(0xbeef).unwrap();
        cur.write_u32(0xdeadbeef).unwrap();
        cur.write_u64(0x1122334455667788).unwrap();
        cur.write_i64(-42).unwrap();
        cur.write_bool(true).unwrap();

        assert_eq!(cur.read_u8().unwrap(), 0xab);
        assert_eq!(cur.read_u16().unwrap(), 0xbeef);
        assert_eq!(cur.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(cur.read_u64().unwrap(), 0x1122334455667788);
        assert_eq!(cur.read_i64().unwrap(), -42);
        assert!(cur.read_bool().unwrap());
        assert_eq!(cur.read_pos(), cur.write_pos());
    }

    #[test]
    fn little_endian_layout() {
        let mut buf = [0u8; 4];
        let mut cur = Cursor::new(&mut buf);
        cur.write_u32(0x0a0b0c0d).unwrap();
        assert_eq!(buf, [0x0d, 0x0c, 0x0b, 0x0a]);
    }

    #[test]
    fn indexed_access_does_not_advance() {
        let mut buf = [0u8; 16];
        let mut cur = Cursor::new(&mut buf);

        cur.write_u64_at(8, 99).unwrap();
        assert_eq!(cur.write_pos(), 0);
        assert_eq!(cur.read_u64_at(8).unwrap(), 99);
        assert_eq!(cur.read_pos(), 0);
    }

    #[test]
    fn out_of_bounds() {
        let mut buf = [0u8; 4];
        let mut cur = Cursor::new(&mut buf);

        assert_eq!(
            cur.read_u64_at(0).unwrap_err().kind(),
            ErrorKind::OutOfBounds
        );
        assert_eq!(
            cur.write_u32_at(1, 0).unwrap_err().kind(),
            ErrorKind::OutOfBounds
        );
        cur.seek_read(3);
        assert_eq!(cur.read_u16().unwrap_err().kind(), ErrorKind::OutOfBounds);
    }

    #[test]
    fn strings_and_bytes() {
        let mut buf = [0u8; 16];
        let mut cur = Cursor::new(&mut buf);

        cur.write_str("ibfs").unwrap();
        cur.write_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(cur.read_str(4).unwrap(), "ibfs");
        assert_eq!(cur.read_bytes(3).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn sub_view_aliases_buffer() {
        let mut buf = [0u8; 8];
        let mut cur = Cursor::new(&mut buf);
        cur.sub(4, 4).unwrap().copy_from_slice(&[9, 9, 9, 9]);
        assert_eq!(cur.read_u32_at(4).unwrap(), 0x09090909);
        assert_eq!(buf[4..], [9, 9, 9, 9]);
    }
}

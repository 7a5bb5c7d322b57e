//! File handles over the block engine.
//!
//! A [`FileHandle`] wraps the file block map of one resource and moves user
//! bytes in and out of its data blocks. Reads take `&self`, writes take
//! `&mut self`; a write stream borrows the handle mutably for its whole
//! lifetime, so one writer excludes every reader and every other writer at
//! compile time.
//!
//! Writes put data blocks on disk before their addresses enter the map, and
//! the map commits appended addresses in batches, so an interrupted write
//! leaks blocks instead of mapping garbage.

use crate::block::data::Data;
use crate::block::data_body;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::fbm::Fbm;
use crate::space::AddressSpace;
use crate::util::ceil_division;
use crate::volume::Volume;
use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

/// Default maximum size of a read stream chunk, in bytes.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1024;
/// How many freshly written data blocks may pile up before their addresses
/// are committed to the file block map.
pub const DEFAULT_FBM_COMMIT_FREQUENCY: usize = 16;

/// Read stream options.
#[derive(Clone, Copy, Debug)]
pub struct ReadStreamInit {
    /// Byte offset the stream starts at.
    pub offset: u64,
    /// Largest chunk the stream yields.
    pub max_chunk_size: usize,
}

impl Default for ReadStreamInit {
    fn default() -> Self {
        Self {
            offset: 0,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

/// Write stream options.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteStreamInit {
    /// Byte offset the stream starts at. Takes precedence over `append`.
    pub offset: Option<u64>,
    /// Start at the end of the file.
    pub append: bool,
    /// Drop the file contents before writing.
    pub truncate: bool,
}

/// A handle on one file or directory resource.
pub struct FileHandle {
    volume: Rc<Volume>,
    space: Rc<RefCell<AddressSpace>>,
    fbm: Fbm,
}

impl FileHandle {
    /// Opens a handle on the resource whose head sits at `address`.
    pub(crate) fn open(
        volume: Rc<Volume>,
        space: Rc<RefCell<AddressSpace>>,
        address: u64,
    ) -> Result<Self> {
        let fbm = Fbm::open(volume.clone(), space.clone(), address)?;
        Ok(Self { volume, space, fbm })
    }

    /// Returns the file block map of the resource.
    pub fn fbm(&self) -> &Fbm {
        &self.fbm
    }

    fn data_body(&self) -> u64 {
        data_body(self.volume.block_size()) as u64
    }

    /// Returns the length of the resource contents in bytes.
    ///
    /// Every data block but the last is full, so only the last block's header
    /// needs a read.
    pub fn len(&self) -> Result<u64> {
        let blocks = self.fbm.length();
        if blocks == 0 {
            return Ok(0);
        }
        let last = self
            .fbm
            .get(blocks - 1)
            .ok_or(ErrorKind::OutOfBounds)?;
        let tail = self.volume.read_data(last)?.block.body.len() as u64;
        Ok((blocks - 1) * self.data_body() + tail)
    }

    /// Tells whether the resource holds no byte.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.fbm.length() == 0)
    }

    /// Reads up to `len` bytes starting at byte `offset`.
    ///
    /// The result is shorter than `len` when the end of the file cuts it off.
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let db = self.data_body();
        let mut out = Vec::new();
        let mut skip = (offset % db) as usize;
        for address in self.fbm.data_addresses(offset / db) {
            if out.len() as u64 >= len {
                break;
            }
            let body = self.volume.read_data(address)?.block.body;
            if skip >= body.len() {
                break;
            }
            let take = (body.len() - skip).min((len - out.len() as u64) as usize);
            out.extend_from_slice(&body[skip..skip + take]);
            skip = 0;
        }
        Ok(out)
    }

    /// Reads the whole resource contents.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let len = self.len()?;
        self.read(0, len)
    }

    /// Writes `data` at byte `offset`.
    ///
    /// Writing past the current end zero-fills the gap. Data blocks are
    /// written before their addresses are appended to the map, in batches of
    /// [`DEFAULT_FBM_COMMIT_FREQUENCY`].
    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let db = self.data_body();
        let cur_len = self.len()?;
        let cur_blocks = self.fbm.length();
        let end = offset + data.len() as u64;
        let new_len = cur_len.max(end);

        let start_block = offset.min(cur_len) / db;
        let end_block = (end - 1) / db;
        let mut pending = Vec::new();
        for b in start_block..=end_block {
            let block_start = b * db;
            let body_len = (new_len - block_start).min(db) as usize;

            // Slice of `data` landing in this block
            let overlap_start = offset.max(block_start);
            let overlap_end = end.min(block_start + db);
            let overlay = |body: &mut Vec<u8>| {
                if overlap_start < overlap_end {
                    let s = (overlap_start - block_start) as usize;
                    let e = (overlap_end - block_start) as usize;
                    let d = (overlap_start - offset) as usize;
                    body[s..e].copy_from_slice(&data[d..d + (e - s)]);
                }
            };

            if b < cur_blocks {
                let address = self.fbm.get(b).ok_or(ErrorKind::OutOfBounds)?;
                let mut body = self.volume.read_data(address)?.block.body;
                if overlap_start >= overlap_end && body.len() == body_len {
                    continue;
                }
                body.resize(body_len, 0);
                overlay(&mut body);
                self.volume.write_data(address, &Data { body })?;
            } else {
                let mut body = vec![0u8; body_len];
                overlay(&mut body);
                let address = self.space.borrow_mut().alloc()?;
                if let Err(e) = self.volume.write_data(address, &Data { body }) {
                    // Not mapped yet, safe to reclaim
                    let _ = self.space.borrow_mut().free(address);
                    return Err(e);
                }
                pending.push(address);
                if pending.len() >= DEFAULT_FBM_COMMIT_FREQUENCY {
                    self.fbm.append(&pending)?;
                    pending.clear();
                }
            }
        }
        if !pending.is_empty() {
            self.fbm.append(&pending)?;
        }
        Ok(())
    }

    /// Replaces the whole resource contents with `data`.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.truncate(0)?;
        self.write(data, 0)
    }

    /// Appends `data` at the end of the resource.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let len = self.len()?;
        self.write(data, len)
    }

    /// Resizes the resource contents to `len` bytes.
    ///
    /// Shrinking releases the data blocks past the cut; growing zero-fills.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        let cur = self.len()?;
        if len == cur {
            return Ok(());
        }
        if len > cur {
            return self.write(&vec![0u8; (len - cur) as usize], cur);
        }

        let db = self.data_body();
        let keep = ceil_division(len, db);
        self.fbm.trunc(self.fbm.length() - keep)?;
        if len > 0 {
            let tail_len = (len - (keep - 1) * db) as usize;
            let address = self.fbm.get(keep - 1).ok_or(ErrorKind::OutOfBounds)?;
            let mut body = self.volume.read_data(address)?.block.body;
            if body.len() != tail_len {
                body.truncate(tail_len);
                self.volume.write_data(address, &Data { body })?;
            }
        }
        Ok(())
    }

    /// Creates a stream reading the resource in chunks.
    pub fn create_read_stream(&self, init: ReadStreamInit) -> ReadStream<'_> {
        ReadStream {
            handle: self,
            pos: init.offset,
            max_chunk_size: init.max_chunk_size.max(1),
        }
    }

    /// Creates a stream writing the resource.
    ///
    /// The stream borrows the handle mutably: as long as it lives, no other
    /// stream and no direct access can touch the handle.
    pub fn create_write_stream(&mut self, init: WriteStreamInit) -> Result<WriteStream<'_>> {
        if init.truncate {
            self.truncate(0)?;
        }
        let pos = match (init.offset, init.append) {
            (Some(offset), _) => offset,
            (None, true) => self.len()?,
            (None, false) => 0,
        };
        let block_body = self.data_body() as usize;
        Ok(WriteStream {
            handle: self,
            pos,
            buf: Vec::new(),
            block_body,
        })
    }
}

/// A chunked reader over a file handle.
pub struct ReadStream<'h> {
    handle: &'h FileHandle,
    pos: u64,
    max_chunk_size: usize,
}

impl Iterator for ReadStream<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.handle.read(self.pos, self.max_chunk_size as u64) {
            Ok(chunk) if chunk.is_empty() => None,
            Ok(chunk) => {
                self.pos += chunk.len() as u64;
                Some(Ok(chunk))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// A buffered writer over a file handle.
///
/// Bytes accumulate until a full data block worth is available, which is then
/// committed in one piece; [`WriteStream::finish`] flushes the remainder.
pub struct WriteStream<'h> {
    handle: &'h mut FileHandle,
    pos: u64,
    buf: Vec<u8>,
    block_body: usize,
}

impl WriteStream<'_> {
    /// Buffers `data`, committing every full data block gathered so far.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        self.commit_full_blocks()
    }

    fn commit_full_blocks(&mut self) -> Result<()> {
        while self.buf.len() >= self.block_body {
            let chunk: Vec<u8> = self.buf.drain(..self.block_body).collect();
            self.handle.write(&chunk, self.pos)?;
            self.pos += chunk.len() as u64;
        }
        Ok(())
    }

    /// Flushes everything still buffered and consumes the stream.
    pub fn finish(mut self) -> Result<()> {
        self.commit_full_blocks()?;
        if !self.buf.is_empty() {
            let rest = mem::take(&mut self.buf);
            self.handle.write(&rest, self.pos)?;
            self.pos += rest.len() as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::head::ResourceKind;
    use crate::crypto::CipherKind;
    use crate::fs::Filesystem;
    use crate::volume::VolumeInit;
    use tempfile::tempdir;

    fn scratch(dir: &tempfile::TempDir) -> Filesystem {
        let path = dir.path().join("file.ibfs");
        let mut init = VolumeInit::new(&path, 1, 2000);
        init.cipher = CipherKind::Aes128Xts;
        init.user_key = Some(b"file test key");
        Filesystem::create_empty(&mut init).unwrap()
    }

    fn new_file(fs: &Filesystem) -> FileHandle {
        let address = fs.create_node(ResourceKind::File).unwrap();
        fs.open_file(address).unwrap()
    }

    #[test]
    fn write_all_read_all() {
        let dir = tempdir().unwrap();
        let fs = scratch(&dir);
        let mut file = new_file(&fs);

        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        file.write_all(&data).unwrap();
        assert_eq!(file.len().unwrap(), 5000);
        // 5000 bytes over 992 byte bodies
        assert_eq!(file.fbm().length(), 6);
        assert_eq!(file.read_all().unwrap(), data);
    }

    #[test]
    fn stream_write_at_offset() {
        let dir = tempdir().unwrap();
        let fs = scratch(&dir);
        let mut file = new_file(&fs);

        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8 + 1).collect();
        let mut stream = file
            .create_write_stream(WriteStreamInit {
                offset: Some(5),
                ..Default::default()
            })
            .unwrap();
        // Feed the stream in uneven pieces
        for piece in data.chunks(333) {
            stream.write(piece).unwrap();
        }
        stream.finish().unwrap();

        assert_eq!(file.len().unwrap(), 2005);
        assert_eq!(file.fbm().length(), 3);
        assert_eq!(file.read(0, 5).unwrap(), vec![0u8; 5]);
        assert_eq!(file.read(5, 2000).unwrap(), data);
    }

    #[test]
    fn overwrite_in_place() {
        let dir = tempdir().unwrap();
        let fs = scratch(&dir);
        let mut file = new_file(&fs);

        file.write_all(&vec![0xaa; 3000]).unwrap();
        file.write(&[1, 2, 3, 4], 990).unwrap();

        let out = file.read_all().unwrap();
        assert_eq!(out.len(), 3000);
        assert_eq!(&out[988..996], &[0xaa, 0xaa, 1, 2, 3, 4, 0xaa, 0xaa]);
        assert_eq!(file.fbm().length(), 4);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let dir = tempdir().unwrap();
        let fs = scratch(&dir);
        let mut file = new_file(&fs);

        file.write(b"tail", 2500).unwrap();
        assert_eq!(file.len().unwrap(), 2504);
        assert_eq!(file.read(0, 2500).unwrap(), vec![0u8; 2500]);
        assert_eq!(file.read(2500, 10).unwrap(), b"tail");
    }

    #[test]
    fn append_grows() {
        let dir = tempdir().unwrap();
        let fs = scratch(&dir);
        let mut file = new_file(&fs);

        file.append(b"hello").unwrap();
        file.append(b" world").unwrap();
        assert_eq!(file.read_all().unwrap(), b"hello world");
    }

    #[test]
    fn truncate_shrinks_and_extends() {
        let dir = tempdir().unwrap();
        let fs = scratch(&dir);
        let mut file = new_file(&fs);

        let data: Vec<u8> = (0..4000u32).map(|i| i as u8).collect();
        file.write_all(&data).unwrap();
        let blocks_before = file.fbm().length();
        assert_eq!(blocks_before, 5);

        file.truncate(1000).unwrap();
        assert_eq!(file.len().unwrap(), 1000);
        assert_eq!(file.fbm().length(), 2);
        assert_eq!(file.read_all().unwrap(), &data[..1000]);

        file.truncate(0).unwrap();
        assert_eq!(file.len().unwrap(), 0);
        assert_eq!(file.fbm().length(), 0);

        file.truncate(100).unwrap();
        assert_eq!(file.read_all().unwrap(), vec![0u8; 100]);
    }

    #[test]
    fn truncate_releases_blocks() {
        let dir = tempdir().unwrap();
        let fs = scratch(&dir);
        let mut file = new_file(&fs);

        file.write_all(&vec![1u8; 4000]).unwrap();
        let available = fs.address_space().borrow().available();
        file.truncate(0).unwrap();
        assert_eq!(fs.address_space().borrow().available(), available + 5);
    }

    #[test]
    fn read_stream_chunks() {
        let dir = tempdir().unwrap();
        let fs = scratch(&dir);
        let mut file = new_file(&fs);

        let data: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        file.write_all(&data).unwrap();

        let chunks: Vec<Vec<u8>> = file
            .create_read_stream(ReadStreamInit {
                offset: 100,
                max_chunk_size: 700,
            })
            .collect::<Result<_>>()
            .unwrap();
        assert!(chunks.iter().all(|c| c.len() <= 700));
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, &data[100..]);
    }

    #[test]
    fn write_stream_append_and_truncate_options() {
        let dir = tempdir().unwrap();
        let fs = scratch(&dir);
        let mut file = new_file(&fs);

        file.write_all(b"base").unwrap();
        let mut stream = file
            .create_write_stream(WriteStreamInit {
                append: true,
                ..Default::default()
            })
            .unwrap();
        stream.write(b"+more").unwrap();
        stream.finish().unwrap();
        assert_eq!(file.read_all().unwrap(), b"base+more");

        let mut stream = file
            .create_write_stream(WriteStreamInit {
                truncate: true,
                ..Default::default()
            })
            .unwrap();
        stream.write(b"fresh").unwrap();
        stream.finish().unwrap();
        assert_eq!(file.read_all().unwrap(), b"fresh");
    }

    #[test]
    fn large_stream_roundtrip() {
        let dir = tempdir().unwrap();
        let fs = scratch(&dir);
        let mut file = new_file(&fs);

        // Enough to force several map commits and a link block
        let data: Vec<u8> = (0..150_000u32).map(|i| (i ^ (i >> 8)) as u8).collect();
        let mut stream = file.create_write_stream(WriteStreamInit::default()).unwrap();
        for piece in data.chunks(10_000) {
            stream.write(piece).unwrap();
        }
        stream.finish().unwrap();

        assert_eq!(file.len().unwrap(), 150_000);
        assert_eq!(file.fbm().length(), ceil_division(150_000, 992));
        assert_eq!(file.read_all().unwrap(), data);
    }
}

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

//! The volume engine.
//!
//! A volume owns the backing file, the parsed root block, the keyed cipher,
//! the in-memory meta cluster and the I/O queue. Every physical access goes
//! through a queue lease, so within one volume reads and writes are strictly
//! serialized in lease-acquisition order.

use crate::block::data::Data;
use crate::block::head::Head;
use crate::block::link::Link;
use crate::block::meta;
use crate::block::meta::Meta;
use crate::block::root::block_size_of_level;
use crate::block::root::RootBlock;
use crate::block::root::FORMAT_MAJOR;
use crate::block::root::FORMAT_MINOR;
use crate::block::Decoded;
use crate::crypto::BlockCipher;
use crate::crypto::CipherKind;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::queue::IoQueue;
use crate::util::get_random;
use crate::util::get_size;
use crate::util::get_timestamp;
use crate::util::ByteSize;
use std::cell::RefCell;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;
use uuid::Uuid;

/// Default number of blocks zero-filled per write while creating a volume.
const DEFAULT_HWM_BLOCKS: u64 = 16;
/// How many bytes of zero-fill separate two progress reports.
const PROGRESS_INTERVAL: u64 = 5 * 1024 * 1024;

/// Parameters of a new volume.
pub struct VolumeInit<'a> {
    /// Path of the volume image to create.
    pub path: PathBuf,
    /// Block size level, 1 (1 KiB) to 15 (16 MiB).
    pub block_size_level: u8,
    /// Total number of blocks, root and meta cluster included.
    pub block_count: u64,
    /// Cipher protecting block bodies.
    pub cipher: CipherKind,
    /// User key, required when a cipher is selected.
    pub user_key: Option<&'a [u8]>,
    /// Volume UUID. Random if not set.
    pub uuid: Option<[u8; 16]>,
    /// Number of blocks zero-filled per write.
    pub hwm_blocks: u64,
    /// Called with `(written, total)` bytes as the zero-fill progresses.
    pub progress: Option<&'a mut dyn FnMut(u64, u64)>,
}

impl<'a> VolumeInit<'a> {
    /// Creates parameters with the given geometry and no cipher.
    pub fn new(path: impl Into<PathBuf>, block_size_level: u8, block_count: u64) -> Self {
        Self {
            path: path.into(),
            block_size_level,
            block_count,
            cipher: CipherKind::None,
            user_key: None,
            uuid: None,
            hwm_blocks: DEFAULT_HWM_BLOCKS,
            progress: None,
        }
    }
}

/// An opened volume.
#[derive(Debug)]
pub struct Volume {
    /// The backing file.
    file: File,
    /// Physical block size in bytes.
    block_size: u64,
    /// Total number of blocks.
    block_count: u64,
    /// Whether integrity failures on reads are fatal.
    integrity: bool,
    /// The parsed root block.
    root: RefCell<RootBlock>,
    /// The in-memory meta cluster.
    meta: RefCell<Meta>,
    /// The cipher keyed for this volume.
    cipher: BlockCipher,
    /// The I/O queue serializing physical accesses.
    queue: IoQueue,
}

impl Volume {
    /// Creates an empty volume image.
    ///
    /// The file is zero-filled chunk by chunk, then the root block and the
    /// meta cluster are written. The volume is not opened; see
    /// [`Volume::open`].
    pub fn create_empty(init: &mut VolumeInit<'_>) -> Result<()> {
        let block_size =
            block_size_of_level(init.block_size_level).ok_or(ErrorKind::RootSerializeFailed)?;
        let reserved = 1 + meta::cluster_blocks(block_size);
        if init.block_count <= reserved {
            return Err(ErrorKind::OutOfBounds.into());
        }
        let mut iv_seed = [0u8; 16];
        get_random(&mut iv_seed);
        let cipher = BlockCipher::derive(init.cipher, iv_seed, init.user_key)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&init.path)
            .map_err(|e| Error::with_cause(ErrorKind::OpenFailed, e))?;

        // Zero-fill the whole image
        let chunk = vec![0u8; (init.hwm_blocks.max(1) * block_size) as usize];
        let total = init.block_count * block_size;
        let mut written = 0u64;
        let mut last_report = 0u64;
        while written < total {
            let n = chunk.len().min((total - written) as usize);
            file.write_all_at(&chunk[..n], written)
                .map_err(|e| Error::with_cause(ErrorKind::WriteIoFailed, e))?;
            written += n as u64;
            if written - last_report >= PROGRESS_INTERVAL || written == total {
                last_report = written;
                log::debug!("zero-filled {} / {}", ByteSize(written), ByteSize(total));
                if let Some(progress) = init.progress.as_mut() {
                    progress(written, total);
                }
            }
        }

        let root = RootBlock {
            major: FORMAT_MAJOR,
            minor: FORMAT_MINOR,
            fs_root_address: reserved,
            cipher: init.cipher,
            iv_seed,
            key_check: cipher.key_check(),
            compatibility: true,
            block_size_level: init.block_size_level,
            block_count: init.block_count,
            uuid: init
                .uuid
                .unwrap_or_else(|| Uuid::new_v4().into_bytes()),
        };
        file.write_all_at(&root.serialize()?, 0)
            .map_err(|e| Error::with_cause(ErrorKind::WriteIoFailed, e))?;

        let mut meta = Meta::new();
        meta.set("format", "ini");
        meta.set("created", get_timestamp().as_secs().to_string());
        let region = meta.serialize(meta::region_size(block_size) as usize)?;
        file.write_all_at(&region, block_size)
            .map_err(|e| Error::with_cause(ErrorKind::WriteIoFailed, e))?;

        log::debug!(
            "created volume `{}`: {} blocks of {}",
            init.path.display(),
            init.block_count,
            ByteSize(block_size)
        );
        Ok(())
    }

    /// Opens an existing volume image.
    ///
    /// Arguments:
    /// - `path` is the volume image, a regular file or a block device.
    /// - `user_key` is the user key, required when the volume is encrypted.
    /// - `integrity` makes a size mismatch fatal here, and checksum or tag
    ///   mismatches fatal on subsequent block reads.
    pub fn open(path: &Path, user_key: Option<&[u8]>, integrity: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::with_cause(ErrorKind::OpenFailed, e))?;

        // The root record fits within the smallest legal block
        let mut prefix = vec![0u8; 1024];
        file.read_exact_at(&mut prefix, 0)
            .map_err(|e| Error::with_cause(ErrorKind::ReadIoFailed, e))?;
        let root = RootBlock::deserialize(&prefix)?;
        if !root.compatibility {
            return Err(ErrorKind::ModeIncompatible.into());
        }
        let block_size = root.block_size();
        if integrity {
            let size = get_size(&file).map_err(|e| Error::with_cause(ErrorKind::ReadIoFailed, e))?;
            if size != root.block_count * block_size {
                return Err(ErrorKind::SizeMismatch.into());
            }
        }

        let cipher = BlockCipher::derive(root.cipher, root.iv_seed, user_key)?;
        if root.cipher != CipherKind::None && cipher.key_check() != root.key_check {
            return Err(ErrorKind::KeyMismatch.into());
        }

        let mut region = vec![0u8; meta::region_size(block_size) as usize];
        file.read_exact_at(&mut region, block_size)
            .map_err(|e| Error::with_cause(ErrorKind::ReadIoFailed, e))?;
        let meta = Meta::deserialize(&region)?;

        log::debug!(
            "opened volume `{}` ({})",
            path.display(),
            Uuid::from_bytes(root.uuid)
        );
        Ok(Self {
            file,
            block_size,
            block_count: root.block_count,
            integrity,
            root: RefCell::new(root),
            meta: RefCell::new(meta),
            cipher,
            queue: IoQueue::new(),
        })
    }

    /// Returns the physical block size in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Returns the total number of blocks.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Returns the address of the first block past the meta cluster.
    pub fn data_offset(&self) -> u64 {
        1 + meta::cluster_blocks(self.block_size)
    }

    /// Returns a copy of the root block.
    pub fn root(&self) -> RootBlock {
        self.root.borrow().clone()
    }

    /// Returns the cipher keyed for this volume.
    pub fn cipher(&self) -> &BlockCipher {
        &self.cipher
    }

    /// Tells whether the volume was opened with integrity checking.
    pub fn integrity(&self) -> bool {
        self.integrity
    }

    /// Returns a copy of the in-memory meta cluster.
    pub fn meta(&self) -> Meta {
        self.meta.borrow().clone()
    }

    fn check_address(&self, address: u64) -> Result<()> {
        if address >= self.block_count {
            return Err(ErrorKind::OutOfBounds.into());
        }
        Ok(())
    }

    /// Reads one physical block.
    pub fn read_block(&self, address: u64) -> Result<Vec<u8>> {
        self.check_address(address)?;
        let lease = self.queue.acquire();
        let mut buf = vec![0u8; self.block_size as usize];
        let res = self.file.read_exact_at(&mut buf, address * self.block_size);
        let released = lease.release();
        res.map_err(|e| Error::with_cause(ErrorKind::ReadIoFailed, e))?;
        released?;
        Ok(buf)
    }

    /// Writes one physical block.
    ///
    /// `buf` must be exactly one block long.
    pub fn write_block(&self, address: u64, buf: &[u8]) -> Result<()> {
        self.check_address(address)?;
        if buf.len() as u64 != self.block_size {
            return Err(ErrorKind::OutOfBounds.into());
        }
        let lease = self.queue.acquire();
        let res = self.file.write_all_at(buf, address * self.block_size);
        let released = lease.release();
        res.map_err(|e| Error::with_cause(ErrorKind::WriteIoFailed, e))?;
        released
    }

    /// Reads and decodes the head block at the given address.
    ///
    /// With integrity checking on, a checksum mismatch is an error; without
    /// it the caller gets the decoded block along with its checksums.
    pub fn read_head(&self, address: u64) -> Result<Decoded<Head>> {
        let buf = self.read_block(address)?;
        let dec = Head::deserialize(buf, &self.cipher, address)
            .map_err(|e| e.wrap(ErrorKind::IntegrityMismatch))?;
        if self.integrity && !dec.crc_ok() {
            return Err(ErrorKind::IntegrityMismatch.into());
        }
        Ok(dec)
    }

    /// Serializes and writes a head block at the given address.
    pub fn write_head(&self, address: u64, head: &Head) -> Result<()> {
        let buf = head.serialize(self.block_size, &self.cipher, address)?;
        self.write_block(address, &buf)
    }

    /// Reads and decodes the link block at the given address.
    pub fn read_link(&self, address: u64) -> Result<Decoded<Link>> {
        let buf = self.read_block(address)?;
        let dec = Link::deserialize(buf, &self.cipher, address)
            .map_err(|e| e.wrap(ErrorKind::IntegrityMismatch))?;
        if self.integrity && !dec.crc_ok() {
            return Err(ErrorKind::IntegrityMismatch.into());
        }
        Ok(dec)
    }

    /// Serializes and writes a link block at the given address.
    pub fn write_link(&self, address: u64, link: &Link) -> Result<()> {
        let buf = link.serialize(self.block_size, &self.cipher, address)?;
        self.write_block(address, &buf)
    }

    /// Reads and decodes the data block at the given address.
    pub fn read_data(&self, address: u64) -> Result<Decoded<Data>> {
        let buf = self.read_block(address)?;
        let dec = Data::deserialize(buf, &self.cipher, address)
            .map_err(|e| e.wrap(ErrorKind::IntegrityMismatch))?;
        if self.integrity && !dec.crc_ok() {
            return Err(ErrorKind::IntegrityMismatch.into());
        }
        Ok(dec)
    }

    /// Serializes and writes a data block at the given address.
    pub fn write_data(&self, address: u64, data: &Data) -> Result<()> {
        let buf = data.serialize(self.block_size, &self.cipher, address)?;
        self.write_block(address, &buf)
    }

    /// Re-reads the meta cluster from disk.
    pub fn read_meta_cluster(&self) -> Result<Meta> {
        let mut region = vec![0u8; meta::region_size(self.block_size) as usize];
        let lease = self.queue.acquire();
        let res = self.file.read_exact_at(&mut region, self.block_size);
        let released = lease.release();
        res.map_err(|e| Error::with_cause(ErrorKind::ReadIoFailed, e))?;
        released?;

        let meta = Meta::deserialize(&region)?;
        *self.meta.borrow_mut() = meta.clone();
        Ok(meta)
    }

    /// Rewrites the whole meta cluster.
    pub fn write_meta_cluster(&self, meta: &Meta) -> Result<()> {
        let region = meta.serialize(meta::region_size(self.block_size) as usize)?;
        let lease = self.queue.acquire();
        let res = self.file.write_all_at(&region, self.block_size);
        let released = lease.release();
        res.map_err(|e| Error::with_cause(ErrorKind::WriteIoFailed, e))?;
        released?;

        *self.meta.borrow_mut() = meta.clone();
        Ok(())
    }

    /// Rewrites the root block.
    ///
    /// The geometry of an opened volume is fixed: the new root must keep the
    /// block size level and block count.
    pub fn rewrite_root(&self, root: RootBlock) -> Result<()> {
        {
            let cur = self.root.borrow();
            if root.block_size_level != cur.block_size_level || root.block_count != cur.block_count
            {
                return Err(ErrorKind::ModeIncompatible.into());
            }
        }
        let buf = root.serialize()?;
        let lease = self.queue.acquire();
        let res = self.file.write_all_at(&buf, 0);
        let released = lease.release();
        res.map_err(|e| Error::with_cause(ErrorKind::WriteIoFailed, e))?;
        released?;

        *self.root.borrow_mut() = root;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::head::ResourceKind;
    use tempfile::tempdir;

    fn volume_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("test.ibfs")
    }

    #[test]
    fn create_and_open_plain() {
        let dir = tempdir().unwrap();
        let path = volume_path(&dir);
        let mut init = VolumeInit::new(&path, 1, 1000);
        Volume::create_empty(&mut init).unwrap();

        // 1000 blocks of 1 KiB
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1_024_000);

        let volume = Volume::open(&path, None, true).unwrap();
        let root = volume.root();
        assert_eq!(root.major, FORMAT_MAJOR);
        assert_eq!(root.cipher, CipherKind::None);
        assert_eq!(root.block_size_level, 1);
        assert_eq!(root.block_count, 1000);
        assert!(root.compatibility);
        assert_eq!(volume.block_size(), 1024);
        assert_eq!(volume.data_offset(), 65);
        assert_eq!(root.fs_root_address, 65);
        assert_eq!(volume.meta().get("format"), Some("ini"));

        // The meta cluster region is zero past the document
        let raw = std::fs::read(&path).unwrap();
        let region = &raw[1024..65 * 1024];
        let end = region.iter().position(|b| *b == 0).unwrap();
        assert!(region[end..].iter().all(|b| *b == 0));
    }

    #[test]
    fn create_reports_progress() {
        let dir = tempdir().unwrap();
        let path = volume_path(&dir);
        let mut reports = Vec::new();
        let mut progress = |written: u64, total: u64| reports.push((written, total));
        let mut init = VolumeInit::new(&path, 1, 8 * 1024);
        init.progress = Some(&mut progress);
        Volume::create_empty(&mut init).unwrap();

        let total = 8 * 1024 * 1024;
        assert_eq!(reports.last(), Some(&(total, total)));
        assert!(reports.len() >= 2);
    }

    #[test]
    fn head_roundtrip_encrypted() {
        let dir = tempdir().unwrap();
        let path = volume_path(&dir);
        let mut init = VolumeInit::new(&path, 1, 100);
        init.cipher = CipherKind::Aes256Xts;
        init.user_key = Some(b"hello world");
        Volume::create_empty(&mut init).unwrap();

        let volume = Volume::open(&path, Some(b"hello world"), true).unwrap();
        let head = Head {
            next: 81,
            created: 1700000000,
            modified: 1700000000,
            resource: ResourceKind::File,
            body: (1u64..=5).flat_map(|v| v.to_be_bytes()).collect(),
        };
        volume.write_head(80, &head).unwrap();

        let dec = volume.read_head(80).unwrap();
        assert!(dec.crc_ok());
        assert_eq!(dec.block, head);
    }

    #[test]
    fn write_then_read_returns_written_bytes() {
        let dir = tempdir().unwrap();
        let path = volume_path(&dir);
        Volume::create_empty(&mut VolumeInit::new(&path, 1, 100)).unwrap();
        let volume = Volume::open(&path, None, true).unwrap();

        let old = volume.read_block(70).unwrap();
        assert_eq!(old, vec![0u8; 1024]);

        let buf = vec![0x77u8; 1024];
        volume.write_block(70, &buf).unwrap();
        assert_eq!(volume.read_block(70).unwrap(), buf);
    }

    #[test]
    fn wrong_tag_is_integrity_mismatch() {
        let dir = tempdir().unwrap();
        let path = volume_path(&dir);
        Volume::create_empty(&mut VolumeInit::new(&path, 1, 100)).unwrap();
        let volume = Volume::open(&path, None, true).unwrap();

        volume.write_data(70, &Data { body: vec![1, 2, 3] }).unwrap();
        let err = volume.read_head(70).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityMismatch);
    }

    #[test]
    fn corrupt_body_read_depends_on_integrity() {
        let dir = tempdir().unwrap();
        let path = volume_path(&dir);
        Volume::create_empty(&mut VolumeInit::new(&path, 1, 100)).unwrap();

        {
            let volume = Volume::open(&path, None, true).unwrap();
            volume
                .write_data(70, &Data { body: vec![9; 100] })
                .unwrap();
            // Flip one bit inside the body
            let mut raw = volume.read_block(70).unwrap();
            raw[100] ^= 1;
            volume.write_block(70, &raw).unwrap();
            assert_eq!(
                volume.read_data(70).unwrap_err().kind(),
                ErrorKind::IntegrityMismatch
            );
        }

        // Without integrity the caller gets the data and the flag
        let volume = Volume::open(&path, None, false).unwrap();
        let dec = volume.read_data(70).unwrap();
        assert!(!dec.crc_ok());
    }

    #[test]
    fn size_mismatch() {
        let dir = tempdir().unwrap();
        let path = volume_path(&dir);
        Volume::create_empty(&mut VolumeInit::new(&path, 1, 100)).unwrap();

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(99 * 1024).unwrap();
        drop(file);

        let err = Volume::open(&path, None, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SizeMismatch);
        // Opening without integrity goes through
        Volume::open(&path, None, false).unwrap();
    }

    #[test]
    fn incompatible_volume_rejected() {
        let dir = tempdir().unwrap();
        let path = volume_path(&dir);
        Volume::create_empty(&mut VolumeInit::new(&path, 1, 100)).unwrap();

        // Clear the compatibility flag
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.write_all_at(&[0], 45).unwrap();
        drop(file);

        let err = Volume::open(&path, None, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModeIncompatible);
    }

    #[test]
    fn wrong_key_rejected() {
        let dir = tempdir().unwrap();
        let path = volume_path(&dir);
        let mut init = VolumeInit::new(&path, 1, 100);
        init.cipher = CipherKind::Aes128Xts;
        init.user_key = Some(b"right");
        Volume::create_empty(&mut init).unwrap();

        assert_eq!(
            Volume::open(&path, Some(b"wrong"), true).unwrap_err().kind(),
            ErrorKind::KeyMismatch
        );
        assert_eq!(
            Volume::open(&path, None, true).unwrap_err().kind(),
            ErrorKind::KeyRequired
        );
        Volume::open(&path, Some(b"right"), true).unwrap();
    }

    #[test]
    fn meta_cluster_rewrite() {
        let dir = tempdir().unwrap();
        let path = volume_path(&dir);
        Volume::create_empty(&mut VolumeInit::new(&path, 1, 100)).unwrap();
        let volume = Volume::open(&path, None, true).unwrap();

        let mut meta = volume.meta();
        meta.set("label", "scratch");
        volume.write_meta_cluster(&meta).unwrap();

        let reread = volume.read_meta_cluster().unwrap();
        assert_eq!(reread.get("label"), Some("scratch"));
        assert_eq!(reread.get("format"), Some("ini"));
    }

    #[test]
    fn root_rewrite_keeps_geometry() {
        let dir = tempdir().unwrap();
        let path = volume_path(&dir);
        Volume::create_empty(&mut VolumeInit::new(&path, 1, 100)).unwrap();
        let volume = Volume::open(&path, None, true).unwrap();

        let mut root = volume.root();
        root.fs_root_address = 70;
        volume.rewrite_root(root).unwrap();
        drop(volume);

        let volume = Volume::open(&path, None, true).unwrap();
        assert_eq!(volume.root().fs_root_address, 70);

        let mut root = volume.root();
        root.block_count = 200;
        assert_eq!(
            volume.rewrite_root(root).unwrap_err().kind(),
            ErrorKind::ModeIncompatible
        );
    }

    #[test]
    fn out_of_range_address_rejected() {
        let dir = tempdir().unwrap();
        let path = volume_path(&dir);
        Volume::create_empty(&mut VolumeInit::new(&path, 1, 100)).unwrap();
        let volume = Volume::open(&path, None, true).unwrap();

        assert_eq!(
            volume.read_block(100).unwrap_err().kind(),
            ErrorKind::OutOfBounds
        );
        assert_eq!(
            volume.write_block(100, &[0; 1024]).unwrap_err().kind(),
            ErrorKind::OutOfBounds
        );
    }
}

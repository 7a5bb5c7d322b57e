//! Filesystem facade.
//!
//! Composes a volume with its address space and exposes the operations the
//! upper layers build on: creating and opening volumes, opening file block
//! maps and file handles, and the node half of the resource lifecycle.
//!
//! The facade only knows the filesystem root directory by address; walking
//! the directory tree and marking its blocks in the address space is the
//! directory layer's business, done through [`Filesystem::open_fbm`] and
//! [`Filesystem::address_space`].

use crate::block::data::Data;
use crate::block::head::Head;
use crate::block::head::ResourceKind;
use crate::error::Result;
use crate::fbm::Fbm;
use crate::file::FileHandle;
use crate::space::AddressSpace;
use crate::volume::Volume;
use crate::volume::VolumeInit;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

/// An opened filesystem.
#[derive(Debug)]
pub struct Filesystem {
    volume: Rc<Volume>,
    space: Rc<RefCell<AddressSpace>>,
}

impl Filesystem {
    /// Creates an empty filesystem.
    ///
    /// The volume image is created, then an empty root directory is written:
    /// a directory head at the first user-addressable block, its table in a
    /// data block right after.
    pub fn create_empty(init: &mut VolumeInit<'_>) -> Result<Self> {
        Volume::create_empty(init)?;
        let volume = Rc::new(Volume::open(&init.path, init.user_key, true)?);

        let head_address = volume.data_offset();
        let table_address = head_address + 1;
        // Table first, head second: the reference goes down last
        volume.write_data(table_address, &Data { body: Vec::new() })?;
        let head = Head {
            body: table_address.to_le_bytes().to_vec(),
            ..Head::new(ResourceKind::Directory)
        };
        volume.write_head(head_address, &head)?;

        Self::from_volume(volume)
    }

    /// Opens an existing filesystem.
    ///
    /// See [`Volume::open`] for the arguments.
    pub fn open(path: &Path, user_key: Option<&[u8]>, integrity: bool) -> Result<Self> {
        let volume = Rc::new(Volume::open(path, user_key, integrity)?);
        Self::from_volume(volume)
    }

    fn from_volume(volume: Rc<Volume>) -> Result<Self> {
        let space = Rc::new(RefCell::new(AddressSpace::new(
            volume.block_count(),
            volume.data_offset(),
        )));
        let fs = Self { volume, space };
        fs.mark_root_chain()?;
        Ok(fs)
    }

    /// Marks the filesystem root directory's blocks allocated: its head, its
    /// links and its data blocks.
    fn mark_root_chain(&self) -> Result<()> {
        let root = self.volume.root();
        let fbm = self.open_fbm(root.fs_root_address)?;
        let mut space = self.space.borrow_mut();
        for address in fbm.index_addresses() {
            space.mark(address)?;
        }
        for address in fbm.data_addresses(0) {
            space.mark(address)?;
        }
        Ok(())
    }

    /// Returns the underlying volume.
    pub fn volume(&self) -> &Rc<Volume> {
        &self.volume
    }

    /// Returns the address space of the volume.
    pub fn address_space(&self) -> &Rc<RefCell<AddressSpace>> {
        &self.space
    }

    /// Opens the file block map whose head sits at `address`.
    pub fn open_fbm(&self, address: u64) -> Result<Fbm> {
        Fbm::open(self.volume.clone(), self.space.clone(), address)
    }

    /// Opens a file handle on the resource whose head sits at `address`.
    pub fn open_file(&self, address: u64) -> Result<FileHandle> {
        FileHandle::open(self.volume.clone(), self.space.clone(), address)
    }

    /// Creates a fresh, empty resource and returns its head address.
    pub fn create_node(&self, resource: ResourceKind) -> Result<u64> {
        let address = self.space.borrow_mut().alloc()?;
        let head = Head::new(resource);
        if let Err(e) = self.volume.write_head(address, &head) {
            // Nothing references the head yet
            let _ = self.space.borrow_mut().free(address);
            return Err(e);
        }
        log::trace!("created {:?} node at {address}", resource);
        Ok(address)
    }

    /// Deletes the resource whose head sits at `address`.
    ///
    /// Every data block and link of the resource is released, then the head
    /// address itself.
    pub fn delete_node(&self, address: u64) -> Result<()> {
        let mut fbm = self.open_fbm(address)?;
        fbm.trunc(fbm.length())?;
        self.space.borrow_mut().free(address)?;
        log::trace!("deleted node at {address}");
        Ok(())
    }
}

//! IBFS is a virtual 64-bit filesystem stored inside a single host file.
//!
//! It provides encrypted, integrity-checked, block-addressed storage for
//! hierarchical file trees, as a security layer over an untrusted host
//! filesystem. This crate is the volume engine: the on-disk block format and
//! its AES-XTS envelope, the serialized block I/O path, the per-file block
//! maps and the block address allocator. Directory trees, permissions and the
//! command surface live in the layers above.
//!
//! Entry points: [`Filesystem::create_empty`] and [`Filesystem::open`].

pub mod block;
pub mod crypto;
pub mod cursor;
pub mod error;
pub mod fbm;
pub mod file;
pub mod fs;
pub mod queue;
pub mod space;
pub mod util;
pub mod volume;

pub use error::Error;
pub use error::ErrorKind;
pub use error::Result;
pub use fs::Filesystem;
pub use volume::Volume;
pub use volume::VolumeInit;

//! Utility functions shared across the crate.

use libc::ioctl;
use rand_core::OsRng;
use rand_core::RngCore;
use std::ffi::c_long;
use std::fmt;
use std::fs::File;
use std::io;
use std::io::Error;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: Get size of disk in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// Returns the current timestamp since the Unix epoch.
pub fn get_timestamp() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock panic!")
}

/// Performs the division of `a` by `b`, rounding the result up.
pub fn ceil_division(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Fills the given buffer with random bytes from the OS generator.
pub fn get_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Returns the size in bytes of the storage behind the given open file.
///
/// The file may be a regular file or a block device.
pub fn get_size(file: &File) -> io::Result<u64> {
    let metadata = file.metadata()?;
    let file_type = metadata.file_type();
    if file_type.is_block_device() || file_type.is_char_device() {
        let mut size = 0u64;
        let ret = unsafe { ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        Ok(size)
    } else {
        Ok(metadata.len())
    }
}

/// A number of bytes, displayed in binary units for progress and lifecycle
/// logging.
///
/// Block sizes are exact powers of two and volume sizes whole multiples of
/// them, so truncating to the largest unit that keeps a non-zero integer part
/// loses nothing the logs care about.
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 7] = ["bytes", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
        let mut value = self.0;
        let mut unit = 0;
        while value >= 1024 && unit < UNITS.len() - 1 {
            value /= 1024;
            unit += 1;
        }
        write!(fmt, "{value} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytesize() {
        // Block sizes: smallest and largest levels
        assert_eq!(ByteSize(1024).to_string(), "1 KiB");
        assert_eq!(ByteSize(16 * 1024 * 1024).to_string(), "16 MiB");
        // A 1000-block volume of 1 KiB blocks
        assert_eq!(ByteSize(1_024_000).to_string(), "1000 KiB");
        // The meta cluster region
        assert_eq!(ByteSize(65536).to_string(), "64 KiB");
        // Progress reporting granularity
        assert_eq!(ByteSize(5 * 1024 * 1024).to_string(), "5 MiB");
        // Odd sizes truncate instead of rounding
        assert_eq!(ByteSize(0).to_string(), "0 bytes");
        assert_eq!(ByteSize(2005).to_string(), "1 KiB");
        assert_eq!(ByteSize(u64::MAX).to_string(), "15 EiB");
    }

    #[test]
    fn ceil() {
        assert_eq!(ceil_division(0, 1024), 0);
        assert_eq!(ceil_division(1, 1024), 1);
        assert_eq!(ceil_division(1024, 1024), 1);
        assert_eq!(ceil_division(1025, 1024), 2);
        assert_eq!(ceil_division(65536, 1024), 64);
    }
}

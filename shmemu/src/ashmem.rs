//! Ashmem region primitive
//!
//! Thin wrapper around the `/dev/ashmem` character device. Each region is an
//! anonymous, fd-backed memory object that becomes shareable by passing its
//! descriptor to another process. The kernel driver has no Rust (or libc)
//! wrapper, so the three ioctls are issued through `libc::ioctl` directly.

use crate::error::{ShmError, ShmResult};
use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

const ASHMEM_DEVICE: &str = "/dev/ashmem";

/// Name-length limit of the ashmem driver, terminator included.
const ASHMEM_NAME_LEN: usize = 256;

// _IOW(0x77, 1, char[ASHMEM_NAME_LEN])
const ASHMEM_SET_NAME: libc::c_ulong = 0x4100_7701;
// _IOW(0x77, 3, size_t)
#[cfg(target_pointer_width = "64")]
const ASHMEM_SET_SIZE: libc::c_ulong = 0x4008_7703;
#[cfg(target_pointer_width = "32")]
const ASHMEM_SET_SIZE: libc::c_ulong = 0x4004_7703;
// _IO(0x77, 4)
const ASHMEM_GET_SIZE: libc::c_ulong = 0x0000_7704;

/// One ashmem-backed memory region with exclusive descriptor ownership.
///
/// The descriptor is closed exactly once when the region is dropped. A
/// region received over the hand-off socket is an independent duplicate of
/// the creator's descriptor with its own close lifetime.
#[derive(Debug)]
pub struct AshmemRegion {
    file: File,
    size: usize,
}

impl AshmemRegion {
    /// Create a fresh region of `size` bytes with a diagnostic name.
    ///
    /// The name is truncated to the driver's limit. Any ioctl failure
    /// closes the descriptor and reports the errno; there are no retries.
    pub fn create(name: &str, size: usize) -> ShmResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(ASHMEM_DEVICE)
            .map_err(|e| ShmError::DeviceUnavailable {
                source: e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::ENOENT),
            })?;

        let mut buf = [0u8; ASHMEM_NAME_LEN];
        let copy = name.len().min(ASHMEM_NAME_LEN - 1);
        buf[..copy].copy_from_slice(&name.as_bytes()[..copy]);
        // SAFETY: the fd is open and the buffer outlives the call.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), ASHMEM_SET_NAME as _, buf.as_ptr()) };
        if rc != 0 {
            return Err(ShmError::RegionSetup {
                name: name.to_string(),
                source: Errno::last(),
            });
        }

        // The size argument is passed by value, not by pointer.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), ASHMEM_SET_SIZE as _, size) };
        if rc != 0 {
            return Err(ShmError::RegionSetup {
                name: name.to_string(),
                source: Errno::last(),
            });
        }

        tracing::debug!(name, size, fd = file.as_raw_fd(), "created ashmem region");
        Ok(Self { file, size })
    }

    /// Adopt a descriptor received over the hand-off socket.
    ///
    /// The receiving process has no other way to learn the region length,
    /// so it is queried from the driver.
    pub fn from_received(file: File) -> ShmResult<Self> {
        let size = region_size(&file)?;
        Ok(Self { file, size })
    }

    /// Page-rounded byte length of the region.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The owned descriptor backing this region.
    pub fn file(&self) -> &File {
        &self.file
    }
}

/// Query a descriptor's region length via `ASHMEM_GET_SIZE`.
pub fn region_size(file: &File) -> ShmResult<usize> {
    // SAFETY: plain query ioctl on an open fd.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), ASHMEM_GET_SIZE as _) };
    if rc < 0 {
        return Err(ShmError::RegionSetup {
            name: String::new(),
            source: Errno::last(),
        });
    }
    Ok(rc as u32 as usize)
}

/// Whether the ashmem device exists on this system.
pub fn device_present() -> bool {
    Path::new(ASHMEM_DEVICE).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_query_size() -> ShmResult<()> {
        if !device_present() {
            return Ok(());
        }
        let region = AshmemRegion::create("shmemu-test-region", 8192)?;
        assert_eq!(region.size(), 8192);
        assert_eq!(region_size(region.file())?, 8192);
        Ok(())
    }

    #[test]
    fn test_missing_device_is_reported() {
        if device_present() {
            return;
        }
        let err = AshmemRegion::create("shmemu-test-region", 4096).unwrap_err();
        assert!(matches!(err, ShmError::DeviceUnavailable { .. }));
    }

    #[test]
    fn test_name_truncation_stays_in_bounds() {
        // Must not panic even for names longer than the driver limit.
        let long = "x".repeat(2 * ASHMEM_NAME_LEN);
        let _ = AshmemRegion::create(&long, 4096);
    }
}

//! Process-local memory mapping guard

use crate::error::{ShmError, ShmResult};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// A `MAP_SHARED` mapping of a segment descriptor.
///
/// Owns the virtual address range exclusively and unmaps it exactly once on
/// drop; the descriptor itself is owned by the segment, not the mapping.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the mapping is only ever owned by the registry behind its mutex;
// the raw address handed to callers does not alias the guard's ownership.
unsafe impl Send for Mapping {}

impl Mapping {
    /// Map `len` bytes of the descriptor, read-only or read-write.
    pub fn map(file: &File, len: usize, read_only: bool) -> ShmResult<Self> {
        let length = NonZeroUsize::new(len).ok_or(ShmError::InvalidSize { size: len })?;
        let prot = if read_only {
            ProtFlags::PROT_READ
        } else {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        };
        // SAFETY: fresh mapping at a kernel-chosen address over an fd we own.
        let ptr = unsafe { mmap(None, length, prot, MapFlags::MAP_SHARED, file, 0) }
            .map_err(|source| ShmError::MappingFailed { source })?;
        Ok(Self { ptr, len })
    }

    /// Base address of the mapping.
    pub fn addr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping covers zero bytes (never true for live mappings).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Release the guard without unmapping.
    ///
    /// Used by the fork reset: address ranges inherited from the parent may
    /// still be referenced by caller code and must survive the bookkeeping
    /// wipe.
    pub(crate) fn leak(self) {
        std::mem::forget(self);
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            tracing::warn!(addr = ?self.ptr, len = self.len, %err, "munmap failed");
        }
    }
}

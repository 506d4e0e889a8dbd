//! Segment state held in the process-local registry

use crate::ashmem::AshmemRegion;
use crate::id::SegmentId;
use crate::mapping::Mapping;

/// One shared memory segment as seen by this process.
///
/// The creating process holds the original ashmem descriptor; every other
/// process holds an independent duplicate obtained over the hand-off socket.
/// Either way the descriptor is closed exactly once when the segment leaves
/// the registry.
#[derive(Debug)]
pub struct Segment {
    id: SegmentId,
    key: libc::key_t,
    region: AshmemRegion,
    mapping: Option<Mapping>,
    pending_removal: bool,
}

impl Segment {
    /// Entry for a segment this process created.
    pub(crate) fn owned(id: SegmentId, key: libc::key_t, region: AshmemRegion) -> Self {
        Self {
            id,
            key,
            region,
            mapping: None,
            pending_removal: false,
        }
    }

    /// Entry cached after resolving a foreign id over the hand-off socket.
    pub(crate) fn remote(id: SegmentId, key: libc::key_t, region: AshmemRegion) -> Self {
        // Same shape as an owned entry; ownership is derived from the id's
        // socket identity, not stored separately.
        Self::owned(id, key, region)
    }

    /// Segment id.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// SysV key the segment was created under (`IPC_PRIVATE` if anonymous).
    pub fn key(&self) -> libc::key_t {
        self.key
    }

    /// Page-rounded byte length.
    pub fn size(&self) -> usize {
        self.region.size()
    }

    /// Backing region and descriptor.
    pub fn region(&self) -> &AshmemRegion {
        &self.region
    }

    /// Current process-local mapping, if attached.
    pub fn mapping(&self) -> Option<&Mapping> {
        self.mapping.as_ref()
    }

    /// Record a fresh mapping and return its base address.
    pub(crate) fn set_mapping(&mut self, mapping: Mapping) -> *mut u8 {
        let addr = mapping.addr();
        self.mapping = Some(mapping);
        addr
    }

    /// Unmap, leaving the registry entry in place.
    pub(crate) fn clear_mapping(&mut self) {
        self.mapping = None;
    }

    /// Whether `addr` is the base address of this segment's mapping.
    pub(crate) fn maps_addr(&self, addr: *const u8) -> bool {
        self.mapping
            .as_ref()
            .is_some_and(|m| std::ptr::eq(m.addr().cast_const(), addr))
    }

    /// Sticky deletion flag set by `IPC_RMID`.
    pub fn pending_removal(&self) -> bool {
        self.pending_removal
    }

    /// Mark the segment for deferred destruction.
    pub(crate) fn mark_removal(&mut self) {
        self.pending_removal = true;
    }

    /// Drop all guards without closing the descriptor or unmapping.
    ///
    /// Fork reset only: the child inherited the parent's descriptors and
    /// mappings, and caller code may still be using the mapped ranges even
    /// though the child's bookkeeping starts from empty.
    pub(crate) fn leak(mut self) {
        if let Some(mapping) = self.mapping.take() {
            mapping.leak();
        }
        std::mem::forget(self);
    }
}

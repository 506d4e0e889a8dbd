//! Segment id codec
//!
//! A segment id packs the creating process's 16-bit socket identity into the
//! high half of a `u32` and a per-process slot counter into the low 15 bits.
//! Bit 15 is reserved for administrative states and is never set on a live
//! id; keeping it clear also makes the encoding of the C failure sentinel
//! `-1` (all bits set) unrepresentable as a live id.

use crate::error::{ShmError, ShmResult};
use static_assertions::const_assert_eq;
use std::ffi::c_int;

/// Mask selecting the slot counter bits of the low half.
pub const SLOT_MASK: u32 = 0x7fff;

/// Reserved administrative bit; never set on a live id.
pub const RESERVED_BIT: u32 = 0x8000;

const_assert_eq!(SLOT_MASK & RESERVED_BIT, 0);
const_assert_eq!(SLOT_MASK | RESERVED_BIT, 0xffff);

/// Opaque handle for one shared memory segment.
///
/// The socket identity half addresses the owning process's hand-off
/// listener; the slot half distinguishes segments created by that process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId {
    socket_id: u16,
    slot: u16,
}

impl SegmentId {
    /// Build an id from an owner identity and a slot counter value.
    ///
    /// The slot must fit the 15-bit counter space and be non-zero; both
    /// halves being non-zero is an allocation invariant, not a wire rule.
    pub(crate) fn new(socket_id: u16, slot: u16) -> Self {
        debug_assert!(socket_id != 0);
        debug_assert!(slot != 0 && u32::from(slot) & !SLOT_MASK == 0);
        Self { socket_id, slot }
    }

    /// Decode a raw 32-bit id, rejecting administrative encodings.
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw & RESERVED_BIT != 0 {
            return None;
        }
        let socket_id = (raw >> 16) as u16;
        let slot = (raw & SLOT_MASK) as u16;
        if socket_id == 0 || slot == 0 {
            return None;
        }
        Some(Self { socket_id, slot })
    }

    /// Encode to the raw 32-bit form used on the wire and in key symlinks.
    pub fn to_raw(self) -> u32 {
        (u32::from(self.socket_id) << 16) | u32::from(self.slot)
    }

    /// Decode the C ABI `shmid` handle.
    pub fn from_shmid(shmid: c_int) -> ShmResult<Self> {
        Self::from_raw(shmid as u32).ok_or(ShmError::UnknownId { id: shmid as u32 })
    }

    /// Encode to the C ABI `shmid` handle.
    pub fn to_shmid(self) -> c_int {
        self.to_raw() as c_int
    }

    /// Socket identity of the creating process.
    pub fn socket_id(self) -> u16 {
        self.socket_id
    }

    /// Per-process slot counter value.
    pub fn slot(self) -> u16 {
        self.slot
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.to_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pack_unpack() {
        let id = SegmentId::new(0xbeef, 0x0001);
        assert_eq!(id.to_raw(), 0xbeef_0001);
        assert_eq!(SegmentId::from_raw(0xbeef_0001), Some(id));
    }

    #[test]
    fn test_reserved_bit_rejected() {
        assert_eq!(SegmentId::from_raw(0x0001_8001), None);
    }

    #[test]
    fn test_zero_halves_rejected() {
        assert_eq!(SegmentId::from_raw(0x0000_0001), None);
        assert_eq!(SegmentId::from_raw(0x0001_0000), None);
    }

    #[test]
    fn test_shmid_never_encodes_failure_sentinel() {
        // Even the all-ones corner of the id space stays distinct from -1.
        let id = SegmentId::new(u16::MAX, SLOT_MASK as u16);
        assert_ne!(id.to_shmid(), -1);
        assert_eq!(SegmentId::from_raw(u32::MAX), None);
    }

    #[test]
    fn test_from_shmid_unknown() {
        assert!(SegmentId::from_shmid(-1).is_err());
        assert!(SegmentId::from_shmid(0).is_err());
    }

    proptest! {
        #[test]
        fn prop_round_trip(socket_id in 1u16.., slot in 1u16..=SLOT_MASK as u16) {
            let id = SegmentId::new(socket_id, slot);
            prop_assert_eq!(SegmentId::from_raw(id.to_raw()), Some(id));
            prop_assert_eq!(SegmentId::from_shmid(id.to_shmid()).unwrap(), id);
        }
    }
}

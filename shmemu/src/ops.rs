//! The four emulated operations
//!
//! `shm_get` creates or locates a segment and returns its id, `shm_attach`
//! turns an id into a process-local mapping (resolving foreign ids over the
//! hand-off socket), `shm_detach` unmaps and finalizes deferred deletion,
//! and `shm_remove`/`shm_stat` implement the `IPC_RMID`/`IPC_STAT` subset
//! of `shmctl`.

use crate::ashmem::AshmemRegion;
use crate::error::{ShmError, ShmResult};
use crate::handoff;
use crate::id::SegmentId;
use crate::keys;
use crate::registry;
use crate::segment::Segment;
use bitflags::bitflags;
use std::time::Duration;

/// Rounds of the key-arbitration loop before giving up with `ENOMEM`.
///
/// The race window is a single `symlink()` call, so a bounded budget only
/// triggers under pathological contention.
const KEY_RETRY_ROUNDS: u32 = 64;
const KEY_RETRY_DELAY: Duration = Duration::from_millis(1);

bitflags! {
    /// Flag word accepted by [`shm_get`]; mode bits are ignored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShmGetFlags: i32 {
        /// Create the segment if the key has no owner.
        const CREATE = libc::IPC_CREAT;
        /// Combined with `CREATE`, fail if the key already has an owner.
        const EXCLUSIVE = libc::IPC_EXCL;
    }
}

bitflags! {
    /// Flag word accepted by [`shm_attach`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttachFlags: i32 {
        /// Map the segment read-only.
        const READ_ONLY = libc::SHM_RDONLY;
    }
}

/// Lifecycle/permission snapshot reported by [`shm_stat`].
///
/// Attach counts are not tracked across processes; the count is a synthetic
/// 1 and the permissions are maximally permissive, which is all the X
/// server and its peers ever look at besides the size.
#[derive(Debug, Clone, Copy)]
pub struct SegmentStat {
    /// Page-rounded segment length in bytes.
    pub size: usize,
    /// SysV key the segment was created under.
    pub key: libc::key_t,
    /// Synthetic attach count.
    pub attach_count: u64,
    /// Permission bits (always 0666).
    pub mode: u32,
    /// Owning user, reported as the calling user.
    pub uid: libc::uid_t,
    /// Owning group, reported as the calling group.
    pub gid: libc::gid_t,
}

/// System page size in bytes.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no side effects and _SC_PAGESIZE is always valid.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 { n as usize } else { 4096 }
}

fn round_to_page(size: usize) -> ShmResult<usize> {
    if size == 0 {
        return Err(ShmError::InvalidSize { size });
    }
    let page = page_size();
    size.checked_add(page - 1)
        .map(|s| s & !(page - 1))
        .ok_or(ShmError::InvalidSize { size })
}

/// Create or locate a segment for `key` and return its id.
///
/// `IPC_PRIVATE` always creates a fresh anonymous segment. A real key runs
/// the symlink arbitration loop: resolve the current owner and join its
/// segment, or claim ownership with a newly created segment, retrying lost
/// races under a bounded budget.
pub fn shm_get(key: libc::key_t, size: usize, flags: ShmGetFlags) -> ShmResult<SegmentId> {
    // The listener must be up before the first id leaves this process.
    registry::lock().ensure_listener()?;

    if key == libc::IPC_PRIVATE {
        return create_segment(key, size);
    }

    let dir = keys::default_dir();
    for _ in 0..KEY_RETRY_ROUNDS {
        if let Some(raw) = keys::read_owner(&dir, key) {
            match join_existing(raw, size) {
                Ok(id) => {
                    if flags.contains(ShmGetFlags::CREATE | ShmGetFlags::EXCLUSIVE) {
                        return Err(ShmError::SegmentExists { key });
                    }
                    return Ok(id);
                }
                Err(err @ ShmError::SizeMismatch { .. }) => return Err(err),
                Err(err) => {
                    // Owner gone or never reachable; evict the stale link so
                    // somebody can claim the key afresh.
                    tracing::debug!(key, %err, "recorded key owner unreachable");
                    keys::release(&dir, key, raw);
                }
            }
        }

        if !flags.contains(ShmGetFlags::CREATE) {
            return Err(ShmError::KeyNotFound { key });
        }

        let id = create_segment(key, size)?;
        match keys::claim(&dir, key, id.to_raw()) {
            Ok(true) => return Ok(id),
            Ok(false) => {
                // Lost the race; drop our candidate segment and re-read.
                discard_local(id);
            }
            Err(err) => {
                discard_local(id);
                return Err(err.into());
            }
        }
        std::thread::sleep(KEY_RETRY_DELAY);
    }
    Err(ShmError::KeyContention { key })
}

/// Map the segment into this process and return the base address.
///
/// A foreign id is resolved over the hand-off socket on first reference and
/// cached. Attaching an already-attached segment returns the existing
/// mapping address rather than a second mapping.
pub fn shm_attach(id: SegmentId, flags: AttachFlags) -> ShmResult<*mut u8> {
    let read_only = flags.contains(AttachFlags::READ_ONLY);

    let mut guard = registry::lock();
    if guard.find_by_id(id).is_none() {
        if guard.socket_id() == Some(id.socket_id()) {
            // Our own identity but no entry: a stale id from a previous
            // epoch of this identity. Nobody can serve it.
            return Err(ShmError::UnknownId { id: id.to_raw() });
        }
        drop(guard);
        let (key, file) = handoff::fetch(id)?;
        let region = AshmemRegion::from_received(file)?;
        guard = registry::lock();
        if guard.find_by_id(id).is_none() {
            guard.insert(Segment::remote(id, key, region));
        }
    }

    let segment = guard.find_mut_by_id(id).ok_or(ShmError::UnknownId { id: id.to_raw() })?;
    if let Some(mapping) = segment.mapping() {
        return Ok(mapping.addr());
    }
    let mapping = crate::mapping::Mapping::map(segment.region().file(), segment.size(), read_only)?;
    let addr = segment.set_mapping(mapping);
    tracing::debug!(%id, ?addr, read_only, "attached segment");
    Ok(addr)
}

/// Unmap the segment whose mapping starts at `addr`.
///
/// Finalizes destruction when deletion is pending, and evicts cached
/// entries for segments this process does not own. An unknown address is a
/// silent success, matching the leniency the callers rely on for segments
/// attached by other means.
pub fn shm_detach(addr: *const u8) -> ShmResult<()> {
    let mut guard = registry::lock();
    let Some(index) = guard.index_by_addr(addr) else {
        tracing::trace!(?addr, "detach of unknown address ignored");
        return Ok(());
    };

    let our_identity = guard.socket_id();
    let segment = guard.segment_mut(index);
    segment.clear_mapping();

    let owned_here = our_identity == Some(segment.id().socket_id());
    if segment.pending_removal() || !owned_here {
        finalize_removal(&mut guard, index, owned_here);
    }
    Ok(())
}

/// Mark a segment for deletion (`IPC_RMID`).
///
/// Destruction is deferred while the segment is mapped; an id unknown to
/// this process is a no-op success because deletion is not distributed.
pub fn shm_remove(id: SegmentId) -> ShmResult<()> {
    let mut guard = registry::lock();
    let Some(index) = guard.index_by_id(id) else {
        tracing::trace!(%id, "RMID for unknown id ignored");
        return Ok(());
    };

    let our_identity = guard.socket_id();
    let segment = guard.segment_mut(index);
    if segment.mapping().is_some() {
        segment.mark_removal();
        tracing::debug!(%id, "segment removal deferred until detach");
        return Ok(());
    }
    let owned_here = our_identity == Some(id.socket_id());
    finalize_removal(&mut guard, index, owned_here);
    Ok(())
}

/// Report segment status (`IPC_STAT`).
pub fn shm_stat(id: SegmentId) -> ShmResult<SegmentStat> {
    let guard = registry::lock();
    let segment = guard.find_by_id(id).ok_or(ShmError::UnknownId { id: id.to_raw() })?;
    // SAFETY: geteuid/getegid cannot fail.
    Ok(SegmentStat {
        size: segment.size(),
        key: segment.key(),
        attach_count: 1,
        mode: 0o666,
        uid: unsafe { libc::geteuid() },
        gid: unsafe { libc::getegid() },
    })
}

/// Allocate a fresh segment under this process's identity.
fn create_segment(key: libc::key_t, size: usize) -> ShmResult<SegmentId> {
    let rounded = round_to_page(size)?;
    let mut guard = registry::lock();
    guard.ensure_listener()?;
    let id = guard.allocate_id()?;
    let name = format!("sysv-shm-{:08x}", id.to_raw());
    let region = AshmemRegion::create(&name, rounded)?;
    guard.insert(Segment::owned(id, key, region));
    tracing::info!(%id, key, size = rounded, "created segment");
    Ok(id)
}

/// Join the segment recorded for a key, resolving remotely if needed.
fn join_existing(raw: u32, size: usize) -> ShmResult<SegmentId> {
    let id = SegmentId::from_raw(raw).ok_or(ShmError::UnknownId { id: raw })?;

    let guard = registry::lock();
    if let Some(segment) = guard.find_by_id(id) {
        if segment.size() < size {
            return Err(ShmError::SizeMismatch {
                requested: size,
                actual: segment.size(),
            });
        }
        return Ok(id);
    }
    if guard.socket_id() == Some(id.socket_id()) {
        return Err(ShmError::UnknownId { id: raw });
    }
    drop(guard);

    let (key, file) = handoff::fetch(id)?;
    let region = AshmemRegion::from_received(file)?;
    if region.size() < size {
        return Err(ShmError::SizeMismatch {
            requested: size,
            actual: region.size(),
        });
    }
    let mut guard = registry::lock();
    if guard.find_by_id(id).is_none() {
        guard.insert(Segment::remote(id, key, region));
    }
    Ok(id)
}

/// Remove an entry, releasing the key symlink when this process owns it.
fn finalize_removal(
    guard: &mut parking_lot::MutexGuard<'static, registry::Registry>,
    index: usize,
    owned_here: bool,
) {
    let segment = guard.remove(index);
    if owned_here && segment.key() != libc::IPC_PRIVATE {
        keys::release(&keys::default_dir(), segment.key(), segment.id().to_raw());
    }
    tracing::info!(id = %segment.id(), "segment destroyed locally");
    // Dropping the segment closes the descriptor.
}

/// Drop a just-created local segment that lost a key race.
fn discard_local(id: SegmentId) {
    let mut guard = registry::lock();
    if let Some(index) = guard.index_by_id(id) {
        guard.remove(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ashmem;

    #[test]
    fn test_round_to_page() {
        let page = page_size();
        assert_eq!(round_to_page(1).unwrap(), page);
        assert_eq!(round_to_page(page).unwrap(), page);
        assert_eq!(round_to_page(page + 1).unwrap(), 2 * page);
        assert!(round_to_page(0).is_err());
        assert!(round_to_page(usize::MAX).is_err());
    }

    #[test]
    fn test_detach_unknown_address_is_noop() {
        assert!(shm_detach(0xdead_0000 as *const u8).is_ok());
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        let id = SegmentId::from_raw(0x7fff_0042).unwrap();
        assert!(shm_remove(id).is_ok());
    }

    #[test]
    fn test_stat_unknown_id_fails() {
        let id = SegmentId::from_raw(0x7ffe_0042).unwrap();
        assert!(matches!(
            shm_stat(id),
            Err(ShmError::UnknownId { .. })
        ));
    }

    #[test]
    fn test_private_segment_lifecycle() -> ShmResult<()> {
        if !ashmem::device_present() {
            return Ok(());
        }
        let id = shm_get(libc::IPC_PRIVATE, 100, ShmGetFlags::CREATE)?;
        let stat = shm_stat(id)?;
        assert_eq!(stat.size, page_size());
        assert_eq!(stat.attach_count, 1);

        let addr = shm_attach(id, AttachFlags::empty())?;
        // Repeated attach returns the cached mapping.
        assert_eq!(shm_attach(id, AttachFlags::empty())?, addr);

        // Deferred deletion: the mapping survives RMID.
        shm_remove(id)?;
        // SAFETY: the mapping is still live until detach.
        unsafe {
            addr.write(0xab);
            assert_eq!(addr.read(), 0xab);
        }
        shm_detach(addr)?;
        assert!(shm_stat(id).is_err());
        Ok(())
    }
}

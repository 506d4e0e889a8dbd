//! Process-wide segment registry
//!
//! One mutex-guarded table per process maps segment ids to local state.
//! The registry also carries the process's socket identity and the hand-off
//! listener handle, and detects `fork()` by comparing the current pid with
//! the pid that set the state up. A mismatch discards everything: the
//! child's copy of the listener thread does not exist, inherited socket
//! identities are no longer bound here, and cached entries must be
//! re-resolved.

use crate::error::{ShmError, ShmResult};
use crate::handoff;
use crate::id::{SLOT_MASK, SegmentId};
use crate::segment::Segment;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::JoinHandle;

/// Bind attempts before giving up on finding a free socket identity.
const IDENTITY_RETRIES: u32 = 1024;

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());
static SETUP_PID: AtomicI32 = AtomicI32::new(0);

/// Process-local registry state behind the global mutex.
pub(crate) struct Registry {
    segments: Vec<Segment>,
    socket_id: Option<u16>,
    listener: Option<JoinHandle<()>>,
    next_slot: u16,
}

impl Registry {
    const fn new() -> Self {
        Self {
            segments: Vec::new(),
            socket_id: None,
            listener: None,
            next_slot: 0,
        }
    }

    /// Discard all state after a detected fork.
    ///
    /// Descriptors and mappings inherited from the parent are deliberately
    /// leaked: caller code may still reference the mapped ranges, and the
    /// original descriptors remain open in the parent.
    fn reset(&mut self) {
        for segment in self.segments.drain(..) {
            segment.leak();
        }
        self.socket_id = None;
        // The thread only ever existed in the parent; dropping the handle
        // detaches it without a join.
        self.listener = None;
        self.next_slot = 0;
    }

    /// Socket identity of this process, if the listener has been started.
    pub(crate) fn socket_id(&self) -> Option<u16> {
        self.socket_id
    }

    /// Bind the hand-off socket and start the listener, once per process.
    ///
    /// Candidate identities start from the truncated pid and advance on
    /// bind collisions, under a fixed retry budget.
    pub(crate) fn ensure_listener(&mut self) -> ShmResult<u16> {
        if let Some(socket_id) = self.socket_id {
            return Ok(socket_id);
        }

        let pid = nix::unistd::getpid().as_raw();
        let mut candidate = (pid as u32 & 0xffff) as u16;
        for _ in 0..IDENTITY_RETRIES {
            if candidate == 0 {
                candidate = 1;
                continue;
            }
            match handoff::bind_listener(candidate) {
                Ok(listener) => {
                    let handle = handoff::spawn_listener(listener, candidate)?;
                    tracing::info!(
                        socket_id = format_args!("{candidate:#06x}"),
                        "hand-off listener started"
                    );
                    self.socket_id = Some(candidate);
                    self.listener = Some(handle);
                    return Ok(candidate);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                    candidate = candidate.wrapping_add(1);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ShmError::IdentityExhausted)
    }

    /// Allocate the next segment id under this process's socket identity.
    pub(crate) fn allocate_id(&mut self) -> ShmResult<SegmentId> {
        let socket_id = self.socket_id.ok_or(ShmError::IdentityExhausted)?;
        // 15-bit wrapping counter, never zero.
        self.next_slot = (self.next_slot % SLOT_MASK as u16) + 1;
        Ok(SegmentId::new(socket_id, self.next_slot))
    }

    pub(crate) fn insert(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub(crate) fn find_by_id(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id() == id)
    }

    pub(crate) fn find_by_raw(&self, raw: u32) -> Option<&Segment> {
        SegmentId::from_raw(raw).and_then(|id| self.find_by_id(id))
    }

    pub(crate) fn find_mut_by_id(&mut self, id: SegmentId) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.id() == id)
    }

    pub(crate) fn index_by_id(&self, id: SegmentId) -> Option<usize> {
        self.segments.iter().position(|s| s.id() == id)
    }

    pub(crate) fn index_by_addr(&self, addr: *const u8) -> Option<usize> {
        self.segments.iter().position(|s| s.maps_addr(addr))
    }

    pub(crate) fn segment_mut(&mut self, index: usize) -> &mut Segment {
        &mut self.segments[index]
    }

    /// Remove a registry entry; the slot is compacted out of the table and
    /// the returned segment drops its descriptor when the caller is done.
    pub(crate) fn remove(&mut self, index: usize) -> Segment {
        self.segments.swap_remove(index)
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.socket_id.is_none() && self.listener.is_none()
    }
}

/// Acquire the registry, resetting process-local state after a fork.
///
/// Every public entry point funnels through here, which makes the
/// subsystem usable across `fork()` without `pthread_atfork` hooks.
pub(crate) fn lock() -> MutexGuard<'static, Registry> {
    let pid = nix::unistd::getpid().as_raw();
    let setup = SETUP_PID.load(Ordering::Acquire);
    if setup == pid {
        return REGISTRY.lock();
    }

    if setup != 0 && REGISTRY.is_locked() {
        // fork() happened while the parent held the mutex. POSIX leaves the
        // child single-threaded, so nobody in this process can legitimately
        // hold it.
        // SAFETY: no live guard exists in the child.
        unsafe { REGISTRY.force_unlock() };
    }
    let mut guard = REGISTRY.lock();
    if SETUP_PID.swap(pid, Ordering::AcqRel) != pid {
        if setup != 0 {
            tracing::warn!(
                parent = setup,
                child = pid,
                "fork detected, discarding process-local segment state"
            );
        }
        guard.reset();
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupy_identity(guard: &mut Registry) -> u16 {
        guard.ensure_listener().expect("listener must start")
    }

    #[test]
    fn test_slot_counter_wraps_skipping_zero() {
        let mut registry = Registry::new();
        registry.socket_id = Some(0x1234);
        registry.next_slot = SLOT_MASK as u16 - 1;

        let a = registry.allocate_id().unwrap();
        let b = registry.allocate_id().unwrap();
        let c = registry.allocate_id().unwrap();
        assert_eq!(a.slot(), SLOT_MASK as u16);
        assert_eq!(b.slot(), 1);
        assert_eq!(c.slot(), 2);
    }

    #[test]
    fn test_allocate_requires_identity() {
        let mut registry = Registry::new();
        assert!(registry.allocate_id().is_err());
    }

    #[test]
    fn test_listener_starts_once() {
        let mut guard = lock();
        let first = occupy_identity(&mut guard);
        let second = occupy_identity(&mut guard);
        assert_eq!(first, second);
        assert_eq!(guard.socket_id(), Some(first));
    }

    #[test]
    fn test_fork_resets_state() {
        use nix::sys::wait::{WaitStatus, waitpid};
        use nix::unistd::{ForkResult, fork};

        {
            let mut guard = lock();
            occupy_identity(&mut guard);
        }

        // SAFETY: the child only inspects registry state and _exits.
        match unsafe { fork() }.expect("fork") {
            ForkResult::Child => {
                let code = {
                    let guard = lock();
                    if guard.is_empty() { 0 } else { 1 }
                };
                unsafe { libc::_exit(code) };
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).expect("waitpid");
                assert_eq!(status, WaitStatus::Exited(child, 0));
                // The parent's own state must survive the child's reset.
                let guard = lock();
                assert!(guard.socket_id().is_some());
            }
        }
    }
}

//! Behavior tests for the SysV emulation surface
//!
//! Everything that needs `/dev/ashmem` skips on hosts without the device so
//! the suite also passes on desktop Linux.

use shmemu::{
    AttachFlags, SegmentId, ShmError, ShmGetFlags, ShmResult, shm_attach, shm_detach, shm_get,
    shm_remove, shm_stat,
};

fn ashmem_available() -> bool {
    shmemu::ashmem::device_present()
}

/// Keys unique per test process so stale symlinks never collide.
fn test_key(salt: i32) -> libc::key_t {
    (std::process::id() as i32 & 0x00ff_ffff) | (salt << 24)
}

#[test]
fn test_unknown_address_detach_is_tolerated() -> ShmResult<()> {
    shm_detach(std::ptr::null())?;
    shm_detach(0x1000 as *const u8)?;
    Ok(())
}

#[test]
fn test_unknown_id_removal_is_tolerated() -> ShmResult<()> {
    shm_remove(SegmentId::from_raw(0x4242_0007).unwrap())
}

#[test]
fn test_unknown_id_stat_fails() {
    let err = shm_stat(SegmentId::from_raw(0x4242_0008).unwrap()).unwrap_err();
    assert!(matches!(err, ShmError::UnknownId { .. }));
    assert_eq!(err.errno(), nix::errno::Errno::EINVAL);
}

#[test]
fn test_key_without_create_fails() {
    let err = shm_get(test_key(1), 4096, ShmGetFlags::empty()).unwrap_err();
    assert!(matches!(err, ShmError::KeyNotFound { .. }));
}

#[test]
fn test_zero_size_rejected() {
    let err = shm_get(libc::IPC_PRIVATE, 0, ShmGetFlags::CREATE).unwrap_err();
    assert!(matches!(err, ShmError::InvalidSize { .. }));
}

#[test]
fn test_round_trip_and_deferred_deletion() -> ShmResult<()> {
    if !ashmem_available() {
        return Ok(());
    }
    let id = shm_get(libc::IPC_PRIVATE, 100, ShmGetFlags::CREATE)?;
    let stat = shm_stat(id)?;
    assert!(stat.size >= 100);
    assert_eq!(stat.size % shmemu::ops::page_size(), 0);

    let addr = shm_attach(id, AttachFlags::empty())?;
    shm_remove(id)?;

    // The mapping must survive RMID until the matching detach.
    // SAFETY: addr is a live mapping of at least stat.size bytes.
    unsafe {
        addr.add(stat.size - 1).write(0x5a);
        assert_eq!(addr.add(stat.size - 1).read(), 0x5a);
    }

    shm_detach(addr)?;
    assert!(shm_stat(id).is_err());
    Ok(())
}

#[test]
fn test_key_resolves_to_same_segment() -> ShmResult<()> {
    if !ashmem_available() {
        return Ok(());
    }
    let key = test_key(2);
    let first = shm_get(key, 4096, ShmGetFlags::CREATE)?;
    let second = shm_get(key, 4096, ShmGetFlags::CREATE)?;
    assert_eq!(first, second);

    let excl = shm_get(key, 4096, ShmGetFlags::CREATE | ShmGetFlags::EXCLUSIVE);
    assert!(matches!(excl, Err(ShmError::SegmentExists { .. })));

    shm_remove(first)?;
    Ok(())
}

#[test]
fn test_oversized_join_fails() -> ShmResult<()> {
    if !ashmem_available() {
        return Ok(());
    }
    let key = test_key(3);
    let id = shm_get(key, 4096, ShmGetFlags::CREATE)?;
    let err = shm_get(key, 1 << 20, ShmGetFlags::CREATE).unwrap_err();
    assert!(matches!(err, ShmError::SizeMismatch { .. }));
    shm_remove(id)?;
    Ok(())
}

#[test]
fn test_cross_process_visibility() -> ShmResult<()> {
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};

    if !ashmem_available() {
        return Ok(());
    }

    // Parent creates and maps the segment; the forked child starts from an
    // empty registry and must resolve the id through the parent's hand-off
    // listener before it can map the same pages.
    let id = shm_get(libc::IPC_PRIVATE, 4096, ShmGetFlags::CREATE)?;
    let addr = shm_attach(id, AttachFlags::empty())?;

    // SAFETY: the child only touches the emulation API and _exits.
    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            let code = (|| -> ShmResult<i32> {
                let child_addr = shm_attach(id, AttachFlags::empty())?;
                // SAFETY: child_addr maps the shared 4096-byte region.
                unsafe { child_addr.write(0xab) };
                shm_detach(child_addr)?;
                Ok(0)
            })()
            .unwrap_or(1);
            unsafe { libc::_exit(code) };
        }
        ForkResult::Parent { child } => {
            let status = waitpid(child, None).expect("waitpid");
            assert_eq!(status, WaitStatus::Exited(child, 0));
            // SAFETY: addr still maps the shared region in the parent.
            unsafe { assert_eq!(addr.read(), 0xab) };
            shm_remove(id)?;
            shm_detach(addr)?;
            Ok(())
        }
    }
}

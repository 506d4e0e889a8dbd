//! Drop-in C ABI for the SysV shared memory emulation
//!
//! Exports `shmget`, `shmat`, `shmdt` and `shmctl` with standard SysV
//! semantics so a preloaded or statically linked consumer needs no source
//! changes. Failures are reported through the platform errno, successes
//! through the usual return values. When the one-shot kernel probe (or the
//! embedding host, via [`shm_force_kernel_ipc`]) decides real SysV IPC is
//! usable, every call forwards straight to the kernel.

use nix::errno::Errno;
use shmemu::fallback;
use shmemu::{AttachFlags, SegmentId, ShmGetFlags};
use std::ffi::{c_int, c_uchar, c_void};
use std::sync::Once;

const SHM_FAILED: *mut c_void = usize::MAX as *mut c_void;

static INIT: Once = Once::new();

fn ensure_init() {
    INIT.call_once(shmemu::init_tracing);
}

fn fail(errno: Errno) -> c_int {
    errno.set();
    -1
}

/// `int shmget(key_t key, size_t size, int shmflg)`
#[unsafe(no_mangle)]
pub extern "C" fn shmget(key: libc::key_t, size: libc::size_t, shmflg: c_int) -> c_int {
    ensure_init();
    if fallback::kernel_ipc_active() {
        return fallback::kernel_shmget(key, size, shmflg);
    }
    match shmemu::shm_get(key, size, ShmGetFlags::from_bits_truncate(shmflg)) {
        Ok(id) => id.to_shmid(),
        Err(err) => fail(err.errno()),
    }
}

/// `void *shmat(int shmid, const void *shmaddr, int shmflg)`
///
/// The address hint is ignored; the kernel chooses the mapping address.
#[unsafe(no_mangle)]
pub extern "C" fn shmat(shmid: c_int, shmaddr: *const c_void, shmflg: c_int) -> *mut c_void {
    ensure_init();
    if fallback::kernel_ipc_active() {
        return fallback::kernel_shmat(shmid, shmaddr, shmflg);
    }
    let id = match SegmentId::from_shmid(shmid) {
        Ok(id) => id,
        Err(err) => {
            err.errno().set();
            return SHM_FAILED;
        }
    };
    match shmemu::shm_attach(id, AttachFlags::from_bits_truncate(shmflg)) {
        Ok(addr) => addr.cast(),
        Err(err) => {
            err.errno().set();
            SHM_FAILED
        }
    }
}

/// `int shmdt(const void *shmaddr)`
#[unsafe(no_mangle)]
pub extern "C" fn shmdt(shmaddr: *const c_void) -> c_int {
    ensure_init();
    if fallback::kernel_ipc_active() {
        return fallback::kernel_shmdt(shmaddr);
    }
    match shmemu::shm_detach(shmaddr.cast()) {
        Ok(()) => 0,
        Err(err) => fail(err.errno()),
    }
}

/// `int shmctl(int shmid, int cmd, struct shmid_ds *buf)`
///
/// Only `IPC_RMID` and `IPC_STAT` are implemented; any other command fails
/// with `EINVAL`.
#[unsafe(no_mangle)]
pub extern "C" fn shmctl(shmid: c_int, cmd: c_int, buf: *mut libc::shmid_ds) -> c_int {
    ensure_init();
    if fallback::kernel_ipc_active() {
        return fallback::kernel_shmctl(shmid, cmd, buf);
    }
    match cmd {
        libc::IPC_RMID => {
            // Deletion of an id this process cannot decode is the same
            // no-op success as deletion of an unknown id.
            let Ok(id) = SegmentId::from_shmid(shmid) else {
                return 0;
            };
            match shmemu::shm_remove(id) {
                Ok(()) => 0,
                Err(err) => fail(err.errno()),
            }
        }
        libc::IPC_STAT => {
            if buf.is_null() {
                return fail(Errno::EFAULT);
            }
            let id = match SegmentId::from_shmid(shmid) {
                Ok(id) => id,
                Err(err) => return fail(err.errno()),
            };
            match shmemu::shm_stat(id) {
                Ok(stat) => {
                    // SAFETY: buf was checked non-null and the caller owns
                    // the pointed-at shmid_ds.
                    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
                    ds.shm_segsz = stat.size as _;
                    ds.shm_nattch = stat.attach_count as _;
                    ds.shm_perm.mode = stat.mode as _;
                    ds.shm_perm.uid = stat.uid;
                    ds.shm_perm.gid = stat.gid;
                    ds.shm_perm.cuid = stat.uid;
                    ds.shm_perm.cgid = stat.gid;
                    unsafe { buf.write(ds) };
                    0
                }
                Err(err) => fail(err.errno()),
            }
        }
        other => fail(shmemu::ShmError::UnsupportedCommand { cmd: other }.errno()),
    }
}

/// Force the kernel SysV path on (non-zero) or off, bypassing the probe.
#[unsafe(no_mangle)]
pub extern "C" fn shm_force_kernel_ipc(enable: c_uchar) {
    fallback::force_kernel_ipc(enable != 0);
}

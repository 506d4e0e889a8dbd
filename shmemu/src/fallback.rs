//! Kernel SysV fallback path
//!
//! Under process-emulation layers such as proot the real SysV IPC syscalls
//! can be usable even on Android. A one-shot startup probe decides whether
//! the whole emulation should be bypassed and every call forwarded to the
//! kernel; the decision is latched for the remaining process lifetime. An
//! embedding host that knows real SysV IPC works can force the kernel path
//! without the probe.

use std::ffi::{c_int, c_void};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

static PROBED: OnceLock<bool> = OnceLock::new();
static FORCED: AtomicBool = AtomicBool::new(false);

/// Force every call onto the kernel SysV path, skipping the probe.
pub fn force_kernel_ipc(enable: bool) {
    FORCED.store(enable, Ordering::Release);
}

/// Whether calls bypass the emulation and go straight to the kernel.
pub fn kernel_ipc_active() -> bool {
    if FORCED.load(Ordering::Acquire) {
        return true;
    }
    *PROBED.get_or_init(|| {
        if !traced_by_emulator() {
            return false;
        }
        let usable = probe_kernel_sysv();
        tracing::info!(usable, "emulation layer detected, probed kernel SysV IPC");
        usable
    })
}

/// Tracer executable basenames that identify a process-emulation layer.
const EMULATOR_BASENAMES: &[&str] = &["proot"];

fn traced_by_emulator() -> bool {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return false;
    };
    let Some(tracer) = tracer_pid(&status) else {
        return false;
    };
    let Some(name) = tracer_basename(tracer) else {
        return false;
    };
    EMULATOR_BASENAMES
        .iter()
        .any(|known| name == *known || name.starts_with(&format!("{known}-")))
}

/// Extract the `TracerPid` field from `/proc/self/status` text.
fn tracer_pid(status: &str) -> Option<i32> {
    let line = status.lines().find(|l| l.starts_with("TracerPid:"))?;
    let pid: i32 = line.split_whitespace().nth(1)?.parse().ok()?;
    (pid > 0).then_some(pid)
}

/// Basename of the tracer's executable, falling back to its comm name.
fn tracer_basename(pid: i32) -> Option<String> {
    if let Ok(exe) = std::fs::read_link(format!("/proc/{pid}/exe")) {
        if let Some(name) = exe.file_name().and_then(|n| n.to_str()) {
            return Some(name.to_string());
        }
    }
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|comm| comm.trim().to_string())
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64"))]
mod sys {
    use super::*;
    use nix::errno::Errno;

    /// One trial allocation tells whether the kernel implements SysV shm.
    pub(super) fn probe_kernel_sysv() -> bool {
        let page = crate::ops::page_size();
        // SAFETY: raw syscall with valid arguments; the trial segment is
        // removed immediately on success.
        let id = unsafe {
            libc::syscall(
                libc::SYS_shmget,
                libc::IPC_PRIVATE,
                page,
                libc::IPC_CREAT | 0o600,
            )
        };
        if id < 0 {
            return Errno::last() != Errno::ENOSYS;
        }
        // SAFETY: removing the segment we just created.
        unsafe {
            libc::syscall(libc::SYS_shmctl, id as c_int, libc::IPC_RMID, 0usize);
        }
        true
    }

    pub(super) fn shmget(key: libc::key_t, size: libc::size_t, shmflg: c_int) -> c_int {
        // SAFETY: argument-for-argument forwarding of the libc call.
        unsafe { libc::syscall(libc::SYS_shmget, key, size, shmflg) as c_int }
    }

    pub(super) fn shmat(shmid: c_int, shmaddr: *const c_void, shmflg: c_int) -> *mut c_void {
        // SAFETY: argument-for-argument forwarding of the libc call.
        unsafe { libc::syscall(libc::SYS_shmat, shmid, shmaddr, shmflg) as *mut c_void }
    }

    pub(super) fn shmdt(shmaddr: *const c_void) -> c_int {
        // SAFETY: argument-for-argument forwarding of the libc call.
        unsafe { libc::syscall(libc::SYS_shmdt, shmaddr) as c_int }
    }

    pub(super) fn shmctl(shmid: c_int, cmd: c_int, buf: *mut libc::shmid_ds) -> c_int {
        // SAFETY: argument-for-argument forwarding of the libc call.
        unsafe { libc::syscall(libc::SYS_shmctl, shmid, cmd, buf) as c_int }
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
mod sys {
    use super::*;
    use nix::errno::Errno;

    // Architectures multiplexing SysV IPC through ipc(2) have no direct
    // shm syscall numbers; the emulation is always used there.
    pub(super) fn probe_kernel_sysv() -> bool {
        false
    }

    pub(super) fn shmget(_key: libc::key_t, _size: libc::size_t, _shmflg: c_int) -> c_int {
        Errno::ENOSYS.set();
        -1
    }

    pub(super) fn shmat(_shmid: c_int, _shmaddr: *const c_void, _shmflg: c_int) -> *mut c_void {
        Errno::ENOSYS.set();
        usize::MAX as *mut c_void
    }

    pub(super) fn shmdt(_shmaddr: *const c_void) -> c_int {
        Errno::ENOSYS.set();
        -1
    }

    pub(super) fn shmctl(_shmid: c_int, _cmd: c_int, _buf: *mut libc::shmid_ds) -> c_int {
        Errno::ENOSYS.set();
        -1
    }
}

use sys::probe_kernel_sysv;

/// Forward `shmget` to the kernel.
pub fn kernel_shmget(key: libc::key_t, size: libc::size_t, shmflg: c_int) -> c_int {
    sys::shmget(key, size, shmflg)
}

/// Forward `shmat` to the kernel.
pub fn kernel_shmat(shmid: c_int, shmaddr: *const c_void, shmflg: c_int) -> *mut c_void {
    sys::shmat(shmid, shmaddr, shmflg)
}

/// Forward `shmdt` to the kernel.
pub fn kernel_shmdt(shmaddr: *const c_void) -> c_int {
    sys::shmdt(shmaddr)
}

/// Forward `shmctl` to the kernel.
pub fn kernel_shmctl(shmid: c_int, cmd: c_int, buf: *mut libc::shmid_ds) -> c_int {
    sys::shmctl(shmid, cmd, buf)
}

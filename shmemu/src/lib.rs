//! # System V Shared Memory Emulation
//!
//! Android's libc exposes no SysV shared-memory syscalls, yet ported Unix
//! programs (most prominently X display servers) expect `shmget`/`shmat`/
//! `shmdt`/`shmctl` to share pixel buffers between unrelated processes.
//! This crate rebuilds that API on top of two Android-native mechanisms:
//!
//! - **ashmem regions** — anonymous, fd-backed memory objects created
//!   through `/dev/ashmem`,
//! - **descriptor hand-off** — `SCM_RIGHTS` transfer of an open descriptor
//!   over an abstract-namespace `AF_UNIX` socket, so a process that never
//!   shared an ancestor with the creator can map the same physical pages.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────┐  shm_get / shm_attach   ┌────────────────┐
//! │ Process A      │                         │ Process B      │
//! │ (creator)      │                         │ (joiner)       │
//! │                │                         │                │
//! │ registry ──┐   │   id over AF_UNIX       │   ┌── registry │
//! │ listener ◄─┼───┼─────────────────────────┼───┤            │
//! │            │   │   key + SCM_RIGHTS fd   │   │            │
//! │ ashmem fd ─┴───┼────────────────────────►┼───┴─ dup fd    │
//! └────────────────┘                         └────────────────┘
//!          │                                          │
//!          └──────────── same physical pages ─────────┘
//! ```
//!
//! Segment ids embed the creating process's 16-bit socket identity, so any
//! process can derive which listener to contact from the id alone. SysV
//! keys are arbitrated through atomic symlink creation in a shared
//! directory; the link target is the decimal id of the owning segment.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shmemu::{AttachFlags, ShmGetFlags, shm_attach, shm_detach, shm_get};
//!
//! # fn main() -> shmemu::ShmResult<()> {
//! let id = shm_get(libc::IPC_PRIVATE, 4096, ShmGetFlags::CREATE)?;
//! let addr = shm_attach(id, AttachFlags::empty())?;
//! // SAFETY: addr points at a live page-sized mapping.
//! unsafe { addr.write(0xab) };
//! shm_detach(addr)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Semantics and Divergences
//!
//! - Repeated `shm_attach` in one process returns the existing mapping
//!   address instead of creating a second mapping.
//! - `IPC_RMID` is deferred while mapped and only affects the resident
//!   process's view; destruction is not distributed.
//! - `shm_detach` on an unknown address and `IPC_RMID` on an unknown id
//!   are silent successes; `shm_attach`/`IPC_STAT` on unknown ids fail.
//! - After `fork()` the child starts from an empty registry; inherited
//!   mappings stay mapped but are no longer tracked.
//!
//! ## Thread Safety
//!
//! All operations are safe to call from multiple threads; a single
//! process-wide mutex guards the registry. Socket I/O for remote
//! resolution happens outside the lock.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod ashmem;
pub mod error;
pub mod fallback;
mod handoff;
pub mod id;
mod keys;
pub mod mapping;
pub mod ops;
mod registry;
pub mod segment;

pub use error::{ShmError, ShmResult};
pub use id::SegmentId;
pub use ops::{
    AttachFlags, SegmentStat, ShmGetFlags, shm_attach, shm_detach, shm_get, shm_remove, shm_stat,
};

/// Initialize tracing from the environment (`RUST_LOG`).
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

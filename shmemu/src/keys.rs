//! Key-ownership arbitration
//!
//! A SysV key maps to at most one segment system-wide. Ownership of a key
//! is decided by whoever creates the well-known symlink first; `symlink()`
//! atomicity is the only locking involved. The link target is the decimal
//! string of the owning segment id, so any process can resolve a key to an
//! id and then to the owner's hand-off listener.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

/// Shared directory holding the key symlinks.
pub(crate) fn default_dir() -> PathBuf {
    std::env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn link_path(dir: &Path, key: libc::key_t) -> PathBuf {
    dir.join(format!("sysv-shm-key-{key}"))
}

/// Resolve a key to the raw id recorded by its current owner.
pub(crate) fn read_owner(dir: &Path, key: libc::key_t) -> Option<u32> {
    let target = fs::read_link(link_path(dir, key)).ok()?;
    target.to_str()?.parse().ok()
}

/// Try to become the owner of `key` with segment `raw_id`.
///
/// Returns `false` when another process won the race; any other failure is
/// a real filesystem error.
pub(crate) fn claim(dir: &Path, key: libc::key_t, raw_id: u32) -> io::Result<bool> {
    match symlink(raw_id.to_string(), link_path(dir, key)) {
        Ok(()) => {
            tracing::debug!(key, id = format_args!("{raw_id:#010x}"), "claimed key ownership");
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

/// Drop the ownership record, but only if it still points at `raw_id`.
///
/// Also used to evict a link whose recorded owner turned out to be
/// unreachable, clearing the way for a fresh claim.
pub(crate) fn release(dir: &Path, key: libc::key_t, raw_id: u32) {
    if read_owner(dir, key) == Some(raw_id) {
        if let Err(err) = fs::remove_file(link_path(dir, key)) {
            tracing::warn!(key, %err, "failed to remove key symlink");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_then_read() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(claim(dir.path(), 42, 0x0001_0001)?);
        assert_eq!(read_owner(dir.path(), 42), Some(0x0001_0001));
        Ok(())
    }

    #[test]
    fn test_second_claim_loses() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(claim(dir.path(), 7, 0x0001_0001)?);
        assert!(!claim(dir.path(), 7, 0x0002_0001)?);
        assert_eq!(read_owner(dir.path(), 7), Some(0x0001_0001));
        Ok(())
    }

    #[test]
    fn test_release_only_own_link() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(claim(dir.path(), 7, 0x0001_0001)?);
        release(dir.path(), 7, 0x0002_0001);
        assert_eq!(read_owner(dir.path(), 7), Some(0x0001_0001));
        release(dir.path(), 7, 0x0001_0001);
        assert_eq!(read_owner(dir.path(), 7), None);
        Ok(())
    }

    #[test]
    fn test_unknown_key_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_owner(dir.path(), 9999), None);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let winners: Vec<bool> = std::thread::scope(|scope| {
            (0..8u32)
                .map(|i| {
                    let dir = dir.path();
                    scope.spawn(move || claim(dir, 123, 0x0001_0000 + i + 1).unwrap())
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });
        assert_eq!(winners.iter().filter(|&&won| won).count(), 1);
    }
}

//! Error types for the shared memory emulation

use nix::errno::Errno;
use thiserror::Error;

/// Errors that can occur during emulated shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// The ashmem device could not be opened
    #[error("ashmem device unavailable: {source}")]
    DeviceUnavailable {
        /// Errno from opening /dev/ashmem
        source: Errno,
    },

    /// Region creation ioctl failed
    #[error("failed to set up ashmem region '{name}': {source}")]
    RegionSetup {
        /// Diagnostic region name
        name: String,
        /// Errno from the failing ioctl
        source: Errno,
    },

    /// Could not reach the hand-off listener of the owning process
    #[error("hand-off listener {socket_id:#06x} unreachable: {source}")]
    HandoffConnect {
        /// Socket identity embedded in the segment id
        socket_id: u16,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// The owning process did not recognize the requested segment id
    #[error("hand-off for segment {id:#010x} rejected by owner")]
    HandoffRejected {
        /// Raw segment id that was requested
        id: u32,
    },

    /// Key ownership could not be arbitrated within the retry budget
    #[error("key {key} still contended after retry budget exhausted")]
    KeyContention {
        /// SysV key under arbitration
        key: libc::key_t,
    },

    /// Key lookup without IPC_CREAT found no live owner
    #[error("no segment exists for key {key}")]
    KeyNotFound {
        /// SysV key that was looked up
        key: libc::key_t,
    },

    /// IPC_CREAT|IPC_EXCL requested for a key that already has a segment
    #[error("segment already exists for key {key}")]
    SegmentExists {
        /// SysV key that was requested exclusively
        key: libc::key_t,
    },

    /// Invalid segment size
    #[error("invalid segment size: {size} bytes")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// Existing segment is smaller than the requested size
    #[error("segment holds {actual} bytes, {requested} requested")]
    SizeMismatch {
        /// Size the caller asked for
        requested: usize,
        /// Page-rounded size of the existing segment
        actual: usize,
    },

    /// mmap of a segment descriptor failed
    #[error("memory mapping failed: {source}")]
    MappingFailed {
        /// Errno from mmap
        source: Errno,
    },

    /// Operation on a segment id not known to this process
    #[error("unknown segment id {id:#010x}")]
    UnknownId {
        /// Raw segment id
        id: u32,
    },

    /// All candidate socket identities were already bound
    #[error("socket identity space exhausted")]
    IdentityExhausted,

    /// shmctl command outside the implemented subset
    #[error("unsupported control command {cmd}")]
    UnsupportedCommand {
        /// Raw command word
        cmd: i32,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("system call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

impl ShmError {
    /// The errno value reported through the C ABI for this error.
    pub fn errno(&self) -> Errno {
        match self {
            ShmError::DeviceUnavailable { source } => *source,
            ShmError::RegionSetup { source, .. } => *source,
            ShmError::HandoffConnect { source, .. } => io_errno(source),
            ShmError::HandoffRejected { .. } => Errno::EINVAL,
            ShmError::KeyContention { .. } => Errno::ENOMEM,
            ShmError::KeyNotFound { .. } => Errno::ENOENT,
            ShmError::SegmentExists { .. } => Errno::EEXIST,
            ShmError::InvalidSize { .. } => Errno::EINVAL,
            ShmError::SizeMismatch { .. } => Errno::EINVAL,
            ShmError::MappingFailed { source } => *source,
            ShmError::UnknownId { .. } => Errno::EINVAL,
            ShmError::IdentityExhausted => Errno::ENOMEM,
            ShmError::UnsupportedCommand { .. } => Errno::EINVAL,
            ShmError::Io { source } => io_errno(source),
            ShmError::Nix { source } => *source,
        }
    }
}

fn io_errno(err: &std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

/// Result type for emulated shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(ShmError::UnknownId { id: 7 }.errno(), Errno::EINVAL);
        assert_eq!(ShmError::KeyNotFound { key: 42 }.errno(), Errno::ENOENT);
        assert_eq!(ShmError::SegmentExists { key: 42 }.errno(), Errno::EEXIST);
        assert_eq!(ShmError::IdentityExhausted.errno(), Errno::ENOMEM);
    }

    #[test]
    fn test_io_errno_passthrough() {
        let err = ShmError::Io {
            source: std::io::Error::from_raw_os_error(libc::ECONNREFUSED),
        };
        assert_eq!(err.errno(), Errno::ECONNREFUSED);
    }

    #[test]
    fn test_io_errno_without_raw_value() {
        let err = ShmError::Io {
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read"),
        };
        assert_eq!(err.errno(), Errno::EIO);
    }
}

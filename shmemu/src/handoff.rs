//! Descriptor hand-off protocol
//!
//! A process that created a segment serves its descriptor to any process
//! that knows the segment id. The wire exchange is a single request and
//! response over an abstract-namespace `AF_UNIX` stream socket:
//!
//! 1. client sends the 4-byte segment id,
//! 2. server answers with the `key_t` bytes followed by one dummy byte
//!    carrying the descriptor as `SCM_RIGHTS` ancillary data,
//! 3. both sides close.
//!
//! An id the server does not recognize closes the connection without a
//! response; the client surfaces that as a rejected hand-off. There is no
//! pipelining, no timeout and no authentication beyond knowing the id.

use crate::error::{ShmError, ShmResult};
use crate::id::SegmentId;
use crate::registry;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg,
};
use std::fs::File;
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::thread;

const KEY_BYTES: usize = size_of::<libc::key_t>();

/// Well-known abstract socket name for a process's listener.
fn socket_name(socket_id: u16) -> String {
    format!("sysv-shm-{socket_id:04x}")
}

fn listener_addr(socket_id: u16) -> std::io::Result<SocketAddr> {
    SocketAddr::from_abstract_name(socket_name(socket_id))
}

/// Bind the hand-off listener for one candidate socket identity.
///
/// `AddrInUse` means another process already claimed the identity and the
/// caller should retry with the next candidate.
pub(crate) fn bind_listener(socket_id: u16) -> std::io::Result<UnixListener> {
    UnixListener::bind_addr(&listener_addr(socket_id)?)
}

/// Start the detached accept loop for a bound listener.
///
/// The thread runs for the remaining life of the process and is never
/// joined; a fork invalidates it together with the rest of the registry
/// state.
pub(crate) fn spawn_listener(
    listener: UnixListener,
    socket_id: u16,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("shm-handoff-{socket_id:04x}"))
        .spawn(move || serve(listener))
}

fn serve(listener: UnixListener) {
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                if let Err(err) = serve_one(stream) {
                    tracing::debug!(%err, "hand-off request failed");
                }
            }
            Err(err) => tracing::warn!(%err, "hand-off accept failed"),
        }
    }
}

fn serve_one(mut stream: UnixStream) -> ShmResult<()> {
    let mut raw = [0u8; 4];
    stream.read_exact(&mut raw)?;
    let raw = u32::from_ne_bytes(raw);

    // The registry mutex is held for the remainder of this request so the
    // descriptor cannot be closed between lookup and send.
    let guard = registry::lock();
    let Some(segment) = guard.find_by_raw(raw) else {
        tracing::trace!(id = format_args!("{raw:#010x}"), "hand-off for unknown id");
        return Ok(());
    };
    tracing::debug!(id = %segment.id(), "serving descriptor hand-off");
    stream.write_all(&segment.key().to_ne_bytes())?;
    send_fd(&stream, segment.region().file().as_raw_fd())
}

/// Resolve a foreign segment id to its key and a duplicate descriptor.
pub(crate) fn fetch(id: SegmentId) -> ShmResult<(libc::key_t, File)> {
    let addr = listener_addr(id.socket_id()).map_err(|source| ShmError::HandoffConnect {
        socket_id: id.socket_id(),
        source,
    })?;
    let mut stream =
        UnixStream::connect_addr(&addr).map_err(|source| ShmError::HandoffConnect {
            socket_id: id.socket_id(),
            source,
        })?;
    stream.write_all(&id.to_raw().to_ne_bytes())?;

    let mut key = [0u8; KEY_BYTES];
    stream
        .read_exact(&mut key)
        .map_err(|_| ShmError::HandoffRejected { id: id.to_raw() })?;
    let file = recv_fd(&stream)?.ok_or(ShmError::HandoffRejected { id: id.to_raw() })?;
    tracing::debug!(%id, fd = file.as_raw_fd(), "received segment descriptor");
    Ok((libc::key_t::from_ne_bytes(key), file))
}

/// Send one descriptor as `SCM_RIGHTS` ancillary data on a dummy byte.
pub(crate) fn send_fd(stream: &UnixStream, fd: RawFd) -> ShmResult<()> {
    let iov = [IoSlice::new(&[0u8])];
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    sendmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )?;
    Ok(())
}

/// Receive one descriptor from `SCM_RIGHTS` ancillary data.
///
/// Returns `None` when the peer closed without attaching a descriptor.
pub(crate) fn recv_fd(stream: &UnixStream) -> ShmResult<Option<File>> {
    let mut dummy = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut dummy)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )?;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                // SAFETY: the kernel installed a fresh descriptor for us.
                return Ok(Some(unsafe { File::from_raw_fd(fd) }));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_fd_transfer_over_socketpair() -> ShmResult<()> {
        let (left, right) = UnixStream::pair()?;

        let mut backing = tempfile::tempfile()?;
        backing.write_all(b"handoff payload")?;
        backing.flush()?;

        send_fd(&left, backing.as_raw_fd())?;
        let mut received = recv_fd(&right)?.expect("descriptor expected");

        // The duplicate shares file offset and contents with the original.
        received.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        received.read_to_string(&mut contents)?;
        assert_eq!(contents, "handoff payload");
        Ok(())
    }

    #[test]
    fn test_recv_without_descriptor() -> ShmResult<()> {
        let (mut left, right) = UnixStream::pair()?;
        left.write_all(&[0u8])?;
        assert!(recv_fd(&right)?.is_none());
        Ok(())
    }

    #[test]
    fn test_socket_name_template() {
        assert_eq!(socket_name(0x00ff), "sysv-shm-00ff");
        assert_eq!(socket_name(0xbeef), "sysv-shm-beef");
    }

    #[test]
    fn test_bind_collision_reports_addr_in_use() -> ShmResult<()> {
        // Pick an identity far away from pid-derived candidates.
        let first = bind_listener(0xfffe)?;
        let second = bind_listener(0xfffe);
        assert_eq!(
            second.unwrap_err().kind(),
            std::io::ErrorKind::AddrInUse
        );
        drop(first);
        Ok(())
    }
}

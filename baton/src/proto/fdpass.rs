//! Descriptor transfer over unix stream sockets via `SCM_RIGHTS`.
//!
//! Each message carries one descriptor in a single rights record, with the
//! descriptor's display name as the message body. Duplication goes through
//! `fcntl(F_DUPFD_CLOEXEC)` so the source descriptor's flags, including its
//! blocking mode, are left untouched.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags,
};

use super::ProtocolError;

/// Limit on the name transmitted alongside a descriptor.
pub(crate) const MAX_NAME_LEN: usize = 4096;

/// Sends `fd` and its display name as one message on `socket`.
///
/// # Errors
///
/// Returns [`ProtocolError::NameTooLong`] if `name` is 4096 bytes or more,
/// or the underlying `sendmsg` error.
pub(crate) fn send_fd<S: AsFd>(
    socket: &S,
    fd: BorrowedFd<'_>,
    name: &str,
) -> Result<(), ProtocolError> {
    if name.len() >= MAX_NAME_LEN {
        return Err(ProtocolError::NameTooLong(name.len()));
    }

    let mut space = [0u8; rustix::cmsg_space!(ScmRights(1))];
    let mut control = SendAncillaryBuffer::new(&mut space);
    let fds = [fd];
    let pushed = control.push(SendAncillaryMessage::ScmRights(&fds));
    debug_assert!(pushed, "control buffer sized for one descriptor");

    sendmsg(
        socket,
        &[IoSlice::new(name.as_bytes())],
        &mut control,
        SendFlags::empty(),
    )
    .map_err(io::Error::from)?;
    Ok(())
}

/// Receives one descriptor and its display name from `socket`.
///
/// The received descriptor has close-on-exec set.
///
/// # Errors
///
/// Returns a protocol error if the message carries anything other than
/// exactly one descriptor, or if the name is truncated or over-long.
pub(crate) fn recv_fd<S: AsFd>(socket: &S) -> Result<(OwnedFd, String), ProtocolError> {
    let mut name_buf = [0u8; MAX_NAME_LEN];
    let mut space = [0u8; rustix::cmsg_space!(ScmRights(1))];
    let mut control = RecvAncillaryBuffer::new(&mut space);

    let msg = recvmsg(
        socket,
        &mut [IoSliceMut::new(&mut name_buf)],
        &mut control,
        RecvFlags::CMSG_CLOEXEC,
    )
    .map_err(io::Error::from)?;

    if msg.bytes == 0 {
        return Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "socket closed while receiving a descriptor",
        )));
    }
    if msg.bytes >= MAX_NAME_LEN {
        return Err(ProtocolError::NameTooLong(msg.bytes));
    }

    let mut fds: Vec<OwnedFd> = Vec::with_capacity(1);
    for message in control.drain() {
        if let RecvAncillaryMessage::ScmRights(received) = message {
            fds.extend(received);
        }
    }
    if fds.len() != 1 {
        return Err(ProtocolError::AncillaryCount(fds.len()));
    }
    let fd = fds.remove(0);
    let name = String::from_utf8_lossy(&name_buf[..msg.bytes]).into_owned();
    Ok((fd, name))
}

/// Duplicates a descriptor with close-on-exec set.
///
/// Operates through the fcntl duplication path only: the source keeps its
/// open-file-description flags, so a non-blocking socket stays non-blocking.
pub(crate) fn dup_cloexec<F: AsFd>(fd: F) -> io::Result<OwnedFd> {
    rustix::io::fcntl_dupfd_cloexec(fd, 0).map_err(io::Error::from)
}

//! Sender side of a handoff: serving the catalog to the process taking
//! over.
//!
//! The exchange is bounded by the upgrade timeout. A watcher shuts the
//! peer socket down when the timeout fires, so a peer that connects and
//! then stalls cannot wedge the accept loop; the sender then reports
//! [`Error::HandoffTimeout`] and remains owner.

use std::io::Read;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Error;
use crate::fds::{FdMeta, PassedFd};
use crate::proto::{self, fdpass, frame, Message, ProtocolError, VersionInfo};
use crate::sync::SocketDeadline;

/// Serves one handoff on an accepted connection: metadata frame, one
/// descriptor per entry in frame order, then the peer's ready exchange.
///
/// # Errors
///
/// [`Error::HandoffTimeout`] if the peer does not complete the exchange
/// within `timeout`; protocol or socket errors on a misbehaving peer. On
/// any error the caller stays owner.
pub(crate) fn serve_handoff(
    conn: &UnixStream,
    entries: &[PassedFd],
    timeout: Duration,
) -> Result<(), Error> {
    let guard = SocketDeadline::arm(conn, Instant::now() + timeout)?;
    match drive(conn, entries) {
        Err(_) if guard.fired() => Err(Error::HandoffTimeout),
        other => other,
    }
}

fn drive(conn: &UnixStream, entries: &[PassedFd]) -> Result<(), Error> {
    let metas: Vec<&FdMeta> = entries.iter().map(|e| &e.meta).collect();
    frame::write_versioned_json(&mut &*conn, &metas, proto::PROTO_VERSION)?;
    for entry in entries {
        debug!(name = %entry.name, "passing descriptor");
        fdpass::send_fd(conn, entry.fd.as_fd(), &entry.name)?;
    }

    await_ready(conn)
}

/// Waits for the peer's ready signal, speaking whichever handshake the
/// peer opens with.
fn await_ready(conn: &UnixStream) -> Result<(), Error> {
    let mut opener = [0u8; 1];
    (&*conn).read_exact(&mut opener)?;
    match opener[0] {
        proto::V0_NOTIFY_READY => {
            debug!("peer signalled ready with the v0 byte");
            Ok(())
        }
        proto::V1_START_READY_HANDSHAKE => {
            let (info, _): (VersionInfo, u32) = frame::read_versioned_json(&mut &*conn)?;
            if info.version != proto::PROTO_VERSION {
                return Err(ProtocolError::UnsupportedVersion(info.version).into());
            }
            let ack = Message {
                msg: proto::V1_MSG_STEPPING_DOWN.to_string(),
            };
            if let Err(e) =
                frame::write_versioned_json(&mut &*conn, &ack, proto::PROTO_VERSION)
            {
                // The peer may or may not have seen the ack. Assume it did
                // and step down: the failure mode is zero owners, which is
                // recoverable, while staying owner risks two.
                warn!(error = %e, "failed to send stepping-down ack; stepping down anyway");
            }
            debug!("peer completed the v1 ready handshake");
            Ok(())
        }
        byte => Err(ProtocolError::UnexpectedReadyByte(byte).into()),
    }
}

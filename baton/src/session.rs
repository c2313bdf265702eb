//! Receiver side of a handoff: the session a new process opens against the
//! current owner.
//!
//! The session holds the coordination lock from `connect` until `close`, so
//! exactly one takeover attempt is in flight per directory. Receiving runs
//! over blocking socket I/O; a deadline watcher shuts the socket down if
//! construction is cancelled, and errors produced that way are rewrapped so
//! the caller sees the deadline, not the secondary socket failure.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::fds::{FdEntry, FdMeta, NamedFd};
use crate::proto::{self, fdpass, frame, Message, ProtocolError, VersionInfo};
use crate::sync::SocketDeadline;

/// A takeover attempt against the current owner, if any.
pub(crate) struct UpgradeSession {
    conn: Option<UnixStream>,
    coordinator: Arc<Coordinator>,
    owner_version: u32,
}

impl UpgradeSession {
    /// Acquires the coordination lock and dials the current owner.
    ///
    /// A session without an owner connection means this process may claim
    /// ownership once its caller signals ready.
    ///
    /// # Errors
    ///
    /// Returns lock or dial errors; the lock is released on failure.
    pub(crate) fn connect(
        coordinator: Arc<Coordinator>,
        deadline: Option<Instant>,
    ) -> Result<Self, Error> {
        coordinator.lock(deadline)?;
        match coordinator.connect_owner() {
            Ok(conn) => Ok(Self {
                conn,
                coordinator,
                owner_version: 0,
            }),
            Err(e) => {
                coordinator.unlock();
                Err(e)
            }
        }
    }

    pub(crate) fn has_owner(&self) -> bool {
        self.conn.is_some()
    }

    /// Receives the owner's catalog: one metadata frame, then one
    /// descriptor per entry in metadata order.
    ///
    /// Records the owner's protocol version for the later ready handshake.
    /// Returns an empty catalog when there is no owner.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeadlineExceeded`] if `deadline` fires mid-read,
    /// protocol errors otherwise.
    pub(crate) fn get_files(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<HashMap<String, FdEntry>, Error> {
        let Some(conn) = self.conn.as_ref() else {
            debug!("no owner; starting with an empty catalog");
            return Ok(HashMap::new());
        };

        let guard = match deadline {
            Some(deadline) => Some(SocketDeadline::arm(conn, deadline)?),
            None => None,
        };
        match receive_files(conn) {
            Ok((version, files)) => {
                self.owner_version = version;
                info!(
                    inherited = files.len(),
                    owner_version = version,
                    "received catalog from current owner"
                );
                Ok(files)
            }
            Err(e) if guard.as_ref().is_some_and(SocketDeadline::fired) => {
                Err(Error::deadline_with("receiving inherited descriptors", e))
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the ready handshake appropriate for the owner's version and
    /// closes the connection.
    ///
    /// v0 owners get the single ready byte. v1 owners get the handshake
    /// opener plus a version frame, and must answer "stepping down" before
    /// this process may claim ownership.
    ///
    /// # Errors
    ///
    /// Protocol or socket errors; on error the caller must not take
    /// ownership.
    pub(crate) fn ready_handshake(&mut self) -> Result<(), Error> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };

        if self.owner_version == 0 {
            debug!("owner speaks v0; sending bare ready byte");
            (&conn).write_all(&[proto::V0_NOTIFY_READY])?;
            return Ok(());
        }

        (&conn).write_all(&[proto::V1_START_READY_HANDSHAKE])?;
        frame::write_versioned_json(
            &mut &conn,
            &VersionInfo {
                version: proto::PROTO_VERSION,
            },
            proto::PROTO_VERSION,
        )?;

        let (ack, _): (Message, u32) = frame::read_versioned_json(&mut &conn)?;
        if ack.msg != proto::V1_MSG_STEPPING_DOWN {
            return Err(ProtocolError::UnexpectedMessage(ack.msg).into());
        }
        debug!("owner acknowledged it is stepping down");
        Ok(())
    }

    /// Writes this process's id into the owner-id file.
    ///
    /// # Errors
    ///
    /// Returns the write error.
    pub(crate) fn become_owner(&self) -> Result<(), Error> {
        self.coordinator.become_owner().map_err(Error::Io)
    }

    /// Closes the owner connection, if any, and releases the coordination
    /// lock. Idempotent.
    pub(crate) fn close(&mut self) {
        if self.conn.take().is_some() {
            debug!("closed owner connection");
        }
        self.coordinator.unlock();
    }
}

impl Drop for UpgradeSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_files(conn: &UnixStream) -> Result<(u32, HashMap<String, FdEntry>), Error> {
    let (metas, version): (Vec<FdMeta>, u32) = frame::read_versioned_json(&mut &*conn)?;
    let mut files = HashMap::with_capacity(metas.len());
    for meta in metas {
        let (fd, name) = fdpass::recv_fd(conn)?;
        debug!(id = %meta.id, name = %name, "received descriptor");
        files.insert(meta.id.clone(), FdEntry::new(meta, NamedFd { fd, name }));
    }
    Ok((version, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use std::net::TcpListener;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixListener;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    fn coordinator(dir: &Path, id: &str) -> Arc<Coordinator> {
        Arc::new(Coordinator::new(dir.to_path_buf(), id.to_string()))
    }

    #[test]
    fn no_owner_yields_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = UpgradeSession::connect(coordinator(dir.path(), "1"), None).unwrap();
        assert!(!session.has_owner());
        assert!(session.get_files(None).unwrap().is_empty());
        session.become_owner().unwrap();
        session.close();
    }

    /// An owner that predates protocol versioning: unversioned metadata
    /// frame, descriptors, then a blocking read for the single ready byte.
    fn spawn_v0_owner(
        dir: &Path,
        id: &str,
        passed: TcpListener,
    ) -> thread::JoinHandle<u8> {
        let listener = UnixListener::bind(dir.join(format!("{id}.sock"))).unwrap();
        fs::write(dir.join("pid"), id).unwrap();
        thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let metas = vec![FdMeta {
                kind: crate::fds::FdKind::Listener,
                id: "web".into(),
                network: Some("tcp".into()),
                addr: Some(passed.local_addr().unwrap().to_string()),
            }];
            frame::write_versioned_json(&mut &conn, &metas, 0).unwrap();
            fdpass::send_fd(&conn, passed.as_fd(), "listener(web)").unwrap();
            let mut ready = [0u8; 1];
            (&conn).read_exact(&mut ready).unwrap();
            ready[0]
        })
    }

    #[test]
    fn v0_owner_handoff_uses_bare_ready_byte() {
        let dir = tempfile::tempdir().unwrap();
        let passed = TcpListener::bind("127.0.0.1:0").unwrap();
        let owner = spawn_v0_owner(dir.path(), "old", passed);

        let mut session = UpgradeSession::connect(coordinator(dir.path(), "new"), None).unwrap();
        assert!(session.has_owner());
        let files = session.get_files(None).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key("web"));

        session.ready_handshake().unwrap();
        session.become_owner().unwrap();
        session.close();

        assert_eq!(owner.join().unwrap(), proto::V0_NOTIFY_READY);
        assert_eq!(fs::read_to_string(dir.path().join("pid")).unwrap(), "new");
    }

    #[test]
    fn handshake_failure_leaves_ownership_unclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("old.sock")).unwrap();
        fs::write(dir.path().join("pid"), "old").unwrap();

        // A v1 owner that hangs up instead of acking the handshake.
        let owner = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let metas: Vec<FdMeta> = Vec::new();
            frame::write_versioned_json(&mut &conn, &metas, proto::PROTO_VERSION).unwrap();
            let mut opener = [0u8; 1];
            (&conn).read_exact(&mut opener).unwrap();
            drop(conn);
        });

        let mut session = UpgradeSession::connect(coordinator(dir.path(), "new"), None).unwrap();
        session.get_files(None).unwrap();
        assert!(session.ready_handshake().is_err());
        session.close();
        owner.join().unwrap();

        // The owner-id file still names the old owner: zero or one owner,
        // never two.
        assert_eq!(fs::read_to_string(dir.path().join("pid")).unwrap(), "old");
    }

    #[test]
    fn get_files_deadline_reports_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("old.sock")).unwrap();
        fs::write(dir.path().join("pid"), "old").unwrap();

        // An owner that accepts and then never sends anything.
        let owner = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
            drop(conn);
        });

        let mut session = UpgradeSession::connect(coordinator(dir.path(), "new"), None).unwrap();
        let deadline = Some(Instant::now() + Duration::from_millis(50));
        let err = session.get_files(deadline).unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded { .. }));
        session.close();
        owner.join().unwrap();
    }
}

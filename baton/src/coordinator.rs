//! Rendezvous through the coordination directory.
//!
//! Every cooperating process opens the same directory. The `pid` file
//! inside it holds the id of the current owner (empty means none) and
//! doubles as the advisory-lock object; each live process additionally
//! listens on `<id>.sock`. Ownership changes only happen while the lock is
//! held, which serializes handoffs across processes.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustix::fs::FlockOperation;
use rustix::io::Errno;
use tracing::{debug, info, warn};

use crate::error::Error;

/// How often a blocked [`Coordinator::lock`] retries the advisory lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Coordinates ownership between the processes sharing a directory.
///
/// One instance exists per process. The advisory lock on the owner-id file
/// must be held across any read-then-write of that file.
pub(crate) struct Coordinator {
    dir: PathBuf,
    id: String,
    lock: Mutex<Option<File>>,
}

impl Coordinator {
    pub(crate) fn new(dir: PathBuf, id: String) -> Self {
        Self {
            dir,
            id,
            lock: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Path of this process's handoff socket.
    pub(crate) fn sock_path(&self) -> PathBuf {
        sock_path(&self.dir, &self.id)
    }

    fn owner_id_path(&self) -> PathBuf {
        self.dir.join("pid")
    }

    /// Binds this process's handoff socket.
    ///
    /// A stale socket file left by a dead process that used the same id is
    /// unlinked and the bind retried once. Closing the returned listener
    /// does not unlink the path.
    ///
    /// # Errors
    ///
    /// Returns the bind error, including `AddrInUse` when the path is held
    /// by a live listener.
    pub(crate) fn listen(&self) -> io::Result<UnixListener> {
        let path = self.sock_path();
        match UnixListener::bind(&path) {
            Ok(listener) => Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                unlink_stale_socket(&path)?;
                debug!(path = %path.display(), "unlinked stale handoff socket");
                UnixListener::bind(&path)
            }
            Err(e) => Err(e),
        }
    }

    /// Takes the exclusive advisory lock on the owner-id file, creating the
    /// file if needed. Polls at [`LOCK_POLL_INTERVAL`] while another
    /// process holds it.
    ///
    /// # Errors
    ///
    /// [`Error::DeadlineExceeded`] if `deadline` passes first.
    pub(crate) fn lock(&self, deadline: Option<Instant>) -> Result<(), Error> {
        let path = self.owner_id_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o755)
            .open(&path)
            .map_err(Error::Io)?;

        debug!(id = %self.id, path = %path.display(), "taking coordination lock");
        loop {
            match rustix::fs::flock(&file, FlockOperation::NonBlockingLockExclusive) {
                Ok(()) => {
                    debug!(id = %self.id, "took coordination lock");
                    *self.lock_slot() = Some(file);
                    return Ok(());
                }
                Err(e) if e == Errno::WOULDBLOCK || e == Errno::INTR => {}
                Err(e) => return Err(Error::Io(io::Error::from(e))),
            }

            let sleep = match deadline {
                None => LOCK_POLL_INTERVAL,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::deadline("acquiring the coordination lock"));
                    }
                    remaining.min(LOCK_POLL_INTERVAL)
                }
            };
            std::thread::sleep(sleep);
        }
    }

    /// Releases the advisory lock. Safe to call when not held.
    pub(crate) fn unlock(&self) {
        if let Some(file) = self.lock_slot().take() {
            if let Err(e) = rustix::fs::flock(&file, FlockOperation::Unlock) {
                warn!(error = %e, "failed to release coordination lock");
            }
            debug!(id = %self.id, "released coordination lock");
        }
    }

    /// Writes this process's id into the owner-id file. Callers must hold
    /// the lock.
    ///
    /// # Errors
    ///
    /// Returns the write error.
    pub(crate) fn become_owner(&self) -> io::Result<()> {
        debug_assert!(
            self.lock_slot().is_some(),
            "ownership writes require the coordination lock"
        );
        info!(id = %self.id, "writing owner id");
        fs::write(self.owner_id_path(), self.id.as_bytes())
    }

    /// Reads the current owner id. An empty file means no owner.
    ///
    /// # Errors
    ///
    /// Returns the read error.
    pub(crate) fn owner_id(&self) -> io::Result<Option<String>> {
        let contents = fs::read_to_string(self.owner_id_path())?;
        if contents.is_empty() {
            Ok(None)
        } else {
            Ok(Some(contents))
        }
    }

    /// Dials the current owner's handoff socket.
    ///
    /// Returns `None` — meaning this process may claim ownership — when the
    /// owner-id file is empty, names this process's own id (the previous
    /// holder of the id died as owner), or names a process whose socket is
    /// gone or refusing connections (crashed owner).
    ///
    /// # Errors
    ///
    /// Returns read or dial errors other than the no-owner cases above.
    pub(crate) fn connect_owner(&self) -> Result<Option<UnixStream>, Error> {
        let Some(owner) = self.owner_id()? else {
            debug!("no current owner");
            return Ok(None);
        };
        if owner == self.id {
            // The last owner used our id and is necessarily dead: we hold
            // the lock and the listening socket for this id.
            info!(id = %self.id, "owner id file names this process; claiming ownership");
            return Ok(None);
        }

        let path = sock_path(&self.dir, &owner);
        debug!(owner = %owner, path = %path.display(), "connecting to current owner");
        match UnixStream::connect(&path) {
            Ok(conn) => Ok(Some(conn)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
                ) =>
            {
                // The owner-id file names a process that is not listening.
                // A well-behaved owner never releases the lock without a
                // live listener, so treat it as crashed and take over.
                warn!(owner = %owner, error = %e, "owner is not listening; claiming ownership");
                Ok(None)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<File>> {
        self.lock.lock().expect("coordinator lock mutex poisoned")
    }
}

fn sock_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.sock"))
}

fn unlink_stale_socket(path: &Path) -> io::Result<()> {
    let meta = fs::metadata(path)?;
    if meta.file_type().is_socket() {
        fs::remove_file(path)?;
    }
    Ok(())
}

//! The upgrader: construction, the accept loop serving handoffs, and the
//! public lifecycle calls.
//!
//! Construction binds this process's handoff socket, takes the
//! coordination lock, and — when a live owner exists — receives its
//! catalog. The lock is held until [`Upgrader::ready`] (or
//! [`Upgrader::stop`]) releases it, so no other process can interleave a
//! takeover. A dedicated accept thread serves at most one handoff at a
//! time for the rest of the process's life.

pub(crate) mod state;

use std::fs;
use std::io::{self, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::fds::{Fds, LockReason};
use crate::session::UpgradeSession;
use crate::sibling;
use crate::sync::Completion;

use state::{State, StateMachine};

/// How long the owner waits for a new process's ready signal before giving
/// up on it and remaining owner.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);

/// Construction and runtime options for an [`Upgrader`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Bound on a single handoff, from accepting the new process's
    /// connection to receiving its ready signal. Zero means the default.
    pub upgrade_timeout: Duration,
    /// Bound on construction: lock acquisition plus receiving the catalog
    /// from the current owner. `None` waits indefinitely. Has no effect
    /// once [`Upgrader::new`] has returned.
    pub startup_timeout: Option<Duration>,
    /// If set, the process id is written here (atomically, via a temp file
    /// rename) when this process becomes owner.
    pub pid_file: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
            startup_timeout: None,
            pid_file: None,
        }
    }
}

struct Shared {
    state: StateMachine,
    session: Mutex<Option<UpgradeSession>>,
    coordinator: Arc<Coordinator>,
    fds: Arc<Fds>,
    upgrade_timeout: Duration,
    pid_file: Option<PathBuf>,
    complete: Completion,
}

/// Hands shareable descriptors between independently started processes
/// that rendezvous through a coordination directory.
pub struct Upgrader {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader").finish_non_exhaustive()
    }
}

impl Upgrader {
    /// Joins the coordination directory under `id` and, if another process
    /// currently owns the shareable descriptors, receives its catalog.
    ///
    /// `id` must be unique among concurrently running processes on the
    /// directory; reusing the id of a dead process is fine.
    ///
    /// After `new` returns, this process holds the coordination lock and
    /// its descriptor store is populated; call [`Upgrader::ready`] once
    /// the application is prepared to serve, which completes the takeover
    /// and releases the lock.
    ///
    /// # Errors
    ///
    /// Socket, lock, or wire-protocol failures; and
    /// [`Error::DeadlineExceeded`] if `options.startup_timeout` elapses
    /// first. On error nothing keeps running and the lock is released.
    pub fn new(dir: impl AsRef<Path>, id: &str, options: Options) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        let coordinator = Arc::new(Coordinator::new(dir, id.to_string()));
        let listener = coordinator.listen().map_err(Error::Io)?;

        let deadline = options.startup_timeout.map(|t| Instant::now() + t);
        let mut session = UpgradeSession::connect(Arc::clone(&coordinator), deadline)?;
        let files = match session.get_files(deadline) {
            Ok(files) => files,
            Err(e) => {
                session.close();
                return Err(e);
            }
        };
        info!(
            id,
            inherited = files.len(),
            has_owner = session.has_owner(),
            "upgrader initialized"
        );

        let upgrade_timeout = if options.upgrade_timeout.is_zero() {
            DEFAULT_UPGRADE_TIMEOUT
        } else {
            options.upgrade_timeout
        };
        let shared = Arc::new(Shared {
            state: StateMachine::new(),
            session: Mutex::new(Some(session)),
            coordinator,
            fds: Arc::new(Fds::new(files)),
            upgrade_timeout,
            pid_file: options.pid_file,
            complete: Completion::new(),
        });

        let accept_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("baton-accept".into())
            .spawn(move || accept_loop(&accept_shared, listener))
            .expect("failed to spawn accept thread");

        Ok(Self { shared })
    }

    /// The shareable-descriptor store.
    #[must_use]
    pub fn fds(&self) -> &Fds {
        &self.shared.fds
    }

    /// Marks this process ready to serve, completing any in-progress
    /// takeover: runs the ready handshake with the previous owner (if
    /// there was one), writes this process's id into the owner-id file,
    /// and releases the coordination lock.
    ///
    /// The lock is released whether or not this call succeeds.
    ///
    /// # Errors
    ///
    /// Handshake or filesystem failures — the previous owner then remains
    /// (or nobody does) and this process must not serve. Calling `ready`
    /// after [`Upgrader::stop`] is an [`Error::InvalidTransition`].
    pub fn ready(&self) -> Result<(), Error> {
        let mut session_slot = self.lock_session();
        let Some(mut session) = session_slot.take() else {
            return match self.shared.state.current() {
                State::Owner => Ok(()),
                current => Err(Error::InvalidTransition {
                    from: current.name(),
                    to: State::Owner.name(),
                }),
            };
        };

        // The Owner transition happens before the lock release: the moment
        // the lock drops, the next process may read the owner-id file and
        // dial our accept loop, which only serves handoffs from Owner.
        let result = (|| {
            if session.has_owner() {
                session.ready_handshake()?;
            }
            if let Some(path) = &self.shared.pid_file {
                write_pid_file(path)?;
            }
            session.become_owner()?;
            self.shared.state.transition_to(State::Owner)
        })();
        session.close();
        result?;

        info!(id = %self.shared.coordinator.id(), "ready; this process is now the owner");
        Ok(())
    }

    /// A signal that closes when this process has handed its descriptors
    /// to a successor, or when it is stopped — either way, time to drain
    /// and exit.
    #[must_use]
    pub fn upgrade_complete(&self) -> Completion {
        self.shared.complete.clone()
    }

    /// Stops the upgrader: refuses further handoffs, releases the
    /// coordination lock if still held, locks and clears the descriptor
    /// store, closes the handoff socket, and closes the
    /// [`Upgrader::upgrade_complete`] signal. Idempotent.
    pub fn stop(&self) {
        let mut session_slot = self.lock_session();
        if self.shared.state.current() == State::Stopped {
            return;
        }
        self.shared.state.must_transition_to(State::Stopped);
        info!(id = %self.shared.coordinator.id(), "stopping upgrader");

        if let Some(mut session) = session_slot.take() {
            session.close();
        }
        self.shared.fds.lock_mutations(LockReason::UpgraderStopped);
        self.shared.fds.clear();
        self.shared.complete.close();
        drop(session_slot);

        // Wake the accept thread so it observes the stopped state, then
        // remove the socket path. The kernel socket itself dies when the
        // accept thread drops the listener.
        let sock_path = self.shared.coordinator.sock_path();
        let _ = UnixStream::connect(&sock_path);
        let _ = fs::remove_file(&sock_path);
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<UpgradeSession>> {
        self.shared.session.lock().expect("session mutex poisoned")
    }
}

impl Drop for Upgrader {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serves handoff requests on this process's socket, one at a time, until
/// the upgrader stops.
fn accept_loop(shared: &Shared, listener: UnixListener) {
    loop {
        let conn = match listener.accept() {
            Ok((conn, _)) => conn,
            Err(e) => {
                if shared.state.current() == State::Stopped {
                    break;
                }
                warn!(error = %e, "accept failed on the handoff socket");
                continue;
            }
        };
        if shared.state.current() == State::Stopped {
            break;
        }

        // Only the owner may transfer; concurrent requests race on this
        // transition and the loser's connection is dropped, which the peer
        // sees as a refused handoff.
        if let Err(e) = shared.state.transition_to(State::TransferringOwnership) {
            info!(error = %e, "refusing handoff request");
            continue;
        }
        serve_one(shared, &conn);
    }
    debug!(id = %shared.coordinator.id(), "accept loop exiting");
}

fn serve_one(shared: &Shared, conn: &UnixStream) {
    shared.fds.lock_mutations(LockReason::UpgradeInProgress);
    let result = shared
        .fds
        .snapshot()
        .map_err(Error::Io)
        .and_then(|entries| sibling::serve_handoff(conn, &entries, shared.upgrade_timeout));

    match result {
        Ok(()) => {
            shared.fds.lock_mutations(LockReason::UpgradeCompleted);
            // A concurrent stop() may have already left TransferringOwnership.
            if let Err(e) = shared.state.transition_to(State::Draining) {
                debug!(error = %e, "stopped while completing handoff");
            }
            info!(id = %shared.coordinator.id(), "ownership transferred; draining");
            shared.complete.close();
        }
        Err(e) => {
            warn!(error = %e, "handoff failed; this process remains owner");
            shared.fds.unlock_mutations();
            if let Err(e) = shared.state.transition_to(State::Owner) {
                debug!(error = %e, "stopped during failed handoff");
            }
        }
    }
}

/// Writes the current process id to `path` via a temp file and rename, so
/// readers never observe a partial write.
fn write_pid_file(path: &Path) -> io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = tempfile::NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))?;
    write!(tmp, "{}", std::process::id())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_upgrade_timeout_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let upgrader = Upgrader::new(
            dir.path(),
            "1",
            Options {
                upgrade_timeout: Duration::ZERO,
                ..Options::default()
            },
        )
        .unwrap();
        assert_eq!(upgrader.shared.upgrade_timeout, DEFAULT_UPGRADE_TIMEOUT);
        upgrader.stop();
    }

    #[test]
    fn ready_twice_is_ok_but_ready_after_stop_errors() {
        let dir = tempfile::tempdir().unwrap();
        let upgrader = Upgrader::new(dir.path(), "1", Options::default()).unwrap();
        upgrader.ready().unwrap();
        upgrader.ready().unwrap();
        upgrader.stop();
        assert!(matches!(
            upgrader.ready(),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn stop_is_idempotent_and_closes_complete() {
        let dir = tempfile::tempdir().unwrap();
        let upgrader = Upgrader::new(dir.path(), "1", Options::default()).unwrap();
        let complete = upgrader.upgrade_complete();
        assert!(!complete.is_complete());
        upgrader.stop();
        upgrader.stop();
        assert!(complete.is_complete());
    }

    #[test]
    fn stop_unlinks_the_handoff_socket() {
        let dir = tempfile::tempdir().unwrap();
        let upgrader = Upgrader::new(dir.path(), "1", Options::default()).unwrap();
        let sock = dir.path().join("1.sock");
        assert!(sock.exists());
        upgrader.stop();
        assert!(!sock.exists());
    }

    #[test]
    fn pid_file_written_on_ready() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("self.pid");
        let upgrader = Upgrader::new(
            dir.path(),
            "1",
            Options {
                pid_file: Some(pid_path.clone()),
                ..Options::default()
            },
        )
        .unwrap();
        upgrader.ready().unwrap();
        let contents = fs::read_to_string(&pid_path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        upgrader.stop();
    }
}

//! Blocking coordination primitives: the upgrade-complete signal and the
//! watcher that enforces deadlines on blocking socket I/O.

use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A one-shot signal that is closed at most once and observable by any
/// number of waiters. Plays the role of a closed channel: once complete it
/// stays complete.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                done: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Marks the signal complete, waking all waiters. Idempotent.
    pub(crate) fn close(&self) {
        let mut done = self.inner.done.lock().expect("completion mutex poisoned");
        if !*done {
            *done = true;
            self.inner.cond.notify_all();
        }
    }

    /// Whether the signal has completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.inner.done.lock().expect("completion mutex poisoned")
    }

    /// Blocks until the signal completes.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock().expect("completion mutex poisoned");
        while !*done {
            done = self
                .inner
                .cond
                .wait(done)
                .expect("completion mutex poisoned");
        }
    }

    /// Blocks until the signal completes or `timeout` passes. Returns
    /// whether the signal completed.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.inner.done.lock().expect("completion mutex poisoned");
        while !*done {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(done, remaining)
                .expect("completion mutex poisoned");
            done = guard;
        }
        true
    }
}

/// Shuts a socket down if a deadline fires before the guard is dropped.
///
/// Blocking reads and writes on the socket fail once the shutdown happens,
/// which is the only reliable way to interrupt them. Dropping the guard
/// disarms the watcher.
pub(crate) struct SocketDeadline {
    // Dropped (disconnecting the watcher) when the guard goes away.
    _done: mpsc::Sender<()>,
    fired: Arc<AtomicBool>,
}

impl SocketDeadline {
    /// Arms a watcher for `conn` that fires at `deadline`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket handle cannot be cloned.
    pub(crate) fn arm(conn: &UnixStream, deadline: Instant) -> io::Result<Self> {
        let sock = conn.try_clone()?;
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let (done, watch) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("baton-deadline".into())
            .spawn(move || {
                let wait = deadline.saturating_duration_since(Instant::now());
                if let Err(RecvTimeoutError::Timeout) = watch.recv_timeout(wait) {
                    flag.store(true, Ordering::SeqCst);
                    let _ = sock.shutdown(Shutdown::Both);
                }
            })
            .expect("failed to spawn deadline thread");

        Ok(Self { _done: done, fired })
    }

    /// Whether the deadline fired and shut the socket down.
    pub(crate) fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

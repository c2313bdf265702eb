//! Top-level error type for upgrader construction and lifecycle calls.

use std::io;

use thiserror::Error;

use crate::fds::StoreError;
use crate::proto::ProtocolError;

/// Errors surfaced by [`Upgrader::new`](crate::Upgrader::new) and
/// [`Upgrader::ready`](crate::Upgrader::ready).
#[derive(Debug, Error)]
pub enum Error {
    /// The startup deadline elapsed before the operation finished.
    ///
    /// Errors caused by the deadline firing (the watcher shuts the socket
    /// down, so socket reads fail) are rewrapped into this variant with the
    /// original failure as `source`, so callers can tell cancellation apart
    /// from a peer failure.
    #[error("deadline exceeded while {doing}")]
    DeadlineExceeded {
        doing: &'static str,
        #[source]
        source: Option<Box<Error>>,
    },
    /// The peer of a handoff did not signal ready within the upgrade
    /// timeout. The sender remains owner.
    #[error("timed out waiting for the new process to signal ready")]
    HandoffTimeout,
    /// A lifecycle transition outside the state machine's table.
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    /// The handoff wire exchange failed or was malformed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// A descriptor-store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Filesystem or socket error outside the wire protocol.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn deadline(doing: &'static str) -> Self {
        Error::DeadlineExceeded { doing, source: None }
    }

    pub(crate) fn deadline_with(doing: &'static str, source: Error) -> Self {
        Error::DeadlineExceeded {
            doing,
            source: Some(Box::new(source)),
        }
    }
}

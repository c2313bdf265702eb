//! Zero-downtime handoff of open file descriptors between independently
//! managed processes.
//!
//! Unlike fork/exec upgrade schemes, the processes involved are unrelated:
//! each is started on its own (by a service manager, in a new container,
//! however you like) and they rendezvous only through a shared
//! *coordination directory*. Among the processes using one directory, at
//! most one is the **owner** of the shareable descriptors at any instant.
//! A new process inherits the owner's listening sockets over a unix socket
//! (`SCM_RIGHTS`), signals readiness, takes over the owner id, and the old
//! process drains and exits — without the listening sockets ever closing.
//!
//! # Usage
//!
//! ```no_run
//! use baton::{Options, Upgrader};
//!
//! # fn main() -> Result<(), baton::Error> {
//! let upgrader = Upgrader::new("/run/my-service", "some-unique-id", Options::default())?;
//!
//! // Create or inherit the listening socket, then start serving on it.
//! let listener = upgrader.fds().listen_tcp("http", "127.0.0.1:8080")?;
//!
//! // Once the application is prepared to serve, take ownership. Any
//! // previous owner begins draining.
//! upgrader.ready()?;
//!
//! // Block until a successor has taken over (or we are stopped), then
//! // drain in-flight work and exit.
//! upgrader.upgrade_complete().wait();
//! drop(listener);
//! # Ok(())
//! # }
//! ```
//!
//! The coordination directory contains an owner-id file (`pid`, which also
//! serves as the advisory-lock object) and one `<id>.sock` unix socket per
//! live process. Ids are opaque strings chosen by the caller; they must be
//! unique among concurrently running processes, and reusing the id of a
//! dead process is supported.
//!
//! This crate is Unix-only.

mod coordinator;
mod error;
mod fds;
mod proto;
mod session;
mod sibling;
mod sync;
mod upgrader;

pub use error::Error;
pub use fds::{Fds, StoreError};
pub use proto::ProtocolError;
pub use sync::Completion;
pub use upgrader::{Options, Upgrader, DEFAULT_UPGRADE_TIMEOUT};

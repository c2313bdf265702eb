//! Catalog of shareable file descriptors.
//!
//! The store maps opaque ids to descriptors that were either created by
//! this process or inherited from the previous owner. Every stored
//! descriptor is a close-on-exec duplicate owned exclusively by the store;
//! retrieval hands out a fresh duplicate, so user code closing its handle
//! never invalidates the catalog, and handing the catalog off never closes
//! a handle the user still serves connections on.
//!
//! While a handoff is in flight the store is locked: mutations fail with
//! the lock reason, lookups keep working.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::net::TcpListener;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::proto::fdpass;

/// Errors returned by descriptor-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A handoff is in flight; the catalog cannot change until it settles.
    #[error("an upgrade is currently in progress")]
    UpgradeInProgress,
    /// This process has handed its descriptors off and is draining.
    #[error("an upgrade has completed")]
    UpgradeCompleted,
    /// The upgrader has been stopped.
    #[error("the upgrader has been stopped")]
    UpgraderStopped,
    /// No entry with the given id.
    #[error("no entry in the store with id {0:?}")]
    UnknownId(String),
    /// Creating or duplicating a descriptor failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why the store is refusing mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockReason {
    UpgradeInProgress,
    UpgradeCompleted,
    UpgraderStopped,
}

impl LockReason {
    fn as_error(self) -> StoreError {
        match self {
            LockReason::UpgradeInProgress => StoreError::UpgradeInProgress,
            LockReason::UpgradeCompleted => StoreError::UpgradeCompleted,
            LockReason::UpgraderStopped => StoreError::UpgraderStopped,
        }
    }
}

/// What a catalog entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum FdKind {
    Listener,
    Conn,
    File,
}

/// Entry metadata as transmitted ahead of the descriptors during a handoff.
///
/// `network` and `addr` record how a socket was created; after a handoff
/// they are informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FdMeta {
    pub kind: FdKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
}

impl fmt::Display for FdMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let network = self.network.as_deref().unwrap_or("");
        let addr = self.addr.as_deref().unwrap_or("");
        match self.kind {
            FdKind::File => write!(f, "file({})", self.id),
            FdKind::Listener => write!(f, "listener({}): {network}:{addr}", self.id),
            FdKind::Conn => write!(f, "conn({}): {network}:{addr}", self.id),
        }
    }
}

/// A stored descriptor together with its display name.
#[derive(Debug)]
pub(crate) struct NamedFd {
    pub fd: OwnedFd,
    pub name: String,
}

/// One catalog entry: metadata plus the owned descriptor.
#[derive(Debug)]
pub(crate) struct FdEntry {
    meta: FdMeta,
    file: NamedFd,
}

impl FdEntry {
    pub(crate) fn new(meta: FdMeta, file: NamedFd) -> Self {
        Self { meta, file }
    }

    fn dup(&self) -> io::Result<OwnedFd> {
        fdpass::dup_cloexec(&self.file.fd)
    }
}

/// A snapshot element handed to the sender side of a handoff. Owns its own
/// duplicate so the wire transfer does not hold the store mutex.
#[derive(Debug)]
pub(crate) struct PassedFd {
    pub meta: FdMeta,
    pub fd: OwnedFd,
    pub name: String,
}

struct Inner {
    entries: HashMap<String, FdEntry>,
    locked: Option<LockReason>,
}

/// The shareable-descriptor store. Obtained from
/// [`Upgrader::fds`](crate::Upgrader::fds).
pub struct Fds {
    inner: Mutex<Inner>,
}

impl Fds {
    pub(crate) fn new(inherited: HashMap<String, FdEntry>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: inherited,
                locked: None,
            }),
        }
    }

    /// Returns a TCP listener with this id, inheriting one from the
    /// previous owner if present and binding `addr` otherwise.
    ///
    /// # Errors
    ///
    /// Returns a lock-reason error if the store is locked and no inherited
    /// listener exists, or the bind error.
    pub fn listen_tcp(&self, id: &str, addr: &str) -> Result<TcpListener, StoreError> {
        self.listen_with(id, "tcp", addr, |_, addr| TcpListener::bind(addr))
    }

    /// Returns a unix listener with this id, inheriting or binding `path`.
    ///
    /// # Errors
    ///
    /// As [`Fds::listen_tcp`].
    pub fn listen_unix(&self, id: &str, path: impl AsRef<Path>) -> Result<UnixListener, StoreError> {
        let addr = path.as_ref().to_string_lossy().into_owned();
        self.listen_with(id, "unix", &addr, |_, addr| UnixListener::bind(addr))
    }

    /// Returns a listener with this id, inheriting one if present and
    /// otherwise constructing it with `listen`.
    ///
    /// The callback should return quickly: it runs under the store mutex
    /// and blocks handoff requests while it does.
    ///
    /// # Errors
    ///
    /// Returns a lock-reason error if the store is locked and no inherited
    /// entry exists, or whatever `listen` fails with.
    pub fn listen_with<L, F>(
        &self,
        id: &str,
        network: &str,
        addr: &str,
        listen: F,
    ) -> Result<L, StoreError>
    where
        L: AsFd + From<OwnedFd>,
        F: FnOnce(&str, &str) -> io::Result<L>,
    {
        self.create_or_inherit(FdKind::Listener, id, Some(network), Some(addr), || {
            listen(network, addr)
        })
    }

    /// Returns a connection with this id, inheriting one if present and
    /// otherwise constructing it with `dial`.
    ///
    /// # Errors
    ///
    /// As [`Fds::listen_with`].
    pub fn dial_with<C, F>(
        &self,
        id: &str,
        network: &str,
        addr: &str,
        dial: F,
    ) -> Result<C, StoreError>
    where
        C: AsFd + From<OwnedFd>,
        F: FnOnce(&str, &str) -> io::Result<C>,
    {
        self.create_or_inherit(FdKind::Conn, id, Some(network), Some(addr), || {
            dial(network, addr)
        })
    }

    /// Returns a file with this id, inheriting one if present and otherwise
    /// opening it with `open`.
    ///
    /// # Errors
    ///
    /// As [`Fds::listen_with`].
    pub fn open_file_with<F>(
        &self,
        id: &str,
        name: &str,
        open: F,
    ) -> Result<File, StoreError>
    where
        F: FnOnce(&str) -> io::Result<File>,
    {
        self.create_or_inherit(FdKind::File, id, None, None, || open(name))
    }

    /// Returns a fresh listener handle for an inherited or stored entry, or
    /// `None` if absent. The caller owns closing the returned handle; the
    /// stored descriptor is unaffected.
    ///
    /// # Errors
    ///
    /// Returns an error if duplicating the stored descriptor fails.
    pub fn listener<L: From<OwnedFd>>(&self, id: &str) -> Result<Option<L>, StoreError> {
        self.dup_entry(id)
    }

    /// Returns a fresh connection handle for a stored entry, or `None`.
    ///
    /// # Errors
    ///
    /// As [`Fds::listener`].
    pub fn conn<C: From<OwnedFd>>(&self, id: &str) -> Result<Option<C>, StoreError> {
        self.dup_entry(id)
    }

    /// Returns a fresh file handle for a stored entry, or `None`.
    ///
    /// # Errors
    ///
    /// As [`Fds::listener`].
    pub fn file(&self, id: &str) -> Result<Option<File>, StoreError> {
        self.dup_entry(id)
    }

    /// Removes the entry and closes its stored descriptor.
    ///
    /// Removal is refused while a handoff is in flight. It is permitted
    /// after the upgrade completed or the upgrader stopped, so a draining
    /// process can release descriptors it no longer serves.
    ///
    /// # Errors
    ///
    /// [`StoreError::UpgradeInProgress`] mid-handoff,
    /// [`StoreError::UnknownId`] if no such entry exists.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        if inner.locked == Some(LockReason::UpgradeInProgress) {
            return Err(StoreError::UpgradeInProgress);
        }
        match inner.entries.remove(id) {
            Some(_) => Ok(()),
            None => Err(StoreError::UnknownId(id.to_string())),
        }
    }

    /// Refuses further mutations with the given reason. `UpgraderStopped`
    /// is terminal and never overwritten.
    pub(crate) fn lock_mutations(&self, reason: LockReason) {
        let mut inner = self.lock_inner();
        if inner.locked == Some(LockReason::UpgraderStopped) {
            return;
        }
        inner.locked = Some(reason);
    }

    /// Re-allows mutations after a failed handoff. Only an in-progress lock
    /// is cleared; completed and stopped states are terminal.
    pub(crate) fn unlock_mutations(&self) {
        let mut inner = self.lock_inner();
        if inner.locked == Some(LockReason::UpgradeInProgress) {
            inner.locked = None;
        }
    }

    /// Snapshots the catalog for the sender side of a handoff. Every
    /// element owns a fresh duplicate, so the wire transfer runs without
    /// the store mutex.
    pub(crate) fn snapshot(&self) -> io::Result<Vec<PassedFd>> {
        let inner = self.lock_inner();
        let mut out = Vec::with_capacity(inner.entries.len());
        for entry in inner.entries.values() {
            out.push(PassedFd {
                meta: entry.meta.clone(),
                fd: entry.dup()?,
                name: entry.file.name.clone(),
            });
        }
        Ok(out)
    }

    /// Drops every entry, closing the stored descriptors. Used on stop.
    pub(crate) fn clear(&self) {
        let mut inner = self.lock_inner();
        let n = inner.entries.len();
        inner.entries.clear();
        if n > 0 {
            debug!(closed = n, "closed stored descriptors");
        }
    }

    fn create_or_inherit<T, F>(
        &self,
        kind: FdKind,
        id: &str,
        network: Option<&str>,
        addr: Option<&str>,
        create: F,
    ) -> Result<T, StoreError>
    where
        T: AsFd + From<OwnedFd>,
        F: FnOnce() -> io::Result<T>,
    {
        let mut inner = self.lock_inner();
        // Inherited entries are handed out even while the store is locked;
        // only the creation of new entries is a mutation.
        if let Some(entry) = inner.entries.get(id) {
            debug!(id, name = %entry.file.name, "inheriting stored descriptor");
            return Ok(T::from(entry.dup()?));
        }
        if let Some(reason) = inner.locked {
            return Err(reason.as_error());
        }

        let created = create()?;
        let meta = FdMeta {
            kind,
            id: id.to_string(),
            network: network.map(str::to_string),
            addr: addr.map(str::to_string),
        };
        let name = meta.to_string();
        let dup = fdpass::dup_cloexec(created.as_fd())?;
        debug!(id, name = %name, "stored new descriptor");
        inner.entries.insert(
            meta.id.clone(),
            FdEntry::new(meta, NamedFd { fd: dup, name }),
        );
        Ok(created)
    }

    fn dup_entry<T: From<OwnedFd>>(&self, id: &str) -> Result<Option<T>, StoreError> {
        let inner = self.lock_inner();
        match inner.entries.get(id) {
            Some(entry) => Ok(Some(T::from(entry.dup()?))),
            None => Ok(None),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fd store mutex poisoned")
    }
}

impl fmt::Debug for Fds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("Fds")
            .field("entries", &inner.entries.keys().collect::<Vec<_>>())
            .field("locked", &inner.locked)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn memory_file() -> io::Result<File> {
        tempfile::tempfile()
    }

    fn empty_store() -> Fds {
        Fds::new(HashMap::new())
    }

    #[test]
    fn listen_stores_and_returns_working_listener() {
        let fds = empty_store();
        let ln = fds.listen_tcp("web", "127.0.0.1:0").unwrap();
        let addr = ln.local_addr().unwrap();

        // A retrieved handle accepts on the same socket.
        let retrieved: TcpListener = fds.listener("web").unwrap().unwrap();
        drop(ln);
        let client = std::thread::spawn(move || {
            let mut c = TcpStream::connect(addr).unwrap();
            c.write_all(b"hi").unwrap();
        });
        let (mut conn, _) = retrieved.accept().unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        client.join().unwrap();
    }

    #[test]
    fn listen_returns_existing_entry_for_same_id() {
        let fds = empty_store();
        let first = fds.listen_tcp("web", "127.0.0.1:0").unwrap();
        let addr = first.local_addr().unwrap();
        let second = fds.listen_tcp("web", "127.0.0.1:0").unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[test]
    fn closing_retrieved_unix_listener_keeps_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let fds = empty_store();
        let ln = fds.listen_unix("svc", &path).unwrap();
        drop(ln);
        let retrieved: UnixListener = fds.listener("svc").unwrap().unwrap();
        drop(retrieved);
        assert!(path.exists(), "socket path must survive handle closes");
    }

    #[test]
    fn mutation_lock_matrix() {
        let fds = empty_store();
        fds.open_file_with("keep", "keep", |_| memory_file()).unwrap();

        fds.lock_mutations(LockReason::UpgradeInProgress);
        assert!(matches!(
            fds.open_file_with("a", "a", |_| memory_file()),
            Err(StoreError::UpgradeInProgress)
        ));
        assert!(matches!(
            fds.remove("keep"),
            Err(StoreError::UpgradeInProgress)
        ));
        // Lookups still work while locked.
        assert!(fds.file("keep").unwrap().is_some());
        // Inherited handles are still handed out while locked.
        assert!(fds.open_file_with("keep", "keep", |_| memory_file()).is_ok());

        fds.lock_mutations(LockReason::UpgradeCompleted);
        assert!(matches!(
            fds.open_file_with("b", "b", |_| memory_file()),
            Err(StoreError::UpgradeCompleted)
        ));
        // Removal after completion is allowed so the drainer can release
        // descriptors it no longer serves.
        assert!(fds.remove("keep").is_ok());

        fds.lock_mutations(LockReason::UpgraderStopped);
        assert!(matches!(
            fds.open_file_with("c", "c", |_| memory_file()),
            Err(StoreError::UpgraderStopped)
        ));
        // Stopped is terminal; later lock calls cannot downgrade it.
        fds.lock_mutations(LockReason::UpgradeInProgress);
        assert!(matches!(
            fds.open_file_with("d", "d", |_| memory_file()),
            Err(StoreError::UpgraderStopped)
        ));
    }

    #[test]
    fn unlock_restores_mutations_after_failed_handoff() {
        let fds = empty_store();
        fds.lock_mutations(LockReason::UpgradeInProgress);
        fds.unlock_mutations();
        assert!(fds.open_file_with("a", "a", |_| memory_file()).is_ok());
    }

    #[test]
    fn remove_unknown_id() {
        let fds = empty_store();
        assert!(matches!(
            fds.remove("ghost"),
            Err(StoreError::UnknownId(_))
        ));
    }

    #[test]
    fn remove_closes_stored_descriptor_but_not_retrieved_handles() {
        let fds = empty_store();
        fds.open_file_with("f", "f", |_| memory_file()).unwrap();
        let handle = fds.file("f").unwrap().unwrap();
        fds.remove("f").unwrap();
        assert!(fds.file("f").unwrap().is_none());
        // The previously retrieved duplicate still works.
        let mut handle = handle;
        handle.write_all(b"x").unwrap();
    }

    #[test]
    fn snapshot_dups_entries() {
        let fds = empty_store();
        fds.listen_tcp("web", "127.0.0.1:0").unwrap();
        fds.open_file_with("log", "log", |_| memory_file()).unwrap();
        let snap = fds.snapshot().unwrap();
        assert_eq!(snap.len(), 2);
        // Snapshot names are the display names used on the wire.
        assert!(snap.iter().any(|p| p.name.starts_with("listener(web)")));
        assert!(snap.iter().any(|p| p.name == "file(log)"));
    }

    #[test]
    fn meta_serialization_shape() {
        let meta = FdMeta {
            kind: FdKind::Listener,
            id: "web".into(),
            network: Some("tcp".into()),
            addr: Some("127.0.0.1:80".into()),
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"listener","id":"web","network":"tcp","addr":"127.0.0.1:80"}"#
        );

        // Entries without socket details omit them, and decode back.
        let meta = FdMeta {
            kind: FdKind::File,
            id: "log".into(),
            network: None,
            addr: None,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"kind":"file","id":"log"}"#);
        let back: FdMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, FdKind::File);
    }
}

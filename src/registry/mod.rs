//! In-memory registry of live connections.
//!
//! A Connection binds an application id to a writer for the life of one
//! session. Identity is the (app id, writer) pair, so one application may
//! hold several concurrent connections, but a writer belongs to at most one
//! Connection at a time. The registry is the single authority on writer
//! liveness; the emitter and session teardown both consult it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::info;

use crate::auth::SessionClaims;

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Cloneable handle over the write half of one accepted stream.
///
/// Writes are serialized through an async mutex, so concurrent emitters
/// interleave whole frames rather than bytes. Identity (equality, hashing)
/// is the handle's unique id, not the underlying stream object.
#[derive(Clone)]
pub struct ConnectionWriter {
    id: u64,
    peer: Arc<str>,
    inner: Arc<Mutex<BoxedWriter>>,
}

impl ConnectionWriter {
    pub fn new(peer: impl Into<String>, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            id: NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into().into(),
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address label, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one encoded frame and drain the stream buffer.
    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    pub async fn shutdown(&self) -> std::io::Result<()> {
        self.inner.lock().await.shutdown().await
    }
}

impl PartialEq for ConnectionWriter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionWriter {}

impl std::hash::Hash for ConnectionWriter {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for ConnectionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWriter")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// One live session binding. Fields never change after registration.
#[derive(Debug, Clone)]
pub struct Connection {
    pub app_id: String,
    pub writer: ConnectionWriter,
    pub claims: SessionClaims,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.app_id == other.app_id && self.writer.id == other.writer.id
    }
}

impl Eq for Connection {}

impl std::hash::Hash for Connection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.app_id.hash(state);
        self.writer.id.hash(state);
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    /// A writer may appear in at most one Connection at a time.
    #[error("writer is already bound to application '{0}'")]
    WriterAlreadyBound(String),
}

#[derive(Default)]
struct Inner {
    by_writer: HashMap<u64, Connection>,
    by_app: HashMap<String, HashSet<u64>>,
}

/// Process-wide set of live Connections with writer and app-id indices.
/// Critical sections are short and never span an await point.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, connection: Connection) -> Result<(), RegistryError> {
        let mut inner = self.write();
        if let Some(existing) = inner.by_writer.get(&connection.writer.id()) {
            return Err(RegistryError::WriterAlreadyBound(existing.app_id.clone()));
        }

        let app_id = connection.app_id.clone();
        let writer_id = connection.writer.id();
        inner.by_app.entry(app_id.clone()).or_default().insert(writer_id);
        inner.by_writer.insert(writer_id, connection);
        drop(inner);

        info!(app_id = %app_id, writer_id, "connection registered");
        Ok(())
    }

    pub fn remove_by_writer(&self, writer: &ConnectionWriter) -> Option<Connection> {
        let mut inner = self.write();
        let connection = inner.by_writer.remove(&writer.id())?;
        if let Some(writers) = inner.by_app.get_mut(&connection.app_id) {
            writers.remove(&writer.id());
            if writers.is_empty() {
                inner.by_app.remove(&connection.app_id);
            }
        }
        drop(inner);

        info!(app_id = %connection.app_id, writer_id = writer.id(), "connection removed");
        Some(connection)
    }

    /// Remove every connection bound to `app_id`, returning them.
    pub fn remove_by_id(&self, app_id: &str) -> Vec<Connection> {
        let mut inner = self.write();
        let Some(writer_ids) = inner.by_app.remove(app_id) else {
            return Vec::new();
        };
        writer_ids
            .into_iter()
            .filter_map(|id| inner.by_writer.remove(&id))
            .collect()
    }

    pub fn find_by_writer(&self, writer: &ConnectionWriter) -> Option<Connection> {
        self.read().by_writer.get(&writer.id()).cloned()
    }

    pub fn find_by_id(&self, app_id: &str) -> Vec<Connection> {
        let inner = self.read();
        inner
            .by_app
            .get(app_id)
            .map(|writer_ids| {
                writer_ids
                    .iter()
                    .filter_map(|id| inner.by_writer.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live writers for each of the given application ids, deduplicated.
    pub fn writers_for_ids<'a>(
        &self,
        app_ids: impl IntoIterator<Item = &'a str>,
    ) -> Vec<ConnectionWriter> {
        let inner = self.read();
        let mut seen = HashSet::new();
        let mut writers = Vec::new();
        for app_id in app_ids {
            if let Some(writer_ids) = inner.by_app.get(app_id) {
                for id in writer_ids {
                    if seen.insert(*id) {
                        if let Some(connection) = inner.by_writer.get(id) {
                            writers.push(connection.writer.clone());
                        }
                    }
                }
            }
        }
        writers
    }

    /// Consistent snapshot of the live set, optionally filtered, ordered by
    /// (app id, writer id). `limit == 0` means no limit.
    pub fn snapshot(
        &self,
        filter: Option<&dyn Fn(&Connection) -> bool>,
        skip: usize,
        limit: usize,
    ) -> Vec<Connection> {
        let mut connections: Vec<Connection> = {
            let inner = self.read();
            inner.by_writer.values().cloned().collect()
        };
        if let Some(filter) = filter {
            connections.retain(|c| filter(c));
        }
        connections.sort_by(|a, b| {
            (&a.app_id, a.writer.id()).cmp(&(&b.app_id, b.writer.id()))
        });

        let connections = connections.into_iter().skip(skip);
        if limit > 0 {
            connections.take(limit).collect()
        } else {
            connections.collect()
        }
    }

    pub fn len(&self) -> usize {
        self.read().by_writer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().by_writer.is_empty()
    }
}

//! Read-through memoizer over a replica.
//!
//! Caches the results of the closed read API keyed by (operation,
//! arguments). Any successful write to the underlying replica bumps the
//! cache version and recomputes every currently-held key, emitting one
//! [`CacheEvent::Updated`] per refreshed key.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::doc::Document;
use crate::query::Query;
use crate::replica::{Replica, ReplicaError};

/// Cache tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Entries older than this are recomputed on access. `None` means
    /// entries only refresh on writes.
    pub ttl: Option<Duration>,
}

/// Failure of a cache operation.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The cache was closed.
    #[error("cache is closed")]
    Closed,
    /// The underlying replica failed.
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

/// A memoized operation plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// `get_all_docs()`
    AllDocs,
    /// `get_latest_docs()`
    LatestDocs,
    /// `get_all_docs_at_path(path)`
    AllDocsAtPath(String),
    /// `get_latest_doc_at_path(path)`
    LatestDocAtPath(String),
    /// `query_docs(query)`
    QueryDocs(Query),
}

/// Emitted on the subscription channel when a held key is refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// The value for this key was recomputed.
    Updated(CacheKey),
}

#[derive(Debug, Clone)]
enum CacheValue {
    Docs(Vec<Arc<Document>>),
    MaybeDoc(Option<Arc<Document>>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CacheValue,
    refreshed_at: Instant,
}

#[derive(Debug)]
struct CacheInner {
    replica: Replica,
    config: CacheConfig,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    version: AtomicU64,
    closed: AtomicBool,
    event_txs: RwLock<Vec<flume::Sender<CacheEvent>>>,
    watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Read-through cache over a [`Replica`]. Cheap to clone.
///
/// Must be constructed inside a tokio runtime; a watcher task listens to the
/// replica's write events and keeps held entries fresh.
#[derive(Debug, Clone)]
pub struct ReplicaCache {
    inner: Arc<CacheInner>,
}

impl ReplicaCache {
    /// Wrap a replica with default config.
    pub fn new(replica: Replica) -> Self {
        Self::with_config(replica, CacheConfig::default())
    }

    /// Wrap a replica.
    pub fn with_config(replica: Replica, config: CacheConfig) -> Self {
        let events = replica.subscribe_events();
        let cache = ReplicaCache {
            inner: Arc::new(CacheInner {
                replica,
                config,
                entries: Mutex::new(HashMap::new()),
                version: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                event_txs: RwLock::new(Vec::new()),
                watcher: Mutex::new(None),
            }),
        };

        let weak = Arc::downgrade(&cache.inner);
        let task = tokio::spawn(watch_writes(weak, events));
        *cache.inner.watcher.lock() = Some(task);

        cache
    }

    /// How many writes have invalidated this cache so far.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// Subscribe to per-key refresh notifications.
    pub fn subscribe(&self) -> flume::Receiver<CacheEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner.event_txs.write().push(tx);
        rx
    }

    /// Memoized [`Replica::get_all_docs`].
    pub fn get_all_docs(&self) -> Result<Vec<Arc<Document>>, CacheError> {
        match self.lookup(CacheKey::AllDocs)? {
            CacheValue::Docs(docs) => Ok(docs),
            CacheValue::MaybeDoc(_) => unreachable!("key shape is fixed"),
        }
    }

    /// Memoized [`Replica::get_latest_docs`].
    pub fn get_latest_docs(&self) -> Result<Vec<Arc<Document>>, CacheError> {
        match self.lookup(CacheKey::LatestDocs)? {
            CacheValue::Docs(docs) => Ok(docs),
            CacheValue::MaybeDoc(_) => unreachable!("key shape is fixed"),
        }
    }

    /// Memoized [`Replica::get_all_docs_at_path`].
    pub fn get_all_docs_at_path(&self, path: &str) -> Result<Vec<Arc<Document>>, CacheError> {
        match self.lookup(CacheKey::AllDocsAtPath(path.to_string()))? {
            CacheValue::Docs(docs) => Ok(docs),
            CacheValue::MaybeDoc(_) => unreachable!("key shape is fixed"),
        }
    }

    /// Memoized [`Replica::get_latest_doc_at_path`].
    pub fn get_latest_doc_at_path(
        &self,
        path: &str,
    ) -> Result<Option<Arc<Document>>, CacheError> {
        match self.lookup(CacheKey::LatestDocAtPath(path.to_string()))? {
            CacheValue::MaybeDoc(doc) => Ok(doc),
            CacheValue::Docs(_) => unreachable!("key shape is fixed"),
        }
    }

    /// Memoized [`Replica::query_docs`].
    pub fn query_docs(&self, query: &Query) -> Result<Vec<Arc<Document>>, CacheError> {
        match self.lookup(CacheKey::QueryDocs(query.clone()))? {
            CacheValue::Docs(docs) => Ok(docs),
            CacheValue::MaybeDoc(_) => unreachable!("key shape is fixed"),
        }
    }

    fn lookup(&self, key: CacheKey) -> Result<CacheValue, CacheError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get(&key) {
            let fresh = match self.inner.config.ttl {
                Some(ttl) => entry.refreshed_at.elapsed() < ttl,
                None => true,
            };
            if fresh {
                return Ok(entry.value.clone());
            }
        }
        let value = compute(&self.inner.replica, &key)?;
        entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                refreshed_at: Instant::now(),
            },
        );
        Ok(value)
    }

    /// Close the cache. Pending recomputations are aborted and every later
    /// operation fails with a closed error.
    pub fn close(&self) -> Result<(), CacheError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        if let Some(task) = self.inner.watcher.lock().take() {
            task.abort();
        }
        self.inner.entries.lock().clear();
        self.inner.event_txs.write().clear();
        Ok(())
    }
}

fn compute(replica: &Replica, key: &CacheKey) -> Result<CacheValue, CacheError> {
    Ok(match key {
        CacheKey::AllDocs => CacheValue::Docs(replica.get_all_docs()?),
        CacheKey::LatestDocs => CacheValue::Docs(replica.get_latest_docs()?),
        CacheKey::AllDocsAtPath(path) => CacheValue::Docs(replica.get_all_docs_at_path(path)?),
        CacheKey::LatestDocAtPath(path) => {
            CacheValue::MaybeDoc(replica.get_latest_doc_at_path(path)?)
        }
        CacheKey::QueryDocs(query) => CacheValue::Docs(replica.query_docs(query)?),
    })
}

async fn watch_writes(
    weak: Weak<CacheInner>,
    events: flume::Receiver<crate::replica::WriteEvent>,
) {
    while let Ok(_event) = events.recv_async().await {
        let Some(inner) = weak.upgrade() else { break };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.version.fetch_add(1, Ordering::SeqCst);

        let keys: Vec<CacheKey> = inner.entries.lock().keys().cloned().collect();
        for key in keys {
            let value = match compute(&inner.replica, &key) {
                Ok(value) => value,
                Err(err) => {
                    warn!(?err, "cache recompute failed");
                    return;
                }
            };
            inner.entries.lock().insert(
                key.clone(),
                CacheEntry {
                    value,
                    refreshed_at: Instant::now(),
                },
            );
            let mut txs = inner.event_txs.write();
            txs.retain(|tx| tx.send(CacheEvent::Updated(key.clone())).is_ok());
        }
    }
}

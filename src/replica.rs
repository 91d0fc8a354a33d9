//! The per-share document store.
//!
//! A [`Replica`] holds the retained documents of one share behind three
//! indexes: by local index, by `(path, author)`, and per path sorted
//! newest-first. All writes funnel through a single writer lane, so the
//! sequence of accepted upserts forms a total order equal to the local-index
//! order, which is the order every follower and every remote peer observes.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::doc::{DocRecord, Document};
use crate::follower::{
    run_async_follower, AsyncFollowerShared, BlockingFollower, DocCallback, ErrorCallback,
    FollowerHandle,
};
use crate::keys::{Author, AuthorId};
use crate::peer::PeerId;
use crate::query::{HistoryMode, OrderBy, Query};
use crate::share::ShareAddress;
use crate::store::{DocDriver, DriverError};
use crate::validator::{self, ValidationError};

/// Period of the recurring expiry sweep.
pub const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Where an ingested document came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOrigin {
    /// Written locally through [`Replica::write`].
    Local,
    /// Ingested through upsert, optionally attributed to a sync partner.
    Sync(Option<PeerId>),
}

/// Result of an upsert.
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    /// The validator rejected the document.
    Invalid(ValidationError),
    /// A document by the same author at the same path wins over this one.
    Obsolete,
    /// This exact document (same overwrite key) is already stored.
    AlreadyHadIt,
    /// Stored, but another author has a newer document at this path.
    AcceptedButNotLatest(Arc<Document>),
    /// Stored, and it is now the path's latest document.
    AcceptedAndLatest(Arc<Document>),
}

impl UpsertOutcome {
    /// Whether the document was stored.
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            UpsertOutcome::AcceptedButNotLatest(_) | UpsertOutcome::AcceptedAndLatest(_)
        )
    }

    /// The stored document, if accepted.
    pub fn doc(&self) -> Option<&Arc<Document>> {
        match self {
            UpsertOutcome::AcceptedButNotLatest(doc) | UpsertOutcome::AcceptedAndLatest(doc) => {
                Some(doc)
            }
            _ => None,
        }
    }
}

/// Broadcast once per accepted upsert.
#[derive(Debug, Clone)]
pub struct WriteEvent {
    /// The stored document.
    pub doc: Arc<Document>,
    /// Where the document came from.
    pub origin: WriteOrigin,
    /// Whether the document is now the path's latest.
    pub is_latest: bool,
    /// The same author's displaced document at this path, if any.
    pub prev_same_author: Option<Arc<Document>>,
    /// The path's previous latest document; only set when `is_latest` and a
    /// prior latest existed (possibly by a different author).
    pub prev_latest: Option<Arc<Document>>,
}

/// Failure of a replica operation.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    /// The replica was closed.
    #[error("replica is closed")]
    Closed,
    /// The storage driver failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// A blocking follower callback failed during catch-up.
    #[error("follower callback failed")]
    FollowerCallback(#[source] anyhow::Error),
}

#[derive(Debug)]
struct ReplicaState {
    driver: Box<dyn DocDriver>,
    by_index: BTreeMap<u64, Arc<Document>>,
    by_path_author: HashMap<(String, AuthorId), Arc<Document>>,
    /// Per path, newest-first under the overwrite order.
    by_path: BTreeMap<String, Vec<Arc<Document>>>,
    highest_local_index: u64,
    closed: bool,
}

impl ReplicaState {
    fn insert_into_indexes(&mut self, doc: Arc<Document>) {
        self.by_index.insert(doc.local_index(), doc.clone());
        self.by_path_author.insert(
            (doc.path().to_string(), doc.author().clone()),
            doc.clone(),
        );
        let list = self.by_path.entry(doc.path().to_string()).or_default();
        let pos = list
            .iter()
            .position(|other| doc.overwrite_cmp(other) == CmpOrdering::Greater)
            .unwrap_or(list.len());
        list.insert(pos, doc);
    }

    fn remove_from_indexes(&mut self, doc: &Document) {
        self.by_index.remove(&doc.local_index());
        self.by_path_author
            .remove(&(doc.path().to_string(), doc.author().clone()));
        if let Some(list) = self.by_path.get_mut(doc.path()) {
            list.retain(|d| d.local_index() != doc.local_index());
            if list.is_empty() {
                self.by_path.remove(doc.path());
            }
        }
    }

    /// The path's newest retained document, expired or not.
    fn head_at_path(&self, path: &str) -> Option<&Arc<Document>> {
        self.by_path.get(path).and_then(|list| list.first())
    }

    /// The path's latest visible document.
    fn latest_visible(&self, path: &str, now: u64) -> Option<Arc<Document>> {
        self.by_path
            .get(path)?
            .iter()
            .find(|d| !d.is_expired(now))
            .cloned()
    }
}

#[derive(Debug)]
pub(crate) struct ReplicaShared {
    share: ShareAddress,
    clock: Arc<dyn Clock>,
    /// Serializes upserts and their fan-out; the state lock alone only
    /// protects the indexes.
    write_lane: Mutex<()>,
    state: RwLock<ReplicaState>,
    blocking_followers: RwLock<HashMap<u64, BlockingFollower>>,
    async_followers: RwLock<Vec<Weak<AsyncFollowerShared>>>,
    next_follower_id: AtomicU64,
    wake: Arc<Notify>,
    event_txs: RwLock<Vec<flume::Sender<WriteEvent>>>,
    sweep_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to a replica held by followers; upgrading fails once the replica
/// is dropped.
#[derive(Debug, Clone)]
pub(crate) struct WeakReplica(Weak<ReplicaShared>);

impl WeakReplica {
    pub(crate) fn upgrade(&self) -> Option<Replica> {
        self.0.upgrade().map(|inner| Replica { inner })
    }
}

/// The per-share document store. Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct Replica {
    inner: Arc<ReplicaShared>,
}

impl Replica {
    /// Open a replica over a driver with the system clock.
    pub fn new(share: ShareAddress, driver: Box<dyn DocDriver>) -> Result<Self, ReplicaError> {
        Self::with_clock(share, driver, Arc::new(SystemClock))
    }

    /// Open a replica over a driver with an injected clock.
    ///
    /// Seeds the indexes from the driver, purges already-expired documents,
    /// and (when running inside a tokio runtime) schedules the recurring
    /// expiry sweep.
    pub fn with_clock(
        share: ShareAddress,
        driver: Box<dyn DocDriver>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ReplicaError> {
        let highest_local_index = driver.max_local_index()?;
        let docs = driver.all_docs()?;

        let mut state = ReplicaState {
            driver,
            by_index: BTreeMap::new(),
            by_path_author: HashMap::new(),
            by_path: BTreeMap::new(),
            highest_local_index,
            closed: false,
        };

        let now = clock.now_micros();
        for doc in docs {
            if doc.is_expired(now) {
                state.driver.remove(doc.path(), doc.author())?;
            } else {
                state.insert_into_indexes(Arc::new(doc));
            }
        }

        let replica = Replica {
            inner: Arc::new(ReplicaShared {
                share,
                clock,
                write_lane: Mutex::new(()),
                state: RwLock::new(state),
                blocking_followers: RwLock::new(HashMap::new()),
                async_followers: RwLock::new(Vec::new()),
                next_follower_id: AtomicU64::new(0),
                wake: Arc::new(Notify::new()),
                event_txs: RwLock::new(Vec::new()),
                sweep_task: Mutex::new(None),
            }),
        };

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = replica.downgrade();
            let task = handle.spawn(async move {
                let mut interval = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let Some(replica) = weak.upgrade() else { break };
                    match replica.sweep_expired() {
                        Ok(0) => {}
                        Ok(n) => debug!(share = %replica.share(), swept = n, "expiry sweep"),
                        Err(_) => break,
                    }
                }
            });
            *replica.inner.sweep_task.lock() = Some(task);
        }

        Ok(replica)
    }

    pub(crate) fn downgrade(&self) -> WeakReplica {
        WeakReplica(Arc::downgrade(&self.inner))
    }

    /// The share this replica belongs to.
    pub fn share(&self) -> &ShareAddress {
        &self.inner.share
    }

    /// The highest local index assigned so far.
    pub fn highest_local_index(&self) -> Result<u64, ReplicaError> {
        let state = self.inner.state.read();
        if state.closed {
            return Err(ReplicaError::Closed);
        }
        Ok(state.highest_local_index)
    }

    /// Whether the replica has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.read().closed
    }

    /// Write a document at `path`, signed by `author`.
    ///
    /// The timestamp is chosen so the new document wins at its path even
    /// against other authors: `max(now, head.timestamp + 1)`.
    pub fn write(
        &self,
        author: &Author,
        path: &str,
        content: impl Into<Bytes>,
    ) -> Result<UpsertOutcome, ReplicaError> {
        self.write_record(author, path, content, None)
    }

    /// Write an ephemeral document that expires at `delete_after`.
    pub fn write_ephemeral(
        &self,
        author: &Author,
        path: &str,
        content: impl Into<Bytes>,
        delete_after: u64,
    ) -> Result<UpsertOutcome, ReplicaError> {
        self.write_record(author, path, content, Some(delete_after))
    }

    fn write_record(
        &self,
        author: &Author,
        path: &str,
        content: impl Into<Bytes>,
        delete_after: Option<u64>,
    ) -> Result<UpsertOutcome, ReplicaError> {
        let _lane = self.inner.write_lane.lock();
        let timestamp = {
            let state = self.inner.state.read();
            if state.closed {
                return Err(ReplicaError::Closed);
            }
            let floor = state
                .head_at_path(path)
                .map(|head| head.timestamp() + 1)
                .unwrap_or(0);
            self.inner.clock.now_micros().max(floor)
        };
        let mut record = DocRecord::new(path, author.id(), timestamp, content);
        if let Some(delete_after) = delete_after {
            record = record.with_delete_after(delete_after);
        }
        let doc = record.sign(author);
        self.ingest(doc, WriteOrigin::Local)
    }

    /// Ingest an already-signed document.
    pub fn upsert(&self, doc: Document) -> Result<UpsertOutcome, ReplicaError> {
        let _lane = self.inner.write_lane.lock();
        self.ingest(doc, WriteOrigin::Sync(None))
    }

    /// Ingest a document received from a sync partner.
    pub fn upsert_from_peer(
        &self,
        doc: Document,
        peer: PeerId,
    ) -> Result<UpsertOutcome, ReplicaError> {
        let _lane = self.inner.write_lane.lock();
        self.ingest(doc, WriteOrigin::Sync(Some(peer)))
    }

    /// Core upsert. The caller must hold the write lane.
    fn ingest(&self, mut doc: Document, origin: WriteOrigin) -> Result<UpsertOutcome, ReplicaError> {
        let now = self.inner.clock.now_micros();
        if let Err(err) = validator::check_document(&doc, now) {
            trace!(share = %self.inner.share, path = %doc.path(), %err, "rejected doc");
            return Ok(UpsertOutcome::Invalid(err));
        }

        let (outcome, event) = {
            let mut state = self.inner.state.write();
            if state.closed {
                return Err(ReplicaError::Closed);
            }

            let key = (doc.path().to_string(), doc.author().clone());
            if let Some(existing) = state.by_path_author.get(&key) {
                match doc.overwrite_cmp(existing) {
                    CmpOrdering::Less => return Ok(UpsertOutcome::Obsolete),
                    CmpOrdering::Equal => return Ok(UpsertOutcome::AlreadyHadIt),
                    CmpOrdering::Greater => {}
                }
            }

            let prev_latest = state.latest_visible(doc.path(), now);

            let index = state.highest_local_index + 1;
            doc.set_local_index(index);
            state.driver.apply(&doc)?;
            state.highest_local_index = index;

            let doc = Arc::new(doc);
            let prev_same_author = state.by_path_author.get(&key).cloned();
            if let Some(old) = &prev_same_author {
                state.remove_from_indexes(old);
            }
            state.insert_into_indexes(doc.clone());

            // An expired document from a partner is accepted so the local
            // index advances past it, then swept on the spot.
            if doc.is_expired(now) {
                state.remove_from_indexes(&doc);
                state.driver.remove(doc.path(), doc.author())?;
            }

            let is_latest = state
                .latest_visible(doc.path(), now)
                .map(|latest| latest.local_index() == doc.local_index())
                .unwrap_or(false);

            let event = WriteEvent {
                doc: doc.clone(),
                origin,
                is_latest,
                prev_same_author,
                prev_latest: if is_latest { prev_latest } else { None },
            };
            let outcome = if is_latest {
                UpsertOutcome::AcceptedAndLatest(doc)
            } else {
                UpsertOutcome::AcceptedButNotLatest(doc)
            };
            (outcome, event)
        };

        self.deliver_to_blocking_followers(&event.doc);
        self.broadcast_event(event);
        self.inner.wake.notify_waiters();

        Ok(outcome)
    }

    fn deliver_to_blocking_followers(&self, doc: &Arc<Document>) {
        let mut followers = self.inner.blocking_followers.write();
        for follower in followers.values_mut() {
            if doc.local_index() < follower.next_index.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(err) = (follower.callback)(doc.clone()) {
                match &follower.on_error {
                    Some(handler) => handler(err),
                    None => warn!(?err, "blocking follower callback failed"),
                }
            }
            follower
                .next_index
                .store(doc.local_index() + 1, Ordering::SeqCst);
        }
    }

    fn broadcast_event(&self, event: WriteEvent) {
        let mut txs = self.inner.event_txs.write();
        txs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Subscribe to write events. Each accepted upsert produces exactly one
    /// event on every subscribed channel.
    pub fn subscribe_events(&self) -> flume::Receiver<WriteEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner.event_txs.write().push(tx);
        rx
    }

    /// Register a blocking follower.
    ///
    /// Catch-up runs inline: the callback is driven for every retained
    /// document with `local_index >= next_index` before this returns, and
    /// inline on every later accepted upsert. A catch-up callback error
    /// aborts registration. The callback must not register followers itself.
    pub fn subscribe_blocking(
        &self,
        next_index: u64,
        mut callback: DocCallback,
        on_error: Option<ErrorCallback>,
    ) -> Result<FollowerHandle, ReplicaError> {
        let _lane = self.inner.write_lane.lock();
        let mut cursor = next_index;
        for doc in self.docs_from(cursor, usize::MAX)? {
            cursor = doc.local_index() + 1;
            callback(doc).map_err(ReplicaError::FollowerCallback)?;
        }

        let id = self.inner.next_follower_id.fetch_add(1, Ordering::SeqCst);
        let next_index = Arc::new(AtomicU64::new(cursor));
        self.inner.blocking_followers.write().insert(
            id,
            BlockingFollower {
                next_index: next_index.clone(),
                callback,
                on_error,
            },
        );
        Ok(FollowerHandle::blocking(id, next_index, self.downgrade()))
    }

    /// Register an async follower. Returns immediately; a cooperative task
    /// catches up in batches and then sleeps until woken by new upserts.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        next_index: u64,
        callback: DocCallback,
        on_error: Option<ErrorCallback>,
    ) -> Result<FollowerHandle, ReplicaError> {
        if self.is_closed() {
            return Err(ReplicaError::Closed);
        }
        let shared = Arc::new(AsyncFollowerShared::new(next_index));
        self.inner
            .async_followers
            .write()
            .push(Arc::downgrade(&shared));
        tokio::spawn(run_async_follower(
            self.downgrade(),
            self.inner.wake.clone(),
            shared.clone(),
            callback,
            on_error,
        ));
        Ok(FollowerHandle::task(shared))
    }

    pub(crate) fn has_blocking_follower(&self, id: u64) -> bool {
        self.inner.blocking_followers.read().contains_key(&id)
    }

    pub(crate) fn remove_blocking_follower(&self, id: u64) {
        self.inner.blocking_followers.write().remove(&id);
    }

    /// Retained, unexpired documents with `local_index >= start`, ascending,
    /// at most `limit`.
    pub fn docs_from(&self, start: u64, limit: usize) -> Result<Vec<Arc<Document>>, ReplicaError> {
        let state = self.inner.state.read();
        if state.closed {
            return Err(ReplicaError::Closed);
        }
        let now = self.inner.clock.now_micros();
        Ok(state
            .by_index
            .range(start..)
            .map(|(_, doc)| doc)
            .filter(|doc| !doc.is_expired(now))
            .take(limit)
            .cloned()
            .collect())
    }

    /// All retained documents in natural path order.
    pub fn get_all_docs(&self) -> Result<Vec<Arc<Document>>, ReplicaError> {
        self.query_docs(&Query::all())
    }

    /// The latest document per path, in path order.
    pub fn get_latest_docs(&self) -> Result<Vec<Arc<Document>>, ReplicaError> {
        self.query_docs(&Query::latest())
    }

    /// All retained documents at a path, newest first.
    pub fn get_all_docs_at_path(&self, path: &str) -> Result<Vec<Arc<Document>>, ReplicaError> {
        let state = self.inner.state.read();
        if state.closed {
            return Err(ReplicaError::Closed);
        }
        let now = self.inner.clock.now_micros();
        Ok(state
            .by_path
            .get(path)
            .map(|list| {
                list.iter()
                    .filter(|doc| !doc.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// The latest document at a path, if any.
    pub fn get_latest_doc_at_path(
        &self,
        path: &str,
    ) -> Result<Option<Arc<Document>>, ReplicaError> {
        let state = self.inner.state.read();
        if state.closed {
            return Err(ReplicaError::Closed);
        }
        let now = self.inner.clock.now_micros();
        Ok(state.latest_visible(path, now))
    }

    /// Run a query.
    pub fn query_docs(&self, query: &Query) -> Result<Vec<Arc<Document>>, ReplicaError> {
        let state = self.inner.state.read();
        if state.closed {
            return Err(ReplicaError::Closed);
        }
        let now = self.inner.clock.now_micros();

        let mut base: Vec<Arc<Document>> = if query.order_by.is_path_axis() {
            let mut docs = Vec::new();
            for list in state.by_path.values() {
                match query.history {
                    HistoryMode::Latest => {
                        if let Some(doc) = list.iter().find(|d| !d.is_expired(now)) {
                            docs.push(doc.clone());
                        }
                    }
                    HistoryMode::All => {
                        docs.extend(list.iter().filter(|d| !d.is_expired(now)).cloned());
                    }
                }
            }
            docs
        } else {
            state
                .by_index
                .values()
                .filter(|doc| !doc.is_expired(now))
                .filter(|doc| match query.history {
                    HistoryMode::All => true,
                    HistoryMode::Latest => state
                        .latest_visible(doc.path(), now)
                        .map(|latest| latest.local_index() == doc.local_index())
                        .unwrap_or(false),
                })
                .cloned()
                .collect()
        };
        if query.order_by.is_descending() {
            base.reverse();
        }

        Ok(base
            .into_iter()
            .filter(|doc| query.past_start(doc))
            .filter(|doc| query.filter.matches(doc))
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Unique paths of the documents matching a query, ascending (reversed
    /// for a path-descending query).
    pub fn query_paths(&self, query: &Query) -> Result<Vec<String>, ReplicaError> {
        let docs = self.query_docs(query)?;
        let unique: BTreeSet<String> = docs.iter().map(|d| d.path().to_string()).collect();
        let mut paths: Vec<String> = unique.into_iter().collect();
        if query.order_by == OrderBy::PathDesc {
            paths.reverse();
        }
        Ok(paths)
    }

    /// Unique authors of the documents matching a query, ascending.
    pub fn query_authors(&self, query: &Query) -> Result<Vec<AuthorId>, ReplicaError> {
        let docs = self.query_docs(query)?;
        let unique: BTreeSet<AuthorId> = docs.iter().map(|d| d.author().clone()).collect();
        Ok(unique.into_iter().collect())
    }

    /// Physically delete expired documents. Returns how many were removed.
    pub fn sweep_expired(&self) -> Result<usize, ReplicaError> {
        let _lane = self.inner.write_lane.lock();
        let mut state = self.inner.state.write();
        if state.closed {
            return Err(ReplicaError::Closed);
        }
        let now = self.inner.clock.now_micros();
        let expired: Vec<Arc<Document>> = state
            .by_index
            .values()
            .filter(|doc| doc.is_expired(now))
            .cloned()
            .collect();
        for doc in &expired {
            state.driver.remove(doc.path(), doc.author())?;
            state.remove_from_indexes(doc);
        }
        Ok(expired.len())
    }

    /// Close the replica: stop the sweep task, quit followers, close the
    /// driver. A second close is an error.
    pub fn close(&self) -> Result<(), ReplicaError> {
        let _lane = self.inner.write_lane.lock();
        {
            let mut state = self.inner.state.write();
            if state.closed {
                return Err(ReplicaError::Closed);
            }
            state.closed = true;
            state.driver.close()?;
            state.by_index.clear();
            state.by_path_author.clear();
            state.by_path.clear();
        }
        if let Some(task) = self.inner.sweep_task.lock().take() {
            task.abort();
        }
        self.inner.blocking_followers.write().clear();
        for follower in self.inner.async_followers.write().drain(..) {
            if let Some(follower) = follower.upgrade() {
                follower.request_quit();
            }
        }
        self.inner.event_txs.write().clear();
        self.inner.wake.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryDriver;

    const NOW: u64 = 1_700_000_000_000_000;

    fn test_share() -> ShareAddress {
        ShareAddress::new("+gardening.abc234").unwrap()
    }

    fn test_replica(clock: Arc<dyn Clock>) -> Replica {
        Replica::with_clock(test_share(), Box::new(MemoryDriver::default()), clock).unwrap()
    }

    #[test]
    fn test_overwrite_by_same_author() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let replica = test_replica(Arc::new(ManualClock::new(NOW)));

        let outcome = replica.write(&author, "/a", "x").unwrap();
        assert!(matches!(outcome, UpsertOutcome::AcceptedAndLatest(_)));
        assert_eq!(outcome.doc().unwrap().local_index(), 1);

        let outcome = replica.write(&author, "/a", "y").unwrap();
        assert!(matches!(outcome, UpsertOutcome::AcceptedAndLatest(_)));
        assert_eq!(outcome.doc().unwrap().local_index(), 2);

        let latest = replica.get_latest_doc_at_path("/a").unwrap().unwrap();
        assert_eq!(latest.content_text(), Some("y"));
        assert_eq!(replica.get_all_docs().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_writers_signature_tiebreak() {
        let mut rng = rand::thread_rng();
        let a = Author::new(&mut rng, "alfa").unwrap();
        let b = Author::new(&mut rng, "beta").unwrap();
        let replica = test_replica(Arc::new(ManualClock::new(NOW)));

        let doc_a = DocRecord::new("/p", a.id(), NOW, "from a").sign(&a);
        let doc_b = DocRecord::new("/p", b.id(), NOW, "from b").sign(&b);
        let winner_is_b = doc_b.signature().to_bytes() > doc_a.signature().to_bytes();

        assert!(replica.upsert(doc_a).unwrap().is_accepted());
        assert!(replica.upsert(doc_b).unwrap().is_accepted());

        let latest = replica.get_latest_doc_at_path("/p").unwrap().unwrap();
        let expected = if winner_is_b { &b } else { &a };
        assert_eq!(latest.author(), &expected.id());
        assert_eq!(replica.get_all_docs().unwrap().len(), 2);
    }

    #[test]
    fn test_obsolete_rejection() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let replica = test_replica(clock);

        let newer = DocRecord::new("/q", author.id(), NOW, "new").sign(&author);
        assert!(replica.upsert(newer).unwrap().is_accepted());
        assert_eq!(replica.highest_local_index().unwrap(), 1);

        let older = DocRecord::new("/q", author.id(), NOW - 50, "old").sign(&author);
        assert!(matches!(
            replica.upsert(older).unwrap(),
            UpsertOutcome::Obsolete
        ));
        assert_eq!(replica.highest_local_index().unwrap(), 1);
    }

    #[test]
    fn test_already_had_it() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let replica = test_replica(Arc::new(ManualClock::new(NOW)));

        let doc = DocRecord::new("/q", author.id(), NOW, "x").sign(&author);
        assert!(replica.upsert(doc.clone()).unwrap().is_accepted());
        assert!(matches!(
            replica.upsert(doc).unwrap(),
            UpsertOutcome::AlreadyHadIt
        ));
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let replica = test_replica(Arc::new(ManualClock::new(NOW)));

        let good = DocRecord::new("/p", author.id(), NOW, "real").sign(&author);
        let forged = Document::from_parts(
            DocRecord::new("/p", author.id(), NOW, "fake"),
            *good.signature(),
            0,
        );
        assert!(matches!(
            replica.upsert(forged).unwrap(),
            UpsertOutcome::Invalid(ValidationError::Signature)
        ));
        assert_eq!(replica.highest_local_index().unwrap(), 0);
    }

    #[test]
    fn test_local_index_monotonic_and_event_per_accept() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let replica = test_replica(Arc::new(ManualClock::new(NOW)));
        let events = replica.subscribe_events();

        for i in 0..5 {
            let outcome = replica.write(&author, &format!("/doc/{i}"), "x").unwrap();
            assert_eq!(outcome.doc().unwrap().local_index(), i + 1);
        }
        // Replacing a doc abandons its index but keeps the sequence rising.
        let outcome = replica.write(&author, "/doc/0", "y").unwrap();
        assert_eq!(outcome.doc().unwrap().local_index(), 6);

        let indexes: Vec<u64> = events.drain().map(|e| e.doc.local_index()).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_write_event_fields() {
        let mut rng = rand::thread_rng();
        let a = Author::new(&mut rng, "alfa").unwrap();
        let b = Author::new(&mut rng, "beta").unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let replica = test_replica(clock.clone());
        let events = replica.subscribe_events();

        replica.write(&a, "/p", "first").unwrap();
        let ev = events.recv().unwrap();
        assert!(ev.is_latest);
        assert!(ev.prev_same_author.is_none());
        assert!(ev.prev_latest.is_none());
        assert_eq!(ev.origin, WriteOrigin::Local);

        clock.advance(10);
        replica.write(&b, "/p", "second").unwrap();
        let ev = events.recv().unwrap();
        assert!(ev.is_latest);
        assert!(ev.prev_same_author.is_none());
        assert_eq!(ev.prev_latest.unwrap().author(), &a.id());

        clock.advance(10);
        replica.write(&a, "/p", "third").unwrap();
        let ev = events.recv().unwrap();
        assert!(ev.is_latest);
        assert_eq!(ev.prev_same_author.unwrap().author(), &a.id());
        assert_eq!(ev.prev_latest.unwrap().author(), &b.id());
    }

    #[test]
    fn test_latest_docs_one_per_path() {
        let mut rng = rand::thread_rng();
        let a = Author::new(&mut rng, "alfa").unwrap();
        let b = Author::new(&mut rng, "beta").unwrap();
        let replica = test_replica(Arc::new(ManualClock::new(NOW)));

        replica.write(&a, "/x", "1").unwrap();
        replica.write(&b, "/x", "2").unwrap();
        replica.write(&a, "/y", "3").unwrap();

        let latest = replica.get_latest_docs().unwrap();
        assert_eq!(latest.len(), 2);
        let paths: Vec<&str> = latest.iter().map(|d| d.path()).collect();
        assert_eq!(paths, vec!["/x", "/y"]);
        assert_eq!(latest[0].content_text(), Some("2"));
        assert_eq!(replica.get_all_docs().unwrap().len(), 3);
    }

    #[test]
    fn test_expiry_sweep_and_masking() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let replica = test_replica(clock.clone());

        replica
            .write_ephemeral(&author, "/chat/!hello", "hi", NOW + 1_000)
            .unwrap();
        replica.write(&author, "/keep", "kept").unwrap();
        assert_eq!(replica.get_all_docs().unwrap().len(), 2);

        // Past expiry the doc is invisible before it is physically removed.
        clock.advance(2_000);
        assert_eq!(replica.get_all_docs().unwrap().len(), 1);
        assert!(replica
            .get_latest_doc_at_path("/chat/!hello")
            .unwrap()
            .is_none());

        assert_eq!(replica.sweep_expired().unwrap(), 1);
        assert_eq!(replica.sweep_expired().unwrap(), 0);
    }

    #[test]
    fn test_expired_doc_from_partner_accepted_and_swept() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let replica = test_replica(clock);

        let doc = DocRecord::new("/chat/!old", author.id(), NOW - 2_000, "gone")
            .with_delete_after(NOW - 1_000)
            .sign(&author);
        let outcome = replica.upsert(doc).unwrap();
        assert!(outcome.is_accepted());
        // Index advanced, but the doc is not retained.
        assert_eq!(replica.highest_local_index().unwrap(), 1);
        assert!(replica.get_all_docs().unwrap().is_empty());
    }

    #[test]
    fn test_close_semantics() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let replica = test_replica(Arc::new(ManualClock::new(NOW)));

        replica.write(&author, "/a", "x").unwrap();
        replica.close().unwrap();
        assert!(matches!(
            replica.write(&author, "/a", "y"),
            Err(ReplicaError::Closed)
        ));
        assert!(matches!(replica.get_all_docs(), Err(ReplicaError::Closed)));
        assert!(matches!(replica.close(), Err(ReplicaError::Closed)));
    }

    #[test]
    fn test_query_order_and_start_at() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let replica = test_replica(Arc::new(ManualClock::new(NOW)));

        for path in ["/c", "/a", "/b"] {
            replica.write(&author, path, "x").unwrap();
        }

        let by_path = replica.query_docs(&Query::all()).unwrap();
        let paths: Vec<&str> = by_path.iter().map(|d| d.path()).collect();
        assert_eq!(paths, vec!["/a", "/b", "/c"]);

        let by_index = replica
            .query_docs(&Query::all().order_by(OrderBy::LocalIndexAsc))
            .unwrap();
        let indexes: Vec<u64> = by_index.iter().map(|d| d.local_index()).collect();
        assert_eq!(indexes, vec![1, 2, 3]);

        let desc = replica
            .query_docs(&Query::all().order_by(OrderBy::LocalIndexDesc))
            .unwrap();
        let indexes: Vec<u64> = desc.iter().map(|d| d.local_index()).collect();
        assert_eq!(indexes, vec![3, 2, 1]);

        // Inclusive lower bound on the matching axis.
        let from_b = replica
            .query_docs(&Query::all().start_at(crate::query::StartAt::Path("/b".into())))
            .unwrap();
        let paths: Vec<&str> = from_b.iter().map(|d| d.path()).collect();
        assert_eq!(paths, vec!["/b", "/c"]);

        // Inclusive upper bound for a descending order.
        let down_from_2 = replica
            .query_docs(
                &Query::all()
                    .order_by(OrderBy::LocalIndexDesc)
                    .start_at(crate::query::StartAt::LocalIndex(2)),
            )
            .unwrap();
        let indexes: Vec<u64> = down_from_2.iter().map(|d| d.local_index()).collect();
        assert_eq!(indexes, vec![2, 1]);

        let limited = replica.query_docs(&Query::all().limit(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_query_filters_and_history() {
        let mut rng = rand::thread_rng();
        let a = Author::new(&mut rng, "alfa").unwrap();
        let b = Author::new(&mut rng, "beta").unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let replica = test_replica(clock.clone());

        replica.write(&a, "/blog/one.md", "first post").unwrap();
        clock.advance(10);
        replica.write(&b, "/blog/one.md", "edited post").unwrap();
        replica.write(&a, "/blog/two.txt", "short").unwrap();

        // Latest hides the overwritten version, All shows it.
        assert_eq!(replica.query_docs(&Query::latest()).unwrap().len(), 2);
        assert_eq!(replica.query_docs(&Query::all()).unwrap().len(), 3);

        let md_only = replica
            .query_docs(&Query::all().filter(crate::query::Filter {
                path_ends_with: Some(".md".into()),
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(md_only.len(), 2);

        let by_author = replica
            .query_docs(&Query::all().filter(crate::query::Filter {
                author: Some(a.id()),
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(by_author.len(), 2);

        let long_docs = replica
            .query_docs(&Query::all().filter(crate::query::Filter {
                content_length_gt: Some(5),
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(long_docs.len(), 2);
    }

    #[test]
    fn test_query_paths_matches_query_docs() {
        let mut rng = rand::thread_rng();
        let a = Author::new(&mut rng, "alfa").unwrap();
        let b = Author::new(&mut rng, "beta").unwrap();
        let replica = test_replica(Arc::new(ManualClock::new(NOW)));

        for path in ["/x", "/y", "/z"] {
            replica.write(&a, path, "1").unwrap();
            replica.write(&b, path, "2").unwrap();
        }

        for query in [
            Query::all(),
            Query::latest(),
            Query::all().order_by(OrderBy::PathDesc),
            Query::all().limit(3),
        ] {
            let docs = replica.query_docs(&query).unwrap();
            let mut expected: Vec<String> = docs
                .iter()
                .map(|d| d.path().to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if query.order_by == OrderBy::PathDesc {
                expected.reverse();
            }
            assert_eq!(replica.query_paths(&query).unwrap(), expected);
        }

        let authors = replica.query_authors(&Query::all()).unwrap();
        let mut expected = vec![a.id(), b.id()];
        expected.sort();
        assert_eq!(authors, expected);
    }

    #[test]
    fn test_recovery_from_driver() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));

        let mut driver = MemoryDriver::default();
        for (i, path) in ["/a", "/b"].iter().enumerate() {
            let mut doc = DocRecord::new(*path, author.id(), NOW, "x").sign(&author);
            doc.set_local_index(i as u64 + 1);
            driver.apply(&doc).unwrap();
        }

        let replica =
            Replica::with_clock(test_share(), Box::new(driver), clock).unwrap();
        assert_eq!(replica.highest_local_index().unwrap(), 2);
        assert_eq!(replica.get_all_docs().unwrap().len(), 2);

        // New writes continue the recovered sequence.
        let outcome = replica.write(&author, "/c", "y").unwrap();
        assert_eq!(outcome.doc().unwrap().local_index(), 3);
    }
}

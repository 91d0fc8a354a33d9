//! Share sync: coordinator, per-share sessions, and the RPC surface.
//!
//! A [`SyncCoordinator`] sits on one side of an established duplex
//! connection. It discovers the shares both peers hold via a salted
//! handshake, then runs one [`SessionStatus`]-reporting pull loop per
//! common share until closed. Both peers run symmetric coordinators; each
//! direction pulls independently, with at most one in-flight batch per
//! session.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{watch, Notify},
    task::JoinSet,
};
use tracing::{debug, instrument, warn};

use crate::peer::{Peer, PeerId};
use crate::replica::Replica;
use crate::share::ShareAddress;

mod rpc;

pub use rpc::{Notice, Request, RequestHandler, Response, RpcConnection, RpcError, Salt};

/// Maximum number of documents pulled per batch.
pub const DOCS_PULL_LIMIT: u32 = 10;

/// Sync tuning knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often a caught-up session re-polls the partner.
    pub poll_interval: Duration,
    /// How long a session waits after a network error before retrying.
    pub backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            poll_interval: Duration::from_secs(1),
            backoff: Duration::from_secs(1),
        }
    }
}

/// Live state of one share's pull direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    /// Documents accepted from the partner during this run.
    pub pulled: u64,
    /// Whether we have everything the partner last advertised.
    pub caught_up: bool,
    /// Whether the partner reports having pulled everything we hold.
    pub partner_caught_up: bool,
    /// The partner's current highest local index.
    pub partner_highest_index: u64,
    /// Our replica's highest local index.
    pub local_highest_index: u64,
    /// Error marker from the last failed round, if any.
    pub error: Option<String>,
}

/// Status of every session on a connection, keyed by share.
pub type StatusMap = BTreeMap<ShareAddress, SessionStatus>;

/// Failure of a sync operation.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The coordinator was closed.
    #[error("sync coordinator is closed")]
    Closed,
    /// An RPC failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Serves the partner's requests against the local peer, and tracks how far
/// the partner reports having pulled from us.
#[derive(Debug)]
struct PeerHandler {
    peer: Peer,
    /// Shares negotiated as common on this connection.
    common: Mutex<BTreeSet<ShareAddress>>,
    /// Per share, the highest of our local indexes the partner has ingested.
    partner_progress: Mutex<BTreeMap<ShareAddress, u64>>,
}

impl PeerHandler {
    fn new(peer: Peer) -> Self {
        PeerHandler {
            peer,
            common: Mutex::new(BTreeSet::new()),
            partner_progress: Mutex::new(BTreeMap::new()),
        }
    }

    fn set_common(&self, shares: &[ShareAddress]) {
        let mut common = self.common.lock();
        common.clear();
        common.extend(shares.iter().cloned());
        let mut progress = self.partner_progress.lock();
        progress.retain(|share, _| common.contains(share));
    }

    fn partner_progress(&self, share: &ShareAddress) -> u64 {
        self.partner_progress
            .lock()
            .get(share)
            .copied()
            .unwrap_or(0)
    }
}

impl RequestHandler for PeerHandler {
    fn handle(&self, request: Request) -> Response {
        match request {
            Request::SaltedHandshake { salt } => Response::SaltedHandshake {
                peer_id: self.peer.peer_id(),
                salted_shares: self
                    .peer
                    .shares()
                    .iter()
                    .map(|share| share.salted_hash(&salt))
                    .collect(),
            },
            Request::AllShareStates => {
                let common = self.common.lock().clone();
                let mut states = BTreeMap::new();
                for share in common {
                    if let Some(replica) = self.peer.replica(&share) {
                        if let Ok(highest) = replica.highest_local_index() {
                            states.insert(share, highest);
                        }
                    }
                }
                Response::AllShareStates { states }
            }
            Request::GetShareState { share, other_index } => {
                let Some(replica) = self.peer.replica(&share) else {
                    return Response::Error {
                        message: format!("unknown share {share}"),
                    };
                };
                match replica.highest_local_index() {
                    Ok(highest_local_index) => {
                        let mut progress = self.partner_progress.lock();
                        let entry = progress.entry(share).or_insert(0);
                        *entry = (*entry).max(other_index);
                        Response::ShareState {
                            highest_local_index,
                        }
                    }
                    Err(err) => Response::Error {
                        message: err.to_string(),
                    },
                }
            }
            Request::GetDocs {
                share,
                from_index,
                limit,
            } => {
                let Some(replica) = self.peer.replica(&share) else {
                    return Response::Error {
                        message: format!("unknown share {share}"),
                    };
                };
                let limit = limit.min(DOCS_PULL_LIMIT) as usize;
                match replica.docs_from(from_index + 1, limit) {
                    Ok(docs) => Response::Docs {
                        docs: docs.iter().map(|doc| (**doc).clone()).collect(),
                    },
                    Err(err) => Response::Error {
                        message: err.to_string(),
                    },
                }
            }
        }
    }
}

#[derive(Debug)]
struct CoordinatorInner {
    peer: Peer,
    conn: RpcConnection,
    handler: Arc<PeerHandler>,
    config: SyncConfig,
    status_tx: watch::Sender<StatusMap>,
    sessions: Mutex<JoinSet<()>>,
    aux_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    partner_id: Mutex<Option<PeerId>>,
    common_shares: Mutex<Vec<ShareAddress>>,
    registration: u64,
    cancel: Notify,
    cancelled: AtomicBool,
    closed: AtomicBool,
}

/// Drives sync for one connection. Cheap to clone.
///
/// Call [`SyncCoordinator::start`] to negotiate common shares and spawn the
/// per-share sessions, and [`SyncCoordinator::close`] when done; sessions
/// otherwise keep polling forever.
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    /// Build a coordinator over an established duplex stream.
    ///
    /// The stream immediately begins serving the partner's requests against
    /// `peer`. Must be called from within a tokio runtime.
    pub fn new<IO>(peer: Peer, io: IO, config: SyncConfig) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let handler = Arc::new(PeerHandler::new(peer.clone()));
        let conn = RpcConnection::spawn(io, handler.clone());
        let (status_tx, status_rx) = watch::channel(StatusMap::new());
        let registration = peer.register_syncer(status_rx);

        SyncCoordinator {
            inner: Arc::new(CoordinatorInner {
                peer,
                conn,
                handler,
                config,
                status_tx,
                sessions: Mutex::new(JoinSet::new()),
                aux_tasks: Mutex::new(Vec::new()),
                partner_id: Mutex::new(None),
                common_shares: Mutex::new(Vec::new()),
                registration,
                cancel: Notify::new(),
                cancelled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Negotiate common shares and spawn one session per share. Also starts
    /// watching the local replica set, re-negotiating when it changes.
    pub async fn start(&self) -> Result<Vec<ShareAddress>, SyncError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        let common = self.restart_sessions().await?;

        let this = self.clone();
        let watcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.inner.peer.shares_changed() => {}
                    _ = this.inner.cancel.notified() => break,
                }
                if this.inner.cancelled.load(Ordering::SeqCst) {
                    break;
                }
                debug!("local shares changed, re-negotiating");
                if let Err(err) = this.restart_sessions().await {
                    warn!(?err, "re-negotiation failed");
                }
            }
        });
        self.inner.aux_tasks.lock().push(watcher);

        Ok(common)
    }

    /// Abort running sessions, redo the handshake, spawn fresh sessions.
    async fn restart_sessions(&self) -> Result<Vec<ShareAddress>, SyncError> {
        self.inner.sessions.lock().abort_all();

        let common = self.negotiate().await?;
        let partner = (*self.inner.partner_id.lock()).expect("set during negotiate");

        // Prime partner indexes in one call where the partner already
        // negotiated; sessions keep them current from then on.
        if let Ok(Response::AllShareStates { states }) =
            self.inner.conn.call(Request::AllShareStates).await
        {
            self.inner.status_tx.send_modify(|map| {
                for (share, highest) in states {
                    if let Some(status) = map.get_mut(&share) {
                        status.partner_highest_index = highest;
                    }
                }
            });
        }

        let mut sessions = self.inner.sessions.lock();
        for share in &common {
            let Some(replica) = self.inner.peer.replica(share) else {
                continue;
            };
            sessions.spawn(run_session(
                self.clone(),
                share.clone(),
                replica.clone(),
                partner,
            ));
            sessions.spawn(run_notifier(
                self.inner.conn.clone(),
                share.clone(),
                replica,
            ));
        }
        Ok(common)
    }

    /// Exchange salted share hashes and intersect.
    async fn negotiate(&self) -> Result<Vec<ShareAddress>, SyncError> {
        let salt: Salt = rand::random();
        let response = self
            .inner
            .conn
            .call(Request::SaltedHandshake { salt })
            .await?;
        let Response::SaltedHandshake {
            peer_id,
            salted_shares,
        } = response
        else {
            return Err(RpcError::UnexpectedResponse.into());
        };

        let partner_hashes: BTreeSet<[u8; 32]> = salted_shares.into_iter().collect();
        let common: Vec<ShareAddress> = self
            .inner
            .peer
            .shares()
            .into_iter()
            .filter(|share| partner_hashes.contains(&share.salted_hash(&salt)))
            .collect();

        debug!(
            partner = %peer_id.fmt_short(),
            common = common.len(),
            "handshake complete"
        );

        *self.inner.partner_id.lock() = Some(peer_id);
        *self.inner.common_shares.lock() = common.clone();
        self.inner.handler.set_common(&common);
        self.inner.status_tx.send_modify(|map| {
            map.clear();
            for share in &common {
                map.insert(share.clone(), SessionStatus::default());
            }
        });

        Ok(common)
    }

    /// The partner's peer id, known after the handshake.
    pub fn partner_id(&self) -> Option<PeerId> {
        *self.inner.partner_id.lock()
    }

    /// The shares both peers hold, as of the last handshake.
    pub fn common_shares(&self) -> Vec<ShareAddress> {
        self.inner.common_shares.lock().clone()
    }

    /// Subscribe to the per-share status map.
    pub fn subscribe_status(&self) -> watch::Receiver<StatusMap> {
        self.inner.status_tx.subscribe()
    }

    /// Wait until every common share reports caught-up in both directions
    /// within the same poll round.
    pub async fn sync_until_caught_up(&self) -> Result<(), SyncError> {
        let mut status = self.subscribe_status();
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(SyncError::Closed);
            }
            {
                let map = status.borrow_and_update();
                if map
                    .values()
                    .all(|s| s.caught_up && s.partner_caught_up && s.error.is_none())
                {
                    return Ok(());
                }
            }
            status.changed().await.map_err(|_| SyncError::Closed)?;
        }
    }

    /// Stop all sessions and release the connection. A second close is an
    /// error.
    pub fn close(&self) -> Result<(), SyncError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.cancel.notify_waiters();
        self.inner.sessions.lock().abort_all();
        for task in self.inner.aux_tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.conn.close();
        self.inner.peer.unregister_syncer(self.inner.registration);
        Ok(())
    }

    fn push_status(&self, share: &ShareAddress, status: SessionStatus) {
        self.inner.status_tx.send_modify(|map| {
            map.insert(share.clone(), status);
        });
    }
}

/// Pull loop for one share: poll the partner's head, pull batches of at most
/// [`DOCS_PULL_LIMIT`] documents while behind, sleep while caught up.
#[instrument(skip_all, fields(share = %share.name()))]
async fn run_session(
    this: SyncCoordinator,
    share: ShareAddress,
    replica: Replica,
    partner: PeerId,
) {
    let mut status = SessionStatus::default();
    let mut partner_max: u64 = 0;
    let mut notices = this.inner.conn.notices();

    loop {
        if this.inner.cancelled.load(Ordering::SeqCst) {
            break;
        }
        let Ok(local_highest) = replica.highest_local_index() else {
            break;
        };
        status.local_highest_index = local_highest;
        status.partner_caught_up = this.inner.handler.partner_progress(&share) >= local_highest;

        let partner_highest = match this
            .inner
            .conn
            .call(Request::GetShareState {
                share: share.clone(),
                other_index: partner_max,
            })
            .await
        {
            Ok(Response::ShareState {
                highest_local_index,
            }) => highest_local_index,
            Ok(_) | Err(RpcError::UnexpectedResponse) => {
                status.error = Some("unexpected response".into());
                status.caught_up = false;
                this.push_status(&share, status.clone());
                tokio::time::sleep(this.inner.config.backoff).await;
                continue;
            }
            Err(err) => {
                debug!(?err, "poll failed, backing off");
                status.error = Some(err.to_string());
                status.caught_up = false;
                this.push_status(&share, status.clone());
                tokio::time::sleep(this.inner.config.backoff).await;
                continue;
            }
        };
        status.partner_highest_index = partner_highest;
        status.error = None;

        if partner_max >= partner_highest {
            status.caught_up = true;
            this.push_status(&share, status.clone());
            // Wait for the partner to advertise news or for the poll
            // interval to elapse; any notice just triggers a re-poll.
            tokio::select! {
                _ = this.inner.cancel.notified() => break,
                _ = tokio::time::sleep(this.inner.config.poll_interval) => {}
                _ = notices.recv() => {}
            }
            continue;
        }

        let docs = match this
            .inner
            .conn
            .call(Request::GetDocs {
                share: share.clone(),
                from_index: partner_max,
                limit: DOCS_PULL_LIMIT,
            })
            .await
        {
            Ok(Response::Docs { docs }) => docs,
            Ok(_) => {
                status.error = Some("unexpected response".into());
                status.caught_up = false;
                this.push_status(&share, status.clone());
                tokio::time::sleep(this.inner.config.backoff).await;
                continue;
            }
            Err(err) => {
                debug!(?err, "pull failed, backing off");
                status.error = Some(err.to_string());
                status.caught_up = false;
                this.push_status(&share, status.clone());
                tokio::time::sleep(this.inner.config.backoff).await;
                continue;
            }
        };

        for doc in docs {
            partner_max = partner_max.max(doc.local_index());
            match replica.upsert_from_peer(doc, partner) {
                Ok(outcome) => {
                    if outcome.is_accepted() {
                        status.pulled += 1;
                    } else if let crate::replica::UpsertOutcome::Invalid(err) = outcome {
                        // A bad document is logged and skipped; the session
                        // moves on to the next one.
                        warn!(%err, "partner sent invalid doc");
                    }
                }
                Err(err) => {
                    status.error = Some(err.to_string());
                    break;
                }
            }
        }
        status.caught_up = false;
        this.push_status(&share, status.clone());
    }
}

/// Push a notice to the partner whenever the local replica accepts a doc,
/// so its caught-up sessions wake without waiting out the poll interval.
async fn run_notifier(conn: RpcConnection, share: ShareAddress, replica: Replica) {
    let events = replica.subscribe_events();
    while let Ok(_event) = events.recv_async().await {
        let Ok(highest_local_index) = replica.highest_local_index() else {
            break;
        };
        if conn
            .notify(Notice::ShareUpdated {
                share: share.clone(),
                highest_local_index,
            })
            .await
            .is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Author;
    use crate::store::memory::MemoryDriver;

    fn share(addr: &str) -> ShareAddress {
        ShareAddress::new(addr).unwrap()
    }

    fn peer_with_shares(addrs: &[&str]) -> Peer {
        let peer = Peer::new();
        for addr in addrs {
            let replica =
                Replica::new(share(addr), Box::new(MemoryDriver::default())).unwrap();
            peer.add_replica(replica);
        }
        peer
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            poll_interval: Duration::from_millis(20),
            backoff: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_handshake_finds_common_shares() {
        let p = peer_with_shares(&["+alpha.aaaaaa", "+beta.bbbbbb", "+delta.dddddd"]);
        let q = peer_with_shares(&["+alpha.aaaaaa", "+gamma.cccccc", "+delta.dddddd"]);

        let (io_p, io_q) = tokio::io::duplex(4096);
        let cp = SyncCoordinator::new(p, io_p, fast_config());
        let cq = SyncCoordinator::new(q, io_q, fast_config());

        let common_p = cp.start().await.unwrap();
        let common_q = cq.start().await.unwrap();

        let expected = vec![share("+alpha.aaaaaa"), share("+delta.dddddd")];
        assert_eq!(common_p, expected);
        assert_eq!(common_q, expected);
        assert_eq!(cp.partner_id(), Some(cq.inner.peer.peer_id()));

        cp.close().unwrap();
        cq.close().unwrap();
    }

    #[tokio::test]
    async fn test_pull_converges_one_direction() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();

        let p = peer_with_shares(&["+alpha.aaaaaa"]);
        let q = peer_with_shares(&["+alpha.aaaaaa"]);

        let source = q.replica(&share("+alpha.aaaaaa")).unwrap();
        for i in 0..25 {
            source
                .write(&author, &format!("/doc/{i:02}"), format!("v{i}"))
                .unwrap();
        }

        let (io_p, io_q) = tokio::io::duplex(4096);
        let cp = SyncCoordinator::new(p.clone(), io_p, fast_config());
        let cq = SyncCoordinator::new(q, io_q, fast_config());
        cp.start().await.unwrap();
        cq.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), cp.sync_until_caught_up())
            .await
            .expect("converges")
            .unwrap();

        let sink = p.replica(&share("+alpha.aaaaaa")).unwrap();
        assert_eq!(sink.get_all_docs().unwrap().len(), 25);

        let status = cp.subscribe_status().borrow().clone();
        let s = status.get(&share("+alpha.aaaaaa")).unwrap();
        assert!(s.caught_up);
        assert_eq!(s.pulled, 25);

        cp.close().unwrap();
        cq.close().unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_once() {
        let p = peer_with_shares(&[]);
        let q = peer_with_shares(&[]);
        let (io_p, io_q) = tokio::io::duplex(4096);
        let cp = SyncCoordinator::new(p, io_p, fast_config());
        let _cq = SyncCoordinator::new(q, io_q, fast_config());

        cp.close().unwrap();
        assert!(matches!(cp.close(), Err(SyncError::Closed)));
    }

    /// A partner that advertises one share and serves a forged document.
    struct ForgingPartner {
        peer_id: PeerId,
        share: ShareAddress,
        forged: crate::doc::Document,
    }

    impl RequestHandler for ForgingPartner {
        fn handle(&self, request: Request) -> Response {
            match request {
                Request::SaltedHandshake { salt } => Response::SaltedHandshake {
                    peer_id: self.peer_id,
                    salted_shares: vec![self.share.salted_hash(&salt)],
                },
                Request::AllShareStates => Response::AllShareStates {
                    states: BTreeMap::new(),
                },
                Request::GetShareState { .. } => Response::ShareState {
                    highest_local_index: 1,
                },
                Request::GetDocs { .. } => Response::Docs {
                    docs: vec![self.forged.clone()],
                },
            }
        }
    }

    #[tokio::test]
    async fn test_forged_doc_skipped_session_continues() {
        use crate::clock::{Clock, SystemClock};
        use crate::doc::{DocRecord, Document};

        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let now = SystemClock.now_micros();

        let good = DocRecord::new("/real", author.id(), now, "real").sign(&author);
        let forged = Document::from_parts(
            DocRecord::new("/real", author.id(), now, "fake"),
            *good.signature(),
            1,
        );

        let p = peer_with_shares(&["+alpha.aaaaaa"]);
        let (io_p, io_q) = tokio::io::duplex(4096);
        let cp = SyncCoordinator::new(p.clone(), io_p, fast_config());
        let _partner = RpcConnection::spawn(
            io_q,
            Arc::new(ForgingPartner {
                peer_id: PeerId::random(),
                share: share("+alpha.aaaaaa"),
                forged,
            }),
        );

        cp.start().await.unwrap();
        // The forged doc is rejected locally, yet the session advances past
        // the partner's index and settles caught-up.
        tokio::time::timeout(Duration::from_secs(5), cp.sync_until_caught_up())
            .await
            .expect("converges")
            .unwrap();

        let sink = p.replica(&share("+alpha.aaaaaa")).unwrap();
        assert!(sink.get_all_docs().unwrap().is_empty());
        let status = cp.subscribe_status().borrow().clone();
        assert_eq!(status.get(&share("+alpha.aaaaaa")).unwrap().pulled, 0);

        cp.close().unwrap();
    }
}

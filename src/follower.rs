//! Followers: consumers advanced along a replica's local-index sequence.
//!
//! A follower observes every accepted document with
//! `local_index >= next_index`, in strictly increasing local-index order.
//! Blocking followers run inline inside `upsert`; async followers run on a
//! cooperative tokio task that processes documents in batches and sleeps
//! when it has caught up with the replica's head.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::doc::Document;
use crate::replica::WeakReplica;

/// How many documents an async follower processes between yield points.
pub const FOLLOWER_BATCH_SIZE: usize = 40;

/// Callback invoked once per observed document.
pub type DocCallback = Box<dyn FnMut(Arc<Document>) -> anyhow::Result<()> + Send + Sync + 'static>;

/// Callback invoked when a [`DocCallback`] fails.
pub type ErrorCallback = Box<dyn Fn(anyhow::Error) + Send + Sync + 'static>;

/// Lifecycle of an async follower task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerState {
    /// Caught up with the replica head, waiting for a wake-up.
    Sleeping,
    /// Processing a run of documents.
    Running,
    /// Unsubscribed; the task stops at the next check.
    Quitting,
}

/// Registry entry for a blocking follower, driven inline by `upsert`.
pub(crate) struct BlockingFollower {
    pub(crate) next_index: Arc<AtomicU64>,
    pub(crate) callback: DocCallback,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl std::fmt::Debug for BlockingFollower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingFollower")
            .field("next_index", &self.next_index.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// State shared between an async follower task and its handle.
#[derive(Debug)]
pub(crate) struct AsyncFollowerShared {
    state: Mutex<FollowerState>,
    next_index: AtomicU64,
    quit: AtomicBool,
    quit_wake: Notify,
}

impl AsyncFollowerShared {
    pub(crate) fn new(next_index: u64) -> Self {
        AsyncFollowerShared {
            state: Mutex::new(FollowerState::Sleeping),
            next_index: AtomicU64::new(next_index),
            quit: AtomicBool::new(false),
            quit_wake: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> FollowerState {
        *self.state.lock()
    }

    pub(crate) fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::SeqCst)
    }

    pub(crate) fn request_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a quit that lands between the
        // follower's flag check and its await is still observed.
        self.quit_wake.notify_one();
    }

    fn quitting(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Transition into `Running`. Entering `Running` twice without an
    /// intervening sleep is a programmer error.
    fn set_running(&self) {
        let mut state = self.state.lock();
        debug_assert_ne!(
            *state,
            FollowerState::Running,
            "follower is already running"
        );
        if *state != FollowerState::Quitting {
            *state = FollowerState::Running;
        }
    }

    fn set_sleeping(&self) {
        let mut state = self.state.lock();
        if *state != FollowerState::Quitting {
            *state = FollowerState::Sleeping;
        }
    }

    fn set_quitting(&self) {
        *self.state.lock() = FollowerState::Quitting;
    }
}

/// Handle to a registered follower. Dropping the handle does not
/// unsubscribe; call [`FollowerHandle::unsubscribe`].
#[derive(Debug)]
pub struct FollowerHandle {
    kind: HandleKind,
}

#[derive(Debug)]
enum HandleKind {
    Blocking {
        id: u64,
        next_index: Arc<AtomicU64>,
        replica: WeakReplica,
    },
    Task {
        shared: Arc<AsyncFollowerShared>,
    },
}

impl FollowerHandle {
    pub(crate) fn blocking(id: u64, next_index: Arc<AtomicU64>, replica: WeakReplica) -> Self {
        FollowerHandle {
            kind: HandleKind::Blocking {
                id,
                next_index,
                replica,
            },
        }
    }

    pub(crate) fn task(shared: Arc<AsyncFollowerShared>) -> Self {
        FollowerHandle {
            kind: HandleKind::Task { shared },
        }
    }

    /// The next local index this follower will observe.
    pub fn next_index(&self) -> u64 {
        match &self.kind {
            HandleKind::Blocking { next_index, .. } => next_index.load(Ordering::SeqCst),
            HandleKind::Task { shared } => shared.next_index(),
        }
    }

    /// Current state. Blocking followers report `Running` while registered.
    pub fn state(&self) -> FollowerState {
        match &self.kind {
            HandleKind::Blocking { id, replica, .. } => match replica.upgrade() {
                Some(replica) if replica.has_blocking_follower(*id) => FollowerState::Running,
                _ => FollowerState::Quitting,
            },
            HandleKind::Task { shared } => shared.state(),
        }
    }

    /// Stop observing documents. An async follower mid-batch observes the
    /// flag before the next callback.
    pub fn unsubscribe(&self) {
        match &self.kind {
            HandleKind::Blocking { id, replica, .. } => {
                if let Some(replica) = replica.upgrade() {
                    replica.remove_blocking_follower(*id);
                }
            }
            HandleKind::Task { shared } => shared.request_quit(),
        }
    }
}

/// Drive an async follower until it quits or its replica goes away.
///
/// The follower holds only a weak lookup handle to the replica plus a clone
/// of its wake [`Notify`], so a sleeping follower never keeps a dropped
/// replica alive.
pub(crate) async fn run_async_follower(
    replica: WeakReplica,
    wake: Arc<Notify>,
    shared: Arc<AsyncFollowerShared>,
    mut callback: DocCallback,
    on_error: Option<ErrorCallback>,
) {
    loop {
        if shared.quitting() {
            break;
        }

        // Register for wake-ups before checking the head, so an upsert that
        // lands between the check and the await is not missed.
        let notified = wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let batch = {
            let Some(replica) = replica.upgrade() else {
                break;
            };
            match replica.docs_from(shared.next_index(), FOLLOWER_BATCH_SIZE) {
                Ok(batch) => batch,
                Err(err) => {
                    debug!(?err, "follower stopping, replica unavailable");
                    break;
                }
            }
        };

        if batch.is_empty() {
            shared.set_sleeping();
            tokio::select! {
                _ = &mut notified => {}
                _ = shared.quit_wake.notified() => {}
            }
            continue;
        }

        if shared.state() == FollowerState::Sleeping {
            shared.set_running();
        }

        for doc in batch {
            if shared.quitting() {
                break;
            }
            let advance_to = doc.local_index() + 1;
            if let Err(err) = callback(doc) {
                match &on_error {
                    Some(handler) => handler(err),
                    None => {
                        warn!(?err, "follower callback failed, unsubscribing");
                        shared.request_quit();
                    }
                }
            }
            shared.next_index.store(advance_to, Ordering::SeqCst);
        }

        tokio::task::yield_now().await;
    }
    shared.set_quitting();
}

//! Local-first, peer-to-peer replicated document store.
//!
//! Authors holding ed25519 keypairs write signed documents into *shares*,
//! named logical containers replicated between peers. Each share is held
//! locally in a [`Replica`]: an ordered, indexed store with
//! last-writer-wins semantics per (path, author) and a derived *latest*
//! view per path. Every accepted document is stamped with a strictly
//! increasing local index, which is the order observed by [followers]
//! (subscribers streamed along the index sequence) and by remote peers.
//!
//! Peers that hold overlapping shares converge by pulling from each other:
//! a [`SyncCoordinator`] on each side of a duplex connection discovers the
//! common shares through a salted handshake, then incrementally pulls
//! batches of documents per share until both directions report caught-up.
//!
//! Storage is pluggable through the [`store::DocDriver`] contract; the
//! in-memory driver ships in [`store::memory`]. Reads can be memoized with
//! a [`ReplicaCache`].
//!
//! [followers]: crate::follower

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod clock;
pub mod doc;
pub mod follower;
pub mod keys;
pub mod peer;
pub mod query;
pub mod replica;
pub mod share;
pub mod store;
pub mod sync;
pub mod validator;

pub use self::cache::{CacheConfig, CacheError, CacheEvent, CacheKey, ReplicaCache};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::doc::{ContentHash, DocRecord, Document, DOC_FORMAT};
pub use self::follower::{DocCallback, ErrorCallback, FollowerHandle, FollowerState};
pub use self::keys::{Author, AuthorId};
pub use self::peer::{Peer, PeerId};
pub use self::query::{Filter, HistoryMode, OrderBy, Query, StartAt};
pub use self::replica::{Replica, ReplicaError, UpsertOutcome, WriteEvent, WriteOrigin};
pub use self::share::ShareAddress;
pub use self::sync::{SessionStatus, StatusMap, SyncConfig, SyncCoordinator, SyncError};
pub use self::validator::ValidationError;

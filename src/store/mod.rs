//! Storage drivers for replicas.
//!
//! A driver persists the documents of exactly one share. The replica owns
//! its driver and is the only writer; the driver's job is durable
//! append-with-replace keyed by `(path, author)` plus recovery of the
//! highest local index on open. The in-memory driver ships here; persistent
//! backends implement the same trait.

use std::fmt::Debug;

use crate::doc::Document;
use crate::keys::AuthorId;

pub mod memory;

/// Failure in a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The backing store failed.
    #[error("storage backend failure")]
    Backend {
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },
    /// The driver was closed.
    #[error("driver is closed")]
    Closed,
}

impl DriverError {
    /// Wrap a backend failure.
    pub fn backend(source: impl Into<anyhow::Error>) -> Self {
        DriverError::Backend {
            source: source.into(),
        }
    }
}

/// Contract a storage backend must honor for one share.
pub trait DocDriver: Debug + Send + Sync + 'static {
    /// The highest local index ever assigned, recovered on open. 0 when the
    /// store has never held a document.
    fn max_local_index(&self) -> Result<u64, DriverError>;

    /// All retained documents in ascending local-index order, used to seed
    /// the replica's indexes.
    fn all_docs(&self) -> Result<Vec<Document>, DriverError>;

    /// Store a document with its assigned local index, replacing a prior
    /// document by the same `(path, author)` if one exists.
    fn apply(&mut self, doc: &Document) -> Result<(), DriverError>;

    /// Physically delete a document, used by the expiry sweep.
    fn remove(&mut self, path: &str, author: &AuthorId) -> Result<(), DriverError>;

    /// Release the backing store. Further operations fail.
    fn close(&mut self) -> Result<(), DriverError>;
}

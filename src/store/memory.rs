//! In-memory storage driver.

use std::collections::BTreeMap;

use crate::doc::Document;
use crate::keys::AuthorId;

use super::{DocDriver, DriverError};

/// Volatile driver backed by a [`BTreeMap`] keyed by `(path, author)`.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    docs: BTreeMap<(String, AuthorId), Document>,
    max_local_index: u64,
    closed: bool,
}

impl MemoryDriver {
    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }
}

impl DocDriver for MemoryDriver {
    fn max_local_index(&self) -> Result<u64, DriverError> {
        self.check_open()?;
        Ok(self.max_local_index)
    }

    fn all_docs(&self) -> Result<Vec<Document>, DriverError> {
        self.check_open()?;
        let mut docs: Vec<Document> = self.docs.values().cloned().collect();
        docs.sort_by_key(|d| d.local_index());
        Ok(docs)
    }

    fn apply(&mut self, doc: &Document) -> Result<(), DriverError> {
        self.check_open()?;
        self.max_local_index = self.max_local_index.max(doc.local_index());
        self.docs.insert(
            (doc.path().to_string(), doc.author().clone()),
            doc.clone(),
        );
        Ok(())
    }

    fn remove(&mut self, path: &str, author: &AuthorId) -> Result<(), DriverError> {
        self.check_open()?;
        self.docs.remove(&(path.to_string(), author.clone()));
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.closed = true;
        self.docs.clear();
        Ok(())
    }
}

//! Documents and the overwrite order.

use std::{cmp::Ordering, fmt};

use bytes::Bytes;
use ed25519_dalek::{Signature, SignatureError};
use serde::{Deserialize, Serialize};

use crate::keys::{base32, Author, AuthorId};

/// The document format this crate reads and writes.
pub const DOC_FORMAT: &str = "doc.v1";

/// BLAKE3 hash of a document's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash the given content.
    pub fn digest(content: impl AsRef<[u8]>) -> Self {
        ContentHash(blake3::hash(content.as_ref()).into())
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", base32::fmt_short(self.0))
    }
}

/// The signed fields of a document.
///
/// A [`DocRecord`] is everything an author commits to: the path, the content
/// (with its derived hash and length), the timestamp, and the optional format
/// and expiry markers. Signing a record produces a [`Document`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    path: String,
    author: AuthorId,
    timestamp: u64,
    content: Bytes,
    content_hash: ContentHash,
    content_length: u64,
    format: Option<String>,
    delete_after: Option<u64>,
}

impl DocRecord {
    /// Create a record with derived content hash and length.
    pub fn new(
        path: impl Into<String>,
        author: AuthorId,
        timestamp: u64,
        content: impl Into<Bytes>,
    ) -> Self {
        let content = content.into();
        DocRecord {
            path: path.into(),
            author,
            timestamp,
            content_hash: ContentHash::digest(&content),
            content_length: content.len() as u64,
            content,
            format: None,
            delete_after: None,
        }
    }

    /// Set the expiry timestamp (microseconds since epoch).
    pub fn with_delete_after(mut self, delete_after: u64) -> Self {
        self.delete_after = Some(delete_after);
        self
    }

    /// Set an explicit format marker.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Serialize this record into the canonical byte representation used for
    /// signing. The content itself is covered through its hash.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.path.len());
        out.extend_from_slice(self.author.shortname().as_bytes());
        out.extend_from_slice(self.author.as_key_bytes());
        out.extend_from_slice(&(self.path.len() as u64).to_be_bytes());
        out.extend_from_slice(self.path.as_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.content_length.to_be_bytes());
        out.extend_from_slice(self.content_hash.as_bytes());
        match &self.format {
            Some(format) => {
                out.push(1);
                out.extend_from_slice(&(format.len() as u64).to_be_bytes());
                out.extend_from_slice(format.as_bytes());
            }
            None => out.push(0),
        }
        match self.delete_after {
            Some(t) => {
                out.push(1);
                out.extend_from_slice(&t.to_be_bytes());
            }
            None => out.push(0),
        }
        out
    }

    /// Sign this record, producing a [`Document`].
    ///
    /// The signing key must belong to the record's author.
    pub fn sign(self, author: &Author) -> Document {
        debug_assert_eq!(author.id(), self.author, "signing key does not match record author");
        let signature = author.sign(&self.signable_bytes());
        Document {
            record: self,
            signature,
            local_index: 0,
        }
    }
}

/// A signed document.
///
/// Frozen once stored in a replica. `local_index` is assigned by the replica
/// that stores the document; it is not covered by the signature and is never
/// authoritative on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    record: DocRecord,
    signature: Signature,
    local_index: u64,
}

impl Document {
    /// Reassemble a document from its parts, e.g. when loading from a driver.
    pub fn from_parts(record: DocRecord, signature: Signature, local_index: u64) -> Self {
        Document {
            record,
            signature,
            local_index,
        }
    }

    /// Verify the signature against the record's author.
    pub fn verify(&self) -> Result<(), SignatureError> {
        self.record
            .author
            .verify(&self.record.signable_bytes(), &self.signature)
    }

    /// The document's path.
    pub fn path(&self) -> &str {
        &self.record.path
    }

    /// The author that signed this document.
    pub fn author(&self) -> &AuthorId {
        &self.record.author
    }

    /// Creation timestamp, microseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.record.timestamp
    }

    /// The content bytes.
    pub fn content(&self) -> &Bytes {
        &self.record.content
    }

    /// The content as UTF-8 text, if it is valid UTF-8.
    pub fn content_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.record.content).ok()
    }

    /// BLAKE3 hash of the content.
    pub fn content_hash(&self) -> &ContentHash {
        &self.record.content_hash
    }

    /// Length of the content in bytes.
    pub fn content_length(&self) -> u64 {
        self.record.content_length
    }

    /// Optional format marker.
    pub fn format(&self) -> Option<&str> {
        self.record.format.as_deref()
    }

    /// Optional expiry timestamp, microseconds since the Unix epoch.
    pub fn delete_after(&self) -> Option<u64> {
        self.record.delete_after
    }

    /// The signature over the record.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The index assigned by the replica holding this copy, 0 if unassigned.
    pub fn local_index(&self) -> u64 {
        self.local_index
    }

    /// The signed record.
    pub fn record(&self) -> &DocRecord {
        &self.record
    }

    /// Whether the document has expired at the given time.
    pub fn is_expired(&self, now_micros: u64) -> bool {
        self.record
            .delete_after
            .map(|t| t <= now_micros)
            .unwrap_or(false)
    }

    /// Compare two documents under the overwrite order: higher timestamp
    /// wins, ties broken by the lexicographically greater signature.
    pub fn overwrite_cmp(&self, other: &Self) -> Ordering {
        self.record
            .timestamp
            .cmp(&other.record.timestamp)
            .then_with(|| {
                self.signature
                    .to_bytes()
                    .cmp(&other.signature.to_bytes())
            })
    }

    pub(crate) fn set_local_index(&mut self, local_index: u64) {
        self.local_index = local_index;
    }
}

/// Natural path order: `path` ascending, newest first within a path.
pub(crate) fn path_order(a: &Document, b: &Document) -> Ordering {
    a.path()
        .cmp(b.path())
        .then_with(|| b.overwrite_cmp(a))
}

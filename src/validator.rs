//! Document validation: path grammar, timestamps, signatures, ownership.

use crate::doc::{ContentHash, Document, DOC_FORMAT};

/// Maximum allowed path length.
pub const PATH_MAX_LEN: usize = 512;

/// Minimum allowed path length (a slash and one character).
pub const PATH_MIN_LEN: usize = 2;

/// How far in the future a document timestamp may lie, in microseconds.
pub const MAX_TIMESTAMP_SKEW_MICROS: u64 = 10 * 60 * 1_000_000;

const PATH_PUNCTUATION: &str = "/'()-._~!*$&+,:=@%\"";

/// Why a document, path, or address was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The path does not conform to the path grammar.
    #[error("malformed path: {0}")]
    Path(String),
    /// The path is owned by another author.
    #[error("author may not write to owned path {0}")]
    UnauthorizedPathWrite(String),
    /// A path containing `!` must carry an expiry, and only such a path may.
    #[error("ephemeral marker and delete_after disagree: {0}")]
    EphemeralMismatch(&'static str),
    /// The timestamp is zero or too far in the future.
    #[error("timestamp out of range")]
    TimestampOutOfRange,
    /// The expiry is not later than the creation timestamp.
    #[error("delete_after is not after timestamp")]
    ExpiryBeforeCreation,
    /// The content hash does not match the content.
    #[error("content hash does not match content")]
    ContentHashMismatch,
    /// The content length does not match the content.
    #[error("content length does not match content")]
    ContentLengthMismatch,
    /// The format marker is not one this crate understands.
    #[error("unknown format: {0}")]
    UnknownFormat(String),
    /// The signature does not verify against the author's public key.
    #[error("invalid signature")]
    Signature,
    /// The author address is malformed.
    #[error("malformed author address: {0}")]
    AuthorAddress(String),
    /// The share address is malformed.
    #[error("malformed share address: {0}")]
    ShareAddress(String),
}

impl ValidationError {
    pub(crate) fn path(reason: impl Into<String>) -> Self {
        ValidationError::Path(reason.into())
    }

    pub(crate) fn author_address(reason: impl Into<String>) -> Self {
        ValidationError::AuthorAddress(reason.into())
    }

    pub(crate) fn share_address(reason: impl Into<String>) -> Self {
        ValidationError::ShareAddress(reason.into())
    }
}

/// Check a path against the path grammar.
pub fn check_path(path: &str) -> Result<(), ValidationError> {
    if path.len() < PATH_MIN_LEN || path.len() > PATH_MAX_LEN {
        return Err(ValidationError::path("length must be 2 to 512"));
    }
    if !path.starts_with('/') {
        return Err(ValidationError::path("must start with /"));
    }
    if path.contains("//") {
        return Err(ValidationError::path("must not contain //"));
    }
    if path.contains('?') {
        return Err(ValidationError::path("must not contain ?"));
    }
    for c in path.chars() {
        let ok = c.is_ascii_alphanumeric() || PATH_PUNCTUATION.contains(c);
        if !ok {
            return Err(ValidationError::path(format!("disallowed character {c:?}")));
        }
    }
    Ok(())
}

/// Check a full document against the given wall-clock time.
///
/// This is the single gate every document passes before a replica retains
/// it, whether written locally or received over sync.
pub fn check_document(doc: &Document, now_micros: u64) -> Result<(), ValidationError> {
    check_path(doc.path())?;

    // Ownership: a path containing ~ may only be written by an author whose
    // full address appears after a ~ somewhere in the path.
    if doc.path().contains('~') {
        let marker = format!("~{}", doc.author().address());
        if !doc.path().contains(&marker) {
            return Err(ValidationError::UnauthorizedPathWrite(
                doc.path().to_string(),
            ));
        }
    }

    let ephemeral = doc.path().contains('!');
    match (ephemeral, doc.delete_after()) {
        (true, None) => {
            return Err(ValidationError::EphemeralMismatch(
                "path with ! requires delete_after",
            ))
        }
        (false, Some(_)) => {
            return Err(ValidationError::EphemeralMismatch(
                "delete_after requires a path with !",
            ))
        }
        _ => {}
    }

    if doc.timestamp() == 0 || doc.timestamp() > now_micros + MAX_TIMESTAMP_SKEW_MICROS {
        return Err(ValidationError::TimestampOutOfRange);
    }
    if let Some(delete_after) = doc.delete_after() {
        if delete_after <= doc.timestamp() {
            return Err(ValidationError::ExpiryBeforeCreation);
        }
    }

    if *doc.content_hash() != ContentHash::digest(doc.content()) {
        return Err(ValidationError::ContentHashMismatch);
    }
    if doc.content_length() != doc.content().len() as u64 {
        return Err(ValidationError::ContentLengthMismatch);
    }

    if let Some(format) = doc.format() {
        if format != DOC_FORMAT {
            return Err(ValidationError::UnknownFormat(format.to_string()));
        }
    }

    doc.verify().map_err(|_| ValidationError::Signature)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::DocRecord;
    use crate::keys::Author;

    const NOW: u64 = 1_700_000_000_000_000;

    #[test]
    fn test_path_grammar() {
        for ok in ["/a", "/wiki/salads", "/about/~@suzy.b32/bio", "/x!.tmp"] {
            check_path(ok).unwrap_or_else(|e| panic!("{ok}: {e}"));
        }
        for bad in ["a", "/", "/a b", "/a//b", "/a?b", "/日本語", ""] {
            assert!(check_path(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_valid_doc_passes() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let doc = DocRecord::new("/wiki/salads", author.id(), NOW, "tomato").sign(&author);
        check_document(&doc, NOW).unwrap();
    }

    #[test]
    fn test_timestamp_bounds() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();

        let zero = DocRecord::new("/p", author.id(), 0, "a").sign(&author);
        assert_eq!(
            check_document(&zero, NOW),
            Err(ValidationError::TimestampOutOfRange)
        );

        let future =
            DocRecord::new("/p", author.id(), NOW + MAX_TIMESTAMP_SKEW_MICROS + 1, "a")
                .sign(&author);
        assert_eq!(
            check_document(&future, NOW),
            Err(ValidationError::TimestampOutOfRange)
        );

        // Just inside the skew window is fine.
        let soon =
            DocRecord::new("/p", author.id(), NOW + MAX_TIMESTAMP_SKEW_MICROS, "a").sign(&author);
        check_document(&soon, NOW).unwrap();
    }

    #[test]
    fn test_owned_path() {
        let mut rng = rand::thread_rng();
        let suzy = Author::new(&mut rng, "suzy").unwrap();
        let zork = Author::new(&mut rng, "zork").unwrap();

        let path = format!("/about/~{}/bio", suzy.id().address());
        let by_owner = DocRecord::new(path.clone(), suzy.id(), NOW, "hi").sign(&suzy);
        check_document(&by_owner, NOW).unwrap();

        let by_other = DocRecord::new(path, zork.id(), NOW, "hi").sign(&zork);
        assert!(matches!(
            check_document(&by_other, NOW),
            Err(ValidationError::UnauthorizedPathWrite(_))
        ));
    }

    #[test]
    fn test_ephemeral_rules() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();

        let missing = DocRecord::new("/chat/!message", author.id(), NOW, "hi").sign(&author);
        assert!(matches!(
            check_document(&missing, NOW),
            Err(ValidationError::EphemeralMismatch(_))
        ));

        let unexpected = DocRecord::new("/chat/message", author.id(), NOW, "hi")
            .with_delete_after(NOW + 1_000_000)
            .sign(&author);
        assert!(matches!(
            check_document(&unexpected, NOW),
            Err(ValidationError::EphemeralMismatch(_))
        ));

        let ok = DocRecord::new("/chat/!message", author.id(), NOW, "hi")
            .with_delete_after(NOW + 1_000_000)
            .sign(&author);
        check_document(&ok, NOW).unwrap();
    }

    #[test]
    fn test_tampered_content_rejected() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let good = DocRecord::new("/p", author.id(), NOW, "real").sign(&author);

        let forged = crate::doc::Document::from_parts(
            DocRecord::new("/p", author.id(), NOW, "fake"),
            *good.signature(),
            0,
        );
        assert_eq!(
            check_document(&forged, NOW),
            Err(ValidationError::Signature)
        );
    }
}

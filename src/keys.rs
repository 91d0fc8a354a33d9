//! Author keypairs and addresses.

use std::{cmp::Ordering, fmt, str::FromStr};

use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::validator::ValidationError;

/// Length of an author shortname.
pub const SHORTNAME_LEN: usize = 4;

/// Author key used to sign documents written to a replica.
///
/// Internally, an author is a [`SigningKey`] plus a human-chosen shortname.
/// The shortname is part of the author's address and is covered by every
/// document signature.
#[derive(Clone, Serialize, Deserialize)]
pub struct Author {
    signing_key: SigningKey,
    shortname: String,
}

impl Author {
    /// Create a new [`Author`] with a random key and the given shortname.
    ///
    /// The shortname must be exactly four lowercase letters or digits,
    /// starting with a letter.
    pub fn new<R: CryptoRngCore + ?Sized>(
        rng: &mut R,
        shortname: &str,
    ) -> Result<Self, ValidationError> {
        check_shortname(shortname)?;
        let signing_key = SigningKey::generate(rng);
        Ok(Author {
            signing_key,
            shortname: shortname.to_string(),
        })
    }

    /// Create an [`Author`] from a shortname and the secret key bytes.
    pub fn from_parts(shortname: &str, bytes: &[u8; 32]) -> Result<Self, ValidationError> {
        check_shortname(shortname)?;
        Ok(Author {
            signing_key: SigningKey::from_bytes(bytes),
            shortname: shortname.to_string(),
        })
    }

    /// Returns the secret key byte representation.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The author's shortname.
    pub fn shortname(&self) -> &str {
        &self.shortname
    }

    /// Get the [`AuthorId`] for this author.
    pub fn id(&self) -> AuthorId {
        AuthorId {
            shortname: self.shortname.clone(),
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Sign a message with this [`Author`] key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }

    /// Strictly verify a signature on a message with this [`Author`]'s public key.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.signing_key.verify_strict(msg, signature)
    }
}

/// Identifier for an [`Author`]: the shortname plus the public key.
///
/// Displays as the author address `@shortname.pubkey`, where `pubkey` is the
/// lowercase base32 encoding of the 32-byte public key. Can be used to verify
/// document signatures.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AuthorId {
    shortname: String,
    verifying_key: VerifyingKey,
}

impl AuthorId {
    /// Verify that a signature over `msg` was created by the [`Author`]
    /// corresponding to this id.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.verifying_key.verify_strict(msg, signature)
    }

    /// The shortname part of the address.
    pub fn shortname(&self) -> &str {
        &self.shortname
    }

    /// The public key bytes.
    pub fn as_key_bytes(&self) -> &[u8; 32] {
        self.verifying_key.as_bytes()
    }

    /// The full author address, `@shortname.pubkey`.
    pub fn address(&self) -> String {
        format!("@{}.{}", self.shortname, base32::fmt(self.as_key_bytes()))
    }

    /// A shortened form for logging.
    pub fn fmt_short(&self) -> String {
        format!(
            "@{}.{}",
            self.shortname,
            base32::fmt_short(self.as_key_bytes())
        )
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

impl fmt::Debug for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorId({})", self.fmt_short())
    }
}

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Author({})", self.id().fmt_short())
    }
}

impl FromStr for AuthorId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('@')
            .ok_or_else(|| ValidationError::author_address("missing leading @"))?;
        let (shortname, key) = rest
            .split_once('.')
            .ok_or_else(|| ValidationError::author_address("missing . separator"))?;
        check_shortname(shortname)?;
        let key_bytes: [u8; 32] = base32::parse_array(key)
            .map_err(|_| ValidationError::author_address("public key is not valid base32"))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| ValidationError::author_address("public key is not a valid curve point"))?;
        Ok(AuthorId {
            shortname: shortname.to_string(),
            verifying_key,
        })
    }
}

impl TryFrom<String> for AuthorId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AuthorId> for String {
    fn from(value: AuthorId) -> Self {
        value.address()
    }
}

impl PartialOrd for AuthorId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AuthorId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.shortname
            .cmp(&other.shortname)
            .then_with(|| self.as_key_bytes().cmp(other.as_key_bytes()))
    }
}

impl From<&Author> for AuthorId {
    fn from(value: &Author) -> Self {
        value.id()
    }
}

fn check_shortname(shortname: &str) -> Result<(), ValidationError> {
    if shortname.len() != SHORTNAME_LEN {
        return Err(ValidationError::author_address(
            "shortname must be exactly 4 characters",
        ));
    }
    let mut chars = shortname.chars();
    let first = chars.next().expect("length checked");
    if !first.is_ascii_lowercase() {
        return Err(ValidationError::author_address(
            "shortname must start with a lowercase letter",
        ));
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(ValidationError::author_address(
            "shortname must be lowercase letters and digits",
        ));
    }
    Ok(())
}

/// Lowercase base32 encoding for key and hash identifiers.
pub(crate) mod base32 {
    use data_encoding::BASE32_NOPAD;

    /// Failure to decode a base32 identifier.
    #[derive(Debug, thiserror::Error)]
    pub enum DecodeError {
        /// The input is not valid base32.
        #[error("invalid base32")]
        Encoding(#[from] data_encoding::DecodeError),
        /// The input decoded to the wrong number of bytes.
        #[error("decoded to {0} bytes, expected {1}")]
        Length(usize, usize),
    }

    /// Lowercase base32 encoding of the given bytes.
    pub fn fmt(bytes: impl AsRef<[u8]>) -> String {
        let mut text = BASE32_NOPAD.encode(bytes.as_ref());
        text.make_ascii_lowercase();
        text
    }

    /// Like [`fmt`], but encoding only a short prefix, for log output.
    pub fn fmt_short(bytes: impl AsRef<[u8]>) -> String {
        let len = bytes.as_ref().len().min(6);
        fmt(&bytes.as_ref()[..len])
    }

    /// Parse a base32 string into a fixed-size byte array.
    pub fn parse_array<const N: usize>(input: &str) -> Result<[u8; N], DecodeError> {
        let bytes = BASE32_NOPAD.decode(input.to_ascii_uppercase().as_bytes())?;
        let len = bytes.len();
        <[u8; N]>::try_from(bytes).map_err(|_| DecodeError::Length(len, N))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_author_address_roundtrip() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let id = author.id();
        let addr = id.address();
        assert!(addr.starts_with("@suzy."));
        let parsed: AuthorId = addr.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_shortname_rules() {
        let mut rng = rand::thread_rng();
        assert!(Author::new(&mut rng, "suzy").is_ok());
        assert!(Author::new(&mut rng, "ab12").is_ok());
        assert!(Author::new(&mut rng, "1abc").is_err());
        assert!(Author::new(&mut rng, "toolong").is_err());
        assert!(Author::new(&mut rng, "ab").is_err());
        assert!(Author::new(&mut rng, "SUZY").is_err());
    }

    #[test]
    fn test_signature_verifies() {
        let mut rng = rand::thread_rng();
        let author = Author::new(&mut rng, "suzy").unwrap();
        let sig = author.sign(b"hello");
        author.id().verify(b"hello", &sig).unwrap();
        assert!(author.id().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn test_author_id_ord_by_shortname_then_key() {
        let mut rng = rand::thread_rng();
        let a = Author::new(&mut rng, "aaaa").unwrap().id();
        let b = Author::new(&mut rng, "bbbb").unwrap().id();
        assert!(a < b);
    }
}

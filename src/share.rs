//! Share addresses.
//!
//! A share is a named logical container for documents and the unit of
//! replication. Its address has the form `+name.suffix`: `name` is 1 to 15
//! lowercase letters and digits starting with a letter, and `suffix` is at
//! least 6 characters of the lowercase base32 alphabet. Knowing a share
//! address is what grants the ability to sync it, which is why the sync
//! handshake only ever exchanges salted hashes of addresses.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::validator::ValidationError;

/// Maximum length of the name part of a share address.
pub const SHARE_NAME_MAX_LEN: usize = 15;

/// Minimum length of the suffix part of a share address.
pub const SHARE_SUFFIX_MIN_LEN: usize = 6;

/// A validated share address, `+name.suffix`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShareAddress(String);

impl ShareAddress {
    /// Parse and validate a share address.
    pub fn new(address: &str) -> Result<Self, ValidationError> {
        let rest = address
            .strip_prefix('+')
            .ok_or_else(|| ValidationError::share_address("missing leading +"))?;
        let (name, suffix) = rest
            .split_once('.')
            .ok_or_else(|| ValidationError::share_address("missing . separator"))?;
        if name.is_empty() || name.len() > SHARE_NAME_MAX_LEN {
            return Err(ValidationError::share_address(
                "name must be 1 to 15 characters",
            ));
        }
        if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
            return Err(ValidationError::share_address(
                "name must start with a lowercase letter",
            ));
        }
        if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(ValidationError::share_address(
                "name must be lowercase letters and digits",
            ));
        }
        if suffix.len() < SHARE_SUFFIX_MIN_LEN {
            return Err(ValidationError::share_address(
                "suffix must be at least 6 characters",
            ));
        }
        if !suffix
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '2'..='7'))
        {
            return Err(ValidationError::share_address(
                "suffix must be base32 characters",
            ));
        }
        Ok(ShareAddress(address.to_string()))
    }

    /// The full address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name part of the address.
    pub fn name(&self) -> &str {
        let rest = &self.0[1..];
        rest.split_once('.').expect("validated").0
    }

    /// The suffix part of the address.
    pub fn suffix(&self) -> &str {
        let rest = &self.0[1..];
        rest.split_once('.').expect("validated").1
    }

    /// Hash of `salt || address`, used during the sync handshake so that
    /// neither peer learns share addresses the other holds but it does not.
    pub fn salted_hash(&self, salt: &[u8]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(salt);
        hasher.update(self.0.as_bytes());
        hasher.finalize().into()
    }
}

impl fmt::Display for ShareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ShareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShareAddress({})", self.0)
    }
}

impl FromStr for ShareAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ShareAddress {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ShareAddress> for String {
    fn from(value: ShareAddress) -> Self {
        value.0
    }
}

impl PartialOrd for ShareAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ShareAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_address_accepts() {
        for ok in [
            "+gardening.abc234",
            "+a.zzzzzz",
            "+notes2.bnkksi2mlgkl",
            "+maxlenname15aa.aaaaaa",
        ] {
            ShareAddress::new(ok).unwrap_or_else(|e| panic!("{ok}: {e}"));
        }
    }

    #[test]
    fn test_share_address_rejects() {
        for bad in [
            "gardening.abc234",
            "+gardening",
            "+2gardens.abc234",
            "+Gardening.abc234",
            "+gardening.abc",
            "+gardening.abc23!",
            "+gardeningnamewaytoolong.abc234",
            "+gardening.ABC234",
        ] {
            assert!(ShareAddress::new(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_salted_hash_varies_with_salt() {
        let share = ShareAddress::new("+gardening.abc234").unwrap();
        let h1 = share.salted_hash(b"salt-one");
        let h2 = share.salted_hash(b"salt-two");
        assert_ne!(h1, h2);
        assert_eq!(h1, share.salted_hash(b"salt-one"));
    }
}

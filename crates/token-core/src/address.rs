use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Longest accepted key-address name.
pub const KEY_MAX_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("address must start with t0 or t1: {0:?}")]
    UnknownClass(String),

    #[error("invalid id address: {0:?}")]
    InvalidId(String),

    #[error("invalid key address: {0:?}")]
    InvalidKey(String),
}

/// An account or actor address.
///
/// Two classes exist: engine-assigned numeric ID addresses (`t0<num>`), which
/// key all ledger state, and user-chosen key addresses (`t1<name>`), which the
/// engine resolves to an ID, allocating an account on first use.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Address {
    Id(u64),
    Key(String),
}

impl Address {
    /// Construct a validated key address.
    pub fn key(name: &str) -> Result<Self, AddressError> {
        if name.is_empty() || name.len() > KEY_MAX_LEN {
            return Err(AddressError::InvalidKey(name.to_string()));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(AddressError::InvalidKey(name.to_string()));
        }
        Ok(Address::Key(name.to_string()))
    }

    pub fn is_id(&self) -> bool {
        matches!(self, Address::Id(_))
    }

    /// Canonical byte representation, used as trie key material.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| AddressError::UnknownClass(hex::encode(bytes)))?;
        s.parse()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Id(id) => write!(f, "t0{id}"),
            Address::Key(name) => write!(f, "t1{name}"),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(digits) = s.strip_prefix("t0") {
            if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
                return Err(AddressError::InvalidId(s.to_string()));
            }
            let id = digits
                .parse::<u64>()
                .map_err(|_| AddressError::InvalidId(s.to_string()))?;
            return Ok(Address::Id(id));
        }
        if let Some(name) = s.strip_prefix("t1") {
            return Address::key(name);
        }
        Err(AddressError::UnknownClass(s.to_string()))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

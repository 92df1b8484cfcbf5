use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Content hash identifying one immutable block. SHA-256 of the block bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Root([u8; 32]);

impl Root {
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Root(arr))
    }
}

/// Hash a block the way the store addresses it.
pub fn hash_block(block: &[u8]) -> Root {
    Root(Sha256::digest(block).into())
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Root({})", self)
    }
}

impl Serialize for Root {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct RootVisitor;

impl<'de> Visitor<'de> for RootVisitor {
    type Value = Root;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("32 root bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        let arr: [u8; 32] = v
            .try_into()
            .map_err(|_| E::invalid_length(v.len(), &self))?;
        Ok(Root(arr))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut bytes = Vec::with_capacity(32);
        while let Some(b) = seq.next_element::<u8>()? {
            bytes.push(b);
        }
        self.visit_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for Root {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(RootVisitor)
    }
}

/// Minimal content-addressed key-value store interface. Caching and garbage
/// collection belong to implementations, not to this contract.
pub trait Blockstore {
    fn get(&self, root: &Root) -> Result<Vec<u8>, StoreError>;
    fn put(&self, block: &[u8]) -> Result<Root, StoreError>;
}

/// In-memory blockstore backing tests and the CLI's toy chain.
#[derive(Debug, Default)]
pub struct MemoryBlockstore {
    blocks: Mutex<BTreeMap<Root, Vec<u8>>>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Root, Vec<u8>>>, StoreError> {
        self.blocks
            .lock()
            .map_err(|_| StoreError::Io("blockstore lock poisoned".into()))
    }

    /// Clone out every block, for snapshotting.
    pub fn export(&self) -> Result<BTreeMap<Root, Vec<u8>>, StoreError> {
        Ok(self.lock()?.clone())
    }
}

impl Blockstore for MemoryBlockstore {
    fn get(&self, root: &Root) -> Result<Vec<u8>, StoreError> {
        self.lock()?
            .get(root)
            .cloned()
            .ok_or(StoreError::NotFound { root: *root })
    }

    fn put(&self, block: &[u8]) -> Result<Root, StoreError> {
        let root = hash_block(block);
        self.lock()?.insert(root, block.to_vec());
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let store = MemoryBlockstore::new();
        let root = store.put(b"hello").unwrap();
        assert_eq!(store.get(&root).unwrap(), b"hello");
        assert_eq!(root, hash_block(b"hello"));
    }

    #[test]
    fn missing_root_is_not_found() {
        let store = MemoryBlockstore::new();
        let root = hash_block(b"absent");
        assert!(matches!(
            store.get(&root),
            Err(StoreError::NotFound { root: r }) if r == root
        ));
    }

    #[test]
    fn root_hex_round_trips() {
        let root = hash_block(b"abc");
        let parsed = Root::from_hex(&root.to_string()).unwrap();
        assert_eq!(parsed, root);
        assert!(Root::from_hex("zz").is_none());
        assert!(Root::from_hex("aabb").is_none());
    }
}

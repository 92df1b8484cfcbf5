use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StateError;
use crate::store::{Blockstore, Root};

/// Trie fanout is `2^bitwidth`. The codec records the bitwidth it was created
/// with and must reuse it on every traversal.
pub const DEFAULT_BITWIDTH: u32 = 5;

/// Entries sharing an index slot stay inline until the bucket overflows.
const MAX_BUCKET: usize = 3;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct Node {
    bitmap: u64,
    pointers: Vec<Pointer>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Pointer {
    Link {
        root: Root,
    },
    Bucket {
        entries: Vec<Entry>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Entry {
    #[serde(with = "serde_bytes")]
    key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    value: Vec<u8>,
}

fn key_hash(key: &[u8]) -> [u8; 32] {
    Sha256::digest(key).into()
}

/// Extract the `bitwidth`-bit index for `depth` from the key hash.
fn index_at(hash: &[u8; 32], depth: u32, bitwidth: u32) -> usize {
    let start = depth * bitwidth;
    let mut idx = 0usize;
    for bit in start..start + bitwidth {
        let byte = (bit / 8) as usize;
        let shift = 7 - (bit % 8);
        idx = (idx << 1) | ((hash[byte] >> shift) & 1) as usize;
    }
    idx
}

fn pointer_position(bitmap: u64, idx: usize) -> usize {
    (bitmap & ((1u64 << idx) - 1)).count_ones() as usize
}

fn decode_node(block: &[u8]) -> Result<Node, StateError> {
    serde_cbor::from_slice(block)
        .map_err(|e| StateError::Corrupt(format!("undecodable trie node: {e}")))
}

fn put_node(store: &dyn Blockstore, node: &Node) -> Result<Root, StateError> {
    let block = serde_cbor::to_vec(node)
        .map_err(|e| StateError::Corrupt(format!("unencodable trie node: {e}")))?;
    Ok(store.put(&block)?)
}

/// Persistent hash-indexed trie mapping byte keys to byte values over a
/// content-addressed blockstore. Every mutation derives new nodes; existing
/// roots are never touched.
pub struct Hamt<'a> {
    store: &'a dyn Blockstore,
    node: Node,
    bitwidth: u32,
}

impl<'a> Hamt<'a> {
    pub fn empty(store: &'a dyn Blockstore, bitwidth: u32) -> Result<Self, StateError> {
        if !(1..=6).contains(&bitwidth) {
            return Err(StateError::Corrupt(format!(
                "unsupported trie bitwidth {bitwidth}"
            )));
        }
        Ok(Self {
            store,
            node: Node::default(),
            bitwidth,
        })
    }

    pub fn load(store: &'a dyn Blockstore, root: &Root, bitwidth: u32) -> Result<Self, StateError> {
        let mut hamt = Self::empty(store, bitwidth)?;
        hamt.node = decode_node(&store.get(root)?)?;
        Ok(hamt)
    }

    pub fn is_empty(&self) -> bool {
        self.node.bitmap == 0
    }

    /// Deepest level at which a node may still exist: the key hash runs out
    /// of index bits below it.
    fn max_depth(&self) -> u32 {
        256 / self.bitwidth - 1
    }

    fn over_deep() -> StateError {
        StateError::Corrupt("trie nests deeper than the key hash".into())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        let hash = key_hash(key);
        let mut node = self.node.clone();
        let mut depth = 0;
        loop {
            if depth > self.max_depth() {
                return Err(Self::over_deep());
            }
            let idx = index_at(&hash, depth, self.bitwidth);
            if node.bitmap & (1u64 << idx) == 0 {
                return Ok(None);
            }
            let pos = pointer_position(node.bitmap, idx);
            match &node.pointers[pos] {
                Pointer::Bucket { entries } => {
                    return Ok(entries
                        .iter()
                        .find(|e| e.key == key)
                        .map(|e| e.value.clone()));
                }
                Pointer::Link { root } => {
                    node = decode_node(&self.store.get(root)?)?;
                    depth += 1;
                }
            }
        }
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        let hash = key_hash(key);
        self.node = self.set_in(&self.node.clone(), 0, &hash, key, value)?;
        Ok(())
    }

    fn set_in(
        &self,
        node: &Node,
        depth: u32,
        hash: &[u8; 32],
        key: &[u8],
        value: &[u8],
    ) -> Result<Node, StateError> {
        if depth > self.max_depth() {
            return Err(Self::over_deep());
        }
        let idx = index_at(hash, depth, self.bitwidth);
        let mask = 1u64 << idx;
        let pos = pointer_position(node.bitmap, idx);
        let mut out = node.clone();

        if node.bitmap & mask == 0 {
            out.bitmap |= mask;
            out.pointers.insert(
                pos,
                Pointer::Bucket {
                    entries: vec![Entry {
                        key: key.to_vec(),
                        value: value.to_vec(),
                    }],
                },
            );
            return Ok(out);
        }

        match &node.pointers[pos] {
            Pointer::Link { root } => {
                let child = decode_node(&self.store.get(root)?)?;
                let child = self.set_in(&child, depth + 1, hash, key, value)?;
                out.pointers[pos] = Pointer::Link {
                    root: put_node(self.store, &child)?,
                };
            }
            Pointer::Bucket { entries } => {
                let mut entries = entries.clone();
                if let Some(existing) = entries.iter_mut().find(|e| e.key == key) {
                    existing.value = value.to_vec();
                } else if entries.len() < MAX_BUCKET || depth >= self.max_depth() {
                    // Buckets stay sorted so traversal order is a function of
                    // content alone.
                    let at = entries
                        .iter()
                        .position(|e| e.key.as_slice() > key)
                        .unwrap_or(entries.len());
                    entries.insert(
                        at,
                        Entry {
                            key: key.to_vec(),
                            value: value.to_vec(),
                        },
                    );
                } else {
                    // Overflow: push the bucket one level down.
                    let mut child = Node::default();
                    for e in &entries {
                        let h = key_hash(&e.key);
                        child = self.set_in(&child, depth + 1, &h, &e.key, &e.value)?;
                    }
                    child = self.set_in(&child, depth + 1, hash, key, value)?;
                    out.pointers[pos] = Pointer::Link {
                        root: put_node(self.store, &child)?,
                    };
                    return Ok(out);
                }
                out.pointers[pos] = Pointer::Bucket { entries };
            }
        }
        Ok(out)
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool, StateError> {
        let hash = key_hash(key);
        match self.delete_in(&self.node.clone(), 0, &hash, key)? {
            Some(node) => {
                self.node = node;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_in(
        &self,
        node: &Node,
        depth: u32,
        hash: &[u8; 32],
        key: &[u8],
    ) -> Result<Option<Node>, StateError> {
        if depth > self.max_depth() {
            return Err(Self::over_deep());
        }
        let idx = index_at(hash, depth, self.bitwidth);
        let mask = 1u64 << idx;
        if node.bitmap & mask == 0 {
            return Ok(None);
        }
        let pos = pointer_position(node.bitmap, idx);
        let mut out = node.clone();

        match &node.pointers[pos] {
            Pointer::Bucket { entries } => {
                let Some(at) = entries.iter().position(|e| e.key == key) else {
                    return Ok(None);
                };
                let mut entries = entries.clone();
                entries.remove(at);
                if entries.is_empty() {
                    out.bitmap &= !mask;
                    out.pointers.remove(pos);
                } else {
                    out.pointers[pos] = Pointer::Bucket { entries };
                }
            }
            Pointer::Link { root } => {
                let child = decode_node(&self.store.get(root)?)?;
                let Some(child) = self.delete_in(&child, depth + 1, hash, key)? else {
                    return Ok(None);
                };
                if child.bitmap == 0 {
                    out.bitmap &= !mask;
                    out.pointers.remove(pos);
                } else {
                    out.pointers[pos] = Pointer::Link {
                        root: put_node(self.store, &child)?,
                    };
                }
            }
        }
        Ok(Some(out))
    }

    /// Persist the current root node and return its content address.
    pub fn flush(&self) -> Result<Root, StateError> {
        put_node(self.store, &self.node)
    }

    /// Lazy traversal of all entries. Deterministic for a fixed root; the
    /// first error terminates the iteration.
    pub fn iter(&self) -> HamtIter<'a> {
        HamtIter {
            store: self.store,
            max_depth: self.max_depth(),
            stack: vec![Frame {
                node: self.node.clone(),
                ptr: 0,
                entry: 0,
            }],
            failed: false,
        }
    }
}

struct Frame {
    node: Node,
    ptr: usize,
    entry: usize,
}

pub struct HamtIter<'a> {
    store: &'a dyn Blockstore,
    max_depth: u32,
    stack: Vec<Frame>,
    failed: bool,
}

impl<'a> Iterator for HamtIter<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>), StateError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let frame = self.stack.last_mut()?;
            if frame.ptr >= frame.node.pointers.len() {
                self.stack.pop();
                continue;
            }
            match frame.node.pointers[frame.ptr].clone() {
                Pointer::Bucket { entries } => {
                    if frame.entry < entries.len() {
                        let e = entries[frame.entry].clone();
                        frame.entry += 1;
                        return Some(Ok((e.key, e.value)));
                    }
                    frame.ptr += 1;
                    frame.entry = 0;
                }
                Pointer::Link { root } => {
                    frame.ptr += 1;
                    frame.entry = 0;
                    // The frame at stack position d sits at depth d.
                    if self.stack.len() > self.max_depth as usize {
                        self.failed = true;
                        return Some(Err(Hamt::over_deep()));
                    }
                    let loaded = self
                        .store
                        .get(&root)
                        .map_err(StateError::from)
                        .and_then(|block| decode_node(&block));
                    match loaded {
                        Ok(node) => self.stack.push(Frame {
                            node,
                            ptr: 0,
                            entry: 0,
                        }),
                        Err(e) => {
                            self.failed = true;
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}

//! Version-independent view of a token actor's state.
//!
//! Readers load a state handle from a root plus the version tag stored next
//! to it; dispatch goes through an explicit [`StateRegistry`] so that adding
//! a state version means adding a registry entry, never editing existing
//! codecs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::amount::TokenAmount;
use crate::error::StateError;
use crate::store::{Blockstore, Root};

pub mod v1;

/// Actor state version tags.
pub const VERSION_1: u32 = 1;

/// Immutable token metadata, set once at construction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenInfo {
    pub name: String,
    pub symbol: String,
    pub decimals: u64,
    pub total_supply: TokenAmount,
    #[serde(with = "serde_bytes")]
    pub icon: Vec<u8>,
    pub issuer: Address,
}

/// A state snapshot reference: the content root plus the version tag that
/// selects the codec able to read it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateHead {
    pub version: u32,
    pub root: Root,
}

/// Lazy, restartable holder traversal. The first `Err` is terminal.
pub type HolderIter<'a> = Box<dyn Iterator<Item = Result<(Address, TokenAmount), StateError>> + 'a>;

/// Lazy, restartable `(holder, spender, allowance)` traversal.
pub type ApprovalIter<'a> =
    Box<dyn Iterator<Item = Result<(Address, Address, TokenAmount), StateError>> + 'a>;

/// Read-only, version-independent view of one ledger state root. All methods
/// are pure; nothing here mutates the underlying store.
pub trait LedgerState {
    fn info(&self) -> &TokenInfo;

    /// Balance of a holder; zero (not an error) for unknown holders.
    fn balance_of(&self, holder: &Address) -> Result<TokenAmount, StateError>;

    /// All spenders the holder has approved, with the available amounts.
    /// Empty if the holder never approved anyone.
    fn approvals_by(&self, holder: &Address)
        -> Result<BTreeMap<Address, TokenAmount>, StateError>;

    /// Traverse all holders with nonzero balances. Order is deterministic for
    /// a fixed root but otherwise unspecified.
    fn holders(&self) -> Result<HolderIter<'_>, StateError>;

    /// Traverse all approvals. Holders are visited lazily; enumerating
    /// holders alone never loads an approval subtree.
    fn approvals(&self) -> Result<ApprovalIter<'_>, StateError>;
}

type Loader =
    Box<dyn Fn(Arc<dyn Blockstore>, Root) -> Result<Box<dyn LedgerState>, StateError> + Send + Sync>;

/// Explicit version-tag → codec registry. Built by whoever assembles the
/// ledger subsystem; there is no ambient global registration.
#[derive(Default)]
pub struct StateRegistry {
    loaders: BTreeMap<u32, Loader>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in codec registered.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(VERSION_1, |store, root| {
            Ok(Box::new(v1::StateV1::load(store, root)?))
        });
        registry
    }

    pub fn register<F>(&mut self, version: u32, loader: F)
    where
        F: Fn(Arc<dyn Blockstore>, Root) -> Result<Box<dyn LedgerState>, StateError>
            + Send
            + Sync
            + 'static,
    {
        self.loaders.insert(version, Box::new(loader));
    }

    /// Load a read handle for the given head, dispatching on its version tag.
    pub fn load(
        &self,
        store: Arc<dyn Blockstore>,
        head: StateHead,
    ) -> Result<Box<dyn LedgerState>, StateError> {
        let loader = self
            .loaders
            .get(&head.version)
            .ok_or(StateError::UnsupportedVersion {
                version: head.version,
            })?;
        loader(store, head.root)
    }
}

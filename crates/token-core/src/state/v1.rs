//! Version 1 state codec.
//!
//! Layout: one CBOR state node `{info, balances, approvals, bitwidth}` where
//! `balances` roots a holder→amount trie and `approvals` roots a two-level
//! holder→(spender→amount) relation. The inner indirection is kept explicit
//! so enumerating holders never loads any approval subtree. Zero amounts are
//! pruned rather than stored.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::amount::TokenAmount;
use crate::error::{ActorError, StateError};
use crate::hamt::{Hamt, HamtIter, DEFAULT_BITWIDTH};
use crate::state::{ApprovalIter, HolderIter, LedgerState, TokenInfo};
use crate::store::{Blockstore, Root};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StateNode {
    info: TokenInfo,
    balances: Root,
    approvals: Root,
    bitwidth: u32,
}

fn corrupt(err: impl std::fmt::Display, what: &str) -> StateError {
    StateError::Corrupt(format!("{what}: {err}"))
}

fn encode<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>, StateError> {
    serde_cbor::to_vec(value).map_err(|e| corrupt(e, what))
}

fn decode_amount(bytes: &[u8]) -> Result<TokenAmount, StateError> {
    serde_cbor::from_slice(bytes).map_err(|e| corrupt(e, "undecodable amount"))
}

fn decode_root(bytes: &[u8]) -> Result<Root, StateError> {
    serde_cbor::from_slice(bytes).map_err(|e| corrupt(e, "undecodable inner root"))
}

fn decode_address(bytes: &[u8]) -> Result<Address, StateError> {
    Address::from_bytes(bytes).map_err(|e| corrupt(e, "undecodable address key"))
}

/// A v1 token state handle bound to its blockstore.
pub struct StateV1 {
    store: Arc<dyn Blockstore>,
    node: StateNode,
}

impl StateV1 {
    /// Initialize fresh state: the entire supply is credited to the issuer.
    /// The issuer address must already be resolved to its ID form.
    pub fn create(store: Arc<dyn Blockstore>, info: TokenInfo) -> Result<Self, StateError> {
        let (balances, approvals) = {
            let bs = store.as_ref();
            let mut balances = Hamt::empty(bs, DEFAULT_BITWIDTH)?;
            if !info.total_supply.is_zero() {
                balances.set(
                    &info.issuer.to_bytes(),
                    &encode(&info.total_supply, "unencodable amount")?,
                )?;
            }
            let approvals = Hamt::empty(bs, DEFAULT_BITWIDTH)?;
            (balances.flush()?, approvals.flush()?)
        };
        Ok(Self {
            store,
            node: StateNode {
                info,
                balances,
                approvals,
                bitwidth: DEFAULT_BITWIDTH,
            },
        })
    }

    pub fn load(store: Arc<dyn Blockstore>, root: Root) -> Result<Self, StateError> {
        let block = store.get(&root)?;
        let node: StateNode =
            serde_cbor::from_slice(&block).map_err(|e| corrupt(e, "undecodable state node"))?;
        Ok(Self { store, node })
    }

    /// Persist the state node and return the new root.
    pub fn flush(&self) -> Result<Root, StateError> {
        let block = encode(&self.node, "unencodable state node")?;
        Ok(self.store.put(&block)?)
    }

    fn balances(&self) -> Result<Hamt<'_>, StateError> {
        Hamt::load(self.store.as_ref(), &self.node.balances, self.node.bitwidth)
    }

    fn approvals_map(&self) -> Result<Hamt<'_>, StateError> {
        Hamt::load(
            self.store.as_ref(),
            &self.node.approvals,
            self.node.bitwidth,
        )
    }

    pub fn credit(&mut self, to: &Address, amount: &TokenAmount) -> Result<(), StateError> {
        if amount.is_zero() {
            return Ok(());
        }
        let mut balances = self.balances()?;
        let current = self.balance_of(to)?;
        let updated = &current + amount;
        balances.set(&to.to_bytes(), &encode(&updated, "unencodable amount")?)?;
        self.node.balances = balances.flush()?;
        Ok(())
    }

    pub fn debit(&mut self, from: &Address, amount: &TokenAmount) -> Result<(), ActorError> {
        let current = self.balance_of(from)?;
        let remaining =
            current
                .checked_sub(amount)
                .ok_or_else(|| ActorError::InsufficientBalance {
                    holder: from.clone(),
                    balance: current.clone(),
                    required: amount.clone(),
                })?;
        let mut balances = self.balances()?;
        if remaining.is_zero() {
            balances.delete(&from.to_bytes())?;
        } else {
            balances.set(&from.to_bytes(), &encode(&remaining, "unencodable amount")?)?;
        }
        self.node.balances = balances.flush()?;
        Ok(())
    }

    pub fn allowance(
        &self,
        holder: &Address,
        spender: &Address,
    ) -> Result<TokenAmount, StateError> {
        let outer = self.approvals_map()?;
        let Some(inner_root) = outer.get(&holder.to_bytes())? else {
            return Ok(TokenAmount::zero());
        };
        let inner = Hamt::load(
            self.store.as_ref(),
            &decode_root(&inner_root)?,
            self.node.bitwidth,
        )?;
        match inner.get(&spender.to_bytes())? {
            Some(bytes) => decode_amount(&bytes),
            None => Ok(TokenAmount::zero()),
        }
    }

    /// Overwrite (never increment) the holder→spender allowance. Zero revokes
    /// and prunes the entry.
    pub fn set_allowance(
        &mut self,
        holder: &Address,
        spender: &Address,
        amount: &TokenAmount,
    ) -> Result<(), StateError> {
        let mut outer = self.approvals_map()?;
        let mut inner = match outer.get(&holder.to_bytes())? {
            Some(bytes) => Hamt::load(
                self.store.as_ref(),
                &decode_root(&bytes)?,
                self.node.bitwidth,
            )?,
            None => Hamt::empty(self.store.as_ref(), self.node.bitwidth)?,
        };
        if amount.is_zero() {
            inner.delete(&spender.to_bytes())?;
        } else {
            inner.set(&spender.to_bytes(), &encode(amount, "unencodable amount")?)?;
        }
        if inner.is_empty() {
            outer.delete(&holder.to_bytes())?;
        } else {
            let inner_root = inner.flush()?;
            outer.set(
                &holder.to_bytes(),
                &encode(&inner_root, "unencodable inner root")?,
            )?;
        }
        self.node.approvals = outer.flush()?;
        Ok(())
    }

    /// Spend part of an allowance, decrementing (never resetting) it, so
    /// repeated delegated calls cannot overspend.
    pub fn consume_allowance(
        &mut self,
        holder: &Address,
        spender: &Address,
        amount: &TokenAmount,
    ) -> Result<(), ActorError> {
        let available = self.allowance(holder, spender)?;
        let remaining =
            available
                .checked_sub(amount)
                .ok_or_else(|| ActorError::InsufficientAllowance {
                    holder: holder.clone(),
                    spender: spender.clone(),
                    available: available.clone(),
                    required: amount.clone(),
                })?;
        self.set_allowance(holder, spender, &remaining)?;
        Ok(())
    }

    /// Check conservation of supply and that no zero balance or allowance
    /// entry is stored. Violations surface as corrupt state.
    pub fn check_invariants(&self) -> Result<(), StateError> {
        let mut sum = TokenAmount::zero();
        for item in self.holders()? {
            let (holder, balance) = item?;
            if balance.is_zero() {
                return Err(StateError::Corrupt(format!(
                    "zero balance entry for {holder}"
                )));
            }
            sum += &balance;
        }
        if sum != self.node.info.total_supply {
            return Err(StateError::Corrupt(format!(
                "supply not conserved: balances sum to {sum}, total supply is {}",
                self.node.info.total_supply
            )));
        }
        for item in self.approvals()? {
            let (holder, spender, available) = item?;
            if available.is_zero() {
                return Err(StateError::Corrupt(format!(
                    "zero allowance entry for {holder}->{spender}"
                )));
            }
        }
        Ok(())
    }
}

impl LedgerState for StateV1 {
    fn info(&self) -> &TokenInfo {
        &self.node.info
    }

    fn balance_of(&self, holder: &Address) -> Result<TokenAmount, StateError> {
        match self.balances()?.get(&holder.to_bytes())? {
            Some(bytes) => decode_amount(&bytes),
            None => Ok(TokenAmount::zero()),
        }
    }

    fn approvals_by(
        &self,
        holder: &Address,
    ) -> Result<BTreeMap<Address, TokenAmount>, StateError> {
        let outer = self.approvals_map()?;
        let Some(inner_root) = outer.get(&holder.to_bytes())? else {
            return Ok(BTreeMap::new());
        };
        let inner = Hamt::load(
            self.store.as_ref(),
            &decode_root(&inner_root)?,
            self.node.bitwidth,
        )?;
        let mut out = BTreeMap::new();
        for item in inner.iter() {
            let (key, value) = item?;
            out.insert(decode_address(&key)?, decode_amount(&value)?);
        }
        Ok(out)
    }

    fn holders(&self) -> Result<HolderIter<'_>, StateError> {
        let balances = self.balances()?;
        Ok(Box::new(balances.iter().map(|item| {
            let (key, value) = item?;
            Ok((decode_address(&key)?, decode_amount(&value)?))
        })))
    }

    fn approvals(&self) -> Result<ApprovalIter<'_>, StateError> {
        let outer = self.approvals_map()?;
        Ok(Box::new(ApprovalsIter {
            store: self.store.as_ref(),
            bitwidth: self.node.bitwidth,
            outer: outer.iter(),
            inner: None,
            failed: false,
        }))
    }
}

/// Flattens the two-level approvals relation, loading each holder's spender
/// trie only when the traversal reaches it.
struct ApprovalsIter<'a> {
    store: &'a dyn Blockstore,
    bitwidth: u32,
    outer: HamtIter<'a>,
    inner: Option<(Address, HamtIter<'a>)>,
    failed: bool,
}

impl<'a> Iterator for ApprovalsIter<'a> {
    type Item = Result<(Address, Address, TokenAmount), StateError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some((holder, inner)) = self.inner.as_mut() {
                match inner.next() {
                    Some(Ok((key, value))) => {
                        let holder = holder.clone();
                        let item = (|| {
                            Ok((holder, decode_address(&key)?, decode_amount(&value)?))
                        })();
                        if item.is_err() {
                            self.failed = true;
                        }
                        return Some(item);
                    }
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    None => {
                        self.inner = None;
                    }
                }
                continue;
            }
            match self.outer.next()? {
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
                Ok((key, value)) => {
                    let loaded = (|| {
                        let holder = decode_address(&key)?;
                        let inner =
                            Hamt::load(self.store, &decode_root(&value)?, self.bitwidth)?;
                        Ok::<_, StateError>((holder, inner.iter()))
                    })();
                    match loaded {
                        Ok(entry) => self.inner = Some(entry),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlockstore;

    fn issuer() -> Address {
        Address::Id(100)
    }

    fn new_state(supply: u64) -> StateV1 {
        let store: Arc<dyn Blockstore> = Arc::new(MemoryBlockstore::new());
        StateV1::create(
            store,
            TokenInfo {
                name: "Foo".into(),
                symbol: "FOO".into(),
                decimals: 18,
                total_supply: TokenAmount::from(supply),
                icon: Vec::new(),
                issuer: issuer(),
            },
        )
        .unwrap()
    }

    #[test]
    fn create_credits_issuer_with_entire_supply() {
        let state = new_state(1_000);
        assert_eq!(
            state.balance_of(&issuer()).unwrap(),
            TokenAmount::from(1_000)
        );
        assert_eq!(
            state.balance_of(&Address::Id(7)).unwrap(),
            TokenAmount::zero()
        );
        state.check_invariants().unwrap();
    }

    #[test]
    fn debit_to_zero_prunes_the_holder() {
        let mut state = new_state(500);
        let bob = Address::Id(101);
        state.debit(&issuer(), &TokenAmount::from(500)).unwrap();
        state.credit(&bob, &TokenAmount::from(500)).unwrap();

        let holders: Vec<_> = state
            .holders()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(holders, vec![(bob, TokenAmount::from(500))]);
        state.check_invariants().unwrap();
    }

    #[test]
    fn overdraft_is_refused_and_state_unchanged() {
        let mut state = new_state(100);
        let err = state.debit(&issuer(), &TokenAmount::from(101)).unwrap_err();
        assert!(matches!(err, ActorError::InsufficientBalance { .. }));
        assert_eq!(
            state.balance_of(&issuer()).unwrap(),
            TokenAmount::from(100)
        );
        state.check_invariants().unwrap();
    }

    #[test]
    fn allowance_overwrite_and_revoke() {
        let mut state = new_state(100);
        let carol = Address::Id(102);

        state
            .set_allowance(&issuer(), &carol, &TokenAmount::from(50))
            .unwrap();
        state
            .set_allowance(&issuer(), &carol, &TokenAmount::from(30))
            .unwrap();
        assert_eq!(
            state.allowance(&issuer(), &carol).unwrap(),
            TokenAmount::from(30)
        );

        state
            .set_allowance(&issuer(), &carol, &TokenAmount::zero())
            .unwrap();
        assert_eq!(
            state.allowance(&issuer(), &carol).unwrap(),
            TokenAmount::zero()
        );
        assert!(state.approvals_by(&issuer()).unwrap().is_empty());
        assert_eq!(state.approvals().unwrap().count(), 0);
    }

    #[test]
    fn consume_allowance_decrements_instead_of_resetting() {
        let mut state = new_state(100);
        let carol = Address::Id(102);
        state
            .set_allowance(&issuer(), &carol, &TokenAmount::from(100))
            .unwrap();
        state
            .consume_allowance(&issuer(), &carol, &TokenAmount::from(60))
            .unwrap();
        assert_eq!(
            state.allowance(&issuer(), &carol).unwrap(),
            TokenAmount::from(40)
        );

        let err = state
            .consume_allowance(&issuer(), &carol, &TokenAmount::from(41))
            .unwrap_err();
        assert!(matches!(err, ActorError::InsufficientAllowance { .. }));
        assert_eq!(
            state.allowance(&issuer(), &carol).unwrap(),
            TokenAmount::from(40)
        );
    }

    #[test]
    fn approvals_traversal_covers_every_pair() {
        let mut state = new_state(100);
        let spenders = [Address::Id(201), Address::Id(202), Address::Id(203)];
        for (i, spender) in spenders.iter().enumerate() {
            state
                .set_allowance(&issuer(), spender, &TokenAmount::from((i + 1) as u64))
                .unwrap();
        }
        state
            .set_allowance(&Address::Id(300), &spenders[0], &TokenAmount::from(9))
            .unwrap();

        let mut seen: Vec<_> = state
            .approvals()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        seen.sort();
        assert_eq!(seen.len(), 4);
        assert!(seen.contains(&(
            Address::Id(300),
            spenders[0].clone(),
            TokenAmount::from(9)
        )));
    }

    #[test]
    fn holder_traversal_fuses_on_missing_trie_block() {
        let store = Arc::new(MemoryBlockstore::new());
        let dyn_store: Arc<dyn Blockstore> = store.clone();
        let mut state = StateV1::create(
            dyn_store,
            TokenInfo {
                name: "Foo".into(),
                symbol: "FOO".into(),
                decimals: 18,
                total_supply: TokenAmount::from(200),
                icon: Vec::new(),
                issuer: issuer(),
            },
        )
        .unwrap();
        for id in 0..200u64 {
            state.debit(&issuer(), &TokenAmount::from(1)).unwrap();
            state.credit(&Address::Id(500 + id), &TokenAmount::from(1)).unwrap();
        }
        let root = state.flush().unwrap();

        // Keep only the state node and the two trie roots; every deeper
        // balance node goes missing.
        let broken = MemoryBlockstore::new();
        for r in [root, state.node.balances, state.node.approvals] {
            broken.put(&store.get(&r).unwrap()).unwrap();
        }

        let reloaded = StateV1::load(Arc::new(broken), root).unwrap();
        let mut iter = reloaded.holders().unwrap();
        let mut yielded = 0;
        let mut errors = 0;
        for item in iter.by_ref() {
            match item {
                Ok(_) => yielded += 1,
                Err(_) => errors += 1,
            }
        }
        assert_eq!(errors, 1);
        assert!(yielded < 200);
        assert!(iter.next().is_none());
    }

    #[test]
    fn reads_are_stable_for_a_fixed_root() {
        let mut state = new_state(1_000);
        state.debit(&issuer(), &TokenAmount::from(300)).unwrap();
        state.credit(&Address::Id(101), &TokenAmount::from(300)).unwrap();
        let root = state.flush().unwrap();

        let store = Arc::clone(&state.store);
        for _ in 0..3 {
            let loaded = StateV1::load(store.clone(), root).unwrap();
            assert_eq!(
                loaded.balance_of(&issuer()).unwrap(),
                TokenAmount::from(700)
            );
            assert_eq!(
                loaded.balance_of(&Address::Id(101)).unwrap(),
                TokenAmount::from(300)
            );
        }
    }
}

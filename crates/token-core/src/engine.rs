//! Single-threaded execution engine.
//!
//! Exactly one mutation is ever in flight against a ledger's root: `push`
//! runs a message to completion, commits the derived root on success, and
//! discards everything on failure. Reads always pin an already-finalized
//! root. Each push consumes the sender's next sequence number, so accepted
//! messages from one sender never share a nonce.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::actor::{self, AddressResolver};
use crate::address::Address;
use crate::error::{ActorError, EngineError, StateError};
use crate::message::{method, ConstructorParams, ExecParams, ExecReturn, Message, MsgId, INIT_ADDRESS};
use crate::state::{LedgerState, StateHead, StateRegistry, VERSION_1};
use crate::store::{Blockstore, MemoryBlockstore, Root};

/// IDs below this are reserved for system actors (init lives at 1).
const FIRST_USER_ID: u64 = 100;

/// Execution outcome recorded for one included message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceiptOutcome {
    Accepted {
        #[serde(with = "serde_bytes")]
        ret: Vec<u8>,
    },
    Rejected {
        code: u32,
        reason: String,
    },
}

impl ReceiptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ReceiptOutcome::Accepted { .. })
    }

    pub fn exit_code(&self) -> u32 {
        match self {
            ReceiptOutcome::Accepted { .. } => 0,
            ReceiptOutcome::Rejected { code, .. } => *code,
        }
    }
}

/// The engine's record of a message's execution: included, with either return
/// data or a terminal, non-retryable failure outcome.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub message: MsgId,
    pub nonce: u64,
    pub outcome: ReceiptOutcome,
}

/// Account table: key-address names to allocated IDs.
#[derive(Debug)]
struct AccountTable {
    accounts: BTreeMap<String, u64>,
    allocated: BTreeSet<u64>,
    next_id: u64,
}

impl AccountTable {
    fn new() -> Self {
        Self {
            accounts: BTreeMap::new(),
            allocated: BTreeSet::new(),
            next_id: FIRST_USER_ID,
        }
    }

    fn alloc(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.allocated.insert(id);
        id
    }
}

impl AddressResolver for AccountTable {
    fn resolve(&self, addr: &Address) -> Option<Address> {
        match addr {
            Address::Id(id) => self.allocated.contains(id).then(|| addr.clone()),
            Address::Key(name) => self.accounts.get(name).map(|id| Address::Id(*id)),
        }
    }

    fn resolve_or_create(&mut self, addr: &Address) -> Option<Address> {
        if let Address::Key(name) = addr {
            if !self.accounts.contains_key(name) {
                let id = self.alloc();
                self.accounts.insert(name.clone(), id);
            }
        }
        self.resolve(addr)
    }
}

pub struct Engine {
    store: Arc<MemoryBlockstore>,
    registry: StateRegistry,
    table: AccountTable,
    actors: BTreeMap<Address, StateHead>,
    nonces: BTreeMap<Address, u64>,
    receipts: BTreeMap<MsgId, Receipt>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_registry(StateRegistry::with_builtin())
    }

    pub fn with_registry(registry: StateRegistry) -> Self {
        Self {
            store: Arc::new(MemoryBlockstore::new()),
            registry,
            table: AccountTable::new(),
            actors: BTreeMap::new(),
            nonces: BTreeMap::new(),
            receipts: BTreeMap::new(),
        }
    }

    fn shared_store(&self) -> Arc<dyn Blockstore> {
        self.store.clone()
    }

    /// Include one message: assign the sender's next nonce, execute, record
    /// the receipt. Engine-level failures (unknown ledger, store failure)
    /// abort before inclusion and leave the nonce unspent.
    pub fn push(&mut self, mut msg: Message) -> Result<MsgId, EngineError> {
        let sender = self.table.resolve_or_create(&msg.from).ok_or_else(|| {
            EngineError::UnknownSender {
                address: msg.from.clone(),
            }
        })?;
        let nonce = self.nonces.get(&sender).copied().unwrap_or(0);
        msg.nonce = nonce;
        let id = msg.id()?;

        let result = self.execute(&msg, &sender)?;
        let outcome = match result {
            Ok(ret) => ReceiptOutcome::Accepted { ret },
            Err(e) => ReceiptOutcome::Rejected {
                code: e.exit_code(),
                reason: e.to_string(),
            },
        };
        self.nonces.insert(sender, nonce + 1);
        self.receipts.insert(
            id,
            Receipt {
                message: id,
                nonce,
                outcome,
            },
        );
        Ok(id)
    }

    /// Inner dispatch. `Ok(Err(_))` is a deterministic business failure that
    /// lands on the receipt; `Err(_)` never made it into the chain.
    fn execute(
        &mut self,
        msg: &Message,
        sender: &Address,
    ) -> Result<Result<Vec<u8>, ActorError>, EngineError> {
        if msg.to == INIT_ADDRESS {
            return self.exec_create(msg);
        }

        let head = *self
            .actors
            .get(&msg.to)
            .ok_or_else(|| EngineError::UnknownLedger {
                address: msg.to.clone(),
            })?;
        match actor::apply(
            self.shared_store(),
            head,
            sender,
            msg.method,
            &msg.params,
            &mut self.table,
        ) {
            Ok(root) => {
                self.actors.insert(
                    msg.to.clone(),
                    StateHead {
                        version: head.version,
                        root,
                    },
                );
                Ok(Ok(Vec::new()))
            }
            Err(ActorError::State(e)) => Err(e.into()),
            Err(e) => Ok(Err(e)),
        }
    }

    fn exec_create(
        &mut self,
        msg: &Message,
    ) -> Result<Result<Vec<u8>, ActorError>, EngineError> {
        if msg.method != method::INIT_EXEC {
            return Ok(Err(ActorError::UnknownMethod { method: msg.method }));
        }
        let exec: ExecParams = match serde_cbor::from_slice(&msg.params) {
            Ok(p) => p,
            Err(e) => {
                return Ok(Err(ActorError::InvalidParams(format!(
                    "undecodable exec params: {e}"
                ))))
            }
        };
        if exec.version != VERSION_1 {
            return Ok(Err(ActorError::InvalidParams(format!(
                "unsupported actor version {}",
                exec.version
            ))));
        }
        let params: ConstructorParams = match serde_cbor::from_slice(&exec.constructor_params) {
            Ok(p) => p,
            Err(e) => {
                return Ok(Err(ActorError::InvalidParams(format!(
                    "undecodable constructor params: {e}"
                ))))
            }
        };
        match actor::construct(self.shared_store(), &params, &mut self.table) {
            Ok(root) => {
                let addr = Address::Id(self.table.alloc());
                self.actors.insert(
                    addr.clone(),
                    StateHead {
                        version: exec.version,
                        root,
                    },
                );
                let ret = serde_cbor::to_vec(&ExecReturn { actor: addr })?;
                Ok(Ok(ret))
            }
            Err(ActorError::State(e)) => Err(e.into()),
            Err(e) => Ok(Err(e)),
        }
    }

    pub fn receipt(&self, id: &MsgId) -> Option<&Receipt> {
        self.receipts.get(id)
    }

    /// Current head of a ledger actor, if one exists at that address.
    pub fn head(&self, ledger: &Address) -> Option<StateHead> {
        self.actors.get(ledger).copied()
    }

    /// Read handle against a ledger's current head.
    pub fn state(&self, ledger: &Address) -> Result<Box<dyn LedgerState>, EngineError> {
        let head = self.head(ledger).ok_or_else(|| EngineError::UnknownLedger {
            address: ledger.clone(),
        })?;
        Ok(self.registry.load(self.shared_store(), head)?)
    }

    /// Read handle against any historical head, e.g. one remembered before
    /// later mutations.
    pub fn state_at(&self, head: StateHead) -> Result<Box<dyn LedgerState>, StateError> {
        self.registry.load(self.shared_store(), head)
    }

    /// Resolve an address to its canonical ID form without allocating.
    pub fn resolve_id(&self, addr: &Address) -> Option<Address> {
        self.table.resolve(addr)
    }

    /// Reverse lookup: the key address that resolves to this ID, if any.
    pub fn account_key(&self, addr: &Address) -> Option<Address> {
        let Address::Id(id) = addr else {
            return None;
        };
        self.table
            .accounts
            .iter()
            .find(|(_, v)| *v == id)
            .map(|(name, _)| Address::Key(name.clone()))
    }

    pub fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        let blocks = self
            .store
            .export()
            .map_err(StateError::from)?
            .into_values()
            .map(|block| hex::encode(&block))
            .collect();
        Ok(EngineSnapshot {
            blocks,
            accounts: self.table.accounts.clone(),
            next_id: self.table.next_id,
            actors: self
                .actors
                .iter()
                .map(|(addr, head)| SnapshotActor {
                    address: addr.to_string(),
                    version: head.version,
                    root: head.root.to_string(),
                })
                .collect(),
            nonces: self
                .nonces
                .iter()
                .map(|(addr, n)| (addr.to_string(), *n))
                .collect(),
            receipts: self.receipts.values().cloned().collect(),
        })
    }

    /// Rebuild an engine from a snapshot, re-verifying every block's content
    /// address on the way in.
    pub fn restore(snapshot: EngineSnapshot) -> Result<Self, EngineError> {
        let mut engine = Engine::new();
        for block_hex in &snapshot.blocks {
            let block = hex::decode(block_hex)
                .map_err(|e| EngineError::Snapshot(format!("bad block hex: {e}")))?;
            engine.store.put(&block).map_err(StateError::from)?;
        }
        engine.table.accounts = snapshot.accounts;
        engine.table.next_id = snapshot.next_id;
        engine.table.allocated = engine.table.accounts.values().copied().collect();
        for actor in &snapshot.actors {
            let address: Address = actor
                .address
                .parse()
                .map_err(|e| EngineError::Snapshot(format!("bad actor address: {e}")))?;
            let root = Root::from_hex(&actor.root)
                .ok_or_else(|| EngineError::Snapshot(format!("bad root {}", actor.root)))?;
            // Actor heads must point at restored blocks.
            engine.store.get(&root).map_err(StateError::from)?;
            if let Address::Id(id) = &address {
                engine.table.allocated.insert(*id);
            }
            engine.actors.insert(
                address,
                StateHead {
                    version: actor.version,
                    root,
                },
            );
        }
        for (addr, nonce) in &snapshot.nonces {
            let address: Address = addr
                .parse()
                .map_err(|e| EngineError::Snapshot(format!("bad nonce address: {e}")))?;
            engine.nonces.insert(address, *nonce);
        }
        for receipt in snapshot.receipts {
            engine.receipts.insert(receipt.message, receipt);
        }
        Ok(engine)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotActor {
    pub address: String,
    pub version: u32,
    pub root: String,
}

/// Serializable image of the whole engine, used by the CLI to persist its toy
/// chain between invocations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub blocks: Vec<String>,
    pub accounts: BTreeMap<String, u64>,
    pub next_id: u64,
    pub actors: Vec<SnapshotActor>,
    pub nonces: BTreeMap<String, u64>,
    pub receipts: Vec<Receipt>,
}

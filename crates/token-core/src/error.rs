use thiserror::Error;

use crate::address::Address;
use crate::amount::TokenAmount;
use crate::store::Root;

/// Failure while reading or writing the content-addressed block store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block not found for root {root}")]
    NotFound { root: Root },

    #[error("blockstore i/o failure: {0}")]
    Io(String),
}

/// Failure while loading or traversing ledger state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    /// A block decoded from the store did not contain what the codec expects.
    #[error("corrupt state: {0}")]
    Corrupt(String),

    /// No codec is registered for the state's version tag. Fatal to the one
    /// query, not to the process.
    #[error("unsupported state version {version}")]
    UnsupportedVersion { version: u32 },
}

/// Local, pre-submission message construction failure. Never touches chain
/// state.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unsupported actor version {version}")]
    UnsupportedVersion { version: u32 },

    #[error("invalid message parameters: {0}")]
    InvalidParams(String),

    #[error("parameter encoding failure: {0}")]
    Encode(#[from] serde_cbor::Error),
}

/// Deterministic business-rule failure while applying a message. Carried on
/// the receipt as a non-zero exit code; never auto-retried.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("insufficient balance in {holder}: have {balance}, need {required}")]
    InsufficientBalance {
        holder: Address,
        balance: TokenAmount,
        required: TokenAmount,
    },

    #[error("insufficient allowance for {spender} on {holder}: have {available}, need {required}")]
    InsufficientAllowance {
        holder: Address,
        spender: Address,
        available: TokenAmount,
        required: TokenAmount,
    },

    #[error("recipient {recipient} cannot be resolved")]
    InvalidRecipient { recipient: Address },

    #[error("actor is already constructed")]
    AlreadyConstructed,

    #[error("unknown method {method}")]
    UnknownMethod { method: u64 },

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("state failure: {0}")]
    State(#[from] StateError),
}

impl ActorError {
    /// Stable non-zero exit code recorded on the message receipt.
    pub fn exit_code(&self) -> u32 {
        match self {
            ActorError::InvalidParams(_) => 1,
            ActorError::UnknownMethod { .. } => 2,
            ActorError::AlreadyConstructed => 3,
            ActorError::InvalidRecipient { .. } => 4,
            ActorError::InsufficientBalance { .. } => 5,
            ActorError::InsufficientAllowance { .. } => 6,
            ActorError::State(_) => 7,
        }
    }
}

/// Failure at the execution-engine boundary, before a message is included.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no ledger actor at address {address}")]
    UnknownLedger { address: Address },

    #[error("sender {address} cannot be resolved to an account")]
    UnknownSender { address: Address },

    #[error("state failure: {0}")]
    State(#[from] StateError),

    #[error("message encoding failure: {0}")]
    Encode(#[from] serde_cbor::Error),

    #[error("invalid snapshot: {0}")]
    Snapshot(String),
}

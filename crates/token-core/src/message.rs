//! Version-aware, pure construction of mutation messages.
//!
//! Builders never inspect chain state, so messages can be built offline and
//! unsigned; sufficiency of balances and allowances is checked only at
//! application time, since the true state at execution may differ from build
//! time.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::address::Address;
use crate::amount::TokenAmount;
use crate::error::BuildError;
use crate::state::{TokenInfo, VERSION_1};

/// The system init actor that instantiates new ledger actors.
pub const INIT_ADDRESS: Address = Address::Id(1);

/// Method numbers, stable per version.
pub mod method {
    /// `Exec` on the init actor.
    pub const INIT_EXEC: u64 = 2;

    pub const CONSTRUCTOR: u64 = 1;
    pub const TRANSFER: u64 = 2;
    pub const APPROVE: u64 = 3;
    pub const TRANSFER_FROM: u64 = 4;
}

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SYMBOL_LEN: usize = 16;
pub const MAX_DECIMALS: u64 = 38;
pub const MAX_ICON_BYTES: usize = 256 * 1024;

/// One mutation request addressed to a ledger actor (or to the init actor for
/// creation). `nonce` is assigned by the engine at submission.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub method: u64,
    #[serde(with = "serde_bytes")]
    pub params: Vec<u8>,
    pub value: TokenAmount,
}

impl Message {
    /// Message identity: hash of the canonical encoding.
    pub fn id(&self) -> Result<MsgId, serde_cbor::Error> {
        let bytes = serde_cbor::to_vec(self)?;
        Ok(MsgId(Sha256::digest(&bytes).into()))
    }
}

/// Content identity of a message, used to poll its receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsgId([u8; 32]);

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for MsgId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MsgId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| D::Error::custom("message id must be 32 bytes"))?;
        Ok(MsgId(arr))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConstructorParams {
    pub name: String,
    pub symbol: String,
    pub decimals: u64,
    #[serde(with = "serde_bytes")]
    pub icon: Vec<u8>,
    pub total_supply: TokenAmount,
    pub issuer: Address,
}

/// Init-actor exec request: which actor version to instantiate, and its
/// encoded constructor parameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecParams {
    pub version: u32,
    #[serde(with = "serde_bytes")]
    pub constructor_params: Vec<u8>,
}

/// Return data of a successful exec: the new actor's address.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecReturn {
    pub actor: Address,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferParams {
    pub to: Address,
    pub amount: TokenAmount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferFromParams {
    pub holder: Address,
    pub to: Address,
    pub amount: TokenAmount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApproveParams {
    pub spender: Address,
    pub amount: TokenAmount,
}

/// Pure, I/O-free construction of the four mutation messages.
pub trait MessageBuilder {
    /// Message instantiating a new token actor. The sender becomes the issuer
    /// and receives the entire supply.
    fn create(&self, info: &TokenInfo) -> Result<Message, BuildError>;

    /// Message transferring an amount from the sender to another account.
    fn transfer(
        &self,
        ledger: &Address,
        to: &Address,
        amount: &TokenAmount,
    ) -> Result<Message, BuildError>;

    /// Message transferring an amount out of `holder`'s balance via the
    /// sender's delegation.
    fn transfer_from(
        &self,
        ledger: &Address,
        holder: &Address,
        to: &Address,
        amount: &TokenAmount,
    ) -> Result<Message, BuildError>;

    /// Message approving `spender` to spend up to `amount` on the sender's
    /// behalf.
    fn approve(
        &self,
        ledger: &Address,
        spender: &Address,
        amount: &TokenAmount,
    ) -> Result<Message, BuildError>;
}

/// Builder for the requested actor version.
pub fn message_builder(
    version: u32,
    from: Address,
) -> Result<Box<dyn MessageBuilder>, BuildError> {
    match version {
        VERSION_1 => Ok(Box::new(BuilderV1 { from })),
        other => Err(BuildError::UnsupportedVersion { version: other }),
    }
}

struct BuilderV1 {
    from: Address,
}

impl BuilderV1 {
    fn message(&self, to: Address, method: u64, params: Vec<u8>) -> Message {
        Message {
            from: self.from.clone(),
            to,
            nonce: 0,
            method,
            params,
            value: TokenAmount::zero(),
        }
    }
}

impl MessageBuilder for BuilderV1 {
    fn create(&self, info: &TokenInfo) -> Result<Message, BuildError> {
        if info.name.is_empty() || info.name.len() > MAX_NAME_LEN {
            return Err(BuildError::InvalidParams(format!(
                "token name must be 1..={MAX_NAME_LEN} bytes"
            )));
        }
        if info.symbol.is_empty() || info.symbol.len() > MAX_SYMBOL_LEN {
            return Err(BuildError::InvalidParams(format!(
                "token symbol must be 1..={MAX_SYMBOL_LEN} bytes"
            )));
        }
        if info.decimals > MAX_DECIMALS {
            return Err(BuildError::InvalidParams(format!(
                "decimals must be at most {MAX_DECIMALS}"
            )));
        }
        if info.icon.len() > MAX_ICON_BYTES {
            return Err(BuildError::InvalidParams(format!(
                "icon must be at most {MAX_ICON_BYTES} bytes"
            )));
        }

        let params = ConstructorParams {
            name: info.name.clone(),
            symbol: info.symbol.clone(),
            decimals: info.decimals,
            icon: info.icon.clone(),
            total_supply: info.total_supply.clone(),
            issuer: self.from.clone(),
        };
        let exec = ExecParams {
            version: VERSION_1,
            constructor_params: serde_cbor::to_vec(&params)?,
        };
        Ok(self.message(INIT_ADDRESS, method::INIT_EXEC, serde_cbor::to_vec(&exec)?))
    }

    fn transfer(
        &self,
        ledger: &Address,
        to: &Address,
        amount: &TokenAmount,
    ) -> Result<Message, BuildError> {
        let params = TransferParams {
            to: to.clone(),
            amount: amount.clone(),
        };
        Ok(self.message(
            ledger.clone(),
            method::TRANSFER,
            serde_cbor::to_vec(&params)?,
        ))
    }

    fn transfer_from(
        &self,
        ledger: &Address,
        holder: &Address,
        to: &Address,
        amount: &TokenAmount,
    ) -> Result<Message, BuildError> {
        let params = TransferFromParams {
            holder: holder.clone(),
            to: to.clone(),
            amount: amount.clone(),
        };
        Ok(self.message(
            ledger.clone(),
            method::TRANSFER_FROM,
            serde_cbor::to_vec(&params)?,
        ))
    }

    fn approve(
        &self,
        ledger: &Address,
        spender: &Address,
        amount: &TokenAmount,
    ) -> Result<Message, BuildError> {
        let params = ApproveParams {
            spender: spender.clone(),
            amount: amount.clone(),
        };
        Ok(self.message(
            ledger.clone(),
            method::APPROVE,
            serde_cbor::to_vec(&params)?,
        ))
    }
}

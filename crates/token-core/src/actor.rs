//! Mutation semantics of the token actor.
//!
//! The execution engine invokes [`apply`] with the current state head, the
//! resolved caller, and the raw method/params of one message. A successful
//! call returns the root of the derived state; any failure leaves the prior
//! root untouched, so whole-method atomicity falls out of the persistent
//! structures.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::address::Address;
use crate::error::ActorError;
use crate::message::{
    method, ApproveParams, ConstructorParams, TransferFromParams, TransferParams,
};
use crate::state::v1::StateV1;
use crate::state::{StateHead, TokenInfo, VERSION_1};
use crate::store::{Blockstore, Root};

/// Address resolution, provided by the execution engine.
///
/// Key addresses resolve by allocating an account on first use; an ID address
/// resolves only if it was previously allocated.
pub trait AddressResolver {
    fn resolve(&self, addr: &Address) -> Option<Address>;
    fn resolve_or_create(&mut self, addr: &Address) -> Option<Address>;
}

fn decode_params<T: DeserializeOwned>(params: &[u8]) -> Result<T, ActorError> {
    serde_cbor::from_slice(params)
        .map_err(|e| ActorError::InvalidParams(format!("undecodable params: {e}")))
}

/// Run the constructor: initialize state with the full supply credited to the
/// resolved issuer, and return the initial root.
pub fn construct(
    store: Arc<dyn Blockstore>,
    params: &ConstructorParams,
    resolver: &mut dyn AddressResolver,
) -> Result<Root, ActorError> {
    let issuer = resolver
        .resolve_or_create(&params.issuer)
        .ok_or_else(|| ActorError::InvalidRecipient {
            recipient: params.issuer.clone(),
        })?;
    let info = TokenInfo {
        name: params.name.clone(),
        symbol: params.symbol.clone(),
        decimals: params.decimals,
        total_supply: params.total_supply.clone(),
        icon: params.icon.clone(),
        issuer,
    };
    let state = StateV1::create(store, info)?;
    Ok(state.flush()?)
}

/// Apply one mutation message to an already-constructed actor.
///
/// `caller` must be the engine-resolved ID address of the message sender;
/// authorization follows from using it as the debit subject.
pub fn apply(
    store: Arc<dyn Blockstore>,
    head: StateHead,
    caller: &Address,
    method_num: u64,
    params: &[u8],
    resolver: &mut dyn AddressResolver,
) -> Result<Root, ActorError> {
    if head.version != VERSION_1 {
        return Err(ActorError::State(
            crate::error::StateError::UnsupportedVersion {
                version: head.version,
            },
        ));
    }
    let mut state = StateV1::load(store, head.root)?;

    match method_num {
        method::CONSTRUCTOR => return Err(ActorError::AlreadyConstructed),
        method::TRANSFER => {
            let params: TransferParams = decode_params(params)?;
            let to = resolver.resolve_or_create(&params.to).ok_or(
                ActorError::InvalidRecipient {
                    recipient: params.to.clone(),
                },
            )?;
            state.debit(caller, &params.amount)?;
            state.credit(&to, &params.amount)?;
        }
        method::APPROVE => {
            let params: ApproveParams = decode_params(params)?;
            let spender = resolver.resolve_or_create(&params.spender).ok_or(
                ActorError::InvalidRecipient {
                    recipient: params.spender.clone(),
                },
            )?;
            // Overwrite, never increment; zero is an explicit revocation.
            state.set_allowance(caller, &spender, &params.amount)?;
        }
        method::TRANSFER_FROM => {
            let params: TransferFromParams = decode_params(params)?;
            // An unknown holder simply has no allowance standing.
            let holder = resolver
                .resolve(&params.holder)
                .unwrap_or_else(|| params.holder.clone());
            let to = resolver.resolve_or_create(&params.to).ok_or(
                ActorError::InvalidRecipient {
                    recipient: params.to.clone(),
                },
            )?;
            state.consume_allowance(&holder, caller, &params.amount)?;
            state.debit(&holder, &params.amount)?;
            state.credit(&to, &params.amount)?;
        }
        other => return Err(ActorError::UnknownMethod { method: other }),
    }

    Ok(state.flush()?)
}

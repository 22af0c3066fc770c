// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Topic hashes and log decoders for the two watched events.
//!
//! `ConditionalOrderCreated(address indexed owner, params)` registers a
//! single conditional order. `MerkleRootSet(address indexed owner, root,
//! proof)` supersedes an owner's previously published merkle batch; when the
//! proof location is "emitted", the event payload carries the new batch
//! inline. Logs that fail to decode are not the events we think they are and
//! are dropped by the caller.

use crate::error::{WatchError, WatchResult};
use crate::types::{ConditionalOrderParams, ProofLocation};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, Log, H256, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;

pub static CONDITIONAL_ORDER_CREATED_TOPIC: Lazy<H256> = Lazy::new(|| {
    H256::from(keccak256(
        "ConditionalOrderCreated(address,(address,bytes32,bytes))",
    ))
});

pub static MERKLE_ROOT_SET_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256("MerkleRootSet(address,bytes32,(uint256,bytes))")));

/// Decoded `MerkleRootSet` payload. `orders` is non-empty only for the
/// "emitted" proof location, where the batch travels inside the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleRootSetEvent {
    pub owner: Address,
    pub root: H256,
    pub location: ProofLocation,
    pub orders: Vec<(Vec<H256>, ConditionalOrderParams)>,
}

/// Places an address in a 32-byte topic word the way the EVM indexes it.
pub fn owner_topic(owner: Address) -> H256 {
    let mut topic = H256::zero();
    topic.0[12..].copy_from_slice(owner.as_bytes());
    topic
}

fn indexed_address(log: &Log, index: usize) -> WatchResult<Address> {
    let topic = log
        .topics
        .get(index)
        .ok_or_else(|| WatchError::Decode(format!("missing topic {}", index)))?;
    Ok(Address::from_slice(&topic.as_bytes()[12..]))
}

fn params_param_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::FixedBytes(32),
        ParamType::Bytes,
    ])
}

fn params_from_token(token: Token) -> WatchResult<ConditionalOrderParams> {
    let mut fields = match token {
        Token::Tuple(fields) if fields.len() == 3 => fields.into_iter(),
        other => {
            return Err(WatchError::Decode(format!(
                "conditional order params is not a 3-tuple: {:?}",
                other
            )))
        }
    };
    let handler = match fields.next() {
        Some(Token::Address(a)) => a,
        other => return Err(WatchError::Decode(format!("bad handler token: {:?}", other))),
    };
    let salt = match fields.next() {
        Some(Token::FixedBytes(b)) if b.len() == 32 => H256::from_slice(&b),
        other => return Err(WatchError::Decode(format!("bad salt token: {:?}", other))),
    };
    let static_input = match fields.next() {
        Some(Token::Bytes(b)) => Bytes::from(b),
        other => {
            return Err(WatchError::Decode(format!(
                "bad static input token: {:?}",
                other
            )))
        }
    };
    Ok(ConditionalOrderParams {
        handler,
        salt,
        static_input,
    })
}

/// Decodes a `ConditionalOrderCreated` log into `(owner, params)`.
pub fn decode_conditional_order_created(
    log: &Log,
) -> WatchResult<(Address, ConditionalOrderParams)> {
    if log.topics.first() != Some(&*CONDITIONAL_ORDER_CREATED_TOPIC) {
        return Err(WatchError::Decode(
            "not a ConditionalOrderCreated log".to_string(),
        ));
    }
    let owner = indexed_address(log, 1)?;
    let tokens = abi::decode(&[params_param_type()], &log.data)
        .map_err(|e| WatchError::Decode(format!("ConditionalOrderCreated data: {}", e)))?;
    let params = params_from_token(
        tokens
            .into_iter()
            .next()
            .ok_or_else(|| WatchError::Decode("empty ConditionalOrderCreated data".to_string()))?,
    )?;
    Ok((owner, params))
}

/// Decodes a `MerkleRootSet` log. For the "emitted" proof location the
/// inner proof data is an ABI array of `(bytes32[] path, params)` entries.
pub fn decode_merkle_root_set(log: &Log) -> WatchResult<MerkleRootSetEvent> {
    if log.topics.first() != Some(&*MERKLE_ROOT_SET_TOPIC) {
        return Err(WatchError::Decode("not a MerkleRootSet log".to_string()));
    }
    let owner = indexed_address(log, 1)?;
    let tokens = abi::decode(
        &[
            ParamType::FixedBytes(32),
            ParamType::Tuple(vec![ParamType::Uint(256), ParamType::Bytes]),
        ],
        &log.data,
    )
    .map_err(|e| WatchError::Decode(format!("MerkleRootSet data: {}", e)))?;

    let mut tokens = tokens.into_iter();
    let root = match tokens.next() {
        Some(Token::FixedBytes(b)) if b.len() == 32 => H256::from_slice(&b),
        other => return Err(WatchError::Decode(format!("bad merkle root: {:?}", other))),
    };
    let (location_raw, proof_data) = match tokens.next() {
        Some(Token::Tuple(mut proof)) if proof.len() == 2 => {
            let data = match proof.pop() {
                Some(Token::Bytes(b)) => b,
                other => {
                    return Err(WatchError::Decode(format!("bad proof data: {:?}", other)))
                }
            };
            let location = match proof.pop() {
                Some(Token::Uint(u)) => u,
                other => {
                    return Err(WatchError::Decode(format!(
                        "bad proof location: {:?}",
                        other
                    )))
                }
            };
            (location, data)
        }
        other => return Err(WatchError::Decode(format!("bad proof tuple: {:?}", other))),
    };
    let location = ProofLocation::from_u256(location_raw).ok_or_else(|| {
        WatchError::Decode(format!("unknown proof location {}", location_raw))
    })?;

    let orders = if location == ProofLocation::Emitted {
        decode_emitted_orders(&proof_data)?
    } else {
        Vec::new()
    };

    Ok(MerkleRootSetEvent {
        owner,
        root,
        location,
        orders,
    })
}

fn decode_emitted_orders(data: &[u8]) -> WatchResult<Vec<(Vec<H256>, ConditionalOrderParams)>> {
    let entry_type = ParamType::Tuple(vec![
        ParamType::Array(Box::new(ParamType::FixedBytes(32))),
        params_param_type(),
    ]);
    let tokens = abi::decode(&[ParamType::Array(Box::new(entry_type))], data)
        .map_err(|e| WatchError::Decode(format!("emitted merkle orders: {}", e)))?;

    let entries = match tokens.into_iter().next() {
        Some(Token::Array(entries)) => entries,
        other => {
            return Err(WatchError::Decode(format!(
                "emitted merkle orders is not an array: {:?}",
                other
            )))
        }
    };

    let mut orders = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut fields = match entry {
            Token::Tuple(fields) if fields.len() == 2 => fields.into_iter(),
            other => {
                return Err(WatchError::Decode(format!(
                    "bad emitted merkle entry: {:?}",
                    other
                )))
            }
        };
        let path = match fields.next() {
            Some(Token::Array(elems)) => elems
                .into_iter()
                .map(|t| match t {
                    Token::FixedBytes(b) if b.len() == 32 => Ok(H256::from_slice(&b)),
                    other => Err(WatchError::Decode(format!("bad path element: {:?}", other))),
                })
                .collect::<WatchResult<Vec<_>>>()?,
            other => return Err(WatchError::Decode(format!("bad proof path: {:?}", other))),
        };
        let params = params_from_token(
            fields
                .next()
                .ok_or_else(|| WatchError::Decode("missing entry params".to_string()))?,
        )?;
        orders.push((path, params));
    }
    Ok(orders)
}

/// Encodes `params` as the event tuple; shared by tests and the handler
/// call path.
pub fn encode_params_token(params: &ConditionalOrderParams) -> Token {
    Token::Tuple(vec![
        Token::Address(params.handler),
        Token::FixedBytes(params.salt.as_bytes().to_vec()),
        Token::Bytes(params.static_input.to_vec()),
    ])
}

/// Helper to assemble proof-location tuples; the inverse of the decoder,
/// used by tests.
pub fn encode_merkle_root_set_data(
    root: H256,
    location: u64,
    orders: &[(Vec<H256>, ConditionalOrderParams)],
) -> Bytes {
    let inner = if location == 1 {
        abi::encode(&[Token::Array(
            orders
                .iter()
                .map(|(path, params)| {
                    Token::Tuple(vec![
                        Token::Array(
                            path.iter()
                                .map(|h| Token::FixedBytes(h.as_bytes().to_vec()))
                                .collect(),
                        ),
                        encode_params_token(params),
                    ])
                })
                .collect(),
        )])
    } else {
        Vec::new()
    };
    Bytes::from(abi::encode(&[
        Token::FixedBytes(root.as_bytes().to_vec()),
        Token::Tuple(vec![
            Token::Uint(U256::from(location)),
            Token::Bytes(inner),
        ]),
    ]))
}

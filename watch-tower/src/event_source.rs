// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Translates a block range into a `(block_number, log_index)`-ordered
//! sequence of decoded conditional-order events. Both watched topics are
//! fetched in one query so merkle-root updates travel the same path as
//! order creations. Logs that fail to decode are dropped; they are not the
//! events we think they are.

use crate::abi::{
    decode_conditional_order_created, decode_merkle_root_set, MerkleRootSetEvent,
    CONDITIONAL_ORDER_CREATED_TOPIC, MERKLE_ROOT_SET_TOPIC,
};
use crate::error::{WatchError, WatchResult};
use crate::eth_client::{BlockTarget, ChainRpc, LogQuery};
use crate::retry_with_max_attempts;
use crate::types::ConditionalOrderParams;
use ethers::types::{Address, Log, H256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

const RPC_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEventKind {
    Created {
        owner: Address,
        params: ConditionalOrderParams,
    },
    MerkleRootSet(MerkleRootSetEvent),
}

/// A decoded event with enough position information to preserve chain
/// ordering and registry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: H256,
    /// Contract that emitted the event
    pub source: Address,
    pub kind: OrderEventKind,
}

pub struct EventSource {
    network: String,
    rpc: Arc<dyn ChainRpc>,
    /// Optional owner allow-list; events from other owners are discarded
    owners: Option<HashSet<Address>>,
}

impl EventSource {
    pub fn new(network: String, rpc: Arc<dyn ChainRpc>, owners: Option<Vec<Address>>) -> Self {
        Self {
            network,
            rpc,
            owners: owners.map(|list| list.into_iter().collect()),
        }
    }

    /// Fetches and decodes all watched events in `[from, to]`. The
    /// RPC-returned order is preserved; providers return logs ascending by
    /// `(block_number, log_index)`.
    pub async fn fetch(&self, from: u64, to: BlockTarget) -> WatchResult<Vec<OrderEvent>> {
        let query = LogQuery {
            from_block: from,
            to_block: to,
            addresses: None,
            topics: vec![*CONDITIONAL_ORDER_CREATED_TOPIC, *MERKLE_ROOT_SET_TOPIC],
        };
        let logs = retry_with_max_attempts!(self.rpc.logs(&query), RPC_ATTEMPTS)?;

        let mut events = Vec::with_capacity(logs.len());
        let mut dropped = 0usize;
        for log in logs {
            match self.decode(&log) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    dropped += 1;
                    debug!(
                        "[{}] Dropping undecodable log in block {:?}: {}",
                        self.network, log.block_number, e
                    );
                }
            }
        }
        if dropped > 0 {
            debug!(
                "[{}] Dropped {} undecodable log(s) in range [{}, {:?}]",
                self.network, dropped, from, to
            );
        }
        Ok(events)
    }

    /// Decodes one log; `Ok(None)` means a valid event filtered out by the
    /// owner allow-list.
    fn decode(&self, log: &Log) -> WatchResult<Option<OrderEvent>> {
        let block_number = log
            .block_number
            .ok_or_else(|| WatchError::Decode("log without block number".to_string()))?
            .as_u64();
        let log_index = log
            .log_index
            .ok_or_else(|| WatchError::Decode("log without index".to_string()))?
            .as_u64();
        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| WatchError::Decode("log without tx hash".to_string()))?;

        let topic0 = log
            .topics
            .first()
            .ok_or_else(|| WatchError::Decode("log without topics".to_string()))?;
        let (owner, kind) = if *topic0 == *CONDITIONAL_ORDER_CREATED_TOPIC {
            let (owner, params) = decode_conditional_order_created(log)?;
            (owner, OrderEventKind::Created { owner, params })
        } else if *topic0 == *MERKLE_ROOT_SET_TOPIC {
            let event = decode_merkle_root_set(log)?;
            (event.owner, OrderEventKind::MerkleRootSet(event))
        } else {
            return Err(WatchError::Decode(format!("unknown topic {:#x}", topic0)));
        };

        if let Some(allowed) = &self.owners {
            if !allowed.contains(&owner) {
                return Ok(None);
            }
        }

        Ok(Some(OrderEvent {
            block_number,
            log_index,
            tx_hash,
            source: log.address,
            kind,
        }))
    }
}

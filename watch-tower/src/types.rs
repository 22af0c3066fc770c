// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Domain types shared across the watch tower: conditional orders as they are
//! registered from chain events, discrete (signable) orders as they are
//! submitted to the order book, and the poll-result sum connecting the two.

use ethers::abi::Token;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A fully-resolved block header as the watcher consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    /// Unix timestamp in seconds
    pub timestamp: i64,
}

/// The persisted cursor denoting the last block fully processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryBlock {
    pub number: u64,
    pub hash: H256,
    pub timestamp: i64,
}

/// Block-context overrides used by historical replay: the poll context is
/// built from the current tip rather than the block being replayed.
#[derive(Debug, Clone, Copy)]
pub struct PollOverrides {
    pub block_number: u64,
    pub timestamp: i64,
}

/// Identity of a conditional order within an owner. Equality is bytewise
/// over the whole triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalOrderParams {
    pub handler: Address,
    pub salt: H256,
    pub static_input: Bytes,
}

impl ConditionalOrderParams {
    /// keccak256 of the ABI-encoded triple; keys the filter policy and logs.
    pub fn id(&self) -> H256 {
        let encoded = ethers::abi::encode(&[Token::Tuple(vec![
            Token::Address(self.handler),
            Token::FixedBytes(self.salt.as_bytes().to_vec()),
            Token::Bytes(self.static_input.to_vec()),
        ])]);
        H256::from(keccak256(encoded))
    }
}

/// Merkle proof attached to orders published as part of a batch. `None`
/// proof means a "single" order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    pub merkle_root: H256,
    pub path: Vec<H256>,
}

/// Where a merkle-published batch stores its proofs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofLocation {
    Private,
    Emitted,
    Swarm,
    Waku,
    Reserved,
    Ipfs,
}

impl ProofLocation {
    pub fn from_u256(value: U256) -> Option<Self> {
        if value > U256::from(5u64) {
            return None;
        }
        match value.low_u64() {
            0 => Some(ProofLocation::Private),
            1 => Some(ProofLocation::Emitted),
            2 => Some(ProofLocation::Swarm),
            3 => Some(ProofLocation::Waku),
            4 => Some(ProofLocation::Reserved),
            5 => Some(ProofLocation::Ipfs),
            _ => None,
        }
    }
}

/// Status of a discrete order we have already emitted. A UID is never
/// removed from the registry; its status may only advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "SUBMITTED")]
    Submitted,
    #[serde(rename = "FILLED")]
    Filled,
}

/// 56-byte order identifier: `digest(32) ‖ owner(20) ‖ valid_to(4)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderUid(pub [u8; 56]);

impl OrderUid {
    pub fn new(digest: H256, owner: Address, valid_to: u32) -> Self {
        let mut bytes = [0u8; 56];
        bytes[0..32].copy_from_slice(digest.as_bytes());
        bytes[32..52].copy_from_slice(owner.as_bytes());
        bytes[52..56].copy_from_slice(&valid_to.to_be_bytes());
        OrderUid(bytes)
    }
}

impl fmt::Display for OrderUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for OrderUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderUid({})", self)
    }
}

impl Serialize for OrderUid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OrderUid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let stripped = s.strip_prefix("0x").unwrap_or(&s);
        let raw = hex::decode(stripped).map_err(serde::de::Error::custom)?;
        if raw.len() != 56 {
            return Err(serde::de::Error::custom(format!(
                "order uid must be 56 bytes, got {}",
                raw.len()
            )));
        }
        let mut bytes = [0u8; 56];
        bytes.copy_from_slice(&raw);
        Ok(OrderUid(bytes))
    }
}

/// Result of the most recent poll of a conditional order, persisted for
/// observability and deferral hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollInfo {
    pub timestamp: i64,
    pub block_number: u64,
    pub result: PollResultKind,
}

/// Payload-free mirror of [`PollResult`] suitable for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollResultKind {
    Success,
    TryNextBlock { reason: String },
    TryAtBlock { block: u64, reason: String },
    TryAtEpoch { timestamp: i64, reason: String },
    DontTryAgain { reason: String },
    UnexpectedError { message: String },
}

/// Outcome of asking the handler library to evaluate a conditional order at
/// a block context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    /// A discrete order is ready for submission.
    Success {
        order: DiscreteOrder,
        signature: Bytes,
    },
    /// Defer; nothing to do this block.
    TryNextBlock { reason: String },
    /// Defer until the given block number.
    TryAtBlock { block: u64, reason: String },
    /// Defer until the given unix epoch.
    TryAtEpoch { timestamp: i64, reason: String },
    /// The conditional order will never yield again; delete it.
    DontTryAgain { reason: String },
    /// Handler failure; counted, never fatal to the chain watcher.
    UnexpectedError { message: String },
}

impl PollResult {
    pub fn kind(&self) -> PollResultKind {
        match self {
            PollResult::Success { .. } => PollResultKind::Success,
            PollResult::TryNextBlock { reason } => PollResultKind::TryNextBlock {
                reason: reason.clone(),
            },
            PollResult::TryAtBlock { block, reason } => PollResultKind::TryAtBlock {
                block: *block,
                reason: reason.clone(),
            },
            PollResult::TryAtEpoch { timestamp, reason } => PollResultKind::TryAtEpoch {
                timestamp: *timestamp,
                reason: reason.clone(),
            },
            PollResult::DontTryAgain { reason } => PollResultKind::DontTryAgain {
                reason: reason.clone(),
            },
            PollResult::UnexpectedError { message } => PollResultKind::UnexpectedError {
                message: message.clone(),
            },
        }
    }
}

/// A conditional order as tracked in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalOrder {
    /// Transaction that emitted the creating event
    pub tx: H256,
    pub params: ConditionalOrderParams,
    pub proof: Option<Proof>,
    /// Discrete orders already emitted for this conditional order, as an
    /// array of `[uid, status]` pairs
    pub orders: Vec<(OrderUid, OrderStatus)>,
    /// Contract that emitted the creating event
    pub source_contract: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll: Option<PollInfo>,
}

impl ConditionalOrder {
    pub fn new(
        tx: H256,
        params: ConditionalOrderParams,
        proof: Option<Proof>,
        source_contract: Address,
    ) -> Self {
        Self {
            tx,
            params,
            proof,
            orders: Vec::new(),
            source_contract,
            last_poll: None,
        }
    }

    pub fn has_order(&self, uid: &OrderUid) -> bool {
        self.orders.iter().any(|(u, _)| u == uid)
    }

    /// Records a discrete order. No-op if the UID is already present.
    pub fn record_order(&mut self, uid: OrderUid, status: OrderStatus) {
        if !self.has_order(&uid) {
            self.orders.push((uid, status));
        }
    }

    /// Advances a UID's status. SUBMITTED -> FILLED only; a UID never
    /// regresses and is never removed.
    pub fn advance_status(&mut self, uid: &OrderUid, status: OrderStatus) -> bool {
        for (u, s) in self.orders.iter_mut() {
            if u == uid {
                if *s == OrderStatus::Submitted && status == OrderStatus::Filled {
                    *s = status;
                    return true;
                }
                return false;
            }
        }
        false
    }
}

// ============================================================================
// Discrete (GPv2) orders
// ============================================================================

static ORDER_TYPE_HASH: Lazy<H256> = Lazy::new(|| {
    H256::from(keccak256(
        "Order(address sellToken,address buyToken,address receiver,uint256 sellAmount,\
         uint256 buyAmount,uint32 validTo,bytes32 appData,uint256 feeAmount,bytes32 kind,\
         bool partiallyFillable,bytes32 sellTokenBalance,bytes32 buyTokenBalance)",
    ))
});

static DOMAIN_TYPE_HASH: Lazy<H256> = Lazy::new(|| {
    H256::from(keccak256(
        "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
    ))
});

pub static KIND_SELL: Lazy<H256> = Lazy::new(|| H256::from(keccak256("sell")));
pub static KIND_BUY: Lazy<H256> = Lazy::new(|| H256::from(keccak256("buy")));
pub static BALANCE_ERC20: Lazy<H256> = Lazy::new(|| H256::from(keccak256("erc20")));
pub static BALANCE_EXTERNAL: Lazy<H256> = Lazy::new(|| H256::from(keccak256("external")));
pub static BALANCE_INTERNAL: Lazy<H256> = Lazy::new(|| H256::from(keccak256("internal")));

/// A concrete, signable order as produced by the handler library. `kind`
/// and the balance flavours carry the on-chain keccak discriminators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscreteOrder {
    pub sell_token: Address,
    pub buy_token: Address,
    pub receiver: Address,
    pub sell_amount: U256,
    pub buy_amount: U256,
    pub valid_to: u32,
    pub app_data: H256,
    pub fee_amount: U256,
    pub kind: H256,
    pub partially_fillable: bool,
    pub sell_token_balance: H256,
    pub buy_token_balance: H256,
}

impl DiscreteOrder {
    /// EIP-712 domain separator of the settlement contract on `chain_id`.
    pub fn domain_separator(chain_id: u64, verifying_contract: Address) -> H256 {
        let encoded = ethers::abi::encode(&[
            Token::FixedBytes(DOMAIN_TYPE_HASH.as_bytes().to_vec()),
            Token::FixedBytes(keccak256("Gnosis Protocol").to_vec()),
            Token::FixedBytes(keccak256("v2").to_vec()),
            Token::Uint(U256::from(chain_id)),
            Token::Address(verifying_contract),
        ]);
        H256::from(keccak256(encoded))
    }

    /// EIP-712 struct hash of this order.
    pub fn struct_hash(&self) -> H256 {
        let encoded = ethers::abi::encode(&[
            Token::FixedBytes(ORDER_TYPE_HASH.as_bytes().to_vec()),
            Token::Address(self.sell_token),
            Token::Address(self.buy_token),
            Token::Address(self.receiver),
            Token::Uint(self.sell_amount),
            Token::Uint(self.buy_amount),
            Token::Uint(U256::from(self.valid_to)),
            Token::FixedBytes(self.app_data.as_bytes().to_vec()),
            Token::Uint(self.fee_amount),
            Token::FixedBytes(self.kind.as_bytes().to_vec()),
            Token::Bool(self.partially_fillable),
            Token::FixedBytes(self.sell_token_balance.as_bytes().to_vec()),
            Token::FixedBytes(self.buy_token_balance.as_bytes().to_vec()),
        ]);
        H256::from(keccak256(encoded))
    }

    /// EIP-712 digest under the given domain separator.
    pub fn digest(&self, domain_separator: H256) -> H256 {
        let mut message = Vec::with_capacity(66);
        message.extend_from_slice(&[0x19, 0x01]);
        message.extend_from_slice(domain_separator.as_bytes());
        message.extend_from_slice(self.struct_hash().as_bytes());
        H256::from(keccak256(message))
    }

    /// The 56-byte UID naming this order for `owner`.
    pub fn uid(&self, domain_separator: H256, owner: Address) -> OrderUid {
        OrderUid::new(self.digest(domain_separator), owner, self.valid_to)
    }

    pub fn kind_str(&self) -> Option<&'static str> {
        if self.kind == *KIND_SELL {
            Some("sell")
        } else if self.kind == *KIND_BUY {
            Some("buy")
        } else {
            None
        }
    }

    pub fn balance_str(flavour: &H256) -> Option<&'static str> {
        if *flavour == *BALANCE_ERC20 {
            Some("erc20")
        } else if *flavour == *BALANCE_EXTERNAL {
            Some("external")
        } else if *flavour == *BALANCE_INTERNAL {
            Some("internal")
        } else {
            None
        }
    }
}

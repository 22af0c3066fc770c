// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Contract towards the conditional-order handler library. The core only
//! knows that a handler evaluates order params in a block context and
//! answers with a [`PollResult`]; the production implementation asks the
//! source contract itself via `eth_call` and translates its typed reverts
//! into the poll-result sum.

use crate::abi::encode_params_token;
use crate::eth_client::{CallOutcome, ChainRpc};
use crate::types::{ConditionalOrderParams, DiscreteOrder, PollResult, Proof};
use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Context a conditional order is polled in. Historical replay overrides
/// block number and timestamp with the current tip.
#[derive(Debug, Clone, Copy)]
pub struct PollContext {
    pub chain_id: u64,
    pub owner: Address,
    pub source_contract: Address,
    pub block_number: u64,
    pub block_timestamp: i64,
}

#[async_trait]
pub trait OrderHandler: Send + Sync {
    async fn poll(
        &self,
        params: &ConditionalOrderParams,
        proof: Option<&Proof>,
        ctx: &PollContext,
    ) -> PollResult;
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature);
    [hash[0], hash[1], hash[2], hash[3]]
}

static GET_TRADEABLE_ORDER_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| {
    selector("getTradeableOrderWithSignature(address,(address,bytes32,bytes),bytes,bytes32[])")
});

static ERR_TRY_NEXT_BLOCK: Lazy<[u8; 4]> = Lazy::new(|| selector("PollTryNextBlock(string)"));
static ERR_TRY_AT_BLOCK: Lazy<[u8; 4]> =
    Lazy::new(|| selector("PollTryAtBlock(uint256,string)"));
static ERR_TRY_AT_EPOCH: Lazy<[u8; 4]> =
    Lazy::new(|| selector("PollTryAtEpoch(uint256,string)"));
static ERR_POLL_NEVER: Lazy<[u8; 4]> = Lazy::new(|| selector("PollNever(string)"));
static ERR_ORDER_NOT_VALID: Lazy<[u8; 4]> = Lazy::new(|| selector("OrderNotValid(string)"));
static ERR_SINGLE_ORDER_NOT_AUTHED: Lazy<[u8; 4]> =
    Lazy::new(|| selector("SingleOrderNotAuthed()"));
static ERR_PROOF_NOT_AUTHED: Lazy<[u8; 4]> = Lazy::new(|| selector("ProofNotAuthed()"));

/// Production handler: `eth_call`s the emitting contract's
/// `getTradeableOrderWithSignature` and maps its typed reverts.
pub struct OnChainHandler {
    rpc: Arc<dyn ChainRpc>,
}

impl OnChainHandler {
    pub fn new(rpc: Arc<dyn ChainRpc>) -> Self {
        Self { rpc }
    }

    fn calldata(
        owner: Address,
        params: &ConditionalOrderParams,
        proof: Option<&Proof>,
    ) -> Bytes {
        let path = proof.map(|p| p.path.as_slice()).unwrap_or_default();
        let mut data = GET_TRADEABLE_ORDER_SELECTOR.to_vec();
        data.extend(abi::encode(&[
            Token::Address(owner),
            encode_params_token(params),
            // offchainInput is unused by watch-tower polls
            Token::Bytes(Vec::new()),
            Token::Array(
                path.iter()
                    .map(|h| Token::FixedBytes(h.as_bytes().to_vec()))
                    .collect(),
            ),
        ]));
        Bytes::from(data)
    }
}

#[async_trait]
impl OrderHandler for OnChainHandler {
    async fn poll(
        &self,
        params: &ConditionalOrderParams,
        proof: Option<&Proof>,
        ctx: &PollContext,
    ) -> PollResult {
        let data = Self::calldata(ctx.owner, params, proof);
        match self.rpc.call(ctx.source_contract, data).await {
            Ok(CallOutcome::Success(output)) => decode_success(&output),
            Ok(CallOutcome::Revert(revert)) => decode_revert(&revert),
            Err(e) => PollResult::UnexpectedError {
                message: format!("handler call failed: {}", e),
            },
        }
    }
}

fn decode_success(output: &[u8]) -> PollResult {
    let order_type = ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(32),
        ParamType::FixedBytes(32),
        ParamType::Uint(256),
        ParamType::FixedBytes(32),
        ParamType::Bool,
        ParamType::FixedBytes(32),
        ParamType::FixedBytes(32),
    ]);
    let tokens = match abi::decode(&[order_type, ParamType::Bytes], output) {
        Ok(tokens) => tokens,
        Err(e) => {
            return PollResult::UnexpectedError {
                message: format!("undecodable handler output: {}", e),
            }
        }
    };
    let mut tokens = tokens.into_iter();
    let order = match tokens.next() {
        Some(Token::Tuple(fields)) => match order_from_fields(fields) {
            Ok(order) => order,
            Err(message) => return PollResult::UnexpectedError { message },
        },
        other => {
            return PollResult::UnexpectedError {
                message: format!("bad handler order token: {:?}", other),
            }
        }
    };
    let signature = match tokens.next() {
        Some(Token::Bytes(bytes)) => Bytes::from(bytes),
        other => {
            return PollResult::UnexpectedError {
                message: format!("bad handler signature token: {:?}", other),
            }
        }
    };
    PollResult::Success { order, signature }
}

fn order_from_fields(fields: Vec<Token>) -> Result<DiscreteOrder, String> {
    if fields.len() != 12 {
        return Err(format!("order tuple has {} fields", fields.len()));
    }
    let mut fields = fields.into_iter();
    macro_rules! next_address {
        () => {
            match fields.next() {
                Some(Token::Address(a)) => a,
                other => return Err(format!("expected address, got {:?}", other)),
            }
        };
    }
    macro_rules! next_uint {
        () => {
            match fields.next() {
                Some(Token::Uint(u)) => u,
                other => return Err(format!("expected uint, got {:?}", other)),
            }
        };
    }
    macro_rules! next_bytes32 {
        () => {
            match fields.next() {
                Some(Token::FixedBytes(b)) if b.len() == 32 => H256::from_slice(&b),
                other => return Err(format!("expected bytes32, got {:?}", other)),
            }
        };
    }

    let sell_token = next_address!();
    let buy_token = next_address!();
    let receiver = next_address!();
    let sell_amount = next_uint!();
    let buy_amount = next_uint!();
    let valid_to = next_uint!().low_u32();
    let app_data = next_bytes32!();
    let fee_amount = next_uint!();
    let kind = next_bytes32!();
    let partially_fillable = match fields.next() {
        Some(Token::Bool(b)) => b,
        other => return Err(format!("expected bool, got {:?}", other)),
    };
    let sell_token_balance = next_bytes32!();
    let buy_token_balance = next_bytes32!();

    Ok(DiscreteOrder {
        sell_token,
        buy_token,
        receiver,
        sell_amount,
        buy_amount,
        valid_to,
        app_data,
        fee_amount,
        kind,
        partially_fillable,
        sell_token_balance,
        buy_token_balance,
    })
}

fn decode_revert(revert: &[u8]) -> PollResult {
    if revert.len() < 4 {
        return PollResult::UnexpectedError {
            message: "empty revert data".to_string(),
        };
    }
    let (head, tail) = revert.split_at(4);

    if head == ERR_TRY_NEXT_BLOCK.as_slice() {
        return PollResult::TryNextBlock {
            reason: decode_reason(tail),
        };
    }
    if head == ERR_TRY_AT_BLOCK.as_slice() {
        let (value, reason) = decode_uint_reason(tail);
        return PollResult::TryAtBlock {
            block: value,
            reason,
        };
    }
    if head == ERR_TRY_AT_EPOCH.as_slice() {
        let (value, reason) = decode_uint_reason(tail);
        return PollResult::TryAtEpoch {
            timestamp: value as i64,
            reason,
        };
    }
    if head == ERR_POLL_NEVER.as_slice() {
        return PollResult::DontTryAgain {
            reason: decode_reason(tail),
        };
    }
    if head == ERR_ORDER_NOT_VALID.as_slice() {
        return PollResult::DontTryAgain {
            reason: format!("order not valid: {}", decode_reason(tail)),
        };
    }
    if head == ERR_SINGLE_ORDER_NOT_AUTHED.as_slice() {
        return PollResult::DontTryAgain {
            reason: "single order not authed".to_string(),
        };
    }
    if head == ERR_PROOF_NOT_AUTHED.as_slice() {
        return PollResult::DontTryAgain {
            reason: "proof not authed".to_string(),
        };
    }
    PollResult::UnexpectedError {
        message: format!("unrecognised revert 0x{}", hex::encode(head)),
    }
}

fn decode_reason(data: &[u8]) -> String {
    match abi::decode(&[ParamType::String], data) {
        Ok(tokens) => match tokens.into_iter().next() {
            Some(Token::String(s)) => s,
            _ => String::new(),
        },
        Err(_) => String::new(),
    }
}

fn decode_uint_reason(data: &[u8]) -> (u64, String) {
    match abi::decode(&[ParamType::Uint(256), ParamType::String], data) {
        Ok(tokens) => {
            let mut tokens = tokens.into_iter();
            let value = match tokens.next() {
                Some(Token::Uint(u)) => u.low_u64(),
                _ => 0,
            };
            let reason = match tokens.next() {
                Some(Token::String(s)) => s,
                _ => String::new(),
            };
            (value, reason)
        }
        Err(_) => (0, String::new()),
    }
}

/// Encodes revert payloads for the handler's typed errors; the inverse of
/// [`decode_revert`], used by tests.
#[cfg(test)]
pub fn encode_revert(selector_sig: &str, tokens: &[Token]) -> Bytes {
    let mut data = selector(selector_sig).to_vec();
    data.extend(abi::encode(tokens));
    Bytes::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BALANCE_ERC20, KIND_SELL};
    use ethers::types::U256;

    #[test]
    fn test_decode_revert_try_next_block() {
        let revert = encode_revert(
            "PollTryNextBlock(string)",
            &[Token::String("cooldown".to_string())],
        );
        assert_eq!(
            decode_revert(&revert),
            PollResult::TryNextBlock {
                reason: "cooldown".to_string()
            }
        );
    }

    #[test]
    fn test_decode_revert_try_at_block_and_epoch() {
        let revert = encode_revert(
            "PollTryAtBlock(uint256,string)",
            &[Token::Uint(U256::from(250)), Token::String("auction".into())],
        );
        assert_eq!(
            decode_revert(&revert),
            PollResult::TryAtBlock {
                block: 250,
                reason: "auction".to_string()
            }
        );

        let revert = encode_revert(
            "PollTryAtEpoch(uint256,string)",
            &[
                Token::Uint(U256::from(1_700_000_000u64)),
                Token::String("next window".into()),
            ],
        );
        assert_eq!(
            decode_revert(&revert),
            PollResult::TryAtEpoch {
                timestamp: 1_700_000_000,
                reason: "next window".to_string()
            }
        );
    }

    #[test]
    fn test_decode_revert_terminal_errors() {
        let revert = encode_revert("PollNever(string)", &[Token::String("expired".into())]);
        assert!(matches!(
            decode_revert(&revert),
            PollResult::DontTryAgain { .. }
        ));

        let revert = encode_revert("SingleOrderNotAuthed()", &[]);
        assert!(matches!(
            decode_revert(&revert),
            PollResult::DontTryAgain { .. }
        ));
    }

    #[test]
    fn test_decode_revert_unknown_selector() {
        let revert = encode_revert("SomethingElse()", &[]);
        assert!(matches!(
            decode_revert(&revert),
            PollResult::UnexpectedError { .. }
        ));
        assert!(matches!(
            decode_revert(&[0x01]),
            PollResult::UnexpectedError { .. }
        ));
    }

    #[test]
    fn test_decode_success_round_trip() {
        let order = DiscreteOrder {
            sell_token: Address::repeat_byte(0x11),
            buy_token: Address::repeat_byte(0x22),
            receiver: Address::zero(),
            sell_amount: U256::from(5u64),
            buy_amount: U256::from(4u64),
            valid_to: 1_700_000_123,
            app_data: H256::repeat_byte(0x0a),
            fee_amount: U256::zero(),
            kind: *KIND_SELL,
            partially_fillable: true,
            sell_token_balance: *BALANCE_ERC20,
            buy_token_balance: *BALANCE_ERC20,
        };
        let signature = vec![0xde, 0xad, 0xbe, 0xef];
        let output = abi::encode(&[
            Token::Tuple(vec![
                Token::Address(order.sell_token),
                Token::Address(order.buy_token),
                Token::Address(order.receiver),
                Token::Uint(order.sell_amount),
                Token::Uint(order.buy_amount),
                Token::Uint(U256::from(order.valid_to)),
                Token::FixedBytes(order.app_data.as_bytes().to_vec()),
                Token::Uint(order.fee_amount),
                Token::FixedBytes(order.kind.as_bytes().to_vec()),
                Token::Bool(order.partially_fillable),
                Token::FixedBytes(order.sell_token_balance.as_bytes().to_vec()),
                Token::FixedBytes(order.buy_token_balance.as_bytes().to_vec()),
            ]),
            Token::Bytes(signature.clone()),
        ]);

        match decode_success(&output) {
            PollResult::Success {
                order: decoded,
                signature: sig,
            } => {
                assert_eq!(decoded, order);
                assert_eq!(sig.to_vec(), signature);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_on_chain_handler_translates_call_outcomes() {
        use crate::test_utils::MockChainRpc;
        use std::sync::Arc;

        let rpc = Arc::new(MockChainRpc::new(1));
        let contract = Address::repeat_byte(0xcc);
        let handler = OnChainHandler::new(rpc.clone());
        let params = ConditionalOrderParams {
            handler: Address::repeat_byte(0x01),
            salt: H256::repeat_byte(0x02),
            static_input: Bytes::from(vec![0x03; 4]),
        };
        let ctx = PollContext {
            chain_id: 1,
            owner: Address::repeat_byte(0xaa),
            source_contract: contract,
            block_number: 150,
            block_timestamp: 1_700_000_000,
        };

        // Typed revert maps into the poll-result sum.
        rpc.set_call_result(
            contract,
            CallOutcome::Revert(encode_revert(
                "PollTryAtBlock(uint256,string)",
                &[
                    Token::Uint(ethers::types::U256::from(180)),
                    Token::String("twap part".into()),
                ],
            )),
        );
        let result = handler.poll(&params, None, &ctx).await;
        assert_eq!(
            result,
            PollResult::TryAtBlock {
                block: 180,
                reason: "twap part".to_string()
            }
        );

        // A transport failure is an unexpected error, never fatal.
        rpc.call_results.lock().unwrap().clear();
        let result = handler.poll(&params, None, &ctx).await;
        assert!(matches!(result, PollResult::UnexpectedError { .. }));
    }

    #[test]
    fn test_calldata_prefixes_selector() {
        let params = ConditionalOrderParams {
            handler: Address::repeat_byte(0x01),
            salt: H256::repeat_byte(0x02),
            static_input: Bytes::from(vec![0x03; 4]),
        };
        let data = OnChainHandler::calldata(Address::repeat_byte(0xaa), &params, None);
        assert_eq!(&data[..4], &GET_TRADEABLE_ORDER_SELECTOR[..]);
    }
}

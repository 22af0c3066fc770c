// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mock implementations of the seam traits plus fixture builders shared by
//! the test modules.

use crate::abi::{
    encode_merkle_root_set_data, encode_params_token, owner_topic,
    CONDITIONAL_ORDER_CREATED_TOPIC, MERKLE_ROOT_SET_TOPIC,
};
use crate::error::{WatchError, WatchResult};
use crate::eth_client::{BlockTarget, CallOutcome, ChainRpc, LogQuery, TxInfo};
use crate::handler::{OrderHandler, PollContext};
use crate::orderbook::{OrderbookApi, OrderbookError, Placement, SignedDiscreteOrder};
use crate::types::{
    BlockHeader, ConditionalOrderParams, DiscreteOrder, PollResult, Proof, BALANCE_ERC20,
    KIND_SELL,
};
use async_trait::async_trait;
use ethers::abi;
use ethers::types::{Address, Bytes, Log, H256, U256, U64};
use ethers::utils::keccak256;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Fixtures
// ============================================================================

pub fn params(seed: u8) -> ConditionalOrderParams {
    ConditionalOrderParams {
        handler: Address::repeat_byte(seed),
        salt: H256::repeat_byte(seed),
        static_input: Bytes::from(vec![seed; 4]),
    }
}

pub fn discrete_order(valid_to: u32) -> DiscreteOrder {
    DiscreteOrder {
        sell_token: Address::repeat_byte(0x11),
        buy_token: Address::repeat_byte(0x22),
        receiver: Address::zero(),
        sell_amount: U256::from(1_000_000u64),
        buy_amount: U256::from(990_000u64),
        valid_to,
        app_data: H256::zero(),
        fee_amount: U256::zero(),
        kind: *KIND_SELL,
        partially_fillable: false,
        sell_token_balance: *BALANCE_ERC20,
        buy_token_balance: *BALANCE_ERC20,
    }
}

pub fn success_result(valid_to: u32) -> PollResult {
    PollResult::Success {
        order: discrete_order(valid_to),
        signature: Bytes::from(vec![0xab; 65]),
    }
}

/// Deterministic header: hash derives from the number so continuity checks
/// pass unless a test overrides a block.
pub fn make_header(number: u64) -> BlockHeader {
    BlockHeader {
        number,
        hash: H256::from_low_u64_be(number),
        parent_hash: H256::from_low_u64_be(number.saturating_sub(1)),
        timestamp: (number * 12) as i64,
    }
}

pub fn created_log(
    owner: Address,
    p: &ConditionalOrderParams,
    block_number: u64,
    log_index: u64,
) -> Log {
    Log {
        address: Address::repeat_byte(0xcc),
        topics: vec![*CONDITIONAL_ORDER_CREATED_TOPIC, owner_topic(owner)],
        data: Bytes::from(abi::encode(&[encode_params_token(p)])),
        block_number: Some(U64::from(block_number)),
        block_hash: Some(H256::from_low_u64_be(block_number)),
        transaction_hash: Some(H256::from_low_u64_be(block_number * 1000 + log_index)),
        log_index: Some(U256::from(log_index)),
        ..Default::default()
    }
}

pub fn merkle_log(
    owner: Address,
    root: H256,
    location: u64,
    batch: &[(Vec<H256>, ConditionalOrderParams)],
    block_number: u64,
    log_index: u64,
) -> Log {
    Log {
        address: Address::repeat_byte(0xcc),
        topics: vec![*MERKLE_ROOT_SET_TOPIC, owner_topic(owner)],
        data: encode_merkle_root_set_data(root, location, batch),
        block_number: Some(U64::from(block_number)),
        block_hash: Some(H256::from_low_u64_be(block_number)),
        transaction_hash: Some(H256::from_low_u64_be(block_number * 1000 + log_index)),
        log_index: Some(U256::from(log_index)),
        ..Default::default()
    }
}

/// Deployed byte-code that passes the composable-compatibility heuristic
pub fn compatible_code() -> Bytes {
    let selector = &keccak256("cabinet(address,bytes32)")[..4];
    let mut code = vec![0x60, 0x80, 0x60, 0x40];
    code.extend_from_slice(selector);
    Bytes::from(code)
}

// ============================================================================
// Mock chain RPC
// ============================================================================

pub struct MockChainRpc {
    chain_id: u64,
    pub tip: AtomicU64,
    pub blocks: Mutex<BTreeMap<u64, BlockHeader>>,
    pub logs: Mutex<Vec<Log>>,
    pub code: Mutex<HashMap<Address, Bytes>>,
    pub call_results: Mutex<HashMap<Address, CallOutcome>>,
    /// Every log query issued, for asserting paging behaviour
    pub log_queries: Mutex<Vec<LogQuery>>,
    feed: Mutex<Option<mpsc::Receiver<BlockHeader>>>,
}

impl MockChainRpc {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            tip: AtomicU64::new(0),
            blocks: Mutex::new(BTreeMap::new()),
            logs: Mutex::new(Vec::new()),
            code: Mutex::new(HashMap::new()),
            call_results: Mutex::new(HashMap::new()),
            log_queries: Mutex::new(Vec::new()),
            feed: Mutex::new(None),
        }
    }

    pub fn set_tip(&self, tip: u64) {
        self.tip.store(tip, Ordering::SeqCst);
    }

    pub fn push_log(&self, log: Log) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn set_block(&self, header: BlockHeader) {
        self.blocks.lock().unwrap().insert(header.number, header);
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        self.code.lock().unwrap().insert(address, code);
    }

    pub fn set_call_result(&self, contract: Address, outcome: CallOutcome) {
        self.call_results.lock().unwrap().insert(contract, outcome);
    }

    /// Installs a block feed and returns the sender side for the test to
    /// drive the live tail.
    pub fn install_feed(&self) -> mpsc::Sender<BlockHeader> {
        let (tx, rx) = mpsc::channel(64);
        *self.feed.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl ChainRpc for MockChainRpc {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn latest_block_number(&self) -> WatchResult<u64> {
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn block_by_number(&self, number: u64) -> WatchResult<Option<BlockHeader>> {
        if let Some(header) = self.blocks.lock().unwrap().get(&number) {
            return Ok(Some(header.clone()));
        }
        Ok(Some(make_header(number)))
    }

    async fn logs(&self, query: &LogQuery) -> WatchResult<Vec<Log>> {
        self.log_queries.lock().unwrap().push(query.clone());
        let to = match query.to_block {
            BlockTarget::Number(n) => n,
            BlockTarget::Latest => u64::MAX,
        };
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                let number = log.block_number.map(|n| n.as_u64()).unwrap_or_default();
                number >= query.from_block && number <= to
            })
            .cloned()
            .collect())
    }

    async fn transaction_receipt(&self, tx: H256) -> WatchResult<Option<TxInfo>> {
        let logs: Vec<Log> = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| log.transaction_hash == Some(tx))
            .cloned()
            .collect();
        match logs.first().and_then(|l| l.block_number) {
            Some(number) => Ok(Some(TxInfo {
                block_number: number.as_u64(),
                logs,
            })),
            None => Ok(None),
        }
    }

    async fn code_at(&self, address: Address) -> WatchResult<Bytes> {
        Ok(self
            .code
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_else(compatible_code))
    }

    async fn call(&self, to: Address, _data: Bytes) -> WatchResult<CallOutcome> {
        match self.call_results.lock().unwrap().get(&to) {
            Some(outcome) => Ok(outcome.clone()),
            None => Err(WatchError::Rpc("no call result configured".to_string())),
        }
    }

    async fn subscribe_blocks(
        &self,
        _cancel: CancellationToken,
    ) -> WatchResult<mpsc::Receiver<BlockHeader>> {
        self.feed
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| WatchError::Rpc("no feed installed".to_string()))
    }

    async fn close(&self) {}
}

// ============================================================================
// Mock handler
// ============================================================================

pub struct MockHandler {
    /// Scripted results keyed by params id, consumed front to back
    results: Mutex<HashMap<H256, VecDeque<PollResult>>>,
    default: Mutex<PollResult>,
    pub calls: Mutex<Vec<(H256, PollContext)>>,
}

impl MockHandler {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            default: Mutex::new(PollResult::TryNextBlock {
                reason: "mock default".to_string(),
            }),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, params_id: H256, result: PollResult) {
        self.results
            .lock()
            .unwrap()
            .entry(params_id)
            .or_default()
            .push_back(result);
    }

    pub fn set_default(&self, result: PollResult) {
        *self.default.lock().unwrap() = result;
    }

    pub fn poll_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl OrderHandler for MockHandler {
    async fn poll(
        &self,
        params: &ConditionalOrderParams,
        _proof: Option<&Proof>,
        ctx: &PollContext,
    ) -> PollResult {
        let id = params.id();
        self.calls.lock().unwrap().push((id, *ctx));
        if let Some(queue) = self.results.lock().unwrap().get_mut(&id) {
            if let Some(result) = queue.pop_front() {
                return result;
            }
        }
        self.default.lock().unwrap().clone()
    }
}

// ============================================================================
// Mock order book
// ============================================================================

pub struct MockOrderbook {
    pub placed: Mutex<Vec<SignedDiscreteOrder>>,
    responses: Mutex<VecDeque<Result<Placement, OrderbookError>>>,
}

impl MockOrderbook {
    pub fn new() -> Self {
        Self {
            placed: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
        }
    }

    pub fn queue_response(&self, response: Result<Placement, OrderbookError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn submission_count(&self) -> usize {
        self.placed.lock().unwrap().len()
    }
}

#[async_trait]
impl OrderbookApi for MockOrderbook {
    async fn place_order(
        &self,
        order: &SignedDiscreteOrder,
    ) -> Result<Placement, OrderbookError> {
        self.placed.lock().unwrap().push(order.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Placement::Placed))
    }
}

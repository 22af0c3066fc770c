// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Narrow RPC provider contract consumed by the core, and its two ethers
//! implementations. The URL scheme selects the implementation: `ws[s]`
//! uses a native block subscription, `http[s]` simulates one by polling at
//! roughly the chain's block interval.

use crate::config::default_block_interval;
use crate::error::{WatchError, WatchResult};
use crate::types::BlockHeader;
use async_trait::async_trait;
use ethers::providers::{Http, JsonRpcClient, Middleware, Provider, ProviderError, RpcError, Ws};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockNumber, Bytes, Filter, Log, TransactionRequest, ValueOrArray, H256,
};
use futures::StreamExt;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const BLOCK_CHANNEL_SIZE: usize = 256;

/// Upper bound of a log query range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTarget {
    Number(u64),
    /// Whatever the node considers the tip at query time
    Latest,
}

#[derive(Debug, Clone)]
pub struct LogQuery {
    pub from_block: u64,
    pub to_block: BlockTarget,
    pub addresses: Option<Vec<Address>>,
    /// topic0 alternatives
    pub topics: Vec<H256>,
}

/// Outcome of an `eth_call`: distinguishes execution reverts (which carry
/// handler poll hints) from transport failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success(Bytes),
    Revert(Bytes),
}

/// Minimal receipt view needed by transaction replay.
#[derive(Debug, Clone)]
pub struct TxInfo {
    pub block_number: u64,
    pub logs: Vec<Log>,
}

/// The abstract provider interface the core consumes. All suspension
/// points of the pipeline that touch the chain go through this trait.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    fn chain_id(&self) -> u64;
    async fn latest_block_number(&self) -> WatchResult<u64>;
    async fn block_by_number(&self, number: u64) -> WatchResult<Option<BlockHeader>>;
    async fn logs(&self, query: &LogQuery) -> WatchResult<Vec<Log>>;
    async fn transaction_receipt(&self, tx: H256) -> WatchResult<Option<TxInfo>>;
    async fn code_at(&self, address: Address) -> WatchResult<Bytes>;
    async fn call(&self, to: Address, data: Bytes) -> WatchResult<CallOutcome>;
    /// Starts a block feed owned by the provider; the receiver yields fully
    /// resolved headers until `cancel` fires or the connection dies.
    async fn subscribe_blocks(
        &self,
        cancel: CancellationToken,
    ) -> WatchResult<mpsc::Receiver<BlockHeader>>;
    async fn close(&self);
}

/// Connects a provider by URL scheme.
pub async fn connect_rpc(url: &str) -> WatchResult<Arc<dyn ChainRpc>> {
    let scheme = url.split("://").next().unwrap_or_default();
    match scheme {
        "ws" | "wss" => Ok(Arc::new(EthRpcClient::connect_ws(url).await?)),
        "http" | "https" => Ok(Arc::new(EthRpcClient::connect_http(url).await?)),
        other => Err(WatchError::Config(format!(
            "unsupported RPC scheme '{}' in {}",
            other, url
        ))),
    }
}

pub struct EthRpcClient<P> {
    provider: Provider<P>,
    chain_id: u64,
    block_interval: Duration,
}

impl EthRpcClient<Http> {
    pub async fn connect_http(url: &str) -> WatchResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| WatchError::Config(format!("invalid http rpc url {}: {}", url, e)))?;
        Self::init(provider).await
    }
}

impl EthRpcClient<Ws> {
    pub async fn connect_ws(url: &str) -> WatchResult<Self> {
        let ws = Ws::connect(url)
            .await
            .map_err(|e| WatchError::Rpc(format!("ws connect {}: {}", url, e)))?;
        Self::init(Provider::new(ws)).await
    }
}

impl<P> EthRpcClient<P>
where
    P: JsonRpcClient + 'static,
{
    async fn init(provider: Provider<P>) -> WatchResult<Self> {
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| rpc_err("get_chainid", e))?
            .as_u64();
        debug!("Connected to chain {}", chain_id);
        Ok(Self {
            provider,
            chain_id,
            block_interval: default_block_interval(chain_id),
        })
    }

    async fn latest_block_number_inner(&self) -> WatchResult<u64> {
        Ok(self
            .provider
            .get_block_number()
            .await
            .map_err(|e| rpc_err("get_block_number", e))?
            .as_u64())
    }

    async fn block_by_number_inner(&self, number: u64) -> WatchResult<Option<BlockHeader>> {
        let block = self
            .provider
            .get_block(number)
            .await
            .map_err(|e| rpc_err("get_block", e))?;
        Ok(block.and_then(|b| {
            Some(BlockHeader {
                number: b.number?.as_u64(),
                hash: b.hash?,
                parent_hash: b.parent_hash,
                timestamp: b.timestamp.as_u64() as i64,
            })
        }))
    }

    async fn logs_inner(&self, query: &LogQuery) -> WatchResult<Vec<Log>> {
        let mut filter = Filter::new().from_block(query.from_block);
        filter = match query.to_block {
            BlockTarget::Number(n) => filter.to_block(n),
            BlockTarget::Latest => filter.to_block(BlockNumber::Latest),
        };
        if let Some(addresses) = &query.addresses {
            filter = filter.address(ValueOrArray::Array(addresses.clone()));
        }
        if !query.topics.is_empty() {
            filter = filter.topic0(ValueOrArray::Array(
                query.topics.iter().copied().map(Some).collect(),
            ));
        }
        self.provider
            .get_logs(&filter)
            .await
            .map_err(|e| rpc_err("get_logs", e))
    }

    async fn transaction_receipt_inner(&self, tx: H256) -> WatchResult<Option<TxInfo>> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx)
            .await
            .map_err(|e| rpc_err("get_transaction_receipt", e))?;
        Ok(receipt.and_then(|r| {
            Some(TxInfo {
                block_number: r.block_number?.as_u64(),
                logs: r.logs,
            })
        }))
    }

    async fn code_at_inner(&self, address: Address) -> WatchResult<Bytes> {
        self.provider
            .get_code(address, None)
            .await
            .map_err(|e| rpc_err("get_code", e))
    }

    async fn call_inner(&self, to: Address, data: Bytes) -> WatchResult<CallOutcome> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        match self.provider.call(&tx, None).await {
            Ok(bytes) => Ok(CallOutcome::Success(bytes)),
            Err(err) => match revert_data(&err) {
                Some(data) => Ok(CallOutcome::Revert(data)),
                None => Err(rpc_err("eth_call", err)),
            },
        }
    }

    /// Simulated block feed for non-streaming providers: polls the block
    /// number every `block_interval` and emits every header in between, so
    /// downstream processing stays strictly sequential by block number.
    fn spawn_poll_feed(&self, cancel: CancellationToken) -> mpsc::Receiver<BlockHeader>
    where
        P: Clone,
    {
        let (tx, rx) = mpsc::channel(BLOCK_CHANNEL_SIZE);
        let provider = self.provider.clone();
        let interval = self.block_interval;
        tokio::spawn(async move {
            let mut last_seen: Option<u64> = None;
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Block poll feed cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let tip = match provider.get_block_number().await {
                            Ok(n) => n.as_u64(),
                            Err(e) => {
                                warn!("Block poll feed: get_block_number failed: {:?}", e);
                                continue;
                            }
                        };
                        let start = last_seen.map(|n| n + 1).unwrap_or(tip);
                        for number in start..=tip {
                            match provider.get_block(number).await {
                                Ok(Some(block)) => {
                                    let header = match (block.number, block.hash) {
                                        (Some(n), Some(h)) => BlockHeader {
                                            number: n.as_u64(),
                                            hash: h,
                                            parent_hash: block.parent_hash,
                                            timestamp: block.timestamp.as_u64() as i64,
                                        },
                                        _ => continue,
                                    };
                                    if tx.send(header).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!("Block poll feed: get_block({}) failed: {:?}", number, e);
                                }
                            }
                        }
                        last_seen = Some(tip);
                    }
                }
            }
        });
        rx
    }
}

impl EthRpcClient<Ws> {
    /// Native block subscription over the websocket transport.
    fn spawn_subscription_feed(&self, cancel: CancellationToken) -> mpsc::Receiver<BlockHeader> {
        let (tx, rx) = mpsc::channel(BLOCK_CHANNEL_SIZE);
        let provider = self.provider.clone();
        tokio::spawn(async move {
            let mut stream = match provider.subscribe_blocks().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Block subscription failed: {:?}", e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Block subscription cancelled");
                        break;
                    }
                    block = stream.next() => {
                        match block {
                            Some(block) => {
                                let header = match (block.number, block.hash) {
                                    (Some(n), Some(h)) => BlockHeader {
                                        number: n.as_u64(),
                                        hash: h,
                                        parent_hash: block.parent_hash,
                                        timestamp: block.timestamp.as_u64() as i64,
                                    },
                                    _ => continue,
                                };
                                if tx.send(header).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                warn!("Block subscription stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });
        rx
    }
}

#[async_trait]
impl ChainRpc for EthRpcClient<Http> {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }
    async fn latest_block_number(&self) -> WatchResult<u64> {
        self.latest_block_number_inner().await
    }
    async fn block_by_number(&self, number: u64) -> WatchResult<Option<BlockHeader>> {
        self.block_by_number_inner(number).await
    }
    async fn logs(&self, query: &LogQuery) -> WatchResult<Vec<Log>> {
        self.logs_inner(query).await
    }
    async fn transaction_receipt(&self, tx: H256) -> WatchResult<Option<TxInfo>> {
        self.transaction_receipt_inner(tx).await
    }
    async fn code_at(&self, address: Address) -> WatchResult<Bytes> {
        self.code_at_inner(address).await
    }
    async fn call(&self, to: Address, data: Bytes) -> WatchResult<CallOutcome> {
        self.call_inner(to, data).await
    }
    async fn subscribe_blocks(
        &self,
        cancel: CancellationToken,
    ) -> WatchResult<mpsc::Receiver<BlockHeader>> {
        Ok(self.spawn_poll_feed(cancel))
    }
    async fn close(&self) {
        debug!("Closing http provider for chain {}", self.chain_id);
    }
}

#[async_trait]
impl ChainRpc for EthRpcClient<Ws> {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }
    async fn latest_block_number(&self) -> WatchResult<u64> {
        self.latest_block_number_inner().await
    }
    async fn block_by_number(&self, number: u64) -> WatchResult<Option<BlockHeader>> {
        self.block_by_number_inner(number).await
    }
    async fn logs(&self, query: &LogQuery) -> WatchResult<Vec<Log>> {
        self.logs_inner(query).await
    }
    async fn transaction_receipt(&self, tx: H256) -> WatchResult<Option<TxInfo>> {
        self.transaction_receipt_inner(tx).await
    }
    async fn code_at(&self, address: Address) -> WatchResult<Bytes> {
        self.code_at_inner(address).await
    }
    async fn call(&self, to: Address, data: Bytes) -> WatchResult<CallOutcome> {
        self.call_inner(to, data).await
    }
    async fn subscribe_blocks(
        &self,
        cancel: CancellationToken,
    ) -> WatchResult<mpsc::Receiver<BlockHeader>> {
        Ok(self.spawn_subscription_feed(cancel))
    }
    async fn close(&self) {
        debug!("Closing ws provider for chain {}", self.chain_id);
    }
}

fn rpc_err<E: Debug>(context: &str, err: E) -> WatchError {
    WatchError::Rpc(format!("{}: {:?}", context, err))
}

/// Extracts ABI-encoded revert data from a provider error, if present.
fn revert_data(err: &ProviderError) -> Option<Bytes> {
    let ProviderError::JsonRpcClientError(inner) = err else {
        return None;
    };
    let response = inner.as_error_response()?;
    let data = response.data.as_ref()?.as_str()?;
    let stripped = data.strip_prefix("0x").unwrap_or(data);
    hex::decode(stripped).ok().map(Bytes::from)
}

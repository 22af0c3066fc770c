// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Top-level per-chain state machine.
//!
//! ```text
//!   SYNCING ──(cursor reaches tip)──► IN_SYNC ──(watchdog, in pod)──► UNKNOWN
//!      │                                 │
//!      │ paged historical catch-up       │ live tail from the block feed
//!      ▼                                 ▼
//!   Block Processor ◄──────────── reorg re-processing
//! ```
//!
//! Warm-up pages the historical log range `[cursor+1, tip]`, processing
//! event-bearing blocks in ascending order with current-tip overrides, and
//! re-reads the tip until the cursor catches it. The live tail consumes the
//! provider's block feed one block at a time; a block arriving at or below
//! the last received height with a different hash is a reorg and is simply
//! re-processed, with submission idempotence keeping discrete orders
//! single. A watchdog trips when the feed goes silent: inside an
//! orchestration pod the chain degrades to UNKNOWN and keeps running,
//! standalone the process shuts down with a non-zero status.

use crate::config::{WatcherConfig, WATCHDOG_CHECK_INTERVAL};
use crate::error::{WatchError, WatchResult};
use crate::eth_client::{BlockTarget, ChainRpc};
use crate::event_source::{EventSource, OrderEvent};
use crate::block_processor::BlockProcessor;
use crate::health::{ChainStatus, SyncState};
use crate::metrics::WatchTowerMetrics;
use crate::notify::Notifier;
use crate::registry::{check_invariants, store::RegistryStore, Registry};
use crate::retry_with_max_attempts;
use crate::types::{BlockHeader, PollOverrides};
use crate::utils::{block_to_registry_block, truncate_hash};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RPC_ATTEMPTS: u32 = 5;

pub struct ChainWatcher {
    config: WatcherConfig,
    chain_id: u64,
    rpc: Arc<dyn ChainRpc>,
    store: Arc<RegistryStore>,
    events: EventSource,
    processor: BlockProcessor,
    status: Arc<ChainStatus>,
    metrics: Arc<WatchTowerMetrics>,
    notifier: Arc<Notifier>,
}

impl ChainWatcher {
    pub fn new(
        config: WatcherConfig,
        chain_id: u64,
        rpc: Arc<dyn ChainRpc>,
        store: Arc<RegistryStore>,
        events: EventSource,
        processor: BlockProcessor,
        status: Arc<ChainStatus>,
        metrics: Arc<WatchTowerMetrics>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            config,
            chain_id,
            rpc,
            store,
            events,
            processor,
            status,
            metrics,
            notifier,
        }
    }

    /// Runs the watcher until cancellation or a fatal error. A watchdog
    /// expiry outside a pod and any registry-store failure are fatal; the
    /// store is flushed before returning so the caller can exit non-zero.
    pub async fn run(mut self, cancel: CancellationToken) -> WatchResult<()> {
        self.config.validate()?;
        let mut registry = Registry::load(&self.store, &self.config.network)?;
        check_invariants(&registry);
        self.status.set_state(SyncState::Syncing).await;

        let tip_header = match self.warm_up(&mut registry, &cancel).await {
            Ok(header) => header,
            Err(e) => {
                self.store.close();
                return Err(e);
            }
        };
        if cancel.is_cancelled() {
            return Ok(());
        }
        if self.config.one_shot {
            info!(
                "[{}] One-shot warm-up complete at block {}; exiting",
                self.chain_id, tip_header.number
            );
            return Ok(());
        }
        self.status.set_state(SyncState::InSync).await;

        let mut blocks = self.rpc.subscribe_blocks(cancel.child_token()).await?;
        let last_received = Arc::new(RwLock::new(Some(tip_header)));
        let (expired_tx, mut expired_rx) = mpsc::channel::<i64>(4);
        let watchdog = spawn_watchdog(
            self.chain_id,
            self.config.watchdog_timeout,
            last_received.clone(),
            cancel.child_token(),
            expired_tx,
        );

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{}] Chain watcher shutting down", self.chain_id);
                    break Ok(());
                }
                Some(elapsed) = expired_rx.recv() => {
                    // The message may predate a block that has arrived in
                    // the meantime; only act if the feed is still silent.
                    let still_stale = last_received.read().await.as_ref().map_or(true, |h| {
                        Utc::now().timestamp() - h.timestamp
                            >= self.config.watchdog_timeout.as_secs() as i64
                    });
                    if !still_stale {
                        continue;
                    }
                    if self.config.in_pod {
                        self.status.set_state(SyncState::Unknown).await;
                    } else {
                        let message = format!(
                            "watch-tower chain {}: no block for {}s, giving up",
                            self.chain_id, elapsed
                        );
                        self.notifier
                            .notify_error_throttled(&mut registry, &message)
                            .await;
                        if let Err(e) = registry.write(&self.store) {
                            warn!("[{}] Final registry write failed: {}", self.chain_id, e);
                        }
                        break Err(WatchError::WatchdogExpired {
                            chain_id: self.chain_id,
                            elapsed_secs: elapsed,
                        });
                    }
                }
                received = blocks.recv() => {
                    let Some(header) = received else {
                        warn!("[{}] Block feed ended", self.chain_id);
                        break Err(WatchError::Rpc("block feed ended".to_string()));
                    };
                    match self.on_block(&mut registry, header, &last_received).await {
                        Ok(()) => {
                            // Processing a block proves the chain is live
                            // again after an in-pod UNKNOWN episode.
                            if self.status.state().await != SyncState::InSync {
                                self.status.set_state(SyncState::InSync).await;
                            }
                        }
                        Err(e @ WatchError::Store(_)) => break Err(e),
                        Err(e) => {
                            warn!("[{}] {}", self.chain_id, e);
                            let message =
                                format!("watch-tower chain {}: {}", self.chain_id, e);
                            self.notifier
                                .notify_error_throttled(&mut registry, &message)
                                .await;
                        }
                    }
                }
            }
        };

        watchdog.abort();
        if result.is_err() {
            self.store.close();
        }
        result
    }

    /// Historical catch-up: pages `[cursor+1 ?? deployment, tip]`,
    /// processing event-bearing blocks in ascending order with current-tip
    /// overrides, until a re-read of the tip shows no progress to make.
    /// Returns the tip header that warm-up converged on.
    async fn warm_up(
        &mut self,
        registry: &mut Registry,
        cancel: &CancellationToken,
    ) -> WatchResult<BlockHeader> {
        let mut from = registry
            .last_processed_block
            .as_ref()
            .map(|block| block.number + 1)
            .unwrap_or(self.config.deployment_block);

        loop {
            let tip_number =
                retry_with_max_attempts!(self.rpc.latest_block_number(), RPC_ATTEMPTS)?;
            let tip_header = self
                .rpc
                .block_by_number(tip_number)
                .await?
                .ok_or_else(|| WatchError::Rpc(format!("tip block {} missing", tip_number)))?;

            if from > tip_number {
                // Deployment beyond the tip, or already caught up.
                self.persist_tip_cursor(registry, &tip_header)?;
                self.status
                    .set_last_processed(registry.last_processed_block.clone())
                    .await;
                info!(
                    "[{}] Warm-up complete at block {} (nothing to fetch)",
                    self.chain_id, tip_number
                );
                return Ok(tip_header);
            }

            info!(
                "[{}] Warm-up: processing blocks {} to {}",
                self.chain_id, from, tip_number
            );
            let overrides = PollOverrides {
                block_number: tip_number,
                timestamp: tip_header.timestamp,
            };

            while from <= tip_number {
                if cancel.is_cancelled() {
                    return Ok(tip_header);
                }
                let (to_target, page_end) = if self.config.page_size == 0 {
                    (BlockTarget::Latest, tip_number)
                } else {
                    let end = (from + self.config.page_size - 1).min(tip_number);
                    (BlockTarget::Number(end), end)
                };
                let events = self.events.fetch(from, to_target).await?;
                // A "latest" query may outrun the tip we resolved; never
                // step the cursor backwards over processed blocks.
                let page_end = events
                    .last()
                    .map(|event| page_end.max(event.block_number))
                    .unwrap_or(page_end);

                let mut buckets: BTreeMap<u64, Vec<OrderEvent>> = BTreeMap::new();
                for event in events {
                    buckets.entry(event.block_number).or_default().push(event);
                }
                for (number, bucket) in buckets {
                    let header = self.rpc.block_by_number(number).await?.ok_or_else(|| {
                        WatchError::Rpc(format!("block {} missing during warm-up", number))
                    })?;
                    match self
                        .processor
                        .process_block(registry, &header, &bucket, Some(overrides))
                        .await
                    {
                        Ok(()) => {}
                        Err(e @ WatchError::Store(_)) => return Err(e),
                        Err(e) => warn!("[{}] {}", self.chain_id, e),
                    }
                    self.status
                        .set_last_processed(registry.last_processed_block.clone())
                        .await;
                }
                from = page_end + 1;
            }

            self.persist_tip_cursor(registry, &tip_header)?;
            self.status
                .set_last_processed(registry.last_processed_block.clone())
                .await;

            let new_tip = retry_with_max_attempts!(self.rpc.latest_block_number(), RPC_ATTEMPTS)?;
            if new_tip == tip_number {
                info!(
                    "[{}] Warm-up caught up to tip {}",
                    self.chain_id, tip_number
                );
                return Ok(tip_header);
            }
            from = tip_number + 1;
        }
    }

    /// Advances the durable cursor to the tip, never backwards.
    fn persist_tip_cursor(
        &self,
        registry: &mut Registry,
        tip: &BlockHeader,
    ) -> WatchResult<()> {
        let behind = registry
            .last_processed_block
            .as_ref()
            .map_or(true, |block| block.number < tip.number);
        if behind {
            registry.last_processed_block = Some(block_to_registry_block(tip));
            registry.write(&self.store)?;
        }
        Ok(())
    }

    /// Live-tail handling of one received block: gauges, reorg detection,
    /// single-block event fetch, processing, and the watchdog baseline.
    async fn on_block(
        &mut self,
        registry: &mut Registry,
        header: BlockHeader,
        last_received: &Arc<RwLock<Option<BlockHeader>>>,
    ) -> WatchResult<()> {
        let chain = self.chain_id.to_string();
        self.metrics
            .block_height
            .with_label_values(&[&chain])
            .set(header.number as i64);

        let previous = last_received.read().await.clone();
        if let Some(previous) = &previous {
            self.metrics
                .block_time_seconds
                .with_label_values(&[&chain])
                .set((header.timestamp - previous.timestamp) as f64);

            if header.number <= previous.number && header.hash != previous.hash {
                let depth = previous.number - header.number + 1;
                warn!(
                    "[{}] Reorg at block {}: {} replaces {}, depth {}",
                    self.chain_id,
                    header.number,
                    truncate_hash(&header.hash),
                    truncate_hash(&previous.hash),
                    depth
                );
                self.metrics.reorg_total.with_label_values(&[&chain]).inc();
                self.metrics
                    .reorg_depth
                    .with_label_values(&[&chain])
                    .set(depth as i64);
            }
        }

        debug!(
            "[{}] Processing live block {} ({})",
            self.chain_id,
            header.number,
            truncate_hash(&header.hash)
        );
        let events = self
            .events
            .fetch(header.number, BlockTarget::Number(header.number))
            .await?;
        let result = self
            .processor
            .process_block(registry, &header, &events, None)
            .await;

        *last_received.write().await = Some(header);
        self.status
            .set_last_processed(registry.last_processed_block.clone())
            .await;
        result
    }
}

/// Independent liveness check: every few seconds, compare wall-clock time
/// against the last received block's timestamp. The channel hand-off is the
/// only shared state with the watcher loop.
fn spawn_watchdog(
    chain_id: u64,
    timeout: Duration,
    last_received: Arc<RwLock<Option<BlockHeader>>>,
    cancel: CancellationToken,
    expired_tx: mpsc::Sender<i64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(WATCHDOG_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[{}] Watchdog cancelled", chain_id);
                    break;
                }
                _ = ticker.tick() => {
                    let last = last_received.read().await.clone();
                    let Some(header) = last else { continue };
                    let elapsed = Utc::now().timestamp() - header.timestamp;
                    if elapsed >= timeout.as_secs() as i64 {
                        error!(
                            "[{}] Watchdog: no new block for {}s (timeout {}s)",
                            chain_id,
                            elapsed,
                            timeout.as_secs()
                        );
                        if expired_tx.send(elapsed).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    })
}

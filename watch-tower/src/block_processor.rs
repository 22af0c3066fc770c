// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-block pipeline step: ingest the block's events into the registry,
//! walk the registry through the order poller on the configured cadence,
//! then persist. Persistence is unconditional so a poison block cannot
//! wedge the watcher; accumulated sub-step errors surface as one
//! block-level error after the cursor is durable.

use crate::config::MAX_PARALLEL_POLLS;
use crate::error::{WatchError, WatchResult};
use crate::event_source::{OrderEvent, OrderEventKind};
use crate::eth_client::ChainRpc;
use crate::filter_policy::FilterPolicy;
use crate::metrics::WatchTowerMetrics;
use crate::poller::{OrderPoller, PollAction, PollOutcome};
use crate::registry::{store::RegistryStore, Registry};
use crate::types::{BlockHeader, ConditionalOrder, PollOverrides, Proof, ProofLocation};
use crate::utils::{block_to_registry_block, is_composable_compatible};
use ethers::types::Address;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct BlockProcessor {
    chain_id: u64,
    rpc: Arc<dyn ChainRpc>,
    store: Arc<RegistryStore>,
    poller: OrderPoller,
    policy_rx: watch::Receiver<Arc<FilterPolicy>>,
    metrics: Arc<WatchTowerMetrics>,
    /// Poll the registry only on block numbers divisible by this
    process_every: u64,
    /// Replay leaves the durable cursor untouched
    persist_cursor: bool,
    /// Composable-compatibility verdicts are stable per contract
    compat_cache: HashMap<Address, bool>,
}

impl BlockProcessor {
    pub fn new(
        chain_id: u64,
        rpc: Arc<dyn ChainRpc>,
        store: Arc<RegistryStore>,
        poller: OrderPoller,
        policy_rx: watch::Receiver<Arc<FilterPolicy>>,
        metrics: Arc<WatchTowerMetrics>,
        process_every: u64,
    ) -> Self {
        Self {
            chain_id,
            rpc,
            store,
            poller,
            policy_rx,
            metrics,
            process_every,
            persist_cursor: true,
            compat_cache: HashMap::new(),
        }
    }

    /// Replay mode: poll effects are persisted, the block cursor is not.
    pub fn without_cursor_persistence(mut self) -> Self {
        self.persist_cursor = false;
        self
    }

    /// Processes one block: event ingestion, gated registry walk, atomic
    /// persistence, metrics. A store failure is fatal and returned as-is;
    /// anything else is accumulated and raised after persistence.
    pub async fn process_block(
        &mut self,
        registry: &mut Registry,
        block: &BlockHeader,
        events: &[OrderEvent],
        overrides: Option<PollOverrides>,
    ) -> WatchResult<()> {
        let started = Instant::now();
        let chain = self.chain_id.to_string();
        let mut errors: Vec<String> = Vec::new();

        self.ingest_events(registry, events, &mut errors).await;

        if block.number % self.process_every == 0 {
            self.poll_registry(registry, block, overrides, &mut errors)
                .await;
        } else {
            debug!(
                "[{}] Block {} skips polling (cadence {})",
                self.chain_id, block.number, self.process_every
            );
        }

        if self.persist_cursor {
            registry.last_processed_block = Some(block_to_registry_block(block));
        }
        registry.write(&self.store)?;

        self.metrics
            .process_block_duration_seconds
            .with_label_values(&[&chain])
            .observe(started.elapsed().as_secs_f64());
        self.metrics
            .active_owners_total
            .with_label_values(&[&chain])
            .set(registry.num_owners() as i64);
        self.metrics
            .active_orders_total
            .with_label_values(&[&chain])
            .set(registry.num_orders() as i64);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(WatchError::BlockProcessing {
                block: block.number,
                errors,
            })
        }
    }

    /// Applies the block's events in original order. Failures are counted
    /// but never abort the block.
    async fn ingest_events(
        &mut self,
        registry: &mut Registry,
        events: &[OrderEvent],
        errors: &mut Vec<String>,
    ) {
        let mut applied = 0u64;
        for event in events {
            match self.check_compatible(event.source).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "[{}] Skipping event from non-composable contract {:#x}",
                        self.chain_id, event.source
                    );
                    continue;
                }
                Err(e) => {
                    errors.push(format!(
                        "compatibility check for {:#x}: {}",
                        event.source, e
                    ));
                    continue;
                }
            }

            match &event.kind {
                OrderEventKind::Created { owner, params } => {
                    registry.add(
                        *owner,
                        ConditionalOrder::new(
                            event.tx_hash,
                            params.clone(),
                            None,
                            event.source,
                        ),
                    );
                    applied += 1;
                }
                OrderEventKind::MerkleRootSet(merkle) => {
                    registry.flush(merkle.owner, merkle.root);
                    if merkle.location == ProofLocation::Emitted {
                        for (path, params) in &merkle.orders {
                            registry.add(
                                merkle.owner,
                                ConditionalOrder::new(
                                    event.tx_hash,
                                    params.clone(),
                                    Some(Proof {
                                        merkle_root: merkle.root,
                                        path: path.clone(),
                                    }),
                                    event.source,
                                ),
                            );
                        }
                    }
                    applied += 1;
                }
            }
        }
        if applied > 0 {
            self.metrics
                .events_processed_total
                .with_label_values(&[&self.chain_id.to_string()])
                .inc_by(applied);
        }
    }

    /// Polls every registered order with bounded fan-out; registry
    /// mutations are applied serially from the collected outcomes.
    async fn poll_registry(
        &mut self,
        registry: &mut Registry,
        block: &BlockHeader,
        overrides: Option<PollOverrides>,
        errors: &mut Vec<String>,
    ) {
        let policy = self.policy_rx.borrow().clone();
        let snapshot: Vec<(Address, ConditionalOrder)> = registry
            .owner_orders
            .iter()
            .flat_map(|(owner, orders)| orders.iter().map(move |order| (*owner, order.clone())))
            .collect();
        if snapshot.is_empty() {
            return;
        }
        debug!(
            "[{}] Polling {} conditional order(s) at block {}",
            self.chain_id,
            snapshot.len(),
            block.number
        );

        let poller = &self.poller;
        let outcomes: Vec<PollOutcome> = stream::iter(snapshot.into_iter().map(
            |(owner, order)| {
                let policy = policy.clone();
                async move {
                    poller
                        .poll_order(owner, &order, block, overrides.as_ref(), &policy)
                        .await
                }
            },
        ))
        .buffer_unordered(MAX_PARALLEL_POLLS)
        .collect()
        .await;

        for outcome in outcomes {
            match outcome.action {
                PollAction::Skip => {}
                PollAction::Remove { reason } => {
                    if registry.delete_order(outcome.owner, outcome.params_id) {
                        debug!(
                            "[{}] Deleted conditional order {:#x}: {}",
                            self.chain_id, outcome.params_id, reason
                        );
                    }
                }
                PollAction::Record {
                    last_poll,
                    submission,
                    error,
                } => {
                    if let Some(order) =
                        registry.get_order_mut(outcome.owner, outcome.params_id)
                    {
                        order.last_poll = Some(last_poll);
                        if let Some((uid, status)) = submission {
                            order.record_order(uid, status);
                        }
                    } else {
                        warn!(
                            "[{}] Polled order {:#x} vanished from the registry",
                            self.chain_id, outcome.params_id
                        );
                    }
                    if let Some(message) = error {
                        errors.push(message);
                    }
                }
            }
        }
    }

    async fn check_compatible(&mut self, contract: Address) -> WatchResult<bool> {
        if let Some(verdict) = self.compat_cache.get(&contract) {
            return Ok(*verdict);
        }
        let verdict = is_composable_compatible(self.rpc.as_ref(), contract).await?;
        self.compat_cache.insert(contract, verdict);
        Ok(verdict)
    }
}

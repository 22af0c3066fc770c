// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-order poll pipeline: policy gate, handler dispatch, idempotent
//! order-book submission and last-poll bookkeeping. Poll tasks for one
//! block run concurrently; the returned outcomes are applied to the
//! registry serially by the block processor, which keeps registry
//! mutation single-writer.

use crate::filter_policy::{FilterPolicy, PollCandidate, PolicyAction};
use crate::handler::{OrderHandler, PollContext};
use crate::metrics::WatchTowerMetrics;
use crate::orderbook::{OrderbookApi, SignedDiscreteOrder};
use crate::types::{
    BlockHeader, ConditionalOrder, OrderStatus, OrderUid, PollInfo, PollOverrides, PollResult,
};
use ethers::types::{Address, H256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the block processor should do with a polled order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollAction {
    /// Delete the conditional order from the registry permanently
    Remove { reason: String },
    /// Keep the order; update its last-poll info and possibly record a
    /// newly submitted discrete order. `error` feeds the block-level error
    /// accumulation without aborting anything.
    Record {
        last_poll: PollInfo,
        submission: Option<(OrderUid, OrderStatus)>,
        error: Option<String>,
    },
    /// Policy said not this time; leave the order untouched
    Skip,
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub owner: Address,
    pub params_id: H256,
    pub action: PollAction,
}

pub struct OrderPoller {
    chain_id: u64,
    handler: Arc<dyn OrderHandler>,
    orderbook: Arc<dyn OrderbookApi>,
    metrics: Arc<WatchTowerMetrics>,
    domain_separator: H256,
    dry_run: bool,
}

impl OrderPoller {
    pub fn new(
        chain_id: u64,
        handler: Arc<dyn OrderHandler>,
        orderbook: Arc<dyn OrderbookApi>,
        metrics: Arc<WatchTowerMetrics>,
        domain_separator: H256,
        dry_run: bool,
    ) -> Self {
        Self {
            chain_id,
            handler,
            orderbook,
            metrics,
            domain_separator,
            dry_run,
        }
    }

    /// Polls one conditional order against a block context. Never fails;
    /// handler and order-book troubles surface inside the outcome.
    pub async fn poll_order(
        &self,
        owner: Address,
        order: &ConditionalOrder,
        block: &BlockHeader,
        overrides: Option<&PollOverrides>,
        policy: &FilterPolicy,
    ) -> PollOutcome {
        let params_id = order.params.id();
        let outcome = |action| PollOutcome {
            owner,
            params_id,
            action,
        };

        let candidate = PollCandidate {
            owner,
            handler: order.params.handler,
            transaction: order.tx,
            conditional_order_id: params_id,
        };
        match policy.evaluate(&candidate) {
            PolicyAction::Accept => {}
            PolicyAction::Drop => {
                info!(
                    "[{}] Filter policy drops conditional order {:#x} of owner {:#x}",
                    self.chain_id, params_id, owner
                );
                return outcome(PollAction::Remove {
                    reason: "filter policy DROP".to_string(),
                });
            }
            PolicyAction::Skip => {
                debug!(
                    "[{}] Filter policy skips conditional order {:#x} this block",
                    self.chain_id, params_id
                );
                return outcome(PollAction::Skip);
            }
        }

        let (block_number, block_timestamp) = match overrides {
            Some(o) => (o.block_number, o.timestamp),
            None => (block.number, block.timestamp),
        };
        let ctx = PollContext {
            chain_id: self.chain_id,
            owner,
            source_contract: order.source_contract,
            block_number,
            block_timestamp,
        };

        let chain = self.chain_id.to_string();
        self.metrics
            .polling_runs_total
            .with_label_values(&[&chain])
            .inc();

        let result = self
            .handler
            .poll(&order.params, order.proof.as_ref(), &ctx)
            .await;

        let handler_label = format!("{:#x}", order.params.handler);
        let owner_label = format!("{:#x}", owner);
        let id_label = format!("{:#x}", params_id);
        let labels = [
            chain.as_str(),
            handler_label.as_str(),
            owner_label.as_str(),
            id_label.as_str(),
        ];

        let last_poll = PollInfo {
            timestamp: block_timestamp,
            block_number,
            result: result.kind(),
        };

        match result {
            PollResult::Success {
                order: discrete,
                signature,
            } => {
                self.metrics
                    .polling_success_total
                    .with_label_values(&labels)
                    .inc();
                let uid = discrete.uid(self.domain_separator, owner);

                if order.has_order(&uid) {
                    debug!(
                        "[{}] Discrete order {} already emitted; skipping submission",
                        self.chain_id, uid
                    );
                    return outcome(PollAction::Record {
                        last_poll,
                        submission: None,
                        error: None,
                    });
                }
                if self.dry_run {
                    info!(
                        "[{}] Dry run: would submit discrete order {} for owner {:#x}",
                        self.chain_id, uid, owner
                    );
                    return outcome(PollAction::Record {
                        last_poll,
                        submission: None,
                        error: None,
                    });
                }

                let signed = SignedDiscreteOrder {
                    order: discrete,
                    signature,
                    from: owner,
                };
                match self.orderbook.place_order(&signed).await {
                    Ok(placement) => {
                        debug!(
                            "[{}] Discrete order {} placed ({:?})",
                            self.chain_id, uid, placement
                        );
                        self.metrics
                            .orderbook_discrete_orders_total
                            .with_label_values(&labels)
                            .inc();
                        outcome(PollAction::Record {
                            last_poll,
                            submission: Some((uid, OrderStatus::Submitted)),
                            error: None,
                        })
                    }
                    Err(e) => {
                        warn!(
                            "[{}] Order book rejected discrete order {}: {:?}",
                            self.chain_id, uid, e
                        );
                        self.metrics
                            .orderbook_errors_total
                            .with_label_values(&[
                                &chain,
                                &handler_label,
                                &owner_label,
                                &id_label,
                                &e.status_label(),
                                &e.error_label(),
                            ])
                            .inc();
                        outcome(PollAction::Record {
                            last_poll,
                            submission: None,
                            error: Some(format!("order book: {:?}", e)),
                        })
                    }
                }
            }
            PollResult::TryNextBlock { reason } => {
                self.metrics
                    .polling_try_next_block_total
                    .with_label_values(&labels)
                    .inc();
                debug!(
                    "[{}] Conditional order {:#x} deferred to next block: {}",
                    self.chain_id, params_id, reason
                );
                outcome(PollAction::Record {
                    last_poll,
                    submission: None,
                    error: None,
                })
            }
            PollResult::TryAtBlock { block: at, reason } => {
                self.metrics
                    .polling_try_at_block_total
                    .with_label_values(&labels)
                    .inc();
                debug!(
                    "[{}] Conditional order {:#x} deferred to block {}: {}",
                    self.chain_id, params_id, at, reason
                );
                outcome(PollAction::Record {
                    last_poll,
                    submission: None,
                    error: None,
                })
            }
            PollResult::TryAtEpoch { timestamp, reason } => {
                self.metrics
                    .polling_try_at_epoch_total
                    .with_label_values(&labels)
                    .inc();
                debug!(
                    "[{}] Conditional order {:#x} deferred to epoch {}: {}",
                    self.chain_id, params_id, timestamp, reason
                );
                outcome(PollAction::Record {
                    last_poll,
                    submission: None,
                    error: None,
                })
            }
            PollResult::DontTryAgain { reason } => {
                self.metrics
                    .polling_dont_try_again_total
                    .with_label_values(&labels)
                    .inc();
                info!(
                    "[{}] Retiring conditional order {:#x}: {}",
                    self.chain_id, params_id, reason
                );
                outcome(PollAction::Remove { reason })
            }
            PollResult::UnexpectedError { message } => {
                self.metrics
                    .polling_unexpected_error_total
                    .with_label_values(&labels)
                    .inc();
                warn!(
                    "[{}] Unexpected handler error for conditional order {:#x}: {}",
                    self.chain_id, params_id, message
                );
                outcome(PollAction::Record {
                    last_poll,
                    submission: None,
                    error: Some(message),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{OrderbookError, Placement};
    use crate::test_utils::{
        discrete_order, make_header, params, success_result, MockHandler, MockOrderbook,
    };
    use crate::types::{DiscreteOrder, PollResultKind};

    fn conditional_order(seed: u8) -> ConditionalOrder {
        ConditionalOrder::new(
            H256::repeat_byte(seed),
            params(seed),
            None,
            Address::repeat_byte(0xcc),
        )
    }

    fn poller(
        handler: Arc<MockHandler>,
        orderbook: Arc<MockOrderbook>,
        dry_run: bool,
    ) -> OrderPoller {
        OrderPoller::new(
            1,
            handler,
            orderbook,
            Arc::new(WatchTowerMetrics::new_for_testing()),
            DiscreteOrder::domain_separator(1, *crate::orderbook::SETTLEMENT_CONTRACT),
            dry_run,
        )
    }

    #[tokio::test]
    async fn test_policy_drop_removes_without_polling() {
        let handler = Arc::new(MockHandler::new());
        let orderbook = Arc::new(MockOrderbook::new());
        let poller = poller(handler.clone(), orderbook.clone(), false);

        let owner = Address::repeat_byte(0xaa);
        let order = conditional_order(0x01);
        let mut policy = FilterPolicy::default();
        policy.owners.insert(owner, PolicyAction::Drop);

        let outcome = poller
            .poll_order(owner, &order, &make_header(150), None, &policy)
            .await;

        assert!(matches!(outcome.action, PollAction::Remove { .. }));
        assert_eq!(handler.poll_count(), 0);
        assert_eq!(orderbook.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_policy_skip_leaves_order_untouched() {
        let handler = Arc::new(MockHandler::new());
        let orderbook = Arc::new(MockOrderbook::new());
        let poller = poller(handler.clone(), orderbook.clone(), false);

        let owner = Address::repeat_byte(0xaa);
        let order = conditional_order(0x01);
        let mut policy = FilterPolicy::default();
        policy
            .conditional_order_ids
            .insert(order.params.id(), PolicyAction::Skip);

        let outcome = poller
            .poll_order(owner, &order, &make_header(150), None, &policy)
            .await;

        assert_eq!(outcome.action, PollAction::Skip);
        assert_eq!(handler.poll_count(), 0);
    }

    #[tokio::test]
    async fn test_success_submits_and_records_uid() {
        let handler = Arc::new(MockHandler::new());
        let orderbook = Arc::new(MockOrderbook::new());
        let poller = poller(handler.clone(), orderbook.clone(), false);

        let owner = Address::repeat_byte(0xaa);
        let order = conditional_order(0x01);
        handler.script(order.params.id(), success_result(1_700_000_000));

        let outcome = poller
            .poll_order(owner, &order, &make_header(150), None, &FilterPolicy::default())
            .await;

        let expected_uid = discrete_order(1_700_000_000).uid(
            DiscreteOrder::domain_separator(1, *crate::orderbook::SETTLEMENT_CONTRACT),
            owner,
        );
        match outcome.action {
            PollAction::Record {
                submission: Some((uid, OrderStatus::Submitted)),
                error: None,
                last_poll,
            } => {
                assert_eq!(uid, expected_uid);
                assert_eq!(last_poll.result, PollResultKind::Success);
                assert_eq!(last_poll.block_number, 150);
            }
            other => panic!("expected recorded submission, got {:?}", other),
        }
        assert_eq!(orderbook.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_known_uid_is_not_resubmitted() {
        let handler = Arc::new(MockHandler::new());
        let orderbook = Arc::new(MockOrderbook::new());
        let poller = poller(handler.clone(), orderbook.clone(), false);

        let owner = Address::repeat_byte(0xaa);
        let mut order = conditional_order(0x01);
        let uid = discrete_order(1_700_000_000).uid(
            DiscreteOrder::domain_separator(1, *crate::orderbook::SETTLEMENT_CONTRACT),
            owner,
        );
        order.record_order(uid, OrderStatus::Submitted);
        handler.script(order.params.id(), success_result(1_700_000_000));

        let outcome = poller
            .poll_order(owner, &order, &make_header(151), None, &FilterPolicy::default())
            .await;

        assert!(matches!(
            outcome.action,
            PollAction::Record {
                submission: None,
                error: None,
                ..
            }
        ));
        assert_eq!(orderbook.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_rejection_is_success() {
        let handler = Arc::new(MockHandler::new());
        let orderbook = Arc::new(MockOrderbook::new());
        orderbook.queue_response(Ok(Placement::AlreadyExists));
        let poller = poller(handler.clone(), orderbook.clone(), false);

        let owner = Address::repeat_byte(0xaa);
        let order = conditional_order(0x01);
        handler.script(order.params.id(), success_result(1_700_000_000));

        let outcome = poller
            .poll_order(owner, &order, &make_header(150), None, &FilterPolicy::default())
            .await;

        assert!(matches!(
            outcome.action,
            PollAction::Record {
                submission: Some((_, OrderStatus::Submitted)),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_rejection_keeps_order_eligible() {
        let handler = Arc::new(MockHandler::new());
        let orderbook = Arc::new(MockOrderbook::new());
        orderbook.queue_response(Err(OrderbookError::Rejected {
            status: 400,
            error_type: "InsufficientFee".to_string(),
            description: "fee too low".to_string(),
        }));
        let poller = poller(handler.clone(), orderbook.clone(), false);

        let owner = Address::repeat_byte(0xaa);
        let order = conditional_order(0x01);
        handler.script(order.params.id(), success_result(1_700_000_000));

        let outcome = poller
            .poll_order(owner, &order, &make_header(150), None, &FilterPolicy::default())
            .await;

        match outcome.action {
            PollAction::Record {
                submission: None,
                error: Some(_),
                ..
            } => {}
            other => panic!("expected kept order with error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dont_try_again_removes_order() {
        let handler = Arc::new(MockHandler::new());
        let orderbook = Arc::new(MockOrderbook::new());
        let poller = poller(handler.clone(), orderbook.clone(), false);

        let owner = Address::repeat_byte(0xaa);
        let order = conditional_order(0x01);
        handler.script(
            order.params.id(),
            PollResult::DontTryAgain {
                reason: "expired".to_string(),
            },
        );

        let outcome = poller
            .poll_order(owner, &order, &make_header(150), None, &FilterPolicy::default())
            .await;
        assert!(matches!(outcome.action, PollAction::Remove { .. }));
    }

    #[tokio::test]
    async fn test_dry_run_suppresses_submission() {
        let handler = Arc::new(MockHandler::new());
        let orderbook = Arc::new(MockOrderbook::new());
        let poller = poller(handler.clone(), orderbook.clone(), true);

        let owner = Address::repeat_byte(0xaa);
        let order = conditional_order(0x01);
        handler.script(order.params.id(), success_result(1_700_000_000));

        let outcome = poller
            .poll_order(owner, &order, &make_header(150), None, &FilterPolicy::default())
            .await;

        assert!(matches!(
            outcome.action,
            PollAction::Record {
                submission: None,
                error: None,
                ..
            }
        ));
        assert_eq!(orderbook.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_overrides_shape_the_poll_context() {
        let handler = Arc::new(MockHandler::new());
        let orderbook = Arc::new(MockOrderbook::new());
        let poller = poller(handler.clone(), orderbook.clone(), false);

        let owner = Address::repeat_byte(0xaa);
        let order = conditional_order(0x01);
        let overrides = PollOverrides {
            block_number: 999,
            timestamp: 9_999,
        };

        let outcome = poller
            .poll_order(
                owner,
                &order,
                &make_header(150),
                Some(&overrides),
                &FilterPolicy::default(),
            )
            .await;

        let calls = handler.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.block_number, 999);
        assert_eq!(calls[0].1.block_timestamp, 9_999);
        match outcome.action {
            PollAction::Record { last_poll, .. } => {
                assert_eq!(last_poll.block_number, 999);
                assert_eq!(last_poll.timestamp, 9_999);
            }
            other => panic!("expected record, got {:?}", other),
        }
    }
}

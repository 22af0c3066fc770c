// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_gauge_vec_with_registry, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, GaugeVec, HistogramVec, IntCounterVec, IntGauge,
    IntGaugeVec, Registry,
};

const PROCESS_BLOCK_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 30., 60., 120.,
];

/// All metrics emitted by the watch tower. Metric names are part of the
/// external contract and must stay stable.
#[derive(Clone, Debug)]
pub struct WatchTowerMetrics {
    pub block_height: IntGaugeVec,
    pub block_time_seconds: GaugeVec,
    pub reorg_depth: IntGaugeVec,
    pub reorg_total: IntCounterVec,
    pub events_processed_total: IntCounterVec,
    pub process_block_duration_seconds: HistogramVec,
    pub active_owners_total: IntGaugeVec,
    pub active_orders_total: IntGaugeVec,
    pub orderbook_discrete_orders_total: IntCounterVec,
    pub orderbook_errors_total: IntCounterVec,
    pub polling_runs_total: IntCounterVec,
    pub polling_success_total: IntCounterVec,
    pub polling_try_next_block_total: IntCounterVec,
    pub polling_try_at_block_total: IntCounterVec,
    pub polling_try_at_epoch_total: IntCounterVec,
    pub polling_dont_try_again_total: IntCounterVec,
    pub polling_unexpected_error_total: IntCounterVec,
    pub uptime_seconds: IntGauge,
}

impl WatchTowerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            block_height: register_int_gauge_vec_with_registry!(
                "watch_tower_block_height",
                "Block height of the most recently received block",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            block_time_seconds: register_gauge_vec_with_registry!(
                "watch_tower_block_time_seconds",
                "Seconds between the two most recently received blocks",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            reorg_depth: register_int_gauge_vec_with_registry!(
                "watch_tower_reorg_depth",
                "Depth of the most recently detected reorg",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            reorg_total: register_int_counter_vec_with_registry!(
                "watch_tower_reorg_total",
                "Total number of detected reorgs",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            events_processed_total: register_int_counter_vec_with_registry!(
                "watch_tower_events_processed_total",
                "Total number of conditional-order events applied to the registry",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            process_block_duration_seconds: register_histogram_vec_with_registry!(
                "watch_tower_process_block_duration_seconds",
                "Wall-clock duration of a block-processing step",
                &["chain_id"],
                PROCESS_BLOCK_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            active_owners_total: register_int_gauge_vec_with_registry!(
                "watch_tower_active_owners_total",
                "Number of owners with live conditional orders",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            active_orders_total: register_int_gauge_vec_with_registry!(
                "watch_tower_active_orders_total",
                "Number of live conditional orders",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            orderbook_discrete_orders_total: register_int_counter_vec_with_registry!(
                "watch_tower_orderbook_discrete_orders_total",
                "Discrete orders accepted by the order book",
                &["chain_id", "handler", "owner", "id"],
                registry,
            )
            .unwrap(),
            orderbook_errors_total: register_int_counter_vec_with_registry!(
                "watch_tower_orderbook_errors_total",
                "Order-book submissions rejected or failed",
                &["chain_id", "handler", "owner", "id", "status", "error"],
                registry,
            )
            .unwrap(),
            polling_runs_total: register_int_counter_vec_with_registry!(
                "watch_tower_polling_runs_total",
                "Total number of conditional-order polls",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            polling_success_total: register_int_counter_vec_with_registry!(
                "watch_tower_polling_success_total",
                "Polls that produced a submittable discrete order",
                &["chain_id", "handler", "owner", "id"],
                registry,
            )
            .unwrap(),
            polling_try_next_block_total: register_int_counter_vec_with_registry!(
                "watch_tower_polling_try_next_block_total",
                "Polls deferred to the next block",
                &["chain_id", "handler", "owner", "id"],
                registry,
            )
            .unwrap(),
            polling_try_at_block_total: register_int_counter_vec_with_registry!(
                "watch_tower_polling_try_at_block_total",
                "Polls deferred to a specific block",
                &["chain_id", "handler", "owner", "id"],
                registry,
            )
            .unwrap(),
            polling_try_at_epoch_total: register_int_counter_vec_with_registry!(
                "watch_tower_polling_try_at_epoch_total",
                "Polls deferred to a specific epoch",
                &["chain_id", "handler", "owner", "id"],
                registry,
            )
            .unwrap(),
            polling_dont_try_again_total: register_int_counter_vec_with_registry!(
                "watch_tower_polling_dont_try_again_total",
                "Polls that permanently retired a conditional order",
                &["chain_id", "handler", "owner", "id"],
                registry,
            )
            .unwrap(),
            polling_unexpected_error_total: register_int_counter_vec_with_registry!(
                "watch_tower_polling_unexpected_error_total",
                "Polls that failed with an unexpected handler error",
                &["chain_id", "handler", "owner", "id"],
                registry,
            )
            .unwrap(),
            uptime_seconds: register_int_gauge_with_registry!(
                "watch_tower_uptime_seconds",
                "Seconds since process start",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Construction registers every metric without panicking
    #[test]
    fn test_metrics_construction() {
        let registry = Registry::new();
        let metrics = WatchTowerMetrics::new(&registry);
        metrics.block_height.with_label_values(&["1"]).set(100);
        metrics.polling_runs_total.with_label_values(&["1"]).inc();
        assert!(registry.gather().iter().any(|family| {
            family.get_name() == "watch_tower_block_height"
        }));
    }

    /// Same metric names cannot be registered twice in one registry
    #[test]
    fn test_metrics_double_registration_panics() {
        let registry = Registry::new();
        let _metrics = WatchTowerMetrics::new(&registry);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            WatchTowerMetrics::new(&registry)
        }));
        assert!(result.is_err());
    }
}

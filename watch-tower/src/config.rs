// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{WatchError, WatchResult};
use ethers::types::Address;
use std::time::Duration;

/// How often the watchdog wakes up to check block liveness
pub const WATCHDOG_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Default ceiling on a silent block stream before the watchdog trips
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded fan-out for poll tasks within one block
pub const MAX_PARALLEL_POLLS: usize = 16;

/// Per-chain-watcher configuration
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Key-namespace identifier, the decimal chain id
    pub network: String,
    /// First block the watched contracts can have emitted from
    pub deployment_block: u64,
    /// Historical log-query page size; 0 means a single query to "latest"
    pub page_size: u64,
    pub watchdog_timeout: Duration,
    /// Poll the registry only on block numbers divisible by this; >= 1
    pub process_every_num_blocks: u64,
    /// Suppress order-book submissions
    pub dry_run: bool,
    /// Warm up and exit instead of tailing
    pub one_shot: bool,
    /// Running inside an orchestration pod: watchdog expiry degrades to
    /// UNKNOWN instead of exiting the process
    pub in_pod: bool,
    /// Optional owner allow-list applied by the event source
    pub owners: Option<Vec<Address>>,
}

impl WatcherConfig {
    pub fn new(network: String, deployment_block: u64) -> Self {
        Self {
            network,
            deployment_block,
            page_size: 5000,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            process_every_num_blocks: 1,
            dry_run: false,
            one_shot: false,
            in_pod: detect_pod(),
            owners: None,
        }
    }

    pub fn validate(&self) -> WatchResult<()> {
        if self.network.is_empty() {
            return Err(WatchError::Config("network must not be empty".to_string()));
        }
        if self.process_every_num_blocks == 0 {
            return Err(WatchError::Config(
                "process-every-num-blocks must be >= 1".to_string(),
            ));
        }
        if self.watchdog_timeout < WATCHDOG_CHECK_INTERVAL {
            return Err(WatchError::Config(format!(
                "watchdog timeout must be at least {}s",
                WATCHDOG_CHECK_INTERVAL.as_secs()
            )));
        }
        Ok(())
    }
}

/// Whether this process runs inside a Kubernetes pod
pub fn detect_pod() -> bool {
    std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
}

/// Rough block production interval, used by the HTTP provider to simulate
/// a block subscription
pub fn default_block_interval(chain_id: u64) -> Duration {
    match chain_id {
        // mainnet, sepolia
        1 | 11155111 => Duration::from_secs(12),
        // gnosis chain
        100 => Duration::from_secs(5),
        // arbitrum one, base
        42161 | 8453 => Duration::from_secs(2),
        _ => Duration::from_secs(12),
    }
}

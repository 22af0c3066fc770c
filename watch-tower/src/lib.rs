// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::too_many_arguments, clippy::new_without_default)]

pub mod abi;
pub mod block_processor;
pub mod chain_watcher;
pub mod config;
pub mod error;
pub mod eth_client;
pub mod event_source;
pub mod filter_policy;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod orderbook;
pub mod poller;
pub mod registry;
pub mod server;
pub mod types;
pub mod utils;

#[cfg(test)]
pub mod test_utils;

/// Retries an async expression with exponential back-off, giving up after
/// `max_attempts` tries. The expression is re-evaluated on every attempt.
///
/// The delay sequence (in secs, applied with jitter) is
/// 0.4, 0.8, 1.6, 3.2, ... capped at 30.
#[macro_export]
macro_rules! retry_with_max_attempts {
    ($func:expr, $max_attempts:expr) => {{
        use backoff::backoff::Backoff;
        let mut backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempt = 1u32;
        loop {
            match $func.await {
                Ok(value) => break Ok(value),
                Err(e) if attempt < $max_attempts => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(std::time::Duration::from_secs(30));
                    tracing::debug!(
                        "Retrying (attempt {}/{}) after error: {:?}",
                        attempt,
                        $max_attempts,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

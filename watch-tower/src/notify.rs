// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Slack Notification Module
//!
//! Posts watch-tower events to a Slack incoming webhook. Error
//! notifications are throttled through the registry's last-notified-error
//! timestamp so a persistently failing chain does not flood the channel.

use crate::registry::Registry;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 2;

/// Minimum gap between two error notifications for the same chain
const NOTIFICATION_WAIT_PERIOD_HOURS: i64 = 4;

#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub webhook: Option<Url>,
    /// `--silent`: keep running but never call out
    pub silent: bool,
}

impl NotifyConfig {
    pub fn is_configured(&self) -> bool {
        self.webhook.is_some() && !self.silent
    }
}

pub struct Notifier {
    config: NotifyConfig,
    client: Client,
}

impl Notifier {
    pub fn new(config: NotifyConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self { config, client }
    }

    pub fn disabled() -> Self {
        Self::new(NotifyConfig::default())
    }

    /// Sends a message, retrying a few times. Failures are logged, never
    /// propagated; notification delivery is best effort.
    pub async fn send(&self, text: &str) {
        let Some(webhook) = &self.config.webhook else {
            debug!("Notification skipped (no webhook): {}", text);
            return;
        };
        if self.config.silent {
            debug!("Notification suppressed (--silent): {}", text);
            return;
        }

        let payload = json!({ "text": text });
        for attempt in 1..=MAX_RETRIES {
            match self.client.post(webhook.clone()).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Notification delivered");
                    return;
                }
                Ok(response) => {
                    warn!(
                        "Notification attempt {}/{} got status {}",
                        attempt,
                        MAX_RETRIES,
                        response.status()
                    );
                }
                Err(e) => {
                    warn!("Notification attempt {}/{} failed: {}", attempt, MAX_RETRIES, e);
                }
            }
            if attempt < MAX_RETRIES {
                tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS)).await;
            }
        }
        warn!("Giving up on notification after {} attempts", MAX_RETRIES);
    }

    /// Sends an error notification at most once per wait period, tracked
    /// through the registry's last-notified-error timestamp. The caller
    /// persists the registry afterwards as part of its normal write cycle.
    pub async fn notify_error_throttled(&self, registry: &mut Registry, text: &str) -> bool {
        let now = Utc::now();
        let due = match registry.last_notified_error {
            None => true,
            Some(last) => now - last >= ChronoDuration::hours(NOTIFICATION_WAIT_PERIOD_HOURS),
        };
        if !due {
            debug!("Error notification throttled: {}", text);
            return false;
        }
        registry.last_notified_error = Some(now);
        self.send(text).await;
        true
    }
}

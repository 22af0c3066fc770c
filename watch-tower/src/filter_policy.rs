// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Filter policy deciding, per candidate poll, whether to ACCEPT, DROP or
//! SKIP a conditional order. The policy is fetched from an external URL and
//! hot-reloaded on a jittered time interval; a failed reload keeps the last
//! good snapshot in effect. Snapshots are published through a watch channel
//! so every poll reads a consistent policy.

use ethers::types::{Address, H256};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Default interval between policy reloads
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyAction {
    #[serde(rename = "ACCEPT")]
    Accept,
    #[serde(rename = "DROP")]
    Drop,
    #[serde(rename = "SKIP")]
    Skip,
}

/// A poll candidate as seen by the policy.
#[derive(Debug, Clone, Copy)]
pub struct PollCandidate {
    pub owner: Address,
    pub handler: Address,
    pub transaction: H256,
    pub conditional_order_id: H256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterPolicy {
    pub default_action: PolicyAction,
    pub owners: HashMap<Address, PolicyAction>,
    pub handlers: HashMap<Address, PolicyAction>,
    pub transactions: HashMap<H256, PolicyAction>,
    pub conditional_order_ids: HashMap<H256, PolicyAction>,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            default_action: PolicyAction::Accept,
            owners: HashMap::new(),
            handlers: HashMap::new(),
            transactions: HashMap::new(),
            conditional_order_ids: HashMap::new(),
        }
    }
}

impl FilterPolicy {
    /// First specific match wins: conditional-order id, then transaction,
    /// then owner, then handler; otherwise the default action.
    pub fn evaluate(&self, candidate: &PollCandidate) -> PolicyAction {
        if let Some(action) = self
            .conditional_order_ids
            .get(&candidate.conditional_order_id)
        {
            return *action;
        }
        if let Some(action) = self.transactions.get(&candidate.transaction) {
            return *action;
        }
        if let Some(action) = self.owners.get(&candidate.owner) {
            return *action;
        }
        if let Some(action) = self.handlers.get(&candidate.handler) {
            return *action;
        }
        self.default_action
    }
}

/// Returns a receiver that always holds the policy in effect. When `url`
/// is absent the accept-everything default applies and no task is spawned.
pub fn spawn_policy_loader(
    url: Option<Url>,
    reload_interval: Duration,
    cancel: CancellationToken,
) -> (watch::Receiver<Arc<FilterPolicy>>, Option<JoinHandle<()>>) {
    let (tx, rx) = watch::channel(Arc::new(FilterPolicy::default()));
    let Some(url) = url else {
        debug!("No filter policy URL configured; accepting everything");
        return (rx, None);
    };

    let handle = tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");

        // Initial load, then reload on a jittered interval so multiple
        // watchers do not stampede the config host.
        reload(&client, &url, &tx).await;
        loop {
            let jittered = jitter(reload_interval);
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Filter policy loader cancelled");
                    break;
                }
                _ = tokio::time::sleep(jittered) => {
                    reload(&client, &url, &tx).await;
                }
            }
        }
    });
    (rx, Some(handle))
}

/// The loader catches and logs its own errors; a failed reload leaves the
/// last good policy in effect.
async fn reload(client: &reqwest::Client, url: &Url, tx: &watch::Sender<Arc<FilterPolicy>>) {
    match fetch_policy(client, url).await {
        Ok(policy) => {
            info!(
                "Filter policy reloaded from {}: default {:?}, {} owner rule(s), {} handler rule(s)",
                url,
                policy.default_action,
                policy.owners.len(),
                policy.handlers.len()
            );
            let _ = tx.send(Arc::new(policy));
        }
        Err(e) => {
            warn!("Filter policy reload from {} failed, keeping last good policy: {}", url, e);
        }
    }
}

async fn fetch_policy(client: &reqwest::Client, url: &Url) -> Result<FilterPolicy, String> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| format!("request: {}", e))?;
    if !response.status().is_success() {
        return Err(format!("status {}", response.status()));
    }
    response
        .json::<FilterPolicy>()
        .await
        .map_err(|e| format!("body: {}", e))
}

fn jitter(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    interval.mul_f64(factor)
}

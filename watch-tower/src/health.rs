// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-chain sync status and the roll-up served by the health endpoint.
//! The chain map is a constructed value handed to the HTTP surface rather
//! than process-global state.

use crate::types::RegistryBlock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    #[serde(rename = "SYNCING")]
    Syncing,
    #[serde(rename = "IN_SYNC")]
    InSync,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

/// Live status handle for one chain watcher; shared with the HTTP surface.
#[derive(Debug)]
pub struct ChainStatus {
    chain_id: u64,
    state: RwLock<SyncState>,
    last_processed: RwLock<Option<RegistryBlock>>,
}

impl ChainStatus {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: RwLock::new(SyncState::Syncing),
            last_processed: RwLock::new(None),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn state(&self) -> SyncState {
        *self.state.read().await
    }

    pub async fn set_state(&self, new_state: SyncState) {
        let mut state = self.state.write().await;
        if *state != new_state {
            info!(
                "[{}] Sync state {:?} -> {:?}",
                self.chain_id, *state, new_state
            );
            *state = new_state;
        }
    }

    pub async fn set_last_processed(&self, block: Option<RegistryBlock>) {
        *self.last_processed.write().await = block;
    }

    pub async fn snapshot(&self) -> ChainHealth {
        let state = self.state().await;
        ChainHealth {
            sync: state,
            chain_id: self.chain_id,
            last_processed_block: self.last_processed.read().await.clone(),
            is_healthy: state == SyncState::InSync,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainHealth {
    pub sync: SyncState,
    pub chain_id: u64,
    pub last_processed_block: Option<RegistryBlock>,
    pub is_healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub is_healthy: bool,
    pub chains: Vec<ChainHealth>,
}

/// All chains hosted by this process. A chain is healthy iff IN_SYNC; the
/// overall report is the conjunction.
pub struct ChainRegistry {
    chains: Vec<Arc<ChainStatus>>,
}

impl ChainRegistry {
    pub fn new(chains: Vec<Arc<ChainStatus>>) -> Self {
        Self { chains }
    }

    pub async fn snapshot(&self) -> HealthReport {
        let mut chains = Vec::with_capacity(self.chains.len());
        for chain in &self.chains {
            chains.push(chain.snapshot().await);
        }
        HealthReport {
            is_healthy: !chains.is_empty() && chains.iter().all(|c| c.is_healthy),
            chains,
        }
    }
}

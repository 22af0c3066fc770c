// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    // Transient or permanent RPC provider failure
    Rpc(String),
    // A log could not be decoded as one of the watched events
    Decode(String),
    // Registry store (embedded KV) failure; data-integrity risk
    Store(String),
    // Registry (de)serialisation failure
    Serialization(String),
    // The persisted schema version is newer than this binary understands
    SchemaVersion { found: u32, expected: u32 },
    // Order-book API rejected a submission
    Orderbook { status: Option<u16>, message: String },
    // Invalid configuration, fatal before any work starts
    Config(String),
    // One or more sub-steps of a processed block failed; the block cursor
    // was persisted before this was raised
    BlockProcessing { block: u64, errors: Vec<String> },
    // The block stream went silent past the watchdog timeout
    WatchdogExpired { chain_id: u64, elapsed_secs: i64 },
    // Uncategorized error
    Generic(String),
}

pub type WatchResult<T> = Result<T, WatchError>;

impl WatchError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            WatchError::Rpc(_) => "rpc",
            WatchError::Decode(_) => "decode",
            WatchError::Store(_) => "store",
            WatchError::Serialization(_) => "serialization",
            WatchError::SchemaVersion { .. } => "schema_version",
            WatchError::Orderbook { .. } => "orderbook",
            WatchError::Config(_) => "config",
            WatchError::BlockProcessing { .. } => "block_processing",
            WatchError::WatchdogExpired { .. } => "watchdog_expired",
            WatchError::Generic(_) => "generic",
        }
    }
}

impl fmt::Display for WatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchError::Rpc(msg) => write!(f, "RPC error: {}", msg),
            WatchError::Decode(msg) => write!(f, "Decode error: {}", msg),
            WatchError::Store(msg) => write!(f, "Registry store error: {}", msg),
            WatchError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            WatchError::SchemaVersion { found, expected } => write!(
                f,
                "Registry schema version {} is newer than supported version {}",
                found, expected
            ),
            WatchError::Orderbook { status, message } => match status {
                Some(code) => write!(f, "Order book rejection ({}): {}", code, message),
                None => write!(f, "Order book error: {}", message),
            },
            WatchError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            WatchError::BlockProcessing { block, errors } => write!(
                f,
                "Block {} processed with {} error(s): {}",
                block,
                errors.len(),
                errors.join("; ")
            ),
            WatchError::WatchdogExpired {
                chain_id,
                elapsed_secs,
            } => write!(
                f,
                "Watchdog expired for chain {}: no block for {}s",
                chain_id, elapsed_secs
            ),
            WatchError::Generic(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for WatchError {}

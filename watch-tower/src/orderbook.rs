// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Order-book HTTP client. Submission outcomes are classified three ways:
//! duplicate-order rejections are success (the book already has the order),
//! other rejections leave the conditional order eligible next block, and
//! transport failures are retried with exponential back-off before being
//! treated as a rejection.

use crate::error::WatchResult;
use crate::types::DiscreteOrder;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use ethers::types::{Address, Bytes, H160};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

/// GPv2 settlement contract, identical on every supported chain
pub static SETTLEMENT_CONTRACT: Lazy<Address> = Lazy::new(|| {
    H160(hex_literal("9008D19f58AAbD9eD0D60971565AA8510560ab41"))
});

fn hex_literal(s: &str) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&hex::decode(s.to_lowercase()).expect("valid address literal"));
    out
}

/// Default maximum submission attempts on transport failure
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Order-book API base URL for a supported chain id.
pub fn default_orderbook_url(chain_id: u64) -> Option<Url> {
    let base = match chain_id {
        1 => "https://api.cow.fi/mainnet",
        100 => "https://api.cow.fi/xdai",
        42161 => "https://api.cow.fi/arbitrum_one",
        8453 => "https://api.cow.fi/base",
        11155111 => "https://api.cow.fi/sepolia",
        _ => return None,
    };
    Some(Url::parse(base).expect("valid base url"))
}

/// A discrete order plus everything needed to place it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDiscreteOrder {
    pub order: DiscreteOrder,
    pub signature: Bytes,
    pub from: Address,
}

/// Successful placement outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Placed,
    /// The book already holds this order; idempotent re-submit
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderbookError {
    /// Non-duplicate rejection; the order stays in the registry
    Rejected {
        status: u16,
        error_type: String,
        description: String,
    },
    /// Transport failure that survived all retry attempts
    Transport(String),
    /// The order cannot be expressed as an API payload
    Encode(String),
}

impl OrderbookError {
    pub fn status_label(&self) -> String {
        match self {
            OrderbookError::Rejected { status, .. } => status.to_string(),
            OrderbookError::Transport(_) => "transport".to_string(),
            OrderbookError::Encode(_) => "encode".to_string(),
        }
    }

    pub fn error_label(&self) -> String {
        match self {
            OrderbookError::Rejected { error_type, .. } => error_type.clone(),
            OrderbookError::Transport(_) => "transport".to_string(),
            OrderbookError::Encode(_) => "encode".to_string(),
        }
    }
}

#[async_trait]
pub trait OrderbookApi: Send + Sync {
    async fn place_order(&self, order: &SignedDiscreteOrder)
        -> Result<Placement, OrderbookError>;
}

/// Wire payload of `POST /api/v1/orders`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreation<'a> {
    sell_token: Address,
    buy_token: Address,
    receiver: Address,
    sell_amount: String,
    buy_amount: String,
    valid_to: u32,
    app_data: String,
    fee_amount: String,
    kind: &'static str,
    partially_fillable: bool,
    sell_token_balance: &'static str,
    buy_token_balance: &'static str,
    signing_scheme: &'static str,
    signature: &'a Bytes,
    from: Address,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiError {
    error_type: String,
    #[serde(default)]
    description: String,
}

fn order_creation<'a>(order: &'a SignedDiscreteOrder) -> Result<OrderCreation<'a>, OrderbookError> {
    let discrete = &order.order;
    let kind = discrete
        .kind_str()
        .ok_or_else(|| OrderbookError::Encode(format!("unknown order kind {:#x}", discrete.kind)))?;
    let sell_token_balance = DiscreteOrder::balance_str(&discrete.sell_token_balance)
        .ok_or_else(|| {
            OrderbookError::Encode(format!(
                "unknown sell balance {:#x}",
                discrete.sell_token_balance
            ))
        })?;
    let buy_token_balance =
        DiscreteOrder::balance_str(&discrete.buy_token_balance).ok_or_else(|| {
            OrderbookError::Encode(format!(
                "unknown buy balance {:#x}",
                discrete.buy_token_balance
            ))
        })?;
    Ok(OrderCreation {
        sell_token: discrete.sell_token,
        buy_token: discrete.buy_token,
        receiver: discrete.receiver,
        sell_amount: discrete.sell_amount.to_string(),
        buy_amount: discrete.buy_amount.to_string(),
        valid_to: discrete.valid_to,
        app_data: format!("{:#x}", discrete.app_data),
        fee_amount: discrete.fee_amount.to_string(),
        kind,
        partially_fillable: discrete.partially_fillable,
        sell_token_balance,
        buy_token_balance,
        // Conditional orders verify through the owner contract
        signing_scheme: "eip1271",
        signature: &order.signature,
        from: order.from,
    })
}

/// Classifies a non-2xx response body. Duplicate orders are success.
fn classify_rejection(status: u16, body: &str) -> Result<Placement, OrderbookError> {
    let parsed: Option<ApiError> = serde_json::from_str(body).ok();
    match parsed {
        Some(api) if status == 400 && api.error_type == "DuplicatedOrder" => {
            Ok(Placement::AlreadyExists)
        }
        Some(api) => Err(OrderbookError::Rejected {
            status,
            error_type: api.error_type,
            description: api.description,
        }),
        None => Err(OrderbookError::Rejected {
            status,
            error_type: "unparseable".to_string(),
            description: body.chars().take(200).collect(),
        }),
    }
}

pub struct HttpOrderbook {
    client: reqwest::Client,
    endpoint: Url,
    max_attempts: u32,
}

impl HttpOrderbook {
    pub fn new(base: Url, max_attempts: u32) -> WatchResult<Self> {
        let endpoint = base
            .join("api/v1/orders")
            .map_err(|e| crate::error::WatchError::Config(format!("orderbook url: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| crate::error::WatchError::Config(format!("orderbook client: {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            max_attempts,
        })
    }
}

#[async_trait]
impl OrderbookApi for HttpOrderbook {
    async fn place_order(
        &self,
        order: &SignedDiscreteOrder,
    ) -> Result<Placement, OrderbookError> {
        let payload = order_creation(order)?;

        let mut backoff = backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempt = 1u32;
        loop {
            let result = self
                .client
                .post(self.endpoint.clone())
                .json(&payload)
                .send()
                .await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if status.is_success() {
                        let uid = body.trim().trim_matches('"').to_string();
                        info!("Order book accepted order, uid {}", uid);
                        return Ok(Placement::Placed);
                    }
                    return match classify_rejection(status.as_u16(), &body) {
                        Ok(placement) => {
                            debug!("Order already known to the order book");
                            Ok(placement)
                        }
                        Err(e) => Err(e),
                    };
                }
                Err(e) if attempt < self.max_attempts => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_secs(30));
                    warn!(
                        "Order book request failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt, self.max_attempts, delay, e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(OrderbookError::Transport(e.to_string()));
                }
            }
        }
    }
}

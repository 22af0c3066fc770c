// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::too_many_arguments)]

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;
use watch_tower::block_processor::BlockProcessor;
use watch_tower::chain_watcher::ChainWatcher;
use watch_tower::config::WatcherConfig;
use watch_tower::eth_client::{connect_rpc, BlockTarget, ChainRpc};
use watch_tower::event_source::EventSource;
use watch_tower::filter_policy::{spawn_policy_loader, FilterPolicy, DEFAULT_RELOAD_INTERVAL};
use watch_tower::handler::{OnChainHandler, OrderHandler};
use watch_tower::health::{ChainRegistry, ChainStatus};
use watch_tower::metrics::WatchTowerMetrics;
use watch_tower::notify::{Notifier, NotifyConfig};
use watch_tower::orderbook::{
    default_orderbook_url, HttpOrderbook, OrderbookApi, DEFAULT_MAX_ATTEMPTS,
    SETTLEMENT_CONTRACT,
};
use watch_tower::poller::OrderPoller;
use watch_tower::registry::{store::RegistryStore, Registry};
use watch_tower::server::{run_server, AppState};
use watch_tower::types::{DiscreteOrder, PollOverrides};
use watch_tower_cli::{
    Args, DumpDbArgs, ReplayArgs, ReplayTxArgs, RunArgs, RunMultiArgs, SharedArgs,
    WatchTowerCommand,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    match args.command {
        WatchTowerCommand::Run(RunArgs {
            rpc,
            deployment_block,
            shared,
        }) => run_watchers(vec![rpc], vec![deployment_block], shared).await,
        WatchTowerCommand::RunMulti(RunMultiArgs {
            rpc,
            deployment_block,
            shared,
        }) => run_watchers(rpc, deployment_block, shared).await,
        WatchTowerCommand::DumpDb(args) => dump_db(args),
        WatchTowerCommand::ReplayBlock(args) => replay_block(args).await,
        WatchTowerCommand::ReplayTx(args) => replay_tx(args).await,
    }
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ============================================================================
// run / run-multi
// ============================================================================

async fn run_watchers(
    rpcs: Vec<Url>,
    deployment_blocks: Vec<u64>,
    shared: SharedArgs,
) -> Result<()> {
    if rpcs.len() != deployment_blocks.len() {
        bail!(
            "--rpc and --deployment-block must have the same length ({} vs {})",
            rpcs.len(),
            deployment_blocks.len()
        );
    }

    let cancel = CancellationToken::new();
    let store = Arc::new(
        RegistryStore::open(&shared.database_path)
            .map_err(|e| anyhow!("opening registry store: {}", e))?,
    );
    let prometheus_registry = prometheus::Registry::new();
    let metrics = Arc::new(WatchTowerMetrics::new(&prometheus_registry));
    let notifier = Arc::new(Notifier::new(NotifyConfig {
        webhook: shared.slack_webhook.clone(),
        silent: shared.silent,
    }));
    let (policy_rx, _policy_handle) = spawn_policy_loader(
        shared.filter_policy_url.clone(),
        DEFAULT_RELOAD_INTERVAL,
        cancel.child_token(),
    );

    // Server uptime tracking
    let uptime_metrics = metrics.clone();
    let uptime_cancel = cancel.child_token();
    tokio::spawn(async move {
        let start = Instant::now();
        loop {
            tokio::select! {
                _ = uptime_cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(10)) => {
                    uptime_metrics.uptime_seconds.set(start.elapsed().as_secs() as i64);
                }
            }
        }
    });

    let mut statuses: Vec<Arc<ChainStatus>> = Vec::new();
    let mut watchers = JoinSet::new();
    for (rpc_url, deployment_block) in rpcs.into_iter().zip(deployment_blocks) {
        let rpc = connect_rpc(rpc_url.as_str())
            .await
            .map_err(|e| anyhow!("connecting {}: {}", rpc_url, e))?;
        let chain_id = rpc.chain_id();
        let network = chain_id.to_string();
        info!("Starting watcher for chain {} via {}", chain_id, rpc_url);

        let mut config = WatcherConfig::new(network.clone(), deployment_block);
        config.page_size = shared.page_size;
        config.watchdog_timeout = Duration::from_secs(shared.watchdog_timeout);
        config.process_every_num_blocks = shared.process_every_num_blocks;
        config.dry_run = shared.dry_run;
        config.one_shot = shared.one_shot;
        if !shared.owners.is_empty() {
            config.owners = Some(shared.owners.clone());
        }
        config
            .validate()
            .map_err(|e| anyhow!("chain {}: {}", chain_id, e))?;

        let status = Arc::new(ChainStatus::new(chain_id));
        statuses.push(status.clone());

        let watcher = build_watcher(
            config,
            chain_id,
            rpc,
            store.clone(),
            policy_rx.clone(),
            metrics.clone(),
            status,
            notifier.clone(),
            shared.orderbook_url.clone(),
            shared.dry_run,
        )?;
        watchers.spawn(watcher.run(cancel.child_token()));
    }

    let api_handle = if shared.disable_api {
        None
    } else {
        let state = Arc::new(AppState {
            chains: Arc::new(ChainRegistry::new(statuses)),
            registry: prometheus_registry.clone(),
        });
        let address = SocketAddr::from(([0, 0, 0, 0], shared.api_port));
        Some(run_server(address, state, cancel.child_token()))
    };

    // Run until SIGINT, a watcher failure, or (one-shot) every watcher
    // finishing cleanly.
    let mut failure: Option<anyhow::Error> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            joined = watchers.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => {
                    error!("Chain watcher failed: {}", e);
                    failure = Some(anyhow!(e.to_string()));
                    break;
                }
                Some(Err(e)) => {
                    failure = Some(anyhow!("chain watcher task panicked: {}", e));
                    break;
                }
            }
        }
    }

    // Orderly shutdown: stop the feeds, give the in-flight block a short
    // deadline, then release the store and the API server.
    cancel.cancel();
    let drain = async {
        while watchers.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        error!("Timed out waiting for chain watchers to stop");
    }
    if let Some(handle) = api_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    store.close();

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn build_watcher(
    config: WatcherConfig,
    chain_id: u64,
    rpc: Arc<dyn ChainRpc>,
    store: Arc<RegistryStore>,
    policy_rx: tokio::sync::watch::Receiver<Arc<FilterPolicy>>,
    metrics: Arc<WatchTowerMetrics>,
    status: Arc<ChainStatus>,
    notifier: Arc<Notifier>,
    orderbook_override: Option<Url>,
    dry_run: bool,
) -> Result<ChainWatcher> {
    let orderbook_base = orderbook_override
        .or_else(|| default_orderbook_url(chain_id))
        .with_context(|| {
            format!(
                "no order book URL known for chain {}; pass --orderbook-url",
                chain_id
            )
        })?;
    let orderbook: Arc<dyn OrderbookApi> = Arc::new(
        HttpOrderbook::new(orderbook_base, DEFAULT_MAX_ATTEMPTS)
            .map_err(|e| anyhow!("order book client: {}", e))?,
    );
    let handler: Arc<dyn OrderHandler> = Arc::new(OnChainHandler::new(rpc.clone()));
    let poller = OrderPoller::new(
        chain_id,
        handler,
        orderbook,
        metrics.clone(),
        DiscreteOrder::domain_separator(chain_id, *SETTLEMENT_CONTRACT),
        dry_run,
    );
    let processor = BlockProcessor::new(
        chain_id,
        rpc.clone(),
        store.clone(),
        poller,
        policy_rx,
        metrics.clone(),
        config.process_every_num_blocks,
    );
    let events = EventSource::new(config.network.clone(), rpc.clone(), config.owners.clone());
    Ok(ChainWatcher::new(
        config, chain_id, rpc, store, events, processor, status, metrics, notifier,
    ))
}

// ============================================================================
// dump-db
// ============================================================================

fn dump_db(args: DumpDbArgs) -> Result<()> {
    let store = RegistryStore::open(&args.database_path)
        .map_err(|e| anyhow!("opening registry store: {}", e))?;
    let registry = Registry::load(&store, &args.chain_id.to_string())
        .map_err(|e| anyhow!("loading registry: {}", e))?;
    println!(
        "{}",
        registry
            .to_json_pretty()
            .map_err(|e| anyhow!("serialising registry: {}", e))?
    );
    Ok(())
}

// ============================================================================
// replay-block / replay-tx
// ============================================================================

async fn replay_block(args: ReplayArgs) -> Result<()> {
    let rpc = connect_rpc(args.rpc.as_str())
        .await
        .map_err(|e| anyhow!("connecting {}: {}", args.rpc, e))?;
    replay(
        rpc,
        args.block,
        None,
        &args.database_path,
        args.dry_run,
        args.orderbook_url,
    )
    .await
}

async fn replay_tx(args: ReplayTxArgs) -> Result<()> {
    let rpc = connect_rpc(args.rpc.as_str())
        .await
        .map_err(|e| anyhow!("connecting {}: {}", args.rpc, e))?;
    let receipt = rpc
        .transaction_receipt(args.tx)
        .await
        .map_err(|e| anyhow!("fetching receipt: {}", e))?
        .with_context(|| format!("transaction {:#x} not found", args.tx))?;
    replay(
        rpc,
        receipt.block_number,
        Some(args.tx),
        &args.database_path,
        args.dry_run,
        args.orderbook_url,
    )
    .await
}

/// Re-processes one block against the durable registry. The block cursor
/// is left untouched; submission idempotence keeps replays safe against
/// double-submitting discrete orders.
async fn replay(
    rpc: Arc<dyn ChainRpc>,
    block_number: u64,
    only_tx: Option<ethers::types::H256>,
    database_path: &std::path::Path,
    dry_run: bool,
    orderbook_url: Option<Url>,
) -> Result<()> {
    let chain_id = rpc.chain_id();
    let network = chain_id.to_string();
    let store = Arc::new(
        RegistryStore::open(database_path)
            .map_err(|e| anyhow!("opening registry store: {}", e))?,
    );
    let mut registry = Registry::load(&store, &network)
        .map_err(|e| anyhow!("loading registry: {}", e))?;

    let header = rpc
        .block_by_number(block_number)
        .await
        .map_err(|e| anyhow!("fetching block: {}", e))?
        .with_context(|| format!("block {} not found", block_number))?;
    let tip_number = rpc
        .latest_block_number()
        .await
        .map_err(|e| anyhow!("fetching tip: {}", e))?;
    let tip = rpc
        .block_by_number(tip_number)
        .await
        .map_err(|e| anyhow!("fetching tip block: {}", e))?
        .with_context(|| format!("tip block {} not found", tip_number))?;
    let overrides = PollOverrides {
        block_number: tip_number,
        timestamp: tip.timestamp,
    };

    let events = EventSource::new(network.clone(), rpc.clone(), None)
        .fetch(block_number, BlockTarget::Number(block_number))
        .await
        .map_err(|e| anyhow!("fetching events: {}", e))?;
    let events: Vec<_> = match only_tx {
        Some(tx) => events.into_iter().filter(|e| e.tx_hash == tx).collect(),
        None => events,
    };
    info!(
        "Replaying block {} with {} event(s), poll context at tip {}",
        block_number,
        events.len(),
        tip_number
    );

    let metrics = Arc::new(WatchTowerMetrics::new(&prometheus::Registry::new()));
    let (policy_rx, _policy_handle) =
        spawn_policy_loader(None, DEFAULT_RELOAD_INTERVAL, CancellationToken::new());
    let orderbook_base = orderbook_url
        .or_else(|| default_orderbook_url(chain_id))
        .with_context(|| {
            format!(
                "no order book URL known for chain {}; pass --orderbook-url",
                chain_id
            )
        })?;
    let orderbook: Arc<dyn OrderbookApi> = Arc::new(
        HttpOrderbook::new(orderbook_base, DEFAULT_MAX_ATTEMPTS)
            .map_err(|e| anyhow!("order book client: {}", e))?,
    );
    let handler: Arc<dyn OrderHandler> = Arc::new(OnChainHandler::new(rpc.clone()));
    let poller = OrderPoller::new(
        chain_id,
        handler,
        orderbook,
        metrics.clone(),
        DiscreteOrder::domain_separator(chain_id, *SETTLEMENT_CONTRACT),
        dry_run,
    );
    let mut processor = BlockProcessor::new(
        chain_id,
        rpc,
        store.clone(),
        poller,
        policy_rx,
        metrics,
        1,
    )
    .without_cursor_persistence();

    let result = processor
        .process_block(&mut registry, &header, &events, Some(overrides))
        .await;
    store.close();
    match result {
        Ok(()) => {
            info!(
                "Replay complete: {} owner(s), {} order(s) registered",
                registry.num_owners(),
                registry.num_orders()
            );
            Ok(())
        }
        Err(e) => Err(anyhow!("replay failed: {}", e)),
    }
}

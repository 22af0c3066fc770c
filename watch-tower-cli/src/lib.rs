// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::{Args as ClapArgs, Parser, Subcommand};
use ethers::types::{Address, H256};
use std::path::PathBuf;
use url::Url;

#[derive(Parser)]
#[clap(rename_all = "kebab-case", author, version, about = "Bridge between on-chain conditional orders and the off-chain order book")]
pub struct Args {
    /// Log filter, e.g. INFO or watch_tower=debug
    #[clap(long, env = "LOG_LEVEL", default_value = "INFO", global = true)]
    pub log_level: String,
    #[command(subcommand)]
    pub command: WatchTowerCommand,
}

#[derive(Subcommand)]
pub enum WatchTowerCommand {
    /// Watch a single chain
    Run(RunArgs),
    /// Watch several chains from one process
    RunMulti(RunMultiArgs),
    /// Print the registry of one chain as JSON
    DumpDb(DumpDbArgs),
    /// Re-process a single block without touching the block cursor
    ReplayBlock(ReplayArgs),
    /// Re-process the events of a single transaction
    ReplayTx(ReplayTxArgs),
}

/// Flags shared by the long-running commands
#[derive(ClapArgs, Clone)]
pub struct SharedArgs {
    /// Historical log-query page size; 0 queries straight to "latest"
    #[clap(long, default_value_t = 5000)]
    pub page_size: u64,
    /// Seconds without a block before the watchdog trips
    #[clap(long, default_value_t = 30)]
    pub watchdog_timeout: u64,
    /// Poll the registry only every N blocks
    #[clap(long, default_value_t = 1)]
    pub process_every_num_blocks: u64,
    /// Suppress order-book submissions
    #[clap(long)]
    pub dry_run: bool,
    /// Warm up and exit
    #[clap(long)]
    pub one_shot: bool,
    /// Never send external notifications
    #[clap(long)]
    pub silent: bool,
    /// Slack incoming-webhook URL for error notifications
    #[clap(long, env = "SLACK_WEBHOOK")]
    pub slack_webhook: Option<Url>,
    #[clap(long, default_value = "./database")]
    pub database_path: PathBuf,
    #[clap(long, default_value_t = 8080)]
    pub api_port: u16,
    #[clap(long)]
    pub disable_api: bool,
    /// Override the per-chain order-book API base URL
    #[clap(long)]
    pub orderbook_url: Option<Url>,
    /// URL of the hot-reloaded filter policy
    #[clap(long)]
    pub filter_policy_url: Option<Url>,
    /// Only watch conditional orders of these owners
    #[clap(long, value_delimiter = ',')]
    pub owners: Vec<Address>,
}

#[derive(ClapArgs)]
pub struct RunArgs {
    /// RPC endpoint; ws[s] streams blocks, http[s] polls
    #[clap(long)]
    pub rpc: Url,
    /// First block the watched contracts can have emitted from
    #[clap(long)]
    pub deployment_block: u64,
    #[command(flatten)]
    pub shared: SharedArgs,
}

#[derive(ClapArgs)]
pub struct RunMultiArgs {
    /// RPC endpoints, one per chain, ordered
    #[clap(long, num_args = 1.., required = true)]
    pub rpc: Vec<Url>,
    /// Deployment blocks matching --rpc by position
    #[clap(long, num_args = 1.., required = true)]
    pub deployment_block: Vec<u64>,
    #[command(flatten)]
    pub shared: SharedArgs,
}

#[derive(ClapArgs)]
pub struct DumpDbArgs {
    #[clap(long)]
    pub chain_id: u64,
    #[clap(long, default_value = "./database")]
    pub database_path: PathBuf,
}

#[derive(ClapArgs)]
pub struct ReplayArgs {
    #[clap(long)]
    pub rpc: Url,
    #[clap(long)]
    pub block: u64,
    #[clap(long, default_value = "./database")]
    pub database_path: PathBuf,
    #[clap(long)]
    pub dry_run: bool,
    #[clap(long)]
    pub orderbook_url: Option<Url>,
}

#[derive(ClapArgs)]
pub struct ReplayTxArgs {
    #[clap(long)]
    pub rpc: Url,
    #[clap(long)]
    pub tx: H256,
    #[clap(long, default_value = "./database")]
    pub database_path: PathBuf,
    #[clap(long)]
    pub dry_run: bool,
    #[clap(long)]
    pub orderbook_url: Option<Url>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parse() {
        let args = Args::parse_from([
            "watch-tower",
            "run",
            "--rpc",
            "wss://eth.example/ws",
            "--deployment-block",
            "17883049",
            "--dry-run",
        ]);
        match args.command {
            WatchTowerCommand::Run(run) => {
                assert_eq!(run.rpc.scheme(), "wss");
                assert_eq!(run.deployment_block, 17_883_049);
                assert!(run.shared.dry_run);
                assert_eq!(run.shared.page_size, 5000);
                assert_eq!(run.shared.watchdog_timeout, 30);
                assert_eq!(run.shared.api_port, 8080);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_run_multi_accepts_ordered_lists() {
        let args = Args::parse_from([
            "watch-tower",
            "run-multi",
            "--rpc",
            "https://eth.example",
            "https://gnosis.example",
            "--deployment-block",
            "100",
            "200",
        ]);
        match args.command {
            WatchTowerCommand::RunMulti(multi) => {
                assert_eq!(multi.rpc.len(), 2);
                assert_eq!(multi.deployment_block, vec![100, 200]);
            }
            _ => panic!("expected run-multi command"),
        }
    }

    #[test]
    fn test_owner_list_parses_comma_separated() {
        let args = Args::parse_from([
            "watch-tower",
            "run",
            "--rpc",
            "https://eth.example",
            "--deployment-block",
            "1",
            "--owners",
            "0x0101010101010101010101010101010101010101,0x0202020202020202020202020202020202020202",
        ]);
        match args.command {
            WatchTowerCommand::Run(run) => {
                assert_eq!(run.shared.owners.len(), 2);
                assert_eq!(run.shared.owners[0], Address::repeat_byte(0x01));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_replay_tx_parses_hash() {
        let args = Args::parse_from([
            "watch-tower",
            "replay-tx",
            "--rpc",
            "https://eth.example",
            "--tx",
            "0x0303030303030303030303030303030303030303030303030303030303030303",
        ]);
        match args.command {
            WatchTowerCommand::ReplayTx(replay) => {
                assert_eq!(replay.tx, H256::repeat_byte(0x03));
                assert!(!replay.dry_run);
            }
            _ => panic!("expected replay-tx command"),
        }
    }
}

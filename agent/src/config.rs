// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;

use alloy_primitives::Address;
use anyhow::Context;
use bigdecimal::BigDecimal;
use clap::{Args, Parser};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Parser, Serialize, Deserialize, Default)]
#[clap(name = "settlement-agent", about = "Query-fee settlement agent")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(flatten)]
    pub ethereum: Ethereum,
    #[command(flatten)]
    pub database: Database,
    #[command(flatten)]
    pub network: Network,
    #[command(flatten)]
    pub gateway: Gateway,
    #[command(flatten)]
    pub collection: Collection,
    #[command(flatten)]
    pub redemption: Redemption,
    #[command(flatten)]
    pub monitoring: Monitoring,

    #[arg(
        short,
        long,
        value_name = "config",
        env = "CONFIG",
        help = "Agent configuration file (YAML format); overrides all other arguments"
    )]
    pub config: Option<String>,
}

impl Config {
    /// Parses the command line, then replaces the result wholesale with the
    /// YAML file if one was given.
    pub fn from_args() -> anyhow::Result<Self> {
        let cli = Config::parse();
        let config = match &cli.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file at {path}"))?;
                serde_yaml::from_str(&contents)
                    .with_context(|| format!("failed to parse config file at {path}"))?
            }
            None => cli,
        };
        // Threshold strings must parse before any engine starts.
        config.redemption.voucher_redemption_threshold()?;
        config.redemption.voucher_redemption_batch_threshold()?;
        Ok(config)
    }
}

#[derive(Clone, Debug, Args, Serialize, Deserialize, Default)]
pub struct Ethereum {
    #[clap(
        long,
        value_name = "mnemonic",
        env = "MNEMONIC",
        help = "Mnemonic for the indexer wallet"
    )]
    pub mnemonic: String,
    #[clap(
        long,
        value_name = "indexer-address",
        env = "INDEXER_ADDRESS",
        help = "Ethereum address of the indexer"
    )]
    pub indexer_address: Address,
    #[clap(
        long,
        value_name = "chain-rpc-url",
        env = "CHAIN_RPC_URL",
        default_value_t = String::from("http://127.0.0.1:8545"),
        help = "JSON-RPC endpoint used for on-chain redemption"
    )]
    pub chain_rpc_url: String,
    #[clap(
        long,
        value_name = "allocation-exchange-address",
        env = "ALLOCATION_EXCHANGE_ADDRESS",
        help = "Address of the allocation exchange contract"
    )]
    pub allocation_exchange_address: Address,
    #[clap(
        long,
        value_name = "escrow-address",
        env = "ESCROW_ADDRESS",
        help = "Address of the escrow contract RAVs are redeemed against"
    )]
    pub escrow_address: Address,
    #[clap(
        long,
        value_name = "chain-timeout-secs",
        env = "CHAIN_TIMEOUT_SECS",
        default_value_t = 120,
        help = "Timeout for on-chain submissions (seconds)"
    )]
    pub chain_timeout_secs: u64,
}

#[derive(Clone, Debug, Args, Serialize, Deserialize, Default)]
pub struct Database {
    #[clap(
        long,
        value_name = "postgres-url",
        env = "POSTGRES_URL",
        default_value_t = String::from("postgresql://postgres@127.0.0.1/settlement"),
        help = "Postgres connection URL"
    )]
    pub postgres_url: String,
}

#[derive(Clone, Debug, Args, Serialize, Deserialize, Default)]
pub struct Network {
    #[clap(
        long,
        value_name = "network-subgraph-endpoint",
        env = "NETWORK_SUBGRAPH_ENDPOINT",
        default_value_t = String::from("https://api.thegraph.com/subgraphs/name/graphprotocol/graph-network-mainnet"),
        help = "Endpoint to query the network subgraph from"
    )]
    pub network_subgraph_endpoint: String,
    #[clap(
        long,
        value_name = "protocol-network",
        env = "PROTOCOL_NETWORK",
        default_value_t = String::from("eip155:1"),
        help = "CAIP-2 id of the protocol network this agent settles fees on"
    )]
    pub protocol_network: String,
    #[clap(
        long,
        value_name = "allocation-monitor-interval-ms",
        env = "ALLOCATION_MONITOR_INTERVAL_MS",
        default_value_t = 60_000,
        help = "Interval (ms) for refreshing the eligible allocation set"
    )]
    pub allocation_monitor_interval_ms: u64,
}

#[derive(Clone, Debug, Args, Serialize, Deserialize, Default)]
pub struct Gateway {
    #[clap(
        long,
        value_name = "gateway-base-url",
        env = "GATEWAY_BASE_URL",
        default_value_t = String::from("https://gateway.network"),
        help = "Base URL of the gateway the agent exchanges receipts with"
    )]
    pub gateway_base_url: String,
    #[clap(
        long,
        value_name = "gateway-timeout-secs",
        env = "GATEWAY_TIMEOUT_SECS",
        default_value_t = 60,
        help = "Timeout for gateway requests (seconds)"
    )]
    pub gateway_timeout_secs: u64,
}

#[derive(Clone, Debug, Args, Serialize, Deserialize, Default)]
pub struct Collection {
    #[clap(
        long,
        value_name = "receipt-collect-delay-ms",
        env = "RECEIPT_COLLECT_DELAY_MS",
        default_value_t = 1_200_000,
        help = "Wait after an allocation closes before its receipts are collected (ms)"
    )]
    pub receipt_collect_delay_ms: u64,
    #[clap(
        long,
        value_name = "collection-tick-ms",
        env = "COLLECTION_TICK_MS",
        default_value_t = 10_000,
        help = "Interval (ms) between collection scheduler ticks"
    )]
    pub collection_tick_ms: u64,
}

#[derive(Clone, Debug, Args, Serialize, Deserialize, Default)]
pub struct Redemption {
    #[clap(
        long,
        value_name = "voucher-redemption-threshold",
        env = "VOUCHER_REDEMPTION_THRESHOLD",
        default_value_t = String::from("0"),
        help = "Minimum per-voucher amount eligible for redemption (wei)"
    )]
    pub voucher_redemption_threshold: String,
    #[clap(
        long,
        value_name = "voucher-redemption-batch-threshold",
        env = "VOUCHER_REDEMPTION_BATCH_THRESHOLD",
        default_value_t = String::from("0"),
        help = "Minimum summed batch amount before a redemption is submitted (wei)"
    )]
    pub voucher_redemption_batch_threshold: String,
    #[clap(
        long,
        value_name = "voucher-redemption-max-batch-size",
        env = "VOUCHER_REDEMPTION_MAX_BATCH_SIZE",
        default_value_t = 100,
        help = "Upper bound on the number of vouchers redeemed in one transaction"
    )]
    pub voucher_redemption_max_batch_size: u32,
    #[clap(
        long,
        value_name = "voucher-tick-ms",
        env = "VOUCHER_TICK_MS",
        default_value_t = 30_000,
        help = "Interval (ms) between redemption engine ticks"
    )]
    pub voucher_tick_ms: u64,
}

impl Redemption {
    pub fn voucher_redemption_threshold(&self) -> anyhow::Result<BigDecimal> {
        BigDecimal::from_str(&self.voucher_redemption_threshold)
            .context("invalid voucher redemption threshold")
    }

    pub fn voucher_redemption_batch_threshold(&self) -> anyhow::Result<BigDecimal> {
        BigDecimal::from_str(&self.voucher_redemption_batch_threshold)
            .context("invalid voucher redemption batch threshold")
    }
}

#[derive(Clone, Debug, Args, Serialize, Deserialize, Default)]
pub struct Monitoring {
    #[clap(
        long,
        value_name = "metrics-port",
        env = "METRICS_PORT",
        default_value_t = 7300,
        help = "Port to serve Prometheus metrics at"
    )]
    pub metrics_port: u16,
    #[clap(
        long,
        value_name = "log-level",
        env = "LOG_LEVEL",
        help = "Log level in RUST_LOG format"
    )]
    pub log_level: Option<String>,
    #[clap(
        long,
        value_name = "log-json",
        env = "LOG_JSON",
        default_value_t = false,
        help = "Emit logs as JSON"
    )]
    pub log_json: bool,
}

// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use anyhow::Context;
use ethers::signers::{coins_bip39::English, MnemonicBuilder};
use reqwest::Url;
use tracing::info;

use settlement_common::prelude::{eligible_allocations, SubgraphClient, TimerHandle};

use crate::collector::ReceiptCollector;
use crate::config::Config;
use crate::contracts::ContractFacade;
use crate::database;
use crate::gateway::GatewayClient;
use crate::metrics;
use crate::ravs::RavRedeemer;
use crate::vouchers::VoucherRedeemer;

/// The running settlement core. Dropping it stops every periodic task at its
/// next tick boundary.
pub struct Agent {
    _allocation_monitor: TimerHandle,
    _collection_timer: TimerHandle,
    _voucher_timer: TimerHandle,
    _rav_timer: TimerHandle,
    _metrics_server: tokio::task::JoinHandle<()>,
}

pub async fn start(config: &'static Config) -> anyhow::Result<Agent> {
    let pool = database::connect(&config.database.postgres_url)
        .await
        .context("failed to connect the database")?;

    let network_subgraph: &'static SubgraphClient = Box::leak(Box::new(SubgraphClient::new(
        reqwest::Client::new(),
        Url::parse(&config.network.network_subgraph_endpoint)
            .context("invalid network subgraph endpoint")?,
    )));
    let (allocation_monitor, allocations) = eligible_allocations(
        network_subgraph,
        config.ethereum.indexer_address,
        Duration::from_millis(config.network.allocation_monitor_interval_ms),
    );

    let operator = MnemonicBuilder::<English>::default()
        .phrase(config.ethereum.mnemonic.as_str())
        .build()
        .context("invalid indexer mnemonic")?;
    let facade = ContractFacade::connect(
        &config.ethereum.chain_rpc_url,
        operator,
        config.ethereum.allocation_exchange_address,
        config.ethereum.escrow_address,
        Duration::from_secs(config.ethereum.chain_timeout_secs),
    )
    .await?;

    let gateway = GatewayClient::new(
        &config.gateway.gateway_base_url,
        Duration::from_secs(config.gateway.gateway_timeout_secs),
    )?;
    let collector = ReceiptCollector::new(
        pool.clone(),
        gateway,
        config.network.protocol_network.clone(),
        Duration::from_millis(config.collection.receipt_collect_delay_ms),
    );
    collector
        .queue_pending_receipts_from_database()
        .await
        .context("failed to recover pending receipt batches")?;
    let collection_timer =
        collector.start(Duration::from_millis(config.collection.collection_tick_ms));

    let voucher_redeemer = VoucherRedeemer::new(
        pool.clone(),
        facade.clone(),
        config.network.protocol_network.clone(),
        config.redemption.voucher_redemption_threshold()?,
        config.redemption.voucher_redemption_batch_threshold()?,
        config.redemption.voucher_redemption_max_batch_size as usize,
    );
    let voucher_timer =
        voucher_redeemer.start(Duration::from_millis(config.redemption.voucher_tick_ms));

    let rav_redeemer = RavRedeemer::new(
        pool,
        facade,
        allocations,
        config.ethereum.mnemonic.clone(),
        config.ethereum.indexer_address,
        config.network.protocol_network.clone(),
        config.redemption.voucher_redemption_threshold()?,
    );
    let rav_timer = rav_redeemer.start(Duration::from_millis(config.redemption.voucher_tick_ms));

    let metrics_server = metrics::serve_metrics(config.monitoring.metrics_port);

    info!(
        network = %config.network.protocol_network,
        "Query-fee settlement agent started"
    );
    Ok(Agent {
        _allocation_monitor: allocation_monitor,
        _collection_timer: collection_timer,
        _voucher_timer: voucher_timer,
        _rav_timer: rav_timer,
        _metrics_server: metrics_server,
    })
}

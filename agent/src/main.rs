// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use tracing::info;
use tracing_subscriber::EnvFilter;

use settlement_agent::agent;
use settlement_agent::config::Config;

fn init_tracing(config: &Config) {
    if let Some(level) = &config.monitoring.log_level {
        std::env::set_var("RUST_LOG", level);
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.monitoring.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config: &'static Config = Box::leak(Box::new(Config::from_args()?));
    init_tracing(config);

    let agent = agent::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal; stopping at the next tick boundary");
    drop(agent);
    Ok(())
}

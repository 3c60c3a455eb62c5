//! `threadloom serve`: start the HTTP gateway.

use anyhow::Context;
use threadloom_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("Failed to load config")?;
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("Threadloom gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Store: {}", config.store.backend);

    threadloom_gateway::start(config).await?;
    Ok(())
}

mod config;
mod logging;
mod server;
mod ws;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use relayhub_sfu::Hub;
use tracing::{info, warn};

use crate::config::Config;

/// Many-to-many websocket-signaled media relay
#[derive(Debug, Parser)]
#[command(name = "relayhub", version, about)]
struct Cli {
    /// HTTP service address (overrides server.addr)
    #[arg(long, env = "RELAYHUB_ADDR")]
    addr: Option<String>,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "RELAYHUB_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(addr) = cli.addr {
        config.server.addr = addr;
    }

    // 2. Validate (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("RelayHub starting...");
    info!("HTTP address: {}", config.server.addr);
    match &config.sfu.stats_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            info!("Writing session statistics to {}", dir.display());
        }
        None => info!("Session statistics disabled"),
    }

    // 4. Start the hub's background tasks
    let hub = Hub::new(config.sfu.clone());
    let tasks = hub.start();

    // 5. Serve until shutdown
    let served = server::serve(&config, std::sync::Arc::clone(&hub)).await;
    hub.shutdown();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!("RelayHub stopped");
    served
}

//! Quire sync server.
//!
//! Usage: `quire-server [config.toml]`. Without a config file the server
//! listens on the default address with default limits.

use log::{error, info};
use quire_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(&path).map_err(|e| {
            error!("Failed to load config {path}: {e}");
            e
        })?,
        None => ServerConfig::default(),
    };

    info!(
        "Starting quire-server on {} (max {} sessions per document, history {})",
        config.bind_addr, config.max_peers_per_room, config.history_length
    );

    let server = SyncServer::new(config);
    server.run().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

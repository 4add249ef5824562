//! Standalone room server.
//!
//! Environment:
//! - `BOARD_SYNC_ADDR`: bind address (default `127.0.0.1:9090`)
//! - `BOARD_SYNC_TOKENS`: accepted credentials as `token:name,token:name`
//! - `BOARD_SYNC_CAPACITY`: broadcast buffer per room
//! - `RUST_LOG`: log filter (default `info`)

use std::sync::Arc;

use board_sync::{ServerConfig, StaticTokenAuthenticator, SyncServer};
use log::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("BOARD_SYNC_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(capacity) = std::env::var("BOARD_SYNC_CAPACITY") {
        match capacity.parse() {
            Ok(capacity) => config.broadcast_capacity = capacity,
            Err(e) => warn!("Ignoring BOARD_SYNC_CAPACITY={capacity}: {e}"),
        }
    }

    let tokens = std::env::var("BOARD_SYNC_TOKENS").unwrap_or_default();
    let auth = StaticTokenAuthenticator::parse(&tokens);
    if auth.is_empty() {
        warn!("BOARD_SYNC_TOKENS is empty, every connection will be rejected");
    }

    info!("Starting board-sync server...");
    let server = SyncServer::new(config, Arc::new(auth));
    server.run().await
}

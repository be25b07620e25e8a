//! Standalone relay for logos-share rooms.
//!
//! Usage: `logos-share-relay [BIND_ADDR]`. Without an argument the address
//! comes from `LOGOS_SHARE_BIND`, then the built-in default.

use log::info;
use logos_share::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LOGOS_SHARE_BIND").ok())
    {
        config.bind_addr = addr;
    }

    info!("Starting logos-share relay on {}...", config.bind_addr);
    if let Err(e) = RelayServer::new(config).run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}

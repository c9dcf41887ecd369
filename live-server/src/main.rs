//! Live server: real-time collaboration for project pages.
//!
//! Reads its configuration from the environment (and `.env`), then serves
//! `/health` and `/collaboration` until Ctrl+C.

use log::{error, info};

use live_collab::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting live server on {} (content API {}, relay {})",
        config.bind_addr(),
        config.api_base_url,
        if config.redis_url.is_some() { "enabled" } else { "disabled" }
    );

    let server = match CollabServer::from_config(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start live server: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Live server failed: {e}");
        std::process::exit(1);
    }
}

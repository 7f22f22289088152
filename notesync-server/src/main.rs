//! notesync relay server.
//!
//! Configured from `NOTESYNC_*` environment variables (see
//! [`ServerConfig::from_env`]); log level from `RUST_LOG`, default `info`.

use notesync_collab::{ServerConfig, ServerError, SyncServer};

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    log::info!(
        "starting notesync server on {} (max {} peers per room)",
        config.bind_addr,
        config.max_peers_per_room
    );

    let server = SyncServer::new(config)?;
    server.run().await
}

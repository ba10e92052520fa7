//! Example: Running a session server
//!
//! Loads `session-net.toml` (or the path given as the first argument) when
//! present, applies `SESSION_NET_*` environment overrides, and serves until
//! CTRL+C.
//!
//! Run with: `cargo run --example server -- [config.toml]`

use std::path::Path;

use session_net::config::NetworkConfig;
use session_net::utils::logging::init_logging;
use session_net::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "session-net.toml".to_string());
    let config = if Path::new(&path).exists() {
        NetworkConfig::from_file(&path)?
    } else {
        NetworkConfig::from_env()?
    };

    init_logging(&config.logging)?;

    let server = Server::bind(config).await?;
    println!("Listening on {}", server.local_addr()?);
    server.run().await?;
    Ok(())
}

//! flockwaved — the Flockwave server launcher.

use tracing::info;
use tracing_subscriber::EnvFilter;

use flockwaved::{App, Config};

#[tokio::main]
async fn main() {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .with_target(true)
        .init();

    info!(server = %config.server_name, "configuration loaded");

    let app = App::new(config);
    if let Err(error) = app.run().await {
        eprintln!("fatal: {error}");
        std::process::exit(1);
    }
}

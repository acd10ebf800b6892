use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use p3at_zenoh_bridge::config::Args;

#[tokio::main]
async fn main() {
    // Setup logging (RUST_LOG overrides, defaults to info)
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    if let Err(e) = p3at_zenoh_bridge::runtime::run(args).await {
        error!("Bridge error: {}", e);
        std::process::exit(e.exit_code());
    }
}

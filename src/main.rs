//! hc-multiplexer - WebSocket multiplexer for Holochain conductors

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hc_multiplexer::{config::Args, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("hc_multiplexer={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  hc-multiplexer v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "  build {} ({})",
        option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        option_env!("BUILD_TIMESTAMP").unwrap_or("unknown")
    );
    info!("======================================");
    info!("Conductors: {}", args.conductor_count);
    for conductor in 0..args.conductor_count {
        if let Ok(shard) = args.shard_config(conductor) {
            info!(
                "  conductor-{}: {} -> {} (admin {})",
                conductor, shard.listen, shard.upstream_url, shard.admin_url
            );
        }
    }
    info!("Pool size: {} per conductor", args.pool_size);
    info!(
        "Attach app interfaces: {}",
        if args.attach_interfaces { "yes" } else { "no" }
    );
    info!("======================================");

    server::run(&args).await?;

    info!("hc-multiplexer stopped");
    Ok(())
}

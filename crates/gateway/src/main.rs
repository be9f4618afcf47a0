use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use toolgate_gateway::config::{CliArgs, GatewayConfig};
use toolgate_gateway::gateway::Gateway;
use toolgate_gateway::registry::Registry;
use toolgate_keystore::Keystore;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_env("TOOLGATE_LOG")
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    let keystore = Arc::new(Keystore::open(&args.keystore_dir)?);
    let config = GatewayConfig::load(&args.config)?;
    tracing::info!(
        config = %args.config.display(),
        servers = config.servers.len(),
        "configuration loaded"
    );

    let registry = Registry::new(args.config.clone(), config);
    registry.start_autostart_servers().await;

    let gateway = Gateway::new(Arc::clone(&registry), keystore);
    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    tracing::info!(port = args.port, "toolgate ready");

    let server = tokio::spawn(Arc::clone(&gateway).serve(listener));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    server.abort();
    gateway.shutdown().await;
    registry.stop_all().await;
    tracing::info!("goodbye");
    Ok(())
}

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use portkey_gateway::{
    FederationGateway, GatewayConfig,
    config::Args,
    server,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = GatewayConfig::from_file(&args.config)
        .with_context(|| format!("invalid gateway config {}", args.config.display()))?;
    config.apply_args(&args);

    let gateway = Arc::new(FederationGateway::builder(config.gateway.clone()).build()?);

    // No partial schema is ever served: a failed first composition stops the process.
    if let Err(e) = gateway.start().await {
        tracing::error!("Failed to compose the federated schema: {}", e);
        return Err(e.into());
    }
    let _poller = gateway.spawn_polling();

    let addr = config.server.listen;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(
        "GraphQL Federation Gateway listening on http://{}{}",
        addr,
        config.server.path
    );
    if config.server.landing_page {
        tracing::info!("GraphiQL available at http://{}{}", addr, config.server.path);
    }

    tokio::select! {
        result = server::serve(listener, Arc::clone(&gateway), config.server) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }

    Ok(())
}

//! arcs-relay: session broker between capturing devices and controllers

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use arcs_relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match RelayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            // Startup failures get one descriptive line and a non-zero exit.
            eprintln!("arcs-relay: {e}");
            std::process::exit(1);
        }
    };

    info!("starting arcs-relay");
    let server = match RelayServer::new(config).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("arcs-relay: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("server error: {e}");
        return Err(e);
    }

    Ok(())
}

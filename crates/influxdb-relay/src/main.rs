//! Relay binary.
//!
//! Loads `relay.toml` (or the path given as the first argument) and serves
//! until interrupted.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use influxdb_relay::{run, RelayConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("influxdb_relay=info".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "relay.toml".to_owned());
    let config = RelayConfig::load_from(&config_path)?;

    info!(
        bind_address = %config.bind_address,
        outputs = config.outputs.len(),
        queries = config.queries.len(),
        "configuration loaded"
    );

    let cancel = CancellationToken::new();

    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        cancel_on_signal.cancel();
    });

    if let Err(e) = run(config, cancel).await {
        error!(error = %e, "relay error");
        return Err(e.into());
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C");
        }
        () = terminate => {
            info!("received SIGTERM");
        }
    }
}

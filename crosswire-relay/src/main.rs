//! Crosswire relay server -- WebSocket rendezvous and relay.
//!
//! An axum WebSocket server that joins connections presenting the same
//! out-of-band channel identifier and forwards their frames verbatim.
//! The relay never interprets payloads -- it only reads the control
//! envelope's `type` tag on paired channels.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:8080
//! cargo run --bin crosswire-relay
//!
//! # Run on custom port
//! cargo run --bin crosswire-relay -- --port 9000
//!
//! # Or via environment variable
//! PORT=9000 cargo run --bin crosswire-relay
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crosswire_relay::config::{CliArgs, RelayConfig};
use crosswire_relay::session::{self, RelayState};

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        ready_delay_ms = config.ready_delay_ms,
        "starting crosswire relay server"
    );

    let state = Arc::new(RelayState::with_ready_delay(Duration::from_millis(
        config.ready_delay_ms,
    )));

    match session::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}

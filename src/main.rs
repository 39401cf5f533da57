//! Shelter Sentry - edge telemetry agent
//!
//! Polls the configured sensors, turns state changes into timestamped events
//! and delivers them to the shelter backend. Events that cannot be delivered
//! are kept in a local log and retried until the backend accepts them.
//!
//! ## Configuration
//!
//! Configuration is loaded from `SHELTER_SENTRY_*` environment variables,
//! see `Config::from_env`. Logging is filtered with `RUST_LOG` (default: info).
//!
//! ## Exit codes
//!
//! - `0`: stopped by SIGINT/SIGTERM
//! - `1`: configuration, hardware, or storage setup failed

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shelter_sentry::client::DeliveryClient;
use shelter_sentry::config::Config;
use shelter_sentry::dispatcher::{dispatcher_task, Dispatcher, RetryPolicy};
use shelter_sentry::hardware::open_sources;
use shelter_sentry::poller::{poller_task, SensorPoller};
use shelter_sentry::store::FailureStore;

/// Capacity of the poller-to-dispatcher channel, in sweeps
const CHANNEL_CAPACITY: usize = 256;

/// Grace period on top of the request timeout for the tasks to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Shelter Sentry...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                endpoint = %config.endpoint_url,
                shelter_id = %config.shelter_id,
                poll_interval_ms = config.poll_interval.as_millis() as u64,
                digital_pins = ?config.digital_pins,
                thermal = config.thermal.is_some(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let sources = match open_sources(&config) {
        Ok(sources) => sources,
        Err(e) => {
            error!(error = %e, "Sensor setup failed");
            std::process::exit(1);
        }
    };
    let mut poller = SensorPoller::new(config.first_sample);
    for source in sources {
        poller.add_source(source);
    }
    info!(sources = poller.len(), "Sensors ready");

    let store = match FailureStore::open(&config.failure_log, &config.dead_letter_log) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to open failure log");
            std::process::exit(1);
        }
    };

    let client = match DeliveryClient::new(&config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            std::process::exit(1);
        }
    };

    let dispatcher = Dispatcher::new(
        client.clone(),
        config.credentials(),
        store,
        RetryPolicy::from_config(&config),
    );

    let token = CancellationToken::new();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let poller_handle = tokio::spawn(poller_task(
        poller,
        tx,
        token.clone(),
        config.poll_interval,
    ));
    let dispatcher_handle = tokio::spawn(dispatcher_task(dispatcher, rx, token.clone()));

    info!("Shelter Sentry running. Press Ctrl+C to stop.");
    wait_for_shutdown_signal().await;

    info!("Initiating graceful shutdown...");
    token.cancel();

    let shutdown_timeout = config.request_timeout + SHUTDOWN_GRACE;

    // Sensors are released when the poller task drops them.
    match tokio::time::timeout(shutdown_timeout, poller_handle).await {
        Ok(Ok(())) => info!("Poller stopped, sensors released"),
        Ok(Err(e)) => warn!(error = %e, "Poller task panicked during shutdown"),
        Err(_) => warn!("Poller shutdown timed out after {:?}", shutdown_timeout),
    }

    match tokio::time::timeout(shutdown_timeout, dispatcher_handle).await {
        Ok(Ok(dispatcher)) => {
            let stats = dispatcher.stats();
            info!(
                events = stats.events_received,
                delivered = stats.delivered_immediately,
                redelivered = stats.redelivered,
                persisted = stats.persisted,
                dead_lettered = stats.dead_lettered,
                lost = stats.lost,
                pending_retry = dispatcher.store().len(),
                "Dispatcher stopped"
            );
        }
        Ok(Err(e)) => warn!(error = %e, "Dispatcher task panicked during shutdown"),
        Err(_) => warn!("Dispatcher shutdown timed out after {:?}", shutdown_timeout),
    }

    let client_stats = client.stats();
    info!(
        delivered = client_stats.delivered,
        rejected = client_stats.rejected,
        unreachable = client_stats.unreachable,
        "Shelter Sentry stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Resolve on SIGINT, or on SIGTERM where available.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Shutdown signal received, stopping..."),
        _ = terminate => info!("SIGTERM received, stopping..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_capacity() {
        assert!(CHANNEL_CAPACITY >= 16);
        assert!(CHANNEL_CAPACITY <= 10_000);
    }

    #[test]
    fn test_shutdown_grace() {
        assert!(SHUTDOWN_GRACE >= Duration::from_secs(1));
    }
}

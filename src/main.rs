use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use pg_channel_listener::app;
use pg_channel_listener::config::Settings;
use pg_channel_listener::context::Context;
use pg_channel_listener::listener::ListenOutcome;
use pg_channel_listener::metrics;
use pg_channel_listener::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    telemetry::init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!(
        database = %settings.database.masked_url(),
        channel = %settings.database.channel,
        "Configuration loaded"
    );

    // Cancel the wait on Ctrl+C / SIGTERM
    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal_handler(token.clone()));
    let ctx = Context::with_token(token);

    let result = app::run_once(&settings.database, &ctx).await;
    log_metrics();

    match result {
        Ok(ListenOutcome::Notified(notification)) => {
            tracing::info!(
                channel = %notification.channel,
                payload = %notification.payload,
                process_id = notification.process_id,
                "Notified"
            );
            Ok(())
        }
        Ok(ListenOutcome::TimedOut) => {
            tracing::info!(timeout = settings.database.timeout, "Timed out without notification");
            Ok(())
        }
        Err(e) => {
            if e.is_fatal() {
                tracing::error!(error = %e, "Cannot start without a connection pool");
            } else {
                tracing::error!(error = %e, "Listen failed");
            }
            Err(e.into())
        }
    }
}

/// Dump the collected metrics in Prometheus text format at debug level.
fn log_metrics() {
    match metrics::encode_metrics() {
        Ok(text) => tracing::debug!(metrics = %text, "Final metrics"),
        Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
    }
}

async fn shutdown_signal_handler(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, cancelling");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, cancelling");
        }
    }

    token.cancel();
}

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialises the subscriber and arms `cancel` on SIGINT/SIGTERM.
///
/// The driver polls the token between horizons, so a stop request does not
/// kill an in-flight solve: the current horizon finishes, the job's partial
/// rows are cleaned up, and only then does the process exit.
pub fn init_tracing(json: bool, cancel: CancellationToken) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sqlx=warn".into());
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tokio::spawn(async move {
        wait_for_stop_request().await;
        info!("stop requested; job will cancel after the current horizon");
        cancel.cancel();
    });
}

async fn wait_for_stop_request() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "no SIGTERM handler, listening for Ctrl+C only");
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

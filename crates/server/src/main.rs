//! Podwatch controller entry point.
//!
//! Reads watch events from stdin, reconciles the affected keys and stops on
//! SIGINT, SIGTERM or end of input.

mod reconciler;
mod watch;

use std::sync::Arc;

use podwatch_common::{AppError, AppResult, Config};
use podwatch_queue::{
    Controller, ControllerConfig, RateLimitConfig, RetryConfig, TracingErrorSink,
};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::reconciler::LoggingReconciler;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "podwatch=info,podwatch_queue=info".into());
    let json = std::env::var("PODWATCH_LOG_FORMAT").is_ok_and(|format| format == "json");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn controller_config(config: &Config) -> ControllerConfig {
    ControllerConfig {
        retry: RetryConfig {
            max_retries: config.retry.max_retries,
            initial_delay: config.retry.base_delay(),
            max_delay: config.retry.max_delay(),
            ..Default::default()
        },
        rate_limit: RateLimitConfig {
            qps: config.rate_limit.qps,
            burst: config.rate_limit.burst,
        },
        skip_identical_updates: config.controller.skip_identical_updates,
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::load()?;
    if config.controller.channel_capacity == 0 {
        return Err(AppError::Config(
            "controller.channel_capacity must be positive".to_string(),
        ));
    }

    info!(
        workers = config.controller.workers,
        max_retries = config.retry.max_retries,
        "Starting podwatch..."
    );

    let controller = Controller::new(
        Arc::new(LoggingReconciler),
        Arc::new(TracingErrorSink),
        controller_config(&config),
    );

    let (tx, rx) = mpsc::channel(config.controller.channel_capacity);
    let mut pump = controller.spawn_event_pump(rx);

    // A plain thread: a blocked stdin read must not hold up runtime shutdown.
    std::thread::Builder::new()
        .name("watch-source".to_string())
        .spawn(move || {
            let sent = watch::read_events(std::io::stdin().lock(), &tx);
            info!(events = sent, "Watch stream ended");
        })?;

    controller.start(config.controller.workers);

    let input_exhausted = tokio::select! {
        () = shutdown_signal() => false,
        result = &mut pump => {
            result.map_err(|e| AppError::Controller(format!("event pump failed: {e}")))?;
            true
        },
    };
    if !input_exhausted {
        pump.abort();
    }

    controller.stop().await;

    let metrics = controller.metrics();
    info!(
        received = metrics.notifications_received,
        processed = metrics.keys_processed,
        retries = metrics.reconcile_retries,
        dropped = metrics.drops_total,
        "Controller shutdown complete"
    );
    Ok(())
}

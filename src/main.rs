//! Sunblock binary entry point

use std::process::ExitCode;
use std::time::Duration;

use sunblock::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load `.env` and configuration
/// 2. Initialize tracing/logging
/// 3. Initialize AppState (database, XRPC client)
/// 4. Run once, or on the configured interval until SIGINT/SIGTERM
/// 5. Close the database
#[tokio::main]
async fn main() -> ExitCode {
    // 1. Load configuration
    let _ = dotenv::dotenv();
    let loaded = config::AppConfig::load();

    // 2. Initialize tracing/logging
    let (level, format) = match &loaded {
        Ok(config) => (config.logging.level.clone(), config.logging.format.clone()),
        Err(_) => ("info".to_string(), "pretty".to_string()),
    };
    init_tracing(&level, &format);

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        username = %config.atproto.username,
        follow_limit = config.blocking.follow_limit,
        subscriptions = config.blocking.subscriptions.len(),
        scheduled = config.schedule.enabled,
        "Starting Sunblock..."
    );

    sunblock::metrics::init_metrics();

    // 3. Initialize application state
    let state = match AppState::new(config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize application state");
            return ExitCode::FAILURE;
        }
    };

    // 4. Run
    let orchestrator = state.orchestrator();
    let exit = if state.config.schedule.enabled {
        let interval = Duration::from_secs(state.config.schedule.interval_seconds);
        tracing::info!(interval_seconds = interval.as_secs(), "Scheduler started");

        tokio::select! {
            _ = orchestrator.run_scheduled(interval) => ExitCode::SUCCESS,
            _ = shutdown_signal() => ExitCode::SUCCESS,
        }
    } else {
        tokio::select! {
            result = orchestrator.run_once() => match result {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "Reconciliation run aborted");
                    ExitCode::FAILURE
                }
            },
            _ = shutdown_signal() => ExitCode::SUCCESS,
        }
    };

    // 5. Close the database
    if let Err(e) = state.shutdown().await {
        tracing::error!(error = %e, "Failed to close database");
        return ExitCode::FAILURE;
    }

    exit
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("sunblock={level},sqlx=warn").into());

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

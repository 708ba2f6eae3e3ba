//! Sunblock - a scheduled block-list reconciler for a single Bluesky account
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Orchestrator                             │
//! │  - authenticate, then run the passes in sequence            │
//! │  - one-shot or fixed interval                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Spam pass (follow-count threshold)                       │
//! │  - Subscription pass (mirrored block lists)                 │
//! │  - Repository sync (local blocks vs. repository records)    │
//! └─────────────────────────────────────────────────────────────┘
//!                │                               │
//! ┌──────────────────────────────┐ ┌────────────────────────────┐
//! │        Data Layer            │ │      AT Protocol            │
//! │  - SQLite (sqlx)             │ │  - XRPC client (reqwest)    │
//! │  - Handle cache              │ │  - Pagination, pacing       │
//! └──────────────────────────────┘ └────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `atproto`: Directory client trait and its XRPC implementation
//! - `service`: Reconcilers and the run orchestrator
//! - `data`: Local store and handle cache
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments and textfile export

pub mod atproto;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod service;

use std::sync::Arc;

/// Application state shared by every run
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Local store
    pub db: Arc<data::Database>,

    /// Remote directory client
    pub client: Arc<dyn atproto::DirectoryClient>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Open the SQLite database and apply migrations
    /// 2. Build the XRPC client for the configured service
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = data::Database::connect(&config.database.path).await?;
        tracing::info!(path = %config.database.path.display(), "Database connected");

        let client = atproto::XrpcClient::new(&config.atproto)?;
        tracing::info!(service = %config.atproto.service_url, "XRPC client initialized");

        Ok(Self {
            config: Arc::new(config),
            db: Arc::new(db),
            client: Arc::new(client),
        })
    }

    /// Orchestrator bound to this state
    pub fn orchestrator(&self) -> service::Orchestrator {
        service::Orchestrator::new(self.config.clone(), self.db.clone(), self.client.clone())
    }

    /// Flush and close the local store
    pub async fn shutdown(&self) -> Result<(), error::AppError> {
        self.db.close().await?;
        tracing::info!("Database closed");
        Ok(())
    }
}

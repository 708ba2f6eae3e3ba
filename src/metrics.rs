//! Prometheus metrics registry and instruments.
//!
//! Sunblock has no HTTP surface, so the registry is exported by writing it
//! to a node_exporter textfile after each run.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::path::Path;
use std::sync::Once;

use crate::error::AppError;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Block record metrics
    pub static ref BLOCKS_CREATED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sunblock_blocks_created_total", "Block records created in the owner's repository"),
        &["reason"]
    ).expect("metric can be created");
    pub static ref BLOCKS_DELETED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sunblock_blocks_deleted_total", "Block records removed from local state"),
        &["reason"]
    ).expect("metric can be created");

    // Subscription view metrics
    pub static ref SUBSCRIPTION_BLOCKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sunblock_subscription_blocks_total", "Subscription block rows inserted or removed"),
        &["action"]
    ).expect("metric can be created");

    // Error metrics
    pub static ref ITEM_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sunblock_item_failures_total", "Per-account failures skipped during a pass"),
        &["pass"]
    ).expect("metric can be created");

    // Run metrics
    pub static ref LAST_RUN_TIMESTAMP_SECONDS: IntGauge = IntGauge::new(
        "sunblock_last_run_timestamp_seconds",
        "Unix time the last reconciliation run finished"
    ).expect("metric can be created");
    pub static ref RUN_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "sunblock_run_duration_seconds",
            "Duration of a full reconciliation run in seconds"
        ).buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0])
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; registration happens on the first call.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(BLOCKS_CREATED_TOTAL.clone()))
            .expect("BLOCKS_CREATED_TOTAL can be registered");
        REGISTRY
            .register(Box::new(BLOCKS_DELETED_TOTAL.clone()))
            .expect("BLOCKS_DELETED_TOTAL can be registered");
        REGISTRY
            .register(Box::new(SUBSCRIPTION_BLOCKS_TOTAL.clone()))
            .expect("SUBSCRIPTION_BLOCKS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ITEM_FAILURES_TOTAL.clone()))
            .expect("ITEM_FAILURES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(LAST_RUN_TIMESTAMP_SECONDS.clone()))
            .expect("LAST_RUN_TIMESTAMP_SECONDS can be registered");
        REGISTRY
            .register(Box::new(RUN_DURATION_SECONDS.clone()))
            .expect("RUN_DURATION_SECONDS can be registered");

        tracing::info!("Metrics registry initialized");
    });
}

/// Render the registry in Prometheus text format
pub fn render() -> Result<String, AppError> {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .map_err(|e| AppError::Internal(e.into()))
}

/// Write the registry to a textfile collector file
///
/// Writes to a sibling temp file and renames it so the collector never
/// reads a partial file.
pub fn write_textfile(path: &Path) -> Result<(), AppError> {
    let body = render()?;
    let tmp = path.with_extension("prom.tmp");

    std::fs::write(&tmp, body).map_err(|e| AppError::Internal(e.into()))?;
    std::fs::rename(&tmp, path).map_err(|e| AppError::Internal(e.into()))?;

    tracing::debug!(path = %path.display(), "Metrics textfile written");
    Ok(())
}

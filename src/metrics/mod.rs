//! Prometheus metrics for monitoring
//!
//! Exposes counters for:
//! - Forward and reverse bridge attempts
//! - Compensating actions and protocol-invariant breaks
//! - Ledger write failures
//! - Network switches

use axum::{routing::get, Json, Router};
use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Forward path
    pub static ref FORWARD_STARTED: CounterVec = register_counter_vec!(
        "nftbridge_forward_started_total",
        "Total forward bridge attempts started",
        &["source", "dest"]
    ).unwrap();

    pub static ref FORWARD_COMPLETED: CounterVec = register_counter_vec!(
        "nftbridge_forward_completed_total",
        "Total forward bridge attempts completed",
        &["source", "dest"]
    ).unwrap();

    pub static ref FORWARD_FAILED: CounterVec = register_counter_vec!(
        "nftbridge_forward_failed_total",
        "Total forward bridge attempts failed",
        &["source", "dest"]
    ).unwrap();

    // Reverse path
    pub static ref REVERSALS_STARTED: CounterVec = register_counter_vec!(
        "nftbridge_reversals_started_total",
        "Total reverse bridge attempts started",
        &["chain"]
    ).unwrap();

    pub static ref REVERSALS_COMPLETED: CounterVec = register_counter_vec!(
        "nftbridge_reversals_completed_total",
        "Total reverse bridge attempts completed",
        &["chain"]
    ).unwrap();

    pub static ref REVERSALS_FAILED: CounterVec = register_counter_vec!(
        "nftbridge_reversals_failed_total",
        "Total reverse bridge attempts failed",
        &["chain"]
    ).unwrap();

    pub static ref REVERSALS_STRANDED: CounterVec = register_counter_vec!(
        "nftbridge_reversals_stranded_total",
        "Reversals where the burn committed but the unlock failed",
        &["chain"]
    ).unwrap();

    // Compensation
    pub static ref COMPENSATIONS: CounterVec = register_counter_vec!(
        "nftbridge_compensations_total",
        "Compensating unlocks attempted after a failed mint",
        &["chain"]
    ).unwrap();

    pub static ref COMPENSATION_FAILURES: CounterVec = register_counter_vec!(
        "nftbridge_compensation_failures_total",
        "Compensating unlocks that themselves failed",
        &["chain"]
    ).unwrap();

    // Direct mints
    pub static ref DIRECT_MINTS: CounterVec = register_counter_vec!(
        "nftbridge_direct_mints_total",
        "Direct mints on a lock gateway",
        &["chain"]
    ).unwrap();

    // Infrastructure
    pub static ref LEDGER_ERRORS: CounterVec = register_counter_vec!(
        "nftbridge_ledger_errors_total",
        "Ledger writes dropped after retries",
        &[]
    ).unwrap();

    pub static ref NETWORK_SWITCHES: CounterVec = register_counter_vec!(
        "nftbridge_network_switches_total",
        "Wallet network switches",
        &["chain"]
    ).unwrap();

    pub static ref IN_FLIGHT: GaugeVec = register_gauge_vec!(
        "nftbridge_transfers_in_flight",
        "Bridge attempts currently in flight",
        &[]
    ).unwrap();
}

/// Metrics and health endpoint
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> crate::error::BridgeResult<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// Helper functions to record metrics

pub fn record_forward_started(source: &str, dest: &str) {
    FORWARD_STARTED.with_label_values(&[source, dest]).inc();
}

pub fn record_forward_completed(source: &str, dest: &str) {
    FORWARD_COMPLETED.with_label_values(&[source, dest]).inc();
}

pub fn record_forward_failed(source: &str, dest: &str) {
    FORWARD_FAILED.with_label_values(&[source, dest]).inc();
}

pub fn record_reversal_started(chain: &str) {
    REVERSALS_STARTED.with_label_values(&[chain]).inc();
}

pub fn record_reversal_completed(chain: &str) {
    REVERSALS_COMPLETED.with_label_values(&[chain]).inc();
}

pub fn record_reversal_failed(chain: &str) {
    REVERSALS_FAILED.with_label_values(&[chain]).inc();
}

pub fn record_reversal_stranded(chain: &str) {
    REVERSALS_STRANDED.with_label_values(&[chain]).inc();
}

pub fn record_compensation(chain: &str) {
    COMPENSATIONS.with_label_values(&[chain]).inc();
}

pub fn record_compensation_failure(chain: &str) {
    COMPENSATION_FAILURES.with_label_values(&[chain]).inc();
}

pub fn record_direct_mint(chain: &str) {
    DIRECT_MINTS.with_label_values(&[chain]).inc();
}

pub fn record_ledger_error() {
    LEDGER_ERRORS.with_label_values(&[]).inc();
}

pub fn record_network_switch(chain: &str) {
    NETWORK_SWITCHES.with_label_values(&[chain]).inc();
}

pub fn record_in_flight(count: usize) {
    IN_FLIGHT.with_label_values(&[]).set(count as f64);
}

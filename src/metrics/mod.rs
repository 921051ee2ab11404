//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connectivity and ingestion progress
//! - Event counts and dedup hits
//! - Order state population and transitions
//! - Submissions, retries and invariant breaches

use crate::error::RelayerResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "htlc_relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CONFIRMED_HEIGHT: GaugeVec = register_gauge_vec!(
        "htlc_relayer_confirmed_height",
        "Confirmed block height per chain (tip minus confirmation depth)",
        &["chain_id"]
    ).unwrap();

    pub static ref CURSOR_HEIGHT: GaugeVec = register_gauge_vec!(
        "htlc_relayer_cursor_height",
        "Highest fully-processed block per chain",
        &["chain_id"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "htlc_relayer_events_received_total",
        "Total events received by kind",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref EVENTS_DEDUPLICATED: CounterVec = register_counter_vec!(
        "htlc_relayer_events_deduplicated_total",
        "Redelivered events dropped by the dedup set",
        &["chain_id"]
    ).unwrap();

    pub static ref DECODE_FAILURES: CounterVec = register_counter_vec!(
        "htlc_relayer_decode_failures_total",
        "Event windows that failed to decode (cursor held)",
        &["chain_id"]
    ).unwrap();

    // Order metrics
    pub static ref ORDERS: GaugeVec = register_gauge_vec!(
        "htlc_relayer_orders",
        "Tracked orders by state",
        &["state"]
    ).unwrap();

    pub static ref ORDER_TRANSITIONS: CounterVec = register_counter_vec!(
        "htlc_relayer_order_transitions_total",
        "Order state transitions by destination state",
        &["to_state"]
    ).unwrap();

    pub static ref INVARIANT_BREACHES: CounterVec = register_counter_vec!(
        "htlc_relayer_invariant_breaches_total",
        "Protocol invariant violations observed",
        &["chain_id"]
    ).unwrap();

    pub static ref MATCHES_FOUND: CounterVec = register_counter_vec!(
        "htlc_relayer_matches_found_total",
        "Crossed order pairs found by the matching pass",
        &[]
    ).unwrap();

    // Submission metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "htlc_relayer_tx_submitted_total",
        "Transactions submitted by action",
        &["chain_id", "action"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "htlc_relayer_tx_failed_total",
        "Transactions that failed permanently by action",
        &["chain_id", "action"]
    ).unwrap();

    pub static ref SUBMIT_RETRIES: CounterVec = register_counter_vec!(
        "htlc_relayer_submit_retries_total",
        "Transient submission failures that were retried",
        &["chain_id"]
    ).unwrap();

    pub static ref SECRETS_PROPAGATED: CounterVec = register_counter_vec!(
        "htlc_relayer_secrets_propagated_total",
        "Claims enqueued after a secret was learned",
        &["chain_id"]
    ).unwrap();

    pub static ref RECONCILIATION_ACTIONS: CounterVec = register_counter_vec!(
        "htlc_relayer_reconciliation_actions_total",
        "Divergences repaired by the reconciliation pass",
        &["action"]
    ).unwrap();

    pub static ref BACKPRESSURE: CounterVec = register_counter_vec!(
        "htlc_relayer_backpressure_total",
        "Inserts or actions rejected due to capacity limits",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "htlc_relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "htlc_relayer_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::RelayerError::Internal(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::RelayerError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_confirmed_height(chain_id: u64, height: u64) {
    CONFIRMED_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(height as f64);
}

pub fn record_cursor(chain_id: u64, height: u64) {
    CURSOR_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(height as f64);
}

pub fn record_event(chain_id: u64, kind: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_event_deduplicated(chain_id: u64) {
    EVENTS_DEDUPLICATED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_decode_failure(chain_id: u64) {
    DECODE_FAILURES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn set_orders_gauge(state: &str, count: usize) {
    ORDERS.with_label_values(&[state]).set(count as f64);
}

pub fn record_order_transition(to_state: &str) {
    ORDER_TRANSITIONS.with_label_values(&[to_state]).inc();
}

pub fn record_invariant_breach(chain_id: u64) {
    INVARIANT_BREACHES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_match_found() {
    MATCHES_FOUND.with_label_values(&[]).inc();
}

pub fn record_tx_submitted(chain_id: u64, action: &str) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string(), action])
        .inc();
}

pub fn record_tx_failed(chain_id: u64, action: &str) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string(), action])
        .inc();
}

pub fn record_submit_retry(chain_id: u64) {
    SUBMIT_RETRIES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_secret_propagated(chain_id: u64) {
    SECRETS_PROPAGATED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_reconciliation_action(action: &str) {
    RECONCILIATION_ACTIONS.with_label_values(&[action]).inc();
}

pub fn record_backpressure(chain_id: u64) {
    BACKPRESSURE
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

//! HTTP API: health, order lookup, stats and manual fulfillment

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::resolver::{parse_order_hash, parse_secret, Resolver};
use crate::state::StateStore;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<Resolver>,
    pub chains: Arc<ChainManager>,
    pub store: Arc<dyn StateStore>,
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    resolver: Arc<Resolver>,
    chains: Arc<ChainManager>,
    store: Arc<dyn StateStore>,
) -> RelayerResult<()> {
    let state = AppState {
        resolver,
        chains,
        store,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/orders/:hash", get(get_order))
        .route("/orders/:hash/fulfill", post(submit_fulfill))
        .route("/stats", get(get_stats))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(e.to_string()))?;

    Ok(())
}

/// Basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: state store and both chains respond
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();

    let chain_health = state.chains.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if store_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: store_ok && chains_ok,
            database: store_ok,
            chains: chain_health
                .into_iter()
                .map(|(id, h)| ChainHealth {
                    chain_id: id,
                    healthy: h,
                })
                .collect(),
        }),
    )
}

/// Look up one order by hash
async fn get_order(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> impl IntoResponse {
    let order_hash = match parse_order_hash(&hash) {
        Ok(h) => h,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    };

    match state.resolver.store().get(&order_hash) {
        Some(slot) => {
            let order = slot.lock().await;
            (
                StatusCode::OK,
                Json(serde_json::to_value(OrderResponse::from(&*order)).unwrap_or_default()),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "order not found" })),
        ),
    }
}

/// Manually lock target funds with a known secret
async fn submit_fulfill(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Json(body): Json<FulfillRequest>,
) -> impl IntoResponse {
    let order_hash = match parse_order_hash(&hash) {
        Ok(h) => h,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    };
    let secret = match parse_secret(&body.secret) {
        Ok(s) => s,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    };

    match state.resolver.submit_fulfill(order_hash, secret).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted" })),
        ),
        Err(e @ RelayerError::OrderNotFound { .. }) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
        Err(e @ RelayerError::InvalidSecret { .. }) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

/// Order table statistics
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.resolver.stats().await;
    Json(StatsResponse {
        total: stats.total,
        by_state: stats
            .by_state
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        secrets_held: stats.secrets_held,
        needs_attention: stats.needs_attention,
    })
}

// Request / response types

#[derive(Deserialize)]
struct FulfillRequest {
    secret: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    total: usize,
    by_state: std::collections::HashMap<String, usize>,
    secrets_held: usize,
    needs_attention: usize,
}

#[derive(Serialize)]
struct OrderResponse {
    order_hash: String,
    source_chain: u64,
    target_chain: u64,
    state: String,
    amount_in: String,
    amount_out: String,
    hashlock: String,
    timelock: u64,
    target_timelock: Option<u64>,
    source_htlc_id: Option<String>,
    target_htlc_id: Option<String>,
    secret_known: bool,
    needs_attention: bool,
    created_at: String,
    updated_at: String,
}

impl From<&crate::resolver::CrossChainOrder> for OrderResponse {
    fn from(order: &crate::resolver::CrossChainOrder) -> Self {
        Self {
            order_hash: format!("0x{}", hex::encode(order.order_hash)),
            source_chain: order.source_chain,
            target_chain: order.target_chain,
            state: order.state.as_str().to_string(),
            amount_in: order.amount_in.to_string(),
            amount_out: order.amount_out.to_string(),
            hashlock: format!("0x{}", hex::encode(order.hashlock)),
            timelock: order.timelock,
            target_timelock: order.target_timelock,
            source_htlc_id: order
                .source_htlc
                .as_ref()
                .map(|h| format!("0x{}", hex::encode(h.htlc_id))),
            target_htlc_id: order
                .target_htlc
                .as_ref()
                .map(|h| format!("0x{}", hex::encode(h.htlc_id))),
            secret_known: order.secret.is_some(),
            needs_attention: order.needs_attention,
            created_at: order.created_at.to_rfc3339(),
            updated_at: order.updated_at.to_rfc3339(),
        }
    }
}

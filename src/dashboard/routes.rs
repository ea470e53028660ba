//! Status API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::engine::detector::DetectionEngine;
use crate::engine::fees::FeeOptimizer;
use crate::storage::SweepStore;
use crate::types::{
    normalize_id, ActivityRecord, AssetDetection, FeeStrategy, NetworkStatus, SweepAttempt,
    SweepStatus,
};

const DEFAULT_ACTIVITY_LIMIT: usize = 50;
const MAX_ACTIVITY_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub engine: Arc<DetectionEngine>,
    pub store: Arc<dyn SweepStore>,
    pub fees: Arc<FeeOptimizer>,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(
        engine: Arc<DetectionEngine>,
        store: Arc<dyn SweepStore>,
        fees: Arc<FeeOptimizer>,
    ) -> Self {
        Self {
            engine,
            store,
            fees,
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub monitored_wallets: Vec<String>,
    pub active_sweeps: usize,
    pub network: Option<NetworkStatus>,
    pub recommended_strategy: FeeStrategy,
    pub uptime_secs: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct TransactionQuery {
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityQuery {
    pub wallet: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EmergencyStopRequest {
    #[serde(default)]
    pub wallet: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyStopResponse {
    pub cleared: usize,
    pub wallet: Option<String>,
}

/// Error body: `{ "error": "..." }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn wallet_param(raw: &str) -> Result<String, ApiError> {
    normalize_id(raw).ok_or_else(|| ApiError::bad_request("wallet address is empty"))
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "running".to_string(),
        monitored_wallets: state.engine.monitored_wallets().await,
        active_sweeps: state.engine.executor().active_sweep_count(None),
        network: state.fees.network_status().await,
        recommended_strategy: state.fees.recommend_strategy().await,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// GET /api/wallets/:address/detections
pub async fn get_detections(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<AssetDetection>>, ApiError> {
    let wallet = wallet_param(&address)?;
    let detections = state
        .store
        .list_detections(&wallet)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(detections))
}

/// GET /api/wallets/:address/transactions?status=
pub async fn get_transactions(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<TransactionQuery>,
) -> Result<Json<Vec<SweepAttempt>>, ApiError> {
    let wallet = wallet_param(&address)?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<SweepStatus>)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let txs = state
        .store
        .list_transactions(&wallet, status)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(txs))
}

/// GET /api/activity?wallet=&limit=
pub async fn get_activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<ActivityRecord>>, ApiError> {
    let wallet = query.wallet.as_deref().and_then(normalize_id);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .min(MAX_ACTIVITY_LIMIT);
    let records = state
        .store
        .list_activity(wallet.as_deref(), limit)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(records))
}

/// POST /api/emergency-stop
pub async fn emergency_stop(
    State(state): State<AppState>,
    Json(request): Json<EmergencyStopRequest>,
) -> Json<EmergencyStopResponse> {
    let wallet = request.wallet.as_deref().and_then(normalize_id);
    let cleared = state.engine.executor().emergency_stop(wallet.as_deref());
    Json(EmergencyStopResponse { cleared, wallet })
}

use axum::{extract::State, response::Json};
use serde::Serialize;
use serde_json::json;

use crate::database::connection::ConnectionStats;
use crate::server::AppState;

/// Liveness probe.
///
/// # Route
/// - **Method**: GET
/// - **Path**: `/ping`
/// - **Response**: `{"status":"pong"}`
pub async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "status": "pong" }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: bool,
    pub pool: ConnectionStats,
    pub active_boosters: usize,
    pub live_puppets: usize,
    pub sol_usd: f64,
}

/// Readiness probe: database reachability plus runtime counters.
///
/// Always answers 200 so dashboards can read the counters; `status` is
/// `"degraded"` when the database check fails.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match state.db.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Database health check failed: {:#}", e);
            false
        }
    };
    Json(HealthResponse {
        status: if database { "ok" } else { "degraded" },
        database,
        pool: state.db.stats(),
        active_boosters: state.runtime.boosters.len(),
        live_puppets: state.runtime.puppets.len(),
        sol_usd: state.runtime.prices.sol_usd(),
    })
}

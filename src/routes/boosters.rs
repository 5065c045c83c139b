//! # Booster Routes
//!
//! Start, inspect and stop boosters.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::booster::{BoosterKind, BoosterView, Settings};
use crate::routes::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Request body for starting a booster
#[derive(Debug, Deserialize)]
pub struct StartBoosterRequest {
    pub owner_id: String,
    /// Target token mint (base58)
    pub token: String,
    pub kind: BoosterKind,
    /// Replaces the owner's stored settings when present
    pub settings: Option<Settings>,
}

/// Lookup of a live booster by its key
#[derive(Debug, Deserialize)]
pub struct BoosterLookupQuery {
    pub owner: String,
    pub token: String,
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct StopBoosterRequest {
    pub owner_id: String,
}

pub(crate) fn parse_token(raw: &str) -> Result<Pubkey, ApiError> {
    Pubkey::from_str(raw.trim()).map_err(|e| ApiError::BadRequest(format!("Invalid token address: {}", e)))
}

/// POST /api/v1/boosters
pub async fn start_booster(
    State(state): State<AppState>,
    Json(request): Json<StartBoosterRequest>,
) -> Result<(StatusCode, Json<BoosterView>), ApiError> {
    let token = parse_token(&request.token)?;
    let booster = state
        .runtime
        .start_booster(&request.owner_id, request.kind, token, request.settings)
        .await?;
    Ok((StatusCode::CREATED, Json(booster.view(state.runtime.prices.sol_usd()))))
}

/// GET /api/v1/boosters/{id}
pub async fn get_booster(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<BoosterView> {
    let booster = state
        .runtime
        .booster(&id)
        .ok_or_else(|| ApiError::NotFound(format!("No active booster {}", id)))?;
    Ok(Json(booster.view(state.runtime.prices.sol_usd())))
}

/// GET /api/v1/boosters?owner=&token=&kind=
pub async fn find_booster(
    State(state): State<AppState>,
    Query(query): Query<BoosterLookupQuery>,
) -> ApiResult<BoosterView> {
    let token = parse_token(&query.token)?;
    let kind = BoosterKind::from_str(&query.kind).map_err(ApiError::BadRequest)?;
    let booster = state
        .runtime
        .find_booster(&query.owner, &token, kind)
        .ok_or_else(|| ApiError::NotFound(format!("No active {} booster on {}", kind, token)))?;
    Ok(Json(booster.view(state.runtime.prices.sol_usd())))
}

/// POST /api/v1/boosters/{id}/stop
pub async fn stop_booster(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<StopBoosterRequest>,
) -> ApiResult<BoosterView> {
    let booster = state
        .runtime
        .booster(&id)
        .ok_or_else(|| ApiError::NotFound(format!("No active booster {}", id)))?;
    if booster.owner_id != request.owner_id {
        return Err(ApiError::Forbidden("This booster belongs to another account".to_string()));
    }
    state.runtime.request_stop(&id);
    info!("🛑 {} asked booster {} to stop", request.owner_id, id);
    Ok(Json(booster.view(state.runtime.prices.sol_usd())))
}

pub fn create_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/boosters", post(start_booster).get(find_booster))
        .route("/api/v1/boosters/{id}", get(get_booster))
        .route("/api/v1/boosters/{id}/stop", post(stop_booster))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_rejects_garbage() {
        let mint = Pubkey::new_unique();
        assert_eq!(parse_token(&format!(" {} ", mint)).unwrap(), mint);
        assert!(matches!(parse_token("not-a-mint"), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_start_request_accepts_partial_settings() {
        let body = r#"{"owner_id":"7","token":"So11111111111111111111111111111111111111112","kind":"rank","settings":{"rank_parallel_wallets":3}}"#;
        let request: StartBoosterRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.kind, BoosterKind::Rank);
        let settings = request.settings.unwrap();
        assert_eq!(settings.rank_parallel_wallets, 3);
        assert_eq!(settings.volume_speed, Settings::default().volume_speed);
    }
}

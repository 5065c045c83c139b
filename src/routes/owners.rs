//! # Owner Routes
//!
//! Work wallets and their withdrawals, usage windows, settings, the active
//! booster and the notification outbox of a bot user.

use axum::{
    Router,
    extract::{Path, State},
    response::Json,
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::{native_token::lamports_to_sol, pubkey::Pubkey};

use crate::booster::runtime::Withdrawal;
use crate::booster::{BoosterView, Settings};
use crate::database::models::OwnerAccount;
use crate::routes::error::{ApiError, ApiResult};
use crate::server::AppState;
use crate::services::notifier::Notification;

/// Longest single usage extension
const MAX_EXTENSION_DAYS: u32 = 365;

#[derive(Debug, Serialize)]
pub struct OwnerResponse {
    pub owner_id: String,
    /// Work-wallet address to deposit SOL into
    pub wallet: String,
    pub withdraw_address: Option<String>,
    pub usage_expires_at: DateTime<Utc>,
    pub usage_expired: bool,
}

impl From<OwnerAccount> for OwnerResponse {
    fn from(owner: OwnerAccount) -> Self {
        Self {
            usage_expired: owner.usage_expired(Utc::now()),
            owner_id: owner.owner_id,
            wallet: owner.wallet_pubkey,
            withdraw_address: owner.withdraw_address,
            usage_expires_at: owner.usage_expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub lamports: u64,
    pub sol: f64,
    pub usd: f64,
}

#[derive(Debug, Deserialize)]
pub struct ExtendUsageRequest {
    pub days: u32,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawAddressRequest {
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct ExtendUsageResponse {
    pub owner_id: String,
    pub usage_expires_at: DateTime<Utc>,
}

async fn load_owner(state: &AppState, owner_id: &str) -> Result<OwnerAccount, ApiError> {
    state
        .runtime
        .store
        .get_owner(owner_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Unknown account {}", owner_id)))
}

/// POST /api/v1/owners/{owner}
pub async fn open_owner(State(state): State<AppState>, Path(owner_id): Path<String>) -> ApiResult<OwnerResponse> {
    let owner = state.runtime.get_or_create_owner(&owner_id).await?;
    Ok(Json(owner.into()))
}

/// GET /api/v1/owners/{owner}/balance
pub async fn get_balance(State(state): State<AppState>, Path(owner_id): Path<String>) -> ApiResult<BalanceResponse> {
    let owner = load_owner(&state, &owner_id).await?;
    let lamports = state.runtime.owner_total_balance(&owner).await?;
    let sol = lamports_to_sol(lamports);
    Ok(Json(BalanceResponse {
        lamports,
        sol,
        usd: sol * state.runtime.prices.sol_usd(),
    }))
}

/// GET /api/v1/owners/{owner}/settings
pub async fn get_settings(State(state): State<AppState>, Path(owner_id): Path<String>) -> ApiResult<Settings> {
    load_owner(&state, &owner_id).await?;
    Ok(Json(state.runtime.store.get_settings(&owner_id).await?))
}

/// PUT /api/v1/owners/{owner}/settings
///
/// Takes effect for running boosters at their next settings refresh.
pub async fn put_settings(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    Json(settings): Json<Settings>,
) -> ApiResult<Settings> {
    load_owner(&state, &owner_id).await?;
    let settings = settings.sanitized();
    state.runtime.store.save_settings(&owner_id, &settings).await?;
    Ok(Json(settings))
}

/// GET /api/v1/owners/{owner}/active
pub async fn get_active(State(state): State<AppState>, Path(owner_id): Path<String>) -> ApiResult<Option<BoosterView>> {
    let sol_usd = state.runtime.prices.sol_usd();
    Ok(Json(state.runtime.any_active_for(&owner_id).map(|b| b.view(sol_usd))))
}

/// GET /api/v1/owners/{owner}/notifications
pub async fn drain_notifications(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> ApiResult<Vec<Notification>> {
    Ok(Json(state.outbox.drain(&owner_id)))
}

/// POST /api/v1/owners/{owner}/usage
pub async fn extend_usage(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    Json(request): Json<ExtendUsageRequest>,
) -> ApiResult<ExtendUsageResponse> {
    if request.days == 0 || request.days > MAX_EXTENSION_DAYS {
        return Err(ApiError::BadRequest(format!(
            "days must be between 1 and {}",
            MAX_EXTENSION_DAYS
        )));
    }
    let until = state
        .runtime
        .extend_usage(&owner_id, chrono::Duration::days(request.days as i64))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Unknown account {}", owner_id)))?;
    Ok(Json(ExtendUsageResponse { owner_id, usage_expires_at: until }))
}

/// PUT /api/v1/owners/{owner}/withdraw-address
pub async fn set_withdraw_address(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    Json(request): Json<WithdrawAddressRequest>,
) -> ApiResult<OwnerResponse> {
    let address: Pubkey = request
        .address
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid address supplied: {}", request.address)))?;
    if !state.runtime.set_withdraw_address(&owner_id, &address).await? {
        return Err(ApiError::NotFound(format!("Unknown account {}", owner_id)));
    }
    Ok(Json(load_owner(&state, &owner_id).await?.into()))
}

/// POST /api/v1/owners/{owner}/withdraw
pub async fn withdraw(State(state): State<AppState>, Path(owner_id): Path<String>) -> ApiResult<Withdrawal> {
    Ok(Json(state.runtime.withdraw(&owner_id).await?))
}

pub fn create_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/owners/{owner}", post(open_owner))
        .route("/api/v1/owners/{owner}/balance", get(get_balance))
        .route("/api/v1/owners/{owner}/settings", get(get_settings).put(put_settings))
        .route("/api/v1/owners/{owner}/active", get(get_active))
        .route("/api/v1/owners/{owner}/notifications", get(drain_notifications))
        .route("/api/v1/owners/{owner}/usage", post(extend_usage))
        .route("/api/v1/owners/{owner}/withdraw-address", put(set_withdraw_address))
        .route("/api/v1/owners/{owner}/withdraw", post(withdraw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_response_hides_the_secret() {
        let owner = OwnerAccount::generate("7");
        let secret = owner.wallet_secret.clone();
        let body = serde_json::to_string(&OwnerResponse::from(owner)).unwrap();
        assert!(!body.contains(&secret));
        assert!(body.contains("\"usage_expired\":true"));
    }
}

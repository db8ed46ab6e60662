//! Refresh token routes: rotate, log out, log out everywhere.
//!
//! First login is handled elsewhere; these endpoints only ever see tokens that
//! an earlier `issue_token` call produced.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use serde::{Deserialize, Serialize};

use crate::{adapters::http::app_state::AppState, app_error::AppResult};

#[derive(Deserialize)]
struct RefreshTokenPayload {
    refresh_token: String,
}

#[derive(Serialize)]
struct RefreshResponse {
    refresh_token: String,
    token_type: &'static str,
    expires_in: i64,
    subject: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/logout-all", post(logout_all))
}

/// POST /api/auth/refresh
/// Consumes the presented refresh token and returns its successor
async fn refresh(
    State(app_state): State<AppState>,
    Json(payload): Json<RefreshTokenPayload>,
) -> AppResult<impl IntoResponse> {
    let rotated = app_state
        .refresh_token_use_cases
        .rotate(&payload.refresh_token)
        .await?;

    let expires_in = app_state
        .refresh_token_use_cases
        .policy()
        .lifetime
        .num_seconds();

    Ok(Json(RefreshResponse {
        refresh_token: rotated.issued.token,
        token_type: "Refresh",
        expires_in,
        subject: rotated.subject,
    }))
}

/// POST /api/auth/logout
/// Revokes the presented token's family (this session only)
async fn logout(
    State(app_state): State<AppState>,
    Json(payload): Json<RefreshTokenPayload>,
) -> AppResult<impl IntoResponse> {
    app_state
        .refresh_token_use_cases
        .logout(&payload.refresh_token)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/auth/logout-all
/// Revokes every refresh token held by the presented token's subject
async fn logout_all(
    State(app_state): State<AppState>,
    Json(payload): Json<RefreshTokenPayload>,
) -> AppResult<impl IntoResponse> {
    app_state
        .refresh_token_use_cases
        .logout_everywhere(&payload.refresh_token)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use serde::Serialize;

use super::bearer_credential;
use crate::admission::TokenStats;
use crate::device::TokenDeviceStats;
use crate::error::Error;
use crate::gateway_util::AppStateData;
use crate::usage::UsageStats;

#[derive(Debug, Serialize)]
pub struct TokenUsage {
    pub token: String,
    #[serde(flatten)]
    pub usage: UsageStats,
}

/// The caller's own usage
pub async fn usage_handler(
    State(app_state): State<AppStateData>,
    headers: HeaderMap,
) -> Result<Json<UsageStats>, Error> {
    let credential = bearer_credential(&headers)?;
    Ok(Json(app_state.engine.usage_stats(credential).await?))
}

pub async fn token_stats_handler(
    State(app_state): State<AppStateData>,
) -> Result<Json<Vec<TokenStats>>, Error> {
    Ok(Json(app_state.engine.token_stats().await?))
}

pub async fn usage_stats_handler(
    State(app_state): State<AppStateData>,
) -> Result<Json<Vec<TokenUsage>>, Error> {
    let stats = app_state
        .engine
        .all_usage_stats()
        .await?
        .into_iter()
        .map(|(token, usage)| TokenUsage { token, usage })
        .collect();
    Ok(Json(stats))
}

pub async fn device_stats_handler(
    State(app_state): State<AppStateData>,
) -> Result<Json<Vec<TokenDeviceStats>>, Error> {
    Ok(Json(app_state.engine.all_device_stats().await?))
}

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{bearer_credential, header_str};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogoutRequest {
    #[serde(default)]
    user_agent: Option<String>,
}

pub async fn list_devices_handler(
    State(app_state): State<AppStateData>,
    headers: HeaderMap,
) -> Result<Json<Value>, Error> {
    let credential = bearer_credential(&headers)?;
    let devices = app_state.engine.list_devices(credential).await?;
    Ok(Json(json!({
        "total": devices.len(),
        "devices": devices,
    })))
}

/// Logs out the device named in the body, or the calling device when the body names none
pub async fn logout_device_handler(
    State(app_state): State<AppStateData>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    let credential = bearer_credential(&headers)?;
    let request: LogoutRequest = if body.iter().all(u8::is_ascii_whitespace) {
        LogoutRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            Error::new(ErrorDetails::InvalidRequest {
                message: format!("Invalid request body: {e}"),
            })
        })?
    };

    let user_agent = request
        .user_agent
        .as_deref()
        .filter(|ua| !ua.is_empty())
        .or_else(|| header_str(&headers, "user-agent"))
        .ok_or_else(|| {
            Error::new(ErrorDetails::InvalidRequest {
                message: "User-Agent is required".to_string(),
            })
        })?;

    app_state
        .engine
        .logout_device(credential, user_agent)
        .await?;
    info!("Logged out a device");
    Ok(Json(json!({ "message": "Device logged out successfully" })))
}

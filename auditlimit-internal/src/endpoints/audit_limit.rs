use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{bearer_credential, header_str};
use crate::admission::{AdmissionDecision, AdmissionRequest};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;
use crate::usage::UsageWindow;

const FORWARDED_HOST: &str = "x-forwarded-host";

/// The parts of a chat request body that admission looks at
#[derive(Debug, Default, Deserialize)]
struct ChatRequestBody {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<ChatMessageContent>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatMessageContent {
    #[serde(default)]
    parts: Vec<Value>,
}

impl ChatRequestBody {
    fn parse(body: &[u8]) -> Result<Self, Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| {
            Error::new(ErrorDetails::InvalidRequest {
                message: format!("Invalid request body: {e}"),
            })
        })
    }

    /// First part of the first message, when it is text
    fn prompt(&self) -> Option<&str> {
        self.messages
            .first()?
            .content
            .as_ref()?
            .parts
            .first()?
            .as_str()
    }
}

fn deny(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn decision_response(decision: AdmissionDecision) -> Response {
    match decision {
        AdmissionDecision::Admitted => StatusCode::OK.into_response(),
        AdmissionDecision::DeviceCapacityExceeded { max } => deny(
            StatusCode::FORBIDDEN,
            format!(
                "Maximum number of devices ({max}) reached. Please logout from another device first."
            ),
        ),
        AdmissionDecision::ForbiddenContent { .. } => deny(
            StatusCode::BAD_REQUEST,
            "Forbidden content detected".to_string(),
        ),
        AdmissionDecision::ModerationBlocked => deny(
            StatusCode::BAD_REQUEST,
            "Content flagged by moderation".to_string(),
        ),
        AdmissionDecision::QuotaExceeded {
            limit,
            wait_seconds,
        } => {
            let mut response = deny(
                StatusCode::TOO_MANY_REQUESTS,
                format!(
                    "Usage limit reached: {limit} requests per {}, please wait {wait_seconds} seconds",
                    UsageWindow::PRIMARY.as_str()
                ),
            );
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, wait_seconds.into());
            response
        }
        AdmissionDecision::UsageUnverified => deny(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to check usage limits".to_string(),
        ),
    }
}

/// A handler for the admission check placed in front of the chat API
pub async fn audit_limit_handler(
    State(app_state): State<AppStateData>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    let credential = bearer_credential(&headers)?;
    let host = header_str(&headers, FORWARDED_HOST).or_else(|| header_str(&headers, "host"));
    let user_agent = header_str(&headers, "user-agent");
    let (Some(host), Some(user_agent)) = (host, user_agent) else {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "Host and User-Agent are required".to_string(),
        }));
    };

    let body = ChatRequestBody::parse(&body)?;
    debug!(
        "Audit request: action={:?} model={:?}",
        body.action, body.model
    );

    let decision = app_state
        .engine
        .admit(AdmissionRequest {
            credential,
            device_identity: user_agent,
            host,
            content: body.prompt(),
            model: body.model.as_deref(),
        })
        .await;
    Ok(decision_response(decision))
}

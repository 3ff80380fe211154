use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use tokio::sync::OnceCell;

/// Controls whether error bodies returned to clients include the full internal message
///
/// When false, store and internal failures are reported to clients with a generic message and
/// the detailed message only goes to the logs.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    /// Whether the failure came from the shared store (and so a retry of the whole decision may succeed)
    pub fn is_store_failure(&self) -> bool {
        matches!(
            *self.0,
            ErrorDetails::StoreUnavailable { .. }
                | ErrorDetails::StoreTimeout { .. }
                | ErrorDetails::StoreResponse { .. }
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    Config {
        message: String,
    },
    InternalError {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    MissingCredential,
    Moderation {
        message: String,
    },
    StoreResponse {
        operation: String,
        message: String,
    },
    StoreTimeout {
        operation: String,
        timeout_ms: u64,
    },
    StoreUnavailable {
        operation: String,
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::MissingCredential => tracing::Level::WARN,
            ErrorDetails::Moderation { .. } => tracing::Level::WARN,
            ErrorDetails::StoreResponse { .. } => tracing::Level::ERROR,
            ErrorDetails::StoreTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::StoreUnavailable { .. } => tracing::Level::ERROR,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::MissingCredential => StatusCode::UNAUTHORIZED,
            ErrorDetails::Moderation { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::StoreResponse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreTimeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the message is safe to return to a client outside of debug mode
    fn is_client_facing(&self) -> bool {
        matches!(
            self,
            ErrorDetails::InvalidRequest { .. } | ErrorDetails::MissingCredential
        )
    }

    /// Log the error using the `tracing` library
    fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InternalError { message } => write!(f, "Internal error: {message}"),
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::MissingCredential => {
                write!(f, "Missing bearer token in `Authorization` header")
            }
            ErrorDetails::Moderation { message } => {
                write!(f, "Moderation request failed: {message}")
            }
            ErrorDetails::StoreResponse { operation, message } => {
                write!(f, "Unexpected store response for `{operation}`: {message}")
            }
            ErrorDetails::StoreTimeout {
                operation,
                timeout_ms,
            } => write!(f, "Store operation `{operation}` timed out after {timeout_ms}ms"),
            ErrorDetails::StoreUnavailable { operation, message } => {
                write!(f, "Store operation `{operation}` failed: {message}")
            }
        }
    }
}

impl Error {
    /// Get the JSON response body that would be sent to clients
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        let message = if self.0.is_client_facing() || *DEBUG.get().unwrap_or(&false) {
            self.to_string()
        } else {
            "Internal server error".to_string()
        };
        (self.status_code(), json!({ "error": message }))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        (status_code, Json(body)).into_response()
    }
}

use axum::http::{header, HeaderMap};

use crate::error::{Error, ErrorDetails};

pub mod audit_limit;
pub mod devices;
pub mod stats;
pub mod status;

/// The token from `Authorization: Bearer <token>`
pub fn bearer_credential(headers: &HeaderMap) -> Result<&str, Error> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| Error::new(ErrorDetails::MissingCredential))
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

//! Request handlers

pub mod health;
pub mod info;
pub mod proxy;
pub mod ws;

use axum::http::Uri;
use axum::response::{IntoResponse, Response};
use url::form_urlencoded;

use crate::error::BareError;

/// Raw value of the `url` query parameter
pub fn target_param(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.trim().is_empty())
}

/// Fallback for unknown paths
pub async fn not_found(uri: Uri) -> Response {
    BareError::NotFound(uri.path().to_string()).into_response()
}

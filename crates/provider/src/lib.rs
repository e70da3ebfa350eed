//! Upstream request/response shaping for the single upstream HTTP service.
//!
//! This crate knows nothing about the account pool; it only knows how to
//! shape an outgoing request for a chosen account (`inject_account_headers`)
//! and how to classify an upstream response into one of the signal kinds the
//! balancer's event mutators understand (`classify_status`). The pool and
//! gateway crates drive the account-state transitions from these signals.

pub mod classify;
pub mod stream;
pub mod usage;

pub use classify::{UpstreamSignal, classify_status};
pub use usage::{
    CreditsSnapshot, UsageFetchOutcome, UsageSnapshotPair, WindowSnapshot, fetch_usage, parse_usage_at,
};

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;
use thiserror::Error;

/// Errors from provider-level request shaping.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid header name: {0}")]
    InvalidHeaderName(String),
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(String),
    #[error("usage fetch failed: {0}")]
    UsageFetch(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Header an upstream response body can carry identifying the account a
/// request was made on behalf of. Matches spec §6's consumed-upstream
/// contract: `Authorization: Bearer <access_token>` and
/// `chatgpt-account-id: <raw_account_id>`.
pub const ACCOUNT_ID_HEADER: &str = "chatgpt-account-id";

/// Inject the bearer token and account-id headers for a chosen account,
/// never overwriting a caller-supplied Authorization header.
pub fn inject_account_headers(
    headers: &mut HeaderMap,
    access_token: &str,
    chatgpt_account_id: Option<&str>,
) -> Result<()> {
    let auth_value = HeaderValue::from_str(&format!("Bearer {access_token}"))
        .map_err(|e| Error::InvalidHeaderValue(e.to_string()))?;
    headers.insert(AUTHORIZATION, auth_value);

    if let Some(account_id) = chatgpt_account_id {
        let name = HeaderName::from_str(ACCOUNT_ID_HEADER)
            .map_err(|e| Error::InvalidHeaderName(e.to_string()))?;
        let value = HeaderValue::from_str(account_id)
            .map_err(|e| Error::InvalidHeaderValue(e.to_string()))?;
        headers.insert(name, value);
    }
    Ok(())
}

/// Static, operator-configured header injections applied to every request
/// regardless of which account was selected (e.g. a required beta flag).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

pub fn inject_static_headers(headers: &mut HeaderMap, injections: &[HeaderInjection]) {
    for injection in injections {
        let Ok(name) = HeaderName::from_str(&injection.name) else {
            tracing::warn!(header = %injection.name, "skipping invalid header name");
            continue;
        };
        if name == AUTHORIZATION {
            tracing::warn!(header = %injection.name, "refusing to overwrite authorization header");
            continue;
        }
        let Ok(value) = HeaderValue::from_str(&injection.value) else {
            tracing::warn!(header = %injection.name, "skipping invalid header value");
            continue;
        };
        headers.insert(name, value);
    }
}

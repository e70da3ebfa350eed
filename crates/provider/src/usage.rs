//! Fetch and parse the upstream usage endpoint (spec §4.4, §6).
//!
//! `GET <base>/…/usage` returns `{plan_type, rate_limit:{primary_window,
//! secondary_window}, credits?}`; each window exposes `used_percent` and
//! either an absolute `reset_at` or a relative `reset_after_seconds`,
//! alongside `limit_window_seconds`. A `503` is retried once after a short
//! delay before being treated like any other transient failure.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct RawUsageResponse {
    #[serde(default)]
    plan_type: Option<String>,
    rate_limit: RawRateLimit,
    #[serde(default)]
    credits: Option<RawCredits>,
}

#[derive(Debug, Deserialize)]
struct RawCredits {
    #[serde(default)]
    unlimited: bool,
    #[serde(default)]
    balance: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawRateLimit {
    primary_window: Option<RawWindow>,
    secondary_window: Option<RawWindow>,
}

#[derive(Debug, Deserialize)]
struct RawWindow {
    used_percent: f64,
    #[serde(default)]
    reset_at: Option<i64>,
    #[serde(default)]
    reset_after_seconds: Option<i64>,
    #[serde(default)]
    limit_window_seconds: Option<i64>,
}

/// One window's derived snapshot, ready to hand to the store as a usage row
/// (spec §4.4: "derive, for each of primary and secondary, (used_percent,
/// reset_at, window_minutes)").
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub used_percent: f64,
    pub reset_at: Option<i64>,
    pub window_minutes: Option<i64>,
}

/// Both windows plus the plan type and credit balance the upstream reported
/// for this account. `credits` is `None` when the response omitted the field
/// entirely (not every plan tier carries a credit balance).
#[derive(Debug, Clone)]
pub struct UsageSnapshotPair {
    pub plan_type: Option<String>,
    pub primary: Option<WindowSnapshot>,
    pub secondary: Option<WindowSnapshot>,
    pub credits: Option<CreditsSnapshot>,
}

#[derive(Debug, Clone)]
pub struct CreditsSnapshot {
    pub unlimited: bool,
    pub balance: Option<f64>,
}

/// Outcome of a usage fetch attempt, distinguishing the taxonomy the Usage
/// Refresher acts on (spec §4.4, §7).
#[derive(Debug)]
pub enum UsageFetchOutcome {
    Success(UsageSnapshotPair),
    Unauthorized,
    Deactivate { status: u16, message: String },
    Transient,
}

/// `GET` the usage endpoint with a decrypted access token. One retry on a
/// bare `503` (spec §4 supplement: treat as the single expected transient
/// blip rather than immediately swallowing). `now` resolves any relative
/// `reset_after_seconds` the upstream reports into an absolute timestamp.
pub async fn fetch_usage(
    client: &reqwest::Client,
    usage_url: &str,
    access_token: &str,
    chatgpt_account_id: Option<&str>,
    now: i64,
) -> Result<UsageFetchOutcome> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut req = client.get(usage_url).bearer_auth(access_token);
        if let Some(account_id) = chatgpt_account_id {
            req = req.header(crate::ACCOUNT_ID_HEADER, account_id);
        }

        let response = req
            .send()
            .await
            .map_err(|e| Error::UsageFetch(format!("usage request failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::SERVICE_UNAVAILABLE && attempt == 1 {
            tokio::time::sleep(Duration::from_millis(250)).await;
            continue;
        }

        return Ok(match status {
            StatusCode::OK => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| Error::UsageFetch(format!("invalid usage response: {e}")))?;
                UsageFetchOutcome::Success(parse_usage_at(&body, now)?)
            }
            StatusCode::UNAUTHORIZED => UsageFetchOutcome::Unauthorized,
            StatusCode::PAYMENT_REQUIRED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                let message = response.text().await.unwrap_or_default();
                UsageFetchOutcome::Deactivate {
                    status: status.as_u16(),
                    message,
                }
            }
            _ => UsageFetchOutcome::Transient,
        });
    }
}

/// Parse a usage response body, resolving any relative `reset_after_seconds`
/// into an absolute timestamp using the given clock reading.
pub fn parse_usage_at(raw_body: &str, now: i64) -> Result<UsageSnapshotPair> {
    let raw: RawUsageResponse = serde_json::from_str(raw_body)
        .map_err(|e| Error::UsageFetch(format!("invalid usage response: {e}")))?;
    Ok(UsageSnapshotPair {
        plan_type: raw.plan_type,
        primary: raw.rate_limit.primary_window.map(|w| derive_window_at(w, now)),
        secondary: raw.rate_limit.secondary_window.map(|w| derive_window_at(w, now)),
        credits: raw.credits.map(|c| CreditsSnapshot {
            unlimited: c.unlimited,
            balance: c.balance,
        }),
    })
}

fn derive_window_at(raw: RawWindow, now: i64) -> WindowSnapshot {
    let reset_at = raw
        .reset_at
        .or_else(|| raw.reset_after_seconds.map(|s| now + s));
    WindowSnapshot {
        used_percent: raw.used_percent,
        reset_at,
        window_minutes: raw.limit_window_seconds.map(|s| s / 60),
    }
}

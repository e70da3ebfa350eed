//! Durable data model for the Account Store (spec §3).

use serde::{Deserialize, Serialize};

/// Status an account durably occupies. `Active` and `Paused` carry no
/// `reset_at`; `RateLimited` and `QuotaExceeded` always do; `Deactivated` is
/// sticky until an operator re-authenticates the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Paused,
    RateLimited,
    QuotaExceeded,
    Deactivated,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Paused => "PAUSED",
            AccountStatus::RateLimited => "RATE_LIMITED",
            AccountStatus::QuotaExceeded => "QUOTA_EXCEEDED",
            AccountStatus::Deactivated => "DEACTIVATED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(AccountStatus::Active),
            "PAUSED" => Some(AccountStatus::Paused),
            "RATE_LIMITED" => Some(AccountStatus::RateLimited),
            "QUOTA_EXCEEDED" => Some(AccountStatus::QuotaExceeded),
            "DEACTIVATED" => Some(AccountStatus::Deactivated),
            _ => None,
        }
    }
}

/// Rate-limit window kind. `Primary` is the short window (minutes);
/// `Secondary` is the long weekly-ish window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Primary,
    Secondary,
}

impl Window {
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Primary => "primary",
            Window::Secondary => "secondary",
        }
    }
}

/// Durable record for a single upstream credential (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub chatgpt_account_id: Option<String>,
    pub email: String,
    pub plan_type: String,
    pub access_token_encrypted: Vec<u8>,
    pub refresh_token_encrypted: Vec<u8>,
    pub id_token_encrypted: Vec<u8>,
    pub last_refresh: i64,
    pub status: AccountStatus,
    pub deactivation_reason: Option<String>,
    pub reset_at: Option<i64>,
}

/// One append-only row per account per window (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub account_id: String,
    pub window: Window,
    pub used_percent: f64,
    pub reset_at: Option<i64>,
    pub window_minutes: Option<i64>,
    pub credits_has: Option<bool>,
    pub credits_unlimited: Option<bool>,
    pub credits_balance: Option<f64>,
    pub recorded_at: i64,
}

/// The `dashboard_settings` singleton (spec §6): pinned account ids and the
/// prefer-earlier-reset intra-tier tie-break flag.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DashboardSettings {
    pub pinned_account_ids: Vec<String>,
    pub prefer_earlier_reset: bool,
}

//! The derived, in-memory state the balancer reasons about (spec §3, §4.5).
//!
//! `AccountState` is assembled by the facade from an `Account`, its latest
//! primary/secondary usage snapshots, and the account's `RuntimeState`. The
//! pure functions in `eligibility`, `selection`, and `mutators` only ever see
//! this shape — never the store, never a clock.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use store::AccountStatus;

/// Runtime-only bookkeeping that never touches durable storage except
/// through the facade's reconciliation step (spec §4.6 step 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeState {
    pub reset_at: Option<f64>,
    pub last_error_at: Option<f64>,
    pub last_selected_at: Option<f64>,
    pub error_count: u32,
    pub cooldown_until: Option<f64>,
}

/// One account's full picture at selection time (spec §4.5, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub id: String,
    pub email: String,
    pub plan_type: String,
    pub status: AccountStatus,
    pub deactivation_reason: Option<String>,

    pub reset_at: Option<f64>,
    pub primary_used_percent: f64,
    pub secondary_used_percent: Option<f64>,
    pub secondary_reset_at: Option<f64>,
    pub secondary_capacity_credits: f64,

    pub last_selected_at: Option<f64>,
    pub last_error_at: Option<f64>,
    pub error_count: u32,
    pub cooldown_until: Option<f64>,
}

/// Dictionary-shaped upstream error (spec §6): whatever the upstream told us
/// about a rate limit, usage limit, or quota exhaustion.
#[derive(Debug, Clone, Default)]
pub struct UpstreamError {
    pub message: Option<String>,
    pub resets_at: Option<f64>,
    pub resets_in_seconds: Option<f64>,
}

impl UpstreamError {
    /// Absolute reset boundary, preferring the explicit timestamp over the
    /// relative one (spec §4.4: "absolute `resets_at` if present, else
    /// `now + resets_in_seconds`").
    pub fn reset_boundary(&self, now: f64) -> Option<f64> {
        self.resets_at
            .or_else(|| self.resets_in_seconds.map(|s| now + s))
    }
}

/// The closed set of refusal reasons (spec §4.5.2). Order is the priority
/// order used when more than one condition would apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    PausedOrAuth,
    Paused,
    Auth,
    RateLimited,
    QuotaExceeded,
    Cooldown,
    NoAvailable,
}

impl RefusalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RefusalReason::PausedOrAuth => "paused_or_auth",
            RefusalReason::Paused => "paused",
            RefusalReason::Auth => "auth",
            RefusalReason::RateLimited => "rate_limited",
            RefusalReason::QuotaExceeded => "quota_exceeded",
            RefusalReason::Cooldown => "cooldown",
            RefusalReason::NoAvailable => "no_available",
        }
    }
}

/// Per-tier aggregate produced during scoring (spec §4.5.3), surfaced in the
/// selection trace for observability.
#[derive(Debug, Clone, Serialize)]
pub struct TierScore {
    pub tier: String,
    pub urgency: f64,
    pub remaining_credits: f64,
    pub reset_at: Option<f64>,
    pub account_count: usize,
    pub score: f64,
}

/// Debug trail for one selection attempt. Not part of the core contract
/// (spec §6); consumed by the admin status endpoint.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SelectionTrace {
    pub tier_scores: Vec<TierScore>,
    pub chosen_tier: Option<String>,
    pub fallback_used: bool,
    pub ineligible: Vec<(String, String)>,
}

/// Outcome of a selection attempt (spec §4.5.2, §6).
#[derive(Debug, Clone, Default)]
pub struct SelectionResult {
    pub account: Option<AccountState>,
    pub reason: Option<RefusalReason>,
    pub message: Option<String>,
    pub trace: Option<SelectionTrace>,
}

/// Tier weights used to scale urgency into a score (spec §4.5.3).
#[derive(Debug, Clone)]
pub struct TierWeights {
    pub pro: f64,
    pub plus: f64,
    pub free: f64,
}

impl Default for TierWeights {
    fn default() -> Self {
        Self {
            pro: 1.00,
            plus: 0.95,
            free: 0.90,
        }
    }
}

/// Normalise a raw `plan_type` string into one of the three known tiers
/// (spec §4.5.3). Unknown tiers default to `plus`.
pub fn normalize_tier(plan_type: &str) -> &'static str {
    match plan_type {
        "pro" => "pro",
        "plus" | "team" | "business" => "plus",
        "free" => "free",
        _ => "plus",
    }
}

pub fn tier_weight(tier: &str, weights: &TierWeights) -> f64 {
    match tier {
        "pro" => weights.pro,
        "plus" => weights.plus,
        "free" => weights.free,
        _ => 1.0,
    }
}

/// Per-tier credit capacity (spec §5 open question: configurable, defaults
/// pro=1000, plus=400, free=50).
pub fn default_tier_capacities() -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("pro".to_string(), 1000.0);
    m.insert("plus".to_string(), 400.0);
    m.insert("free".to_string(), 50.0);
    m
}

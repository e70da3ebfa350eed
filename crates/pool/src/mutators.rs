//! Pure event mutators: what happens to one `AccountState` when the
//! upstream reports a rate limit, a usage-limit signal, a quota
//! exhaustion, or a permanent auth failure (spec §4.5.6–4.5.7).

use auth::PermanentFailureCode;
use store::AccountStatus;

use crate::eligibility::backoff_seconds;
use crate::model::{AccountState, UpstreamError};

/// Escalation thresholds for `handle_usage_limit_reached` (spec §4.5.7,
/// §5 open question — defaults match the upstream's observed 5-minute
/// "is this transient" window).
#[derive(Debug, Clone)]
pub struct EscalationConfig {
    pub escalate_after_seconds: f64,
    pub initial_cooldown_cap_seconds: f64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            escalate_after_seconds: 300.0,
            initial_cooldown_cap_seconds: 300.0,
        }
    }
}

/// `rate_limit_exceeded` (spec §4.5.6). `resets_at`/`resets_in_seconds`
/// take priority over the `Retry-After`-style delay parsed from the
/// message; if neither source yields a `reset_at`, fail safe to the
/// cooldown boundary so the account still recovers eventually.
pub fn handle_rate_limit(state: &mut AccountState, err: &UpstreamError, now: f64) {
    state.status = AccountStatus::RateLimited;
    state.error_count += 1;
    state.last_error_at = Some(now);

    if let Some(resets_at) = err.resets_at {
        state.reset_at = Some(resets_at);
    }

    let delay = parse_retry_after(err.message.as_deref())
        .unwrap_or_else(|| backoff_seconds(state.error_count));
    let cooldown_until = now + delay;
    state.cooldown_until = Some(cooldown_until);

    if state.reset_at.is_none() {
        state.reset_at = Some(cooldown_until);
    }
}

/// `usage_limit_reached` (spec §4.5.6–4.5.7). Same delay derivation as
/// `handle_rate_limit` — a `Retry-After`-style hint parsed from the
/// message, combined via `max` with the boundary's time-to-reset when one
/// is present, falling back to `backoff_seconds` when neither source
/// yields a delay — but with an escalation policy layered on top: the
/// first sighting only locks the account for a short, capped cooldown;
/// only a corroborated long-horizon signal (secondary window already
/// exhausted, or repeated failures) escalates the durable `reset_at` out
/// to the real boundary.
pub fn handle_usage_limit_reached(
    state: &mut AccountState,
    err: &UpstreamError,
    now: f64,
    cfg: &EscalationConfig,
) {
    state.status = AccountStatus::RateLimited;
    state.error_count += 1;
    state.last_error_at = Some(now);

    let reset_boundary = err.reset_boundary(now);
    let delay_to_reset = reset_boundary.map(|b| (b - now).max(0.0));

    let message_delay = parse_retry_after(err.message.as_deref());
    let delay = match (message_delay, delay_to_reset) {
        (Some(m), Some(d)) => m.max(d),
        (Some(m), None) => m,
        (None, Some(d)) => d,
        (None, None) => backoff_seconds(state.error_count),
    };

    let capped = delay.min(cfg.initial_cooldown_cap_seconds);
    let cooldown_until = now + capped;
    state.cooldown_until = Some(cooldown_until);

    let secondary_exhausted = state.secondary_reset_at.is_some()
        && state.secondary_used_percent.map(|u| u >= 100.0).unwrap_or(false);

    let escalate = match delay_to_reset {
        None => false,
        Some(d) if d < cfg.escalate_after_seconds => false,
        Some(_) => secondary_exhausted || state.error_count >= 3,
    };

    state.reset_at = if escalate {
        reset_boundary
    } else {
        Some(cooldown_until)
    };
}

/// `quota_exceeded` (spec §4.5.6).
pub fn handle_quota_exceeded(state: &mut AccountState, err: &UpstreamError, now: f64) {
    state.status = AccountStatus::QuotaExceeded;
    state.primary_used_percent = 100.0;
    state.reset_at = Some(err.reset_boundary(now).unwrap_or(now + 3600.0));
}

/// A permanent refresh failure (spec §4.5.6, §7): deactivate with the
/// keyed message.
pub fn handle_permanent_failure(state: &mut AccountState, code: PermanentFailureCode) {
    state.status = AccountStatus::Deactivated;
    state.deactivation_reason = Some(code.message().to_string());
}

/// Extract a `Retry-After`-style delay from an upstream error message, e.g.
/// `"Rate limit exceeded. Try again in 1.5s"` → `1.5`.
fn parse_retry_after(message: Option<&str>) -> Option<f64> {
    let message = message?;
    let idx = message.find("in ")?;
    let rest = &message[idx + 3..];
    let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    rest[..end].parse::<f64>().ok()
}

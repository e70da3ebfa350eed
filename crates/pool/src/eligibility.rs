//! Eligibility filter and refusal-reason classification (spec §4.5.1, §4.5.2).
//!
//! Pure: no clock reads, no I/O. `now` is always injected by the caller.

use store::AccountStatus;

use crate::model::{AccountState, RefusalReason};

/// `min(300, 30 * 2^(error_count - 3))`, only meaningful once
/// `error_count >= 3`.
pub fn backoff_seconds(error_count: u32) -> f64 {
    let exp = error_count.saturating_sub(3);
    let backoff = 30.0 * 2f64.powi(exp as i32);
    backoff.min(300.0)
}

/// Filter `states` down to the indices that survive eligibility, mutating
/// recoverable states in place (auto-recovery transitions, spec §4.5.1).
/// Non-surviving states are left mutated too (e.g. a cooldown that expired
/// but whose account is still backing off) so the caller can persist the
/// effective state regardless of the outcome.
pub fn apply_eligibility(states: &mut [AccountState], now: f64) -> Vec<usize> {
    let mut eligible = Vec::new();

    for (i, s) in states.iter_mut().enumerate() {
        match s.status {
            AccountStatus::Deactivated | AccountStatus::Paused => continue,
            AccountStatus::RateLimited => match s.reset_at {
                Some(reset_at) if now >= reset_at => {
                    s.status = AccountStatus::Active;
                    s.reset_at = None;
                    s.error_count = 0;
                }
                _ => continue,
            },
            AccountStatus::QuotaExceeded => match s.reset_at {
                Some(reset_at) if now >= reset_at => {
                    s.status = AccountStatus::Active;
                    s.reset_at = None;
                    s.error_count = 0;
                    s.primary_used_percent = 0.0;
                }
                _ => continue,
            },
            AccountStatus::Active => {}
        }

        if let Some(cooldown_until) = s.cooldown_until {
            if now >= cooldown_until {
                s.cooldown_until = None;
                s.last_error_at = None;
                s.error_count = 0;
            } else {
                continue;
            }
        }

        if s.error_count >= 3 {
            let backoff = backoff_seconds(s.error_count);
            if let Some(last_error_at) = s.last_error_at {
                if now - last_error_at < backoff {
                    continue;
                }
            }
        }

        eligible.push(i);
    }

    eligible
}

/// Why a human-readable reason applies to a single state right now, for the
/// admin "why isn't this account selectable" trace. Not part of the pure
/// eligibility filter itself — re-derives the same conditions without
/// mutating, for display only.
pub fn ineligibility_reason(state: &AccountState, now: f64) -> Option<String> {
    match state.status {
        AccountStatus::Deactivated => Some(format!(
            "deactivated: {}",
            state.deactivation_reason.as_deref().unwrap_or("unknown")
        )),
        AccountStatus::Paused => Some("paused".to_string()),
        AccountStatus::RateLimited => match state.reset_at {
            Some(r) if now < r => Some(format!("rate_limited until {r}")),
            Some(_) => None,
            None => Some("rate_limited with no reset_at".to_string()),
        },
        AccountStatus::QuotaExceeded => match state.reset_at {
            Some(r) if now < r => Some(format!("quota_exceeded until {r}")),
            Some(_) => None,
            None => Some("quota_exceeded with no reset_at".to_string()),
        },
        AccountStatus::Active => {
            if let Some(c) = state.cooldown_until {
                if now < c {
                    return Some(format!("cooldown until {c}"));
                }
            }
            if state.error_count >= 3 {
                if let Some(last) = state.last_error_at {
                    let backoff = backoff_seconds(state.error_count);
                    if now - last < backoff {
                        return Some(format!(
                            "backing off {backoff:.0}s (error_count={})",
                            state.error_count
                        ));
                    }
                }
            }
            None
        }
    }
}

/// Classify why every account was dropped (spec §4.5.2). `states` must be
/// the post-`apply_eligibility` slice so recovered accounts read `ACTIVE`.
pub fn refusal_reason(states: &[AccountState], now: f64) -> (RefusalReason, Option<f64>) {
    let has_paused = states.iter().any(|s| s.status == AccountStatus::Paused);
    let has_deactivated = states
        .iter()
        .any(|s| s.status == AccountStatus::Deactivated);

    if has_paused && has_deactivated {
        return (RefusalReason::PausedOrAuth, None);
    }
    if has_paused {
        return (RefusalReason::Paused, None);
    }
    if has_deactivated {
        return (RefusalReason::Auth, None);
    }

    let rate_limited_wait = states
        .iter()
        .filter(|s| s.status == AccountStatus::RateLimited)
        .filter_map(|s| s.reset_at)
        .fold(None, min_option);
    if let Some(wait) = rate_limited_wait {
        return (RefusalReason::RateLimited, Some(wait));
    }

    let quota_wait = states
        .iter()
        .filter(|s| s.status == AccountStatus::QuotaExceeded)
        .filter_map(|s| s.reset_at)
        .fold(None, min_option);
    if let Some(wait) = quota_wait {
        return (RefusalReason::QuotaExceeded, Some(wait));
    }

    let cooldown_wait = states
        .iter()
        .filter(|s| s.status == AccountStatus::Active)
        .filter_map(|s| s.cooldown_until)
        .fold(None, min_option);
    if let Some(wait) = cooldown_wait {
        return (RefusalReason::Cooldown, Some(wait));
    }

    (RefusalReason::NoAvailable, None)
}

fn min_option(acc: Option<f64>, v: f64) -> Option<f64> {
    Some(acc.map_or(v, |a| a.min(v)))
}

/// Build the user-visible message for a timed refusal (spec §4.5.2):
/// `"Rate limit exceeded. Try again in {ceil(wait)}s"`.
pub fn refusal_message(reason: RefusalReason, wait_at: Option<f64>, now: f64) -> Option<String> {
    match reason {
        RefusalReason::RateLimited | RefusalReason::QuotaExceeded | RefusalReason::Cooldown => {
            wait_at.map(|at| {
                let wait = (at - now).max(0.0).ceil() as i64;
                format!("Rate limit exceeded. Try again in {wait}s")
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AccountState;

    fn base(id: &str) -> AccountState {
        AccountState {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            plan_type: "pro".to_string(),
            status: AccountStatus::Active,
            deactivation_reason: None,
            reset_at: None,
            primary_used_percent: 0.0,
            secondary_used_percent: None,
            secondary_reset_at: None,
            secondary_capacity_credits: 1000.0,
            last_selected_at: None,
            last_error_at: None,
            error_count: 0,
            cooldown_until: None,
        }
    }

    #[test]
    fn active_account_is_eligible() {
        let mut states = vec![base("a")];
        assert_eq!(apply_eligibility(&mut states, 1000.0), vec![0]);
    }

    #[test]
    fn deactivated_and_paused_are_always_dropped() {
        let mut a = base("a");
        a.status = AccountStatus::Deactivated;
        let mut b = base("b");
        b.status = AccountStatus::Paused;
        let mut states = vec![a, b];
        assert!(apply_eligibility(&mut states, 1000.0).is_empty());
    }

    #[test]
    fn rate_limited_recovers_after_reset_at() {
        let mut a = base("a");
        a.status = AccountStatus::RateLimited;
        a.reset_at = Some(500.0);
        a.error_count = 5;
        let mut states = vec![a];
        let eligible = apply_eligibility(&mut states, 1000.0);
        assert_eq!(eligible, vec![0]);
        assert_eq!(states[0].status, AccountStatus::Active);
        assert_eq!(states[0].reset_at, None);
        assert_eq!(states[0].error_count, 0);
    }

    #[test]
    fn rate_limited_stays_dropped_before_reset_at() {
        let mut a = base("a");
        a.status = AccountStatus::RateLimited;
        a.reset_at = Some(2000.0);
        let mut states = vec![a];
        assert!(apply_eligibility(&mut states, 1000.0).is_empty());
    }

    #[test]
    fn rate_limited_with_no_reset_at_is_dropped() {
        let mut a = base("a");
        a.status = AccountStatus::RateLimited;
        a.reset_at = None;
        let mut states = vec![a];
        assert!(apply_eligibility(&mut states, 1000.0).is_empty());
    }

    #[test]
    fn quota_exceeded_recovers_and_clears_used_percent() {
        let mut a = base("a");
        a.status = AccountStatus::QuotaExceeded;
        a.reset_at = Some(500.0);
        a.primary_used_percent = 100.0;
        let mut states = vec![a];
        let eligible = apply_eligibility(&mut states, 1000.0);
        assert_eq!(eligible, vec![0]);
        assert_eq!(states[0].status, AccountStatus::Active);
        assert_eq!(states[0].primary_used_percent, 0.0);
    }

    #[test]
    fn cooldown_in_future_drops_account() {
        let mut a = base("a");
        a.cooldown_until = Some(2000.0);
        let mut states = vec![a];
        assert!(apply_eligibility(&mut states, 1000.0).is_empty());
    }

    #[test]
    fn expired_cooldown_clears_error_state() {
        let mut a = base("a");
        a.cooldown_until = Some(500.0);
        a.last_error_at = Some(400.0);
        a.error_count = 2;
        let mut states = vec![a];
        let eligible = apply_eligibility(&mut states, 1000.0);
        assert_eq!(eligible, vec![0]);
        assert_eq!(states[0].cooldown_until, None);
        assert_eq!(states[0].last_error_at, None);
        assert_eq!(states[0].error_count, 0);
    }

    #[test]
    fn backoff_drops_account_within_window() {
        let mut a = base("a");
        a.error_count = 4;
        a.last_error_at = Some(990.0);
        let mut states = vec![a];
        assert!(apply_eligibility(&mut states, 1000.0).is_empty());
    }

    #[test]
    fn backoff_caps_at_five_minutes() {
        assert_eq!(backoff_seconds(3), 30.0);
        assert_eq!(backoff_seconds(4), 60.0);
        assert_eq!(backoff_seconds(10), 300.0);
        assert_eq!(backoff_seconds(20), 300.0);
    }

    #[test]
    fn refusal_priority_prefers_paused_or_auth_over_everything() {
        let mut a = base("a");
        a.status = AccountStatus::Paused;
        let mut b = base("b");
        b.status = AccountStatus::Deactivated;
        let states = vec![a, b];
        let (reason, _) = refusal_reason(&states, 1000.0);
        assert_eq!(reason, RefusalReason::PausedOrAuth);
    }

    #[test]
    fn refusal_falls_back_to_no_available_when_nothing_matches() {
        let states: Vec<AccountState> = vec![];
        let (reason, _) = refusal_reason(&states, 1000.0);
        assert_eq!(reason, RefusalReason::NoAvailable);
    }

    #[test]
    fn timed_refusal_message_ceils_wait() {
        let msg = refusal_message(RefusalReason::Cooldown, Some(1001.2), 1000.0);
        assert_eq!(msg.as_deref(), Some("Rate limit exceeded. Try again in 2s"));
    }
}

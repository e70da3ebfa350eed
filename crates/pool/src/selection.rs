//! Tier-weighted scoring and account selection (spec §4.5.3–4.5.5).
//!
//! Pure: takes the already-eligible slice and a clock reading, returns a
//! `SelectionResult`. The facade (§4.6) is the only caller that deals with
//! the clock, I/O, or mutation of the pool at large.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::eligibility::{apply_eligibility, ineligibility_reason, refusal_message, refusal_reason};
use crate::model::{
    AccountState, RefusalReason, SelectionResult, SelectionTrace, TierScore, TierWeights,
    normalize_tier, tier_weight,
};

#[derive(Debug, Default)]
struct TierAgg {
    urgency: f64,
    remaining_credits: f64,
    reset_at: Option<f64>,
    account_count: usize,
}

/// Select the best account out of `states` at time `now` (spec §4.5.3–5).
/// Mutates `states` in place with the eligibility filter's auto-recovery
/// transitions (spec §4.5.1) and returns which index, if any, was chosen.
pub fn select(
    states: &mut [AccountState],
    now: f64,
    weights: &TierWeights,
    capacities: &HashMap<String, f64>,
    prefer_earlier_reset: bool,
) -> SelectionResult {
    let eligible_idx = apply_eligibility(states, now);
    select_among(states, &eligible_idx, now, weights, capacities, prefer_earlier_reset)
}

/// Pick among an already-computed `eligible_idx` subset of `states`, without
/// re-running the eligibility filter. Used by the facade (spec §4.6) to run
/// eligibility exactly once per pick while still scoring a restricted
/// candidate set (e.g. pinned accounts) with the same tie-break rules.
pub fn select_among(
    states: &[AccountState],
    eligible_idx: &[usize],
    now: f64,
    weights: &TierWeights,
    capacities: &HashMap<String, f64>,
    prefer_earlier_reset: bool,
) -> SelectionResult {
    let mut trace = SelectionTrace {
        ineligible: states
            .iter()
            .enumerate()
            .filter(|(i, _)| !eligible_idx.contains(i))
            .filter_map(|(_, s)| {
                ineligibility_reason(s, now).map(|reason| (s.id.clone(), reason))
            })
            .collect(),
        ..Default::default()
    };

    if eligible_idx.is_empty() {
        let (reason, wait_at) = refusal_reason(states, now);
        let message = refusal_message(reason, wait_at, now);
        return SelectionResult {
            account: None,
            reason: Some(reason),
            message,
            trace: Some(trace),
        };
    }

    let mut tiers: HashMap<String, TierAgg> = HashMap::new();
    for &i in eligible_idx {
        let s = &states[i];
        let tier = normalize_tier(&s.plan_type).to_string();
        let capacity = capacities.get(&tier).copied().unwrap_or(0.0);
        let secondary_used = s.secondary_used_percent.unwrap_or(s.primary_used_percent);
        let remaining_credits = capacity * (100.0 - secondary_used).max(0.0) / 100.0;

        let entry = tiers.entry(tier).or_default();
        entry.account_count += 1;
        entry.remaining_credits += remaining_credits;

        if let Some(secondary_reset_at) = s.secondary_reset_at {
            let time_to_reset = (secondary_reset_at - now).max(60.0);
            entry.urgency += remaining_credits / time_to_reset;
            entry.reset_at = Some(
                entry
                    .reset_at
                    .map_or(secondary_reset_at, |r: f64| r.min(secondary_reset_at)),
            );
        }
    }

    let tier_scores: Vec<TierScore> = tiers
        .into_iter()
        .map(|(tier, agg)| {
            let w = tier_weight(&tier, weights);
            TierScore {
                score: agg.urgency * w,
                tier,
                urgency: agg.urgency,
                remaining_credits: agg.remaining_credits,
                reset_at: agg.reset_at,
                account_count: agg.account_count,
            }
        })
        .collect();
    trace.tier_scores = tier_scores.clone();

    let any_positive = tier_scores.iter().any(|t| t.score > 0.0);

    let chosen_idx = if !any_positive {
        trace.fallback_used = true;
        eligible_idx
            .iter()
            .copied()
            .min_by(|&a, &b| usage_sort_cmp(&states[a], &states[b]))
            .expect("eligible_idx is non-empty")
    } else {
        let chosen_tier = tier_scores
            .iter()
            .min_by(tier_cmp)
            .expect("tier_scores is non-empty")
            .tier
            .clone();
        trace.chosen_tier = Some(chosen_tier.clone());

        eligible_idx
            .iter()
            .copied()
            .filter(|&i| normalize_tier(&states[i].plan_type) == chosen_tier)
            .min_by(|&a, &b| intra_tier_cmp(&states[a], &states[b], prefer_earlier_reset))
            .expect("chosen tier has at least one account")
    };

    let chosen = states[chosen_idx].clone();
    SelectionResult {
        account: Some(chosen),
        reason: None,
        message: None,
        trace: Some(trace),
    }
}

/// `(-score, reset_at_or_inf, -remaining_credits, tier_name)` — highest
/// score wins, then earliest reset, then largest remaining credits, then
/// tier name for determinism (spec §4.5.4).
fn tier_cmp(a: &TierScore, b: &TierScore) -> Ordering {
    cmp_f64(-a.score, -b.score)
        .then_with(|| cmp_f64(reset_or_inf(a.reset_at), reset_or_inf(b.reset_at)))
        .then_with(|| cmp_f64(-a.remaining_credits, -b.remaining_credits))
        .then_with(|| a.tier.cmp(&b.tier))
}

/// `(secondary_reset_at_or_inf, secondary_used_percent, last_selected_at_or_0, account_id)`
/// when `prefer_earlier_reset`; otherwise usage is compared before reset
/// (spec §4.5.5, §5 open question on the dashboard toggle).
fn intra_tier_cmp(a: &AccountState, b: &AccountState, prefer_earlier_reset: bool) -> Ordering {
    let reset_cmp = cmp_f64(reset_or_inf(a.secondary_reset_at), reset_or_inf(b.secondary_reset_at));
    let usage_cmp = cmp_f64(
        a.secondary_used_percent.unwrap_or(a.primary_used_percent),
        b.secondary_used_percent.unwrap_or(b.primary_used_percent),
    );

    let primary = if prefer_earlier_reset {
        reset_cmp.then(usage_cmp)
    } else {
        usage_cmp.then(reset_cmp)
    };

    primary
        .then_with(|| a.last_selected_at.unwrap_or(0.0).total_cmp(&b.last_selected_at.unwrap_or(0.0)))
        .then_with(|| a.id.cmp(&b.id))
}

/// `(secondary_used_or_primary_used, primary_used, last_selected_at_or_0, account_id)`
/// (spec §4.5.5 fallback key, used when no tier has positive score).
fn usage_sort_cmp(a: &AccountState, b: &AccountState) -> Ordering {
    cmp_f64(
        a.secondary_used_percent.unwrap_or(a.primary_used_percent),
        b.secondary_used_percent.unwrap_or(b.primary_used_percent),
    )
    .then_with(|| cmp_f64(a.primary_used_percent, b.primary_used_percent))
    .then_with(|| a.last_selected_at.unwrap_or(0.0).total_cmp(&b.last_selected_at.unwrap_or(0.0)))
    .then_with(|| a.id.cmp(&b.id))
}

fn reset_or_inf(reset_at: Option<f64>) -> f64 {
    reset_at.unwrap_or(f64::INFINITY)
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.total_cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::default_tier_capacities;
    use store::AccountStatus;

    fn account(id: &str, plan_type: &str) -> AccountState {
        AccountState {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            plan_type: plan_type.to_string(),
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
    fn refuses_when_no_accounts() {
        let mut states: Vec<AccountState> = vec![];
        let result = select(
            &mut states,
            1000.0,
            &TierWeights::default(),
            &default_tier_capacities(),
            true,
        );
        assert!(result.account.is_none());
        assert_eq!(result.reason, Some(RefusalReason::NoAvailable));
    }

    #[test]
    fn falls_back_to_usage_sort_key_with_no_secondary_reset_data() {
        let mut a = account("a", "pro");
        a.primary_used_percent = 80.0;
        let mut b = account("b", "pro");
        b.primary_used_percent = 10.0;
        let mut states = vec![a, b];
        let result = select(
            &mut states,
            1000.0,
            &TierWeights::default(),
            &default_tier_capacities(),
            true,
        );
        assert_eq!(result.account.unwrap().id, "b");
        assert!(result.trace.unwrap().fallback_used);
    }

    #[test]
    fn picks_most_urgent_tier() {
        let mut pro = account("pro-1", "pro");
        pro.secondary_used_percent = Some(90.0);
        pro.secondary_reset_at = Some(1060.0);

        let mut free = account("free-1", "free");
        free.secondary_used_percent = Some(10.0);
        free.secondary_reset_at = Some(1060.0);

        let mut states = vec![pro, free];
        let result = select(
            &mut states,
            1000.0,
            &TierWeights::default(),
            &default_tier_capacities(),
            true,
        );
        // pro: remaining=1000*0.10=100, rate=100/60=1.667, score*1.0=1.667
        // free: remaining=50*0.90=45, rate=45/60=0.75, score*0.9=0.675
        assert_eq!(result.account.unwrap().id, "pro-1");
    }

    #[test]
    fn intra_tier_tie_break_prefers_earliest_reset() {
        let mut a = account("a", "pro");
        a.secondary_used_percent = Some(50.0);
        a.secondary_reset_at = Some(2000.0);
        let mut b = account("b", "pro");
        b.secondary_used_percent = Some(50.0);
        b.secondary_reset_at = Some(1500.0);
        let mut states = vec![a, b];
        let result = select(
            &mut states,
            1000.0,
            &TierWeights::default(),
            &default_tier_capacities(),
            true,
        );
        assert_eq!(result.account.unwrap().id, "b");
    }

    #[test]
    fn intra_tier_tie_break_id_is_deterministic() {
        let mut a = account("z", "pro");
        a.secondary_used_percent = Some(50.0);
        a.secondary_reset_at = Some(2000.0);
        let mut b = account("a", "pro");
        b.secondary_used_percent = Some(50.0);
        b.secondary_reset_at = Some(2000.0);
        let mut states = vec![a, b];
        let result = select(
            &mut states,
            1000.0,
            &TierWeights::default(),
            &default_tier_capacities(),
            true,
        );
        assert_eq!(result.account.unwrap().id, "a");
    }
}

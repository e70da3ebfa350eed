//! The Usage Refresher (spec §4.4): the background-on-demand loop that
//! keeps the primary/secondary usage snapshots the Balancer Logic scores
//! against up to date.
//!
//! Runs strictly sequentially over accounts — the account-store session
//! backing it is not safe for concurrent mutation (spec §5) — and never
//! blocks the selection path: transport errors and unexpected 5xxs are
//! logged and swallowed rather than propagated.

use auth::{OAuthEndpoints, TokenCryptor};
use provider::{UsageFetchOutcome, UsageSnapshotPair, fetch_usage};
use store::{Account, AccountStatus, AccountStorePort, UsageSnapshot, Window};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Skip an account's usage refresh if its latest primary sample is younger
/// than this many seconds (spec §4.4).
pub fn is_stale(last_primary_recorded_at: Option<i64>, now: i64, interval_seconds: i64) -> bool {
    match last_primary_recorded_at {
        Some(recorded_at) => now - recorded_at >= interval_seconds,
        None => true,
    }
}

/// Refresh usage for every non-deactivated account whose last primary
/// sample is stale. One account's failure never aborts the pass over the
/// rest (spec §4.4: "swallow & log" on transport/5xx).
pub async fn refresh_all(
    store: &dyn AccountStorePort,
    cryptor: &TokenCryptor,
    client: &reqwest::Client,
    endpoints: &OAuthEndpoints,
    usage_url: &str,
    interval_seconds: i64,
    now: i64,
) -> Result<()> {
    let accounts = store.list_accounts().await?;
    for account in accounts {
        if account.status == AccountStatus::Deactivated {
            continue;
        }

        let latest_primary = store
            .latest_usage_snapshot(&account.id, Window::Primary)
            .await?;
        if !is_stale(latest_primary.map(|s| s.recorded_at), now, interval_seconds) {
            continue;
        }

        if let Err(e) = refresh_usage(
            store, cryptor, client, endpoints, usage_url, &account, now,
        )
        .await
        {
            warn!(account_id = %account.id, error = %e, "usage refresh failed for account, continuing");
        }
    }
    Ok(())
}

/// Refresh usage for a single account (spec §4.4, §7).
pub async fn refresh_usage(
    store: &dyn AccountStorePort,
    cryptor: &TokenCryptor,
    client: &reqwest::Client,
    endpoints: &OAuthEndpoints,
    usage_url: &str,
    account: &Account,
    now: i64,
) -> Result<()> {
    let access_token = cryptor.decrypt(&account.access_token_encrypted)?;
    let outcome = fetch_usage(
        client,
        usage_url,
        &access_token,
        account.chatgpt_account_id.as_deref(),
        now,
    )
    .await?;

    match outcome {
        UsageFetchOutcome::Success(pair) => {
            record_outcome("success");
            persist(store, &account.id, pair, now).await
        }
        UsageFetchOutcome::Unauthorized => {
            record_outcome("unauthorized");
            handle_unauthorized(store, cryptor, client, endpoints, usage_url, account, now).await
        }
        UsageFetchOutcome::Deactivate { status, message } => {
            record_outcome("deactivated");
            let reason = format!("Usage API error: HTTP {status} - {message}");
            warn!(account_id = %account.id, %status, "deactivating account after usage API error");
            store
                .update_status(&account.id, AccountStatus::Deactivated, Some(reason))
                .await?;
            Ok(())
        }
        UsageFetchOutcome::Transient => {
            record_outcome("transient");
            debug!(account_id = %account.id, "transient usage fetch error, will retry next pass");
            Ok(())
        }
    }
}

/// Record a usage-refresh outcome (spec §9's ambient metrics stack). Labels
/// match the gateway's `gateway_usage_refresh_total` counter so the admin
/// dashboard doesn't need a second naming scheme for the same signal.
fn record_outcome(outcome: &'static str) {
    metrics::counter!("gateway_usage_refresh_total", "outcome" => outcome).increment(1);
}

/// `401` on the usage fetch: force a token refresh and retry exactly once
/// with the new access token (spec §4.4, §7).
async fn handle_unauthorized(
    store: &dyn AccountStorePort,
    cryptor: &TokenCryptor,
    client: &reqwest::Client,
    endpoints: &OAuthEndpoints,
    usage_url: &str,
    account: &Account,
    now: i64,
) -> Result<()> {
    let refreshed = match auth::ensure_fresh(store, cryptor, client, endpoints, account, now, 0, true).await {
        Ok(a) => a,
        Err(e) => {
            // ensure_fresh already deactivated the account on a permanent
            // failure; either way this account is not retried this pass.
            warn!(account_id = %account.id, error = %e, "token refresh failed during usage refresh");
            return Ok(());
        }
    };

    let access_token = cryptor.decrypt(&refreshed.access_token_encrypted)?;
    let outcome = fetch_usage(
        client,
        usage_url,
        &access_token,
        refreshed.chatgpt_account_id.as_deref(),
        now,
    )
    .await?;

    match outcome {
        UsageFetchOutcome::Success(pair) => {
            record_outcome("success");
            persist(store, &refreshed.id, pair, now).await
        }
        UsageFetchOutcome::Deactivate { status, message } => {
            record_outcome("deactivated");
            let reason = format!("Usage API error: HTTP {status} - {message}");
            store
                .update_status(&refreshed.id, AccountStatus::Deactivated, Some(reason))
                .await?;
            Ok(())
        }
        UsageFetchOutcome::Unauthorized | UsageFetchOutcome::Transient => {
            record_outcome("transient");
            debug!(account_id = %refreshed.id, "usage fetch still failing after refresh retry");
            Ok(())
        }
    }
}

async fn persist(
    store: &dyn AccountStorePort,
    account_id: &str,
    pair: UsageSnapshotPair,
    now: i64,
) -> Result<()> {
    let credits_has = pair.credits.is_some();
    let credits_unlimited = pair.credits.as_ref().map(|c| c.unlimited);
    let credits_balance = pair.credits.as_ref().and_then(|c| c.balance);

    if let Some(primary) = pair.primary {
        store
            .record_usage_snapshot(UsageSnapshot {
                account_id: account_id.to_string(),
                window: Window::Primary,
                used_percent: primary.used_percent,
                reset_at: primary.reset_at,
                window_minutes: primary.window_minutes,
                credits_has: Some(credits_has),
                credits_unlimited,
                credits_balance,
                recorded_at: now,
            })
            .await?;
    }
    if let Some(secondary) = pair.secondary {
        store
            .record_usage_snapshot(UsageSnapshot {
                account_id: account_id.to_string(),
                window: Window::Secondary,
                used_percent: secondary.used_percent,
                reset_at: secondary.reset_at,
                window_minutes: secondary.window_minutes,
                credits_has: Some(credits_has),
                credits_unlimited,
                credits_balance,
                recorded_at: now,
            })
            .await?;
    }
    if let Some(plan_type) = pair.plan_type {
        info!(account_id, %plan_type, "usage refresh updated plan type");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_when_no_prior_sample() {
        assert!(is_stale(None, 1000, 300));
    }

    #[test]
    fn stale_past_interval() {
        assert!(is_stale(Some(600), 1000, 300));
    }

    #[test]
    fn not_stale_within_interval() {
        assert!(!is_stale(Some(900), 1000, 300));
    }
}

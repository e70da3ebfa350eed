//! The Load Balancer Facade (spec §4.6): the stateful wrapper around the
//! pure Balancer Logic. Holds per-account runtime state, caches the
//! account+usage snapshot with a short TTL, synchronises state changes back
//! to the store, and exposes `select_account`, `mark_*`, and `record_error`
//! to the HTTP surface.
//!
//! A single `tokio::sync::Mutex` guards the runtime map and the snapshot
//! (spec §5: "a single lock guards access to the runtime state map and the
//! snapshot"); critical sections are short, and every suspension point
//! (store reads, usage refresh, token refresh) happens with the lock
//! released except where the snapshot itself is being rebuilt.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use auth::{OAuthEndpoints, TokenCryptor};
use common::hmac_fingerprint;
use store::{Account, AccountStatus, AccountStorePort, DashboardSettings, Window};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::eligibility::apply_eligibility;
use crate::error::Result;
use crate::model::{AccountState, RefusalReason, RuntimeState, SelectionResult, TierWeights};
use crate::mutators::{self, EscalationConfig};
use crate::selection::select_among;
use crate::usage_refresher;

/// Static configuration for a `Facade` (spec §9's typed settings object,
/// the parts that govern selection rather than the HTTP surface).
#[derive(Debug, Clone)]
pub struct FacadeConfig {
    pub usage_refresh_enabled: bool,
    pub usage_refresh_interval_seconds: i64,
    pub usage_url: String,
    pub snapshot_ttl_seconds: i64,
    pub tier_weights: TierWeights,
    pub tier_capacity_credits: HashMap<String, f64>,
    pub proactive_refresh_minutes: i64,
    pub escalation: EscalationConfig,
    /// Bounded LRU capacity for the sticky-key map (spec §9 open question,
    /// resolved in `SPEC_FULL.md` §5: defaults to 10,000 entries).
    pub sticky_map_capacity: usize,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            usage_refresh_enabled: true,
            usage_refresh_interval_seconds: 60,
            usage_url: String::new(),
            snapshot_ttl_seconds: 5,
            tier_weights: TierWeights::default(),
            tier_capacity_credits: crate::model::default_tier_capacities(),
            proactive_refresh_minutes: 50,
            escalation: EscalationConfig::default(),
            sticky_map_capacity: 10_000,
        }
    }
}

/// Outcome of `select_account` (spec §6): either a chosen account or the
/// structured refusal reason/message the HTTP surface should surface.
#[derive(Debug, Clone)]
pub struct SelectOutcome {
    pub account: Option<AccountState>,
    pub reason: Option<RefusalReason>,
    pub message: Option<String>,
}

struct Snapshot {
    states: Vec<AccountState>,
    account_ids: Vec<String>,
    settings: DashboardSettings,
    updated_at: i64,
}

/// A bounded LRU `sticky_key -> account_id` map (spec §9 open question).
#[derive(Default)]
struct StickyMap {
    capacity: usize,
    order: VecDeque<String>,
    map: HashMap<String, String>,
}

impl StickyMap {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            map: HashMap::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<String> {
        if self.map.contains_key(key) {
            self.touch(key);
        }
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: String, account_id: String) {
        if self.map.insert(key.clone(), account_id).is_some() {
            self.touch(&key);
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}

struct Inner {
    runtime: HashMap<String, RuntimeState>,
    snapshot: Option<Snapshot>,
    sticky: StickyMap,
}

/// The stateful Load Balancer Facade (spec §4.6).
pub struct Facade {
    store: Arc<dyn AccountStorePort>,
    cryptor: Arc<TokenCryptor>,
    http_client: reqwest::Client,
    endpoints: OAuthEndpoints,
    config: FacadeConfig,
    inner: Mutex<Inner>,
}

impl Facade {
    pub fn new(
        store: Arc<dyn AccountStorePort>,
        cryptor: Arc<TokenCryptor>,
        http_client: reqwest::Client,
        endpoints: OAuthEndpoints,
        config: FacadeConfig,
    ) -> Self {
        let sticky = StickyMap::new(config.sticky_map_capacity);
        Self {
            store,
            cryptor,
            http_client,
            endpoints,
            config,
            inner: Mutex::new(Inner {
                runtime: HashMap::new(),
                snapshot: None,
                sticky,
            }),
        }
    }

    /// Force the next `select_account` call to rebuild the snapshot rather
    /// than reuse the cached one.
    pub async fn invalidate_snapshot(&self) {
        let mut inner = self.inner.lock().await;
        inner.snapshot = None;
    }

    /// Pick an account for this request (spec §4.6, §6).
    ///
    /// `sticky_key`, when supplied, routes related requests (e.g. sharing a
    /// prompt cache key) to the same account as long as it remains
    /// selectable. `reallocate_sticky` tells the facade the caller already
    /// saw a retryable failure on the sticky-mapped account and it should
    /// not be reused even if it looks selectable from the cache.
    pub async fn select_account(&self, sticky_key: Option<&str>, reallocate_sticky: bool, now: i64) -> Result<SelectOutcome> {
        let mut inner = self.inner.lock().await;
        self.ensure_snapshot(&mut inner, now).await?;

        let Snapshot {
            states,
            account_ids,
            settings,
            ..
        } = inner
            .snapshot
            .as_ref()
            .expect("ensure_snapshot always populates the snapshot");
        let mut states = states.clone();
        let account_ids = account_ids.clone();
        let prefer_earlier_reset = settings.prefer_earlier_reset;
        let pinned_account_ids = settings.pinned_account_ids.clone();

        let eligible_idx = apply_eligibility(&mut states, now as f64);

        // Sticky routing (spec §4.6 "Sticky routing").
        if let Some(key) = sticky_key {
            if !reallocate_sticky {
                if let Some(account_id) = inner.sticky.get(key) {
                    if let Some(idx) = account_ids.iter().position(|id| *id == account_id) {
                        if eligible_idx.contains(&idx) {
                            self.finish_selection(&mut inner, &states, &account_ids, idx, now)
                                .await?;
                            return Ok(SelectOutcome {
                                account: Some(states[idx].clone()),
                                reason: None,
                                message: None,
                            });
                        }
                    }
                }
            }
        }

        // Pinned accounts (spec §4.6 "Pinned accounts"): tried first among
        // themselves; fall back to the full pool if none are selectable.
        // The pinned set lives in the dynamic `dashboard_settings` row (spec
        // §6) so an operator's dashboard edit takes effect on the very next
        // pick, not just at process startup.
        if !pinned_account_ids.is_empty() {
            let pinned_eligible: Vec<usize> = eligible_idx
                .iter()
                .copied()
                .filter(|&i| pinned_account_ids.contains(&account_ids[i]))
                .collect();
            if !pinned_eligible.is_empty() {
                let result = select_among(
                    &states,
                    &pinned_eligible,
                    now as f64,
                    &self.config.tier_weights,
                    &self.config.tier_capacity_credits,
                    prefer_earlier_reset,
                );
                if let Some(chosen) = result.account {
                    let idx = account_ids.iter().position(|id| *id == chosen.id).unwrap();
                    self.finish_selection(&mut inner, &states, &account_ids, idx, now)
                        .await?;
                    if let Some(key) = sticky_key {
                        inner.sticky.insert(key.to_string(), chosen.id.clone());
                    }
                    return Ok(SelectOutcome {
                        account: Some(chosen),
                        reason: None,
                        message: None,
                    });
                }
            }

            let result = select_among(
                &states,
                &eligible_idx,
                now as f64,
                &self.config.tier_weights,
                &self.config.tier_capacity_credits,
                prefer_earlier_reset,
            );
            return self
                .finish_full_pool_result(&mut inner, &states, &account_ids, result, sticky_key, now, true)
                .await;
        }

        let result = select_among(
            &states,
            &eligible_idx,
            now as f64,
            &self.config.tier_weights,
            &self.config.tier_capacity_credits,
            prefer_earlier_reset,
        );
        self.finish_full_pool_result(&mut inner, &states, &account_ids, result, sticky_key, now, false)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_full_pool_result(
        &self,
        inner: &mut Inner,
        states: &[AccountState],
        account_ids: &[String],
        result: SelectionResult,
        sticky_key: Option<&str>,
        now: i64,
        pinned_fallback: bool,
    ) -> Result<SelectOutcome> {
        match result.account {
            Some(chosen) => {
                let idx = account_ids.iter().position(|id| *id == chosen.id).unwrap();
                self.finish_selection(inner, states, account_ids, idx, now).await?;
                if let Some(key) = sticky_key {
                    inner.sticky.insert(key.to_string(), chosen.id.clone());
                }
                if pinned_fallback {
                    let fp = hmac_fingerprint(chosen.id.as_bytes(), &chosen.email, 10);
                    info!(
                        email = %chosen.email,
                        short_id = %fp,
                        "lb_fallback pinned_failed full_selected={}[{}]",
                        chosen.email,
                        fp
                    );
                }
                Ok(SelectOutcome {
                    account: Some(chosen),
                    reason: None,
                    message: None,
                })
            }
            None => {
                self.persist_recoveries(states, account_ids).await?;
                Ok(SelectOutcome {
                    account: None,
                    reason: result.reason,
                    message: result.message,
                })
            }
        }
    }

    /// Persist the effective reset-at reconciliation and any auto-recovery
    /// transitions the eligibility filter performed, mark the chosen
    /// account's runtime `last_selected_at`.
    async fn finish_selection(
        &self,
        inner: &mut Inner,
        states: &[AccountState],
        account_ids: &[String],
        chosen_idx: usize,
        now: i64,
    ) -> Result<()> {
        self.persist_recoveries(states, account_ids).await?;
        let chosen_id = &account_ids[chosen_idx];
        inner
            .runtime
            .entry(chosen_id.clone())
            .or_default()
            .last_selected_at = Some(now as f64);
        Ok(())
    }

    /// Persist any status/reset_at changes the eligibility filter or the
    /// secondary-quota folding applied in memory (spec §4.6 step 5).
    async fn persist_recoveries(&self, states: &[AccountState], account_ids: &[String]) -> Result<()> {
        for (i, state) in states.iter().enumerate() {
            if state.status == AccountStatus::Active && state.reset_at.is_none() && state.error_count == 0 {
                continue;
            }
            let id = &account_ids[i];
            self.store
                .update_status(id, state.status, state.deactivation_reason.clone())
                .await?;
            self.store
                .update_reset_at(id, state.reset_at.map(|r| r as i64))
                .await?;
        }
        Ok(())
    }

    /// Apply a `rate_limit_exceeded` signal to an account (spec §4.5.6, §6).
    pub async fn mark_rate_limit(&self, account_id: &str, err: &crate::model::UpstreamError, now: i64) -> Result<()> {
        self.mutate(account_id, now, |state, now| {
            mutators::handle_rate_limit(state, err, now)
        })
        .await
    }

    /// Apply a `usage_limit_reached` signal to an account (spec §4.5.6–4.5.7, §6).
    pub async fn mark_usage_limit_reached(&self, account_id: &str, err: &crate::model::UpstreamError, now: i64) -> Result<()> {
        let escalation = self.config.escalation.clone();
        self.mutate(account_id, now, move |state, now| {
            mutators::handle_usage_limit_reached(state, err, now, &escalation)
        })
        .await
    }

    /// Apply a `quota_exceeded` signal to an account (spec §4.5.6, §6).
    pub async fn mark_quota_exceeded(&self, account_id: &str, err: &crate::model::UpstreamError, now: i64) -> Result<()> {
        self.mutate(account_id, now, |state, now| {
            mutators::handle_quota_exceeded(state, err, now)
        })
        .await
    }

    /// Apply a permanent refresh failure to an account (spec §4.5.6, §7).
    pub async fn mark_permanent_failure(&self, account_id: &str, code: auth::PermanentFailureCode, now: i64) -> Result<()> {
        self.mutate(account_id, now, move |state, _now| {
            mutators::handle_permanent_failure(state, code)
        })
        .await
    }

    /// Record a generic error against an account without a specific
    /// upstream signal (spec §6): bumps `error_count`/`last_error_at` so
    /// repeated unclassified failures still gate through backoff.
    pub async fn record_error(&self, account_id: &str, now: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let runtime = inner.runtime.entry(account_id.to_string()).or_default();
        runtime.error_count += 1;
        runtime.last_error_at = Some(now as f64);
        Ok(())
    }

    /// Run a pure mutator against an account's derived state, then persist
    /// the status/reset_at/error bookkeeping it produced, both to the
    /// durable store and the in-memory runtime map.
    async fn mutate(
        &self,
        account_id: &str,
        now: i64,
        f: impl FnOnce(&mut AccountState, f64),
    ) -> Result<()> {
        let account = self
            .store
            .list_accounts()
            .await?
            .into_iter()
            .find(|a| a.id == account_id)
            .ok_or_else(|| crate::error::Error::NotFound(account_id.to_string()))?;

        let mut inner = self.inner.lock().await;
        let runtime = inner.runtime.entry(account_id.to_string()).or_default().clone();
        let mut state = build_account_state(&account, None, None, &runtime, &self.config);
        f(&mut state, now as f64);

        self.store
            .update_status(account_id, state.status, state.deactivation_reason.clone())
            .await?;
        self.store
            .update_reset_at(account_id, state.reset_at.map(|r| r as i64))
            .await?;

        let runtime_entry = inner.runtime.entry(account_id.to_string()).or_default();
        runtime_entry.reset_at = state.reset_at;
        runtime_entry.last_error_at = state.last_error_at;
        runtime_entry.error_count = state.error_count;
        runtime_entry.cooldown_until = state.cooldown_until;
        inner.snapshot = None;
        Ok(())
    }

    /// Rebuild the cached snapshot if it is absent or past its TTL (spec
    /// §4.6 step 1–3). Runs the Usage Refresher first so the snapshot it
    /// builds reflects freshly-observed usage rather than a stale sample.
    async fn ensure_snapshot(&self, inner: &mut Inner, now: i64) -> Result<()> {
        if let Some(snap) = &inner.snapshot {
            if now - snap.updated_at < self.config.snapshot_ttl_seconds {
                return Ok(());
            }
        }

        if self.config.usage_refresh_enabled {
            if let Err(e) = usage_refresher::refresh_all(
                self.store.as_ref(),
                &self.cryptor,
                &self.http_client,
                &self.endpoints,
                &self.config.usage_url,
                self.config.usage_refresh_interval_seconds,
                now,
            )
            .await
            {
                warn!(error = %e, "usage refresh pass failed, selecting against existing snapshot");
            }
        }

        let accounts = self.store.list_accounts().await?;
        let settings = self.store.load_settings().await?;

        let mut states = Vec::with_capacity(accounts.len());
        let mut account_ids = Vec::with_capacity(accounts.len());
        for account in &accounts {
            let primary = self
                .store
                .latest_usage_snapshot(&account.id, Window::Primary)
                .await?;
            let secondary = self
                .store
                .latest_usage_snapshot(&account.id, Window::Secondary)
                .await?;
            let runtime = inner.runtime.entry(account.id.clone()).or_default().clone();
            let mut state = build_account_state(account, primary, secondary, &runtime, &self.config);
            fold_secondary_quota(&mut state, now);
            let reconciled = reconcile_reset_at(runtime.reset_at, account.reset_at, now);
            state.reset_at = match (state.reset_at, reconciled) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            };
            account_ids.push(account.id.clone());
            states.push(state);
        }

        inner.snapshot = Some(Snapshot {
            states,
            account_ids,
            settings,
            updated_at: now,
        });
        Ok(())
    }
}

/// Fold the secondary (long) window into the account's effective status
/// (spec §4.6 step 2): an exhausted secondary window takes the account out
/// of rotation as `QUOTA_EXCEEDED` even if the durable status is still
/// `ACTIVE`, unless it's already deactivated or paused.
fn fold_secondary_quota(state: &mut AccountState, now: i64) {
    if matches!(state.status, AccountStatus::Deactivated | AccountStatus::Paused) {
        return;
    }
    let Some(secondary_used) = state.secondary_used_percent else {
        return;
    };
    if secondary_used >= 100.0 {
        state.status = AccountStatus::QuotaExceeded;
        state.primary_used_percent = 100.0;
        state.reset_at = state.secondary_reset_at.or(Some(now as f64 + 3600.0));
    }
}

/// Reconcile runtime vs durable `reset_at` (spec §4.6 step 3, §9): an
/// expired runtime value never wins, and when both are live the later
/// boundary wins so neither source's data is silently discarded.
fn reconcile_reset_at(runtime: Option<f64>, durable: Option<i64>, now: i64) -> Option<f64> {
    let runtime = runtime.filter(|r| now < *r as i64);
    let durable = durable.map(|d| d as f64);
    match (runtime, durable) {
        (Some(r), Some(d)) => Some(r.max(d)),
        (Some(r), None) => Some(r),
        (None, Some(d)) => Some(d),
        (None, None) => None,
    }
}

fn build_account_state(
    account: &Account,
    primary: Option<store::UsageSnapshot>,
    secondary: Option<store::UsageSnapshot>,
    runtime: &RuntimeState,
    config: &FacadeConfig,
) -> AccountState {
    let tier = crate::model::normalize_tier(&account.plan_type);
    let capacity = config.tier_capacity_credits.get(tier).copied().unwrap_or(0.0);

    AccountState {
        id: account.id.clone(),
        email: account.email.clone(),
        plan_type: account.plan_type.clone(),
        status: account.status,
        deactivation_reason: account.deactivation_reason.clone(),
        reset_at: account.reset_at.map(|r| r as f64),
        primary_used_percent: primary.as_ref().map(|p| p.used_percent).unwrap_or(0.0),
        secondary_used_percent: secondary.as_ref().map(|s| s.used_percent),
        secondary_reset_at: secondary.as_ref().and_then(|s| s.reset_at).map(|r| r as f64),
        secondary_capacity_credits: capacity,
        last_selected_at: runtime.last_selected_at,
        last_error_at: runtime.last_error_at,
        error_count: runtime.error_count,
        cooldown_until: runtime.cooldown_until,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::SqliteAccountStore;

    async fn test_facade() -> (Facade, Arc<dyn AccountStorePort>) {
        let store: Arc<dyn AccountStorePort> = Arc::new(SqliteAccountStore::open_in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let cryptor = Arc::new(TokenCryptor::load_or_generate(dir.path().join("key.bin")).await.unwrap());
        let http_client = reqwest::Client::new();
        let endpoints = OAuthEndpoints {
            client_id: "client".into(),
            redirect_uri: "https://gateway.test/callback".into(),
            authorize_endpoint: "https://chatgpt.test/oauth/authorize".into(),
            token_endpoint: "https://chatgpt.test/oauth/token".into(),
            scopes: "offline_access".into(),
        };
        let config = FacadeConfig {
            usage_refresh_enabled: false,
            ..FacadeConfig::default()
        };
        let facade = Facade::new(store.clone(), cryptor, http_client, endpoints, config);
        (facade, store)
    }

    fn sample_account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            chatgpt_account_id: None,
            email: format!("{id}@example.com"),
            plan_type: "pro".to_string(),
            access_token_encrypted: vec![1],
            refresh_token_encrypted: vec![2],
            id_token_encrypted: vec![3],
            last_refresh: 1_700_000_000,
            status: AccountStatus::Active,
            deactivation_reason: None,
            reset_at: None,
        }
    }

    #[tokio::test]
    async fn pinned_accounts_are_read_from_dynamic_settings() {
        let (facade, store) = test_facade().await;
        store.upsert(sample_account("pinned")).await.unwrap();
        store.upsert(sample_account("unpinned")).await.unwrap();
        store
            .save_settings(DashboardSettings {
                pinned_account_ids: vec!["pinned".to_string()],
                prefer_earlier_reset: false,
            })
            .await
            .unwrap();

        let outcome = facade.select_account(None, false, 1_700_000_100).await.unwrap();
        assert_eq!(outcome.account.unwrap().id, "pinned");
    }

    #[tokio::test]
    async fn dashboard_edit_to_pinned_accounts_takes_effect_after_invalidate() {
        let (facade, store) = test_facade().await;
        store.upsert(sample_account("a")).await.unwrap();
        store.upsert(sample_account("b")).await.unwrap();

        let first = facade.select_account(None, false, 1_700_000_100).await.unwrap();
        assert!(first.account.is_some());

        store
            .save_settings(DashboardSettings {
                pinned_account_ids: vec!["b".to_string()],
                prefer_earlier_reset: false,
            })
            .await
            .unwrap();
        facade.invalidate_snapshot().await;

        let second = facade.select_account(None, false, 1_700_000_101).await.unwrap();
        assert_eq!(second.account.unwrap().id, "b");
    }

    #[tokio::test]
    async fn secondary_exhaustion_reset_at_survives_reconciliation_and_recovers() {
        let (facade, store) = test_facade().await;
        store.upsert(sample_account("only")).await.unwrap();
        // First sighting of an exhausted secondary window: neither the
        // account row nor the runtime state carries a `reset_at` of its
        // own, so only `fold_secondary_quota`'s derived value does.
        store
            .record_usage_snapshot(store::UsageSnapshot {
                account_id: "only".to_string(),
                window: Window::Secondary,
                used_percent: 100.0,
                reset_at: None,
                window_minutes: None,
                credits_has: None,
                credits_unlimited: None,
                credits_balance: None,
                recorded_at: 1_700_000_000,
            })
            .await
            .unwrap();

        let blocked = facade.select_account(None, false, 1_700_000_100).await.unwrap();
        assert!(blocked.account.is_none(), "account must be excluded while secondary window is exhausted");

        let persisted = store.list_accounts().await.unwrap().into_iter().next().unwrap();
        assert!(
            persisted.reset_at.is_some(),
            "the folded reset_at must be persisted, not discarded by reconciliation"
        );

        // The secondary window has since genuinely reset (a fresh, lower
        // usage sample), so `fold_secondary_quota` no longer touches status
        // or reset_at; recovery now depends entirely on the persisted
        // durable reset_at from the first pass.
        store
            .record_usage_snapshot(store::UsageSnapshot {
                account_id: "only".to_string(),
                window: Window::Secondary,
                used_percent: 10.0,
                reset_at: None,
                window_minutes: None,
                credits_has: None,
                credits_unlimited: None,
                credits_balance: None,
                recorded_at: 1_700_000_200,
            })
            .await
            .unwrap();

        let recovered = facade
            .select_account(None, false, persisted.reset_at.unwrap() + 1)
            .await
            .unwrap();
        assert_eq!(
            recovered.account.unwrap().id,
            "only",
            "account must recover once the persisted reset_at has passed"
        );
    }

    #[test]
    fn sticky_map_evicts_least_recently_used() {
        let mut sticky = StickyMap::new(2);
        sticky.insert("a".into(), "acc-a".into());
        sticky.insert("b".into(), "acc-b".into());
        sticky.insert("c".into(), "acc-c".into());
        assert_eq!(sticky.map.len(), 2);
        assert!(sticky.get("a").is_none());
        assert!(sticky.get("b").is_some());
        assert!(sticky.get("c").is_some());
    }

    #[test]
    fn sticky_map_get_refreshes_recency() {
        let mut sticky = StickyMap::new(2);
        sticky.insert("a".into(), "acc-a".into());
        sticky.insert("b".into(), "acc-b".into());
        sticky.get("a");
        sticky.insert("c".into(), "acc-c".into());
        // "b" was least recently used after touching "a", so it gets evicted.
        assert!(sticky.get("b").is_none());
        assert!(sticky.get("a").is_some());
        assert!(sticky.get("c").is_some());
    }

    #[test]
    fn reconcile_prefers_later_boundary_when_both_live() {
        assert_eq!(reconcile_reset_at(Some(2000.0), Some(1500), 1000), Some(2000.0));
        assert_eq!(reconcile_reset_at(Some(1500.0), Some(2000), 1000), Some(2000.0));
    }

    #[test]
    fn reconcile_drops_expired_runtime_value() {
        assert_eq!(reconcile_reset_at(Some(500.0), Some(2000), 1000), Some(2000.0));
    }

    #[test]
    fn reconcile_falls_back_to_whichever_source_is_present() {
        assert_eq!(reconcile_reset_at(None, Some(2000), 1000), Some(2000.0));
        assert_eq!(reconcile_reset_at(Some(2000.0), None, 1000), Some(2000.0));
        assert_eq!(reconcile_reset_at(None, None, 1000), None);
    }

    #[test]
    fn fold_secondary_quota_overrides_active_status() {
        let mut state = AccountState {
            id: "a".into(),
            email: "a@example.com".into(),
            plan_type: "pro".into(),
            status: AccountStatus::Active,
            deactivation_reason: None,
            reset_at: None,
            primary_used_percent: 10.0,
            secondary_used_percent: Some(100.0),
            secondary_reset_at: Some(5000.0),
            secondary_capacity_credits: 1000.0,
            last_selected_at: None,
            last_error_at: None,
            error_count: 0,
            cooldown_until: None,
        };
        fold_secondary_quota(&mut state, 1000);
        assert_eq!(state.status, AccountStatus::QuotaExceeded);
        assert_eq!(state.reset_at, Some(5000.0));
    }

    #[test]
    fn fold_secondary_quota_leaves_deactivated_alone() {
        let mut state = AccountState {
            id: "a".into(),
            email: "a@example.com".into(),
            plan_type: "pro".into(),
            status: AccountStatus::Deactivated,
            deactivation_reason: Some("gone".into()),
            reset_at: None,
            primary_used_percent: 0.0,
            secondary_used_percent: Some(100.0),
            secondary_reset_at: Some(5000.0),
            secondary_capacity_credits: 1000.0,
            last_selected_at: None,
            last_error_at: None,
            error_count: 0,
            cooldown_until: None,
        };
        fold_secondary_quota(&mut state, 1000);
        assert_eq!(state.status, AccountStatus::Deactivated);
    }
}

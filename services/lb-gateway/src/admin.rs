//! Admin API for account management (spec §6's operator-facing surface).
//!
//! Runs on a separate listener from the proxy (the gateway's
//! `admin_listen_addr`) and provides the OAuth login flow that seeds new
//! accounts, account listing/removal, pool status, and the
//! `dashboard_settings` singleton (pinned accounts, prefer-earlier-reset).
//!
//! Endpoints:
//! - GET    /admin/accounts              — list accounts, never tokens
//! - POST   /admin/accounts/init-oauth   — start PKCE flow, return auth URL
//! - POST   /admin/accounts/complete-oauth — exchange code, seed account
//! - DELETE /admin/accounts/{id}         — deactivate an account
//! - GET    /admin/pool                  — pool status summary
//! - GET    /admin/settings              — read dashboard settings
//! - PUT    /admin/settings              — write dashboard settings

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use auth::claims::{decode_id_token_claims, generate_unique_account_id};
use auth::pkce::{build_authorization_url, compute_challenge, generate_verifier};
use store::{Account, AccountStatus, AccountStorePort, DashboardSettings, Window};

use crate::state::{GatewayState, now_secs};

/// In-memory PKCE state for an in-progress OAuth flow, keyed by an opaque
/// CSRF `state` token handed back by the authorization server.
struct PkceEntry {
    verifier: String,
    created_at: Instant,
}

const PKCE_EXPIRY_SECS: u64 = 600;

#[derive(Clone)]
pub struct AdminState {
    gateway: GatewayState,
    pkce_states: std::sync::Arc<Mutex<HashMap<String, PkceEntry>>>,
}

impl AdminState {
    pub fn new(gateway: GatewayState) -> Self {
        Self {
            gateway,
            pkce_states: std::sync::Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts))
        .route("/admin/accounts/init-oauth", post(init_oauth))
        .route("/admin/accounts/complete-oauth", post(complete_oauth))
        .route("/admin/accounts/{id}", delete(delete_account))
        .route("/admin/pool", get(pool_status))
        .route("/admin/settings", get(get_settings).put(put_settings))
        .with_state(state)
}

fn account_summary(account: &Account) -> serde_json::Value {
    serde_json::json!({
        "id": account.id,
        "email": account.email,
        "plan_type": account.plan_type,
        "status": account.status.as_str(),
        "chatgpt_account_id": account.chatgpt_account_id,
        "deactivation_reason": account.deactivation_reason,
        "reset_at": account.reset_at,
        "last_refresh": account.last_refresh,
    })
}

/// GET /admin/accounts — list all accounts. Never exposes encrypted tokens.
async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    match state.gateway.store.list_accounts().await {
        Ok(accounts) => {
            let accounts: Vec<_> = accounts.iter().map(account_summary).collect();
            (StatusCode::OK, axum::Json(serde_json::json!({ "accounts": accounts }))).into_response()
        }
        Err(err) => {
            warn!(error = %err, "failed to list accounts");
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(serde_json::json!({ "error": err.to_string() })))
                .into_response()
        }
    }
}

/// POST /admin/accounts/init-oauth — generate a PKCE pair and the
/// authorization URL the operator opens in a browser.
async fn init_oauth(State(state): State<AdminState>) -> impl IntoResponse {
    let verifier = generate_verifier();
    let challenge = compute_challenge(&verifier);
    let csrf_state = uuid::Uuid::new_v4().to_string();
    let authorization_url = build_authorization_url(&state.gateway.endpoints, &csrf_state, &challenge);

    let mut states = state.pkce_states.lock().await;
    states.retain(|_, entry| entry.created_at.elapsed().as_secs() < PKCE_EXPIRY_SECS);
    states.insert(
        csrf_state.clone(),
        PkceEntry {
            verifier,
            created_at: Instant::now(),
        },
    );

    info!("PKCE flow initiated");
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "authorization_url": authorization_url,
            "state": csrf_state,
        })),
    )
}

#[derive(Deserialize)]
struct CompleteOAuthRequest {
    state: String,
    code: String,
}

/// POST /admin/accounts/complete-oauth — exchange the authorization code for
/// tokens and upsert the resulting account.
async fn complete_oauth(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CompleteOAuthRequest>,
) -> impl IntoResponse {
    let entry = {
        let mut states = state.pkce_states.lock().await;
        states.remove(&body.state)
    };
    let Some(entry) = entry else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "error": "no pending OAuth flow for this state (expired or not initiated)" })),
        );
    };
    if entry.created_at.elapsed() > Duration::from_secs(PKCE_EXPIRY_SECS) {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "error": "PKCE state expired, please re-initiate with init-oauth" })),
        );
    }

    let result = match auth::exchange_code(&state.gateway.http_client, &state.gateway.endpoints, &body.code, &entry.verifier).await {
        Ok(result) => result,
        Err(err) => {
            warn!(error = %err, "token exchange failed");
            return (
                StatusCode::BAD_GATEWAY,
                axum::Json(serde_json::json!({ "error": format!("token exchange failed: {err}") })),
            );
        }
    };

    let claims = decode_id_token_claims(&result.id_token);
    let email = result.email.clone().or_else(|| claims.email.clone()).unwrap_or_default();
    let chatgpt_account_id = result
        .chatgpt_account_id
        .clone()
        .or_else(|| claims.chatgpt_account_id().map(str::to_string));
    let upstream_account_id = chatgpt_account_id.as_deref().unwrap_or(&email);
    let account_id = generate_unique_account_id(upstream_account_id, &email);

    let access_token_encrypted = match state.gateway.cryptor.encrypt(&result.access_token) {
        Ok(v) => v,
        Err(err) => return encryption_failed(err),
    };
    let refresh_token_encrypted = match state.gateway.cryptor.encrypt(&result.refresh_token) {
        Ok(v) => v,
        Err(err) => return encryption_failed(err),
    };
    let id_token_encrypted = match state.gateway.cryptor.encrypt(&result.id_token) {
        Ok(v) => v,
        Err(err) => return encryption_failed(err),
    };

    let account = Account {
        id: account_id.clone(),
        chatgpt_account_id,
        email: email.clone(),
        plan_type: result.plan_type.unwrap_or_else(|| "unknown".to_string()),
        access_token_encrypted,
        refresh_token_encrypted,
        id_token_encrypted,
        last_refresh: now_secs(),
        status: AccountStatus::Active,
        deactivation_reason: None,
        reset_at: None,
    };

    if let Err(err) = state.gateway.store.upsert(account).await {
        warn!(account_id, error = %err, "failed to persist new account");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(serde_json::json!({ "error": format!("failed to store account: {err}") })),
        );
    }
    state.gateway.facade.invalidate_snapshot().await;

    info!(account_id, email, "OAuth flow completed, account added to pool");
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({ "account_id": account_id, "email": email, "status": "added" })),
    )
}

fn encryption_failed(err: auth::Error) -> (StatusCode, axum::Json<serde_json::Value>) {
    warn!(error = %err, "failed to encrypt token");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(serde_json::json!({ "error": format!("failed to encrypt token: {err}") })),
    )
}

/// DELETE /admin/accounts/{id} — deactivate the account. Operators
/// re-authenticate via `init-oauth`/`complete-oauth` to bring it back.
async fn delete_account(State(state): State<AdminState>, Path(id): Path<String>) -> impl IntoResponse {
    match state
        .gateway
        .store
        .update_status(&id, AccountStatus::Deactivated, Some("removed by operator".to_string()))
        .await
    {
        Ok(()) => {}
        Err(store::Error::NotFound(_)) => {
            return (
                StatusCode::NOT_FOUND,
                axum::Json(serde_json::json!({ "error": format!("no such account: {id}") })),
            );
        }
        Err(err) => {
            warn!(account_id = id, error = %err, "failed to deactivate account");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({ "error": err.to_string() })),
            );
        }
    }
    state.gateway.facade.invalidate_snapshot().await;
    info!(account_id = id, "account deactivated");
    (StatusCode::OK, axum::Json(serde_json::json!({ "account_id": id, "status": "deactivated" })))
}

/// GET /admin/pool — per-status account counts plus each account's latest
/// recorded usage. A read-only summary; it never mutates runtime state the
/// way `Facade::select_account` does, so it's safe to poll frequently.
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    let accounts = match state.gateway.store.list_accounts().await {
        Ok(accounts) => accounts,
        Err(err) => {
            warn!(error = %err, "failed to list accounts for pool status");
            return (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(serde_json::json!({ "error": err.to_string() })))
                .into_response();
        }
    };

    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    let mut entries = Vec::with_capacity(accounts.len());
    for account in &accounts {
        *counts.entry(account.status.as_str()).or_insert(0) += 1;
        let primary = state
            .gateway
            .store
            .latest_usage_snapshot(&account.id, Window::Primary)
            .await
            .ok()
            .flatten();
        let secondary = state
            .gateway
            .store
            .latest_usage_snapshot(&account.id, Window::Secondary)
            .await
            .ok()
            .flatten();
        entries.push(serde_json::json!({
            "account": account_summary(account),
            "primary_used_percent": primary.as_ref().map(|s| s.used_percent),
            "secondary_used_percent": secondary.as_ref().map(|s| s.used_percent),
        }));
    }

    (StatusCode::OK, axum::Json(serde_json::json!({ "counts": counts, "accounts": entries }))).into_response()
}

/// GET /admin/settings — the `dashboard_settings` singleton.
async fn get_settings(State(state): State<AdminState>) -> impl IntoResponse {
    match state.gateway.store.load_settings().await {
        Ok(settings) => (StatusCode::OK, axum::Json(serde_json::to_value(settings).unwrap())).into_response(),
        Err(err) => {
            warn!(error = %err, "failed to load settings");
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(serde_json::json!({ "error": err.to_string() })))
                .into_response()
        }
    }
}

/// PUT /admin/settings — replace pinned accounts / prefer-earlier-reset.
/// The facade reads both fields from this row on every pick, so updating it
/// here and invalidating the cached snapshot makes the change effective on
/// the very next selection.
async fn put_settings(State(state): State<AdminState>, axum::Json(settings): axum::Json<DashboardSettings>) -> impl IntoResponse {
    if let Err(err) = state.gateway.store.save_settings(settings).await {
        warn!(error = %err, "failed to save settings");
        return (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(serde_json::json!({ "error": err.to_string() })))
            .into_response();
    }
    state.gateway.facade.invalidate_snapshot().await;
    (StatusCode::NO_CONTENT, ()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth::{OAuthEndpoints, TokenCryptor};
    use axum::body::Body;
    use axum::http::Request;
    use pool::{Facade, FacadeConfig};
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use store::SqliteAccountStore;
    use tower::ServiceExt;

    fn test_endpoints() -> OAuthEndpoints {
        OAuthEndpoints {
            client_id: "client-123".into(),
            redirect_uri: "https://gateway.test/callback".into(),
            authorize_endpoint: "https://chatgpt.test/oauth/authorize".into(),
            token_endpoint: "https://chatgpt.test/oauth/token".into(),
            scopes: "offline_access".into(),
        }
    }

    async fn test_admin_state() -> AdminState {
        let store: Arc<dyn AccountStorePort> = Arc::new(SqliteAccountStore::open_in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let cryptor = Arc::new(TokenCryptor::load_or_generate(dir.path().join("key.bin")).await.unwrap());
        let http_client = reqwest::Client::new();
        let endpoints = test_endpoints();
        let facade = Arc::new(Facade::new(
            store.clone(),
            cryptor.clone(),
            http_client.clone(),
            endpoints.clone(),
            FacadeConfig::default(),
        ));
        AdminState::new(GatewayState {
            facade,
            store,
            cryptor,
            http_client,
            endpoints,
            responses_url: "https://chatgpt.test/backend-api/codex/responses".to_string(),
            static_headers: vec![],
            proactive_refresh_minutes: 50,
            requests_total: Arc::new(AtomicU64::new(0)),
        })
    }

    #[tokio::test]
    async fn list_accounts_empty_store() {
        let state = test_admin_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(Request::builder().uri("/admin/accounts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn init_oauth_returns_authorization_url_and_state() {
        let state = test_admin_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts/init-oauth")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["authorization_url"].as_str().unwrap().contains("code_challenge="));
        assert!(json["state"].as_str().is_some());
    }

    #[tokio::test]
    async fn complete_oauth_rejects_unknown_state() {
        let state = test_admin_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts/complete-oauth")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"state":"unknown","code":"abc"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_account_reports_not_found_for_unknown_id() {
        let state = test_admin_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/admin/accounts/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let state = test_admin_state().await;
        let app = build_admin_router(state);

        let put_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/admin/settings")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"pinned_account_ids":["acc-1"],"prefer_earlier_reset":true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(put_response.status(), StatusCode::NO_CONTENT);

        let get_response = app
            .oneshot(Request::builder().uri("/admin/settings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(get_response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(get_response.into_body(), 1024 * 1024).await.unwrap();
        let settings: DashboardSettings = serde_json::from_slice(&body).unwrap();
        assert_eq!(settings.pinned_account_ids, vec!["acc-1".to_string()]);
        assert!(settings.prefer_earlier_reset);
    }

    #[tokio::test]
    async fn pool_status_reports_counts() {
        let state = test_admin_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(Request::builder().uri("/admin/pool").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

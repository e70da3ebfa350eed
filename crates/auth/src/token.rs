//! Token refresh against the upstream OAuth endpoint, the proactive-refresh
//! policy, and permanent-failure classification (spec §4.3).

use serde::Deserialize;
use tracing::{info, warn};

use crate::claims::decode_id_token_claims;
use crate::cryptor::TokenCryptor;
use crate::error::{Error, PermanentFailureCode, RefreshError, Result};
use crate::oauth_config::OAuthEndpoints;
use store::{Account, AccountStatus, AccountStorePort};

/// Successful refresh outcome (spec §4.3).
#[derive(Debug, Clone)]
pub struct TokenRefreshResult {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: String,
    pub email: Option<String>,
    pub plan_type: Option<String>,
    pub chatgpt_account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    access_token: String,
    refresh_token: String,
    id_token: String,
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    plan_type: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshErrorBody {
    #[serde(default)]
    error: Option<String>,
}

/// Exchange a PKCE authorization code for the initial token set. Used once
/// per login by the OAuth login UI (an external collaborator); the result
/// is handed to the Account Store as a brand-new account.
pub async fn exchange_code(
    client: &reqwest::Client,
    endpoints: &OAuthEndpoints,
    code: &str,
    verifier: &str,
) -> Result<TokenRefreshResult> {
    let response = client
        .post(&endpoints.token_endpoint)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", verifier),
            ("client_id", endpoints.client_id.as_str()),
            ("redirect_uri", endpoints.redirect_uri.as_str()),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let raw: RawTokenResponse = response
        .json()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))?;

    Ok(TokenRefreshResult {
        access_token: raw.access_token,
        refresh_token: raw.refresh_token,
        id_token: raw.id_token,
        email: raw.email,
        plan_type: raw.plan_type,
        chatgpt_account_id: raw.account_id,
    })
}

/// Call the upstream refresh endpoint. Permanent failures (the closed set
/// of five codes) are classified and wrapped in `RefreshError::permanent`;
/// anything else is `RefreshError::transient`.
pub async fn refresh(
    client: &reqwest::Client,
    endpoints: &OAuthEndpoints,
    refresh_token: &str,
) -> std::result::Result<TokenRefreshResult, RefreshError> {
    let response = client
        .post(&endpoints.token_endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", endpoints.client_id.as_str()),
        ])
        .send()
        .await
        .map_err(|e| RefreshError::transient(format!("refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(match classify_refresh_failure(status.as_u16(), &body) {
            Some(code) => RefreshError::permanent(code),
            None => RefreshError::transient(format!("refresh endpoint returned {status}: {body}")),
        });
    }

    let raw: RawTokenResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::transient(format!("invalid refresh response: {e}")))?;

    Ok(TokenRefreshResult {
        access_token: raw.access_token,
        refresh_token: raw.refresh_token,
        id_token: raw.id_token,
        email: raw.email,
        plan_type: raw.plan_type,
        chatgpt_account_id: raw.account_id,
    })
}

/// Classify a failed refresh response into one of the closed set of
/// permanent codes, or `None` if it's transient. A bare `401` with no
/// recognizable error body is still treated as `refresh_token_expired` —
/// the refresh token itself was rejected even if the upstream didn't name
/// a specific reason.
fn classify_refresh_failure(status: u16, body: &str) -> Option<PermanentFailureCode> {
    let code_str = serde_json::from_str::<RefreshErrorBody>(body)
        .ok()
        .and_then(|b| b.error);
    if let Some(code) = code_str.as_deref().and_then(PermanentFailureCode::from_str) {
        return Some(code);
    }
    if status == 401 {
        return Some(PermanentFailureCode::RefreshTokenExpired);
    }
    None
}

/// Policy: refresh proactively once the last successful refresh is more
/// than `proactive_minutes` old.
pub fn should_refresh(last_refresh: i64, now: i64, proactive_minutes: i64) -> bool {
    now - last_refresh >= proactive_minutes * 60
}

/// Ensure an account's access token is fresh, refreshing it if `force` or
/// the proactive policy says so. On success, lazily backfills
/// `chatgpt_account_id` from the id-token claims when it was missing, and
/// persists the new tokens (and any backfilled fields) to the store. On a
/// permanent failure, deactivates the account with the keyed message and
/// returns the error — the caller must not retry this account.
#[allow(clippy::too_many_arguments)]
pub async fn ensure_fresh(
    store: &dyn AccountStorePort,
    cryptor: &TokenCryptor,
    client: &reqwest::Client,
    endpoints: &OAuthEndpoints,
    account: &Account,
    now: i64,
    proactive_minutes: i64,
    force: bool,
) -> Result<Account> {
    if !force && !should_refresh(account.last_refresh, now, proactive_minutes) {
        return Ok(account.clone());
    }

    let refresh_token = cryptor.decrypt(&account.refresh_token_encrypted)?;
    let result = match refresh(client, endpoints, &refresh_token).await {
        Ok(r) => r,
        Err(err) => {
            if let Some(code) = err.code {
                warn!(
                    account_id = %account.id,
                    code = code.as_str(),
                    "token refresh permanently failed, deactivating account"
                );
                store
                    .update_status(
                        &account.id,
                        AccountStatus::Deactivated,
                        Some(code.message().to_string()),
                    )
                    .await?;
            }
            return Err(Error::Refresh(err));
        }
    };

    let chatgpt_account_id = account.chatgpt_account_id.clone().or_else(|| {
        result.chatgpt_account_id.clone().or_else(|| {
            decode_id_token_claims(&result.id_token)
                .chatgpt_account_id()
                .map(str::to_string)
        })
    });

    let access_encrypted = cryptor.encrypt(&result.access_token)?;
    let refresh_encrypted = cryptor.encrypt(&result.refresh_token)?;
    let id_encrypted = cryptor.encrypt(&result.id_token)?;

    store
        .update_tokens(
            &account.id,
            access_encrypted.clone(),
            refresh_encrypted.clone(),
            id_encrypted.clone(),
            now,
            result.plan_type.clone(),
            result.email.clone(),
            chatgpt_account_id.clone(),
        )
        .await?;

    info!(account_id = %account.id, "token refresh succeeded");

    let mut updated = account.clone();
    updated.access_token_encrypted = access_encrypted;
    updated.refresh_token_encrypted = refresh_encrypted;
    updated.id_token_encrypted = id_encrypted;
    updated.last_refresh = now;
    if let Some(plan) = result.plan_type {
        updated.plan_type = plan;
    }
    if let Some(email) = result.email {
        updated.email = email;
    }
    updated.chatgpt_account_id = chatgpt_account_id;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_refresh_true_past_threshold() {
        assert!(should_refresh(0, 600, 10));
    }

    #[test]
    fn should_refresh_false_within_threshold() {
        assert!(!should_refresh(0, 59, 10));
    }

    #[test]
    fn classifies_known_permanent_codes() {
        let body = r#"{"error":"refresh_token_reused"}"#;
        assert_eq!(
            classify_refresh_failure(400, body),
            Some(PermanentFailureCode::RefreshTokenReused)
        );
    }

    #[test]
    fn classifies_account_suspended() {
        let body = r#"{"error":"account_suspended"}"#;
        assert_eq!(
            classify_refresh_failure(403, body),
            Some(PermanentFailureCode::AccountSuspended)
        );
    }

    #[test]
    fn unrecognized_401_defaults_to_expired() {
        assert_eq!(
            classify_refresh_failure(401, "not json"),
            Some(PermanentFailureCode::RefreshTokenExpired)
        );
    }

    #[test]
    fn transient_5xx_has_no_code() {
        assert_eq!(classify_refresh_failure(503, "upstream unavailable"), None);
    }

    #[test]
    fn unrecognized_code_on_400_is_transient() {
        assert_eq!(classify_refresh_failure(400, r#"{"error":"weird_code"}"#), None);
    }

    #[test]
    fn permanent_failure_code_roundtrips_through_strings() {
        for code in [
            PermanentFailureCode::RefreshTokenExpired,
            PermanentFailureCode::RefreshTokenReused,
            PermanentFailureCode::RefreshTokenInvalidated,
            PermanentFailureCode::AccountSuspended,
            PermanentFailureCode::AccountDeleted,
        ] {
            assert_eq!(PermanentFailureCode::from_str(code.as_str()), Some(code));
        }
    }
}

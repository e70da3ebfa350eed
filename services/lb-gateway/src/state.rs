//! Shared application state handed to both the proxy router and the admin
//! router: the facade, the store and cryptor the proxy needs to resolve a
//! selected account's credentials, and the bits of configuration the HTTP
//! surface reads directly rather than through the facade.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use auth::{OAuthEndpoints, TokenCryptor};
use pool::Facade;
use provider::HeaderInjection;
use store::AccountStorePort;

#[derive(Clone)]
pub struct GatewayState {
    pub facade: Arc<Facade>,
    pub store: Arc<dyn AccountStorePort>,
    pub cryptor: Arc<TokenCryptor>,
    pub http_client: reqwest::Client,
    pub endpoints: OAuthEndpoints,
    pub responses_url: String,
    pub static_headers: Vec<HeaderInjection>,
    pub proactive_refresh_minutes: i64,
    pub requests_total: Arc<AtomicU64>,
}

pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

pub async fn find_account(
    store: &dyn AccountStorePort,
    id: &str,
) -> store::Result<Option<store::Account>> {
    let accounts = store.list_accounts().await?;
    Ok(accounts.into_iter().find(|a| a.id == id))
}

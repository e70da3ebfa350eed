//! OAuth endpoint configuration for the upstream service's device-code /
//! browser PKCE login flow.
//!
//! Unlike a single-vendor OAuth client, this gateway is upstream-agnostic:
//! the endpoints, client id, redirect uri, and scopes are supplied by
//! configuration rather than hardcoded, so the balancer core never owns
//! the identity of the upstream it logs an account into.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthEndpoints {
    pub client_id: String,
    pub redirect_uri: String,
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    #[serde(default = "default_scopes")]
    pub scopes: String,
}

fn default_scopes() -> String {
    "offline_access".to_string()
}

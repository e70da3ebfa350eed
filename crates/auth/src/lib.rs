//! Credential model, PKCE login helpers, id-token claim extraction, the
//! Token Cryptor, and token refresh / permanent-failure classification
//! (spec §3, §4.1, §4.3).
//!
//! This crate is upstream-agnostic and has no dependency on the gateway
//! binary — it can be tested and used independently. The OAuth login UI
//! itself (device-code polling, browser redirect handling) is an external
//! collaborator (spec §1); this crate only provides the primitives that
//! collaborator and the core both need: PKCE generation, the authorization
//! URL, code exchange, and proactive refresh.

pub mod claims;
pub mod cryptor;
pub mod error;
pub mod oauth_config;
pub mod pkce;
pub mod token;

pub use claims::{IdTokenClaims, decode_id_token_claims, generate_unique_account_id};
pub use cryptor::TokenCryptor;
pub use error::{Error, PermanentFailureCode, RefreshError, Result};
pub use oauth_config::OAuthEndpoints;
pub use pkce::{build_authorization_url, compute_challenge, generate_verifier};
pub use token::{TokenRefreshResult, ensure_fresh, exchange_code, refresh, should_refresh};

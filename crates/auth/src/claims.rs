//! Id-token claim extraction and stable account-id derivation (spec §3, §6).
//!
//! Claims are read from the base64url-decoded middle segment of a
//! JWT-shaped string; decoding failures yield an empty claims object, never
//! an error — the caller treats a missing claim as "not backfilled yet",
//! not as a fatal condition.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// The subset of id-token claims this gateway cares about. Unknown fields
/// are ignored; absent fields are `None`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdTokenClaims {
    #[serde(rename = "https://api.openai.com/auth", default)]
    pub auth: Option<AuthClaim>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthClaim {
    pub chatgpt_account_id: Option<String>,
}

impl IdTokenClaims {
    pub fn chatgpt_account_id(&self) -> Option<&str> {
        self.auth.as_ref()?.chatgpt_account_id.as_deref()
    }
}

/// Decode the claims segment of a JWT-shaped string. Returns an empty
/// claims object on any parse failure rather than propagating an error —
/// backfilling `chatgpt_account_id` is best-effort.
pub fn decode_id_token_claims(id_token: &str) -> IdTokenClaims {
    let Some(payload) = id_token.split('.').nth(1) else {
        return IdTokenClaims::default();
    };
    let Ok(decoded) = URL_SAFE_NO_PAD.decode(payload) else {
        return IdTokenClaims::default();
    };
    serde_json::from_slice(&decoded).unwrap_or_default()
}

/// Derive the stable, globally unique account id from the upstream account
/// id plus a hash of the email (spec §3: "two logins with different
/// mailboxes but the same upstream id do not collide").
pub fn generate_unique_account_id(upstream_account_id: &str, email: &str) -> String {
    let email_hash = Sha256::digest(email.trim().to_lowercase().as_bytes());
    let email_hash_hex: String = email_hash.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{upstream_account_id}-{email_hash_hex}")
}

//! Keyed fingerprints for logging a stable, non-reversible stand-in for an
//! account identifier (e.g. an email) without leaking the raw value.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Truncated hex HMAC-SHA256 of `value` under `key`. `hex_len` is the number
/// of hex characters kept (clamped to the digest's 64-char hex length).
pub fn hmac_fingerprint(key: &[u8], value: &str, hex_len: usize) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(value.as_bytes());
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex.chars().take(hex_len.min(hex.len())).collect()
}

//! Configuration types and loading (spec §9's single typed settings object).
//!
//! A single TOML file, loaded once at startup and handed down behind an
//! `Arc` — no global mutable config state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use auth::OAuthEndpoints;
use pool::mutators::EscalationConfig;
use pool::model::TierWeights;
use provider::HeaderInjection;
use serde::Deserialize;

/// Root configuration (spec §9: `{usage_refresh_enabled,
/// usage_refresh_interval_seconds, encryption_key_file, upstream_base_url,
/// snapshot_ttl_seconds, tier_weights, tier_capacity_credits,
/// prefer_earlier_reset}`, plus the listen addresses, the store path, the
/// pinned account list, and the escalation thresholds spec §9 leaves open).
#[derive(Debug, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub admin_listen_addr: SocketAddr,

    pub store_path: PathBuf,
    pub encryption_key_file: PathBuf,

    pub upstream_base_url: String,
    #[serde(default = "default_usage_path")]
    pub usage_path: String,
    #[serde(default = "default_responses_path")]
    pub responses_path: String,

    pub oauth: OAuthEndpoints,

    #[serde(default)]
    pub headers: Vec<HeaderInjection>,

    #[serde(default = "default_true")]
    pub usage_refresh_enabled: bool,
    #[serde(default = "default_usage_refresh_interval")]
    pub usage_refresh_interval_seconds: i64,
    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_seconds: i64,
    #[serde(default = "default_proactive_refresh_minutes")]
    pub proactive_refresh_minutes: i64,

    #[serde(default)]
    pub tier_weights: TierWeightsConfig,
    #[serde(default = "pool::model::default_tier_capacities")]
    pub tier_capacity_credits: HashMap<String, f64>,
    #[serde(default)]
    pub prefer_earlier_reset: bool,

    #[serde(default)]
    pub pinned_account_ids: Vec<String>,
    #[serde(default = "default_sticky_map_capacity")]
    pub sticky_map_capacity: usize,

    #[serde(default = "default_escalate_after_seconds")]
    pub usage_limit_escalate_after_seconds: f64,
    #[serde(default = "default_initial_cooldown_cap_seconds")]
    pub usage_limit_initial_cooldown_cap_seconds: f64,

    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

/// Serde-friendly mirror of `pool::model::TierWeights` (which doesn't derive
/// `Deserialize` since it's a pure-core type with no I/O concerns).
#[derive(Debug, Clone, Deserialize)]
pub struct TierWeightsConfig {
    #[serde(default = "default_pro_weight")]
    pub pro: f64,
    #[serde(default = "default_plus_weight")]
    pub plus: f64,
    #[serde(default = "default_free_weight")]
    pub free: f64,
}

impl Default for TierWeightsConfig {
    fn default() -> Self {
        Self {
            pro: default_pro_weight(),
            plus: default_plus_weight(),
            free: default_free_weight(),
        }
    }
}

impl From<TierWeightsConfig> for TierWeights {
    fn from(c: TierWeightsConfig) -> Self {
        TierWeights {
            pro: c.pro,
            plus: c.plus,
            free: c.free,
        }
    }
}

fn default_pro_weight() -> f64 {
    TierWeights::default().pro
}
fn default_plus_weight() -> f64 {
    TierWeights::default().plus
}
fn default_free_weight() -> f64 {
    TierWeights::default().free
}
fn default_true() -> bool {
    true
}
fn default_usage_refresh_interval() -> i64 {
    60
}
fn default_snapshot_ttl() -> i64 {
    5
}
fn default_proactive_refresh_minutes() -> i64 {
    50
}
fn default_sticky_map_capacity() -> usize {
    10_000
}
fn default_escalate_after_seconds() -> f64 {
    300.0
}
fn default_initial_cooldown_cap_seconds() -> f64 {
    300.0
}
fn default_upstream_timeout_secs() -> u64 {
    120
}
fn default_usage_path() -> String {
    "/backend-api/codex/usage".to_string()
}
fn default_responses_path() -> String {
    "/backend-api/codex/responses".to_string()
}

impl Config {
    /// Load and parse the TOML configuration file at `path`.
    pub fn load(path: &Path) -> common::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| common::Error::Config(format!("invalid configuration: {e}")))?;
        Ok(config)
    }

    /// Resolve the configuration file path: an explicit `--config` CLI flag,
    /// falling back to the `LB_GATEWAY_CONFIG` environment variable, then
    /// `./config.toml`.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("LB_GATEWAY_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("config.toml")
    }

    pub fn usage_url(&self) -> String {
        format!("{}{}", self.upstream_base_url.trim_end_matches('/'), self.usage_path)
    }

    pub fn responses_url(&self) -> String {
        format!("{}{}", self.upstream_base_url.trim_end_matches('/'), self.responses_path)
    }

    pub fn escalation(&self) -> EscalationConfig {
        EscalationConfig {
            escalate_after_seconds: self.usage_limit_escalate_after_seconds,
            initial_cooldown_cap_seconds: self.usage_limit_initial_cooldown_cap_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let (_dir, path) = write_config(
            r#"
            listen_addr = "0.0.0.0:8080"
            admin_listen_addr = "127.0.0.1:9090"
            store_path = "accounts.db"
            encryption_key_file = "key.bin"
            upstream_base_url = "https://chatgpt.com"

            [oauth]
            client_id = "client-123"
            redirect_uri = "https://gateway.test/callback"
            authorize_endpoint = "https://chatgpt.com/oauth/authorize"
            token_endpoint = "https://chatgpt.com/oauth/token"
            "#,
        );
        let config = Config::load(&path).unwrap();
        assert!(config.usage_refresh_enabled);
        assert_eq!(config.usage_refresh_interval_seconds, 60);
        assert_eq!(config.snapshot_ttl_seconds, 5);
        assert_eq!(config.tier_capacity_credits.get("pro"), Some(&1000.0));
        assert_eq!(config.usage_url(), "https://chatgpt.com/backend-api/codex/usage");
        assert_eq!(
            config.responses_url(),
            "https://chatgpt.com/backend-api/codex/responses"
        );
    }

    #[test]
    fn rejects_invalid_toml() {
        let (_dir, path) = write_config("not valid toml {{{");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn resolve_path_prefers_cli_flag() {
        let resolved = Config::resolve_path(Some("/etc/lb-gateway/config.toml"));
        assert_eq!(resolved, PathBuf::from("/etc/lb-gateway/config.toml"));
    }
}

//! Account Store — the abstract repository the core depends on (spec §4.2).
//!
//! Persistence technology is irrelevant to the pure balancer logic and the
//! facade; both depend only on the `AccountStorePort` trait. `sqlite`
//! provides the one concrete implementation carried in this workspace,
//! matching spec §6's described schema (`accounts`, `usage_history`,
//! `dashboard_settings`).

pub mod error;
pub mod model;
pub mod sqlite;

pub use error::{Error, Result};
pub use model::{Account, AccountStatus, DashboardSettings, UsageSnapshot, Window};
pub use sqlite::SqliteAccountStore;

use async_trait::async_trait;

/// Minimum contract the core depends on (spec §4.2). All operations are
/// atomic per row; the core tolerates eventual visibility across concurrent
/// calls by re-reading before each selection.
#[async_trait]
pub trait AccountStorePort: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<Account>>;

    async fn upsert(&self, account: Account) -> Result<()>;

    async fn update_status(
        &self,
        id: &str,
        status: AccountStatus,
        deactivation_reason: Option<String>,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn update_tokens(
        &self,
        id: &str,
        access_token_encrypted: Vec<u8>,
        refresh_token_encrypted: Vec<u8>,
        id_token_encrypted: Vec<u8>,
        last_refresh: i64,
        plan_type: Option<String>,
        email: Option<String>,
        chatgpt_account_id: Option<String>,
    ) -> Result<()>;

    async fn update_reset_at(&self, id: &str, reset_at: Option<i64>) -> Result<()>;

    /// Append a usage snapshot row for `(window, account_id)`.
    async fn record_usage_snapshot(&self, snapshot: UsageSnapshot) -> Result<()>;

    /// Most recent snapshot for `(account_id, window)`, if any.
    async fn latest_usage_snapshot(
        &self,
        account_id: &str,
        window: Window,
    ) -> Result<Option<UsageSnapshot>>;

    async fn load_settings(&self) -> Result<DashboardSettings>;

    async fn save_settings(&self, settings: DashboardSettings) -> Result<()>;
}

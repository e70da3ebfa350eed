//! SQLite-backed `AccountStorePort`.
//!
//! A single `rusqlite::Connection` guarded by a `tokio::sync::Mutex`,
//! mirroring the single-lock-guards-shared-state pattern the rest of this
//! workspace uses for its runtime maps (spec §5: "the store session is not
//! safe for concurrent mutation"). `rusqlite` is synchronous; call sites are
//! already on the core's single serialized store-access path (selection,
//! usage refresh, token refresh never run concurrently against the same
//! account), so holding the lock across a blocking call is the honest
//! model of the resource rather than a leaky abstraction over one.

use crate::error::{Error, Result};
use crate::model::{Account, AccountStatus, DashboardSettings, UsageSnapshot, Window};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

pub struct SqliteAccountStore {
    conn: Mutex<Connection>,
}

impl SqliteAccountStore {
    /// Open (creating if absent) the database at `path` and ensure the
    /// schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .expect("sqlite open task panicked")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    chatgpt_account_id TEXT,
    email TEXT NOT NULL,
    plan_type TEXT NOT NULL,
    access_token_encrypted BLOB NOT NULL,
    refresh_token_encrypted BLOB NOT NULL,
    id_token_encrypted BLOB NOT NULL,
    last_refresh INTEGER NOT NULL,
    status TEXT NOT NULL,
    deactivation_reason TEXT,
    reset_at INTEGER
);

CREATE TABLE IF NOT EXISTS usage_history (
    window TEXT NOT NULL,
    account_id TEXT NOT NULL,
    used_percent REAL NOT NULL,
    reset_at INTEGER,
    window_minutes INTEGER,
    credits_has INTEGER,
    credits_unlimited INTEGER,
    credits_balance REAL,
    recorded_at INTEGER NOT NULL,
    PRIMARY KEY (window, account_id, recorded_at DESC)
);

CREATE TABLE IF NOT EXISTS dashboard_settings (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    pinned_account_ids TEXT NOT NULL DEFAULT '[]',
    prefer_earlier_reset INTEGER NOT NULL DEFAULT 0
);
"#;

fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
    let status_str: String = row.get("status")?;
    Ok(Account {
        id: row.get("id")?,
        chatgpt_account_id: row.get("chatgpt_account_id")?,
        email: row.get("email")?,
        plan_type: row.get("plan_type")?,
        access_token_encrypted: row.get("access_token_encrypted")?,
        refresh_token_encrypted: row.get("refresh_token_encrypted")?,
        id_token_encrypted: row.get("id_token_encrypted")?,
        last_refresh: row.get("last_refresh")?,
        status: AccountStatus::from_str(&status_str).unwrap_or(AccountStatus::Deactivated),
        deactivation_reason: row.get("deactivation_reason")?,
        reset_at: row.get("reset_at")?,
    })
}

#[async_trait]
impl crate::AccountStorePort for SqliteAccountStore {
    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM accounts")?;
        let rows = stmt.query_map([], row_to_account)?;
        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    }

    async fn upsert(&self, account: Account) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO accounts (id, chatgpt_account_id, email, plan_type,
                access_token_encrypted, refresh_token_encrypted, id_token_encrypted,
                last_refresh, status, deactivation_reason, reset_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                chatgpt_account_id = excluded.chatgpt_account_id,
                email = excluded.email,
                plan_type = excluded.plan_type,
                access_token_encrypted = excluded.access_token_encrypted,
                refresh_token_encrypted = excluded.refresh_token_encrypted,
                id_token_encrypted = excluded.id_token_encrypted,
                last_refresh = excluded.last_refresh,
                status = excluded.status,
                deactivation_reason = excluded.deactivation_reason,
                reset_at = excluded.reset_at",
            params![
                account.id,
                account.chatgpt_account_id,
                account.email,
                account.plan_type,
                account.access_token_encrypted,
                account.refresh_token_encrypted,
                account.id_token_encrypted,
                account.last_refresh,
                account.status.as_str(),
                account.deactivation_reason,
                account.reset_at,
            ],
        )?;
        debug!(account_id = %account.id, "upserted account");
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: AccountStatus,
        deactivation_reason: Option<String>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE accounts SET status = ?1, deactivation_reason = ?2 WHERE id = ?3",
            params![status.as_str(), deactivation_reason, id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

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
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE accounts SET
                access_token_encrypted = ?1,
                refresh_token_encrypted = ?2,
                id_token_encrypted = ?3,
                last_refresh = ?4,
                plan_type = COALESCE(?5, plan_type),
                email = COALESCE(?6, email),
                chatgpt_account_id = COALESCE(?7, chatgpt_account_id)
             WHERE id = ?8",
            params![
                access_token_encrypted,
                refresh_token_encrypted,
                id_token_encrypted,
                last_refresh,
                plan_type,
                email,
                chatgpt_account_id,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_reset_at(&self, id: &str, reset_at: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE accounts SET reset_at = ?1 WHERE id = ?2",
            params![reset_at, id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn record_usage_snapshot(&self, snapshot: UsageSnapshot) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO usage_history (window, account_id, used_percent, reset_at,
                window_minutes, credits_has, credits_unlimited, credits_balance, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                snapshot.window.as_str(),
                snapshot.account_id,
                snapshot.used_percent,
                snapshot.reset_at,
                snapshot.window_minutes,
                snapshot.credits_has,
                snapshot.credits_unlimited,
                snapshot.credits_balance,
                snapshot.recorded_at,
            ],
        )?;
        Ok(())
    }

    async fn latest_usage_snapshot(
        &self,
        account_id: &str,
        window: Window,
    ) -> Result<Option<UsageSnapshot>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM usage_history WHERE window = ?1 AND account_id = ?2
             ORDER BY recorded_at DESC LIMIT 1",
            params![window.as_str(), account_id],
            |row| {
                Ok(UsageSnapshot {
                    account_id: row.get("account_id")?,
                    window,
                    used_percent: row.get("used_percent")?,
                    reset_at: row.get("reset_at")?,
                    window_minutes: row.get("window_minutes")?,
                    credits_has: row.get("credits_has")?,
                    credits_unlimited: row.get("credits_unlimited")?,
                    credits_balance: row.get("credits_balance")?,
                    recorded_at: row.get("recorded_at")?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    async fn load_settings(&self) -> Result<DashboardSettings> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT pinned_account_ids, prefer_earlier_reset FROM dashboard_settings WHERE id = 0",
                [],
                |row| {
                    let pinned_json: String = row.get(0)?;
                    let prefer: i64 = row.get(1)?;
                    Ok((pinned_json, prefer != 0))
                },
            )
            .optional()?;

        match row {
            Some((pinned_json, prefer_earlier_reset)) => {
                let pinned_account_ids = serde_json::from_str(&pinned_json)
                    .map_err(|e| Error::Serialize(e.to_string()))?;
                Ok(DashboardSettings {
                    pinned_account_ids,
                    prefer_earlier_reset,
                })
            }
            None => Ok(DashboardSettings::default()),
        }
    }

    async fn save_settings(&self, settings: DashboardSettings) -> Result<()> {
        let conn = self.conn.lock().await;
        let pinned_json = serde_json::to_string(&settings.pinned_account_ids)
            .map_err(|e| Error::Serialize(e.to_string()))?;
        conn.execute(
            "INSERT INTO dashboard_settings (id, pinned_account_ids, prefer_earlier_reset)
             VALUES (0, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                pinned_account_ids = excluded.pinned_account_ids,
                prefer_earlier_reset = excluded.prefer_earlier_reset",
            params![pinned_json, settings.prefer_earlier_reset as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccountStorePort;

    fn sample_account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            chatgpt_account_id: None,
            email: format!("{id}@example.com"),
            plan_type: "plus".to_string(),
            access_token_encrypted: vec![1, 2, 3],
            refresh_token_encrypted: vec![4, 5, 6],
            id_token_encrypted: vec![7, 8, 9],
            last_refresh: 1_700_000_000,
            status: AccountStatus::Active,
            deactivation_reason: None,
            reset_at: None,
        }
    }

    #[tokio::test]
    async fn upsert_then_list_roundtrips() {
        let store = SqliteAccountStore::open_in_memory().await.unwrap();
        store.upsert(sample_account("acc-1")).await.unwrap();
        let accounts = store.list_accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "acc-1");
        assert_eq!(accounts[0].status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_conflict() {
        let store = SqliteAccountStore::open_in_memory().await.unwrap();
        store.upsert(sample_account("acc-1")).await.unwrap();
        let mut updated = sample_account("acc-1");
        updated.email = "new@example.com".to_string();
        store.upsert(updated).await.unwrap();

        let accounts = store.list_accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].email, "new@example.com");
    }

    #[tokio::test]
    async fn update_status_sets_deactivation_reason() {
        let store = SqliteAccountStore::open_in_memory().await.unwrap();
        store.upsert(sample_account("acc-1")).await.unwrap();
        store
            .update_status(
                "acc-1",
                AccountStatus::Deactivated,
                Some("Account has been suspended".to_string()),
            )
            .await
            .unwrap();

        let accounts = store.list_accounts().await.unwrap();
        assert_eq!(accounts[0].status, AccountStatus::Deactivated);
        assert_eq!(
            accounts[0].deactivation_reason.as_deref(),
            Some("Account has been suspended")
        );
    }

    #[tokio::test]
    async fn update_status_on_missing_account_errors() {
        let store = SqliteAccountStore::open_in_memory().await.unwrap();
        let result = store
            .update_status("missing", AccountStatus::Deactivated, None)
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn usage_snapshot_latest_returns_most_recent() {
        let store = SqliteAccountStore::open_in_memory().await.unwrap();
        store.upsert(sample_account("acc-1")).await.unwrap();

        for (used_percent, recorded_at) in [(10.0, 100), (20.0, 200), (15.0, 150)] {
            store
                .record_usage_snapshot(UsageSnapshot {
                    account_id: "acc-1".to_string(),
                    window: Window::Primary,
                    used_percent,
                    reset_at: None,
                    window_minutes: Some(60),
                    credits_has: None,
                    credits_unlimited: None,
                    credits_balance: None,
                    recorded_at,
                })
                .await
                .unwrap();
        }

        let latest = store
            .latest_usage_snapshot("acc-1", Window::Primary)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.recorded_at, 200);
        assert_eq!(latest.used_percent, 20.0);
    }

    #[tokio::test]
    async fn settings_default_when_unset() {
        let store = SqliteAccountStore::open_in_memory().await.unwrap();
        let settings = store.load_settings().await.unwrap();
        assert!(settings.pinned_account_ids.is_empty());
        assert!(!settings.prefer_earlier_reset);
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let store = SqliteAccountStore::open_in_memory().await.unwrap();
        store
            .save_settings(DashboardSettings {
                pinned_account_ids: vec!["acc-1".to_string(), "acc-2".to_string()],
                prefer_earlier_reset: true,
            })
            .await
            .unwrap();

        let settings = store.load_settings().await.unwrap();
        assert_eq!(settings.pinned_account_ids, vec!["acc-1", "acc-2"]);
        assert!(settings.prefer_earlier_reset);
    }
}

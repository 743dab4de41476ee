//! Record status storage: the batch read, single-row write and conditional
//! claim the archive pipeline runs against the record table.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use dap_core::RecordId;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "dap-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid SQL identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("status store unavailable: {0}")]
    Unavailable(String),
}

/// Identifiers read by one eligibility query. Rows whose identifier could not
/// be decoded are dropped and counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EligibleBatch {
    pub ids: Vec<RecordId>,
    pub skipped_rows: usize,
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// All identifiers whose status column equals `status`.
    async fn select_by_status(&self, status: &str) -> Result<EligibleBatch, StoreError>;

    /// Unconditional single-row status write.
    async fn set_status(&self, id: &RecordId, status: &str) -> Result<(), StoreError>;

    /// Conditional write that only applies while the row still holds `from`.
    /// Returns `false` when the row was not in `from`, which means another
    /// worker already owns it.
    async fn claim(&self, id: &RecordId, from: &str, to: &str) -> Result<bool, StoreError>;
}

/// Table and column names of the record table. Names are spliced into SQL, so
/// they are restricted to `[A-Za-z0-9_]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTable {
    table: String,
    id_column: String,
    status_column: String,
}

impl Default for RecordTable {
    fn default() -> Self {
        Self {
            table: "vtiger_potential".to_string(),
            id_column: "potentialid".to_string(),
            status_column: "archive_status".to_string(),
        }
    }
}

pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

impl RecordTable {
    pub fn new(
        table: impl Into<String>,
        id_column: impl Into<String>,
        status_column: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let table = table.into();
        let id_column = id_column.into();
        let status_column = status_column.into();
        for name in [&table, &id_column, &status_column] {
            validate_identifier(name)?;
        }
        Ok(Self {
            table,
            id_column,
            status_column,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn select_sql(&self) -> String {
        format!(
            "SELECT CAST(`{id}` AS CHAR) AS record_id FROM `{table}` WHERE `{status}` = ?",
            id = self.id_column,
            table = self.table,
            status = self.status_column,
        )
    }

    pub fn update_sql(&self) -> String {
        format!(
            "UPDATE `{table}` SET `{status}` = ? WHERE `{id}` = ?",
            id = self.id_column,
            table = self.table,
            status = self.status_column,
        )
    }

    pub fn claim_sql(&self) -> String {
        format!(
            "UPDATE `{table}` SET `{status}` = ? WHERE `{id}` = ? AND `{status}` = ?",
            id = self.id_column,
            table = self.table,
            status = self.status_column,
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// MySQL-backed status store. The pool is shared by every concurrent unit;
/// row-level atomicity of single UPDATE statements is the only locking.
#[derive(Debug, Clone)]
pub struct MySqlStatusStore {
    pool: MySqlPool,
    table: RecordTable,
    select_sql: String,
    update_sql: String,
    claim_sql: String,
}

impl MySqlStatusStore {
    pub fn new(pool: MySqlPool, table: RecordTable) -> Self {
        Self {
            select_sql: table.select_sql(),
            update_sql: table.update_sql(),
            claim_sql: table.claim_sql(),
            pool,
            table,
        }
    }

    pub async fn connect(
        options: MySqlConnectOptions,
        settings: PoolSettings,
        table: RecordTable,
    ) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(options)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        debug!(table = table.table(), "connected status store");
        Ok(Self::new(pool, table))
    }
}

#[async_trait]
impl StatusStore for MySqlStatusStore {
    async fn select_by_status(&self, status: &str) -> Result<EligibleBatch, StoreError> {
        let rows = sqlx::query(&self.select_sql)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;

        let mut batch = EligibleBatch::default();
        for row in rows {
            match row.try_get::<String, _>("record_id") {
                Ok(id) => batch.ids.push(RecordId::from(id)),
                Err(err) => {
                    warn!(error = %err, table = self.table.table(), "skipping unreadable record row");
                    batch.skipped_rows += 1;
                }
            }
        }
        Ok(batch)
    }

    async fn set_status(&self, id: &RecordId, status: &str) -> Result<(), StoreError> {
        sqlx::query(&self.update_sql)
            .bind(status)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim(&self, id: &RecordId, from: &str, to: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(&self.claim_sql)
            .bind(to)
            .bind(id.as_str())
            .bind(from)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<RecordId, String>,
    unreadable_rows: Vec<String>,
    history: Vec<(RecordId, String)>,
    fail_reads: bool,
    fail_writes: HashSet<(RecordId, String)>,
}

/// In-process status store with fault injection for tests.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    state: Mutex<MemoryState>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: impl Into<RecordId>, status: &str) {
        let mut state = self.state.lock().await;
        state.rows.insert(id.into(), status.to_string());
    }

    /// Adds a row in `status` whose identifier cannot be decoded.
    pub async fn insert_unreadable(&self, status: &str) {
        self.state.lock().await.unreadable_rows.push(status.to_string());
    }

    pub async fn status_of(&self, id: &RecordId) -> Option<String> {
        self.state.lock().await.rows.get(id).cloned()
    }

    /// Every successful write, in the order it was applied.
    pub async fn history(&self) -> Vec<(RecordId, String)> {
        self.state.lock().await.history.clone()
    }

    pub async fn fail_reads(&self, fail: bool) {
        self.state.lock().await.fail_reads = fail;
    }

    /// Makes every write (plain or conditional) of `status` to `id` fail.
    pub async fn fail_write(&self, id: impl Into<RecordId>, status: &str) {
        self.state
            .lock()
            .await
            .fail_writes
            .insert((id.into(), status.to_string()));
    }

    fn check_write(state: &MemoryState, id: &RecordId, status: &str) -> Result<(), StoreError> {
        if state.fail_writes.contains(&(id.clone(), status.to_string())) {
            return Err(StoreError::Unavailable(format!(
                "write of {status:?} to {id} rejected"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn select_by_status(&self, status: &str) -> Result<EligibleBatch, StoreError> {
        let state = self.state.lock().await;
        if state.fail_reads {
            return Err(StoreError::Unavailable("read rejected".to_string()));
        }
        let ids = state
            .rows
            .iter()
            .filter(|(_, s)| s.as_str() == status)
            .map(|(id, _)| id.clone())
            .collect();
        let skipped_rows = state
            .unreadable_rows
            .iter()
            .filter(|s| s.as_str() == status)
            .count();
        Ok(EligibleBatch { ids, skipped_rows })
    }

    async fn set_status(&self, id: &RecordId, status: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_write(&state, id, status)?;
        if let Some(current) = state.rows.get_mut(id) {
            *current = status.to_string();
            state.history.push((id.clone(), status.to_string()));
        }
        Ok(())
    }

    async fn claim(&self, id: &RecordId, from: &str, to: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Self::check_write(&state, id, to)?;
        match state.rows.get_mut(id) {
            Some(current) if current.as_str() == from => {
                *current = to.to_string();
                state.history.push((id.clone(), to.to_string()));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_table_rejects_unsafe_identifiers() {
        assert!(RecordTable::new("vtiger_potential", "potentialid", "archive_status").is_ok());
        assert!(matches!(
            RecordTable::new("deals; DROP TABLE x", "id", "status"),
            Err(StoreError::InvalidIdentifier(name)) if name == "deals; DROP TABLE x"
        ));
        assert!(RecordTable::new("deals", "", "status").is_err());
        assert!(RecordTable::new("deals", "id", "status`").is_err());
    }

    #[test]
    fn generated_sql_uses_placeholders_for_values() {
        let table = RecordTable::default();
        assert_eq!(
            table.select_sql(),
            "SELECT CAST(`potentialid` AS CHAR) AS record_id FROM `vtiger_potential` WHERE `archive_status` = ?"
        );
        assert_eq!(
            table.update_sql(),
            "UPDATE `vtiger_potential` SET `archive_status` = ? WHERE `potentialid` = ?"
        );
        assert_eq!(
            table.claim_sql(),
            "UPDATE `vtiger_potential` SET `archive_status` = ? WHERE `potentialid` = ? AND `archive_status` = ?"
        );
    }

    #[tokio::test]
    async fn memory_store_selects_by_status_and_counts_unreadable_rows() {
        let store = MemoryStatusStore::new();
        store.insert("a", "pending").await;
        store.insert("b", "archived").await;
        store.insert("c", "pending").await;
        store.insert_unreadable("pending").await;

        let batch = store.select_by_status("pending").await.expect("select");
        assert_eq!(batch.ids, vec![RecordId::from("a"), RecordId::from("c")]);
        assert_eq!(batch.skipped_rows, 1);
    }

    #[tokio::test]
    async fn claim_only_applies_while_row_holds_expected_status() {
        let store = MemoryStatusStore::new();
        let id = RecordId::from("a");
        store.insert(id.clone(), "pending").await;

        assert!(store.claim(&id, "pending", "archiving").await.expect("first claim"));
        assert!(!store.claim(&id, "pending", "archiving").await.expect("second claim"));
        assert_eq!(store.status_of(&id).await.as_deref(), Some("archiving"));
        assert!(!store
            .claim(&RecordId::from("missing"), "pending", "archiving")
            .await
            .expect("missing claim"));
    }

    #[tokio::test]
    async fn injected_faults_surface_as_errors_without_mutating() {
        let store = MemoryStatusStore::new();
        let id = RecordId::from("a");
        store.insert(id.clone(), "archiving").await;
        store.fail_write("a", "error").await;
        store.fail_reads(true).await;

        assert!(store.select_by_status("pending").await.is_err());
        assert!(store.set_status(&id, "error").await.is_err());
        assert_eq!(store.status_of(&id).await.as_deref(), Some("archiving"));
        assert!(store.history().await.is_empty());
    }
}

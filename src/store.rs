//! Analytical store access.
//!
//! Re-indexing reads the raw source tables (`audit_logs`, `k8s_events`) with
//! deterministic composite-cursor pagination. The activities table itself is
//! written by the external ingest sink; nothing here mutates stored rows.

use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};

/* ============================= CONFIG ============================= */

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            url: "http://127.0.0.1:8123".to_string(),
            database: "activity".to_string(),
            user: None,
            password: None,
        }
    }
}

/* ============================= ROWS ============================= */

/// One raw source record: the ingest timestamp, the record's unique id
/// (audit ID or event UID) and the original JSON payload.
#[derive(Debug, Clone, Row, Serialize, Deserialize, PartialEq)]
pub struct SourceRow {
    #[serde(with = "clickhouse::serde::chrono::datetime64::micros")]
    pub timestamp: DateTime<Utc>,
    pub id: String,
    pub data: String,
}

/// Composite pagination cursor over `(timestamp, id)`.
///
/// Strictly increasing across pages, which makes replays deterministic even
/// when many rows share a timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub id: String,
}

impl Cursor {
    pub fn from_row(row: &SourceRow) -> Self {
        Cursor {
            timestamp: row.timestamp,
            id: row.id.clone(),
        }
    }
}

/// The two source tables, replayed audit-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTable {
    AuditLogs,
    K8sEvents,
}

impl SourceTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            SourceTable::AuditLogs => "audit_logs",
            SourceTable::K8sEvents => "k8s_events",
        }
    }
}

/* ============================= READER SEAM ============================= */

/// Read access the re-index engine needs.
///
/// Backed by ClickHouse in production and by in-memory fixtures in tests.
#[async_trait::async_trait]
pub trait SourceReader: Send + Sync {
    async fn count_window(
        &self,
        table: SourceTable,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn fetch_page(
        &self,
        table: SourceTable,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cursor: Option<&Cursor>,
        limit: u64,
    ) -> Result<Vec<SourceRow>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(String),
}

/* ============================= CLICKHOUSE ============================= */

pub struct ActivityStore {
    client: Client,
}

impl ActivityStore {
    pub fn connect(config: &StoreConfig) -> Self {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);
        if let Some(user) = &config.user {
            client = client.with_user(user);
        }
        if let Some(password) = &config.password {
            client = client.with_password(password);
        }
        ActivityStore { client }
    }

    /// Cheap connectivity probe.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let _: u8 = self
            .client
            .query("SELECT 1")
            .fetch_one()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SourceReader for ActivityStore {
    async fn count_window(
        &self,
        table: SourceTable,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT count() FROM {} \
             WHERE timestamp >= fromUnixTimestamp64Micro(?) \
               AND timestamp < fromUnixTimestamp64Micro(?)",
            table.table_name()
        );
        self.client
            .query(&sql)
            .bind(start.timestamp_micros())
            .bind(end.timestamp_micros())
            .fetch_one()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn fetch_page(
        &self,
        table: SourceTable,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cursor: Option<&Cursor>,
        limit: u64,
    ) -> Result<Vec<SourceRow>, StoreError> {
        let rows = match cursor {
            Some(cursor) => {
                let sql = format!(
                    "SELECT ?fields FROM {} \
                     WHERE timestamp >= fromUnixTimestamp64Micro(?) \
                       AND timestamp < fromUnixTimestamp64Micro(?) \
                       AND (timestamp, id) > (fromUnixTimestamp64Micro(?), ?) \
                     ORDER BY timestamp, id \
                     LIMIT ?",
                    table.table_name()
                );
                self.client
                    .query(&sql)
                    .bind(start.timestamp_micros())
                    .bind(end.timestamp_micros())
                    .bind(cursor.timestamp.timestamp_micros())
                    .bind(&cursor.id)
                    .bind(limit)
                    .fetch_all::<SourceRow>()
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT ?fields FROM {} \
                     WHERE timestamp >= fromUnixTimestamp64Micro(?) \
                       AND timestamp < fromUnixTimestamp64Micro(?) \
                     ORDER BY timestamp, id \
                     LIMIT ?",
                    table.table_name()
                );
                self.client
                    .query(&sql)
                    .bind(start.timestamp_micros())
                    .bind(end.timestamp_micros())
                    .bind(limit)
                    .fetch_all::<SourceRow>()
                    .await
            }
        };

        rows.map_err(|e| StoreError::Query(e.to_string()))
    }
}

/* ============================= TESTS ============================= */

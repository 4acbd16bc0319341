//! Upload ledger for Uplink
//!
//! Append-mostly audit record of every packet the pipeline has touched, keyed
//! by `packet_id`. The primary key is the only mechanism that makes duplicate
//! commit attempts harmless: recording a terminal status twice is a no-op.
//!
//! # Usage
//!
//! ```rust,ignore
//! use uplink_ledger::{UploadLedger, UploadLogEntry};
//! use uplink_protocol::PacketStatus;
//!
//! let ledger = UploadLedger::open("uplink_ledger.sqlite3").await?;
//! let entry = UploadLogEntry::for_packet(&packet, PacketStatus::Committed).with_attempts(1);
//! if ledger.record(&entry).await?.is_applied() {
//!     metrics.inc_packets_committed();
//! }
//! ```

mod error;
mod ledger;
mod schema;
mod types;

pub use error::{LedgerError, Result};
pub use types::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 5;

/// Handle to the ledger database. Cheap to clone.
#[derive(Clone)]
pub struct UploadLedger {
    pool: SqlitePool,
}

impl UploadLedger {
    /// Open or create a ledger at the given path. Creates tables if missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.ensure_schema().await?;

        info!(path = %path.display(), "Upload ledger opened");
        Ok(ledger)
    }

    /// Private in-memory ledger (tests, dry runs).
    ///
    /// Pinned to a single connection that never expires; every new
    /// connection to `:memory:` would otherwise see an empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    /// Escape hatch for ad-hoc queries. Prefer the typed methods.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Round-trip to the database (health probe).
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl UploadLedger {
    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_database() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("nested").join("ledger.sqlite3");

        let ledger = UploadLedger::open(&db_path).await.unwrap();
        assert!(db_path.exists());
        ledger.ping().await.unwrap();
        ledger.close().await;
    }

    #[tokio::test]
    async fn test_in_memory_ledger_survives_across_calls() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        ledger.ping().await.unwrap();
        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.total, 0);
    }
}

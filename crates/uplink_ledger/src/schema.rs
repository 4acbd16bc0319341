//! Ledger schema. All CREATE TABLE statements live here.

use crate::error::Result;
use crate::UploadLedger;
use tracing::debug;

impl UploadLedger {
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        // One row per packet. packet_json is kept only while the packet is
        // non-terminal, so it can be replayed after a restart.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS upload_log (
                packet_id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                destination TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                timestamp INTEGER NOT NULL,
                packet_json TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS dead_letter (
                packet_id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                destination TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                attempt_count INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                retry_history TEXT NOT NULL,
                packet_json TEXT NOT NULL,
                reason TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_upload_log_status ON upload_log(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dead_letter_timestamp ON dead_letter(timestamp)")
            .execute(&self.pool)
            .await?;

        debug!("Ledger schema verified");
        Ok(())
    }
}

//! Ledger operations: idempotent upserts, dead-lettering, recovery.

use crate::error::{LedgerError, Result};
use crate::types::*;
use crate::UploadLedger;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};
use tracing::{debug, warn};
use uplink_protocol::{DataPacket, PacketStatus};

/// Upsert that never touches a row already in a terminal state.
const UPSERT_SQL: &str = r#"
    INSERT INTO upload_log
        (packet_id, source, destination, status, error_message, attempt_count, timestamp, packet_json)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(packet_id) DO UPDATE SET
        status = excluded.status,
        error_message = COALESCE(excluded.error_message, upload_log.error_message),
        attempt_count = MAX(upload_log.attempt_count, excluded.attempt_count),
        timestamp = excluded.timestamp,
        packet_json = CASE
            WHEN excluded.status IN ('COMMITTED', 'DEAD_LETTER') THEN NULL
            ELSE COALESCE(excluded.packet_json, upload_log.packet_json)
        END
    WHERE upload_log.status NOT IN ('COMMITTED', 'DEAD_LETTER')
"#;

async fn upsert<'e, E>(
    executor: E,
    entry: &UploadLogEntry,
    packet_json: Option<String>,
) -> Result<RecordOutcome>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let packet_json = if entry.status.is_terminal() {
        None
    } else {
        packet_json
    };

    let result = sqlx::query(UPSERT_SQL)
        .bind(&entry.packet_id)
        .bind(&entry.source)
        .bind(entry.destination.as_str())
        .bind(entry.status.as_str())
        .bind(entry.error_message.as_deref())
        .bind(i64::from(entry.attempt_count))
        .bind(entry.timestamp.timestamp_millis())
        .bind(packet_json)
        .execute(executor)
        .await?;

    Ok(if result.rows_affected() > 0 {
        RecordOutcome::Applied
    } else {
        RecordOutcome::AlreadyTerminal
    })
}

impl UploadLedger {
    // ========================================================================
    // Upload log
    // ========================================================================

    /// Record the latest state of a packet.
    ///
    /// Idempotent: once a packet is COMMITTED or DEAD_LETTER, further calls
    /// return [`RecordOutcome::AlreadyTerminal`] and change nothing.
    pub async fn record(&self, entry: &UploadLogEntry) -> Result<RecordOutcome> {
        let outcome = upsert(&self.pool, entry, None).await?;
        debug!(
            packet_id = %entry.packet_id,
            status = %entry.status,
            attempts = entry.attempt_count,
            applied = outcome.is_applied(),
            "Ledger record"
        );
        Ok(outcome)
    }

    /// Like [`record`](Self::record), but also keeps the serialized packet
    /// while it is non-terminal so it can be recovered after a restart.
    pub async fn record_packet(
        &self,
        packet: &DataPacket,
        entry: &UploadLogEntry,
    ) -> Result<RecordOutcome> {
        let packet_json = serde_json::to_string(packet)?;
        upsert(&self.pool, entry, Some(packet_json)).await
    }

    pub async fn is_committed(&self, packet_id: &str) -> Result<bool> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM upload_log WHERE packet_id = ?")
                .bind(packet_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status.as_deref() == Some(PacketStatus::Committed.as_str()))
    }

    pub async fn get(&self, packet_id: &str) -> Result<Option<UploadLogEntry>> {
        let row = sqlx::query("SELECT * FROM upload_log WHERE packet_id = ?")
            .bind(packet_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_entry).transpose()
    }

    /// Packets that never reached a terminal state (PENDING, IN_FLIGHT,
    /// RETRY_WAIT), oldest first. Rows whose stored packet cannot be decoded
    /// are logged and skipped.
    pub async fn recoverable(&self) -> Result<Vec<DataPacket>> {
        let rows = sqlx::query(
            r#"
            SELECT packet_id, packet_json FROM upload_log
            WHERE status IN ('PENDING', 'IN_FLIGHT', 'RETRY_WAIT')
              AND packet_json IS NOT NULL
            ORDER BY timestamp ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut packets = Vec::with_capacity(rows.len());
        for row in rows {
            let packet_id: String = row.try_get("packet_id")?;
            let json: String = row.try_get("packet_json")?;
            match serde_json::from_str::<DataPacket>(&json) {
                Ok(packet) => packets.push(packet),
                Err(err) => warn!(%packet_id, "Skipping unrecoverable ledger row: {}", err),
            }
        }
        Ok(packets)
    }

    // ========================================================================
    // Dead letter
    // ========================================================================

    /// Move a packet to DEAD_LETTER and keep its payload and retry history.
    ///
    /// Runs in one transaction. If the packet is already terminal nothing is
    /// written and [`RecordOutcome::AlreadyTerminal`] is returned.
    pub async fn dead_letter(
        &self,
        entry: &UploadLogEntry,
        reason: DeadLetterReason,
        retry_history: &[RetryAttempt],
        packet: &DataPacket,
    ) -> Result<RecordOutcome> {
        if entry.status != PacketStatus::DeadLetter {
            return Err(LedgerError::invalid_state(format!(
                "dead_letter called with status {} for packet {}",
                entry.status, entry.packet_id
            )));
        }

        let history_json = serde_json::to_string(retry_history)?;
        let packet_json = serde_json::to_string(packet)?;

        let mut tx = self.pool.begin().await?;

        let outcome = upsert(&mut *tx, entry, None).await?;
        if !outcome.is_applied() {
            tx.rollback().await?;
            return Ok(outcome);
        }

        sqlx::query(
            r#"
            INSERT INTO dead_letter
                (packet_id, source, destination, status, error_message, attempt_count,
                 timestamp, retry_history, packet_json, reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(packet_id) DO NOTHING
            "#,
        )
        .bind(&entry.packet_id)
        .bind(&entry.source)
        .bind(entry.destination.as_str())
        .bind(entry.status.as_str())
        .bind(entry.error_message.as_deref())
        .bind(i64::from(entry.attempt_count))
        .bind(entry.timestamp.timestamp_millis())
        .bind(&history_json)
        .bind(&packet_json)
        .bind(reason.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    /// Most recent dead letters first.
    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        let rows = sqlx::query("SELECT * FROM dead_letter ORDER BY timestamp DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_dead_letter).collect()
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub async fn stats(&self) -> Result<LedgerStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total,
                COALESCE(SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END), 0) as pending,
                COALESCE(SUM(CASE WHEN status = 'IN_FLIGHT' THEN 1 ELSE 0 END), 0) as in_flight,
                COALESCE(SUM(CASE WHEN status = 'RETRY_WAIT' THEN 1 ELSE 0 END), 0) as retry_wait,
                COALESCE(SUM(CASE WHEN status = 'COMMITTED' THEN 1 ELSE 0 END), 0) as committed,
                COALESCE(SUM(CASE WHEN status = 'DEAD_LETTER' THEN 1 ELSE 0 END), 0) as dead_letter
            FROM upload_log
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |name: &str| -> Result<u64> { Ok(row.try_get::<i64, _>(name)?.max(0) as u64) };

        Ok(LedgerStats {
            total: count("total")?,
            pending: count("pending")?,
            in_flight: count("in_flight")?,
            retry_wait: count("retry_wait")?,
            committed: count("committed")?,
            dead_letter: count("dead_letter")?,
        })
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<UploadLogEntry> {
    let destination: String = row.try_get("destination")?;
    let status: String = row.try_get("status")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let timestamp: i64 = row.try_get("timestamp")?;

    Ok(UploadLogEntry {
        packet_id: row.try_get("packet_id")?,
        source: row.try_get("source")?,
        destination: destination.parse().map_err(LedgerError::invalid_state)?,
        status: status.parse().map_err(LedgerError::invalid_state)?,
        error_message: row.try_get("error_message")?,
        attempt_count: u32::try_from(attempt_count).map_err(|_| {
            LedgerError::invalid_state(format!("attempt_count out of range: {}", attempt_count))
        })?,
        timestamp: UploadLedger::millis_to_datetime(timestamp),
    })
}

fn row_to_dead_letter(row: &SqliteRow) -> Result<DeadLetterEntry> {
    let reason: String = row.try_get("reason")?;
    let history: String = row.try_get("retry_history")?;
    let packet: String = row.try_get("packet_json")?;

    Ok(DeadLetterEntry {
        entry: row_to_entry(row)?,
        reason: DeadLetterReason::parse(&reason)
            .ok_or_else(|| LedgerError::invalid_state(format!("Unknown reason: {}", reason)))?,
        retry_history: serde_json::from_str(&history)?,
        packet: serde_json::from_str(&packet)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uplink_protocol::{Destination, Priority};

    fn packet(id: &str) -> DataPacket {
        DataPacket::new(
            id,
            "vendor-adapter",
            Destination::ComplianceData,
            br#"{"entity_id":"e1"}"#.to_vec(),
            Priority::Normal,
        )
    }

    async fn upload_log_rows(ledger: &UploadLedger, packet_id: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM upload_log WHERE packet_id = ?")
            .bind(packet_id)
            .fetch_one(ledger.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_committed_twice_is_a_single_row() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let p = packet("comp-1");
        let entry = UploadLogEntry::for_packet(&p, PacketStatus::Committed).with_attempts(1);

        assert_eq!(ledger.record(&entry).await.unwrap(), RecordOutcome::Applied);
        assert_eq!(
            ledger.record(&entry.clone().with_attempts(2)).await.unwrap(),
            RecordOutcome::AlreadyTerminal
        );

        assert_eq!(upload_log_rows(&ledger, "comp-1").await, 1);
        let stored = ledger.get("comp-1").await.unwrap().unwrap();
        assert_eq!(stored.status, PacketStatus::Committed);
        assert_eq!(stored.attempt_count, 1);
        assert!(ledger.is_committed("comp-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_state_is_sticky() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let p = packet("comp-2");

        ledger
            .record(&UploadLogEntry::for_packet(&p, PacketStatus::Committed))
            .await
            .unwrap();
        let outcome = ledger
            .record_packet(&p, &UploadLogEntry::for_packet(&p, PacketStatus::InFlight))
            .await
            .unwrap();

        assert_eq!(outcome, RecordOutcome::AlreadyTerminal);
        assert!(ledger.is_committed("comp-2").await.unwrap());
        assert!(ledger.recoverable().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attempt_count_and_error_are_kept() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let p = packet("comp-3");

        let retry = UploadLogEntry::for_packet(&p, PacketStatus::RetryWait)
            .with_attempts(2)
            .with_error("connection refused");
        ledger.record_packet(&p, &retry).await.unwrap();

        // A later in-flight record without an error keeps the last message.
        let in_flight = UploadLogEntry::for_packet(&p, PacketStatus::InFlight).with_attempts(2);
        ledger.record(&in_flight).await.unwrap();

        let stored = ledger.get("comp-3").await.unwrap().unwrap();
        assert_eq!(stored.status, PacketStatus::InFlight);
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.error_message.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_recoverable_returns_non_terminal_packets() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let a = packet("a");
        let b = packet("b");
        let c = packet("c");

        ledger
            .record_packet(&a, &UploadLogEntry::for_packet(&a, PacketStatus::InFlight))
            .await
            .unwrap();
        ledger
            .record_packet(&b, &UploadLogEntry::for_packet(&b, PacketStatus::Pending))
            .await
            .unwrap();
        ledger
            .record_packet(&c, &UploadLogEntry::for_packet(&c, PacketStatus::InFlight))
            .await
            .unwrap();
        ledger
            .record(&UploadLogEntry::for_packet(&c, PacketStatus::Committed))
            .await
            .unwrap();

        let mut ids: Vec<String> = ledger
            .recoverable()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_dead_letter_keeps_history_and_payload() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let p = packet("dl-1");
        let history = vec![
            RetryAttempt {
                attempt: 1,
                at: Utc::now(),
                error: "timeout".to_string(),
                delay_ms: Some(200),
            },
            RetryAttempt {
                attempt: 2,
                at: Utc::now(),
                error: "timeout".to_string(),
                delay_ms: None,
            },
        ];
        let entry = UploadLogEntry::for_packet(&p, PacketStatus::DeadLetter)
            .with_attempts(2)
            .with_error("timeout");

        let first = ledger
            .dead_letter(&entry, DeadLetterReason::MaxRetriesExceeded, &history, &p)
            .await
            .unwrap();
        let second = ledger
            .dead_letter(&entry, DeadLetterReason::MaxRetriesExceeded, &history, &p)
            .await
            .unwrap();
        assert!(first.is_applied());
        assert_eq!(second, RecordOutcome::AlreadyTerminal);

        let letters = ledger.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::MaxRetriesExceeded);
        assert_eq!(letters[0].retry_history, history);
        assert_eq!(letters[0].packet, p);
        assert_eq!(letters[0].entry.attempt_count, 2);

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_rejects_wrong_status() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let p = packet("dl-2");
        let entry = UploadLogEntry::for_packet(&p, PacketStatus::Committed);
        let err = ledger
            .dead_letter(&entry, DeadLetterReason::PermanentError, &[], &p)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_ledger_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ledger.sqlite3");
        let p = packet("persist-1");

        let ledger = UploadLedger::open(&path).await.unwrap();
        ledger
            .record_packet(&p, &UploadLogEntry::for_packet(&p, PacketStatus::InFlight))
            .await
            .unwrap();
        ledger.close().await;

        let reopened = UploadLedger::open(&path).await.unwrap();
        let recovered = reopened.recoverable().await.unwrap();
        assert_eq!(recovered, vec![p]);
    }
}

//! Ledger row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uplink_protocol::{DataPacket, Destination, PacketStatus};

/// One row of `upload_log`: the latest known state of a packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadLogEntry {
    pub packet_id: String,
    pub source: String,
    pub destination: Destination,
    pub status: PacketStatus,
    pub error_message: Option<String>,
    /// Commit attempts made so far
    pub attempt_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl UploadLogEntry {
    pub fn for_packet(packet: &DataPacket, status: PacketStatus) -> Self {
        Self {
            packet_id: packet.id.clone(),
            source: packet.source.clone(),
            destination: packet.destination,
            status,
            error_message: None,
            attempt_count: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_attempts(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The row was inserted or updated
    Applied,
    /// The row was already COMMITTED or DEAD_LETTER; nothing changed
    AlreadyTerminal,
}

impl RecordOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RecordOutcome::Applied)
    }
}

/// One failed commit attempt, kept in the dead-letter retry history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub error: String,
    /// Backoff scheduled after this attempt (none for the final one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Checksum mismatch or schema violation
    ValidationFailed,
    /// Destination store refused the packet outright
    PermanentError,
    MaxRetriesExceeded,
    /// Pushed out of a full queue by a higher-priority packet
    Displaced,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::ValidationFailed => "validation_failed",
            DeadLetterReason::PermanentError => "permanent_error",
            DeadLetterReason::MaxRetriesExceeded => "max_retries_exceeded",
            DeadLetterReason::Displaced => "displaced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation_failed" => Some(DeadLetterReason::ValidationFailed),
            "permanent_error" => Some(DeadLetterReason::PermanentError),
            "max_retries_exceeded" => Some(DeadLetterReason::MaxRetriesExceeded),
            "displaced" => Some(DeadLetterReason::Displaced),
            _ => None,
        }
    }
}

/// One row of `dead_letter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub entry: UploadLogEntry,
    pub reason: DeadLetterReason,
    pub retry_history: Vec<RetryAttempt>,
    pub packet: DataPacket,
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: u64,
    pub pending: u64,
    pub in_flight: u64,
    pub retry_wait: u64,
    pub committed: u64,
    pub dead_letter: u64,
}

//! Packet validation: checksum, then destination schema.
//!
//! Both failure kinds are permanent. A packet that fails here goes straight
//! to the dead-letter table and is never retried.

use thiserror::Error;
use uplink_protocol::{checksum_matches, DataPacket, Destination};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("checksum_mismatch")]
    InvalidChecksum,

    #[error("schema_violation: {0}")]
    SchemaViolation(String),
}

impl ValidationError {
    /// Text recorded as the ledger `error_message`.
    pub fn ledger_message(&self) -> String {
        self.to_string()
    }
}

/// Fields every payload for a destination must carry.
pub fn required_fields(destination: Destination) -> &'static [&'static str] {
    match destination {
        Destination::ComplianceData => &["entity_id", "policy_id", "status", "reported_at"],
        Destination::MinistryData => &["ministry", "dataset", "published_at", "records"],
        Destination::GenericUploads => &["filename", "content"],
    }
}

/// Stateless validator. Shared by all workers behind an `Arc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationEngine;

impl ValidationEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, packet: &DataPacket) -> Result<(), ValidationError> {
        if !checksum_matches(&packet.payload, &packet.checksum) {
            return Err(ValidationError::InvalidChecksum);
        }
        self.check_schema(packet)
    }

    fn check_schema(&self, packet: &DataPacket) -> Result<(), ValidationError> {
        let value = packet
            .payload_json()
            .map_err(|e| ValidationError::SchemaViolation(format!("payload is not JSON: {}", e)))?;

        let object = value.as_object().ok_or_else(|| {
            ValidationError::SchemaViolation("payload must be a JSON object".to_string())
        })?;

        let missing: Vec<&str> = required_fields(packet.destination)
            .iter()
            .copied()
            .filter(|field| !object.contains_key(*field))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::SchemaViolation(format!(
                "{} missing required fields: {}",
                packet.destination,
                missing.join(", ")
            )))
        }
    }
}

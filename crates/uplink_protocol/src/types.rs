//! Packet types.
//!
//! These are the CANONICAL definitions; the pipeline, the ledger and the HTTP
//! surface all use them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::checksum::payload_checksum;

// ============================================================================
// Priority
// ============================================================================

/// Packet priority. Lower number = more urgent.
///
/// `Ord` follows urgency: `Critical < High < Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Critical = 1,
    High = 2,
    Normal = 3,
}

impl Priority {
    /// All priorities, most urgent first.
    pub const ALL: [Priority; 3] = [Priority::Critical, Priority::High, Priority::Normal];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
        }
    }

    /// Zero-based lane index (critical = 0).
    pub fn lane(self) -> usize {
        self as usize - 1
    }

    pub fn from_lane(lane: usize) -> Option<Self> {
        Self::ALL.get(lane).copied()
    }

    /// Raise urgency by `levels`, saturating at critical.
    pub fn bumped(self, levels: u32) -> Self {
        let lane = (self.lane() as u32).saturating_sub(levels) as usize;
        Self::ALL[lane]
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Critical),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Normal),
            other => Err(format!("invalid priority {} (expected 1, 2 or 3)", other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.as_u8()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "critical" => Ok(Priority::Critical),
            "2" | "high" => Ok(Priority::High),
            "3" | "normal" => Ok(Priority::Normal),
            other => Err(format!("Invalid priority: {}", other)),
        }
    }
}

// ============================================================================
// Packet status
// ============================================================================

/// Lifecycle of a packet.
///
/// ```text
/// PENDING -> IN_FLIGHT -> COMMITTED
///            IN_FLIGHT -> RETRY_WAIT -> IN_FLIGHT
///            IN_FLIGHT -> DEAD_LETTER
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketStatus {
    /// Accepted by a producer, waiting in the queue
    #[default]
    Pending,
    /// Claimed by a worker
    InFlight,
    /// Durably written to its destination
    Committed,
    /// Transient failure, waiting for backoff to elapse
    RetryWait,
    /// Gave up: validation failure, permanent store error or retries exhausted
    DeadLetter,
}

impl PacketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketStatus::Pending => "PENDING",
            PacketStatus::InFlight => "IN_FLIGHT",
            PacketStatus::Committed => "COMMITTED",
            PacketStatus::RetryWait => "RETRY_WAIT",
            PacketStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PacketStatus::Committed | PacketStatus::DeadLetter)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: PacketStatus) -> bool {
        use PacketStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (InFlight, Committed)
                | (InFlight, RetryWait)
                | (InFlight, DeadLetter)
                | (RetryWait, InFlight)
                // Crash recovery puts an unacked packet back in line.
                | (InFlight, Pending)
                | (RetryWait, Pending)
        )
    }
}

impl fmt::Display for PacketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PacketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PacketStatus::Pending),
            "IN_FLIGHT" => Ok(PacketStatus::InFlight),
            "COMMITTED" => Ok(PacketStatus::Committed),
            "RETRY_WAIT" => Ok(PacketStatus::RetryWait),
            "DEAD_LETTER" => Ok(PacketStatus::DeadLetter),
            _ => Err(format!("Invalid packet status: {}", s)),
        }
    }
}

// ============================================================================
// Destination
// ============================================================================

/// Logical upload target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Destination {
    ComplianceData,
    MinistryData,
    GenericUploads,
}

impl Destination {
    pub const ALL: [Destination; 3] = [
        Destination::ComplianceData,
        Destination::MinistryData,
        Destination::GenericUploads,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::ComplianceData => "compliance-data",
            Destination::MinistryData => "ministry-data",
            Destination::GenericUploads => "generic-uploads",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("Unknown destination: {}", s))
    }
}

// ============================================================================
// DataPacket
// ============================================================================

/// The unit of work moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPacket {
    /// Globally unique packet id (idempotency key)
    pub id: String,
    /// Producer identifier (scraper, vendor adapter, feed name)
    pub source: String,
    pub destination: Destination,
    /// Opaque payload bytes; base64 on the wire
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of `payload`, computed by the producer
    pub checksum: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub status: PacketStatus,
    /// Domain key used for shard routing instead of `id` when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_hint: Option<String>,
}

impl DataPacket {
    /// Build a fresh packet, computing its checksum.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        destination: Destination,
        payload: Vec<u8>,
        priority: Priority,
    ) -> Self {
        let checksum = payload_checksum(&payload);
        Self {
            id: id.into(),
            source: source.into(),
            destination,
            payload,
            priority,
            created_at: Utc::now(),
            checksum,
            retry_count: 0,
            status: PacketStatus::Pending,
            routing_hint: None,
        }
    }

    /// Build a packet whose payload is the JSON encoding of `value`.
    pub fn from_json(
        id: impl Into<String>,
        source: impl Into<String>,
        destination: Destination,
        value: &serde_json::Value,
        priority: Priority,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(id, source, destination, payload, priority))
    }

    pub fn with_routing_hint(mut self, hint: impl Into<String>) -> Self {
        self.routing_hint = Some(hint.into());
        self
    }

    /// `"{destination}:{routing_hint or id}"`
    pub fn routing_key(&self) -> String {
        let key = self.routing_hint.as_deref().unwrap_or(&self.id);
        format!("{}:{}", self.destination.as_str(), key)
    }

    /// Parse the payload as JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering_and_bump() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Normal > Priority::High);
        assert_eq!(Priority::Normal.bumped(1), Priority::High);
        assert_eq!(Priority::Normal.bumped(2), Priority::Critical);
        assert_eq!(Priority::Normal.bumped(7), Priority::Critical);
        assert_eq!(Priority::High.bumped(0), Priority::High);
    }

    #[test]
    fn test_priority_wire_format_is_integer() {
        let encoded = serde_json::to_string(&Priority::High).unwrap();
        assert_eq!(encoded, "2");
        assert!(serde_json::from_str::<Priority>("4").is_err());
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
    }

    #[test]
    fn test_status_transitions() {
        use PacketStatus::*;
        assert!(Pending.can_transition_to(InFlight));
        assert!(InFlight.can_transition_to(RetryWait));
        assert!(RetryWait.can_transition_to(InFlight));
        assert!(!Committed.can_transition_to(InFlight));
        assert!(!DeadLetter.can_transition_to(Pending));
        assert!(Committed.is_terminal() && DeadLetter.is_terminal());
        assert_eq!("RETRY_WAIT".parse::<PacketStatus>().unwrap(), RetryWait);
    }

    #[test]
    fn test_packet_roundtrip_through_json() {
        let packet = DataPacket::from_json(
            "comp-1",
            "vendor-adapter",
            Destination::ComplianceData,
            &json!({"entity_id": "e1"}),
            Priority::High,
        )
        .unwrap()
        .with_routing_hint("NCA");

        let wire = serde_json::to_value(&packet).unwrap();
        assert_eq!(wire["destination"], "compliance-data");
        assert_eq!(wire["priority"], 2);
        assert_eq!(wire["status"], "PENDING");
        assert!(wire["payload"].is_string());

        let back: DataPacket = serde_json::from_value(wire).unwrap();
        assert_eq!(back, packet);
        assert_eq!(back.routing_key(), "compliance-data:NCA");
    }

    #[test]
    fn test_packet_defaults_on_the_wire() {
        let payload = b"{}".to_vec();
        let wire = json!({
            "id": "p-1",
            "source": "feed",
            "destination": "generic-uploads",
            "payload": "e30=",
            "priority": 3,
            "created_at": "2024-05-01T00:00:00Z",
            "checksum": payload_checksum(&payload),
        });
        let packet: DataPacket = serde_json::from_value(wire).unwrap();
        assert_eq!(packet.payload, payload);
        assert_eq!(packet.retry_count, 0);
        assert_eq!(packet.status, PacketStatus::Pending);
        assert_eq!(packet.routing_key(), "generic-uploads:p-1");
    }
}

//! Uplink shared protocol
//!
//! Types that cross the boundary between producers, the ingestion pipeline
//! and the upload ledger:
//!
//! - [`DataPacket`] and its [`Priority`] / [`PacketStatus`] / [`Destination`] enums
//! - payload checksums and the stable routing hash ([`checksum`])
//! - [`PipelineConfig`], loaded from TOML with every value explicit

pub mod checksum;
pub mod config;
pub mod defaults;
pub mod types;

pub use checksum::{checksum_matches, payload_checksum, stable_hash64};
pub use config::{AdmissionPolicy, ConfigError, PipelineConfig};
pub use types::{DataPacket, Destination, PacketStatus, Priority};

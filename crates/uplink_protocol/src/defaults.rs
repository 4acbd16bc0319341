//! Canonical defaults for the binary's command-line flags.
//!
//! Pipeline tuning values are never defaulted; they live in the TOML config.

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8088";
pub const DEFAULT_CONFIG_PATH: &str = "config/uplink.toml";
pub const DEFAULT_LEDGER_PATH: &str = "uplink_ledger.sqlite3";
pub const DEFAULT_STORE_ROOT: &str = "./uplink-store";
/// `/health` reports `degraded` when the probe score drops below this.
pub const DEFAULT_DEGRADED_BELOW: f64 = 1.0;
pub const DEFAULT_DEAD_LETTER_LIMIT: i64 = 50;

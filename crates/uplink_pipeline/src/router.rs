//! Shard routing.
//!
//! `shard_id = stable_hash64(routing_key) % shard_count`, where the hash is the
//! first 8 bytes of BLAKE3 read little-endian. No seed, no process state: the
//! same key lands on the same shard in every process and after every restart
//! as long as `shard_count` is unchanged.

use uplink_protocol::{stable_hash64, DataPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: u32,
}

impl ShardRouter {
    /// `shard_count` is validated at config load; zero is clamped to one.
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn resolve(&self, routing_key: &str) -> u32 {
        (stable_hash64(routing_key) % u64::from(self.shard_count)) as u32
    }

    pub fn resolve_packet(&self, packet: &DataPacket) -> u32 {
        self.resolve(&packet.routing_key())
    }
}

//! Destination stores.
//!
//! [`CommitStore`] is the one seam between the pipeline and whatever storage
//! a deployment uses. Implementations classify every failure as transient
//! (retried with backoff) or permanent (dead-lettered).
//!
//! Contract:
//! - `commit` must be idempotent on `packet.id`: the pipeline is
//!   at-least-once and may deliver a packet again after a crash.
//! - Implementations must not retry internally.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uplink_protocol::{checksum_matches, DataPacket, Destination};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// May succeed later (timeout, connection refused, disk busy)
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Retrying will not help (rejected record, invalid key, bad payload)
    #[error("Permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StoreError::Transient(msg) | StoreError::Permanent(msg) => msg,
        }
    }
}

#[async_trait]
pub trait CommitStore: Send + Sync {
    /// Durably write one packet to `destination`, partition `shard_id`.
    async fn commit(
        &self,
        destination: Destination,
        shard_id: u32,
        packet: &DataPacket,
    ) -> Result<(), StoreError>;

    /// Commit packets that share a destination and shard. One result per
    /// packet, in order. The default commits them one by one.
    async fn commit_batch(
        &self,
        destination: Destination,
        shard_id: u32,
        packets: &[DataPacket],
    ) -> Vec<Result<(), StoreError>> {
        let mut results = Vec::with_capacity(packets.len());
        for packet in packets {
            results.push(self.commit(destination, shard_id, packet).await);
        }
        results
    }

    /// Cheap reachability check for the health monitor.
    async fn ping(&self) -> Result<(), StoreError>;
}

fn verify_checksum(packet: &DataPacket) -> Result<(), StoreError> {
    if checksum_matches(&packet.payload, &packet.checksum) {
        Ok(())
    } else {
        Err(StoreError::Permanent("checksum_mismatch".to_string()))
    }
}

// ============================================================================
// Filesystem store
// ============================================================================

/// Writes `<root>/<destination>/shard-<n>/<packet_id>.json`.
///
/// Each file is written to a dot-prefixed temp file and renamed into place,
/// so readers never see a partial record and a second commit of the same
/// packet simply replaces the first.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

#[derive(Serialize)]
struct StoredRecord<'a> {
    id: &'a str,
    source: &'a str,
    destination: Destination,
    shard_id: u32,
    priority: u8,
    created_at: chrono::DateTime<chrono::Utc>,
    checksum: &'a str,
    payload: serde_json::Value,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn record_path(&self, destination: Destination, shard_id: u32, packet_id: &str) -> PathBuf {
        self.root
            .join(destination.as_str())
            .join(format!("shard-{}", shard_id))
            .join(format!("{}.json", packet_id))
    }

    fn check_packet_id(packet_id: &str) -> Result<(), StoreError> {
        let usable = !packet_id.is_empty()
            && !packet_id.starts_with('.')
            && packet_id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':'));
        if usable {
            Ok(())
        } else {
            Err(StoreError::Permanent(format!(
                "packet id not usable as a file name: {:?}",
                packet_id
            )))
        }
    }
}

fn classify_io(err: io::Error, context: &str) -> StoreError {
    let message = format!("{}: {}", context, err);
    match err.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
            StoreError::Permanent(message)
        }
        _ => StoreError::Transient(message),
    }
}

#[async_trait]
impl CommitStore for FilesystemStore {
    async fn commit(
        &self,
        destination: Destination,
        shard_id: u32,
        packet: &DataPacket,
    ) -> Result<(), StoreError> {
        verify_checksum(packet)?;
        Self::check_packet_id(&packet.id)?;

        let payload = packet
            .payload_json()
            .map_err(|e| StoreError::Permanent(format!("payload is not JSON: {}", e)))?;
        let record = StoredRecord {
            id: &packet.id,
            source: &packet.source,
            destination,
            shard_id,
            priority: packet.priority.as_u8(),
            created_at: packet.created_at,
            checksum: &packet.checksum,
            payload,
        };
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|e| StoreError::Permanent(format!("Failed to encode record: {}", e)))?;

        let final_path = self.record_path(destination, shard_id, &packet.id);
        let dir = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| classify_io(e, "Failed to create shard directory"))?;

        let temp_path = dir.join(format!(".{}.json.tmp", packet.id));
        tokio::fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| classify_io(e, "Failed to write temp record"))?;
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| classify_io(e, "Failed to move record into place"))?;

        debug!(
            packet_id = %packet.id,
            path = %final_path.display(),
            "Committed record"
        );
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| classify_io(e, "Store root unavailable"))?;
        let metadata = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| classify_io(e, "Store root unavailable"))?;
        if metadata.permissions().readonly() {
            return Err(StoreError::Permanent(format!(
                "Store root is read-only: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// One stored packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPacket {
    pub destination: Destination,
    pub shard_id: u32,
    pub packet: DataPacket,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, StoredPacket>,
    attempts: HashMap<String, u32>,
    permanent_failures: HashSet<String>,
    panic_on: HashSet<String>,
}

/// In-process store for tests and embedding, with scriptable failures.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    transient_failures_left: AtomicU32,
    always_transient: AtomicBool,
    unhealthy: AtomicBool,
    delay_ms: AtomicU64,
    commit_calls: AtomicU64,
    batch_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` commits with a transient error.
    pub fn fail_next_transient(&self, n: u32) {
        self.transient_failures_left.store(n, Ordering::SeqCst);
    }

    /// Fail every commit with a transient error until turned off.
    pub fn set_always_transient(&self, enabled: bool) {
        self.always_transient.store(enabled, Ordering::SeqCst);
    }

    /// Refuse this packet id permanently.
    pub fn fail_permanently(&self, packet_id: &str) {
        self.state().permanent_failures.insert(packet_id.to_string());
    }

    /// Panic when this packet id is committed (once).
    pub fn panic_once_on(&self, packet_id: &str) {
        self.state().panic_on.insert(packet_id.to_string());
    }

    /// Slow every commit down (simulates a slow destination).
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    pub fn get(&self, packet_id: &str) -> Option<StoredPacket> {
        self.state().records.get(packet_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commit calls seen for `packet_id`, successful or not.
    pub fn attempts(&self, packet_id: &str) -> u32 {
        self.state().attempts.get(packet_id).copied().unwrap_or(0)
    }

    pub fn commit_calls(&self) -> u64 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn take_transient_failure(&self) -> bool {
        if self.always_transient.load(Ordering::SeqCst) {
            return true;
        }
        self.transient_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CommitStore for MemoryStore {
    async fn commit(
        &self,
        destination: Destination,
        shard_id: u32,
        packet: &DataPacket,
    ) -> Result<(), StoreError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let should_panic = {
            let mut state = self.state();
            *state.attempts.entry(packet.id.clone()).or_insert(0) += 1;
            state.panic_on.remove(&packet.id)
        };
        if should_panic {
            panic!("injected store panic for packet {}", packet.id);
        }

        verify_checksum(packet)?;

        if self.take_transient_failure() {
            return Err(StoreError::Transient("injected transient failure".to_string()));
        }

        let mut state = self.state();
        if state.permanent_failures.contains(&packet.id) {
            return Err(StoreError::Permanent("injected permanent failure".to_string()));
        }
        state.records.insert(
            packet.id.clone(),
            StoredPacket {
                destination,
                shard_id,
                packet: packet.clone(),
            },
        );
        Ok(())
    }

    async fn commit_batch(
        &self,
        destination: Destination,
        shard_id: u32,
        packets: &[DataPacket],
    ) -> Vec<Result<(), StoreError>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let mut results = Vec::with_capacity(packets.len());
        for packet in packets {
            results.push(self.commit(destination, shard_id, packet).await);
        }
        results
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.unhealthy.load(Ordering::SeqCst) {
            Err(StoreError::Transient("store marked unhealthy".to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uplink_protocol::Priority;

    fn packet(id: &str) -> DataPacket {
        DataPacket::from_json(
            id,
            "scraper",
            Destination::GenericUploads,
            &json!({"filename": "a.csv", "content": "x,y"}),
            Priority::Normal,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_filesystem_store_writes_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(tmp.path());
        let p = packet("gen-1");

        store.commit(Destination::GenericUploads, 3, &p).await.unwrap();
        // Second commit of the same packet overwrites in place.
        store.commit(Destination::GenericUploads, 3, &p).await.unwrap();

        let path = store.record_path(Destination::GenericUploads, 3, "gen-1");
        assert_eq!(path, tmp.path().join("generic-uploads/shard-3/gen-1.json"));
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["id"], "gen-1");
        assert_eq!(written["shard_id"], 3);
        assert_eq!(written["payload"]["filename"], "a.csv");

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_filesystem_store_rejects_bad_input() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(tmp.path());

        let mut tampered = packet("gen-2");
        tampered.payload.push(b' ');
        let err = store
            .commit(Destination::GenericUploads, 0, &tampered)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Permanent("checksum_mismatch".to_string()));

        let escaping = packet("../escape");
        let err = store
            .commit(Destination::GenericUploads, 0, &escaping)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_memory_store_failure_script() {
        let store = MemoryStore::new();
        let p = packet("mem-1");
        store.fail_next_transient(2);

        for _ in 0..2 {
            let err = store
                .commit(Destination::GenericUploads, 1, &p)
                .await
                .unwrap_err();
            assert!(err.is_transient());
        }
        store.commit(Destination::GenericUploads, 1, &p).await.unwrap();
        assert_eq!(store.attempts("mem-1"), 3);
        assert_eq!(store.get("mem-1").unwrap().shard_id, 1);

        store.fail_permanently("mem-2");
        let err = store
            .commit(Destination::GenericUploads, 1, &packet("mem-2"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_default_batch_reports_per_packet() {
        let store = MemoryStore::new();
        store.fail_permanently("b");
        let packets = vec![packet("a"), packet("b"), packet("c")];

        let results = store
            .commit_batch(Destination::GenericUploads, 0, &packets)
            .await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        assert_eq!(store.batch_calls(), 1);
        assert_eq!(store.commit_calls(), 3);
    }

    #[tokio::test]
    async fn test_ping_reflects_health_flag() {
        let store = MemoryStore::new();
        assert!(store.ping().await.is_ok());
        store.set_healthy(false);
        assert!(store.ping().await.is_err());
    }
}

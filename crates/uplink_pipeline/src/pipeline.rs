//! Pipeline wiring.
//!
//! `Pipeline` owns one of everything (queue, metrics, ledger handle, router,
//! validator, health monitor) and hands `Arc`s to the workers. No globals.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uplink_ledger::{DeadLetterReason, UploadLedger, UploadLogEntry};
use uplink_protocol::{DataPacket, PacketStatus, PipelineConfig};

use crate::cancel::CancellationToken;
use crate::error::{PipelineError, Result};
use crate::health::{probe, HealthMonitor, ProbeResult};
use crate::metrics::Metrics;
use crate::queue::{Admission, EnqueueError, IngestionQueue, QueueSettings};
use crate::retry::RetryPolicy;
use crate::router::ShardRouter;
use crate::store::CommitStore;
use crate::validation::ValidationEngine;
use crate::worker::{DrainReport, RetryJournal, WorkerContext, WorkerPool};

/// Answer to a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestResponse {
    pub packet_id: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Lower-priority packet pushed out to make room for this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displaced: Option<String>,
    #[serde(skip)]
    pub rejection: Option<EnqueueError>,
}

impl IngestResponse {
    fn accepted(packet_id: String) -> Self {
        Self {
            packet_id,
            accepted: true,
            reason: None,
            displaced: None,
            rejection: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub queue_depth: usize,
    pub active_workers: u64,
    pub success_rate: f64,
    pub score: f64,
    pub probes: BTreeMap<String, ProbeResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drain: DrainReport,
    /// Queued packets written back to the ledger as PENDING
    pub persisted: usize,
}

struct Running {
    pool: WorkerPool,
    health_task: JoinHandle<()>,
    health_cancel: CancellationToken,
}

pub struct Pipeline {
    config: PipelineConfig,
    ctx: Arc<WorkerContext>,
    health: Arc<HealthMonitor>,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        ledger: UploadLedger,
        store: Arc<dyn CommitStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let ctx = Arc::new(WorkerContext {
            queue: Arc::new(IngestionQueue::new(QueueSettings::from_config(&config))),
            ledger,
            store,
            router: ShardRouter::new(config.shard_count),
            validator: ValidationEngine::new(),
            retry: RetryPolicy::from_config(&config),
            metrics: Arc::new(Metrics::new()),
            store_permits: Arc::new(Semaphore::new(config.store_pool_size)),
            batch_size: config.batch_size,
            journal: RetryJournal::default(),
            shutdown: CancellationToken::new(),
        });

        let health = Arc::new(HealthMonitor::new(config.probe_timeout()));
        register_builtin_probes(&health, &ctx, config.worker_count);

        Ok(Arc::new(Self {
            config,
            ctx,
            health,
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        }))
    }

    /// Requeue everything the ledger holds as non-terminal, then start the
    /// workers and the health loop. Returns the number of recovered packets.
    pub async fn start(&self) -> Result<usize> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::InvalidState("pipeline already started".to_string()));
        }

        let recovered = match self.ctx.ledger.recoverable().await {
            Ok(recovered) => recovered,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let count = recovered.len();
        for mut packet in recovered {
            packet.status = PacketStatus::Pending;
            self.ctx.queue.requeue(packet);
        }
        if count > 0 {
            info!(recovered = count, "Recovered unfinished packets from ledger");
        }
        self.ctx.metrics.set_queue_depth(self.ctx.queue.depth());

        let pool = WorkerPool::spawn(self.ctx.clone(), self.config.worker_count);
        let health_cancel = CancellationToken::new();
        let health_task = self
            .health
            .clone()
            .spawn(self.config.health_interval(), health_cancel.clone());

        *self.lock_running() = Some(Running {
            pool,
            health_task,
            health_cancel,
        });
        Ok(count)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a packet from a producer.
    ///
    /// The ledger is consulted first. A packet already COMMITTED, or one
    /// still in progress (PENDING, IN_FLIGHT, RETRY_WAIT), is acknowledged
    /// as a duplicate and not enqueued again, so a resend never resets its
    /// retry budget. A resend of a DEAD_LETTER packet is refused.
    pub async fn ingest(&self, mut packet: DataPacket) -> Result<IngestResponse> {
        let packet_id = packet.id.clone();
        if let Some(existing) = self.ctx.ledger.get(&packet_id).await? {
            return Ok(match existing.status {
                PacketStatus::DeadLetter => {
                    debug!(packet_id = %packet_id, "Resend of dead-lettered packet refused");
                    IngestResponse {
                        accepted: false,
                        reason: Some("dead_lettered".to_string()),
                        ..IngestResponse::accepted(packet_id)
                    }
                }
                status => {
                    debug!(packet_id = %packet_id, %status, "Duplicate packet acknowledged");
                    IngestResponse {
                        reason: Some("duplicate".to_string()),
                        ..IngestResponse::accepted(packet_id)
                    }
                }
            });
        }

        packet.status = PacketStatus::Pending;
        packet.retry_count = 0;
        let priority = packet.priority;

        let metrics = &self.ctx.metrics;
        let response = match self.ctx.queue.enqueue(packet).await {
            Admission::Accepted => {
                metrics.inc_packets_enqueued();
                IngestResponse::accepted(packet_id)
            }
            Admission::Displaced(victim) => {
                metrics.inc_packets_enqueued();
                metrics.inc_packets_rejected();
                warn!(
                    packet_id = %packet_id,
                    displaced = %victim.id,
                    displaced_priority = %victim.priority,
                    "Queue full, displaced lower-priority packet to dead letter"
                );
                let victim_id = victim.id.clone();
                self.dead_letter_displaced(*victim).await?;
                IngestResponse {
                    displaced: Some(victim_id),
                    ..IngestResponse::accepted(packet_id)
                }
            }
            Admission::Rejected(err) => {
                metrics.inc_packets_rejected();
                warn!(packet_id = %packet_id, %priority, "Packet rejected: {}", err);
                IngestResponse {
                    packet_id,
                    accepted: false,
                    reason: Some(err.reason().to_string()),
                    displaced: None,
                    rejection: Some(err),
                }
            }
        };
        metrics.set_queue_depth(self.ctx.queue.depth());
        Ok(response)
    }

    /// A displaced packet was already acknowledged to its producer, so it
    /// ends in the dead-letter table rather than vanishing.
    async fn dead_letter_displaced(&self, mut victim: DataPacket) -> Result<()> {
        victim.status = PacketStatus::DeadLetter;
        let history = self.ctx.journal.history(&victim.id);
        let entry = UploadLogEntry::for_packet(&victim, PacketStatus::DeadLetter)
            .with_attempts(victim.retry_count)
            .with_error("displaced");
        let outcome = self
            .ctx
            .ledger
            .dead_letter(&entry, DeadLetterReason::Displaced, &history, &victim)
            .await?;
        if outcome.is_applied() {
            self.ctx.metrics.inc_packets_dead_lettered();
        }
        self.ctx.journal.clear(&victim.id);
        Ok(())
    }

    /// Prometheus text with the queue depth gauge refreshed from the queue.
    pub fn metrics_text(&self) -> String {
        self.ctx.metrics.set_queue_depth(self.ctx.queue.depth());
        self.ctx.metrics.prometheus_format()
    }

    /// Health summary; `degraded` when the probe score is below
    /// `degraded_below`.
    pub fn health_report(&self, degraded_below: f64) -> HealthReport {
        let snapshot = self.health.snapshot();
        let metrics = self.ctx.metrics.snapshot();
        let score = snapshot.overall_score();
        HealthReport {
            status: if score < degraded_below {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            queue_depth: self.ctx.queue.depth(),
            active_workers: metrics.active_workers,
            success_rate: metrics.success_rate(),
            score,
            probes: snapshot.probes,
        }
    }

    /// Stop with the configured drain deadline.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        self.shutdown_with_deadline(self.config.drain_deadline()).await
    }

    /// Close the queue, let workers finish up to `deadline`, abort the rest,
    /// and write still-queued packets to the ledger as PENDING.
    pub async fn shutdown_with_deadline(&self, deadline: Duration) -> Result<ShutdownReport> {
        let running = self
            .lock_running()
            .take()
            .ok_or_else(|| PipelineError::InvalidState("pipeline not running".to_string()))?;

        info!(deadline_ms = deadline.as_millis() as u64, "Shutting down pipeline");
        self.ctx.queue.close();
        let drain = running.pool.shutdown(deadline).await;

        self.ctx.shutdown.cancel();
        running.health_cancel.cancel();
        let _ = running.health_task.await;

        let leftover = self.ctx.queue.drain_pending();
        let persisted = leftover.len();
        for packet in &leftover {
            let entry = UploadLogEntry::for_packet(packet, PacketStatus::Pending)
                .with_attempts(packet.retry_count);
            self.ctx.ledger.record_packet(packet, &entry).await?;
        }
        self.ctx.metrics.set_queue_depth(0);

        info!(
            drained = drain.drained,
            aborted = drain.aborted,
            persisted,
            "Pipeline stopped"
        );
        Ok(ShutdownReport { drain, persisted })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.ctx.metrics
    }

    pub fn queue(&self) -> &Arc<IngestionQueue> {
        &self.ctx.queue
    }

    pub fn ledger(&self) -> &UploadLedger {
        &self.ctx.ledger
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn router(&self) -> ShardRouter {
        self.ctx.router
    }
}

fn register_builtin_probes(health: &HealthMonitor, ctx: &Arc<WorkerContext>, worker_count: usize) {
    let queue = ctx.queue.clone();
    health.register(
        "queue",
        probe(move || {
            let queue = queue.clone();
            async move {
                if queue.is_closed() {
                    return Err("queue closed".to_string());
                }
                let depth = queue.depth();
                if depth >= queue.capacity() {
                    return Err(format!("queue saturated: {}/{}", depth, queue.capacity()));
                }
                Ok(())
            }
        }),
    );

    let store = ctx.store.clone();
    health.register(
        "store",
        probe(move || {
            let store = store.clone();
            async move { store.ping().await.map_err(|e| e.to_string()) }
        }),
    );

    let metrics = ctx.metrics.clone();
    health.register(
        "workers",
        probe(move || {
            let metrics = metrics.clone();
            async move {
                let alive = metrics.snapshot().active_workers as usize;
                if alive >= worker_count {
                    Ok(())
                } else {
                    Err(format!("{} of {} workers alive", alive, worker_count))
                }
            }
        }),
    );

    let ledger = ctx.ledger.clone();
    health.register(
        "ledger",
        probe(move || {
            let ledger = ledger.clone();
            async move { ledger.ping().await.map_err(|e| e.to_string()) }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use uplink_protocol::{AdmissionPolicy, Destination, Priority};

    fn config() -> PipelineConfig {
        PipelineConfig {
            worker_count: 2,
            max_queue_size: 10,
            aging_threshold_ms: 60_000,
            max_retries: 2,
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            shard_count: 4,
            batch_size: 1,
            admission_policy: AdmissionPolicy::Reject,
            enqueue_timeout_ms: 10,
            store_pool_size: 2,
            drain_deadline_ms: 2_000,
            health_interval_ms: 20,
            probe_timeout_ms: 200,
        }
    }

    fn packet(id: &str) -> DataPacket {
        DataPacket::from_json(
            id,
            "scraper",
            Destination::GenericUploads,
            &json!({"filename": "f.csv", "content": "1"}),
            Priority::High,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut bad = config();
        bad.worker_count = 0;
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        assert!(matches!(
            Pipeline::new(bad, ledger, Arc::new(MemoryStore::new())),
            Err(PipelineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_ingest_duplicate_of_committed_packet() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let p = packet("dup-1");
        ledger
            .record(&UploadLogEntry::for_packet(&p, PacketStatus::Committed))
            .await
            .unwrap();

        let pipeline = Pipeline::new(config(), ledger, Arc::new(MemoryStore::new())).unwrap();
        let response = pipeline.ingest(p).await.unwrap();
        assert!(response.accepted);
        assert_eq!(response.reason.as_deref(), Some("duplicate"));
        assert_eq!(pipeline.queue().depth(), 0);
        assert_eq!(pipeline.metrics().snapshot().packets_enqueued, 0);
    }

    #[tokio::test]
    async fn test_ingest_resend_of_unfinished_packet_is_not_requeued() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let p = packet("resend-1");
        let waiting = UploadLogEntry::for_packet(&p, PacketStatus::RetryWait)
            .with_attempts(2)
            .with_error("timeout");
        ledger.record_packet(&p, &waiting).await.unwrap();

        let pipeline = Pipeline::new(config(), ledger, Arc::new(MemoryStore::new())).unwrap();
        let response = pipeline.ingest(p).await.unwrap();
        assert!(response.accepted);
        assert_eq!(response.reason.as_deref(), Some("duplicate"));
        assert_eq!(pipeline.queue().depth(), 0);

        // The stored copy and its attempt count are untouched.
        let stored = pipeline.ledger().get("resend-1").await.unwrap().unwrap();
        assert_eq!(stored.status, PacketStatus::RetryWait);
        assert_eq!(stored.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_ingest_resend_of_dead_lettered_packet_is_refused() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let mut p = packet("dead-1");
        p.status = PacketStatus::DeadLetter;
        let entry = UploadLogEntry::for_packet(&p, PacketStatus::DeadLetter)
            .with_attempts(3)
            .with_error("timeout");
        ledger
            .dead_letter(&entry, DeadLetterReason::MaxRetriesExceeded, &[], &p)
            .await
            .unwrap();

        let pipeline = Pipeline::new(config(), ledger, Arc::new(MemoryStore::new())).unwrap();
        let response = pipeline.ingest(packet("dead-1")).await.unwrap();
        assert!(!response.accepted);
        assert_eq!(response.reason.as_deref(), Some("dead_lettered"));
        assert_eq!(response.rejection, None);
        assert_eq!(pipeline.queue().depth(), 0);
    }

    #[tokio::test]
    async fn test_metrics_text_reads_current_queue_depth() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let pipeline = Pipeline::new(config(), ledger, Arc::new(MemoryStore::new())).unwrap();
        pipeline.ingest(packet("d1")).await.unwrap();
        assert_eq!(pipeline.metrics().snapshot().queue_depth, 1);

        // Retry timers and recovery put packets back behind ingest's back.
        pipeline.queue().requeue(packet("d2"));
        assert!(pipeline.metrics_text().contains("uplink_queue_depth 2"));
        assert_eq!(pipeline.metrics().snapshot().queue_depth, 2);
    }

    #[tokio::test]
    async fn test_start_twice_and_shutdown_without_start() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let pipeline = Pipeline::new(config(), ledger, Arc::new(MemoryStore::new())).unwrap();
        assert!(pipeline.shutdown().await.is_err());

        pipeline.start().await.unwrap();
        assert!(matches!(
            pipeline.start().await,
            Err(PipelineError::InvalidState(_))
        ));
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_report_reflects_probes() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(config(), ledger, store.clone()).unwrap();
        pipeline.start().await.unwrap();
        for _ in 0..200 {
            if pipeline.metrics().snapshot().active_workers == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let snapshot = pipeline.health().check_now().await;
        assert_eq!(snapshot.overall_score(), 1.0, "{:?}", snapshot);
        let report = pipeline.health_report(1.0);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.active_workers, 2);

        store.set_healthy(false);
        pipeline.health().check_now().await;
        let report = pipeline.health_report(1.0);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!((report.score - 0.75).abs() < f64::EPSILON);
        assert!(!report.probes["store"].ok);

        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ingest_after_shutdown_is_rejected() {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let pipeline = Pipeline::new(config(), ledger, Arc::new(MemoryStore::new())).unwrap();
        pipeline.start().await.unwrap();
        pipeline.shutdown().await.unwrap();

        let response = pipeline.ingest(packet("late")).await.unwrap();
        assert!(!response.accepted);
        assert_eq!(response.reason.as_deref(), Some("shutting_down"));
        assert_eq!(response.rejection, Some(EnqueueError::ShuttingDown));
    }
}

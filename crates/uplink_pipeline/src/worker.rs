//! Worker pool.
//!
//! Design principles:
//! - One supervisor task per slot; the worker loop itself runs in a child
//!   task so a panic is caught as a `JoinError` instead of killing the slot
//! - Packets a worker holds but has not finished are tracked per slot and
//!   requeued when the worker dies (at-least-once)
//! - The ledger decides idempotence: a redelivered packet that is already
//!   terminal is dropped before it reaches the store, and a second copy of
//!   an unfinished one continues from the recorded attempt count
//! - Store calls are bounded by a semaphore independent of `worker_count`

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uplink_ledger::{DeadLetterReason, RetryAttempt, UploadLedger, UploadLogEntry};
use uplink_protocol::{DataPacket, PacketStatus};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::queue::IngestionQueue;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::router::ShardRouter;
use crate::store::{CommitStore, StoreError};
use crate::validation::{ValidationEngine, ValidationError};

/// Pause before a crashed worker is restarted.
const RESTART_PAUSE: Duration = Duration::from_millis(100);

/// Everything a worker needs. Built once by `Pipeline`, shared by `Arc`.
pub struct WorkerContext {
    pub queue: Arc<IngestionQueue>,
    pub ledger: UploadLedger,
    pub store: Arc<dyn CommitStore>,
    pub router: ShardRouter,
    pub validator: ValidationEngine,
    pub retry: RetryPolicy,
    pub metrics: Arc<Metrics>,
    pub store_permits: Arc<Semaphore>,
    pub batch_size: usize,
    pub journal: RetryJournal,
    /// Fires at shutdown; pending retry timers stop and leave their packet
    /// as RETRY_WAIT in the ledger.
    pub shutdown: CancellationToken,
}

// ============================================================================
// Retry journal
// ============================================================================

/// Failed attempts per packet, kept until the packet reaches a terminal
/// state and written into the dead-letter row.
#[derive(Default)]
pub struct RetryJournal {
    attempts: Mutex<HashMap<String, Vec<RetryAttempt>>>,
}

impl RetryJournal {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<RetryAttempt>>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, packet_id: &str, attempt: RetryAttempt) {
        self.lock()
            .entry(packet_id.to_string())
            .or_default()
            .push(attempt);
    }

    pub fn history(&self, packet_id: &str) -> Vec<RetryAttempt> {
        self.lock().get(packet_id).cloned().unwrap_or_default()
    }

    pub fn clear(&self, packet_id: &str) {
        self.lock().remove(packet_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// In-flight tracking
// ============================================================================

/// Packets a worker slot has dequeued but not yet finished.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<Vec<DataPacket>>>);

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, Vec<DataPacket>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hold(&self, packets: &[DataPacket]) {
        self.lock().extend(packets.iter().cloned());
    }

    fn finish(&self, packet_id: &str) {
        self.lock().retain(|p| p.id != packet_id);
    }

    fn take_all(&self) -> Vec<DataPacket> {
        std::mem::take(&mut *self.lock())
    }
}

fn transition(packet: &mut DataPacket, next: PacketStatus) {
    if !packet.status.can_transition_to(next) {
        debug!(
            packet_id = %packet.id,
            from = %packet.status,
            to = %next,
            "Unexpected status transition"
        );
    }
    packet.status = next;
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
    slot: InFlight,
}

impl Worker {
    /// Drain the queue until it is closed. Returns `Err` only for internal
    /// failures (ledger unavailable); the supervisor restarts the worker.
    async fn run(self) -> Result<()> {
        debug!(worker_id = self.id, "Worker started");
        while let Some(first) = self.ctx.queue.dequeue().await {
            let batch = self.fill_batch(first);
            self.ctx.metrics.set_queue_depth(self.ctx.queue.depth());
            self.slot.hold(&batch);
            self.process(batch).await?;
        }
        debug!(worker_id = self.id, "Queue closed, worker exiting");
        Ok(())
    }

    /// Add queued packets with the same destination and shard, up to
    /// `batch_size`.
    fn fill_batch(&self, first: DataPacket) -> Vec<DataPacket> {
        if self.ctx.batch_size <= 1 {
            return vec![first];
        }
        let destination = first.destination;
        let shard_id = self.ctx.router.resolve_packet(&first);
        let mut batch = vec![first];
        batch.extend(
            self.ctx
                .queue
                .take_batch(self.ctx.batch_size - 1, destination, shard_id),
        );
        batch
    }

    async fn process(&self, batch: Vec<DataPacket>) -> Result<()> {
        let mut ready = Vec::with_capacity(batch.len());

        for mut packet in batch {
            if let Some(stored) = self.ctx.ledger.get(&packet.id).await? {
                if stored.status.is_terminal() {
                    debug!(
                        packet_id = %packet.id,
                        status = %stored.status,
                        "Already terminal, dropping redelivery"
                    );
                    self.slot.finish(&packet.id);
                    continue;
                }
                // A second copy continues from the recorded attempts.
                packet.retry_count = packet.retry_count.max(stored.attempt_count);
            }

            transition(&mut packet, PacketStatus::InFlight);
            let entry = UploadLogEntry::for_packet(&packet, PacketStatus::InFlight)
                .with_attempts(packet.retry_count);
            if !self.ctx.ledger.record_packet(&packet, &entry).await?.is_applied() {
                debug!(packet_id = %packet.id, "Packet already terminal, dropping redelivery");
                self.slot.finish(&packet.id);
                continue;
            }

            if let Err(err) = self.ctx.validator.validate(&packet) {
                self.reject_invalid(packet, err).await?;
                continue;
            }
            ready.push(packet);
        }

        if ready.is_empty() {
            return Ok(());
        }

        let destination = ready[0].destination;
        let shard_id = self.ctx.router.resolve_packet(&ready[0]);
        let results = self.commit(destination, shard_id, &ready).await;

        for (packet, result) in ready.into_iter().zip(results) {
            let packet_id = packet.id.clone();
            match result {
                Ok(()) => self.on_committed(packet, shard_id).await?,
                Err(err) if err.is_transient() => self.on_transient(packet, err).await?,
                Err(err) => self.on_permanent(packet, err).await?,
            }
            self.slot.finish(&packet_id);
        }
        Ok(())
    }

    async fn commit(
        &self,
        destination: uplink_protocol::Destination,
        shard_id: u32,
        packets: &[DataPacket],
    ) -> Vec<std::result::Result<(), StoreError>> {
        let _permit = match self.ctx.store_permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return packets
                    .iter()
                    .map(|_| Err(StoreError::Transient("store pool closed".to_string())))
                    .collect()
            }
        };

        let started = Instant::now();
        let mut results = if packets.len() == 1 {
            vec![self.ctx.store.commit(destination, shard_id, &packets[0]).await]
        } else {
            self.ctx
                .store
                .commit_batch(destination, shard_id, packets)
                .await
        };
        self.ctx.metrics.record_commit_duration(started.elapsed());

        if results.len() != packets.len() {
            warn!(
                expected = packets.len(),
                got = results.len(),
                "Store returned wrong number of batch results"
            );
            results.resize_with(packets.len(), || {
                Err(StoreError::Transient("missing batch result".to_string()))
            });
        }
        results
    }

    async fn on_committed(&self, mut packet: DataPacket, shard_id: u32) -> Result<()> {
        transition(&mut packet, PacketStatus::Committed);
        let entry = UploadLogEntry::for_packet(&packet, PacketStatus::Committed)
            .with_attempts(packet.retry_count + 1);
        if self.ctx.ledger.record(&entry).await?.is_applied() {
            self.ctx.metrics.inc_packets_committed();
        }
        self.ctx.journal.clear(&packet.id);
        debug!(
            packet_id = %packet.id,
            destination = %packet.destination,
            shard = shard_id,
            attempt = packet.retry_count + 1,
            "Packet committed"
        );
        Ok(())
    }

    async fn on_transient(&self, mut packet: DataPacket, err: StoreError) -> Result<()> {
        let attempt = packet.retry_count + 1;

        match self.ctx.retry.decide(packet.retry_count) {
            RetryDecision::Retry { retry_count, delay } => {
                let delay_ms = delay.as_millis() as u64;
                self.ctx.journal.push(
                    &packet.id,
                    RetryAttempt {
                        attempt,
                        at: Utc::now(),
                        error: err.message().to_string(),
                        delay_ms: Some(delay_ms),
                    },
                );

                packet.retry_count = retry_count;
                transition(&mut packet, PacketStatus::RetryWait);
                let entry = UploadLogEntry::for_packet(&packet, PacketStatus::RetryWait)
                    .with_attempts(attempt)
                    .with_error(err.message());
                self.ctx.ledger.record_packet(&packet, &entry).await?;
                self.ctx.metrics.inc_packets_retried();

                info!(
                    packet_id = %packet.id,
                    retry_count,
                    backoff_ms = delay_ms,
                    "Scheduling retry with exponential backoff: {}",
                    err.message()
                );
                self.schedule_retry(packet, delay);
            }
            RetryDecision::GiveUp { attempts } => {
                self.ctx.journal.push(
                    &packet.id,
                    RetryAttempt {
                        attempt,
                        at: Utc::now(),
                        error: err.message().to_string(),
                        delay_ms: None,
                    },
                );
                error!(
                    alert = true,
                    packet_id = %packet.id,
                    source = %packet.source,
                    destination = %packet.destination,
                    attempts,
                    "Retries exhausted, moving packet to dead letter: {}",
                    err.message()
                );
                self.dead_letter(
                    packet,
                    DeadLetterReason::MaxRetriesExceeded,
                    err.message().to_string(),
                    attempts,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn on_permanent(&self, packet: DataPacket, err: StoreError) -> Result<()> {
        warn!(
            packet_id = %packet.id,
            source = %packet.source,
            destination = %packet.destination,
            "Store rejected packet permanently: {}",
            err.message()
        );
        let attempts = packet.retry_count + 1;
        self.dead_letter(
            packet,
            DeadLetterReason::PermanentError,
            err.message().to_string(),
            attempts,
        )
        .await
    }

    async fn reject_invalid(&self, packet: DataPacket, err: ValidationError) -> Result<()> {
        warn!(
            packet_id = %packet.id,
            source = %packet.source,
            destination = %packet.destination,
            "Packet failed validation: {}",
            err
        );
        let packet_id = packet.id.clone();
        let attempts = packet.retry_count;
        self.dead_letter(
            packet,
            DeadLetterReason::ValidationFailed,
            err.ledger_message(),
            attempts,
        )
        .await?;
        self.slot.finish(&packet_id);
        Ok(())
    }

    async fn dead_letter(
        &self,
        mut packet: DataPacket,
        reason: DeadLetterReason,
        error_message: String,
        attempts: u32,
    ) -> Result<()> {
        transition(&mut packet, PacketStatus::DeadLetter);
        let history = self.ctx.journal.history(&packet.id);
        let entry = UploadLogEntry::for_packet(&packet, PacketStatus::DeadLetter)
            .with_attempts(attempts)
            .with_error(error_message);

        let outcome = self
            .ctx
            .ledger
            .dead_letter(&entry, reason, &history, &packet)
            .await?;
        if outcome.is_applied() {
            self.ctx.metrics.inc_packets_dead_lettered();
        }
        self.ctx.journal.clear(&packet.id);
        Ok(())
    }

    fn schedule_retry(&self, packet: DataPacket, delay: Duration) {
        let queue = self.ctx.queue.clone();
        let metrics = self.ctx.metrics.clone();
        let shutdown = self.ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(packet_id = %packet.id, "Retry timer dropped at shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    queue.requeue(packet);
                    metrics.set_queue_depth(queue.depth());
                }
            }
        });
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Result of [`WorkerPool::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Every worker finished before the deadline
    pub drained: bool,
    /// Workers aborted at the deadline
    pub aborted: usize,
}

pub struct WorkerPool {
    supervisors: Vec<JoinHandle<bool>>,
    abort: CancellationToken,
    live: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn spawn(ctx: Arc<WorkerContext>, worker_count: usize) -> Self {
        let abort = CancellationToken::new();
        let live = Arc::new(AtomicUsize::new(0));
        let supervisors = (0..worker_count)
            .map(|id| {
                tokio::spawn(supervise(
                    id,
                    ctx.clone(),
                    abort.clone(),
                    live.clone(),
                ))
            })
            .collect();

        info!(worker_count, batch_size = ctx.batch_size, "Worker pool started");
        Self {
            supervisors,
            abort,
            live,
        }
    }

    /// Worker loops currently running.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Wait for workers to exit (the queue must already be closed). Workers
    /// still busy at `deadline` are aborted; their packets stay IN_FLIGHT in
    /// the ledger and are recovered on the next start.
    pub async fn shutdown(self, deadline: Duration) -> DrainReport {
        // Finished handles are popped so none is polled twice.
        let mut pending: VecDeque<JoinHandle<bool>> = self.supervisors.into();
        let waited = tokio::time::timeout(deadline, async {
            while let Some(handle) = pending.front_mut() {
                let _ = handle.await;
                pending.pop_front();
            }
        })
        .await;

        if waited.is_ok() {
            info!("Worker pool drained");
            return DrainReport {
                drained: true,
                aborted: 0,
            };
        }

        warn!(
            deadline_ms = deadline.as_millis() as u64,
            "Drain deadline reached, aborting remaining workers"
        );
        self.abort.cancel();
        let mut aborted = 0;
        for handle in pending {
            if let Ok(true) = handle.await {
                aborted += 1;
            }
        }
        DrainReport {
            drained: false,
            aborted,
        }
    }
}

/// Run, watch and restart one worker slot. Returns `true` if the worker was
/// aborted rather than exiting on its own.
async fn supervise(
    id: usize,
    ctx: Arc<WorkerContext>,
    abort: CancellationToken,
    live: Arc<AtomicUsize>,
) -> bool {
    let slot = InFlight::default();

    loop {
        let worker = Worker {
            id,
            ctx: ctx.clone(),
            slot: slot.clone(),
        };
        let mut handle = tokio::spawn(worker.run());
        live.fetch_add(1, Ordering::SeqCst);
        ctx.metrics.worker_started();

        let outcome = tokio::select! {
            result = &mut handle => Some(result),
            _ = abort.cancelled() => None,
        };

        live.fetch_sub(1, Ordering::SeqCst);
        ctx.metrics.worker_stopped();

        let result = match outcome {
            Some(result) => result,
            None => {
                handle.abort();
                let _ = handle.await;
                let stranded = slot.take_all();
                warn!(
                    worker_id = id,
                    in_flight = stranded.len(),
                    "Worker aborted, in-flight packets left for recovery"
                );
                return true;
            }
        };

        match result {
            Ok(Ok(())) => return false,
            Ok(Err(e)) => error!(worker_id = id, "Worker failed: {}", e),
            Err(e) if e.is_panic() => error!(worker_id = id, "Worker panicked"),
            Err(e) => {
                warn!(worker_id = id, "Worker task cancelled: {}", e);
                return true;
            }
        }

        let stranded = slot.take_all();
        let requeued = stranded.len();
        for mut packet in stranded {
            packet.status = PacketStatus::Pending;
            ctx.queue.requeue(packet);
        }
        ctx.metrics.inc_worker_restarts();
        ctx.metrics.set_queue_depth(ctx.queue.depth());
        warn!(worker_id = id, requeued, "Restarting worker");

        if ctx.queue.is_closed() {
            return false;
        }
        tokio::time::sleep(RESTART_PAUSE).await;
    }
}

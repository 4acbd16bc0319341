//! Bounded, priority-aware ingestion queue.
//!
//! Three FIFO lanes (critical, high, normal) behind one mutex. Producers and
//! workers never see lock contention as an error: `Notify` wakes workers when
//! an item arrives and blocked producers when space frees up.
//!
//! Admission when full: the incoming packet displaces the oldest packet of the
//! lowest class strictly below its own. With no such class it is rejected, so
//! a full queue rejects `normal` first and `critical` only when every slot
//! already holds a critical packet.
//!
//! Dequeue order is by effective priority: each full `aging_threshold` a
//! packet has waited raises it one level (capped at critical). Ties go to the
//! packet enqueued first.
//!
//! Each entry carries its shard id, resolved once on the way in, so batch
//! selection under the lock compares integers instead of hashing.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uplink_protocol::{AdmissionPolicy, DataPacket, Destination, Priority};

use crate::router::ShardRouter;

const LANES: usize = 3;

/// Why an enqueue was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("queue_full: {capacity} slots taken, no packet below {priority} to displace")]
    QueueFull { capacity: usize, priority: Priority },

    #[error("shutting_down")]
    ShuttingDown,
}

impl EnqueueError {
    /// Short reason string returned to producers.
    pub fn reason(&self) -> &'static str {
        match self {
            EnqueueError::QueueFull { .. } => "queue_full",
            EnqueueError::ShuttingDown => "shutting_down",
        }
    }
}

/// Outcome of an enqueue.
#[derive(Debug)]
pub enum Admission {
    Accepted,
    /// Accepted by pushing out a lower-priority packet, which is returned.
    Displaced(Box<DataPacket>),
    Rejected(EnqueueError),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

/// Queue depth per priority class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DepthByPriority {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
}

impl DepthByPriority {
    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal
    }
}

struct Queued {
    packet: DataPacket,
    shard_id: u32,
    enqueued_at: Instant,
}

#[derive(Default)]
struct QueueState {
    lanes: [VecDeque<Queued>; LANES],
    closed: bool,
}

impl QueueState {
    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub capacity: usize,
    pub aging_threshold: Duration,
    pub policy: AdmissionPolicy,
    pub enqueue_timeout: Duration,
    pub router: ShardRouter,
}

impl QueueSettings {
    pub fn from_config(config: &uplink_protocol::PipelineConfig) -> Self {
        Self {
            capacity: config.max_queue_size,
            aging_threshold: config.aging_threshold(),
            policy: config.admission_policy,
            enqueue_timeout: config.enqueue_timeout(),
            router: ShardRouter::new(config.shard_count),
        }
    }
}

pub struct IngestionQueue {
    state: Mutex<QueueState>,
    item_available: Notify,
    space_available: Notify,
    settings: QueueSettings,
}

impl IngestionQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            item_available: Notify::new(),
            space_available: Notify::new(),
            settings: QueueSettings {
                capacity: settings.capacity.max(1),
                aging_threshold: settings.aging_threshold.max(Duration::from_millis(1)),
                ..settings
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    /// A panicking holder cannot leave the lanes half-updated (every
    /// mutation is a single push or pop), so poisoning is ignored.
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolved before taking the lock.
    fn entry(&self, packet: DataPacket) -> Queued {
        Queued {
            shard_id: self.settings.router.resolve_packet(&packet),
            packet,
            enqueued_at: Instant::now(),
        }
    }

    // ========================================================================
    // Producers
    // ========================================================================

    /// Admit a packet according to the configured admission policy.
    pub async fn enqueue(&self, packet: DataPacket) -> Admission {
        match self.settings.policy {
            AdmissionPolicy::Reject => self.try_enqueue(packet),
            AdmissionPolicy::Block => self.enqueue_blocking(packet).await,
        }
    }

    /// Decide immediately: accept, displace a lower class, or reject.
    pub fn try_enqueue(&self, packet: DataPacket) -> Admission {
        let queued = self.entry(packet);
        let admission = {
            let mut state = self.state();
            self.admit(&mut state, queued)
        };
        if admission.is_accepted() {
            self.item_available.notify_one();
        }
        admission
    }

    /// Wait up to `enqueue_timeout` for a free slot, then decide as
    /// [`try_enqueue`](Self::try_enqueue) would.
    async fn enqueue_blocking(&self, packet: DataPacket) -> Admission {
        let deadline = Instant::now() + self.settings.enqueue_timeout;
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state();
                if state.closed || state.len() < self.settings.capacity {
                    break;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        self.try_enqueue(packet)
    }

    fn admit(&self, state: &mut QueueState, queued: Queued) -> Admission {
        if state.closed {
            return Admission::Rejected(EnqueueError::ShuttingDown);
        }

        let priority = queued.packet.priority;

        if state.len() < self.settings.capacity {
            state.lanes[priority.lane()].push_back(queued);
            return Admission::Accepted;
        }

        // Lowest class first, oldest packet within it.
        for lane in (priority.lane() + 1..LANES).rev() {
            if let Some(victim) = state.lanes[lane].pop_front() {
                debug!(
                    packet_id = %queued.packet.id,
                    displaced = %victim.packet.id,
                    "Queue full, displaced lower-priority packet"
                );
                state.lanes[priority.lane()].push_back(queued);
                return Admission::Displaced(Box::new(victim.packet));
            }
        }

        Admission::Rejected(EnqueueError::QueueFull {
            capacity: self.settings.capacity,
            priority,
        })
    }

    /// Put already-admitted work back (retry, crash recovery, ledger
    /// recovery). Bypasses capacity and the closed flag; nothing admitted
    /// once is dropped for lack of space.
    pub fn requeue(&self, packet: DataPacket) {
        let queued = self.entry(packet);
        {
            let mut state = self.state();
            state.lanes[queued.packet.priority.lane()].push_back(queued);
        }
        self.item_available.notify_one();
    }

    // ========================================================================
    // Consumers
    // ========================================================================

    /// Wait for the next packet. Returns `None` once the queue is closed,
    /// even if packets remain (those are collected by `drain_pending`).
    pub async fn dequeue(&self) -> Option<DataPacket> {
        loop {
            let notified = self.item_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.closed {
                    return None;
                }
                if let Some(packet) = pop_at(&mut state, Instant::now(), self.settings.aging_threshold)
                {
                    drop(state);
                    self.space_available.notify_one();
                    return Some(packet);
                }
            }

            notified.await;
        }
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Option<DataPacket> {
        let packet = {
            let mut state = self.state();
            if state.closed {
                return None;
            }
            pop_at(&mut state, Instant::now(), self.settings.aging_threshold)
        };
        if packet.is_some() {
            self.space_available.notify_one();
        }
        packet
    }

    /// Remove up to `limit` queued packets bound for `destination` on
    /// `shard_id`, highest effective priority first. Used to fill a commit
    /// batch.
    pub fn take_batch(
        &self,
        limit: usize,
        destination: Destination,
        shard_id: u32,
    ) -> Vec<DataPacket> {
        if limit == 0 {
            return Vec::new();
        }

        let taken = {
            let mut state = self.state();
            let now = Instant::now();
            let threshold = self.settings.aging_threshold;

            let mut candidates: Vec<(u8, Instant, usize, usize)> = Vec::new();
            for (lane, queue) in state.lanes.iter().enumerate() {
                for (idx, item) in queue.iter().enumerate() {
                    if item.shard_id == shard_id && item.packet.destination == destination {
                        let effective = effective_priority(lane, item.enqueued_at, now, threshold);
                        candidates.push((effective.as_u8(), item.enqueued_at, lane, idx));
                    }
                }
            }
            candidates.sort_by_key(|(effective, enqueued_at, _, _)| (*effective, *enqueued_at));
            candidates.truncate(limit);

            // Remove from the back of each lane first so indices stay valid.
            let mut positions: Vec<(usize, usize)> =
                candidates.iter().map(|(_, _, lane, idx)| (*lane, *idx)).collect();
            positions.sort_unstable_by(|a, b| b.cmp(a));

            let mut removed: Vec<(u8, Instant, DataPacket)> = Vec::with_capacity(positions.len());
            for (lane, idx) in positions {
                if let Some(item) = state.lanes[lane].remove(idx) {
                    let effective = effective_priority(lane, item.enqueued_at, now, threshold);
                    removed.push((effective.as_u8(), item.enqueued_at, item.packet));
                }
            }
            removed.sort_by_key(|(effective, enqueued_at, _)| (*effective, *enqueued_at));
            removed.into_iter().map(|(_, _, packet)| packet).collect::<Vec<_>>()
        };

        for _ in 0..taken.len() {
            self.space_available.notify_one();
        }
        taken
    }

    // ========================================================================
    // Lifecycle and introspection
    // ========================================================================

    /// Stop accepting packets and wake every blocked producer and consumer.
    pub fn close(&self) {
        self.state().closed = true;
        self.item_available.notify_waiters();
        self.space_available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Remove everything still queued, most urgent first.
    pub fn drain_pending(&self) -> Vec<DataPacket> {
        let mut state = self.state();
        let drained: Vec<DataPacket> = state
            .lanes
            .iter_mut()
            .flat_map(|lane| lane.drain(..))
            .map(|item| item.packet)
            .collect();
        drained
    }

    pub fn depth(&self) -> usize {
        self.state().len()
    }

    pub fn depth_by_priority(&self) -> DepthByPriority {
        let state = self.state();
        DepthByPriority {
            critical: state.lanes[Priority::Critical.lane()].len(),
            high: state.lanes[Priority::High.lane()].len(),
            normal: state.lanes[Priority::Normal.lane()].len(),
        }
    }
}

/// Base priority of `lane`, bumped one level per full `threshold` waited.
fn effective_priority(lane: usize, enqueued_at: Instant, now: Instant, threshold: Duration) -> Priority {
    let base = Priority::from_lane(lane).unwrap_or(Priority::Normal);
    let waited = now.saturating_duration_since(enqueued_at);
    let levels = (waited.as_nanos() / threshold.as_nanos().max(1)).min(u128::from(u32::MAX));
    base.bumped(levels as u32)
}

/// Pop the lane head with the best (effective priority, enqueue time).
///
/// Only lane heads are compared: within a lane the head is the oldest packet
/// and therefore the most aged.
fn pop_at(state: &mut QueueState, now: Instant, threshold: Duration) -> Option<DataPacket> {
    let best_lane = state
        .lanes
        .iter()
        .enumerate()
        .filter_map(|(lane, queue)| {
            queue.front().map(|head| {
                let effective = effective_priority(lane, head.enqueued_at, now, threshold);
                (effective.as_u8(), head.enqueued_at, lane)
            })
        })
        .min()
        .map(|(_, _, lane)| lane)?;

    state.lanes[best_lane].pop_front().map(|item| item.packet)
}

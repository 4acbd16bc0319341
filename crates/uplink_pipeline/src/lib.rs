//! Uplink: priority-aware ingestion and upload pipeline.
//!
//! Producers submit [`DataPacket`](uplink_protocol::DataPacket)s over HTTP.
//! Packets wait in a bounded three-lane queue, are validated and routed to a
//! shard, then committed to the destination store by a supervised worker
//! pool. Every status change goes through the SQLite upload ledger, which
//! makes commits idempotent and lets a restart pick up unfinished work.

pub mod cancel;
pub mod error;
pub mod health;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod router;
pub mod store;
pub mod validation;
pub mod worker;

pub use cancel::CancellationToken;
pub use error::{PipelineError, Result};
pub use health::{HealthMonitor, HealthSnapshot, ProbeResult};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pipeline::{HealthReport, HealthStatus, IngestResponse, Pipeline, ShutdownReport};
pub use queue::{Admission, EnqueueError, IngestionQueue, QueueSettings};
pub use retry::{RetryDecision, RetryPolicy};
pub use router::ShardRouter;
pub use store::{CommitStore, FilesystemStore, MemoryStore, StoreError};
pub use validation::{ValidationEngine, ValidationError};
pub use worker::{DrainReport, WorkerPool};

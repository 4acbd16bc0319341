//! Health monitor.
//!
//! Named probes are run on an interval. Every probe runs in its own task
//! under a timeout, so one that errors, panics or hangs is recorded as
//! `ok = false` and the others still report.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;

pub type ProbeFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// A health check. Returns `Err(message)` when unhealthy.
pub type Probe = Arc<dyn Fn() -> ProbeFuture + Send + Sync>;

/// Wrap an async closure as a [`Probe`].
pub fn probe<F, Fut>(f: F) -> Probe
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as ProbeFuture)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub ok: bool,
    pub latency_ms: u64,
    pub last_checked: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub probes: BTreeMap<String, ProbeResult>,
}

impl HealthSnapshot {
    /// `healthy / total`, 1.0 when nothing is registered or nothing has run.
    pub fn overall_score(&self) -> f64 {
        if self.probes.is_empty() {
            return 1.0;
        }
        let healthy = self.probes.values().filter(|r| r.ok).count();
        healthy as f64 / self.probes.len() as f64
    }
}

pub struct HealthMonitor {
    probes: RwLock<Vec<(String, Probe)>>,
    latest: RwLock<HealthSnapshot>,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            probes: RwLock::new(Vec::new()),
            latest: RwLock::new(HealthSnapshot::default()),
            probe_timeout,
        }
    }

    /// Register (or replace) a probe by name.
    pub fn register(&self, name: impl Into<String>, probe: Probe) {
        let name = name.into();
        let mut probes = self.probes.write().unwrap_or_else(|e| e.into_inner());
        probes.retain(|(existing, _)| *existing != name);
        probes.push((name, probe));
    }

    pub fn probe_names(&self) -> Vec<String> {
        let probes = self.probes.read().unwrap_or_else(|e| e.into_inner());
        probes.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Latest results. Probes that have not run yet are absent.
    pub fn snapshot(&self) -> HealthSnapshot {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run every probe once, concurrently, and publish the results.
    pub async fn check_now(&self) -> HealthSnapshot {
        let probes: Vec<(String, Probe)> = {
            let guard = self.probes.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };

        let running: Vec<(String, Instant, JoinHandle<Result<(), String>>)> = probes
            .into_iter()
            .map(|(name, probe)| {
                let timeout = self.probe_timeout;
                let started = Instant::now();
                let handle = tokio::spawn(async move {
                    match tokio::time::timeout(timeout, probe()).await {
                        Ok(result) => result,
                        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
                    }
                });
                (name, started, handle)
            })
            .collect();

        let mut snapshot = HealthSnapshot::default();
        for (name, started, handle) in running {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => Err("probe panicked".to_string()),
                Err(join_err) => Err(format!("probe task failed: {}", join_err)),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            if let Err(error) = &outcome {
                warn!(probe = %name, latency_ms, "Health probe failed: {}", error);
            }
            snapshot.probes.insert(
                name,
                ProbeResult {
                    ok: outcome.is_ok(),
                    latency_ms,
                    last_checked: Utc::now(),
                    error: outcome.err(),
                },
            );
        }

        debug!(score = snapshot.overall_score(), "Health check complete");
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        snapshot
    }

    /// Probe on `interval` until `cancel` fires.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check_now().await;
                    }
                }
            }
            debug!("Health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_no_probes_scores_one() {
        let monitor = monitor();
        assert_eq!(monitor.snapshot().overall_score(), 1.0);
        assert_eq!(monitor.check_now().await.overall_score(), 1.0);
    }

    #[tokio::test]
    async fn test_failing_panicking_and_hung_probes_are_isolated() {
        let monitor = monitor();
        monitor.register("good", probe(|| async { Ok(()) }));
        monitor.register("bad", probe(|| async { Err("disk full".to_string()) }));
        let panics: Probe = Arc::new(|| -> ProbeFuture { panic!("probe blew up") });
        monitor.register("panics", panics);
        monitor.register(
            "hangs",
            probe(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        );

        let snapshot = monitor.check_now().await;
        assert_eq!(snapshot.probes.len(), 4);
        assert!(snapshot.probes["good"].ok);
        assert_eq!(snapshot.probes["bad"].error.as_deref(), Some("disk full"));
        assert_eq!(
            snapshot.probes["panics"].error.as_deref(),
            Some("probe panicked")
        );
        assert!(snapshot.probes["hangs"]
            .error
            .as_deref()
            .unwrap()
            .starts_with("timed out"));
        assert!((snapshot.overall_score() - 0.25).abs() < f64::EPSILON);

        let unhealthy: Vec<&str> = snapshot
            .probes
            .iter()
            .filter(|(_, r)| !r.ok)
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(unhealthy, vec!["bad", "hangs", "panics"]);
        assert_eq!(monitor.snapshot(), snapshot);
    }

    #[tokio::test]
    async fn test_register_replaces_by_name() {
        let monitor = monitor();
        monitor.register("store", probe(|| async { Err("down".to_string()) }));
        monitor.register("store", probe(|| async { Ok(()) }));
        assert_eq!(monitor.probe_names(), vec!["store".to_string()]);
        assert_eq!(monitor.check_now().await.overall_score(), 1.0);
    }

    #[tokio::test]
    async fn test_spawned_loop_publishes_and_stops() {
        let monitor = Arc::new(monitor());
        monitor.register("good", probe(|| async { Ok(()) }));
        let cancel = CancellationToken::new();
        let handle = monitor
            .clone()
            .spawn(Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.snapshot().probes.contains_key("good"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Retry policy shared by workers and producer adapters.

use std::future::Future;
use std::time::Duration;

use tracing::info;
use uplink_protocol::PipelineConfig;

/// What to do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`. `retry_count` is the new count.
    Retry { retry_count: u32, delay: Duration },
    /// Attempts exhausted.
    GiveUp { attempts: u32 },
}

/// Capped exponential backoff: `min(cap, base * 2^retry_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            base,
            cap,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_retries, config.backoff_base(), config.backoff_cap())
    }

    /// Backoff before the attempt following retry number `retry_count`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Decide after a transient failure of a packet that had already been
    /// retried `retry_count` times.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        let next = retry_count.saturating_add(1);
        if next > self.max_retries {
            RetryDecision::GiveUp {
                attempts: retry_count.saturating_add(1),
            }
        } else {
            RetryDecision::Retry {
                retry_count: next,
                delay: self.delay_for(next),
            }
        }
    }

    /// Total attempts a packet gets before it is dead-lettered.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `op` until it succeeds, `is_transient` says the error is final, or
    /// attempts run out. For producers retrying their own enqueue or fetch.
    pub async fn retry<T, E, F, Fut>(
        &self,
        mut op: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut retry_count = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) => match self.decide(retry_count) {
                    RetryDecision::Retry {
                        retry_count: next,
                        delay,
                    } => {
                        info!(
                            retry_count = next,
                            backoff_ms = delay.as_millis() as u64,
                            "Retrying after transient error: {}",
                            err
                        );
                        tokio::time::sleep(delay).await;
                        retry_count = next;
                    }
                    RetryDecision::GiveUp { .. } => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }
}

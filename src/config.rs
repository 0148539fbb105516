//! Construction-time configuration for the orchestrator.

use std::time::Duration;

use crate::dialer::BackoffConfig;
use crate::error::HmonError;

/// Configuration accepted at `Orchestrator` construction. Per `spec.md`
/// §6, the core never reads environment variables, files, or CLI flags
/// directly — this struct is the entire external configuration surface,
/// assembled by the caller.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Default per-command timeout, overridable per call. `min(default,
    /// caller)` is the effective timeout when both are set.
    pub default_command_timeout: Duration,
    /// How long a `FactCache` entry is considered fresh.
    pub fact_cache_ttl: Duration,
    /// Initial delay before the first `Dialer` retry.
    pub retry_initial_delay: Duration,
    /// Upper bound on `Dialer` retry delay.
    pub retry_max_delay: Duration,
    /// Full-jitter fraction applied to each backoff delay, in `[0, 1]`.
    pub retry_jitter: f64,
    /// Upper bound on a single frame's total wire length, in bytes.
    pub max_frame_size: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_command_timeout: Duration::from_secs(30),
            fact_cache_ttl: Duration::from_secs(5 * 60),
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_jitter: 0.2,
            max_frame_size: 64 * 1024 * 1024,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), HmonError> {
        if self.max_frame_size < 8 {
            return Err(HmonError::Configuration(
                "maxFrameSize must be at least 8 bytes (the bare frame header)".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(HmonError::Configuration(format!(
                "retryJitter must be within [0, 1], got {}",
                self.retry_jitter
            )));
        }
        if self.retry_initial_delay > self.retry_max_delay {
            return Err(HmonError::Configuration(
                "retryInitialDelay must not exceed retryMaxDelay".to_owned(),
            ));
        }
        Ok(())
    }

    pub(crate) fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.retry_initial_delay,
            max_delay: self.retry_max_delay,
            jitter: self.retry_jitter,
        }
    }

    /// Builder-style setters, mirroring the construction surface described
    /// in `spec.md` §6; each returns `self` for chaining.
    pub fn with_default_command_timeout(mut self, timeout: Duration) -> Self {
        self.default_command_timeout = timeout;
        self
    }

    pub fn with_fact_cache_ttl(mut self, ttl: Duration) -> Self {
        self.fact_cache_ttl = ttl;
        self
    }

    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration, jitter: f64) -> Self {
        self.retry_initial_delay = initial;
        self.retry_max_delay = max;
        self.retry_jitter = jitter;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: u32) -> Self {
        self.max_frame_size = bytes;
        self
    }
}

//! Classification and retry of control channel failures.
//!
//! Every status code maps to exactly one [`ErrorClass`]. Transient failures
//! are retried forever at a fixed interval (no exponential growth, no
//! jitter); the only way out of a retry loop is success, a fatal status, or
//! shutdown.

use crate::channel::{ChannelError, ChannelResult, StatusCode};
use crate::error::{ControllerError, Result};
use crate::metrics::MetricsCollector;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry after the fixed interval.
    Transient,
    /// Propagate and shut the controller down.
    Fatal,
}

pub fn classify(code: StatusCode) -> ErrorClass {
    match code {
        StatusCode::Unavailable
        | StatusCode::Unknown
        | StatusCode::DeadlineExceeded
        | StatusCode::Aborted
        | StatusCode::ResourceExhausted => ErrorClass::Transient,
        StatusCode::Cancelled
        | StatusCode::InvalidArgument
        | StatusCode::NotFound
        | StatusCode::AlreadyExists
        | StatusCode::PermissionDenied
        | StatusCode::FailedPrecondition
        | StatusCode::OutOfRange
        | StatusCode::Unimplemented
        | StatusCode::Internal
        | StatusCode::DataLoss
        | StatusCode::Unauthenticated => ErrorClass::Fatal,
    }
}

impl ChannelError {
    pub fn is_retryable(&self) -> bool {
        classify(self.code) == ErrorClass::Transient
    }
}

/// Fixed-interval retry bound to the controller's shutdown token.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    interval: Duration,
    shutdown: CancellationToken,
    metrics: Option<MetricsCollector>,
}

impl RetryPolicy {
    pub fn new(interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            interval,
            shutdown,
            metrics: None,
        }
    }

    /// Counts retries and listener errors in `metrics`.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics(&self) -> Option<&MetricsCollector> {
        self.metrics.as_ref()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Sleeps one retry interval. Returns [`ControllerError::Shutdown`] if
    /// shutdown is requested first.
    pub async fn backoff(&self) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ControllerError::Shutdown),
            _ = tokio::time::sleep(self.interval) => Ok(()),
        }
    }

    /// Runs `call` until it succeeds or fails fatally.
    pub async fn retry<T, F, Fut>(
        &self,
        switch: &str,
        operation: &'static str,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ChannelResult<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(switch, operation, attempt, "channel call recovered");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        switch,
                        operation,
                        attempt,
                        code = %err.code,
                        "transient channel error, retrying in {:?}: {}",
                        self.interval,
                        err.message
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry();
                    }
                    self.backoff().await?;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(ControllerError::Channel {
                        switch: switch.to_string(),
                        operation,
                        source: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_classification() {
        assert_eq!(classify(StatusCode::Unavailable), ErrorClass::Transient);
        assert_eq!(classify(StatusCode::Unknown), ErrorClass::Transient);
        assert_eq!(classify(StatusCode::PermissionDenied), ErrorClass::Fatal);
        assert_eq!(classify(StatusCode::Unauthenticated), ErrorClass::Fatal);
        assert_eq!(classify(StatusCode::FailedPrecondition), ErrorClass::Fatal);
        assert_eq!(classify(StatusCode::Cancelled), ErrorClass::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_fixed_interval() {
        let metrics = MetricsCollector::new().unwrap();
        let policy = RetryPolicy::new(Duration::from_secs(2), CancellationToken::new())
            .with_metrics(metrics.clone());
        let attempts = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let value = policy
            .retry("s1", "write_rule", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(ChannelError::new(StatusCode::Unavailable, "down"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(metrics.channel_retries_total.get(), 3.0);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(7), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let policy = RetryPolicy::new(Duration::from_millis(1), CancellationToken::new());
        let attempts = AtomicU32::new(0);
        let result: Result<()> = policy
            .retry("s3", "delete_rule", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ChannelError::new(StatusCode::PermissionDenied, "no")) }
            })
            .await;

        match result {
            Err(ControllerError::Channel {
                switch,
                operation,
                source,
            }) => {
                assert_eq!(switch, "s3");
                assert_eq!(operation, "delete_rule");
                assert_eq!(source.code, StatusCode::PermissionDenied);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let token = CancellationToken::new();
        let policy = RetryPolicy::new(Duration::from_secs(3600), token.clone());
        token.cancel();
        let result: Result<()> = policy
            .retry("s1", "emit_packet", || async {
                Err(ChannelError::new(StatusCode::Unavailable, "down"))
            })
            .await;
        assert!(matches!(result, Err(ControllerError::Shutdown)));
    }
}

use std::time::{Duration, Instant};

use backon::{ConstantBuilder, Retryable};
use tracing::{debug, trace};

/// Per-request cap. The overall deadline is enforced separately.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of one `await_ready` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckResult {
    Ready { elapsed: Duration },
    TimedOut { elapsed: Duration },
}

impl HealthCheckResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, HealthCheckResult::Ready { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            HealthCheckResult::Ready { elapsed } | HealthCheckResult::TimedOut { elapsed } => {
                *elapsed
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ProbeError {
    #[error("status {0}")]
    Status(reqwest::StatusCode),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Polls HTTP health endpoints. Any status in 200..=399 means ready; every
/// other status and every connection error means "not yet".
#[derive(Debug, Clone)]
pub struct HealthGate {
    client: reqwest::Client,
    interval: Duration,
}

impl HealthGate {
    pub fn new(interval: Duration) -> Self {
        // Redirects are not followed so a 3xx counts as ready on its own.
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { client, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    async fn probe(&self, url: &str) -> Result<(), ProbeError> {
        let status = self.client.get(url).send().await?.status();
        if (200..400).contains(&status.as_u16()) {
            Ok(())
        } else {
            Err(ProbeError::Status(status))
        }
    }

    /// Poll `url` every interval until it is healthy or `timeout` elapses.
    pub async fn await_ready(&self, url: &str, timeout: Duration) -> HealthCheckResult {
        let start = Instant::now();
        let polling = (|| async { self.probe(url).await })
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.interval)
                    .with_max_times(usize::MAX),
            )
            .notify(|err: &ProbeError, _| {
                trace!(url, "not ready: {}", err);
            });

        match tokio::time::timeout(timeout, polling).await {
            Ok(Ok(())) => {
                let elapsed = start.elapsed();
                debug!(url, ?elapsed, "healthy");
                HealthCheckResult::Ready { elapsed }
            }
            // The retry budget is effectively unbounded, so an exhausted
            // retry still means the deadline is what stopped us.
            Ok(Err(_)) | Err(_) => HealthCheckResult::TimedOut {
                elapsed: start.elapsed(),
            },
        }
    }

    /// One quick probe, no retries.
    pub async fn is_reachable(&self, url: &str, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.probe(url)).await,
            Ok(Ok(()))
        )
    }
}

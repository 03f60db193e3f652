use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::state::ExitOutcome;

/// A single "is it up yet?" check.
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    async fn is_live(&self) -> bool;
}

/// Succeeds on any 2xx from a GET against `url`.
#[derive(Clone)]
pub struct HttpLivenessCheck {
    http_client: reqwest::Client,
    url: String,
}

impl HttpLivenessCheck {
    pub fn new(url: impl Into<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            http_client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LivenessCheck for HttpLivenessCheck {
    async fn is_live(&self) -> bool {
        match self.http_client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                trace!(url = %self.url, error = %e, "Liveness check failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    TimedOut { waited: Duration },
    ProcessExited(ExitOutcome),
    Cancelled,
}

/// Polls a [`LivenessCheck`] at a fixed interval until it passes or the
/// deadline elapses.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessProbe {
    pub timeout: Duration,
    pub interval: Duration,
}

impl ReadinessProbe {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Wait for readiness. Returns early if the watched process exits or
    /// `cancel` fires.
    pub async fn wait_until_ready(
        &self,
        check: &dyn LivenessCheck,
        exit: &mut watch::Receiver<Option<ExitOutcome>>,
        cancel: &CancellationToken,
    ) -> Result<(), ProbeFailure> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut attempt: u32 = 0;

        loop {
            if let Some(outcome) = *exit.borrow() {
                return Err(ProbeFailure::ProcessExited(outcome));
            }

            attempt += 1;
            let live = tokio::select! {
                live = check.is_live() => live,
                () = cancel.cancelled() => return Err(ProbeFailure::Cancelled),
                () = tokio::time::sleep_until(deadline) => false,
            };
            if live {
                debug!(attempt, elapsed = ?started.elapsed(), "Runtime is ready");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProbeFailure::TimedOut {
                    waited: now - started,
                });
            }

            let wake = (now + self.interval).min(deadline);
            tokio::select! {
                () = tokio::time::sleep_until(wake) => {}
                () = cancel.cancelled() => return Err(ProbeFailure::Cancelled),
                changed = exit.changed() => {
                    if changed.is_err() && exit.borrow().is_none() {
                        // Sender gone without an outcome; keep probing until the deadline.
                        tokio::time::sleep_until(wake).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingCheck {
        calls: Arc<AtomicU32>,
        ready_after: u32,
    }

    #[async_trait]
    impl LivenessCheck for CountingCheck {
        async fn is_live(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_after
        }
    }

    fn probe() -> ReadinessProbe {
        ReadinessProbe::new(Duration::from_secs(30), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_some_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let check = CountingCheck {
            calls: calls.clone(),
            ready_after: 3,
        };
        let (_tx, mut rx) = watch::channel(None);

        let started = Instant::now();
        probe()
            .wait_until_ready(&check, &mut rx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_times_out_on_deadline() {
        let check = CountingCheck {
            calls: Arc::new(AtomicU32::new(0)),
            ready_after: u32::MAX,
        };
        let (_tx, mut rx) = watch::channel(None);

        let started = Instant::now();
        let result = probe()
            .wait_until_ready(&check, &mut rx, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ProbeFailure::TimedOut { .. })));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_exit_aborts_probe() {
        let check = CountingCheck {
            calls: Arc::new(AtomicU32::new(0)),
            ready_after: u32::MAX,
        };
        let (tx, mut rx) = watch::channel(None);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            let _ = tx.send(Some(ExitOutcome::from_code(1)));
        });

        let started = Instant::now();
        let result = probe()
            .wait_until_ready(&check, &mut rx, &CancellationToken::new())
            .await;

        assert_eq!(
            result,
            Err(ProbeFailure::ProcessExited(ExitOutcome::from_code(1)))
        );
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_probe() {
        let check = CountingCheck {
            calls: Arc::new(AtomicU32::new(0)),
            ready_after: u32::MAX,
        };
        let (_tx, mut rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = probe().wait_until_ready(&check, &mut rx, &cancel).await;
        assert_eq!(result, Err(ProbeFailure::Cancelled));
    }
}

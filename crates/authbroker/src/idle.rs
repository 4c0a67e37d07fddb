//! Idle shutdown
//!
//! The service is activated on demand and exits once nothing has happened
//! for a while. Watched components report activity through an
//! [`ActivityReporter`]; every report restarts the countdown. When the
//! countdown expires while every source is idle, [`IdleSupervisor::run`]
//! returns, once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default idle period before shutting down
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug)]
struct Source {
    name: String,
    busy: AtomicBool,
}

/// Handle given to a watched component
#[derive(Debug, Clone)]
pub struct ActivityReporter {
    source: Arc<Source>,
    tx: Option<mpsc::UnboundedSender<()>>,
}

impl ActivityReporter {
    /// A reporter nobody listens to
    pub fn detached(name: impl Into<String>) -> Self {
        Self {
            source: Arc::new(Source {
                name: name.into(),
                busy: AtomicBool::new(false),
            }),
            tx: None,
        }
    }

    /// Report the current busy state. Any report counts as activity.
    pub fn set_busy(&self, busy: bool) {
        let was_busy = self.source.busy.swap(busy, Ordering::SeqCst);
        if was_busy != busy {
            debug!(source = %self.source.name, busy, "Activity changed");
        }
        if let Some(tx) = &self.tx {
            // The supervisor may already have fired
            let _ = tx.send(());
        }
    }

    pub fn is_busy(&self) -> bool {
        self.source.busy.load(Ordering::SeqCst)
    }

}

/// Process-wide idle timer
pub struct IdleSupervisor {
    timeout: Option<Duration>,
    sources: Vec<Arc<Source>>,
    tx: mpsc::UnboundedSender<()>,
    rx: mpsc::UnboundedReceiver<()>,
}

impl IdleSupervisor {
    /// Zero or negative timeouts disable the supervisor
    pub fn new(timeout_ms: i64) -> Self {
        let timeout = u64::try_from(timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            timeout,
            sources: Vec::new(),
            tx,
            rx,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Watch a new source, initially idle
    pub fn watch(&mut self, name: impl Into<String>) -> ActivityReporter {
        let source = Arc::new(Source {
            name: name.into(),
            busy: AtomicBool::new(false),
        });
        self.sources.push(Arc::clone(&source));
        ActivityReporter {
            source,
            tx: Some(self.tx.clone()),
        }
    }

    /// Resolve once the service has been idle for the full timeout.
    /// Never resolves when disabled.
    pub async fn run(self) {
        let Self {
            timeout,
            sources,
            tx,
            mut rx,
        } = self;
        drop(tx);

        let Some(timeout) = timeout else {
            debug!("Idle shutdown disabled");
            return std::future::pending().await;
        };

        let mut deadline = Instant::now() + timeout;
        let mut armed = true;
        let mut open = true;

        loop {
            tokio::select! {
                msg = rx.recv(), if open => match msg {
                    Some(()) => {
                        deadline = Instant::now() + timeout;
                        armed = true;
                    }
                    None => open = false,
                },
                _ = tokio::time::sleep_until(deadline), if armed => {
                    let busy: Vec<&str> = sources
                        .iter()
                        .filter(|s| s.busy.load(Ordering::SeqCst))
                        .map(|s| s.name.as_str())
                        .collect();
                    if busy.is_empty() {
                        info!(timeout_ms = timeout.as_millis() as u64, "Idle timeout reached");
                        return;
                    }
                    debug!(?busy, "Idle timeout reached while busy, waiting for activity");
                    armed = false;
                }
                else => return std::future::pending().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_timeout() {
        let mut supervisor = IdleSupervisor::new(5000);
        let _requests = supervisor.watch("requests");
        let _consent = supervisor.watch("consent");
        let handle = tokio::spawn(supervisor.run());

        sleep(ms(4990)).await;
        assert!(!handle.is_finished());

        sleep(ms(20)).await;
        assert!(handle.is_finished());
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_on_any_source_resets() {
        let mut supervisor = IdleSupervisor::new(5000);
        let requests = supervisor.watch("requests");
        let consent = supervisor.watch("consent");
        let handle = tokio::spawn(supervisor.run());

        sleep(ms(3000)).await;
        requests.set_busy(true);
        requests.set_busy(false);

        sleep(ms(4000)).await;
        consent.set_busy(false);

        // Last activity at 7000ms
        sleep(ms(4990)).await;
        assert!(!handle.is_finished());

        sleep(ms(20)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_source_holds_off_shutdown() {
        let mut supervisor = IdleSupervisor::new(5000);
        let requests = supervisor.watch("requests");
        let handle = tokio::spawn(supervisor.run());

        requests.set_busy(true);
        sleep(ms(20_000)).await;
        assert!(!handle.is_finished());

        requests.set_busy(false);
        sleep(ms(4990)).await;
        assert!(!handle.is_finished());

        sleep(ms(20)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled() {
        let mut supervisor = IdleSupervisor::new(0);
        assert_eq!(supervisor.timeout(), None);
        let _requests = supervisor.watch("requests");
        let handle = tokio::spawn(supervisor.run());

        sleep(ms(60_000)).await;
        assert!(!handle.is_finished());
        handle.abort();

        assert_eq!(IdleSupervisor::new(-5).timeout(), None);
        assert_eq!(IdleSupervisor::new(250).timeout(), Some(ms(250)));
    }

    #[test]
    fn test_detached_reporter() {
        let reporter = ActivityReporter::detached("requests");
        reporter.set_busy(true);
        assert!(reporter.is_busy());
    }
}

//! Periodic tasks with a reentrancy guard.
//!
//! Each task owns its interval, its running flag and its shutdown
//! `Notify`. A tick that arrives while the previous run is still going is
//! skipped and counted instead of queued.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    runs: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
}

impl TaskStats {
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    initial_delay: Duration,
}

impl PeriodicTask {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self { name, period, initial_delay: Duration::ZERO }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Start ticking. Every run of `job` is spawned so a slow run never
    /// blocks shutdown.
    pub fn spawn<F, Fut>(self, job: F) -> TaskHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = Arc::new(Notify::new());
        let stats = TaskStats::default();
        let running = Arc::new(AtomicBool::new(false));
        let name = self.name;

        let notified = Arc::clone(&shutdown);
        let counters = stats.clone();
        let join = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.initial_delay, self.period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(task = name, period_ms = self.period.as_millis() as u64, "periodic task started");
            loop {
                tokio::select! {
                    _ = notified.notified() => break,
                    _ = ticker.tick() => {
                        if running.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
                            counters.skipped.fetch_add(1, Ordering::SeqCst);
                            debug!(task = name, "previous run still in progress, tick skipped");
                            continue;
                        }
                        let guard = RunningGuard(Arc::clone(&running));
                        let runs = Arc::clone(&counters.runs);
                        let fut = job();
                        tokio::spawn(async move {
                            let _guard = guard;
                            fut.await;
                            runs.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                }
            }
            info!(task = name, "periodic task stopped");
        });

        TaskHandle { name, shutdown, join, stats }
    }
}

pub struct TaskHandle {
    name: &'static str,
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
    stats: TaskStats,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> TaskStats {
        self.stats.clone()
    }

    /// Stop ticking. A run already in flight finishes on its own.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.join.await;
    }
}

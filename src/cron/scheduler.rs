//! Cooperative periodic task scheduler (C6's reaper registration point).
//!
//! The daemon only ever schedules one recurring job — the lifecycle
//! reaper (§4.4) — so this is trimmed to exactly that shape: fire-and-await
//! a closure on a fixed interval until canceled, with no named-job
//! registry, enable/disable toggles, or run statistics to track, since
//! nothing in this crate ever looks a job up by name again after
//! scheduling it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info};

/// Handle to a running job, used to cancel it on shutdown.
pub struct JobHandle {
    name: String,
    cancelled: Arc<AtomicBool>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        info!(job = %self.name, "job cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Runs `task` every `interval` until the returned `JobHandle` is cancelled.
/// Each tick is awaited on its own spawned task so a slow or panicking run
/// never stalls the ticker; panics are logged, not propagated.
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    pub async fn schedule<F, Fut>(&self, name: impl Into<String>, interval: Duration, task: F) -> JobHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = JobHandle { name: name.clone(), cancelled: cancelled.clone() };

        let job_name = name.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it

            loop {
                ticker.tick().await;
                if cancelled.load(Ordering::SeqCst) {
                    debug!(job = %job_name, "job stopping (cancelled)");
                    break;
                }

                let start = Instant::now();
                match tokio::spawn(task()).await {
                    Ok(_) => debug!(job = %job_name, elapsed = ?start.elapsed(), "job tick completed"),
                    Err(e) => error!(job = %job_name, error = %e, "job tick panicked"),
                }
            }
        });

        info!(job = %name, ?interval, "scheduled job");
        handle
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn ticks_run_until_cancelled() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = counter.clone();
        let handle = scheduler
            .schedule("test_job", Duration::from_millis(30), move || {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.cancel();
        let count_at_cancel = counter.load(Ordering::SeqCst);
        assert!(count_at_cancel >= 2, "expected at least 2 ticks, got {}", count_at_cancel);

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(counter.load(Ordering::SeqCst), count_at_cancel, "ticks continued after cancel");
    }

    #[test]
    fn job_handle_reports_its_own_name() {
        let handle = JobHandle { name: "lifecycle_reaper".into(), cancelled: Arc::new(AtomicBool::new(false)) };
        assert_eq!(handle.name(), "lifecycle_reaper");
        assert!(!handle.is_cancelled());
    }
}

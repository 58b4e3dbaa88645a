use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::store::Store;

/// Default number of concurrent dispatch-job workers, per §4.8 and §9.
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 10;

const POLL_IDLE_BACKOFF: Duration = Duration::from_millis(200);
const DEADLINE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Durable background runner: a pool of dispatch-job consumers plus a
/// deadline-timer poller, both backed by the `dispatch_jobs` /
/// `deadline_timers` tables so in-flight work survives a process restart.
/// The in-process `tokio::spawn` watcher the Dispatcher schedules on a
/// successful dispatch is the fast path; this poller is the backstop that
/// catches timers whose process died before the sleep fired.
pub struct BackgroundRunner {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    concurrency: usize,
}

impl BackgroundRunner {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<Dispatcher>, concurrency: usize) -> Self {
        Self {
            store,
            dispatcher,
            concurrency,
        }
    }

    /// Spawns the worker pool and the deadline poller as detached tasks and
    /// returns immediately; the caller holds no handle because the runner is
    /// meant to live for the process lifetime.
    pub fn spawn(self: Arc<Self>) {
        for worker_id in 0..self.concurrency {
            let runner = Arc::clone(&self);
            tokio::spawn(async move { runner.run_dispatch_worker(worker_id).await });
        }
        let runner = Arc::clone(&self);
        tokio::spawn(async move { runner.run_deadline_poller().await });
    }

    async fn run_dispatch_worker(&self, worker_id: usize) {
        loop {
            match self.store.claim_dispatch_job().await {
                Ok(Some(job)) => {
                    debug!(worker_id, task_id = %job.task_id, "claimed dispatch job");
                    Dispatcher::dispatch(&self.dispatcher, job.task_id, job.exclude_worker).await;
                    if let Err(error) = self.store.complete_dispatch_job(job.job_id).await {
                        warn!(%error, "failed to mark dispatch job complete");
                    }
                }
                Ok(None) => tokio::time::sleep(POLL_IDLE_BACKOFF).await,
                Err(error) => {
                    warn!(%error, "dispatch job claim failed");
                    tokio::time::sleep(POLL_IDLE_BACKOFF).await;
                }
            }
        }
    }

    async fn run_deadline_poller(&self) {
        loop {
            tokio::time::sleep(DEADLINE_POLL_INTERVAL).await;
            let now = chrono::Utc::now();
            match self.store.claim_due_deadline_timers(now).await {
                Ok(timers) => {
                    for timer in timers {
                        Dispatcher::on_deadline(&self.dispatcher, timer.task_id, timer.worker_agent_id).await;
                    }
                }
                Err(error) => warn!(%error, "deadline timer poll failed"),
            }
        }
    }
}

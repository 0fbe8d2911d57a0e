//! Background loop runner.
//!
//! The control plane runs its loops (reconciler, endpoint sync, metering,
//! health sweep) as named tokio tasks sharing one [`CancellationToken`].
//! [`JobRunner::shutdown`] cancels the token, waits for every loop to
//! finish its current iteration, and aborts whatever is still running when
//! the drain deadline passes.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct JobRunner {
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRunner {
    pub fn new() -> Self {
        JobRunner {
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Token observed by every job; cancel it to begin shutdown.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Run `job` until it returns. The job is expected to watch [`Self::token`].
    pub fn spawn<F>(&mut self, name: &'static str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(job = name, "job started");
        self.handles.push((name, tokio::spawn(job)));
    }

    /// Call `tick` every `period` until cancelled. The first tick fires one
    /// period after spawn. A tick in progress always completes; cancellation
    /// is only observed between ticks.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_interval(name, period, false, tick);
    }

    /// Like [`Self::spawn_periodic`], but the first tick runs right away.
    pub fn spawn_periodic_immediate<F, Fut>(&mut self, name: &'static str, period: Duration, tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_interval(name, period, true, tick);
    }

    fn spawn_interval<F, Fut>(&mut self, name: &'static str, period: Duration, run_first: bool, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.spawn(name, async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The interval's first tick completes immediately.
            if !run_first {
                interval.tick().await;
            }
            info!(job = name, period_secs = period.as_secs(), run_first, "periodic job running");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!(job = name, "periodic job stopped");
        });
    }

    /// Cancel all jobs and wait up to `timeout` for them to drain; stragglers
    /// are aborted.
    pub async fn shutdown(self, timeout: Duration) {
        self.cancel.cancel();
        let deadline = Instant::now() + timeout;
        let mut aborted = 0usize;
        for (name, mut handle) in self.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(job = name, "job drained"),
                Ok(Err(e)) => warn!(job = name, error = %e, "job ended abnormally"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                    warn!(job = name, "job did not drain in time, aborted");
                }
            }
        }
        info!(aborted, "background jobs stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn periodic_job_ticks_until_shutdown() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut runner = JobRunner::new();
        let c = count.clone();
        runner.spawn_periodic("counter", Duration::from_secs(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(runner.len(), 1);

        tokio::time::sleep(Duration::from_secs(35)).await;
        runner.shutdown(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_job_ticks_at_startup() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut runner = JobRunner::new();
        let c = count.clone();
        runner.spawn_periodic_immediate("reconciler", Duration::from_secs(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        runner.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_waits_one_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut runner = JobRunner::new();
        let c = count.clone();
        runner.spawn_periodic("sweep", Duration::from_secs(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        runner.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_job_is_aborted_at_deadline() {
        let mut runner = JobRunner::new();
        runner.spawn("stuck", std::future::pending());
        let started = Instant::now();
        runner.shutdown(Duration::from_secs(2)).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cooperative_job_sees_cancellation() {
        let mut runner = JobRunner::new();
        let token = runner.token();
        let stopped = Arc::new(AtomicUsize::new(0));
        let s = stopped.clone();
        runner.spawn("watcher", async move {
            token.cancelled().await;
            s.fetch_add(1, Ordering::SeqCst);
        });
        runner.shutdown(Duration::from_secs(5)).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}

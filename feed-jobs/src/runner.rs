use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::error::JobError;

/// A periodically scheduled background task. Implementations must be
/// idempotent: a skipped run is corrected by the next one.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run(&self) -> Result<(), JobError>;
}

/// Base interval plus a random jitter so replicas started together do not
/// hit the store in lockstep.
pub fn jittered_delay(interval: Duration, max_jitter: Duration) -> Duration {
    if max_jitter.is_zero() {
        return interval;
    }
    let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter.as_millis() as u64);
    interval + Duration::from_millis(jitter_ms)
}

/// Schedules one job on a jittered interval. Runs execute off the scheduler
/// task; a tick that lands while the previous run is still going is skipped
/// (single-flight), never queued.
pub struct JobRunner<J> {
    job: Arc<J>,
    guard: Arc<Semaphore>,
    interval: Duration,
    max_jitter: Duration,
}

impl<J: Job> JobRunner<J> {
    pub fn new(job: J, interval: Duration, max_jitter: Duration) -> Self {
        Self {
            job: Arc::new(job),
            guard: Arc::new(Semaphore::new(1)),
            interval,
            max_jitter,
        }
    }

    /// Attempts one run. Returns false when the previous run still holds
    /// the guard.
    pub fn tick(&self) -> bool {
        let permit = match self.guard.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                metrics::counter!("job_runs_skipped_total", "job" => self.job.name()).increment(1);
                warn!(job = self.job.name(), "previous run still in flight, skipping");
                return false;
            }
        };

        let job = self.job.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            match job.run().await {
                Ok(()) => {
                    info!(job = job.name(), elapsed = ?started.elapsed(), "job run finished");
                }
                Err(job_error) => {
                    metrics::counter!("job_runs_failed_total", "job" => job.name()).increment(1);
                    error!(job = job.name(), "job run failed: {}", job_error);
                }
            }
            metrics::histogram!("job_run_duration_seconds", "job" => job.name())
                .record(started.elapsed().as_secs_f64());
            drop(permit);
        });

        true
    }

    pub async fn run_forever(&self) {
        loop {
            tokio::time::sleep(jittered_delay(self.interval, self.max_jitter)).await;
            self.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::Notify;

    use super::*;

    struct BlockingJob {
        runs: AtomicU32,
        release: Notify,
    }

    #[async_trait]
    impl Job for Arc<BlockingJob> {
        fn name(&self) -> &'static str {
            "blocking"
        }

        async fn run(&self) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overlapping_runs_are_skipped_not_queued() {
        let job = Arc::new(BlockingJob {
            runs: AtomicU32::new(0),
            release: Notify::new(),
        });
        let runner = JobRunner::new(job.clone(), Duration::from_secs(60), Duration::ZERO);

        assert!(runner.tick());
        tokio::time::sleep(Duration::from_millis(20)).await;

        // first run is parked on the notify, so these ticks must be skipped
        assert!(!runner.tick());
        assert!(!runner.tick());
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        job.release.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(runner.tick());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
        job.release.notify_one();
    }

    #[test]
    fn test_jittered_delay_stays_in_bounds() {
        let interval = Duration::from_secs(60);
        let max_jitter = Duration::from_secs(10);

        for _ in 0..100 {
            let delay = jittered_delay(interval, max_jitter);
            assert!(delay >= interval);
            assert!(delay <= interval + max_jitter);
        }

        assert_eq!(jittered_delay(interval, Duration::ZERO), interval);
    }
}

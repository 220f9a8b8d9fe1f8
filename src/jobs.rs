//! In-process job runner for collection syncs.
//!
//! Each job is attempted up to `tries` times, sleeping `backoff[n]` seconds
//! after the n-th failure (the last entry repeats). Configuration errors
//! are never retried. A job that runs out of attempts is logged as failed
//! and reported back to the caller; it does not stop the other jobs.
//!
//! At most `workers` jobs run at once, on tokio tasks.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::ConfigError;
use crate::transport::{Sleeper, TokioSleeper};

pub type JobFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// A named, re-runnable unit of work.
pub struct Job<T> {
    pub name: String,
    run: Arc<dyn Fn() -> JobFuture<T> + Send + Sync>,
}

impl<T> Job<T> {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move || Box::pin(f())),
        }
    }
}

#[derive(Debug)]
pub struct JobOutcome<T> {
    pub name: String,
    pub attempts: u32,
    pub result: Result<T>,
}

impl<T> JobOutcome<T> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct JobRunner {
    queue: String,
    workers: usize,
    tries: u32,
    backoff: Vec<Duration>,
    sleeper: Arc<dyn Sleeper>,
}

impl JobRunner {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            queue: config.name.clone(),
            workers: config.workers.max(1),
            tries: config.tries.max(1),
            backoff: config.backoff_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Override the queue label (`vectorify sync --queue`).
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(idx).copied().unwrap_or(Duration::ZERO)
    }

    /// Run every job to completion. Outcomes come back in submission order,
    /// one per job; a job whose task panicked yields a failed outcome.
    pub async fn run_all<T: Send + 'static>(&self, jobs: Vec<Job<T>>) -> Vec<JobOutcome<T>> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let permits = permits.clone();
            let attempt = AttemptPolicy {
                tries: self.tries,
                backoff: (1..self.tries).map(|a| self.backoff_for(a)).collect(),
                sleeper: self.sleeper.clone(),
            };
            let span = tracing::info_span!(
                "job",
                queue = %self.queue,
                job = %job.name,
                id = %Uuid::new_v4()
            );

            let name = job.name.clone();
            let handle = tokio::spawn(
                async move {
                    let _permit = permits.acquire_owned().await;
                    attempt.run(job).await
                }
                .instrument(span),
            );
            handles.push((name, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(queue = %self.queue, job = %name, error = %e, "job task panicked");
                    outcomes.push(JobOutcome {
                        name,
                        attempts: 1,
                        result: Err(anyhow!("job panicked: {}", e)),
                    });
                }
            }
        }
        outcomes
    }
}

struct AttemptPolicy {
    tries: u32,
    backoff: Vec<Duration>,
    sleeper: Arc<dyn Sleeper>,
}

impl AttemptPolicy {
    async fn run<T>(self, job: Job<T>) -> JobOutcome<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = (job.run)().await;

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "job succeeded after retry");
                    }
                    return JobOutcome {
                        name: job.name,
                        attempts: attempt,
                        result: Ok(value),
                    };
                }
                Err(e) => e,
            };

            let fatal = err.downcast_ref::<ConfigError>().is_some();
            if fatal || attempt >= self.tries {
                error!(attempts = attempt, error = %format!("{:#}", err), "job failed permanently");
                return JobOutcome {
                    name: job.name,
                    attempts: attempt,
                    result: Err(err),
                };
            }

            let delay = self.backoff[(attempt - 1) as usize];
            warn!(
                attempt,
                retry_in_secs = delay.as_secs(),
                error = %format!("{:#}", err),
                "job failed, will retry"
            );
            self.sleeper.sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingSleeper;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn runner(workers: usize) -> (JobRunner, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::new());
        let config = QueueConfig {
            workers,
            ..QueueConfig::default()
        };
        (JobRunner::new(&config).with_sleeper(sleeper.clone()), sleeper)
    }

    #[test]
    fn backoff_schedule_repeats_last_entry() {
        let (runner, _) = runner(1);
        assert_eq!(runner.backoff_for(1), Duration::from_secs(30));
        assert_eq!(runner.backoff_for(2), Duration::from_secs(60));
        assert_eq!(runner.backoff_for(3), Duration::from_secs(120));
        assert_eq!(runner.backoff_for(9), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let (runner, sleeper) = runner(1);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let job = Job::new("invoices", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("server error: 503");
                }
                Ok(7)
            }
        });

        let outcomes = runner.run_all(vec![job]).await;
        assert_eq!(outcomes[0].attempts, 3);
        assert_eq!(outcomes[0].result.as_ref().unwrap(), &7);
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_secs(30), Duration::from_secs(60)]
        );
    }

    #[tokio::test]
    async fn gives_up_after_tries() {
        let (runner, sleeper) = runner(1);
        let job: Job<()> = Job::new("invoices", || async { anyhow::bail!("down") });

        let outcomes = runner.run_all(vec![job]).await;
        assert!(!outcomes[0].succeeded());
        assert_eq!(outcomes[0].attempts, 3);
        assert_eq!(sleeper.recorded().len(), 2);
    }

    #[tokio::test]
    async fn config_errors_are_not_retried() {
        let (runner, sleeper) = runner(1);
        let job: Job<()> = Job::new("invoices", || async {
            Err(ConfigError::MissingTenant("invoices".to_string()).into())
        });

        let outcomes = runner.run_all(vec![job]).await;
        assert_eq!(outcomes[0].attempts, 1);
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn panicking_job_still_reports_an_outcome() {
        let (runner, _) = runner(2);
        let jobs = vec![
            Job::new("invoices", || async { Ok(1) }),
            Job::new("customers", || async {
                if true {
                    panic!("boom");
                }
                Ok(2)
            }),
            Job::new("orders", || async { Ok(3) }),
        ];

        let outcomes = runner.run_all(jobs).await;
        let names: Vec<&str> = outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["invoices", "customers", "orders"]);
        assert_eq!(outcomes[0].result.as_ref().unwrap(), &1);
        assert!(!outcomes[1].succeeded());
        assert_eq!(outcomes[2].result.as_ref().unwrap(), &3);
    }

    #[tokio::test]
    async fn bounded_concurrency_and_ordered_outcomes() {
        let (runner, _) = runner(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                Job::new(format!("job-{}", i), move || {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(i)
                    }
                })
            })
            .collect();

        let outcomes = runner.run_all(jobs).await;
        let values: Vec<i32> = outcomes.into_iter().map(|o| o.result.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}

//! Worker pool: claims jobs from the SQLite queue and runs them through the
//! coordinator, applying the queue's retry policy.

use scrivener_db::{ClaimedJob, ScrivenerDb};
use scrivener_protocol::{JobPayload, QueuedJob};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cancel::ShutdownToken;
use crate::config::WorkerConfig;
use crate::coordinator::ExecutionCoordinator;

/// Retry multiplier: 4^n, as in 4s, 16s, 64s with the default base.
const BACKOFF_FACTOR: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub lock_duration: Duration,
    pub poll_interval: Duration,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            lock_duration: Duration::from_secs(config.lock_duration_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            retry_backoff_base: Duration::from_millis(config.retry_backoff_base_ms),
            retry_backoff_max: Duration::from_millis(config.retry_backoff_max_ms),
        }
    }
}

impl WorkerSettings {
    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        let factor = BACKOFF_FACTOR.saturating_pow(exponent);
        let millis = (self.retry_backoff_base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.retry_backoff_max)
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    db: ScrivenerDb,
    coordinator: Arc<ExecutionCoordinator>,
    settings: WorkerSettings,
    shutdown: ShutdownToken,
}

impl WorkerPool {
    pub fn new(
        db: ScrivenerDb,
        coordinator: Arc<ExecutionCoordinator>,
        settings: WorkerSettings,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            db,
            coordinator,
            settings,
            shutdown,
        }
    }

    /// Claim and run jobs until shutdown is requested, then wait for in-flight jobs.
    pub async fn run(&self) {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut tasks = JoinSet::new();
        info!(concurrency = self.settings.concurrency, "Worker pool started");

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.requested() => break,
            };

            match self.db.claim_job(self.settings.lock_duration.as_millis() as i64).await {
                Ok(Some(claimed)) => {
                    let pool = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        pool.handle(claimed).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Failed to claim job");
                    if self.idle().await {
                        break;
                    }
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Job task panicked");
                }
            }
        }

        info!(in_flight = tasks.len(), "Worker pool stopping; waiting for in-flight jobs");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job task panicked");
            }
        }
        info!("Worker pool stopped");
    }

    /// Sleep one poll interval. Returns true if shutdown was requested meanwhile.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.poll_interval) => false,
            _ = self.shutdown.requested() => true,
        }
    }

    /// Run one claimed job and settle it in the queue.
    pub async fn handle(&self, claimed: ClaimedJob) {
        let payload: JobPayload = match serde_json::from_str(&claimed.payload) {
            Ok(payload) => payload,
            Err(e) => {
                let message = format!("Unparseable job payload: {}", e);
                warn!(job_id = %claimed.id, error = %e, "Unparseable job payload; moving to dead letter");
                self.coordinator
                    .dead_letter_unparseable(&claimed.id, &claimed.payload, claimed.attempts_made, &message)
                    .await;
                self.settle_failed(&claimed.id, &message).await;
                return;
            }
        };

        let job = QueuedJob {
            id: claimed.id,
            payload,
            attempts_made: claimed.attempts_made,
            max_attempts: claimed.max_attempts,
        };

        // Redelivered after the last attempt's worker lost its lock.
        if job.attempts_made > job.max_attempts {
            let message = format!(
                "Worker lock lost during final attempt ({} of {})",
                job.max_attempts, job.max_attempts
            );
            warn!(job_id = %job.id, "{}", message);
            self.coordinator.on_job_failed(&job, &message).await;
            self.settle_failed(&job.id, &message).await;
            return;
        }

        match self.coordinator.process(&job).await {
            Ok(outcome) => {
                debug!(job_id = %job.id, ?outcome, "Job processed");
                if let Err(e) = self.db.complete_job(&job.id).await {
                    error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                }
            }
            Err(err) if err.is_permanent() || job.attempts_exhausted() => {
                let message = err.to_string();
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    permanent = err.is_permanent(),
                    error = %message,
                    "Job failed"
                );
                self.coordinator.on_job_failed(&job, &message).await;
                self.settle_failed(&job.id, &message).await;
            }
            Err(err) => {
                let backoff = self.settings.backoff(job.attempts_made);
                info!(
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Scheduling retry with exponential backoff"
                );
                self.coordinator.on_attempt_failed(&job, &err).await;
                if let Err(e) = self
                    .db
                    .retry_job(&job.id, &err.to_string(), backoff.as_millis() as i64)
                    .await
                {
                    error!(job_id = %job.id, error = %e, "Failed to schedule retry");
                }
            }
        }
    }

    async fn settle_failed(&self, job_id: &str, message: &str) {
        if let Err(e) = self.db.fail_job(job_id, message).await {
            error!(job_id, error = %e, "Failed to mark job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let settings = WorkerSettings {
            concurrency: 1,
            lock_duration: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
            retry_backoff_base: Duration::from_secs(4),
            retry_backoff_max: Duration::from_secs(60),
        };
        assert_eq!(settings.backoff(1), Duration::from_secs(4));
        assert_eq!(settings.backoff(2), Duration::from_secs(16));
        assert_eq!(settings.backoff(3), Duration::from_secs(60));
        assert_eq!(settings.backoff(40), Duration::from_secs(60));
    }
}

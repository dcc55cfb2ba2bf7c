//! Scheduler tick loop.
//!
//! A single scheduling task scans enabled jobs, claims the due ones, and
//! dispatches each run to the executor on its own worker so a slow job
//! never stalls the tick. Finalization records run state, recomputes the
//! next fire, honors `deleteAfterRun`, and appends the run history line.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::history::RunHistory;
use super::schedule::next_run_at;
use super::store::CronStore;
use super::types::{CronJob, RunLogEntry, RunStatus};
use crate::config::CronConfig;
use crate::error::KeeperError;
use crate::util::now_ms;

/// Outcome of one job run
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: RunStatus,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl ExecutionResult {
    pub fn ok(summary: impl Into<String>, duration_ms: i64) -> Self {
        Self {
            status: RunStatus::Ok,
            summary: Some(summary.into()),
            error: None,
            duration_ms,
        }
    }

    pub fn error(message: impl Into<String>, duration_ms: i64) -> Self {
        Self {
            status: RunStatus::Error,
            summary: None,
            error: Some(message.into()),
            duration_ms,
        }
    }
}

/// Collaborator that performs a job's work.
///
/// Implementations must respect `timeout` themselves where possible; the
/// scheduler additionally enforces it and records `error = "timeout"` on
/// expiry.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &CronJob, prompt: &str, timeout: Duration) -> ExecutionResult;
}

/// The tick-loop scheduler
pub struct Scheduler {
    store: Arc<CronStore>,
    history: Arc<RunHistory>,
    executor: Arc<dyn JobExecutor>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<CronStore>,
        history: Arc<RunHistory>,
        executor: Arc<dyn JobExecutor>,
        config: &CronConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            history,
            executor,
            tick_interval: Duration::from_millis(config.tick_interval_ms.clamp(50, 1000)),
        })
    }

    /// Run ticks until the stop signal fires
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => self.tick(now_ms()).await,
            }
        }
    }

    /// One scheduling pass: claim due jobs and dispatch them.
    ///
    /// This is the sole mutator of job state; a claimed job is skipped by
    /// later ticks until its run finalizes.
    pub async fn tick(&self, now: i64) {
        let jobs = match self.store.list() {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("cannot list cron jobs: {e}");
                return;
            }
        };

        for job in jobs {
            if !job.enabled || job.state.running_at_ms.is_some() {
                continue;
            }

            let next = match job.state.next_run_at_ms {
                Some(next) => next,
                None => {
                    // Freshly created or edited job: compute and persist
                    // its first fire time
                    match next_run_at(&job.schedule, &job.state, job.created_at_ms, now) {
                        Some(next) => {
                            let result = self.store.update(&job.id, |stored| {
                                stored.state.next_run_at_ms = Some(next);
                            });
                            if let Err(e) = result {
                                warn!(job = %job.id, "cannot persist next run: {e}");
                            }
                            next
                        }
                        None => continue,
                    }
                }
            };

            if next > now {
                continue;
            }

            // Claim before dispatch
            let claimed = self.store.update(&job.id, |stored| {
                stored.state.running_at_ms = Some(now);
            });
            let job = match claimed {
                Ok(job) => job,
                Err(e) => {
                    warn!(job = %job.id, "cannot claim job: {e}");
                    continue;
                }
            };

            self.dispatch(job);
        }
    }

    /// Run one claimed job on its own worker
    fn dispatch(&self, job: CronJob) {
        let store = self.store.clone();
        let history = self.history.clone();
        let executor = self.executor.clone();

        tokio::spawn(async move {
            let timeout = Duration::from_secs(job.payload.timeout_seconds.max(1));
            let started = std::time::Instant::now();

            debug!(job = %job.id, name = %job.name, "executing cron job");
            let result =
                match tokio::time::timeout(timeout, executor.execute(&job, &job.payload.text, timeout))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => ExecutionResult {
                        status: RunStatus::Error,
                        summary: None,
                        error: Some("timeout".to_string()),
                        duration_ms: started.elapsed().as_millis() as i64,
                    },
                };

            if let Err(e) = finalize(&store, &history, &job, &result) {
                error!(job = %job.id, "cannot finalize cron run: {e}");
            }
        });
    }
}

/// Record a finished run: state fields, next fire time, one-shot
/// deletion, and the history line.
fn finalize(
    store: &CronStore,
    history: &RunHistory,
    job: &CronJob,
    result: &ExecutionResult,
) -> crate::error::Result<()> {
    let now = now_ms();

    let updated = store.update(&job.id, |stored| {
        stored.state.last_run_at_ms = Some(now);
        stored.state.last_status = Some(result.status);
        stored.state.last_error = result.error.clone();
        stored.state.last_duration_ms = Some(result.duration_ms);
        stored.state.running_at_ms = None;
        stored.state.next_run_at_ms =
            next_run_at(&stored.schedule, &stored.state, stored.created_at_ms, now);
        stored.updated_at_ms = now;
    })?;

    if updated.delete_after_run && updated.is_one_shot() && result.status == RunStatus::Ok {
        match store.remove(&updated.id) {
            Ok(()) => info!(job = %updated.id, "one-shot job completed and removed"),
            Err(KeeperError::NotFound(_)) => {}
            Err(e) => warn!(job = %updated.id, "cannot remove one-shot job: {e}"),
        }
    }

    history.append(
        &job.id,
        &RunLogEntry {
            ts_ms: now,
            status: result.status,
            duration_ms: result.duration_ms,
            summary: result.summary.clone(),
            error: result.error.clone(),
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::types::{Payload, Schedule};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingExecutor {
        runs: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl RecordingExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: true,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                delay,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl JobExecutor for RecordingExecutor {
        async fn execute(&self, _job: &CronJob, prompt: &str, _timeout: Duration) -> ExecutionResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                ExecutionResult::error("executor failed", 5)
            } else {
                ExecutionResult::ok(format!("ran: {prompt}"), 5)
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<CronStore>,
        history: Arc<RunHistory>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CronStore::new(dir.path().join("jobs.json")));
        let history = Arc::new(RunHistory::new(dir.path().join("runs")));
        Fixture {
            _dir: dir,
            store,
            history,
        }
    }

    fn scheduler_with(fx: &Fixture, executor: Arc<dyn JobExecutor>) -> Arc<Scheduler> {
        Scheduler::new(
            fx.store.clone(),
            fx.history.clone(),
            executor,
            &CronConfig::default(),
        )
    }

    async fn settle() {
        // Let spawned run tasks finalize
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_due_job_runs_and_records_state() {
        let fx = fixture();
        let executor = RecordingExecutor::new();
        let scheduler = scheduler_with(&fx, executor.clone());

        let mut job = CronJob::new(
            "due",
            Schedule::Every { every_ms: 3_600_000 },
            Payload::agent_turn("work"),
        );
        job.state.next_run_at_ms = Some(now_ms() - 1_000);
        let id = job.id.clone();
        fx.store.add(job).unwrap();

        scheduler.tick(now_ms()).await;
        settle().await;

        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);

        let job = fx.store.get(&id).unwrap();
        assert_eq!(job.state.last_status, Some(RunStatus::Ok));
        assert!(job.state.running_at_ms.is_none());
        assert!(job.state.last_run_at_ms.is_some());
        assert!(job.state.next_run_at_ms.unwrap() > now_ms());

        let runs = fx.history.read(&id, 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Ok);
        assert_eq!(runs[0].summary.as_deref(), Some("ran: work"));
    }

    #[tokio::test]
    async fn test_future_and_disabled_jobs_do_not_run() {
        let fx = fixture();
        let executor = RecordingExecutor::new();
        let scheduler = scheduler_with(&fx, executor.clone());

        let mut future = CronJob::new(
            "future",
            Schedule::Every { every_ms: 1_000 },
            Payload::agent_turn("later"),
        );
        future.state.next_run_at_ms = Some(now_ms() + 60_000);
        fx.store.add(future).unwrap();

        let mut disabled = CronJob::new(
            "disabled",
            Schedule::Every { every_ms: 1_000 },
            Payload::agent_turn("never"),
        );
        disabled.enabled = false;
        disabled.state.next_run_at_ms = Some(now_ms() - 1_000);
        fx.store.add(disabled).unwrap();

        scheduler.tick(now_ms()).await;
        settle().await;

        assert_eq!(executor.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fresh_job_gets_next_run_without_running() {
        let fx = fixture();
        let executor = RecordingExecutor::new();
        let scheduler = scheduler_with(&fx, executor.clone());

        let job = CronJob::new(
            "fresh",
            Schedule::Every { every_ms: 3_600_000 },
            Payload::agent_turn("x"),
        );
        let id = job.id.clone();
        fx.store.add(job).unwrap();

        scheduler.tick(now_ms()).await;
        settle().await;

        // First fire is created_at + period, so nothing ran yet
        assert_eq!(executor.runs.load(Ordering::SeqCst), 0);
        let job = fx.store.get(&id).unwrap();
        assert!(job.state.next_run_at_ms.is_some());
    }

    #[tokio::test]
    async fn test_running_job_is_not_claimed_twice() {
        let fx = fixture();
        let executor = RecordingExecutor::slow(Duration::from_millis(200));
        let scheduler = scheduler_with(&fx, executor.clone());

        let mut job = CronJob::new(
            "slow",
            Schedule::Every { every_ms: 1_000 },
            Payload::agent_turn("x"),
        );
        job.state.next_run_at_ms = Some(now_ms() - 1_000);
        fx.store.add(job).unwrap();

        scheduler.tick(now_ms()).await;
        // Second tick while the first run is still in flight
        scheduler.tick(now_ms()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_executor_error_recorded_and_scheduler_survives() {
        let fx = fixture();
        let executor = RecordingExecutor::failing();
        let scheduler = scheduler_with(&fx, executor.clone());

        let mut job = CronJob::new(
            "failing",
            Schedule::Every { every_ms: 3_600_000 },
            Payload::agent_turn("x"),
        );
        job.state.next_run_at_ms = Some(now_ms() - 1_000);
        let id = job.id.clone();
        fx.store.add(job).unwrap();

        scheduler.tick(now_ms()).await;
        settle().await;

        let job = fx.store.get(&id).unwrap();
        assert_eq!(job.state.last_status, Some(RunStatus::Error));
        assert_eq!(job.state.last_error.as_deref(), Some("executor failed"));
        // Failure still schedules the next fire
        assert!(job.state.next_run_at_ms.unwrap() > now_ms());

        let runs = fx.history.read(&id, 10).unwrap();
        assert_eq!(runs[0].status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_timeout_yields_timeout_error() {
        let fx = fixture();
        let executor = RecordingExecutor::slow(Duration::from_secs(5));
        let scheduler = scheduler_with(&fx, executor.clone());

        let mut job = CronJob::new(
            "slow",
            Schedule::Every { every_ms: 3_600_000 },
            Payload::agent_turn("x"),
        );
        job.payload.timeout_seconds = 1;
        job.state.next_run_at_ms = Some(now_ms() - 1_000);
        let id = job.id.clone();
        fx.store.add(job).unwrap();

        tokio::time::pause();
        scheduler.tick(now_ms()).await;
        // Let the spawned run register its timers before advancing the clock
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::time::resume();
        settle().await;

        let job = fx.store.get(&id).unwrap();
        assert_eq!(job.state.last_status, Some(RunStatus::Error));
        assert_eq!(job.state.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_one_shot_delete_after_run() {
        let fx = fixture();
        let executor = RecordingExecutor::new();
        let scheduler = scheduler_with(&fx, executor.clone());

        let mut job = CronJob::new(
            "once",
            Schedule::At { at_ms: now_ms() - 1_000 },
            Payload::agent_turn("x"),
        );
        job.delete_after_run = true;
        let id = job.id.clone();
        fx.store.add(job).unwrap();

        scheduler.tick(now_ms()).await;
        settle().await;

        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
        assert!(matches!(fx.store.get(&id), Err(KeeperError::NotFound(_))));
        // History survives the job deletion
        let runs = fx.history.read(&id, 10).unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_one_shot_without_delete_flag_becomes_terminal() {
        let fx = fixture();
        let executor = RecordingExecutor::new();
        let scheduler = scheduler_with(&fx, executor.clone());

        let mut job = CronJob::new(
            "once",
            Schedule::At { at_ms: now_ms() - 1_000 },
            Payload::agent_turn("x"),
        );
        job.state.next_run_at_ms = Some(now_ms() - 1_000);
        let id = job.id.clone();
        fx.store.add(job).unwrap();

        scheduler.tick(now_ms()).await;
        settle().await;
        scheduler.tick(now_ms()).await;
        settle().await;

        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
        let job = fx.store.get(&id).unwrap();
        assert_eq!(job.state.next_run_at_ms, None);
    }
}

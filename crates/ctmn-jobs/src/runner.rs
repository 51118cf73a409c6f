//! The protected region every job runs inside: the run lock, failure
//! reporting and lock release on every path.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Local, NaiveDateTime};
use ctmn_adapters::{MailRouting, Mailer};
use ctmn_core::{truncate_to_seconds, Environment};
use ctmn_storage::{JobPaths, LockAcquisition, RunLock};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::JobSettings;
use crate::failure::FailureReporter;
use crate::logging::RUN_SPAN;

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time, seconds precision.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        truncate_to_seconds(Local::now().naive_local())
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Collaborators shared by every run in this process.
#[derive(Clone)]
pub struct Runtime {
    pub environment: Environment,
    pub log_dir: PathBuf,
    pub clock: Arc<dyn Clock>,
    pub mailer: Arc<dyn Mailer>,
    pub routing: MailRouting,
}

impl Runtime {
    /// A fresh context (new run id) for one run of `job_code`.
    pub fn context(&self, job_code: &str) -> JobContext {
        JobContext {
            run_id: Uuid::new_v4(),
            job_code: job_code.to_string(),
            environment: self.environment,
            paths: JobPaths::new(&self.log_dir, job_code),
            clock: Arc::clone(&self.clock),
            mailer: Arc::clone(&self.mailer),
            routing: self.routing.clone(),
        }
    }
}

/// Everything a single run needs besides its own settings and data source.
#[derive(Clone)]
pub struct JobContext {
    pub run_id: Uuid,
    pub job_code: String,
    pub environment: Environment,
    pub paths: JobPaths,
    pub clock: Arc<dyn Clock>,
    pub mailer: Arc<dyn Mailer>,
    pub routing: MailRouting,
}

impl JobContext {
    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub sent: usize,
    pub skipped: usize,
    pub export: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunSummary),
    /// A fresh lock from another run was found; nothing was done.
    SkippedLocked,
}

#[async_trait]
pub trait NotificationJob: Send + Sync {
    fn settings(&self) -> &JobSettings;

    async fn run(&self, ctx: &JobContext) -> Result<RunSummary>;

    fn job_code(&self) -> &'static str {
        self.settings().job_code
    }
}

/// Runs `job` under its run lock.
///
/// A held lock ends the run successfully without doing anything. Any error is
/// logged, reported to the monitoring inbox, and returned after the lock is
/// released. Everything the run logs happens inside a [`RUN_SPAN`] carrying
/// the job code, so scheduler logging can file it under that job.
pub async fn run_protected(job: &dyn NotificationJob, runtime: &Runtime) -> Result<RunOutcome> {
    let ctx = runtime.context(job.job_code());
    let span = info_span!(RUN_SPAN, job = %ctx.job_code, run_id = %ctx.run_id);
    run_locked(job, runtime, ctx).instrument(span).await
}

async fn run_locked(job: &dyn NotificationJob, runtime: &Runtime, ctx: JobContext) -> Result<RunOutcome> {
    let settings = job.settings();
    let reporter = FailureReporter::new(Arc::clone(&runtime.mailer), settings, runtime.environment);

    let lock = RunLock::new(ctx.paths.lock_path(), settings.lock_stale_after);
    let guard = match lock.acquire().await {
        Ok(LockAcquisition::Acquired(guard)) => guard,
        Ok(LockAcquisition::Held { age }) => {
            warn!(
                job = %ctx.job_code,
                lock = %lock.path().display(),
                age_secs = age.as_secs(),
                "another instance appears to be running; exiting"
            );
            return Ok(RunOutcome::SkippedLocked);
        }
        Err(err) => {
            error!(job = %ctx.job_code, run_id = %ctx.run_id, error = ?err, "could not acquire run lock");
            reporter.report(&ctx, &err).await;
            return Err(err);
        }
    };

    info!(
        job = %ctx.job_code,
        run_id = %ctx.run_id,
        environment = %ctx.environment,
        "starting job"
    );
    let result = job.run(&ctx).await;
    let outcome = match result {
        Ok(summary) => {
            info!(
                job = %ctx.job_code,
                run_id = %ctx.run_id,
                sent = summary.sent,
                skipped = summary.skipped,
                "job completed successfully"
            );
            Ok(RunOutcome::Completed(summary))
        }
        Err(err) => {
            error!(job = %ctx.job_code, run_id = %ctx.run_id, error = ?err, "unhandled error during job run");
            reporter.report(&ctx, &err).await;
            Err(err)
        }
    };
    guard.release().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use ctmn_adapters::memory::RecordingMailer;
    use ctmn_adapters::Sender;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    struct CountingJob {
        settings: JobSettings,
        runs: AtomicUsize,
        fail: bool,
    }

    impl CountingJob {
        fn new(fail: bool) -> Self {
            Self {
                settings: JobSettings {
                    job_code: "test_job",
                    prefix: "TEST_",
                    lock_stale_after: StdDuration::from_secs(7200),
                    monitor_to: vec!["ops@x.com".into()],
                    sender: Sender {
                        name: "Alerts".into(),
                        address: "alerts@x.com".into(),
                    },
                    cron: None,
                },
                runs: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl NotificationJob for CountingJob {
        fn settings(&self) -> &JobSettings {
            &self.settings
        }

        async fn run(&self, ctx: &JobContext) -> Result<RunSummary> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            assert!(ctx.paths.lock_path().exists(), "lock is held while running");
            if self.fail {
                bail!("query failed");
            }
            Ok(RunSummary::default())
        }
    }

    fn runtime(log_dir: PathBuf, mailer: Arc<RecordingMailer>) -> Runtime {
        Runtime {
            environment: Environment::Prod,
            log_dir,
            clock: Arc::new(SystemClock),
            mailer,
            routing: MailRouting {
                environment: Environment::Prod,
                dev_inbox: vec![],
                bcc: vec![],
            },
        }
    }

    #[tokio::test]
    async fn success_releases_lock() {
        let dir = tempdir().expect("tempdir");
        let mailer = Arc::new(RecordingMailer::new());
        let rt = runtime(dir.path().to_path_buf(), mailer.clone());
        let job = CountingJob::new(false);

        let outcome = run_protected(&job, &rt).await.expect("run");
        assert_eq!(outcome, RunOutcome::Completed(RunSummary::default()));
        assert!(!JobPaths::new(dir.path(), "test_job").lock_path().exists());
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn failure_is_reported_then_returned_and_lock_released() {
        let dir = tempdir().expect("tempdir");
        let mailer = Arc::new(RecordingMailer::new());
        let rt = runtime(dir.path().to_path_buf(), mailer.clone());
        let job = CountingJob::new(true);

        let err = run_protected(&job, &rt).await.unwrap_err();
        assert_eq!(err.to_string(), "query failed");
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ops@x.com");
        assert!(sent[0].subject.contains("test_job"));
        assert!(!JobPaths::new(dir.path(), "test_job").lock_path().exists());
    }

    #[tokio::test]
    async fn report_failure_does_not_mask_original_error() {
        let dir = tempdir().expect("tempdir");
        let mailer = Arc::new(RecordingMailer::new());
        mailer.fail_from(0);
        let rt = runtime(dir.path().to_path_buf(), mailer.clone());
        let job = CountingJob::new(true);

        let err = run_protected(&job, &rt).await.unwrap_err();
        assert_eq!(err.to_string(), "query failed");
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn fresh_lock_skips_without_running() {
        let dir = tempdir().expect("tempdir");
        let lock_path = JobPaths::new(dir.path(), "test_job").lock_path();
        std::fs::create_dir_all(lock_path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&lock_path, "2024-01-01T00:00:00").expect("lock");

        let mailer = Arc::new(RecordingMailer::new());
        let rt = runtime(dir.path().to_path_buf(), mailer.clone());
        let job = CountingJob::new(false);

        let outcome = run_protected(&job, &rt).await.expect("run");
        assert_eq!(outcome, RunOutcome::SkippedLocked);
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_to_string(&lock_path).expect("lock"), "2024-01-01T00:00:00");
    }

    #[tokio::test]
    async fn failure_alert_includes_the_runs_own_log_lines() {
        use crate::logging::JobFileLayer;
        use tracing_subscriber::prelude::*;

        let dir = tempdir().expect("tempdir");
        let subscriber = tracing_subscriber::registry().with(JobFileLayer::new(dir.path()));
        let _default = tracing::subscriber::set_default(subscriber);

        let mailer = Arc::new(RecordingMailer::new());
        let rt = runtime(dir.path().to_path_buf(), mailer.clone());
        run_protected(&CountingJob::new(true), &rt).await.unwrap_err();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].html_body.contains("starting job"), "{}", sent[0].html_body);
        assert!(sent[0].html_body.contains("unhandled error during job run"));
    }

    #[test]
    fn manual_clock_moves_on_request() {
        let start = NaiveDateTime::parse_from_str("2024-01-01T00:00:00", "%Y-%m-%dT%H:%M:%S").expect("ts");
        let clock = ManualClock::new(start);
        clock.advance(Duration::hours(1));
        assert_eq!(clock.now(), start + Duration::hours(1));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}

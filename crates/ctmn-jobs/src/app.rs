//! Process-level wiring: settings, Postgres and SMTP collaborators, and the
//! protected runner for each job.

use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use ctmn_adapters::{connect_pool, AuditLog, PgAuditLog, PgProcAltSource, PgReportSource, SmtpMailer};
use ctmn_core::job_codes;
use ctmn_storage::StateStore;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::config::{
    ActivationSettings, DigestSettings, EnvVars, JobSettings, ProcAltSettings, ProcAltWeeklySettings,
    SharedSettings, ACTIVATION_PREFIX, PROC_ALT_PREFIX, PROC_ALT_WEEKLY_PREFIX, RPE_STAFF_PREFIX,
    UNACK_PREFIX, UPCOMING_PREFIX,
};
use crate::failure::FailureReporter;
use crate::jobs::{ActivationJob, DigestJob, DigestKind, ProcAltAlertJob, ProcAltWeeklyReminderJob};
use crate::runner::{run_protected, NotificationJob, RunOutcome, Runtime, SystemClock};
use crate::schedule::build_scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    ProcAlt,
    ProcAltWeekly,
    RpeStaffWarning,
    UpcomingVisits,
    UnacknowledgedVisits,
    StudyActivation,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::ProcAlt,
        JobKind::ProcAltWeekly,
        JobKind::RpeStaffWarning,
        JobKind::UpcomingVisits,
        JobKind::UnacknowledgedVisits,
        JobKind::StudyActivation,
    ];

    pub fn job_code(&self) -> &'static str {
        match self {
            JobKind::ProcAlt => job_codes::PROC_ALT_ALERT,
            JobKind::ProcAltWeekly => job_codes::PROC_ALT_WEEKLY_REMINDER,
            JobKind::RpeStaffWarning => job_codes::RPE_STAFF_WARNING,
            JobKind::UpcomingVisits => job_codes::UPCOMING_VISITS,
            JobKind::UnacknowledgedVisits => job_codes::UNACKNOWLEDGED_VISITS,
            JobKind::StudyActivation => job_codes::STUDY_ACTIVATION,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            JobKind::ProcAlt => PROC_ALT_PREFIX,
            JobKind::ProcAltWeekly => PROC_ALT_WEEKLY_PREFIX,
            JobKind::RpeStaffWarning => RPE_STAFF_PREFIX,
            JobKind::UpcomingVisits => UPCOMING_PREFIX,
            JobKind::UnacknowledgedVisits => UNACK_PREFIX,
            JobKind::StudyActivation => ACTIVATION_PREFIX,
        }
    }

    fn digest(&self) -> Option<DigestKind> {
        match self {
            JobKind::RpeStaffWarning => Some(DigestKind::RpeStaffWarning),
            JobKind::UpcomingVisits => Some(DigestKind::UpcomingVisits),
            JobKind::UnacknowledgedVisits => Some(DigestKind::UnacknowledgedVisits),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.job_code())
    }
}

/// SMTP relay mailer plus the wall clock.
pub fn build_runtime(shared: &SharedSettings) -> Result<Runtime> {
    let host = shared.require_mail_server()?;
    let routing = shared.routing();
    Ok(Runtime {
        environment: shared.environment,
        log_dir: shared.log_dir.clone(),
        clock: Arc::new(SystemClock),
        mailer: Arc::new(SmtpMailer::relay(host, shared.mail_port, routing.clone())),
        routing,
    })
}

pub async fn connect(shared: &SharedSettings) -> Result<PgPool> {
    connect_pool(shared.require_database_url()?).await
}

/// Builds the job for `kind` against Postgres.
pub fn build_job(
    kind: JobKind,
    env: &EnvVars,
    shared: &SharedSettings,
    pool: &PgPool,
) -> Result<Arc<dyn NotificationJob>> {
    let environment = shared.environment;
    let job: Arc<dyn NotificationJob> = match kind {
        JobKind::ProcAlt => {
            let settings = ProcAltSettings::from_env(env, shared)?;
            let source = Arc::new(PgProcAltSource::new(pool.clone(), settings.columns.clone()));
            let audit: Arc<dyn AuditLog> = Arc::new(PgAuditLog::new(pool.clone(), settings.audit.fqn(environment)));
            let state = StateStore::new(&settings.state_dir, settings.sent_keys_max);
            Arc::new(ProcAltAlertJob::new(settings, source, Some(audit), state))
        }
        JobKind::ProcAltWeekly => {
            let settings = ProcAltWeeklySettings::from_env(env, shared)?;
            let source = Arc::new(PgProcAltSource::new(pool.clone(), settings.columns.clone()));
            let audit = Arc::new(PgAuditLog::new(pool.clone(), settings.audit.fqn(environment)));
            Arc::new(ProcAltWeeklyReminderJob::new(settings, source, audit))
        }
        JobKind::StudyActivation => {
            let settings = ActivationSettings::from_env(env, shared)?;
            let source = Arc::new(PgReportSource::new(pool.clone(), settings.views.clone()));
            Arc::new(ActivationJob::new(settings, source)?)
        }
        JobKind::RpeStaffWarning | JobKind::UpcomingVisits | JobKind::UnacknowledgedVisits => {
            let settings = DigestSettings::from_env(env, shared, kind.job_code(), kind.prefix())?;
            let source = Arc::new(PgReportSource::new(pool.clone(), settings.views.clone()));
            let digest = kind.digest().context("digest job without a digest kind")?;
            Arc::new(DigestJob::new(digest, settings, source))
        }
    };
    Ok(job)
}

/// The settings a failure alert needs when the job's own settings could not be built.
fn fallback_settings(kind: JobKind, env: &EnvVars, shared: &SharedSettings) -> JobSettings {
    JobSettings::from_env(env, shared, kind.job_code(), kind.prefix(), 2).unwrap_or_else(|_| JobSettings {
        job_code: kind.job_code(),
        prefix: kind.prefix(),
        lock_stale_after: StdDuration::from_secs(2 * 3600),
        monitor_to: shared.monitor_recipients(env.prefixed(kind.prefix())),
        sender: shared.sender.clone(),
        cron: None,
    })
}

async fn report_setup_failure(runtime: &Runtime, kind: JobKind, env: &EnvVars, shared: &SharedSettings, err: &anyhow::Error) {
    error!(job = %kind, error = ?err, "could not set up job");
    let settings = fallback_settings(kind, env, shared);
    let reporter = FailureReporter::new(Arc::clone(&runtime.mailer), &settings, runtime.environment);
    reporter.report(&runtime.context(kind.job_code()), err).await;
}

/// One protected run of `kind`. Setup failures (bad configuration, database
/// unreachable) are reported the same way as failures inside the run.
pub async fn run_job(kind: JobKind, env: &EnvVars, shared: &SharedSettings) -> Result<RunOutcome> {
    let runtime = build_runtime(shared)?;
    let setup = async {
        let pool = connect(shared).await?;
        build_job(kind, env, shared, &pool)
    };
    let job = match setup.await {
        Ok(job) => job,
        Err(err) => {
            report_setup_failure(&runtime, kind, env, shared, &err).await;
            return Err(err);
        }
    };
    run_protected(job.as_ref(), &runtime).await
}

/// Runs every job that has `<PREFIX>CRON` set on its schedule until Ctrl-C.
pub async fn run_scheduler(env: &EnvVars, shared: &SharedSettings) -> Result<()> {
    let runtime = build_runtime(shared)?;
    let scheduled: Vec<JobKind> = JobKind::ALL
        .into_iter()
        .filter(|kind| env.prefixed(kind.prefix()).get("CRON").is_some())
        .collect();
    if scheduled.is_empty() {
        warn!("no <PREFIX>CRON variables set; nothing to schedule");
        return Ok(());
    }

    let pool = connect(shared).await?;
    let mut jobs = Vec::with_capacity(scheduled.len());
    for kind in scheduled {
        jobs.push(build_job(kind, env, shared, &pool).with_context(|| format!("configuring {kind}"))?);
    }

    let Some(mut sched) = build_scheduler(runtime, jobs).await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_distinct_code_and_prefix() {
        let codes: std::collections::BTreeSet<_> = JobKind::ALL.iter().map(|k| k.job_code()).collect();
        let prefixes: std::collections::BTreeSet<_> = JobKind::ALL.iter().map(|k| k.prefix()).collect();
        assert_eq!(codes.len(), JobKind::ALL.len());
        assert_eq!(prefixes.len(), JobKind::ALL.len());
        assert_eq!(JobKind::UnacknowledgedVisits.to_string(), "unacknowledged_visits");
    }

    #[test]
    fn runtime_requires_mail_server() {
        let env: EnvVars = [("STATE_DIR", "/tmp")].into_iter().collect();
        let shared = SharedSettings::from_env(&env, true).expect("shared");
        assert!(build_runtime(&shared).is_err());
    }

    #[test]
    fn fallback_settings_survive_bad_job_config() {
        let env: EnvVars = [("PROCALT_LOCK_STALE_HOURS", "soon"), ("MONITOR_TO", "ops@x.com")]
            .into_iter()
            .collect();
        let shared = SharedSettings::from_env(&env, false).expect("shared");
        let settings = fallback_settings(JobKind::ProcAlt, &env, &shared);
        assert_eq!(settings.monitor_to, vec!["ops@x.com"]);
        assert_eq!(settings.job_code, "epay_no_procalt");
    }
}

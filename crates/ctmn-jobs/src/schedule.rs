use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::runner::{run_protected, NotificationJob, RunOutcome, Runtime};

/// Registers every job that has a cron expression. `None` when no job does.
///
/// Each firing goes through [`run_protected`], so a firing that overlaps a
/// still-running instance is skipped by the run lock.
pub async fn build_scheduler(
    runtime: Runtime,
    jobs: Vec<Arc<dyn NotificationJob>>,
) -> Result<Option<JobScheduler>> {
    let scheduled: Vec<_> = jobs
        .into_iter()
        .filter_map(|job| job.settings().cron.clone().map(|cron| (cron, job)))
        .collect();
    if scheduled.is_empty() {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (cron, job) in scheduled {
        let code = job.job_code();
        let runtime = runtime.clone();
        let entry = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let job = Arc::clone(&job);
            let runtime = runtime.clone();
            Box::pin(async move {
                match run_protected(job.as_ref(), &runtime).await {
                    Ok(RunOutcome::Completed(summary)) => {
                        info!(job = job.job_code(), sent = summary.sent, "scheduled run finished");
                    }
                    Ok(RunOutcome::SkippedLocked) => {
                        info!(job = job.job_code(), "scheduled run skipped; previous run still active");
                    }
                    Err(err) => {
                        error!(job = job.job_code(), error = ?err, "scheduled run failed");
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for {code} with cron {cron:?}"))?;
        sched
            .add(entry)
            .await
            .with_context(|| format!("adding scheduler job for {code}"))?;
        info!(job = code, cron = %cron, "scheduled");
    }
    Ok(Some(sched))
}

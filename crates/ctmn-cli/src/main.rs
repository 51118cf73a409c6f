use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use ctmn_jobs::{
    init_logging, init_scheduler_logging, run_job, run_scheduler, EnvVars, JobKind, RunOutcome, SharedSettings,
};
use ctmn_storage::JobPaths;

#[derive(Debug, Parser)]
#[command(name = "ctmn")]
#[command(about = "OnCore clinical trial notification jobs")]
struct Cli {
    /// Run against the dev environment: mail goes to DEV_EMAIL and state gets a `_dev` suffix.
    #[arg(long, global = true)]
    dev: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Hourly alert for visits missing procedure alternatives.
    ProcAlt,
    /// Weekly reminder for procedure alternatives that are still unresolved.
    ProcAltWeekly,
    RpeStaffWarning,
    UpcomingVisits,
    UnacknowledgedVisits,
    StudyActivation,
    /// Run every job with a `<PREFIX>CRON` expression until Ctrl-C.
    Schedule,
}

impl Commands {
    fn job(&self) -> Option<JobKind> {
        match self {
            Commands::ProcAlt => Some(JobKind::ProcAlt),
            Commands::ProcAltWeekly => Some(JobKind::ProcAltWeekly),
            Commands::RpeStaffWarning => Some(JobKind::RpeStaffWarning),
            Commands::UpcomingVisits => Some(JobKind::UpcomingVisits),
            Commands::UnacknowledgedVisits => Some(JobKind::UnacknowledgedVisits),
            Commands::StudyActivation => Some(JobKind::StudyActivation),
            Commands::Schedule => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env = EnvVars::from_process();
    let shared = SharedSettings::from_env(&env, cli.dev)?;

    let Some(kind) = cli.command.job() else {
        init_scheduler_logging(&shared.log_dir)?;
        return run_scheduler(&env, &shared).await;
    };

    let log_file = JobPaths::new(&shared.log_dir, kind.job_code()).daily_log_path(Local::now().date_naive());
    init_logging(Some(&log_file))?;

    match run_job(kind, &env, &shared).await? {
        RunOutcome::Completed(summary) => {
            println!(
                "{kind} complete: sent={} skipped={} export={}",
                summary.sent,
                summary.skipped,
                summary
                    .export
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        RunOutcome::SkippedLocked => {
            println!("{kind} skipped: another run holds the lock");
        }
    }

    Ok(())
}

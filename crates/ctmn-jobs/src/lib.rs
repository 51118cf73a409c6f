//! Notification jobs over the OnCore reporting views.
//!
//! Every job runs through [`run_protected`]: a filesystem run lock, a
//! failure alert to the monitoring inbox, and a parquet record of what was
//! sent. The hourly procedure-alternatives alert additionally keeps a
//! watermark and a bounded sent-key set so overlapping windows never repeat
//! an email.

pub mod app;
pub mod cadence;
pub mod config;
pub mod dedup;
pub mod export;
pub mod failure;
pub mod jobs;
pub mod logging;
pub mod runner;
pub mod schedule;
pub mod window;

pub use app::{build_job, build_runtime, run_job, run_scheduler, JobKind};
pub use cadence::{evaluate, Cadence, HistoryIndex};
pub use config::{ConfigError, EnvVars, JobSettings, SharedSettings};
pub use dedup::{AlertGroupKey, DedupEngine, DedupPlan};
pub use export::{load_manifest, write_sent_records, SentManifest, SentRecords};
pub use failure::FailureReporter;
pub use jobs::{ActivationJob, DigestJob, DigestKind, ProcAltAlertJob, ProcAltWeeklyReminderJob};
pub use logging::{init_logging, init_scheduler_logging, JobFileLayer};
pub use runner::{
    run_protected, Clock, JobContext, ManualClock, NotificationJob, RunOutcome, RunSummary, Runtime, SystemClock,
};
pub use schedule::build_scheduler;
pub use window::{advance_watermark, WindowPolicy};

pub const CRATE_NAME: &str = "ctmn-jobs";

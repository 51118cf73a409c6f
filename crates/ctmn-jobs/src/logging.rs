use std::fmt::{self, Write as _};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use ctmn_core::iso_seconds;
use ctmn_storage::JobPaths;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context as LayerContext;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt as tsfmt, EnvFilter, Layer};

/// Name of the span [`crate::run_protected`] opens around each run; its
/// `job` field selects the daily log file.
pub const RUN_SPAN: &str = "run";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber: stderr always, plus an append-only plain
/// text copy in `log_file` when given. `RUST_LOG` overrides the `info` default.
pub fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                tsfmt::layer()
                    .with_writer(Arc::new(file))
                    .with_target(false)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tsfmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    tracing::debug!(log_file = ?log_file, "logging initialized");
    Ok(())
}

/// Like [`init_logging`] for a process running many jobs: each job's events
/// go to its own `<log_dir>/<job>/logs/<day>.log`.
pub fn init_scheduler_logging(log_dir: &Path) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tsfmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(JobFileLayer::new(log_dir))
        .try_init()
        .context("installing tracing subscriber")?;

    tracing::debug!(log_dir = %log_dir.display(), "scheduler logging initialized");
    Ok(())
}

/// Appends every event recorded inside a [`RUN_SPAN`] to that job's daily log.
/// Events outside a run span are left to the other layers.
#[derive(Debug, Clone)]
pub struct JobFileLayer {
    log_dir: PathBuf,
}

impl JobFileLayer {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self { log_dir: log_dir.into() }
    }

    fn append(&self, job: &str, line: &str) {
        let path = JobPaths::new(&self.log_dir, job).daily_log_path(Local::now().date_naive());
        let written = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| OpenOptions::new().create(true).append(true).open(&path))
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = written {
            eprintln!("could not write {}: {err}", path.display());
        }
    }
}

struct JobTag(String);

impl<S> Layer<S> for JobFileLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: LayerContext<'_, S>) {
        if attrs.metadata().name() != RUN_SPAN {
            return;
        }
        let mut fields = FieldWriter::default();
        attrs.record(&mut fields);
        if let (Some(job), Some(span)) = (fields.job, ctx.span(id)) {
            span.extensions_mut().insert(JobTag(job));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: LayerContext<'_, S>) {
        let Some(job) = ctx.event_scope(event).and_then(|scope| {
            scope
                .from_root()
                .find_map(|span| span.extensions().get::<JobTag>().map(|tag| tag.0.clone()))
        }) else {
            return;
        };

        let mut fields = FieldWriter::default();
        event.record(&mut fields);
        let line = format!(
            "{} {:>5} {}{}\n",
            iso_seconds(Local::now().naive_local()),
            event.metadata().level(),
            fields.message,
            fields.rest
        );
        self.append(&job, &line);
    }
}

/// Splits an event into its message and ` key=value` pairs.
#[derive(Default)]
struct FieldWriter {
    message: String,
    rest: String,
    job: Option<String>,
}

impl Visit for FieldWriter {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_debug(field, &format_args!("{value}"));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            name => {
                if name == "job" {
                    self.job = Some(format!("{value:?}"));
                }
                let _ = write!(self.rest, " {name}={value:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracing::{info, info_span};

    #[test]
    fn run_span_events_land_in_the_job_log() {
        let dir = tempdir().expect("tempdir");
        let subscriber = tracing_subscriber::registry().with(JobFileLayer::new(dir.path()));
        tracing::subscriber::with_default(subscriber, || {
            info!("outside any run");
            let span = info_span!(RUN_SPAN, job = "upcoming_visits");
            let _entered = span.enter();
            info!(rows = 3, "query complete");
        });

        let path = JobPaths::new(dir.path(), "upcoming_visits").daily_log_path(Local::now().date_naive());
        let text = std::fs::read_to_string(path).expect("log");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(" INFO query complete rows=3"), "{}", lines[0]);
    }
}

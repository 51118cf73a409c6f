//! Best-effort failure alerts to the monitoring inbox.

use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use ctmn_adapters::{Mailer, OutgoingEmail, Sender};
use ctmn_core::{iso_seconds, Environment, DEV_PLACEHOLDER_RECIPIENT};
use ctmn_report::{render, FailureAlertEmail};
use tracing::{error, info, warn};

use crate::config::JobSettings;
use crate::runner::JobContext;

/// Log lines included in a failure alert.
pub const LOG_TAIL_LINES: usize = 50;

pub struct FailureReporter {
    mailer: Arc<dyn Mailer>,
    sender: Sender,
    recipients: Vec<String>,
    environment: Environment,
}

impl FailureReporter {
    pub fn new(mailer: Arc<dyn Mailer>, settings: &JobSettings, environment: Environment) -> Self {
        Self {
            mailer,
            sender: settings.sender.clone(),
            recipients: settings.monitor_to.clone(),
            environment,
        }
    }

    /// Sends one diagnostic email for `err`. Never fails: problems while
    /// reporting are logged and dropped so the caller can return `err` as is.
    pub async fn report(&self, ctx: &JobContext, err: &anyhow::Error) {
        let to = if !self.recipients.is_empty() {
            self.recipients.join(";")
        } else if self.environment.is_dev() {
            DEV_PLACEHOLDER_RECIPIENT.to_string()
        } else {
            warn!(job = %ctx.job_code, "no MONITOR_TO configured; failure alert not sent");
            return;
        };

        let log_path = ctx.paths.daily_log_path(ctx.now().date());
        let log_tail = read_log_tail(&log_path, LOG_TAIL_LINES).await;
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".into());

        let body = render(&FailureAlertEmail {
            job_code: &ctx.job_code,
            run_id: ctx.run_id.to_string(),
            environment: self.environment.to_string(),
            host,
            failed_at: iso_seconds(Local::now().naive_local()),
            error_chain: err.chain().map(|cause| cause.to_string()).collect(),
            log_tail: &log_tail,
        });
        let html_body = match body {
            Ok(html) => html,
            Err(render_err) => {
                error!(job = %ctx.job_code, error = %render_err, "could not render failure alert");
                format!("<pre>{err:?}</pre>")
            }
        };

        let email = OutgoingEmail {
            from: self.sender.clone(),
            to,
            subject: format!("[FAILURE] {} ({}) run {}", ctx.job_code, self.environment, ctx.run_id),
            html_body,
            attachment: None,
        };
        match self.mailer.send(&email).await {
            Ok(()) => info!(job = %ctx.job_code, to = %email.to, "failure alert sent"),
            Err(send_err) => error!(job = %ctx.job_code, error = ?send_err, "failure alert could not be sent"),
        }
    }
}

/// Last `n` lines of `path`; empty when the file is missing or unreadable.
pub async fn read_log_tail(path: &Path, n: usize) -> Vec<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let lines: Vec<&str> = text.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines[start..].iter().map(|l| l.to_string()).collect()
        }
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "could not read log tail");
            }
            Vec::new()
        }
    }
}

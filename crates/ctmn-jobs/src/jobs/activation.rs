//! Study activation dashboard reminder: the same email to every study contact
//! and to the leadership list.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ctmn_adapters::ReportSource;
use ctmn_core::ActivationContactRow;
use ctmn_report::{render, ActivationEmail};
use regex::Regex;
use serde::Deserialize;
use tracing::{error, info, warn};

use super::{finish_with_export, run_stamp, send_html};
use crate::config::{ActivationSettings, JobSettings};
use crate::export::SentRecords;
use crate::runner::{JobContext, NotificationJob, RunSummary};

pub const SUBJECT: &str = "YCCI Study Activation Dashboard";
const EMAIL_PATTERN: &str = r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$";
const EXPORT_COLUMNS: &[&str] = &["source"];

/// Pulls well-formed addresses out of free-text contact columns.
#[derive(Debug, Clone)]
pub struct RecipientFilter {
    pattern: Regex,
    separators: Regex,
}

impl RecipientFilter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(EMAIL_PATTERN).context("compiling email pattern")?,
            separators: Regex::new(r"[;,\s]+").context("compiling separator pattern")?,
        })
    }

    /// Trimmed, lower-cased `raw` if it looks like an email address.
    pub fn accept(&self, raw: &str) -> Option<String> {
        let addr = raw.trim().to_lowercase();
        (!addr.is_empty() && self.pattern.is_match(&addr)).then_some(addr)
    }

    /// Every valid address in the contact columns of `rows`. A cell may hold
    /// several addresses separated by `;`, `,` or whitespace.
    pub fn extract(&self, rows: &[ActivationContactRow]) -> BTreeSet<String> {
        rows.iter()
            .flat_map(|row| row.contact_fields())
            .flatten()
            .flat_map(|cell| self.separators.split(cell))
            .filter_map(|part| self.accept(part))
            .collect()
    }
}

/// See [`RecipientFilter::extract`].
pub fn extract_recipients(rows: &[ActivationContactRow]) -> Result<BTreeSet<String>> {
    Ok(RecipientFilter::new()?.extract(rows))
}

#[derive(Debug, Deserialize)]
struct RecipientsFile {
    #[serde(default)]
    recipients: Vec<RecipientEntry>,
}

#[derive(Debug, Deserialize)]
struct RecipientEntry {
    email: String,
    #[serde(rename = "type", default)]
    kind: String,
}

/// The `leadership` entries of a YAML recipients file:
///
/// ```yaml
/// recipients:
///   - email: dean@example.org
///     type: leadership
/// ```
pub async fn load_leadership_recipients(path: &Path, filter: &RecipientFilter) -> Result<Vec<String>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: RecipientsFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file
        .recipients
        .into_iter()
        .filter(|entry| entry.kind.trim().eq_ignore_ascii_case("leadership"))
        .filter_map(|entry| filter.accept(&entry.email))
        .collect())
}

pub struct ActivationJob {
    settings: ActivationSettings,
    source: Arc<dyn ReportSource>,
    filter: RecipientFilter,
}

impl ActivationJob {
    pub fn new(settings: ActivationSettings, source: Arc<dyn ReportSource>) -> Result<Self> {
        Ok(Self {
            settings,
            source,
            filter: RecipientFilter::new()?,
        })
    }

    /// Contacts from the view, unioned with leadership. A missing or broken
    /// recipients file only costs the leadership entries.
    async fn recipients(&self, ctx: &JobContext) -> Result<Vec<(String, &'static str)>> {
        let rows = self
            .source
            .activation_contacts()
            .await
            .context("querying study activation contacts")?;
        let contacts = self.filter.extract(&rows);
        info!(job = %ctx.job_code, rows = rows.len(), contacts = contacts.len(), "collected study contacts");

        let leadership = match load_leadership_recipients(&self.settings.recipients_file, &self.filter).await {
            Ok(list) => {
                info!(job = %ctx.job_code, count = list.len(), "loaded leadership recipients");
                list
            }
            Err(err) => {
                warn!(job = %ctx.job_code, error = ?err, "could not load leadership recipients");
                Vec::new()
            }
        };

        let mut all: Vec<(String, &'static str)> = contacts.into_iter().map(|addr| (addr, "contact")).collect();
        for addr in leadership {
            if !all.iter().any(|(existing, _)| *existing == addr) {
                all.push((addr, "leadership"));
            }
        }
        all.sort();
        Ok(all)
    }
}

#[async_trait]
impl NotificationJob for ActivationJob {
    fn settings(&self) -> &JobSettings {
        &self.settings.job
    }

    async fn run(&self, ctx: &JobContext) -> Result<RunSummary> {
        let started = ctx.now();
        let recipients = self.recipients(ctx).await?;
        if recipients.is_empty() {
            warn!(job = %ctx.job_code, "no valid recipients; nothing to send");
            return Ok(RunSummary::default());
        }
        info!(job = %ctx.job_code, recipients = recipients.len(), "built recipient list");

        let html = render(&ActivationEmail {
            dashboard_url: &self.settings.dashboard_url,
            guide_url: &self.settings.guide_url,
        })?;

        let mut summary = RunSummary::default();
        let mut records = SentRecords::new(EXPORT_COLUMNS);
        let mut failed = Vec::new();
        for (addr, source) in &recipients {
            match send_html(ctx, &self.settings.job.sender, addr, SUBJECT, html.clone(), None).await {
                Ok(()) => {
                    info!(job = %ctx.job_code, recipient = %addr, "email sent");
                    summary.sent += 1;
                    records.push(vec![Some(source.to_string())], &ctx.routing.recorded_recipient(addr), SUBJECT);
                }
                Err(err) => {
                    error!(job = %ctx.job_code, recipient = %addr, error = ?err, "failed to send");
                    failed.push(addr.as_str());
                }
            }
        }

        let sends = if failed.is_empty() {
            Ok(())
        } else {
            summary.skipped = failed.len();
            Err(anyhow::anyhow!(
                "{} of {} activation emails failed: {}",
                failed.len(),
                recipients.len(),
                failed.join(", ")
            ))
        };
        summary.export = finish_with_export(ctx, &run_stamp(ctx, started), &records, sends).await?;
        Ok(summary)
    }
}

//! The notification jobs and the pieces the procedure-alternatives pair share.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use ctmn_adapters::{EmailAttachment, OutgoingEmail, Sender};
use ctmn_core::{iso_seconds, ProcAltRow, UnresolvedProcAltRow};
use ctmn_report::{format_date, Cell, Table, VisitSummary};
use tracing::info;

use crate::export::{write_sent_records, RunStamp, SentRecords};
use crate::runner::JobContext;

pub mod activation;
pub mod digest;
pub mod proc_alt;
pub mod proc_alt_weekly;

pub use activation::{extract_recipients, load_leadership_recipients, ActivationJob, RecipientFilter};
pub use digest::{DigestJob, DigestKind};
pub use proc_alt::ProcAltAlertJob;
pub use proc_alt_weekly::ProcAltWeeklyReminderJob;

/// The columns a procedure-alternatives email table is built from.
pub(crate) trait ProcedureLine {
    fn protocol_no(&self) -> Option<&str>;
    fn subject_name(&self) -> Option<&str>;
    fn visit_date(&self) -> Option<NaiveDate>;
    fn visit_name(&self) -> Option<&str>;
    fn clinical_procedure(&self) -> Option<&str>;

    /// The modification that triggered the notification, when the row has one.
    fn modified_ts(&self) -> Option<NaiveDateTime> {
        None
    }
}

impl ProcedureLine for ProcAltRow {
    fn protocol_no(&self) -> Option<&str> {
        self.protocol_no.as_deref()
    }
    fn subject_name(&self) -> Option<&str> {
        self.subject_name.as_deref()
    }
    fn visit_date(&self) -> Option<NaiveDate> {
        self.visit_date
    }
    fn visit_name(&self) -> Option<&str> {
        self.visit_name.as_deref()
    }
    fn clinical_procedure(&self) -> Option<&str> {
        self.clinical_procedure.as_deref()
    }
    fn modified_ts(&self) -> Option<NaiveDateTime> {
        Some(self.modified_date)
    }
}

impl ProcedureLine for UnresolvedProcAltRow {
    fn protocol_no(&self) -> Option<&str> {
        self.protocol_no.as_deref()
    }
    fn subject_name(&self) -> Option<&str> {
        self.subject_name.as_deref()
    }
    fn visit_date(&self) -> Option<NaiveDate> {
        self.visit_date
    }
    fn visit_name(&self) -> Option<&str> {
        self.visit_name.as_deref()
    }
    fn clinical_procedure(&self) -> Option<&str> {
        self.clinical_procedure.as_deref()
    }
}

pub(crate) const PROCEDURE_EXPORT_COLUMNS: &[&str] = &["visit_id", "visit_date", "visit_name", "clinical_procedure"];
/// Hourly alerts also record which modification triggered them.
pub(crate) const ALERT_EXPORT_COLUMNS: &[&str] =
    &["visit_id", "modified_ts", "visit_date", "visit_name", "clinical_procedure"];

/// Rows in rendering order: visit date, then procedure name.
pub(crate) fn sorted_lines<R: ProcedureLine>(rows: &[R]) -> Vec<&R> {
    let mut sorted: Vec<&R> = rows.iter().collect();
    sorted.sort_by(|a, b| {
        (a.visit_date(), a.clinical_procedure()).cmp(&(b.visit_date(), b.clinical_procedure()))
    });
    sorted
}

pub(crate) fn procedure_table<R: ProcedureLine>(rows: &[R]) -> Table {
    let mut table = Table::new(["VISIT_DATE", "VISIT_NAME", "CLINICAL_PROCEDURE"]);
    for row in sorted_lines(rows) {
        table.push_row(vec![
            Cell::text(format_date(row.visit_date())),
            Cell::text(row.visit_name().unwrap_or_default()),
            Cell::text(row.clinical_procedure().unwrap_or_default()),
        ]);
    }
    table
}

/// Header block for one visit. Identifying fields are constant within a
/// group; they are taken from the last row in rendering order.
pub(crate) fn visit_summary<R: ProcedureLine>(rows: &[R]) -> VisitSummary {
    let last = sorted_lines(rows).into_iter().last();
    VisitSummary {
        protocol_no: last.and_then(|r| r.protocol_no()).unwrap_or_default().to_string(),
        subject_name: last.and_then(|r| r.subject_name()).unwrap_or_default().to_string(),
        visit_date: format_date(last.and_then(|r| r.visit_date())),
        missed_count: rows.len(),
    }
}

pub(crate) fn record_procedures<R: ProcedureLine>(
    records: &mut SentRecords,
    visit_id: i64,
    rows: &[R],
    recipient: &str,
    subject: &str,
) {
    for row in sorted_lines(rows) {
        let mut values = vec![Some(visit_id.to_string())];
        if let Some(modified) = row.modified_ts() {
            values.push(Some(iso_seconds(modified)));
        }
        values.extend([
            row.visit_date().map(|d| d.format("%Y-%m-%d").to_string()),
            row.visit_name().map(str::to_string),
            row.clinical_procedure().map(str::to_string),
        ]);
        records.push(values, recipient, subject);
    }
}

pub(crate) async fn send_html(
    ctx: &JobContext,
    from: &Sender,
    to: &str,
    subject: &str,
    html_body: String,
    attachment: Option<EmailAttachment>,
) -> Result<()> {
    let email = OutgoingEmail {
        from: from.clone(),
        to: to.to_string(),
        subject: subject.to_string(),
        html_body,
        attachment,
    };
    ctx.mailer
        .send(&email)
        .await
        .with_context(|| format!("sending {subject:?} to {to}"))
}

pub(crate) fn run_stamp(ctx: &JobContext, started: chrono::NaiveDateTime) -> RunStamp {
    RunStamp {
        run_id: ctx.run_id,
        environment: ctx.environment,
        run_timestamp: started,
    }
}

/// Writes the export for whatever was sent, then surfaces the send error if
/// there was one. An export error never replaces a send error.
pub(crate) async fn finish_with_export(
    ctx: &JobContext,
    stamp: &RunStamp,
    records: &SentRecords,
    sends: Result<()>,
) -> Result<Option<std::path::PathBuf>> {
    let export = write_sent_records(&ctx.paths, stamp, records).await;
    match (sends, export) {
        (Ok(()), Ok(path)) => {
            match &path {
                Some(path) => info!(job = %ctx.job_code, path = %path.display(), rows = records.len(), "wrote sent records"),
                None => info!(job = %ctx.job_code, "no notifications were sent in this run"),
            }
            Ok(path)
        }
        (Ok(()), Err(err)) => Err(err),
        (Err(err), export) => {
            if let Err(export_err) = export {
                tracing::warn!(job = %ctx.job_code, error = ?export_err, "could not write sent records after a failed send");
            }
            Err(err)
        }
    }
}

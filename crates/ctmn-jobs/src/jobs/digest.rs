//! Per-recipient digest reports: one email per recipient listing every row
//! addressed to them, with a spreadsheet attachment for long lists.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use ctmn_adapters::{EmailAttachment, ReportSource, VisitReport, XLSX_CONTENT_TYPE};
use ctmn_core::{job_codes, present_recipient, StaffWarningRow, VisitTrackingRow};
use ctmn_report::{format_date, render_digest, Cell, Table};
use tracing::{info, warn};

use super::{finish_with_export, run_stamp, send_html};
use crate::config::{DigestSettings, JobSettings};
use crate::dedup::{group_by, DedupEngine};
use crate::export::SentRecords;
use crate::runner::{JobContext, NotificationJob, RunSummary};

const STAFF_HEADERS: &[&str] = &[
    "PROTOCOL_NO",
    "RPE_SENT_DATE",
    "STAFF_ROLE",
    "STAFF_FULL_NAME",
    "ONCORE_CONTACT_DETAIL_URL",
];
const STAFF_EXPORT_COLUMNS: &[&str] = &[
    "protocol_no",
    "sequence_number",
    "rpe_sent_date",
    "staff_role",
    "staff_full_name",
    "oncore_contact_detail_url",
];

const UPCOMING_HEADERS: &[&str] = &[
    "PROTOCOL_NO",
    "SEQUENCE_NUMBER",
    "SEGMENT_NAME",
    "VISIT_DATE",
    "VISIT_NAME",
    "CRA_CONSOLE_VISIT_URL",
];
const UNACKNOWLEDGED_HEADERS: &[&str] = &[
    "PROTOCOL_NO",
    "SEQUENCE_NUMBER",
    "SEGMENT_NAME",
    "VISIT_NAME",
    "CRA_CONSOLE_VISIT_URL",
];
const VISIT_EXPORT_COLUMNS: &[&str] = &[
    "protocol_no",
    "sequence_number",
    "segment_name",
    "visit_date",
    "visit_name",
    "cra_console_visit_url",
];

const VISIT_FOLLOW_UP: &str = "Please use the links to the study visit records in OnCore to review and mark as \
     occurred, missed, or N/A or update the visit date if applicable.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    RpeStaffWarning,
    UpcomingVisits,
    UnacknowledgedVisits,
}

impl DigestKind {
    pub fn job_code(&self) -> &'static str {
        match self {
            DigestKind::RpeStaffWarning => job_codes::RPE_STAFF_WARNING,
            DigestKind::UpcomingVisits => job_codes::UPCOMING_VISITS,
            DigestKind::UnacknowledgedVisits => job_codes::UNACKNOWLEDGED_VISITS,
        }
    }

    /// Shown in the subject line and used for the attachment file name.
    pub fn notification_name(&self) -> &'static str {
        match self {
            DigestKind::RpeStaffWarning => "RPE Staff Warning",
            DigestKind::UpcomingVisits => "Upcoming Visits Next 5 days",
            DigestKind::UnacknowledgedVisits => "Unacknowledged Visits Report",
        }
    }

    pub fn subject(&self) -> String {
        format!("OnCore Notification: {}", self.notification_name())
    }

    fn intro(&self) -> [&'static str; 2] {
        match self {
            DigestKind::RpeStaffWarning => [
                "You recently sent the following protocol(s) via the RPE console in OnCore and the staff \
                 listed are missing required IDs to map correctly into Epic.",
                "Please use the links to review the contact records and enter the appropriate ID into OnCore.",
            ],
            DigestKind::UpcomingVisits => [
                "The included report provides an overview of upcoming subject visits that are planned for \
                 this work week.",
                VISIT_FOLLOW_UP,
            ],
            DigestKind::UnacknowledgedVisits => [
                "The included report provides an overview of visits that have not been marked as occurred, \
                 N/A or missed and are outside the 2 day grace period based on the visit date.",
                VISIT_FOLLOW_UP,
            ],
        }
    }

    fn headers(&self) -> &'static [&'static str] {
        match self {
            DigestKind::RpeStaffWarning => STAFF_HEADERS,
            DigestKind::UpcomingVisits => UPCOMING_HEADERS,
            DigestKind::UnacknowledgedVisits => UNACKNOWLEDGED_HEADERS,
        }
    }

    fn export_columns(&self) -> &'static [&'static str] {
        match self {
            DigestKind::RpeStaffWarning => STAFF_EXPORT_COLUMNS,
            DigestKind::UpcomingVisits | DigestKind::UnacknowledgedVisits => VISIT_EXPORT_COLUMNS,
        }
    }

    async fn fetch(&self, source: &dyn ReportSource) -> Result<Vec<DigestLine>> {
        let lines: Vec<DigestLine> = match self {
            DigestKind::RpeStaffWarning => source
                .staff_warnings()
                .await
                .context("querying RPE staff warnings")?
                .into_iter()
                .map(DigestLine::from_staff)
                .collect(),
            DigestKind::UpcomingVisits => source
                .visits(VisitReport::Upcoming)
                .await
                .context("querying upcoming visits")?
                .into_iter()
                .map(|row| DigestLine::from_visit(row, true))
                .collect(),
            DigestKind::UnacknowledgedVisits => source
                .visits(VisitReport::Unacknowledged)
                .await
                .context("querying unacknowledged visits")?
                .into_iter()
                .map(|row| DigestLine::from_visit(row, false))
                .collect(),
        };
        Ok(lines)
    }
}

type SortKey = (Option<NaiveDate>, Option<String>, Option<i64>);

/// One digest row, already shaped for the table and the export.
#[derive(Debug, Clone)]
struct DigestLine {
    recipient: Option<String>,
    sort_key: SortKey,
    cells: Vec<Cell>,
    export: Vec<Option<String>>,
}

impl DigestLine {
    fn from_staff(row: StaffWarningRow) -> Self {
        let sent_date = format_date(row.rpe_sent_date);
        Self {
            recipient: present_recipient(row.submitter_email.as_deref()).map(str::to_string),
            sort_key: (None, row.protocol_no.clone(), row.sequence_number),
            cells: vec![
                Cell::from(row.protocol_no.as_deref()),
                Cell::text(sent_date.clone()),
                Cell::from(row.staff_role.as_deref()),
                Cell::from(row.staff_full_name.as_deref()),
                Cell::optional_link(row.contact_detail_url.as_deref()),
            ],
            export: vec![
                row.protocol_no,
                row.sequence_number.map(|n| n.to_string()),
                Some(sent_date).filter(|d| !d.is_empty()),
                row.staff_role,
                row.staff_full_name,
                row.contact_detail_url,
            ],
        }
    }

    /// Upcoming visits are ordered by date first and show the date column.
    fn from_visit(row: VisitTrackingRow, upcoming: bool) -> Self {
        let sequence = row.sequence_number.map(|n| n.to_string());
        let visit_date = format_date(row.visit_date);
        let mut cells = vec![
            Cell::from(row.protocol_no.as_deref()),
            Cell::from(sequence.as_deref()),
            Cell::from(row.segment_name.as_deref()),
        ];
        if upcoming {
            cells.push(Cell::text(visit_date.clone()));
        }
        cells.push(Cell::from(row.visit_name.as_deref()));
        cells.push(Cell::optional_link(row.visit_url.as_deref()));

        Self {
            recipient: present_recipient(row.coordinator_email.as_deref()).map(str::to_string),
            sort_key: (
                if upcoming { row.visit_date } else { None },
                row.protocol_no.clone(),
                row.sequence_number,
            ),
            cells,
            export: vec![
                row.protocol_no,
                sequence,
                row.segment_name,
                Some(visit_date).filter(|d| !d.is_empty()),
                row.visit_name,
                row.visit_url,
            ],
        }
    }
}

pub struct DigestJob {
    kind: DigestKind,
    settings: DigestSettings,
    source: Arc<dyn ReportSource>,
}

impl DigestJob {
    pub fn new(kind: DigestKind, settings: DigestSettings, source: Arc<dyn ReportSource>) -> Self {
        Self { kind, settings, source }
    }

    pub fn kind(&self) -> DigestKind {
        self.kind
    }

    async fn send_all(
        &self,
        ctx: &JobContext,
        lines: Vec<DigestLine>,
        records: &mut SentRecords,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let engine = DedupEngine::new(ctx.environment);
        let subject = self.kind.subject();
        let intro = self.kind.intro();
        for group in group_by(lines, |line| line.recipient.clone()) {
            let Some(to) = engine.deliverable_recipient(group.key.as_deref()) else {
                warn!(job = %ctx.job_code, rows = group.rows.len(), "skipping rows with no recipient");
                summary.skipped += 1;
                continue;
            };
            let mut rows = group.rows;
            rows.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));

            let mut table = Table::new(self.kind.headers().iter().copied());
            for line in &rows {
                table.push_row(line.cells.clone());
            }
            let rendered = render_digest(self.kind.notification_name(), &intro, &table)?;
            let attachment = rendered.spreadsheet.map(|(filename, bytes)| EmailAttachment {
                filename,
                content_type: XLSX_CONTENT_TYPE.to_string(),
                bytes,
            });

            info!(
                job = %ctx.job_code,
                recipient = %to,
                rows = rows.len(),
                attachment = attachment.is_some(),
                "sending digest"
            );
            send_html(ctx, &self.settings.job.sender, &to, &subject, rendered.html, attachment).await?;
            summary.sent += 1;

            let recorded = ctx.routing.recorded_recipient(&to);
            for line in rows {
                records.push(line.export, &recorded, &subject);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationJob for DigestJob {
    fn settings(&self) -> &JobSettings {
        &self.settings.job
    }

    async fn run(&self, ctx: &JobContext) -> Result<RunSummary> {
        let started = ctx.now();
        let lines = self.kind.fetch(self.source.as_ref()).await?;
        info!(job = %ctx.job_code, rows = lines.len(), "query complete");
        if lines.is_empty() {
            info!(job = %ctx.job_code, "no rows; nothing to send");
            return Ok(RunSummary::default());
        }

        let mut summary = RunSummary::default();
        let mut records = SentRecords::new(self.kind.export_columns());
        let sends = self.send_all(ctx, lines, &mut records, &mut summary).await;
        summary.export = finish_with_export(ctx, &run_stamp(ctx, started), &records, sends).await?;
        Ok(summary)
    }
}

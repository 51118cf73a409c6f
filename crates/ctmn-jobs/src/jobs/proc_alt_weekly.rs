//! Weekly reminder for procedure alternatives that are still unresolved.
//!
//! Eligibility is recomputed every run from the audit table: a pair that never
//! received an initial alert is never reminded, and reminders are spaced by
//! the configured interval. Each reminder sent is appended to the audit table.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ctmn_adapters::{AuditLog, ProcAltSource};
use ctmn_core::{normalize_recipient, present_recipient, AuditEvent, EventType, IdempotencyKey, UnresolvedProcAltRow};
use ctmn_report::{render, ProcAltReminderEmail};
use tracing::{info, warn};

use super::{
    finish_with_export, procedure_table, record_procedures, run_stamp, send_html, sorted_lines, visit_summary,
    PROCEDURE_EXPORT_COLUMNS,
};
use crate::cadence::{evaluate, Cadence, HistoryIndex};
use crate::config::{JobSettings, ProcAltWeeklySettings};
use crate::dedup::{group_by, DedupEngine, Group};
use crate::export::SentRecords;
use crate::runner::{JobContext, NotificationJob, RunSummary};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReminderGroupKey {
    visit_id: i64,
    recipient: Option<String>,
}

impl ReminderGroupKey {
    fn of(row: &UnresolvedProcAltRow) -> Self {
        Self {
            visit_id: row.visit_id,
            recipient: present_recipient(row.modified_user_email.as_deref()).map(str::to_string),
        }
    }
}

pub struct ProcAltWeeklyReminderJob {
    settings: ProcAltWeeklySettings,
    source: Arc<dyn ProcAltSource>,
    audit: Arc<dyn AuditLog>,
}

impl ProcAltWeeklyReminderJob {
    pub fn new(settings: ProcAltWeeklySettings, source: Arc<dyn ProcAltSource>, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            settings,
            source,
            audit,
        }
    }

    async fn remind(
        &self,
        ctx: &JobContext,
        group: &Group<ReminderGroupKey, UnresolvedProcAltRow>,
        to: &str,
        records: &mut SentRecords,
    ) -> Result<()> {
        let visit_id = group.key.visit_id;
        let recorded_recipient = normalize_recipient(group.key.recipient.as_deref().unwrap_or_default());
        let now = ctx.now();
        let dedupe_key = IdempotencyKey::weekly_reminder(visit_id, &recorded_recipient, now.date());

        let summary = visit_summary(&group.rows);
        let table = procedure_table(&group.rows);
        let recipient_name = sorted_lines(&group.rows)
            .into_iter()
            .last()
            .and_then(|row| row.modified_user_name.as_deref())
            .unwrap_or_default();
        let subject = format!(
            "[OnCore Reminder] Procedure Alternatives Still Missing — Visit {visit_id}: {} missed",
            group.rows.len()
        );
        let html = render(&ProcAltReminderEmail {
            recipient_name,
            summary: &summary,
            table: &table,
            contact_email: self.settings.contact_email.as_deref().unwrap_or_default(),
        })?;

        info!(job = %ctx.job_code, visit_id, recipient = %to, rows = group.rows.len(), "sending weekly reminder");
        send_html(ctx, &self.settings.job.sender, to, &subject, html, None).await?;

        let event = AuditEvent {
            sent_at: now,
            job_code: ctx.job_code.clone(),
            event_type: EventType::WeeklyReminder,
            visit_id: visit_id.to_string(),
            modified_user_email: group.key.recipient.clone(),
            dedupe_key,
            job_run_id: ctx.run_id,
            environment: ctx.environment,
        };
        self.audit
            .append(&event)
            .await
            .with_context(|| format!("recording weekly reminder {}", event.dedupe_key))?;

        record_procedures(records, visit_id, &group.rows, &ctx.routing.recorded_recipient(to), &subject);
        Ok(())
    }

    async fn remind_all(
        &self,
        ctx: &JobContext,
        groups: &[Group<ReminderGroupKey, UnresolvedProcAltRow>],
        history: &HistoryIndex,
        records: &mut SentRecords,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let engine = DedupEngine::new(ctx.environment);
        let interval = self.settings.reminder_interval;
        for group in groups {
            let visit_id = group.key.visit_id;
            let Some(to) = engine.deliverable_recipient(group.key.recipient.as_deref()) else {
                warn!(job = %ctx.job_code, visit_id, "skipping group with empty MODIFIED_USER_EMAIL");
                summary.skipped += 1;
                continue;
            };
            let cadence = evaluate(history.get(visit_id, group.key.recipient.as_deref()), ctx.now(), interval);
            match cadence {
                Cadence::Due => {
                    self.remind(ctx, group, &to, records).await?;
                    summary.sent += 1;
                }
                Cadence::Ineligible => {
                    info!(job = %ctx.job_code, visit_id, recipient = %to, "no INITIAL_ALERT in audit table; not reminding");
                    summary.skipped += 1;
                }
                Cadence::CoolingDownAfterInitial { due_at } => {
                    info!(job = %ctx.job_code, visit_id, recipient = %to, due_at = %due_at, "initial alert is too recent");
                    summary.skipped += 1;
                }
                Cadence::CoolingDownAfterReminder { due_at } => {
                    info!(job = %ctx.job_code, visit_id, recipient = %to, due_at = %due_at, "last reminder is too recent");
                    summary.skipped += 1;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationJob for ProcAltWeeklyReminderJob {
    fn settings(&self) -> &JobSettings {
        &self.settings.job
    }

    async fn run(&self, ctx: &JobContext) -> Result<RunSummary> {
        let started = ctx.now();
        let rows = self
            .source
            .unresolved()
            .await
            .context("querying unresolved procedure alternatives")?;
        info!(job = %ctx.job_code, rows = rows.len(), "query complete");
        if rows.is_empty() {
            info!(job = %ctx.job_code, "no unresolved rows; nothing to remind");
            return Ok(RunSummary::default());
        }

        let job_codes = [self.settings.initial_job_code.clone(), ctx.job_code.clone()];
        let history = self
            .audit
            .history(ctx.environment, &job_codes)
            .await
            .context("loading notification audit history")?;
        let history = HistoryIndex::new(history);
        info!(job = %ctx.job_code, pairs = history.len(), "loaded audit history");

        let groups = group_by(rows, ReminderGroupKey::of);
        let mut summary = RunSummary::default();
        let mut records = SentRecords::new(PROCEDURE_EXPORT_COLUMNS);
        let sends = self
            .remind_all(ctx, &groups, &history, &mut records, &mut summary)
            .await;
        summary.export = finish_with_export(ctx, &run_stamp(ctx, started), &records, sends).await?;
        Ok(summary)
    }
}

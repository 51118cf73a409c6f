//! Hourly procedure-alternatives alert.
//!
//! Reads visits changed inside the current window, sends one email per
//! `(visit, modifying user, modification time)` unless its key is already in the
//! sent-key set, and advances the watermark once every send has been recorded.
//! Delivery is at-least-once: the key is persisted right after each send, so a
//! crash between the two can repeat that single email on the next run.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ctmn_adapters::{AuditLog, ProcAltSource};
use ctmn_core::{AuditEvent, EventType, ProcAltRow, Window};
use ctmn_report::{render, ProcAltAlertEmail};
use ctmn_storage::{SentKeySet, StateStore};
use tracing::{info, warn};

use super::{
    finish_with_export, procedure_table, record_procedures, run_stamp, send_html, visit_summary,
    ALERT_EXPORT_COLUMNS,
};
use crate::config::{JobSettings, ProcAltSettings};
use crate::dedup::{group_by, AlertGroupKey, DedupEngine, Planned};
use crate::export::SentRecords;
use crate::runner::{JobContext, NotificationJob, RunSummary};
use crate::window::advance_watermark;

const WINDOW_LINE_FORMAT: &str = "%Y-%m-%d %H:%M";

pub struct ProcAltAlertJob {
    settings: ProcAltSettings,
    source: Arc<dyn ProcAltSource>,
    audit: Option<Arc<dyn AuditLog>>,
    state: StateStore,
}

impl ProcAltAlertJob {
    /// `audit` is ignored when the settings disable audit writes.
    pub fn new(
        settings: ProcAltSettings,
        source: Arc<dyn ProcAltSource>,
        audit: Option<Arc<dyn AuditLog>>,
        state: StateStore,
    ) -> Self {
        let audit = audit.filter(|_| settings.audit_enabled);
        Self {
            settings,
            source,
            audit,
            state,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    async fn send_one(
        &self,
        ctx: &JobContext,
        window: &Window,
        planned: &Planned<AlertGroupKey, ProcAltRow>,
        records: &mut SentRecords,
    ) -> Result<()> {
        let visit_id = planned.key.visit_id;
        let summary = visit_summary(&planned.rows);
        let table = procedure_table(&planned.rows);
        let subject = format!(
            "[OnCore] Procedure Alternatives Missing — Visit {visit_id}: {} missed",
            planned.rows.len()
        );
        let html = render(&ProcAltAlertEmail {
            window_since: window.since.format(WINDOW_LINE_FORMAT).to_string(),
            window_until: window.until.format(WINDOW_LINE_FORMAT).to_string(),
            summary: &summary,
            table: &table,
        })?;

        info!(
            job = %ctx.job_code,
            visit_id,
            recipient = %planned.recipient,
            rows = planned.rows.len(),
            "sending alert"
        );
        send_html(ctx, &self.settings.job.sender, &planned.recipient, &subject, html, None).await?;
        record_procedures(
            records,
            visit_id,
            &planned.rows,
            &ctx.routing.recorded_recipient(&planned.recipient),
            &subject,
        );
        Ok(())
    }

    async fn send_all(
        &self,
        ctx: &JobContext,
        window: &Window,
        planned: &[Planned<AlertGroupKey, ProcAltRow>],
        sent_keys: &mut SentKeySet,
        records: &mut SentRecords,
        summary: &mut RunSummary,
    ) -> Result<()> {
        for group in planned {
            self.send_one(ctx, window, group, records).await?;
            sent_keys.insert(group.idempotency_key.clone());
            self.state.save_sent_keys(sent_keys).await?;
            summary.sent += 1;

            if let Some(audit) = &self.audit {
                let event = AuditEvent {
                    sent_at: ctx.now(),
                    job_code: ctx.job_code.clone(),
                    event_type: EventType::InitialAlert,
                    visit_id: group.key.visit_id.to_string(),
                    modified_user_email: group.key.recipient.clone(),
                    dedupe_key: group.idempotency_key.clone(),
                    job_run_id: ctx.run_id,
                    environment: ctx.environment,
                };
                audit
                    .append(&event)
                    .await
                    .with_context(|| format!("recording initial alert {}", group.idempotency_key))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationJob for ProcAltAlertJob {
    fn settings(&self) -> &JobSettings {
        &self.settings.job
    }

    async fn run(&self, ctx: &JobContext) -> Result<RunSummary> {
        let started = ctx.now();
        let previous = self.state.load_watermark().await?;
        let window = self.settings.window.compute(started, previous);
        info!(job = %ctx.job_code, run_id = %ctx.run_id, window = %window, "querying changed procedure alternatives");

        let rows = self
            .source
            .changed_between(&window)
            .await
            .context("querying procedure alternatives")?;
        info!(job = %ctx.job_code, rows = rows.len(), "query complete");
        let max_seen = rows.iter().map(|row| row.modified_date).max();

        let mut sent_keys = self.state.load_sent_keys().await?;
        let plan = DedupEngine::new(ctx.environment).plan(group_by(rows, AlertGroupKey::of), &sent_keys);
        for key in &plan.skipped_no_recipient {
            warn!(job = %ctx.job_code, visit_id = key.visit_id, "skipping group with empty MODIFIED_USER_EMAIL");
        }
        for key in &plan.skipped_duplicate {
            info!(job = %ctx.job_code, key = %key, "already notified; skipping");
        }

        let mut summary = RunSummary {
            skipped: plan.skipped_no_recipient.len() + plan.skipped_duplicate.len(),
            ..RunSummary::default()
        };
        let mut records = SentRecords::new(ALERT_EXPORT_COLUMNS);
        let sends = self
            .send_all(ctx, &window, &plan.to_send, &mut sent_keys, &mut records, &mut summary)
            .await;
        summary.export = finish_with_export(ctx, &run_stamp(ctx, started), &records, sends).await?;

        let next = advance_watermark(previous, max_seen, &window);
        self.state.save_watermark(next).await?;
        info!(job = %ctx.job_code, watermark = %next, "watermark saved");
        Ok(summary)
    }
}

//! In-memory collaborators for dry runs and tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use ctmn_core::{
    normalize_recipient, ActivationContactRow, AuditEvent, AuditHistory, Environment, EventType,
    ProcAltRow, StaffWarningRow, UnresolvedProcAltRow, VisitTrackingRow, Window,
};

use crate::{AuditLog, Mailer, OutgoingEmail, ProcAltSource, ReportSource, VisitReport};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serves rows the way the windowed view would: `changed_between` applies the
/// `(since, until]` filter to `modified_date`.
#[derive(Debug, Default)]
pub struct MemoryProcAltSource {
    changed: Mutex<Vec<ProcAltRow>>,
    unresolved: Mutex<Vec<UnresolvedProcAltRow>>,
    fail_with: Mutex<Option<String>>,
}

impl MemoryProcAltSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_changed(&self, row: ProcAltRow) {
        lock(&self.changed).push(row);
    }

    pub fn set_unresolved(&self, rows: Vec<UnresolvedProcAltRow>) {
        *lock(&self.unresolved) = rows;
    }

    /// Every subsequent query fails with `message`.
    pub fn fail_queries(&self, message: impl Into<String>) {
        *lock(&self.fail_with) = Some(message.into());
    }

    fn check_failure(&self) -> Result<()> {
        if let Some(message) = lock(&self.fail_with).clone() {
            bail!(message);
        }
        Ok(())
    }
}

#[async_trait]
impl ProcAltSource for MemoryProcAltSource {
    async fn changed_between(&self, window: &Window) -> Result<Vec<ProcAltRow>> {
        self.check_failure()?;
        Ok(lock(&self.changed)
            .iter()
            .filter(|row| window.contains(row.modified_date))
            .cloned()
            .collect())
    }

    async fn unresolved(&self) -> Result<Vec<UnresolvedProcAltRow>> {
        self.check_failure()?;
        Ok(lock(&self.unresolved).clone())
    }
}

#[derive(Debug, Default)]
pub struct MemoryReportSource {
    pub staff_warnings: Vec<StaffWarningRow>,
    pub upcoming_visits: Vec<VisitTrackingRow>,
    pub unacknowledged_visits: Vec<VisitTrackingRow>,
    pub activation_contacts: Vec<ActivationContactRow>,
}

#[async_trait]
impl ReportSource for MemoryReportSource {
    async fn staff_warnings(&self) -> Result<Vec<StaffWarningRow>> {
        Ok(self.staff_warnings.clone())
    }

    async fn visits(&self, report: VisitReport) -> Result<Vec<VisitTrackingRow>> {
        Ok(match report {
            VisitReport::Upcoming => self.upcoming_visits.clone(),
            VisitReport::Unacknowledged => self.unacknowledged_visits.clone(),
        })
    }

    async fn activation_contacts(&self) -> Result<Vec<ActivationContactRow>> {
        Ok(self.activation_contacts.clone())
    }
}

/// Append-only event vector; `history` folds it the same way the SQL does.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn history(&self, environment: Environment, job_codes: &[String]) -> Result<Vec<AuditHistory>> {
        let mut folded: BTreeMap<(String, String), AuditHistory> = BTreeMap::new();
        for event in lock(&self.events).iter() {
            if event.environment != environment || !job_codes.contains(&event.job_code) {
                continue;
            }
            let recipient = normalize_recipient(event.modified_user_email.as_deref().unwrap_or_default());
            let entry = folded
                .entry((event.visit_id.clone(), recipient.clone()))
                .or_insert_with(|| AuditHistory {
                    visit_id: event.visit_id.clone(),
                    recipient,
                    first_initial_sent_at: None,
                    last_weekly_sent_at: None,
                });
            match event.event_type {
                EventType::InitialAlert => {
                    entry.first_initial_sent_at = Some(match entry.first_initial_sent_at {
                        Some(existing) => existing.min(event.sent_at),
                        None => event.sent_at,
                    });
                }
                EventType::WeeklyReminder => {
                    entry.last_weekly_sent_at = Some(match entry.last_weekly_sent_at {
                        Some(existing) => existing.max(event.sent_at),
                        None => event.sent_at,
                    });
                }
            }
        }
        Ok(folded.into_values().collect())
    }

    async fn append(&self, event: &AuditEvent) -> Result<()> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

/// Records every message; can be told to fail from the n-th send onwards.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    fail_from: Mutex<Option<usize>>,
    attempts: Mutex<usize>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends numbered `n` and later (zero-based) fail.
    pub fn fail_from(&self, n: usize) {
        *lock(&self.fail_from) = Some(n);
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        let attempt = {
            let mut attempts = lock(&self.attempts);
            let current = *attempts;
            *attempts += 1;
            current
        };
        if lock(&self.fail_from).is_some_and(|n| attempt >= n) {
            bail!("simulated SMTP failure sending {:?}", email.subject);
        }
        lock(&self.sent).push(email.clone());
        Ok(())
    }
}

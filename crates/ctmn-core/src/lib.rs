//! Core domain model for the clinical-trials notification jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ctmn-core";

/// Stable job identifiers. They name log/lock directories and are written to
/// the audit table, so they never change once deployed.
pub mod job_codes {
    pub const PROC_ALT_ALERT: &str = "epay_no_procalt";
    pub const PROC_ALT_WEEKLY_REMINDER: &str = "epay_no_procalt_weekly_reminder";
    pub const RPE_STAFF_WARNING: &str = "rpe_staff_warning";
    pub const UPCOMING_VISITS: &str = "upcoming_visits";
    pub const UNACKNOWLEDGED_VISITS: &str = "unacknowledged_visits";
    pub const STUDY_ACTIVATION: &str = "study_activation_dashboard";
}

/// Placeholder recipient used when a dev run exercises a group with no recipient.
pub const DEV_PLACEHOLDER_RECIPIENT: &str = "dev-placeholder";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Environment::Dev)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown environment {0:?} (expected `dev` or `prod`)")]
pub struct UnknownEnvironment(pub String);

impl FromStr for Environment {
    type Err = UnknownEnvironment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            other => Err(UnknownEnvironment(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    InitialAlert,
    WeeklyReminder,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InitialAlert => "INITIAL_ALERT",
            EventType::WeeklyReminder => "WEEKLY_REMINDER",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formats a timestamp with seconds precision, the format used in state files,
/// idempotency keys and lock markers.
pub fn iso_seconds(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Drops sub-second precision.
pub fn truncate_to_seconds(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Trimmed recipient, `None` when absent or blank.
pub fn present_recipient(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

/// Recipient form used to join live rows against audit history.
pub fn normalize_recipient(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Identifies a notification that must be sent at most once.
///
/// Formats:
/// - initial alert: `<visit_id>|<recipient or "dev">|<modified_at, seconds>`
/// - weekly reminder: `<visit_id>|<recipient>|<YYYY-MM-DD>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn initial_alert(visit_id: i64, recipient: Option<&str>, modified_at: NaiveDateTime) -> Self {
        let recipient = present_recipient(recipient).unwrap_or("dev");
        IdempotencyKey(format!(
            "{visit_id}|{recipient}|{}",
            iso_seconds(truncate_to_seconds(modified_at))
        ))
    }

    pub fn weekly_reminder(visit_id: i64, recipient: &str, day: NaiveDate) -> Self {
        IdempotencyKey(format!("{visit_id}|{recipient}|{}", day.format("%Y-%m-%d")))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        IdempotencyKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open query interval `(since, until]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub since: NaiveDateTime,
    pub until: NaiveDateTime,
}

impl Window {
    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts > self.since && ts <= self.until
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", iso_seconds(self.since), iso_seconds(self.until))
    }
}

/// One row of the external audit table. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub sent_at: NaiveDateTime,
    pub job_code: String,
    pub event_type: EventType,
    pub visit_id: String,
    pub modified_user_email: Option<String>,
    pub dedupe_key: IdempotencyKey,
    pub job_run_id: Uuid,
    pub environment: Environment,
}

/// Audit history folded per `(visit_id, normalized recipient)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditHistory {
    pub visit_id: String,
    pub recipient: String,
    pub first_initial_sent_at: Option<NaiveDateTime>,
    pub last_weekly_sent_at: Option<NaiveDateTime>,
}

impl AuditHistory {
    pub fn key(&self) -> (String, String) {
        (self.visit_id.clone(), self.recipient.clone())
    }
}

/// A visit whose ePayment procedures were modified without selecting an alternative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcAltRow {
    pub visit_id: i64,
    pub modified_date: NaiveDateTime,
    pub modified_user_email: Option<String>,
    pub protocol_no: Option<String>,
    pub subject_name: Option<String>,
    pub visit_date: Option<NaiveDate>,
    pub visit_name: Option<String>,
    pub clinical_procedure: Option<String>,
}

/// A still-unresolved procedure alternative, as seen by the weekly reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedProcAltRow {
    pub visit_id: i64,
    pub modified_user_email: Option<String>,
    pub modified_user_name: Option<String>,
    pub protocol_no: Option<String>,
    pub subject_name: Option<String>,
    pub visit_date: Option<NaiveDate>,
    pub visit_name: Option<String>,
    pub clinical_procedure: Option<String>,
}

/// Staff sent through the RPE console without the IDs Epic needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaffWarningRow {
    pub submitter_email: Option<String>,
    pub protocol_no: Option<String>,
    pub sequence_number: Option<i64>,
    pub rpe_sent_date: Option<NaiveDate>,
    pub staff_role: Option<String>,
    pub staff_full_name: Option<String>,
    pub contact_detail_url: Option<String>,
}

/// A row of the visit-tracking view, shared by the upcoming and unacknowledged reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitTrackingRow {
    pub coordinator_email: Option<String>,
    pub protocol_no: Option<String>,
    pub sequence_number: Option<i64>,
    pub segment_name: Option<String>,
    pub visit_date: Option<NaiveDate>,
    pub visit_name: Option<String>,
    pub visit_url: Option<String>,
}

/// A study in activation (or recently activated) and its contact columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationContactRow {
    pub hic_irb_no: Option<String>,
    pub pi_contact_email: Option<String>,
    pub business_office_contact: Option<String>,
    pub ir_submitter_email: Option<String>,
    pub primary_study_coordinator_email: Option<String>,
}

impl ActivationContactRow {
    pub fn contact_fields(&self) -> [Option<&str>; 4] {
        [
            self.pi_contact_email.as_deref(),
            self.business_office_contact.as_deref(),
            self.ir_submitter_email.as_deref(),
            self.primary_study_coordinator_email.as_deref(),
        ]
    }
}

//! Collaborator contracts for the notification jobs (data source, audit table,
//! mail transport) plus Postgres, SMTP and in-memory implementations.

use anyhow::Result;
use async_trait::async_trait;
use ctmn_core::{
    ActivationContactRow, AuditEvent, AuditHistory, Environment, ProcAltRow, StaffWarningRow,
    UnresolvedProcAltRow, VisitTrackingRow, Window,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod postgres;
pub mod smtp;

pub use postgres::{connect_pool, PgAuditLog, PgProcAltSource, PgReportSource, ProcAltColumns, ReportViews};
pub use smtp::SmtpMailer;

pub const CRATE_NAME: &str = "ctmn-adapters";

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: Sender,
    /// Raw recipient field; may hold several `;`-separated addresses.
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub attachment: Option<EmailAttachment>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<()>;
}

/// Rows behind the procedure-alternatives alert and its weekly reminder.
#[async_trait]
pub trait ProcAltSource: Send + Sync {
    /// Rows whose modification timestamp falls in `(since, until]`.
    async fn changed_between(&self, window: &Window) -> Result<Vec<ProcAltRow>>;

    /// Every procedure alternative that is still unresolved right now.
    async fn unresolved(&self) -> Result<Vec<UnresolvedProcAltRow>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitReport {
    /// Visits planned within the next five days.
    Upcoming,
    /// Visits past the grace period without being marked occurred, missed or N/A.
    Unacknowledged,
}

impl VisitReport {
    pub fn filter_column(&self) -> &'static str {
        match self {
            VisitReport::Upcoming => "visit_in_next_5_days",
            VisitReport::Unacknowledged => "unacknowledged_visit_outside_policy",
        }
    }
}

/// Rows behind the per-recipient digest reports.
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn staff_warnings(&self) -> Result<Vec<StaffWarningRow>>;
    async fn visits(&self, report: VisitReport) -> Result<Vec<VisitTrackingRow>>;
    async fn activation_contacts(&self) -> Result<Vec<ActivationContactRow>>;
}

/// The external, append-only notification audit table.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// First initial alert and latest weekly reminder per (visit, recipient),
    /// restricted to one environment and the given job codes.
    async fn history(&self, environment: Environment, job_codes: &[String]) -> Result<Vec<AuditHistory>>;

    async fn append(&self, event: &AuditEvent) -> Result<()>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("dev environment has no DEV_EMAIL inbox configured")]
    NoDevInbox,
    #[error("no deliverable recipient in {0:?}")]
    NoRecipients(String),
}

/// Splits an address list on any of `separators`, trimming and dropping blanks.
pub fn split_addresses(raw: &str, separators: &[char]) -> Vec<String> {
    raw.split(|c| separators.contains(&c))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Decides who actually receives a message: real recipients in prod, the
/// developer inbox in dev, plus a BCC copy either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailRouting {
    pub environment: Environment,
    pub dev_inbox: Vec<String>,
    pub bcc: Vec<String>,
}

impl MailRouting {
    pub fn resolve(&self, to: &str) -> Result<Vec<String>, RoutingError> {
        match self.environment {
            Environment::Dev => {
                if self.dev_inbox.is_empty() {
                    Err(RoutingError::NoDevInbox)
                } else {
                    Ok(self.dev_inbox.clone())
                }
            }
            Environment::Prod => {
                let recipients = split_addresses(to, &[';']);
                if recipients.is_empty() {
                    Err(RoutingError::NoRecipients(to.to_string()))
                } else {
                    Ok(recipients)
                }
            }
        }
    }

    /// The recipient as it should be recorded in exports for this environment.
    pub fn recorded_recipient(&self, to: &str) -> String {
        match self.environment {
            Environment::Dev => self.dev_inbox.join(";"),
            Environment::Prod => to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing(environment: Environment, dev_inbox: &[&str]) -> MailRouting {
        MailRouting {
            environment,
            dev_inbox: dev_inbox.iter().map(|s| s.to_string()).collect(),
            bcc: vec!["audit@x.com".into()],
        }
    }

    #[test]
    fn prod_splits_semicolon_lists() {
        let r = routing(Environment::Prod, &["dev@x.com"]);
        assert_eq!(
            r.resolve(" a@x.com; b@x.com ;").expect("route"),
            vec!["a@x.com".to_string(), "b@x.com".to_string()]
        );
    }

    #[test]
    fn prod_rejects_blank_recipient() {
        let r = routing(Environment::Prod, &[]);
        assert_eq!(r.resolve(" ; "), Err(RoutingError::NoRecipients(" ; ".into())));
    }

    #[test]
    fn dev_redirects_to_inbox_even_for_placeholder() {
        let r = routing(Environment::Dev, &["dev@x.com", "qa@x.com"]);
        assert_eq!(r.resolve("dev-placeholder").expect("route").len(), 2);
        assert_eq!(r.recorded_recipient("a@x.com"), "dev@x.com;qa@x.com");
    }

    #[test]
    fn dev_without_inbox_is_an_error() {
        let r = routing(Environment::Dev, &[]);
        assert_eq!(r.resolve("a@x.com"), Err(RoutingError::NoDevInbox));
    }

    #[test]
    fn split_addresses_handles_mixed_separators() {
        assert_eq!(
            split_addresses("a@x.com, b@x.com;c@x.com", &[',', ';']),
            vec!["a@x.com", "b@x.com", "c@x.com"]
        );
    }
}

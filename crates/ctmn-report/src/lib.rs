//! Email bodies (askama) and spreadsheet attachments for the notification jobs.

use anyhow::{Context, Result};
use askama::Template;
use chrono::NaiveDate;
use serde::Serialize;

pub mod xlsx;

pub use xlsx::table_to_xlsx;

pub const CRATE_NAME: &str = "ctmn-report";

/// Digest tables longer than this go out as a spreadsheet attachment instead.
pub const INLINE_TABLE_MAX_ROWS: usize = 20;

/// Text shown for hyperlink cells.
pub const LINK_LABEL: &str = "link";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cell {
    pub text: String,
    /// Empty for plain cells.
    pub href: String,
}

impl Cell {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            href: String::new(),
        }
    }

    pub fn link(href: impl Into<String>) -> Self {
        Self {
            text: LINK_LABEL.to_string(),
            href: href.into(),
        }
    }

    /// A link cell when `href` is present and non-blank, an empty cell otherwise.
    pub fn optional_link(href: Option<&str>) -> Self {
        match href.map(str::trim).filter(|h| !h.is_empty()) {
            Some(href) => Self::link(href),
            None => Self::text(""),
        }
    }

    pub fn is_link(&self) -> bool {
        !self.href.is_empty()
    }
}

impl From<Option<&str>> for Cell {
    fn from(value: Option<&str>) -> Self {
        Cell::text(value.unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Cell>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn format_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Header block shared by the procedure-alternative alert and reminder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitSummary {
    pub protocol_no: String,
    pub subject_name: String,
    pub visit_date: String,
    pub missed_count: usize,
}

#[derive(Template)]
#[template(path = "proc_alt_alert.html")]
pub struct ProcAltAlertEmail<'a> {
    pub window_since: String,
    pub window_until: String,
    pub summary: &'a VisitSummary,
    pub table: &'a Table,
}

#[derive(Template)]
#[template(path = "proc_alt_reminder.html")]
pub struct ProcAltReminderEmail<'a> {
    pub recipient_name: &'a str,
    pub summary: &'a VisitSummary,
    pub table: &'a Table,
    /// Blank hides the "for questions" line.
    pub contact_email: &'a str,
}

#[derive(Template)]
#[template(path = "digest.html")]
pub struct DigestEmail<'a> {
    pub intro: &'a [&'a str],
    pub table: &'a Table,
    pub show_table: bool,
    pub attachment_name: &'a str,
}

#[derive(Template)]
#[template(path = "activation.html")]
pub struct ActivationEmail<'a> {
    pub dashboard_url: &'a str,
    pub guide_url: &'a str,
}

#[derive(Template)]
#[template(path = "failure_alert.html")]
pub struct FailureAlertEmail<'a> {
    pub job_code: &'a str,
    pub run_id: String,
    pub environment: String,
    pub host: String,
    pub failed_at: String,
    pub error_chain: Vec<String>,
    pub log_tail: &'a [String],
}

pub fn render<T: Template>(template: &T) -> Result<String> {
    template.render().context("rendering email template")
}

/// A digest body plus its optional spreadsheet, following the inline row limit.
#[derive(Debug, Clone)]
pub struct RenderedDigest {
    pub html: String,
    pub spreadsheet: Option<(String, Vec<u8>)>,
}

/// Renders a digest, moving the table into an `.xlsx` attachment named after
/// `notification_name` once it exceeds [`INLINE_TABLE_MAX_ROWS`].
pub fn render_digest(notification_name: &str, intro: &[&str], table: &Table) -> Result<RenderedDigest> {
    let attachment_name = attachment_file_name(notification_name);
    let inline = table.len() <= INLINE_TABLE_MAX_ROWS;
    let html = render(&DigestEmail {
        intro,
        table,
        show_table: inline,
        attachment_name: &attachment_name,
    })?;
    let spreadsheet = if inline {
        None
    } else {
        Some((attachment_name, table_to_xlsx(table)?))
    };
    Ok(RenderedDigest { html, spreadsheet })
}

/// `Upcoming Visits Next 5 days` becomes `upcoming_visits_next_5_days.xlsx`.
pub fn attachment_file_name(notification_name: &str) -> String {
    format!("{}.xlsx", notification_name.replace(' ', "_").to_lowercase())
}

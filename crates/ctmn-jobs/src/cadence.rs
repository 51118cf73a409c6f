//! Reminder cadence, derived fresh each run from the audit history.

use std::collections::HashMap;

use chrono::{Duration, NaiveDateTime};
use ctmn_core::{normalize_recipient, AuditHistory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// No initial alert on record; reminders only follow an initial alert.
    Ineligible,
    CoolingDownAfterInitial { due_at: NaiveDateTime },
    CoolingDownAfterReminder { due_at: NaiveDateTime },
    Due,
}

impl Cadence {
    pub fn is_due(&self) -> bool {
        matches!(self, Cadence::Due)
    }
}

/// Due from exactly `first_initial + interval` (and `last_weekly + interval`) onwards.
pub fn evaluate(history: Option<&AuditHistory>, now: NaiveDateTime, interval: Duration) -> Cadence {
    let Some(first_initial) = history.and_then(|h| h.first_initial_sent_at) else {
        return Cadence::Ineligible;
    };
    let due_at = first_initial + interval;
    if now < due_at {
        return Cadence::CoolingDownAfterInitial { due_at };
    }
    if let Some(last_weekly) = history.and_then(|h| h.last_weekly_sent_at) {
        let due_at = last_weekly + interval;
        if now < due_at {
            return Cadence::CoolingDownAfterReminder { due_at };
        }
    }
    Cadence::Due
}

/// Audit history keyed by `(visit id, normalized recipient)`.
#[derive(Debug, Default)]
pub struct HistoryIndex {
    by_pair: HashMap<(String, String), AuditHistory>,
}

impl HistoryIndex {
    pub fn new(history: impl IntoIterator<Item = AuditHistory>) -> Self {
        let by_pair = history
            .into_iter()
            .map(|h| ((h.visit_id.clone(), normalize_recipient(&h.recipient)), h))
            .collect();
        Self { by_pair }
    }

    pub fn get(&self, visit_id: i64, recipient: Option<&str>) -> Option<&AuditHistory> {
        let key = (visit_id.to_string(), normalize_recipient(recipient.unwrap_or_default()));
        self.by_pair.get(&key)
    }

    pub fn len(&self) -> usize {
        self.by_pair.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pair.is_empty()
    }
}

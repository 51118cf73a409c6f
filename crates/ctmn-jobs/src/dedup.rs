//! Grouping rows into notifications and filtering out ones already sent.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDateTime;
use ctmn_core::{
    present_recipient, truncate_to_seconds, Environment, IdempotencyKey, ProcAltRow, DEV_PLACEHOLDER_RECIPIENT,
};
use ctmn_storage::SentKeySet;

/// Rows sharing one grouping key, in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Group<K, R> {
    pub key: K,
    pub rows: Vec<R>,
}

/// Partitions `rows` by `key_fn`. Groups come out in key order, so a run
/// processes them the same way whatever order the source returned.
pub fn group_by<K, R, F>(rows: impl IntoIterator<Item = R>, key_fn: F) -> Vec<Group<K, R>>
where
    K: Ord,
    F: Fn(&R) -> K,
{
    let mut groups: BTreeMap<K, Vec<R>> = BTreeMap::new();
    for row in rows {
        groups.entry(key_fn(&row)).or_default().push(row);
    }
    groups
        .into_iter()
        .map(|(key, rows)| Group { key, rows })
        .collect()
}

/// A grouping key that identifies one notification.
pub trait NotificationKey: Ord {
    /// The addressee carried by the rows, if any.
    fn recipient(&self) -> Option<&str>;
    fn idempotency_key(&self) -> IdempotencyKey;
}

/// `(visit, recipient, modified_at)`: one initial alert per visit modification.
/// `modified_at` is held at seconds precision, the same as the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AlertGroupKey {
    pub visit_id: i64,
    pub recipient: Option<String>,
    pub modified_at: NaiveDateTime,
}

impl AlertGroupKey {
    pub fn of(row: &ProcAltRow) -> Self {
        Self {
            visit_id: row.visit_id,
            recipient: present_recipient(row.modified_user_email.as_deref()).map(str::to_string),
            modified_at: truncate_to_seconds(row.modified_date),
        }
    }
}

impl NotificationKey for AlertGroupKey {
    fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::initial_alert(self.visit_id, self.recipient.as_deref(), self.modified_at)
    }
}

/// A group that survived dedup, with the address it goes to.
#[derive(Debug, Clone, PartialEq)]
pub struct Planned<K, R> {
    pub key: K,
    pub idempotency_key: IdempotencyKey,
    pub recipient: String,
    pub rows: Vec<R>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupPlan<K, R> {
    pub to_send: Vec<Planned<K, R>>,
    pub skipped_no_recipient: Vec<K>,
    pub skipped_duplicate: Vec<IdempotencyKey>,
}

/// Applies the empty-recipient rule and the sent-key check.
#[derive(Debug, Clone, Copy)]
pub struct DedupEngine {
    environment: Environment,
}

impl DedupEngine {
    pub fn new(environment: Environment) -> Self {
        Self { environment }
    }

    /// Who a group goes to. A missing recipient drops the group in prod; dev
    /// keeps it with a placeholder, which mail routing redirects anyway.
    pub fn deliverable_recipient(&self, recipient: Option<&str>) -> Option<String> {
        match present_recipient(recipient) {
            Some(recipient) => Some(recipient.to_string()),
            None if self.environment.is_dev() => Some(DEV_PLACEHOLDER_RECIPIENT.to_string()),
            None => None,
        }
    }

    pub fn plan<K, R>(&self, groups: Vec<Group<K, R>>, sent: &SentKeySet) -> DedupPlan<K, R>
    where
        K: NotificationKey,
    {
        let mut plan = DedupPlan {
            to_send: Vec::new(),
            skipped_no_recipient: Vec::new(),
            skipped_duplicate: Vec::new(),
        };
        let mut planned = HashSet::new();
        for group in groups {
            let Some(recipient) = self.deliverable_recipient(group.key.recipient()) else {
                plan.skipped_no_recipient.push(group.key);
                continue;
            };
            let idempotency_key = group.key.idempotency_key();
            if sent.contains(&idempotency_key) || !planned.insert(idempotency_key.clone()) {
                plan.skipped_duplicate.push(idempotency_key);
                continue;
            }
            plan.to_send.push(Planned {
                key: group.key,
                idempotency_key,
                recipient,
                rows: group.rows,
            });
        }
        plan
    }
}

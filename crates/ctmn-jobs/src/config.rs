//! Environment-driven configuration.
//!
//! The process environment is captured once into [`EnvVars`]; every settings
//! struct is built from that snapshot and handed to the components that need it.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use ctmn_adapters::{split_addresses, MailRouting, ProcAltColumns, ReportViews, Sender};
use ctmn_core::{job_codes, Environment, UnknownEnvironment};
use ctmn_storage::DEFAULT_SENT_KEYS_MAX;
use thiserror::Error;

use crate::window::WindowPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    Missing(String),
    #[error(transparent)]
    Environment(#[from] UnknownEnvironment),
}

/// Snapshot of environment variables. Blank values count as unset.
#[derive(Debug, Clone, Default)]
pub struct EnvVars {
    vars: BTreeMap<String, String>,
}

impl EnvVars {
    pub fn from_process() -> Self {
        std::env::vars().collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn parse_or<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
                var: name.to_string(),
                value: raw.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    pub fn flag_or(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var: name.to_string(),
                    value: raw.to_string(),
                    reason: "expected true or false".to_string(),
                }),
            },
        }
    }

    pub fn prefixed(&self, prefix: &'static str) -> Prefixed<'_> {
        Prefixed { env: self, prefix }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Per-job view over [`EnvVars`]: `name` resolves to `<PREFIX><name>`.
#[derive(Debug, Clone, Copy)]
pub struct Prefixed<'a> {
    env: &'a EnvVars,
    prefix: &'static str,
}

impl<'a> Prefixed<'a> {
    pub fn var(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.env.get(&self.var(name))
    }

    /// The prefixed variable, falling back to the unprefixed shared one.
    pub fn get_or_shared(&self, name: &str) -> Option<&'a str> {
        self.get(name).or_else(|| self.env.get(name))
    }

    pub fn string_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or(default).to_string()
    }

    pub fn parse_or<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.env.parse_or(&self.var(name), default)
    }

    pub fn flag_or(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        self.env.flag_or(&self.var(name), default)
    }
}

/// Upper bound for every configured window, interval and lock age.
pub const MAX_SPAN_DAYS: i64 = 3650;

/// `<PREFIX><name>` as a count of `unit_secs`, converted to seconds and
/// capped at [`MAX_SPAN_DAYS`].
fn span_secs(vars: Prefixed<'_>, name: &str, default: u32, unit_secs: i64) -> Result<i64, ConfigError> {
    let count: u32 = vars.parse_or(name, default)?;
    let secs = i64::from(count) * unit_secs;
    if secs > MAX_SPAN_DAYS * 86_400 {
        return Err(ConfigError::Invalid {
            var: vars.var(name),
            value: count.to_string(),
            reason: format!("must not exceed {MAX_SPAN_DAYS} days"),
        });
    }
    Ok(secs)
}

pub const DEFAULT_FROM_NAME: &str = "OnCore Alerts";
pub const DEFAULT_FROM_ADDR: &str = "no-reply@example.org";

/// Audit table location; the schema differs between environments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditTable {
    pub table: String,
    pub schema_prod: Option<String>,
    pub schema_dev: Option<String>,
}

impl AuditTable {
    fn from_env(vars: Prefixed<'_>) -> Self {
        Self {
            table: vars
                .get_or_shared("AUDIT_TABLE")
                .unwrap_or("NOTIFICATION_AUDIT")
                .to_string(),
            schema_prod: vars.get_or_shared("AUDIT_SCHEMA_PROD").map(str::to_string),
            schema_dev: vars.get_or_shared("AUDIT_SCHEMA_DEV").map(str::to_string),
        }
    }

    /// `schema.table` when a schema is configured for `environment`, else `table`.
    pub fn fqn(&self, environment: Environment) -> String {
        let schema = match environment {
            Environment::Dev => self.schema_dev.as_deref(),
            Environment::Prod => self.schema_prod.as_deref(),
        };
        match schema {
            Some(schema) => format!("{schema}.{}", self.table),
            None => self.table.clone(),
        }
    }
}

/// Settings shared by every job.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    pub environment: Environment,
    pub log_dir: PathBuf,
    pub state_root: PathBuf,
    pub database_url: Option<String>,
    pub mail_server: Option<String>,
    pub mail_port: u16,
    pub bcc: Vec<String>,
    pub dev_inbox: Vec<String>,
    pub monitor_to: Vec<String>,
    pub sender: Sender,
}

impl SharedSettings {
    /// `force_dev` mirrors the `--dev` switch and overrides `ENVIRONMENT`.
    pub fn from_env(env: &EnvVars, force_dev: bool) -> Result<Self, ConfigError> {
        let environment = if force_dev {
            Environment::Dev
        } else {
            env.get("ENVIRONMENT").unwrap_or("prod").parse()?
        };
        let state_root = match env.get("STATE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")),
        };
        Ok(Self {
            environment,
            log_dir: PathBuf::from(env.get("LOG_DIR").unwrap_or("logs")),
            state_root,
            database_url: env.get("DATABASE_URL").map(str::to_string),
            mail_server: env.get("MAIL_SERVER").map(str::to_string),
            mail_port: env.parse_or("MAIL_PORT", 25)?,
            bcc: env
                .get("BCC_EMAIL")
                .map(|raw| split_addresses(raw, &[',', ';']))
                .unwrap_or_default(),
            dev_inbox: env
                .get("DEV_EMAIL")
                .map(|raw| split_addresses(raw, &[',']))
                .unwrap_or_default(),
            monitor_to: env
                .get("MONITOR_TO")
                .map(|raw| split_addresses(raw, &[',', ';']))
                .unwrap_or_default(),
            sender: Sender {
                name: env.get("ALERT_FROM_NAME").unwrap_or(DEFAULT_FROM_NAME).to_string(),
                address: env.get("ALERT_FROM_ADDR").unwrap_or(DEFAULT_FROM_ADDR).to_string(),
            },
        })
    }

    pub fn routing(&self) -> MailRouting {
        MailRouting {
            environment: self.environment,
            dev_inbox: self.dev_inbox.clone(),
            bcc: self.bcc.clone(),
        }
    }

    /// Per-environment state directory, e.g. `<data dir>/OnCoreProcAltAlert_dev`.
    pub fn state_dir(&self, app_name: &str) -> PathBuf {
        let suffix = if self.environment.is_dev() { "_dev" } else { "" };
        self.state_root.join(format!("{app_name}{suffix}"))
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("DATABASE_URL".to_string()))
    }

    pub fn require_mail_server(&self) -> Result<&str, ConfigError> {
        self.mail_server
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("MAIL_SERVER".to_string()))
    }

    /// `<PREFIX>MONITOR_TO`, else the shared `MONITOR_TO`.
    pub fn monitor_recipients(&self, vars: Prefixed<'_>) -> Vec<String> {
        match vars.get("MONITOR_TO") {
            Some(raw) => split_addresses(raw, &[',', ';']),
            None => self.monitor_to.clone(),
        }
    }
}

/// The settings every job carries regardless of what it reports on.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub job_code: &'static str,
    pub prefix: &'static str,
    pub lock_stale_after: StdDuration,
    pub monitor_to: Vec<String>,
    pub sender: Sender,
    /// Six-field (seconds first) cron expression for `ctmn schedule`.
    pub cron: Option<String>,
}

impl JobSettings {
    pub fn from_env(
        env: &EnvVars,
        shared: &SharedSettings,
        job_code: &'static str,
        prefix: &'static str,
        default_lock_stale_hours: u32,
    ) -> Result<Self, ConfigError> {
        let vars = env.prefixed(prefix);
        let stale_secs = span_secs(vars, "LOCK_STALE_HOURS", default_lock_stale_hours, 3600)?;
        Ok(Self {
            job_code,
            prefix,
            lock_stale_after: StdDuration::from_secs(stale_secs.unsigned_abs()),
            monitor_to: shared.monitor_recipients(vars),
            sender: Sender {
                name: vars
                    .get("ALERT_FROM_NAME")
                    .map(str::to_string)
                    .unwrap_or_else(|| shared.sender.name.clone()),
                address: vars
                    .get("ALERT_FROM_ADDR")
                    .map(str::to_string)
                    .unwrap_or_else(|| shared.sender.address.clone()),
            },
            cron: vars.get("CRON").map(str::to_string),
        })
    }
}

fn proc_alt_columns(vars: Prefixed<'_>, default_view: &str) -> ProcAltColumns {
    let defaults = ProcAltColumns::default();
    ProcAltColumns {
        view_fqn: vars.string_or("VIEW_FQN", default_view),
        visit_id: vars.string_or("VISIT_ID_COL", &defaults.visit_id),
        modified_date: vars.string_or("MODIFIED_DATE_COL", &defaults.modified_date),
        modified_user_email: vars.string_or("MODIFIED_USER_EMAIL_COL", &defaults.modified_user_email),
        modified_user_name: vars.string_or("MODIFIED_USER_NAME_COL", &defaults.modified_user_name),
        protocol_no: vars.string_or("PROTOCOL_NO_COL", &defaults.protocol_no),
        subject_name: vars.string_or("SUBJECT_NAME_COL", &defaults.subject_name),
        visit_date: vars.string_or("VISIT_DATE_COL", &defaults.visit_date),
        visit_name: vars.string_or("VISIT_NAME_COL", &defaults.visit_name),
        clinical_procedure: vars.string_or("CLINICAL_PROCEDURE_COL", &defaults.clinical_procedure),
    }
}

pub const PROC_ALT_PREFIX: &str = "PROCALT_";
pub const PROC_ALT_WEEKLY_PREFIX: &str = "PROCALTWEEKLY_";
pub const RPE_STAFF_PREFIX: &str = "RPESTAFF_";
pub const UPCOMING_PREFIX: &str = "UPCOMING_";
pub const UNACK_PREFIX: &str = "UNACK_";
pub const ACTIVATION_PREFIX: &str = "ACTIVATION_";

#[derive(Debug, Clone)]
pub struct ProcAltSettings {
    pub job: JobSettings,
    pub columns: ProcAltColumns,
    pub window: WindowPolicy,
    pub state_dir: PathBuf,
    pub sent_keys_max: usize,
    pub audit_enabled: bool,
    pub audit: AuditTable,
}

impl ProcAltSettings {
    pub fn from_env(env: &EnvVars, shared: &SharedSettings) -> Result<Self, ConfigError> {
        let vars = env.prefixed(PROC_ALT_PREFIX);
        let lookback = span_secs(vars, "LOOKBACK_HOURS", 1, 3600)?;
        let safety_lag = span_secs(vars, "SAFETY_LAG_MIN", 10, 60)?;
        let overlap = span_secs(vars, "OVERLAP_MIN", 3, 60)?;
        let app_name = vars.string_or("STATE_APP_NAME", "OnCoreProcAltAlert");
        Ok(Self {
            job: JobSettings::from_env(env, shared, job_codes::PROC_ALT_ALERT, PROC_ALT_PREFIX, 2)?,
            columns: proc_alt_columns(vars, "SCHEMA.VIEW_NAME"),
            window: WindowPolicy {
                lookback: Duration::seconds(lookback),
                safety_lag: Duration::seconds(safety_lag),
                overlap: Duration::seconds(overlap),
            },
            state_dir: shared.state_dir(&app_name),
            sent_keys_max: vars.parse_or("SENT_KEYS_MAX", DEFAULT_SENT_KEYS_MAX)?,
            audit_enabled: vars.flag_or("AUDIT_ENABLED", true)?,
            audit: AuditTable::from_env(vars),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProcAltWeeklySettings {
    pub job: JobSettings,
    pub columns: ProcAltColumns,
    pub reminder_interval: Duration,
    pub initial_job_code: String,
    pub audit: AuditTable,
    pub contact_email: Option<String>,
}

impl ProcAltWeeklySettings {
    pub fn from_env(env: &EnvVars, shared: &SharedSettings) -> Result<Self, ConfigError> {
        let vars = env.prefixed(PROC_ALT_WEEKLY_PREFIX);
        let interval = span_secs(vars, "REMINDER_INTERVAL_DAYS", 7, 86_400)?;
        Ok(Self {
            job: JobSettings::from_env(
                env,
                shared,
                job_codes::PROC_ALT_WEEKLY_REMINDER,
                PROC_ALT_WEEKLY_PREFIX,
                4,
            )?,
            columns: proc_alt_columns(vars, "epayment_proc_alternative_qa"),
            reminder_interval: Duration::seconds(interval),
            initial_job_code: vars.string_or("INITIAL_JOB_CODE", job_codes::PROC_ALT_ALERT),
            audit: AuditTable::from_env(vars),
            contact_email: vars.get_or_shared("CONTACT_EMAIL").map(str::to_string),
        })
    }
}

/// Settings for the per-recipient digest jobs.
#[derive(Debug, Clone)]
pub struct DigestSettings {
    pub job: JobSettings,
    pub views: ReportViews,
}

impl DigestSettings {
    pub fn from_env(
        env: &EnvVars,
        shared: &SharedSettings,
        job_code: &'static str,
        prefix: &'static str,
    ) -> Result<Self, ConfigError> {
        let vars = env.prefixed(prefix);
        let mut views = ReportViews::default();
        if let Some(view) = vars.get("VIEW_FQN") {
            match job_code {
                job_codes::RPE_STAFF_WARNING => views.staff_warnings = view.to_string(),
                _ => views.visit_tracking = view.to_string(),
            }
        }
        Ok(Self {
            job: JobSettings::from_env(env, shared, job_code, prefix, 2)?,
            views,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ActivationSettings {
    pub job: JobSettings,
    pub views: ReportViews,
    pub dashboard_url: String,
    pub guide_url: String,
    pub recipients_file: PathBuf,
}

impl ActivationSettings {
    pub fn from_env(env: &EnvVars, shared: &SharedSettings) -> Result<Self, ConfigError> {
        let vars = env.prefixed(ACTIVATION_PREFIX);
        let required = |name: &str| {
            vars.get(name)
                .map(str::to_string)
                .ok_or_else(|| ConfigError::Missing(vars.var(name)))
        };
        let mut views = ReportViews::default();
        if let Some(view) = vars.get("VIEW_FQN") {
            views.activation = view.to_string();
        }
        Ok(Self {
            job: JobSettings::from_env(env, shared, job_codes::STUDY_ACTIVATION, ACTIVATION_PREFIX, 2)?,
            views,
            dashboard_url: required("DASHBOARD_URL")?,
            guide_url: required("GUIDE_URL")?,
            recipients_file: PathBuf::from(vars.get("RECIPIENTS_FILE").unwrap_or("recipients.yaml")),
        })
    }
}

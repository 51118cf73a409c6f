//! sqlx/Postgres implementations of the data-source and audit contracts.
//!
//! View and column names come from configuration and are interpolated into
//! the SQL text; every value (window bounds, audit fields) is a bound parameter.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use ctmn_core::{
    ActivationContactRow, AuditEvent, AuditHistory, Environment, ProcAltRow, StaffWarningRow,
    UnresolvedProcAltRow, VisitTrackingRow, Window,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::{AuditLog, ProcAltSource, ReportSource, VisitReport};

pub async fn connect_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
        .context("connecting to database")
}

/// Source view and column names for the procedure-alternatives queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcAltColumns {
    pub view_fqn: String,
    pub visit_id: String,
    pub modified_date: String,
    pub modified_user_email: String,
    pub modified_user_name: String,
    pub protocol_no: String,
    pub subject_name: String,
    pub visit_date: String,
    pub visit_name: String,
    pub clinical_procedure: String,
}

impl Default for ProcAltColumns {
    fn default() -> Self {
        Self {
            view_fqn: "SCHEMA.VIEW_NAME".to_string(),
            visit_id: "VISIT_ID".to_string(),
            modified_date: "MODIFIED_DATE".to_string(),
            modified_user_email: "MODIFIED_USER_EMAIL".to_string(),
            modified_user_name: "MODIFIED_USER_NAME".to_string(),
            protocol_no: "PROTOCOL_NO".to_string(),
            subject_name: "SUBJECT_NAME".to_string(),
            visit_date: "VISIT_DATE".to_string(),
            visit_name: "VISIT_NAME".to_string(),
            clinical_procedure: "CLINICAL_PROCEDURE".to_string(),
        }
    }
}

impl ProcAltColumns {
    pub fn changed_between_sql(&self) -> String {
        format!(
            r#"
            SELECT CAST({visit} AS BIGINT)    AS visit_id,
                   CAST({modts} AS TIMESTAMP) AS modified_date,
                   CAST({user} AS TEXT)       AS modified_user_email,
                   CAST({protocol} AS TEXT)   AS protocol_no,
                   CAST({subject} AS TEXT)    AS subject_name,
                   CAST({vdate} AS DATE)      AS visit_date,
                   CAST({vname} AS TEXT)      AS visit_name,
                   CAST({proc} AS TEXT)       AS clinical_procedure
              FROM {view}
             WHERE {modts} >  $1
               AND {modts} <= $2
            "#,
            visit = self.visit_id,
            modts = self.modified_date,
            user = self.modified_user_email,
            protocol = self.protocol_no,
            subject = self.subject_name,
            vdate = self.visit_date,
            vname = self.visit_name,
            proc = self.clinical_procedure,
            view = self.view_fqn,
        )
    }

    pub fn unresolved_sql(&self) -> String {
        format!(
            r#"
            SELECT CAST({visit} AS BIGINT)  AS visit_id,
                   CAST({user} AS TEXT)     AS modified_user_email,
                   CAST({uname} AS TEXT)    AS modified_user_name,
                   CAST({protocol} AS TEXT) AS protocol_no,
                   CAST({subject} AS TEXT)  AS subject_name,
                   CAST({vdate} AS DATE)    AS visit_date,
                   CAST({vname} AS TEXT)    AS visit_name,
                   CAST({proc} AS TEXT)     AS clinical_procedure
              FROM {view}
            "#,
            visit = self.visit_id,
            user = self.modified_user_email,
            uname = self.modified_user_name,
            protocol = self.protocol_no,
            subject = self.subject_name,
            vdate = self.visit_date,
            vname = self.visit_name,
            proc = self.clinical_procedure,
            view = self.view_fqn,
        )
    }
}

pub struct PgProcAltSource {
    pool: PgPool,
    columns: ProcAltColumns,
}

impl PgProcAltSource {
    pub fn new(pool: PgPool, columns: ProcAltColumns) -> Self {
        Self { pool, columns }
    }
}

fn proc_alt_row(row: &PgRow) -> Result<ProcAltRow> {
    Ok(ProcAltRow {
        visit_id: row.try_get("visit_id")?,
        modified_date: row.try_get("modified_date")?,
        modified_user_email: row.try_get("modified_user_email")?,
        protocol_no: row.try_get("protocol_no")?,
        subject_name: row.try_get("subject_name")?,
        visit_date: row.try_get("visit_date")?,
        visit_name: row.try_get("visit_name")?,
        clinical_procedure: row.try_get("clinical_procedure")?,
    })
}

fn unresolved_row(row: &PgRow) -> Result<UnresolvedProcAltRow> {
    Ok(UnresolvedProcAltRow {
        visit_id: row.try_get("visit_id")?,
        modified_user_email: row.try_get("modified_user_email")?,
        modified_user_name: row.try_get("modified_user_name")?,
        protocol_no: row.try_get("protocol_no")?,
        subject_name: row.try_get("subject_name")?,
        visit_date: row.try_get("visit_date")?,
        visit_name: row.try_get("visit_name")?,
        clinical_procedure: row.try_get("clinical_procedure")?,
    })
}

#[async_trait]
impl ProcAltSource for PgProcAltSource {
    async fn changed_between(&self, window: &Window) -> Result<Vec<ProcAltRow>> {
        let rows = sqlx::query(&self.columns.changed_between_sql())
            .bind(window.since)
            .bind(window.until)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("querying {} for window {window}", self.columns.view_fqn))?;
        rows.iter()
            .map(proc_alt_row)
            .collect::<Result<Vec<_>>>()
            .context("decoding procedure alternative rows")
    }

    async fn unresolved(&self) -> Result<Vec<UnresolvedProcAltRow>> {
        let rows = sqlx::query(&self.columns.unresolved_sql())
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("querying unresolved rows from {}", self.columns.view_fqn))?;
        rows.iter()
            .map(unresolved_row)
            .collect::<Result<Vec<_>>>()
            .context("decoding unresolved procedure alternative rows")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportViews {
    pub staff_warnings: String,
    pub visit_tracking: String,
    pub activation: String,
}

impl Default for ReportViews {
    fn default() -> Self {
        Self {
            staff_warnings: "oncore_report_ro.get_latest_rpe_staff_warnings".to_string(),
            visit_tracking: "oncore_report_ro.ycci_visit_tracking".to_string(),
            activation: "prod_analytics.ycci_activation".to_string(),
        }
    }
}

pub struct PgReportSource {
    pool: PgPool,
    views: ReportViews,
}

impl PgReportSource {
    pub fn new(pool: PgPool, views: ReportViews) -> Self {
        Self { pool, views }
    }
}

#[async_trait]
impl ReportSource for PgReportSource {
    async fn staff_warnings(&self) -> Result<Vec<StaffWarningRow>> {
        let sql = format!(
            r#"
            SELECT CAST(rpe_submitter_email AS TEXT)       AS submitter_email,
                   CAST(protocol_no AS TEXT)               AS protocol_no,
                   CAST(sequence_number AS BIGINT)         AS sequence_number,
                   CAST(rpe_sent_date AS DATE)             AS rpe_sent_date,
                   CAST(staff_role AS TEXT)                AS staff_role,
                   CAST(staff_full_name AS TEXT)           AS staff_full_name,
                   CAST(oncore_contact_detail_url AS TEXT) AS contact_detail_url
              FROM {}
            "#,
            self.views.staff_warnings
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("querying {}", self.views.staff_warnings))?;
        rows.iter()
            .map(|row| -> Result<StaffWarningRow> {
                Ok(StaffWarningRow {
                    submitter_email: row.try_get("submitter_email")?,
                    protocol_no: row.try_get("protocol_no")?,
                    sequence_number: row.try_get("sequence_number")?,
                    rpe_sent_date: row.try_get::<Option<NaiveDate>, _>("rpe_sent_date")?,
                    staff_role: row.try_get("staff_role")?,
                    staff_full_name: row.try_get("staff_full_name")?,
                    contact_detail_url: row.try_get("contact_detail_url")?,
                })
            })
            .collect()
    }

    async fn visits(&self, report: VisitReport) -> Result<Vec<VisitTrackingRow>> {
        let sql = format!(
            r#"
            SELECT CAST(coordinator_email AS TEXT)     AS coordinator_email,
                   CAST(protocol_no AS TEXT)           AS protocol_no,
                   CAST(sequence_number AS BIGINT)     AS sequence_number,
                   CAST(segment_name AS TEXT)          AS segment_name,
                   CAST(visit_date AS DATE)            AS visit_date,
                   CAST(visit_name AS TEXT)            AS visit_name,
                   CAST(cra_console_visit_url AS TEXT) AS visit_url
              FROM {}
             WHERE {} = 'yes'
            "#,
            self.views.visit_tracking,
            report.filter_column()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("querying {} ({report:?})", self.views.visit_tracking))?;
        rows.iter()
            .map(|row| -> Result<VisitTrackingRow> {
                Ok(VisitTrackingRow {
                    coordinator_email: row.try_get("coordinator_email")?,
                    protocol_no: row.try_get("protocol_no")?,
                    sequence_number: row.try_get("sequence_number")?,
                    segment_name: row.try_get("segment_name")?,
                    visit_date: row.try_get("visit_date")?,
                    visit_name: row.try_get("visit_name")?,
                    visit_url: row.try_get("visit_url")?,
                })
            })
            .collect()
    }

    async fn activation_contacts(&self) -> Result<Vec<ActivationContactRow>> {
        let sql = format!(
            r#"
            SELECT DISTINCT
                   CAST(hic_irb_no AS TEXT)                      AS hic_irb_no,
                   CAST(pi_contact_email AS TEXT)                AS pi_contact_email,
                   CAST(business_office_contact AS TEXT)         AS business_office_contact,
                   CAST(ycci_ir_submitter_email__c AS TEXT)      AS ir_submitter_email,
                   CAST(primary_study_coordinator_email AS TEXT) AS primary_study_coordinator_email
              FROM {}
             WHERE case_status = 'In Activation'
                OR closed_more_than_30_days = 'no'
            "#,
            self.views.activation
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("querying {}", self.views.activation))?;
        rows.iter()
            .map(|row| -> Result<ActivationContactRow> {
                Ok(ActivationContactRow {
                    hic_irb_no: row.try_get("hic_irb_no")?,
                    pi_contact_email: row.try_get("pi_contact_email")?,
                    business_office_contact: row.try_get("business_office_contact")?,
                    ir_submitter_email: row.try_get("ir_submitter_email")?,
                    primary_study_coordinator_email: row.try_get("primary_study_coordinator_email")?,
                })
            })
            .collect()
    }
}

pub struct PgAuditLog {
    pool: PgPool,
    table_fqn: String,
}

impl PgAuditLog {
    pub fn new(pool: PgPool, table_fqn: impl Into<String>) -> Self {
        Self {
            pool,
            table_fqn: table_fqn.into(),
        }
    }

    pub fn history_sql(&self) -> String {
        format!(
            r#"
            SELECT CAST(VISIT_ID AS TEXT)           AS visit_id,
                   LOWER(TRIM(MODIFIED_USER_EMAIL)) AS modified_user_email,
                   MIN(CASE WHEN EVENT_TYPE = 'INITIAL_ALERT' THEN SENT_AT END)   AS first_initial_sent_at,
                   MAX(CASE WHEN EVENT_TYPE = 'WEEKLY_REMINDER' THEN SENT_AT END) AS last_weekly_sent_at
              FROM {}
             WHERE ENVIRONMENT = $1
               AND JOB_CODE = ANY($2)
             GROUP BY CAST(VISIT_ID AS TEXT), LOWER(TRIM(MODIFIED_USER_EMAIL))
            "#,
            self.table_fqn
        )
    }

    pub fn insert_sql(&self) -> String {
        format!(
            r#"
            INSERT INTO {}
                (SENT_AT, JOB_CODE, EVENT_TYPE, VISIT_ID, MODIFIED_USER_EMAIL, DEDUPE_KEY, JOB_RUN_ID, ENVIRONMENT)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            self.table_fqn
        )
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn history(&self, environment: Environment, job_codes: &[String]) -> Result<Vec<AuditHistory>> {
        let rows = sqlx::query(&self.history_sql())
            .bind(environment.as_str())
            .bind(job_codes)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("querying audit history from {}", self.table_fqn))?;
        rows.iter()
            .map(|row| -> Result<AuditHistory> {
                let recipient: Option<String> = row.try_get("modified_user_email")?;
                Ok(AuditHistory {
                    visit_id: row.try_get("visit_id")?,
                    recipient: recipient.unwrap_or_default(),
                    first_initial_sent_at: row.try_get::<Option<NaiveDateTime>, _>("first_initial_sent_at")?,
                    last_weekly_sent_at: row.try_get::<Option<NaiveDateTime>, _>("last_weekly_sent_at")?,
                })
            })
            .collect()
    }

    async fn append(&self, event: &AuditEvent) -> Result<()> {
        sqlx::query(&self.insert_sql())
            .bind(event.sent_at)
            .bind(&event.job_code)
            .bind(event.event_type.as_str())
            .bind(&event.visit_id)
            .bind(event.modified_user_email.as_deref())
            .bind(event.dedupe_key.as_str())
            .bind(event.job_run_id.to_string())
            .bind(event.environment.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("appending {} audit event to {}", event.event_type, self.table_fqn))?;
        Ok(())
    }
}

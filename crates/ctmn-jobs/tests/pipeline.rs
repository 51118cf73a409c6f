//! End-to-end runs of the jobs against in-memory sources, a recording mailer
//! and a manual clock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use ctmn_adapters::memory::{MemoryAuditLog, MemoryProcAltSource, MemoryReportSource, RecordingMailer};
use ctmn_adapters::{AuditLog, MailRouting, ProcAltColumns, ReportViews, Sender, XLSX_CONTENT_TYPE};
use ctmn_core::{
    ActivationContactRow, AuditEvent, Environment, EventType, IdempotencyKey, ProcAltRow, UnresolvedProcAltRow,
    VisitTrackingRow, DEV_PLACEHOLDER_RECIPIENT,
};
use ctmn_jobs::config::{
    ActivationSettings, AuditTable, DigestSettings, ProcAltSettings, ProcAltWeeklySettings,
};
use ctmn_jobs::export::MANIFEST_FILE_NAME;
use ctmn_jobs::{
    load_manifest, run_protected, ActivationJob, DigestJob, DigestKind, JobSettings, ManualClock,
    NotificationJob, ProcAltAlertJob, ProcAltWeeklyReminderJob, RunOutcome, Runtime, WindowPolicy,
};
use ctmn_storage::{JobPaths, StateStore};
use tempfile::{tempdir, TempDir};
use uuid::Uuid;

fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").expect("timestamp")
}

fn job_settings(job_code: &'static str, prefix: &'static str, stale_hours: u64) -> JobSettings {
    JobSettings {
        job_code,
        prefix,
        lock_stale_after: StdDuration::from_secs(stale_hours * 3600),
        monitor_to: vec!["ops@x.com".into()],
        sender: Sender {
            name: "OnCore Alerts".into(),
            address: "alerts@x.com".into(),
        },
        cron: None,
    }
}

fn audit_table() -> AuditTable {
    AuditTable {
        table: "NOTIFICATION_AUDIT".into(),
        schema_prod: None,
        schema_dev: None,
    }
}

struct Harness {
    dir: TempDir,
    clock: Arc<ManualClock>,
    mailer: Arc<RecordingMailer>,
    environment: Environment,
}

impl Harness {
    fn new(environment: Environment, now: &str) -> Self {
        Self {
            dir: tempdir().expect("tempdir"),
            clock: Arc::new(ManualClock::new(ts(now))),
            mailer: Arc::new(RecordingMailer::new()),
            environment,
        }
    }

    fn log_dir(&self) -> PathBuf {
        self.dir.path().join("logs")
    }

    fn runtime(&self) -> Runtime {
        Runtime {
            environment: self.environment,
            log_dir: self.log_dir(),
            clock: self.clock.clone(),
            mailer: self.mailer.clone(),
            routing: MailRouting {
                environment: self.environment,
                dev_inbox: vec!["dev@x.com".into()],
                bcc: vec![],
            },
        }
    }

    fn proc_alt_settings(&self) -> ProcAltSettings {
        ProcAltSettings {
            job: job_settings("epay_no_procalt", "PROCALT_", 2),
            columns: ProcAltColumns::default(),
            window: WindowPolicy {
                lookback: Duration::hours(1),
                safety_lag: Duration::minutes(10),
                overlap: Duration::minutes(3),
            },
            state_dir: self.dir.path().join("state"),
            sent_keys_max: 20_000,
            audit_enabled: true,
            audit: audit_table(),
        }
    }

    fn proc_alt_job(&self, source: Arc<MemoryProcAltSource>, audit: Arc<MemoryAuditLog>) -> ProcAltAlertJob {
        let settings = self.proc_alt_settings();
        let state = StateStore::new(&settings.state_dir, settings.sent_keys_max);
        ProcAltAlertJob::new(settings, source, Some(audit as Arc<dyn AuditLog>), state)
    }

    fn lock_path(&self, job_code: &str) -> PathBuf {
        JobPaths::new(self.log_dir(), job_code).lock_path()
    }
}

fn changed(visit_id: i64, modified: &str, email: Option<&str>, procedure: &str) -> ProcAltRow {
    ProcAltRow {
        visit_id,
        modified_date: ts(modified),
        modified_user_email: email.map(str::to_string),
        protocol_no: Some("HIC-2000012345".into()),
        subject_name: Some("SUBJ-01".into()),
        visit_date: NaiveDate::from_ymd_opt(2024, 1, 5),
        visit_name: Some("C1D1".into()),
        clinical_procedure: Some(procedure.into()),
    }
}

fn age_lock(path: &Path, age: StdDuration) {
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, "2024-01-01T00:00:00").expect("write lock");
    let file = std::fs::File::options().write(true).open(path).expect("open lock");
    file.set_modified(SystemTime::now() - age).expect("set mtime");
}

async fn completed(job: &dyn NotificationJob, runtime: &Runtime) -> ctmn_jobs::RunSummary {
    match run_protected(job, runtime).await.expect("run") {
        RunOutcome::Completed(summary) => summary,
        RunOutcome::SkippedLocked => panic!("run was skipped"),
    }
}

#[tokio::test]
async fn overlapping_hourly_runs_email_once() {
    let h = Harness::new(Environment::Prod, "2024-01-01T10:00:00");
    let source = Arc::new(MemoryProcAltSource::new());
    source.push_changed(changed(100, "2024-01-01T09:00:00", Some("coord@x.com"), "ECG"));
    source.push_changed(changed(100, "2024-01-01T09:00:00", Some("coord@x.com"), "Labs"));
    let audit = Arc::new(MemoryAuditLog::new());
    let job = h.proc_alt_job(source.clone(), audit.clone());
    let runtime = h.runtime();

    let first = completed(&job, &runtime).await;
    assert_eq!(first.sent, 1);

    // The next window starts at watermark - overlap, so the same row is read again.
    h.clock.advance(Duration::minutes(5));
    let second = completed(&job, &runtime).await;
    assert_eq!(second.sent, 0);
    assert_eq!(second.skipped, 1);

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "coord@x.com");
    assert_eq!(sent[0].subject, "[OnCore] Procedure Alternatives Missing — Visit 100: 2 missed");
    assert_eq!(audit.events().len(), 1);

    let manifest_path = first.export.expect("export").with_file_name(MANIFEST_FILE_NAME);
    let manifest = load_manifest(&manifest_path).await.expect("manifest");
    assert_eq!(manifest.files.len(), 1);
    assert_eq!(manifest.files[0].rows, 2);
}

#[tokio::test]
async fn edits_within_one_second_send_one_email() {
    let h = Harness::new(Environment::Prod, "2024-01-01T10:00:00");
    let source = Arc::new(MemoryProcAltSource::new());
    source.push_changed(changed(100, "2024-01-01T09:00:00.100", Some("a@x.com"), "ECG"));
    source.push_changed(changed(100, "2024-01-01T09:00:00.900", Some("a@x.com"), "Labs"));
    let job = h.proc_alt_job(source, Arc::new(MemoryAuditLog::new()));

    let summary = completed(&job, &h.runtime()).await;
    assert_eq!(summary.sent, 1);
    assert_eq!(h.mailer.sent().len(), 1);
    let keys = job.state().load_sent_keys().await.expect("keys");
    assert_eq!(keys.len(), 1);
    assert!(keys.contains(&IdempotencyKey::from_raw("100|a@x.com|2024-01-01T09:00:00")));
}

#[tokio::test]
async fn failed_send_keeps_earlier_keys_and_the_watermark() {
    let h = Harness::new(Environment::Prod, "2024-01-01T10:00:00");
    let source = Arc::new(MemoryProcAltSource::new());
    source.push_changed(changed(100, "2024-01-01T09:00:00", Some("a@x.com"), "ECG"));
    source.push_changed(changed(101, "2024-01-01T09:10:00", Some("b@x.com"), "Labs"));
    let audit = Arc::new(MemoryAuditLog::new());
    let job = h.proc_alt_job(source, audit.clone());
    h.mailer.fail_from(1);

    run_protected(&job, &h.runtime()).await.unwrap_err();
    // The monitoring alert fails too, so only the first visit's email went out.
    assert_eq!(h.mailer.sent().len(), 1);
    let keys = job.state().load_sent_keys().await.expect("keys");
    assert_eq!(keys.len(), 1);
    assert!(keys.contains(&IdempotencyKey::from_raw("100|a@x.com|2024-01-01T09:00:00")));
    assert_eq!(job.state().load_watermark().await.expect("wm"), None);
    assert!(!h.lock_path("epay_no_procalt").exists());

    let retry_mailer = Arc::new(RecordingMailer::new());
    let retry = Runtime {
        mailer: retry_mailer.clone(),
        ..h.runtime()
    };
    let summary = completed(&job, &retry).await;
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.skipped, 1);
    let resent = retry_mailer.sent();
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].to, "b@x.com");
    assert_eq!(audit.events().len(), 2);
    assert_eq!(
        job.state().load_watermark().await.expect("wm"),
        Some(ts("2024-01-01T09:10:00"))
    );
}

#[tokio::test]
async fn missing_recipient_uses_placeholder_in_dev_only() {
    for (environment, expected) in [(Environment::Dev, 1), (Environment::Prod, 0)] {
        let h = Harness::new(environment, "2024-01-01T10:00:00");
        let source = Arc::new(MemoryProcAltSource::new());
        source.push_changed(changed(200, "2024-01-01T09:30:00", Some("   "), "ECG"));
        let job = h.proc_alt_job(source, Arc::new(MemoryAuditLog::new()));

        let summary = completed(&job, &h.runtime()).await;
        assert_eq!(summary.sent, expected, "{environment}");
        let sent = h.mailer.sent();
        assert_eq!(sent.len(), expected, "{environment}");
        if environment.is_dev() {
            assert_eq!(sent[0].to, DEV_PLACEHOLDER_RECIPIENT);
            let keys = job.state().load_sent_keys().await.expect("keys");
            assert!(keys.contains(&IdempotencyKey::from_raw("200|dev|2024-01-01T09:30:00")));
        } else {
            assert_eq!(summary.skipped, 1);
        }
    }
}

#[tokio::test]
async fn watermark_only_moves_forward_and_stays_behind_until() {
    let h = Harness::new(Environment::Prod, "2024-01-01T10:00:00");
    let source = Arc::new(MemoryProcAltSource::new());
    source.push_changed(changed(1, "2024-01-01T09:20:00", Some("a@x.com"), "ECG"));
    let job = h.proc_alt_job(source.clone(), Arc::new(MemoryAuditLog::new()));
    let runtime = h.runtime();

    completed(&job, &runtime).await;
    let after_first = job.state().load_watermark().await.expect("wm").expect("set");
    assert_eq!(after_first, ts("2024-01-01T09:20:00"));

    // A row newer than `until` is not read yet; the watermark stays at the newest row seen.
    source.push_changed(changed(2, "2024-01-01T10:58:00", Some("b@x.com"), "Labs"));
    h.clock.set(ts("2024-01-01T11:00:00"));
    completed(&job, &runtime).await;
    let after_second = job.state().load_watermark().await.expect("wm").expect("set");
    assert_eq!(after_second, after_first);
    assert!(after_second <= ts("2024-01-01T10:50:00"));
    assert_eq!(h.mailer.sent().len(), 1);

    // Next hour picks the late row up.
    h.clock.set(ts("2024-01-01T12:00:00"));
    completed(&job, &runtime).await;
    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].to, "b@x.com");
    assert_eq!(
        job.state().load_watermark().await.expect("wm"),
        Some(ts("2024-01-01T10:58:00"))
    );
}

#[tokio::test]
async fn empty_windows_advance_watermark_to_until() {
    let h = Harness::new(Environment::Prod, "2024-01-01T10:00:00");
    let job = h.proc_alt_job(Arc::new(MemoryProcAltSource::new()), Arc::new(MemoryAuditLog::new()));
    let runtime = h.runtime();

    let summary = completed(&job, &runtime).await;
    assert_eq!(summary.sent, 0);
    assert!(summary.export.is_none());
    assert_eq!(
        job.state().load_watermark().await.expect("wm"),
        Some(ts("2024-01-01T09:50:00"))
    );

    h.clock.set(ts("2024-01-01T15:00:00"));
    completed(&job, &runtime).await;
    assert_eq!(
        job.state().load_watermark().await.expect("wm"),
        Some(ts("2024-01-01T14:50:00"))
    );
}

#[tokio::test]
async fn fresh_lock_skips_and_is_left_alone() {
    let h = Harness::new(Environment::Prod, "2024-01-01T10:00:00");
    let source = Arc::new(MemoryProcAltSource::new());
    source.push_changed(changed(1, "2024-01-01T09:20:00", Some("a@x.com"), "ECG"));
    let job = h.proc_alt_job(source, Arc::new(MemoryAuditLog::new()));
    let lock = h.lock_path("epay_no_procalt");
    age_lock(&lock, StdDuration::from_secs(30 * 60));

    let outcome = run_protected(&job, &h.runtime()).await.expect("run");
    assert_eq!(outcome, RunOutcome::SkippedLocked);
    assert!(h.mailer.sent().is_empty());
    assert_eq!(std::fs::read_to_string(&lock).expect("lock"), "2024-01-01T00:00:00");
    assert_eq!(job.state().load_watermark().await.expect("wm"), None);
}

#[tokio::test]
async fn stale_lock_is_replaced_and_released() {
    let h = Harness::new(Environment::Prod, "2024-01-01T10:00:00");
    let source = Arc::new(MemoryProcAltSource::new());
    source.push_changed(changed(1, "2024-01-01T09:20:00", Some("a@x.com"), "ECG"));
    let job = h.proc_alt_job(source, Arc::new(MemoryAuditLog::new()));
    let lock = h.lock_path("epay_no_procalt");
    age_lock(&lock, StdDuration::from_secs(3 * 3600));

    let summary = completed(&job, &h.runtime()).await;
    assert_eq!(summary.sent, 1);
    assert!(!lock.exists());
}

#[tokio::test]
async fn query_failure_alerts_monitoring_and_keeps_state() {
    let h = Harness::new(Environment::Prod, "2024-01-01T10:00:00");
    let source = Arc::new(MemoryProcAltSource::new());
    source.fail_queries("connection reset by peer");
    let job = h.proc_alt_job(source, Arc::new(MemoryAuditLog::new()));

    let err = run_protected(&job, &h.runtime()).await.unwrap_err();
    assert!(format!("{err:#}").contains("connection reset by peer"));

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "ops@x.com");
    assert!(sent[0].subject.starts_with("[FAILURE] epay_no_procalt (prod) run "));
    assert!(sent[0].html_body.contains("connection reset by peer"));
    assert!(!h.lock_path("epay_no_procalt").exists());
    assert_eq!(job.state().load_watermark().await.expect("wm"), None);
}

fn unresolved(visit_id: i64, email: &str) -> UnresolvedProcAltRow {
    UnresolvedProcAltRow {
        visit_id,
        modified_user_email: Some(email.into()),
        modified_user_name: Some("Jane Coordinator".into()),
        protocol_no: Some("HIC-2000012345".into()),
        subject_name: Some("SUBJ-01".into()),
        visit_date: NaiveDate::from_ymd_opt(2024, 1, 5),
        visit_name: Some("C1D1".into()),
        clinical_procedure: Some("ECG".into()),
    }
}

fn initial_alert(visit_id: &str, email: &str, sent_at: &str) -> AuditEvent {
    AuditEvent {
        sent_at: ts(sent_at),
        job_code: "epay_no_procalt".into(),
        event_type: EventType::InitialAlert,
        visit_id: visit_id.into(),
        modified_user_email: Some(email.into()),
        dedupe_key: IdempotencyKey::from_raw(format!("{visit_id}|{email}|{sent_at}")),
        job_run_id: Uuid::new_v4(),
        environment: Environment::Prod,
    }
}

fn weekly_settings() -> ProcAltWeeklySettings {
    ProcAltWeeklySettings {
        job: job_settings("epay_no_procalt_weekly_reminder", "PROCALTWEEKLY_", 4),
        columns: ProcAltColumns::default(),
        reminder_interval: Duration::days(7),
        initial_job_code: "epay_no_procalt".into(),
        audit: audit_table(),
        contact_email: Some("help@x.com".into()),
    }
}

#[tokio::test]
async fn weekly_reminder_follows_cadence_boundaries() {
    let h = Harness::new(Environment::Prod, "2024-01-08T08:59:59");
    let source = Arc::new(MemoryProcAltSource::new());
    source.set_unresolved(vec![unresolved(100, "Coord@X.com"), unresolved(300, "other@x.com")]);
    let audit = Arc::new(MemoryAuditLog::new());
    audit
        .append(&initial_alert("100", "coord@x.com", "2024-01-01T09:00:00"))
        .await
        .expect("seed");
    let job = ProcAltWeeklyReminderJob::new(weekly_settings(), source, audit.clone());
    let runtime = h.runtime();

    // One second before the interval elapses; visit 300 never had an initial alert.
    let early = completed(&job, &runtime).await;
    assert_eq!(early.sent, 0);
    assert_eq!(early.skipped, 2);

    h.clock.set(ts("2024-01-08T09:00:00"));
    let due = completed(&job, &runtime).await;
    assert_eq!(due.sent, 1);
    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "Coord@X.com");
    assert!(sent[0].html_body.contains("Dear Jane Coordinator,"));

    let reminders: Vec<_> = audit
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::WeeklyReminder)
        .collect();
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].dedupe_key.as_str(), "100|coord@x.com|2024-01-08");

    // The reminder just sent starts a new cooling-down period.
    h.clock.advance(Duration::days(6));
    assert_eq!(completed(&job, &runtime).await.sent, 0);
    h.clock.advance(Duration::days(1));
    assert_eq!(completed(&job, &runtime).await.sent, 1);
    assert_eq!(h.mailer.sent().len(), 2);
}

#[tokio::test]
async fn failed_reminder_is_not_recorded_and_goes_out_next_run() {
    let h = Harness::new(Environment::Prod, "2024-01-08T09:00:00");
    let source = Arc::new(MemoryProcAltSource::new());
    source.set_unresolved(vec![unresolved(100, "coord@x.com"), unresolved(300, "other@x.com")]);
    let audit = Arc::new(MemoryAuditLog::new());
    for (visit_id, email) in [("100", "coord@x.com"), ("300", "other@x.com")] {
        audit
            .append(&initial_alert(visit_id, email, "2024-01-01T09:00:00"))
            .await
            .expect("seed");
    }
    let job = ProcAltWeeklyReminderJob::new(weekly_settings(), source, audit.clone());
    h.mailer.fail_from(1);

    run_protected(&job, &h.runtime()).await.unwrap_err();
    let reminders = |audit: &MemoryAuditLog| -> Vec<String> {
        audit
            .events()
            .into_iter()
            .filter(|e| e.event_type == EventType::WeeklyReminder)
            .map(|e| e.visit_id)
            .collect()
    };
    assert_eq!(h.mailer.sent().len(), 1);
    assert_eq!(reminders(&audit), vec!["100".to_string()]);

    let retry_mailer = Arc::new(RecordingMailer::new());
    let retry = Runtime {
        mailer: retry_mailer.clone(),
        ..h.runtime()
    };
    let summary = completed(&job, &retry).await;
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(retry_mailer.sent()[0].to, "other@x.com");
    assert_eq!(reminders(&audit), vec!["100".to_string(), "300".to_string()]);
}

fn contact(pi: &str, coordinator: Option<&str>) -> ActivationContactRow {
    ActivationContactRow {
        hic_irb_no: Some("2000012345".into()),
        pi_contact_email: Some(pi.into()),
        business_office_contact: None,
        ir_submitter_email: None,
        primary_study_coordinator_email: coordinator.map(str::to_string),
    }
}

#[tokio::test]
async fn activation_keeps_sending_after_a_failure() {
    let h = Harness::new(Environment::Prod, "2024-01-01T08:00:00");
    let recipients_file = h.dir.path().join("recipients.yaml");
    std::fs::write(&recipients_file, "recipients:\n  - email: dean@x.com\n    type: leadership\n").expect("yaml");
    let source = Arc::new(MemoryReportSource {
        activation_contacts: vec![contact("pi@x.com", Some("crc@x.com")), contact("PI@x.com", None)],
        ..MemoryReportSource::default()
    });
    let settings = ActivationSettings {
        job: job_settings("study_activation_dashboard", "ACTIVATION_", 2),
        views: ReportViews::default(),
        dashboard_url: "https://dash.example.org".into(),
        guide_url: "https://guide.example.org".into(),
        recipients_file,
    };
    let job = ActivationJob::new(settings, source).expect("job");
    h.mailer.fail_from(1);
    let runtime = h.runtime();
    let ctx = runtime.context("study_activation_dashboard");

    let err = job.run(&ctx).await.unwrap_err();
    assert!(err.to_string().starts_with("2 of 3 activation emails failed"));
    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "crc@x.com");
    assert_eq!(sent[0].subject, "YCCI Study Activation Dashboard");

    let manifest_path = ctx
        .paths
        .sent_records_dir(ts("2024-01-01T08:00:00").date())
        .join(MANIFEST_FILE_NAME);
    let manifest = load_manifest(&manifest_path).await.expect("manifest");
    assert_eq!(manifest.files.len(), 1);
    assert_eq!(manifest.files[0].rows, 1);
}

fn upcoming(email: &str, seq: i64) -> VisitTrackingRow {
    VisitTrackingRow {
        coordinator_email: Some(email.into()),
        protocol_no: Some("HIC-1".into()),
        sequence_number: Some(seq),
        segment_name: Some("Treatment".into()),
        visit_date: NaiveDate::from_ymd_opt(2024, 1, 3),
        visit_name: Some(format!("Visit {seq}")),
        visit_url: Some(format!("https://oncore/visit/{seq}")),
    }
}

#[tokio::test]
async fn long_digests_go_out_as_spreadsheets() {
    let h = Harness::new(Environment::Prod, "2024-01-01T07:00:00");
    let mut rows: Vec<_> = (1..=21).map(|seq| upcoming("crc@x.com", seq)).collect();
    rows.push(upcoming("short@x.com", 1));
    let source = Arc::new(MemoryReportSource {
        upcoming_visits: rows,
        ..MemoryReportSource::default()
    });
    let settings = DigestSettings {
        job: job_settings("upcoming_visits", "UPCOMING_", 2),
        views: ReportViews::default(),
    };
    let job = DigestJob::new(DigestKind::UpcomingVisits, settings, source);

    let summary = completed(&job, &h.runtime()).await;
    assert_eq!(summary.sent, 2);

    let sent = h.mailer.sent();
    assert_eq!(sent[0].to, "crc@x.com");
    let attachment = sent[0].attachment.as_ref().expect("attachment");
    assert_eq!(attachment.content_type, XLSX_CONTENT_TYPE);
    assert!(attachment.filename.ends_with(".xlsx"));
    assert!(!attachment.bytes.is_empty());

    assert_eq!(sent[1].to, "short@x.com");
    assert!(sent[1].attachment.is_none());
    assert!(sent[1].html_body.contains("Visit 1"));
    assert_eq!(sent[1].subject, "OnCore Notification: Upcoming Visits Next 5 days");

    let manifest_path = summary.export.expect("export").with_file_name(MANIFEST_FILE_NAME);
    let manifest = load_manifest(&manifest_path).await.expect("manifest");
    assert_eq!(manifest.files[0].rows, 22);
}

//! Poll loop scenarios against in-memory vendor and sink fakes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

use glucowallet_core::api::{ApiError, VendorApi};
use glucowallet_core::auth::{AuthToken, Credentials, LoginTicket, Session, SessionManager};
use glucowallet_core::models::{Connection, Reading, TrendDirection};
use glucowallet_core::publish::{PointPublisher, PointSink, PublishPoint, SinkError};
use glucowallet_core::{CycleOutcome, ErrorKind, PollSettings, Poller, Stage};

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeVendor {
    login_results: Mutex<VecDeque<Result<(), ApiError>>>,
    readings: Mutex<VecDeque<Result<Reading, ApiError>>>,
    login_count: AtomicUsize,
    tokens_used: Mutex<Vec<String>>,
    block_fetch: AtomicBool,
    fetch_entered: Notify,
    fetch_release: Notify,
    ticket_lifetime: Option<chrono::Duration>,
}

impl FakeVendor {
    fn with_readings(readings: Vec<Result<Reading, ApiError>>) -> Self {
        let vendor = Self::default();
        *vendor.readings.lock().unwrap() = readings.into();
        vendor
    }

    fn fail_logins(self, results: Vec<Result<(), ApiError>>) -> Self {
        *self.login_results.lock().unwrap() = results.into();
        self
    }

    fn with_ticket_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.ticket_lifetime = Some(lifetime);
        self
    }

    fn push_reading(&self, reading: Result<Reading, ApiError>) {
        self.readings.lock().unwrap().push_back(reading);
    }

    fn logins(&self) -> usize {
        self.login_count.load(Ordering::SeqCst)
    }

    fn tokens_used(&self) -> Vec<String> {
        self.tokens_used.lock().unwrap().clone()
    }
}

#[async_trait]
impl VendorApi for FakeVendor {
    async fn login(&self, _credentials: &Credentials) -> Result<LoginTicket, ApiError> {
        let n = self.login_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(Err(e)) = self.login_results.lock().unwrap().pop_front() {
            return Err(e);
        }
        Ok(LoginTicket {
            token: AuthToken::new(format!("tok-{}", n)),
            expires_at: Utc::now()
                + self
                    .ticket_lifetime
                    .unwrap_or_else(|| chrono::Duration::hours(12)),
            account_id: "account-1".to_string(),
            api_base: "http://linkup.invalid".to_string(),
        })
    }

    async fn connections(&self, _ticket: &LoginTicket) -> Result<Vec<Connection>, ApiError> {
        let connection = serde_json::from_value(serde_json::json!({
            "patientId": "patient-1",
            "sensor": {"sn": "SN-1"}
        }))
        .expect("valid connection");
        Ok(vec![connection])
    }

    async fn fetch_latest(&self, session: &Session) -> Result<Reading, ApiError> {
        self.tokens_used
            .lock()
            .unwrap()
            .push(session.token.as_str().to_string());

        if self.block_fetch.load(Ordering::SeqCst) {
            self.fetch_entered.notify_one();
            self.fetch_release.notified().await;
        }

        self.readings
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ApiError::NoReading))
    }
}

#[derive(Default)]
struct FakeSink {
    results: Mutex<VecDeque<Result<(), SinkError>>>,
    written: Mutex<Vec<PublishPoint>>,
}

impl FakeSink {
    fn failing_first(results: Vec<Result<(), SinkError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            written: Mutex::default(),
        }
    }

    fn timestamps(&self) -> Vec<i64> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.timestamp.timestamp())
            .collect()
    }
}

#[async_trait]
impl PointSink for FakeSink {
    async fn write(&self, point: &PublishPoint) -> Result<(), SinkError> {
        if let Some(Err(e)) = self.results.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.written.lock().unwrap().push(point.clone());
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

fn reading(secs: i64, value: f64) -> Result<Reading, ApiError> {
    Ok(Reading::new(ts(secs), value, TrendDirection::Stable))
}

fn settings() -> PollSettings {
    PollSettings {
        interval: Duration::from_secs(60),
        backoff_initial: Duration::from_secs(10),
        backoff_max: Duration::from_secs(80),
    }
}

fn poller(vendor: FakeVendor, sink: FakeSink) -> Poller<FakeVendor, FakeSink> {
    Poller::new(
        vendor,
        PointPublisher::new(sink, "libreview_data"),
        SessionManager::new(Credentials::new("ada@example.com", "pw"), None),
        settings(),
    )
}

fn sink_exhausted() -> SinkError {
    SinkError::RetriesExhausted {
        attempts: 4,
        last: "status 503".to_string(),
    }
}

fn assert_failed(outcome: &CycleOutcome, expected_stage: Stage, expected_kind: ErrorKind) {
    match outcome {
        CycleOutcome::Failed { stage, error } => {
            assert_eq!(*stage, expected_stage);
            assert_eq!(error.kind(), expected_kind);
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_duplicate_reading_published_once() {
    let vendor = FakeVendor::with_readings(vec![
        reading(100, 120.0),
        reading(100, 120.0),
        reading(160, 118.0),
    ]);
    let poller = poller(vendor, FakeSink::default());

    let first = poller.trigger().await;
    assert!(matches!(first.outcome, CycleOutcome::Published { .. }));

    let second = poller.trigger().await;
    assert!(matches!(second.outcome, CycleOutcome::Duplicate { timestamp } if timestamp == ts(100)));
    assert_eq!(second.next_delay, Duration::from_secs(60));

    let third = poller.trigger().await;
    assert!(matches!(third.outcome, CycleOutcome::Published { value_mg_dl, .. } if value_mg_dl == 118.0));

    assert_eq!(poller.publisher().sink().timestamps(), vec![100, 160]);
    assert_eq!(poller.api().logins(), 1);
    assert_eq!(poller.status().await.last_emitted, Some(ts(160)));
}

#[tokio::test]
async fn test_older_reading_rejected() {
    let vendor = FakeVendor::with_readings(vec![reading(200, 110.0), reading(150, 90.0)]);
    let poller = poller(vendor, FakeSink::default());

    poller.trigger().await;
    let report = poller.trigger().await;

    assert!(matches!(report.outcome, CycleOutcome::Duplicate { .. }));
    assert_eq!(poller.publisher().sink().timestamps(), vec![200]);
    assert_eq!(poller.status().await.last_emitted, Some(ts(200)));
}

#[tokio::test]
async fn test_unauthorized_fetch_relogs_in_same_cycle() {
    let vendor = FakeVendor::with_readings(vec![Err(ApiError::Unauthorized), reading(100, 120.0)]);
    let poller = poller(vendor, FakeSink::default());

    let report = poller.trigger().await;

    assert!(matches!(report.outcome, CycleOutcome::Published { .. }));
    assert_eq!(poller.api().logins(), 2);
    assert_eq!(poller.api().tokens_used(), vec!["tok-1", "tok-2"]);
    assert_eq!(poller.publisher().sink().timestamps(), vec![100]);
}

#[tokio::test]
async fn test_failed_relogin_ends_cycle_in_backoff() {
    let vendor = FakeVendor::with_readings(vec![Err(ApiError::Unauthorized)]).fail_logins(vec![
        Ok(()),
        Err(ApiError::InvalidCredentials("notAuthenticated".to_string())),
    ]);
    let poller = poller(vendor, FakeSink::default());

    let report = poller.trigger().await;
    assert_failed(&report.outcome, Stage::Authenticating, ErrorKind::Auth);
    assert_eq!(report.next_delay, Duration::from_secs(10));
    assert!(poller.publisher().sink().timestamps().is_empty());

    let status = poller.status().await;
    assert_eq!(status.stage, Stage::Sleeping);
    assert!(status.patient_id.is_none());

    // Next cycle logs in afresh; the rejected token is never sent again
    poller.api().push_reading(reading(100, 120.0));
    let report = poller.trigger().await;
    assert!(matches!(report.outcome, CycleOutcome::Published { .. }));
    assert_eq!(poller.api().logins(), 3);
    assert_eq!(poller.api().tokens_used(), vec!["tok-1", "tok-3"]);
}

#[tokio::test]
async fn test_login_failure_skips_fetch() {
    let vendor = FakeVendor::with_readings(vec![reading(100, 120.0)])
        .fail_logins(vec![Err(ApiError::InvalidCredentials("bad".to_string()))]);
    let poller = poller(vendor, FakeSink::default());

    let report = poller.trigger().await;

    assert_failed(&report.outcome, Stage::Authenticating, ErrorKind::Auth);
    assert!(poller.api().tokens_used().is_empty());
}

#[tokio::test]
async fn test_session_near_declared_expiry_is_renewed() {
    let vendor = FakeVendor::with_readings(vec![reading(100, 120.0), reading(160, 118.0)])
        .with_ticket_lifetime(chrono::Duration::minutes(3));
    let poller = poller(vendor, FakeSink::default());

    let first = poller.trigger().await;
    assert!(matches!(first.outcome, CycleOutcome::Published { .. }));
    assert_eq!(poller.api().logins(), 1);

    // Token expires inside the refresh buffer, so the next cycle logs in
    // before fetching instead of waiting for a 401
    let second = poller.trigger().await;
    assert!(matches!(second.outcome, CycleOutcome::Published { .. }));
    assert_eq!(poller.api().logins(), 2);
    assert_eq!(poller.api().tokens_used(), vec!["tok-1", "tok-2"]);
    assert_eq!(poller.publisher().sink().timestamps(), vec![100, 160]);
}

#[tokio::test]
async fn test_long_lived_session_is_reused() {
    let vendor = FakeVendor::with_readings(vec![reading(100, 120.0), reading(160, 118.0)])
        .with_ticket_lifetime(chrono::Duration::minutes(60));
    let poller = poller(vendor, FakeSink::default());

    poller.trigger().await;
    poller.trigger().await;

    assert_eq!(poller.api().logins(), 1);
    assert_eq!(poller.api().tokens_used(), vec!["tok-1", "tok-1"]);
}

#[tokio::test]
async fn test_unreachable_vendor_at_login_is_auth_failure() {
    let vendor = FakeVendor::with_readings(vec![reading(100, 120.0)])
        .fail_logins(vec![Err(ApiError::Timeout("30s".to_string()))]);
    let poller = poller(vendor, FakeSink::default());

    let report = poller.trigger().await;
    assert_failed(&report.outcome, Stage::Authenticating, ErrorKind::Auth);
    assert_eq!(report.next_delay, Duration::from_secs(10));

    let report = poller.trigger().await;
    assert!(matches!(report.outcome, CycleOutcome::Published { .. }));
    assert_eq!(report.next_delay, Duration::from_secs(60));
    assert_eq!(poller.api().logins(), 2);
}

#[tokio::test]
async fn test_repeated_unauthorized_invalidates_fresh_session() {
    let vendor = FakeVendor::with_readings(vec![
        Err(ApiError::Unauthorized),
        Err(ApiError::Unauthorized),
    ]);
    let poller = poller(vendor, FakeSink::default());

    let report = poller.trigger().await;

    assert_failed(&report.outcome, Stage::Fetching, ErrorKind::Auth);
    assert_eq!(poller.api().logins(), 2);
    assert!(poller.status().await.patient_id.is_none());
}

#[tokio::test]
async fn test_sink_failure_keeps_cursor() {
    let vendor = FakeVendor::with_readings(vec![
        reading(100, 125.0),
        reading(200, 130.0),
        reading(200, 130.0),
    ]);
    let sink = FakeSink::failing_first(vec![Ok(()), Err(sink_exhausted())]);
    let poller = poller(vendor, sink);

    poller.trigger().await;
    assert_eq!(poller.status().await.last_emitted, Some(ts(100)));

    let failed = poller.trigger().await;
    assert_failed(&failed.outcome, Stage::Publishing, ErrorKind::Sink);
    assert_eq!(poller.status().await.last_emitted, Some(ts(100)));

    let retried = poller.trigger().await;
    assert!(matches!(retried.outcome, CycleOutcome::Published { timestamp, .. } if timestamp == ts(200)));
    assert_eq!(poller.status().await.last_emitted, Some(ts(200)));
    assert_eq!(poller.publisher().sink().timestamps(), vec![100, 200]);
}

#[tokio::test]
async fn test_transient_fetch_reuses_session() {
    let vendor = FakeVendor::with_readings(vec![
        Err(ApiError::ServerError("502 Bad Gateway".to_string())),
        reading(100, 120.0),
    ]);
    let poller = poller(vendor, FakeSink::default());

    let failed = poller.trigger().await;
    assert_failed(&failed.outcome, Stage::Fetching, ErrorKind::Transient);
    assert_eq!(poller.status().await.patient_id.as_deref(), Some("patient-1"));

    let report = poller.trigger().await;
    assert!(matches!(report.outcome, CycleOutcome::Published { .. }));
    assert_eq!(poller.api().logins(), 1);
    assert_eq!(poller.api().tokens_used(), vec!["tok-1", "tok-1"]);
}

#[tokio::test]
async fn test_parse_error_logged_distinctly_and_retried() {
    let vendor = FakeVendor::with_readings(vec![
        Err(ApiError::InvalidResponse("graph response: missing field".to_string())),
        reading(100, 120.0),
    ]);
    let poller = poller(vendor, FakeSink::default());

    let failed = poller.trigger().await;
    assert_failed(&failed.outcome, Stage::Fetching, ErrorKind::Parse);
    assert_eq!(failed.outcome.error_kind(), Some(ErrorKind::Parse));

    let report = poller.trigger().await;
    assert!(report.outcome.is_success());
    assert_eq!(poller.api().logins(), 1);
}

#[tokio::test]
async fn test_backoff_grows_and_resets_after_success() {
    let vendor = FakeVendor::with_readings(vec![
        Err(ApiError::Timeout("operation timed out".to_string())),
        Err(ApiError::ServerError("503".to_string())),
        Err(ApiError::RateLimited),
        Err(ApiError::ServerError("503".to_string())),
        Err(ApiError::ServerError("503".to_string())),
        reading(100, 120.0),
        Err(ApiError::ServerError("503".to_string())),
    ]);
    let poller = poller(vendor, FakeSink::default());

    let mut delays = Vec::new();
    for _ in 0..7 {
        delays.push(poller.trigger().await.next_delay.as_secs());
    }

    assert_eq!(delays, vec![10, 20, 40, 80, 80, 60, 10]);
    assert_eq!(poller.status().await.consecutive_failures, 1);
}

#[tokio::test]
async fn test_trigger_skipped_while_cycle_in_flight() {
    let vendor = FakeVendor::with_readings(vec![reading(100, 120.0)]);
    vendor.block_fetch.store(true, Ordering::SeqCst);
    let poller = Arc::new(poller(vendor, FakeSink::default()));

    let background = Arc::clone(&poller);
    let in_flight = tokio::spawn(async move { background.trigger().await });

    poller.api().fetch_entered.notified().await;
    let skipped = poller.trigger().await;
    assert!(matches!(skipped.outcome, CycleOutcome::Skipped));
    assert_eq!(skipped.next_delay, Duration::from_secs(60));

    poller.api().fetch_release.notify_one();
    let finished = in_flight.await.expect("cycle task completes");
    assert!(matches!(finished.outcome, CycleOutcome::Published { .. }));

    // The skipped trigger neither fetched nor published
    assert_eq!(poller.api().tokens_used().len(), 1);
    assert_eq!(poller.publisher().sink().timestamps(), vec![100]);
}

#[tokio::test(start_paused = true)]
async fn test_run_polls_on_interval_until_shutdown() {
    let vendor = FakeVendor::with_readings(vec![
        reading(100, 120.0),
        reading(160, 121.0),
        reading(220, 122.0),
        reading(280, 123.0),
    ]);
    let poller = poller(vendor, FakeSink::default());

    // Cycles at 0s, 60s and 120s; shutdown lands during the third sleep
    poller.run(tokio::time::sleep(Duration::from_secs(150))).await;

    assert_eq!(poller.publisher().sink().timestamps(), vec![100, 160, 220]);
    assert_eq!(poller.status().await.last_emitted, Some(ts(220)));
}

#[tokio::test(start_paused = true)]
async fn test_run_keeps_going_through_failures() {
    let vendor = FakeVendor::with_readings(vec![
        Err(ApiError::ServerError("500".to_string())),
        Err(ApiError::ServerError("500".to_string())),
        reading(100, 120.0),
    ]);
    let poller = poller(vendor, FakeSink::default());

    // Failures at 0s and 10s (backoff 10s, 20s), success at 30s
    poller.run(tokio::time::sleep(Duration::from_secs(45))).await;

    assert_eq!(poller.publisher().sink().timestamps(), vec![100]);
    assert_eq!(poller.status().await.consecutive_failures, 0);
}

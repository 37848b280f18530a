//! The poll loop: ensure a session, fetch the latest reading, drop
//! duplicates, publish, sleep.
//!
//! Only one cycle runs at a time. The session, cursor and backoff live
//! behind a `tokio::sync::Mutex` that is only ever `try_lock`ed, so a
//! trigger arriving while a cycle is stalled is skipped instead of queued.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::api::VendorApi;
use crate::auth::SessionManager;
use crate::dedupe::{Admission, EmissionCursor};
use crate::error::{ErrorKind, PollError};
use crate::publish::{PointPublisher, PointSink};

/// Sensors report about once a minute.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_BACKOFF_INITIAL_SECS: u64 = 60;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            backoff_initial: Duration::from_secs(DEFAULT_BACKOFF_INITIAL_SECS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
        }
    }
}

/// Sleep schedule: the fixed interval after a good cycle, doubling delays
/// capped at a ceiling after consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    interval: Duration,
    initial: Duration,
    ceiling: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(interval: Duration, initial: Duration, ceiling: Duration) -> Self {
        Self {
            interval,
            initial,
            ceiling: ceiling.max(initial),
            failures: 0,
        }
    }

    pub fn from_settings(settings: &PollSettings) -> Self {
        Self::new(settings.interval, settings.backoff_initial, settings.backoff_max)
    }

    pub fn on_success(&mut self) -> Duration {
        self.failures = 0;
        self.interval
    }

    pub fn on_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let exponent = (self.failures - 1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Authenticating,
    Fetching,
    Deduping,
    Publishing,
    Sleeping,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Authenticating => "authenticating",
            Stage::Fetching => "fetching",
            Stage::Deduping => "deduping",
            Stage::Publishing => "publishing",
            Stage::Sleeping => "sleeping",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    Published {
        timestamp: DateTime<Utc>,
        value_mg_dl: f64,
    },
    Duplicate {
        timestamp: DateTime<Utc>,
    },
    Failed {
        stage: Stage,
        error: PollError,
    },
    /// Another cycle was still in flight.
    Skipped,
}

impl CycleOutcome {
    fn failed(stage: Stage, error: impl Into<PollError>) -> Self {
        CycleOutcome::Failed {
            stage,
            error: error.into(),
        }
    }

    /// Published or duplicate; both reset the backoff.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Published { .. } | CycleOutcome::Duplicate { .. }
        )
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            CycleOutcome::Failed { error, .. } => Some(error.kind()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub next_delay: Duration,
}

/// Point-in-time view of the loop's state, for status output and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerStatus {
    pub stage: Stage,
    pub last_emitted: Option<DateTime<Utc>>,
    pub patient_id: Option<String>,
    pub consecutive_failures: u32,
}

struct CycleState {
    sessions: SessionManager,
    cursor: EmissionCursor,
    backoff: Backoff,
    stage: Stage,
}

pub struct Poller<V, S> {
    api: V,
    publisher: PointPublisher<S>,
    interval: Duration,
    state: Mutex<CycleState>,
}

impl<V, S> Poller<V, S>
where
    V: VendorApi,
    S: PointSink,
{
    pub fn new(
        api: V,
        publisher: PointPublisher<S>,
        sessions: SessionManager,
        settings: PollSettings,
    ) -> Self {
        Self {
            api,
            publisher,
            interval: settings.interval,
            state: Mutex::new(CycleState {
                sessions,
                cursor: EmissionCursor::new(),
                backoff: Backoff::from_settings(&settings),
                stage: Stage::Idle,
            }),
        }
    }

    pub fn publisher(&self) -> &PointPublisher<S> {
        &self.publisher
    }

    pub fn api(&self) -> &V {
        &self.api
    }

    /// Run one cycle unless one is already in flight.
    pub async fn trigger(&self) -> CycleReport {
        let Ok(mut state) = self.state.try_lock() else {
            debug!("Poll cycle still in flight, skipping trigger");
            return CycleReport {
                outcome: CycleOutcome::Skipped,
                next_delay: self.interval,
            };
        };

        let outcome = self.run_cycle(&mut state).await;
        let next_delay = if outcome.is_success() {
            state.backoff.on_success()
        } else {
            state.backoff.on_failure()
        };
        state.stage = Stage::Sleeping;

        log_outcome(&outcome, next_delay, state.backoff.failures());
        CycleReport {
            outcome,
            next_delay,
        }
    }

    /// Any failure while establishing a session is reported as `Auth`,
    /// whatever its cause, so the next cycle starts from a fresh login.
    async fn run_cycle(&self, state: &mut CycleState) -> CycleOutcome {
        state.stage = Stage::Authenticating;
        let session = match state.sessions.ensure_session(&self.api).await {
            Ok(session) => session,
            Err(e) => return CycleOutcome::failed(Stage::Authenticating, PollError::Auth(e)),
        };

        state.stage = Stage::Fetching;
        let (session, reading) = match self.api.fetch_latest(&session).await {
            Ok(reading) => (session, reading),
            Err(e) if e.is_auth() => {
                warn!(error = %e, "LinkUp rejected the session, logging in again");
                state.sessions.invalidate();

                state.stage = Stage::Authenticating;
                let fresh = match state.sessions.ensure_session(&self.api).await {
                    Ok(session) => session,
                    Err(e) => {
                        return CycleOutcome::failed(Stage::Authenticating, PollError::Auth(e))
                    }
                };

                state.stage = Stage::Fetching;
                match self.api.fetch_latest(&fresh).await {
                    Ok(reading) => (fresh, reading),
                    Err(e) => {
                        if e.is_auth() {
                            state.sessions.invalidate();
                        }
                        return CycleOutcome::failed(Stage::Fetching, e);
                    }
                }
            }
            Err(e) => return CycleOutcome::failed(Stage::Fetching, e),
        };

        state.stage = Stage::Deduping;
        if state.cursor.admit(&reading) == Admission::Reject {
            return CycleOutcome::Duplicate {
                timestamp: reading.timestamp,
            };
        }

        state.stage = Stage::Publishing;
        match self.publisher.publish(&reading, &session.patient_id).await {
            Ok(ack) => {
                state.cursor.commit(ack.timestamp);
                CycleOutcome::Published {
                    timestamp: ack.timestamp,
                    value_mg_dl: reading.value_mg_dl,
                }
            }
            Err(e) => CycleOutcome::failed(Stage::Publishing, e),
        }
    }

    /// Poll until `shutdown` resolves. A cycle already running is allowed to
    /// finish; shutdown is observed between cycles and while sleeping.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(interval_secs = self.interval.as_secs(), "Poll loop started");

        loop {
            let report = self.trigger().await;

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, poll loop stopped");
                    break;
                }
                _ = tokio::time::sleep(report.next_delay) => {}
            }
        }
    }

    pub async fn status(&self) -> PollerStatus {
        let state = self.state.lock().await;
        PollerStatus {
            stage: state.stage,
            last_emitted: state.cursor.last_emitted(),
            patient_id: state.sessions.current().map(|s| s.patient_id.clone()),
            consecutive_failures: state.backoff.failures(),
        }
    }
}

fn log_outcome(outcome: &CycleOutcome, next_delay: Duration, failures: u32) {
    let delay_secs = next_delay.as_secs();
    match outcome {
        CycleOutcome::Published {
            timestamp,
            value_mg_dl,
        } => {
            info!(%timestamp, value = value_mg_dl, "Reading published");
        }
        CycleOutcome::Duplicate { timestamp } => {
            debug!(%timestamp, "No new reading since last publish");
        }
        CycleOutcome::Failed { stage, error } => match error.kind() {
            ErrorKind::Parse => error!(
                stage = %stage,
                kind = %error.kind(),
                failures,
                delay_secs,
                error = %error,
                "Unrecognized LinkUp payload"
            ),
            kind => warn!(
                stage = %stage,
                kind = %kind,
                failures,
                delay_secs,
                error = %error,
                "Poll cycle failed"
            ),
        },
        CycleOutcome::Skipped => {}
    }
}

//! glucowallet core library.
//!
//! Follows a patient's glucose readings on LibreLinkUp and republishes them
//! as InfluxDB points. The pieces, leaves first:
//!
//! - `auth`: credentials and the session (token + patient) lifecycle
//! - `api`: the LinkUp HTTP client behind the `VendorApi` trait
//! - `dedupe`: the emission cursor that suppresses already-written readings
//! - `publish`: point construction and the InfluxDB sink behind `PointSink`
//! - `poller`: the single-flight poll loop with backoff
//! - `config`: file + environment configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod models;
pub mod poller;
pub mod publish;

pub use api::{ApiError, LinkUpClient, VendorApi};
pub use auth::{Credentials, Session, SessionManager};
pub use config::{load_settings, Config, ConfigError, Settings};
pub use dedupe::{Admission, EmissionCursor};
pub use error::{ErrorKind, PollError};
pub use models::{Reading, TrendDirection};
pub use poller::{Backoff, CycleOutcome, CycleReport, PollSettings, Poller, PollerStatus, Stage};
pub use publish::{Ack, InfluxSink, InfluxTarget, PointPublisher, PointSink, PublishPoint, SinkError};

//! Suppresses readings that were already written to the sink.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject,
}

/// Timestamp of the last reading the sink confirmed. Memory only; a restart
/// may re-emit the latest point, which the sink absorbs by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmissionCursor {
    last_emitted: Option<DateTime<Utc>>,
}

impl EmissionCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_emitted(&self) -> Option<DateTime<Utc>> {
        self.last_emitted
    }

    /// Accept only readings strictly newer than the last emitted one.
    pub fn admit(&self, reading: &Reading) -> Admission {
        match self.last_emitted {
            Some(last) if reading.timestamp <= last => Admission::Reject,
            _ => Admission::Accept,
        }
    }

    /// Record a confirmed write. Never moves backwards.
    pub fn commit(&mut self, timestamp: DateTime<Utc>) {
        match self.last_emitted {
            Some(last) if timestamp <= last => {
                debug!(%timestamp, %last, "Ignoring cursor commit that does not move forward");
            }
            _ => self.last_emitted = Some(timestamp),
        }
    }
}

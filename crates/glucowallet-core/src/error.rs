//! Error taxonomy seen by the poll loop.
//!
//! Every failure a cycle can hit is folded into one of four kinds. Vendor
//! errors (`ApiError`) and sink errors (`SinkError`) are classified on the
//! way in, so the scheduler only has to decide between re-login, retry with
//! backoff, and leaving the cursor alone.

use std::fmt;

use thiserror::Error;

use crate::api::ApiError;
use crate::publish::SinkError;

/// Coarse error kind used for log fields and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Transient,
    Parse,
    Sink,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Transient => "transient",
            ErrorKind::Parse => "parse",
            ErrorKind::Sink => "sink",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum PollError {
    #[error("authentication failed: {0}")]
    Auth(#[source] ApiError),

    #[error("transient vendor failure: {0}")]
    Transient(#[source] ApiError),

    #[error("unexpected vendor payload: {0}")]
    Parse(#[source] ApiError),

    #[error("sink write failed: {0}")]
    Sink(#[from] SinkError),
}

impl PollError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PollError::Auth(_) => ErrorKind::Auth,
            PollError::Transient(_) => ErrorKind::Transient,
            PollError::Parse(_) => ErrorKind::Parse,
            PollError::Sink(_) => ErrorKind::Sink,
        }
    }
}

impl From<ApiError> for PollError {
    fn from(err: ApiError) -> Self {
        if err.is_auth() {
            return PollError::Auth(err);
        }
        match err {
            ApiError::InvalidResponse(_) => PollError::Parse(err),
            _ => PollError::Transient(err),
        }
    }
}

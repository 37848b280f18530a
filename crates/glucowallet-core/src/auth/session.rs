use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::api::{ApiError, VendorApi};
use crate::models::Connection;

use super::Credentials;

/// Buffer time before the declared expiry at which the token is renewed.
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

/// Lifetime assumed when the login answer does not declare one.
const FALLBACK_TOKEN_LIFETIME_MINUTES: i64 = 60;

/// Opaque bearer token. Never parsed, never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Result of a successful login, before the patient is known.
#[derive(Debug, Clone)]
pub struct LoginTicket {
    pub token: AuthToken,
    pub expires_at: DateTime<Utc>,
    /// LinkUp user id of the account owner.
    pub account_id: String,
    /// Base URL of the regional API host the account lives on.
    pub api_base: String,
}

impl LoginTicket {
    /// Expiry from the declared epoch seconds, else from the declared
    /// duration, else a conservative fallback.
    pub fn resolve_expiry(
        now: DateTime<Utc>,
        expires_epoch_secs: Option<i64>,
        duration_ms: Option<i64>,
    ) -> DateTime<Utc> {
        if let Some(at) = expires_epoch_secs.and_then(|s| DateTime::from_timestamp(s, 0)) {
            return at;
        }
        if let Some(ms) = duration_ms.filter(|ms| *ms > 0) {
            return now + Duration::milliseconds(ms);
        }
        now + Duration::minutes(FALLBACK_TOKEN_LIFETIME_MINUTES)
    }
}

/// An authenticated session bound to one monitored patient.
///
/// Token and patient are set together and the whole value is replaced on
/// refresh, so a caller never sees one without the other.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: AuthToken,
    pub expires_at: DateTime<Utc>,
    pub account_id: String,
    pub patient_id: String,
    pub sensor_serial: Option<String>,
    pub api_base: String,
}

impl Session {
    pub fn new(ticket: LoginTicket, connection: &Connection) -> Self {
        Self {
            token: ticket.token,
            expires_at: ticket.expires_at,
            account_id: ticket.account_id,
            patient_id: connection.patient_id.clone(),
            sensor_serial: connection.sensor_serial().map(str::to_string),
            api_base: ticket.api_base,
        }
    }

    /// Check if the session will expire soon and should be refreshed
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES)
    }
}

/// SHA-256 hex of the account id, sent as the `account-id` header.
pub fn account_id_digest(account_id: &str) -> String {
    hex::encode(Sha256::digest(account_id.as_bytes()))
}

/// Owns the current session and re-creates it on demand.
pub struct SessionManager {
    credentials: Credentials,
    preferred_patient: Option<String>,
    current: Option<Arc<Session>>,
}

impl SessionManager {
    pub fn new(credentials: Credentials, preferred_patient: Option<String>) -> Self {
        Self {
            credentials,
            preferred_patient,
            current: None,
        }
    }

    /// Return a usable session, logging in and resolving the patient if
    /// there is none or the current one is about to expire.
    pub async fn ensure_session<A>(&mut self, api: &A) -> Result<Arc<Session>, ApiError>
    where
        A: VendorApi + ?Sized,
    {
        if let Some(ref session) = self.current {
            if !session.needs_refresh(Utc::now()) {
                return Ok(Arc::clone(session));
            }
            debug!(expires_at = %session.expires_at, "Session near expiry, renewing");
            self.current = None;
        }

        let ticket = api.login(&self.credentials).await?;
        let connections = api.connections(&ticket).await?;
        let connection = select_connection(&connections, self.preferred_patient.as_deref())?;

        let session = Arc::new(Session::new(ticket, connection));
        info!(
            patient_id = %session.patient_id,
            expires_at = %session.expires_at,
            "LinkUp session established"
        );
        self.current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Drop the current session; the next `ensure_session` logs in again.
    pub fn invalidate(&mut self) {
        if let Some(old) = self.current.take() {
            warn!(patient_id = %old.patient_id, "LinkUp session invalidated");
        }
    }

    pub fn current(&self) -> Option<&Arc<Session>> {
        self.current.as_ref()
    }
}

/// Choose the followed patient: the configured one, else the first.
fn select_connection<'a>(
    connections: &'a [Connection],
    preferred: Option<&str>,
) -> Result<&'a Connection, ApiError> {
    match preferred {
        Some(id) => connections
            .iter()
            .find(|c| c.patient_id == id)
            .ok_or(ApiError::NoPatient),
        None => connections.first().ok_or(ApiError::NoPatient),
    }
}

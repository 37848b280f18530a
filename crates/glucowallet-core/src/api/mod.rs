//! REST API client module for LibreLinkUp.
//!
//! This module provides the `LinkUpClient` for logging in to LinkUp,
//! discovering the followed patient, and fetching glucose readings.
//!
//! The API uses bearer tokens plus an `account-id` header holding the
//! SHA-256 digest of the account owner's user id.

use async_trait::async_trait;

use crate::auth::{Credentials, LoginTicket, Session};
use crate::models::{Connection, Reading};

pub mod client;
pub mod error;

pub use client::LinkUpClient;
pub use error::ApiError;

/// Vendor operations the session manager and poll loop depend on.
///
/// Each call is a single attempt; retrying is the caller's business.
#[async_trait]
pub trait VendorApi: Send + Sync {
    /// Submit credentials and return a token with its expiry.
    async fn login(&self, credentials: &Credentials) -> Result<LoginTicket, ApiError>;

    /// List the patients the logged-in account follows.
    async fn connections(&self, ticket: &LoginTicket) -> Result<Vec<Connection>, ApiError>;

    /// Fetch the most recent reading for the session's patient.
    async fn fetch_latest(&self, session: &Session) -> Result<Reading, ApiError>;
}

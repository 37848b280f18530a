//! Authentication module for LinkUp sessions and credentials.
//!
//! This module provides:
//! - `Credentials`: username/password, redacted in debug output
//! - `Session`: token plus patient, replaced wholesale on refresh
//! - `SessionManager`: login, patient discovery, and invalidation
//!
//! Sessions live in memory only.

pub mod credentials;
pub mod session;

pub use credentials::Credentials;
pub use session::{account_id_digest, AuthToken, LoginTicket, Session, SessionManager};

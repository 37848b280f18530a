//! API client for the LibreLinkUp follower API.
//!
//! This module provides the `LinkUpClient` struct for logging in, listing
//! followed patients, and fetching the latest glucose readings.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, info, warn};

use crate::auth::{account_id_digest, AuthToken, Credentials, LoginTicket, Session};
use crate::models::{select_latest, Connection, GlucoseItem, Reading};

use super::{ApiError, VendorApi};

// ============================================================================
// Constants
// ============================================================================

/// Global LinkUp host; accounts outside it are redirected at login.
pub const DEFAULT_API_BASE: &str = "https://api.libreview.io";

/// Template for regional hosts, `{region}` is replaced by e.g. `eu`.
pub const DEFAULT_REGION_TEMPLATE: &str = "https://api-{region}.libreview.io";

/// Client identity expected by the API. Versions below 4.16 are refused.
const PRODUCT: &str = "llu.android";
const CLIENT_VERSION: &str = "4.16.0";

/// HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on post-login steps (terms of use, privacy policy) to follow.
const MAX_LOGIN_STEPS: usize = 3;

/// Vendor status codes carried inside HTTP 200 bodies.
const STATUS_OK: i64 = 0;
const STATUS_BAD_CREDENTIALS: i64 = 2;
const STATUS_STEP_REQUIRED: i64 = 4;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: i64,
    data: Option<T>,
    #[serde(default)]
    error: Option<VendorErrorBody>,
}

#[derive(Debug, Deserialize)]
struct VendorErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    redirect: bool,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    user: Option<LoginUser>,
    #[serde(rename = "authTicket", default)]
    auth_ticket: Option<AuthTicketData>,
    #[serde(default)]
    step: Option<LoginStep>,
}

#[derive(Debug, Deserialize)]
struct LoginUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AuthTicketData {
    token: String,
    #[serde(default)]
    expires: Option<i64>,
    #[serde(default)]
    duration: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LoginStep {
    #[serde(rename = "type")]
    step_type: String,
}

#[derive(Debug, Deserialize)]
struct GraphData {
    connection: Connection,
    #[serde(rename = "graphData", default)]
    graph_data: Vec<GlucoseItem>,
}

// ============================================================================
// Client
// ============================================================================

/// LinkUp API client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct LinkUpClient {
    client: Client,
    api_base: String,
    region_template: String,
}

impl LinkUpClient {
    /// Create a client against the global host with the default timeout
    pub fn new() -> Result<Self, ApiError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ApiError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
        headers.insert("product", header::HeaderValue::from_static(PRODUCT));
        headers.insert("version", header::HeaderValue::from_static(CLIENT_VERSION));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            region_template: DEFAULT_REGION_TEMPLATE.to_string(),
        })
    }

    /// Start logins at the given base URL instead of the global host.
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.api_base = trim_base(base.into());
        self
    }

    /// Start logins at a known regional host, skipping the redirect round trip.
    pub fn with_region(self, region: &str) -> Self {
        let base = self.regional_base(region);
        self.with_base_url(base)
    }

    /// Override how regional hosts are built from a region name.
    pub fn with_region_template(mut self, template: impl Into<String>) -> Self {
        self.region_template = template.into();
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn regional_base(&self, region: &str) -> String {
        trim_base(self.region_template.replace("{region}", region))
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Read a LinkUp envelope and unwrap its `data`, turning vendor status
    /// codes into errors.
    async fn read_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<T, ApiError> {
        let response = Self::check_response(response).await?;
        let text = response.text().await.map_err(ApiError::from_transport)?;

        let envelope: Envelope<T> = serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("{} response: {}", what, e)))?;

        match envelope.status {
            STATUS_OK | STATUS_STEP_REQUIRED => envelope
                .data
                .ok_or_else(|| ApiError::InvalidResponse(format!("{} response has no data", what))),
            STATUS_BAD_CREDENTIALS => {
                let message = envelope
                    .error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "notAuthenticated".to_string());
                Err(ApiError::InvalidCredentials(message))
            }
            other => Err(ApiError::InvalidResponse(format!(
                "{} response has vendor status {}",
                what, other
            ))),
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        token: &AuthToken,
        account_id: &str,
        what: &str,
    ) -> Result<T, ApiError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token.as_str())
            .header("account-id", account_id_digest(account_id))
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        Self::read_envelope(response, what).await
    }

    async fn post_login(&self, base: &str, credentials: &Credentials) -> Result<LoginData, ApiError> {
        let url = format!("{}/llu/auth/login", base);
        let body = serde_json::json!({
            "email": credentials.username(),
            "password": credentials.password(),
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        Self::read_envelope(response, "login").await
    }

    /// Complete a post-login step such as accepting the terms of use.
    async fn continue_step(&self, base: &str, step: &str, interim: &str) -> Result<LoginData, ApiError> {
        let url = format!("{}/auth/continue/{}", base, step);

        let response = self
            .client
            .post(&url)
            .bearer_auth(interim)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        Self::read_envelope(response, step).await
    }

    /// Authenticate with LinkUp and return the login ticket
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<LoginTicket, ApiError> {
        let mut base = self.api_base.clone();
        let mut data = self.post_login(&base, credentials).await?;

        if data.redirect {
            let region = data.region.take().ok_or_else(|| {
                ApiError::InvalidResponse("login redirect without region".to_string())
            })?;
            base = self.regional_base(&region);
            info!(region = %region, "Following LinkUp region redirect");
            data = self.post_login(&base, credentials).await?;
            if data.redirect {
                return Err(ApiError::InvalidResponse("repeated region redirect".to_string()));
            }
        }

        for _ in 0..MAX_LOGIN_STEPS {
            let Some(step) = data.step.take() else {
                break;
            };
            let interim = data
                .auth_ticket
                .as_ref()
                .map(|t| t.token.clone())
                .ok_or_else(|| {
                    ApiError::InvalidResponse(format!("login step {} without ticket", step.step_type))
                })?;
            info!(step = %step.step_type, "Completing LinkUp login step");
            data = self.continue_step(&base, &step.step_type, &interim).await?;
        }
        if let Some(step) = data.step {
            return Err(ApiError::InvalidResponse(format!(
                "login step {} still pending after {} steps",
                step.step_type, MAX_LOGIN_STEPS
            )));
        }

        let user = data
            .user
            .ok_or_else(|| ApiError::InvalidResponse("login response has no user".to_string()))?;
        let ticket = data
            .auth_ticket
            .ok_or_else(|| ApiError::InvalidResponse("login response has no authTicket".to_string()))?;

        debug!(api_base = %base, "LinkUp login succeeded");
        Ok(LoginTicket {
            token: AuthToken::new(ticket.token),
            expires_at: LoginTicket::resolve_expiry(Utc::now(), ticket.expires, ticket.duration),
            account_id: user.id,
            api_base: base,
        })
    }

    /// Fetch the patients this account follows
    pub async fn fetch_connections(&self, ticket: &LoginTicket) -> Result<Vec<Connection>, ApiError> {
        let url = format!("{}/llu/connections", ticket.api_base);
        self.get(&url, &ticket.token, &ticket.account_id, "connections")
            .await
    }

    /// Fetch the current measurement and recent history for the session's patient
    pub async fn fetch_readings(&self, session: &Session) -> Result<Vec<Reading>, ApiError> {
        let url = format!(
            "{}/llu/connections/{}/graph",
            session.api_base, session.patient_id
        );
        let graph: GraphData = self
            .get(&url, &session.token, &session.account_id, "graph")
            .await?;

        // The serial is a series tag, so the one resolved at discovery wins
        // and the graph's copy is only a fallback.
        let serial = session
            .sensor_serial
            .as_deref()
            .or(graph.connection.sensor_serial())
            .map(str::to_string);

        // Current measurement first so it wins timestamp ties against history
        let mut readings = Vec::with_capacity(graph.graph_data.len() + 1);
        if let Some(ref current) = graph.connection.glucose_measurement {
            let reading = Reading::from_item(current, serial.as_deref())
                .map_err(|e| ApiError::InvalidResponse(format!("current measurement: {}", e)))?;
            readings.push(reading);
        }

        let mut skipped = 0usize;
        for item in &graph.graph_data {
            match Reading::from_item(item, serial.as_deref()) {
                Ok(reading) => readings.push(reading),
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "Skipping malformed history entry");
                }
            }
        }

        debug!(count = readings.len(), skipped, "Graph response received");
        Ok(readings)
    }
}

#[async_trait]
impl VendorApi for LinkUpClient {
    async fn login(&self, credentials: &Credentials) -> Result<LoginTicket, ApiError> {
        self.authenticate(credentials).await
    }

    async fn connections(&self, ticket: &LoginTicket) -> Result<Vec<Connection>, ApiError> {
        self.fetch_connections(ticket).await
    }

    async fn fetch_latest(&self, session: &Session) -> Result<Reading, ApiError> {
        let readings = self.fetch_readings(session).await?;
        select_latest(readings).ok_or(ApiError::NoReading)
    }
}

fn trim_base(base: String) -> String {
    base.trim_end_matches('/').to_string()
}

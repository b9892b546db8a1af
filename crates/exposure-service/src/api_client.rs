use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use exposure_core::api::{
    ApiError, DeviceRegistrar, InfectedIdsFetcher, RegistrationGrant, SelfReportSubmitter,
};
use exposure_core::risk::DashboardSnapshot;
use exposure_core::session::Registration;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use tracing::debug;

const REGISTER_ENDPOINT: &str = "register";
const INFECTED_IDS_ENDPOINT: &str = "status_only_ids";
const REPORT_INFECTED_ENDPOINT: &str = "report";
const REPORT_RECOVERED_ENDPOINT: &str = "report_recovered";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusOnlyIds {
    #[serde(default)]
    met_infected_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    major: u16,
    minor: u16,
    #[serde(default)]
    status: Option<DashboardData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[allow(dead_code)]
    timestamp: String,
    status: u16,
    #[allow(dead_code)]
    error: String,
    message: String,
    #[allow(dead_code)]
    path: String,
}

/// Dashboard figures as the server reports them.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    #[serde(default)]
    pub risk_level: u32,
    #[serde(default)]
    pub number_of_infected_met: u64,
    #[serde(default)]
    pub reported_self_infection: bool,
    #[serde(default)]
    pub reported_recovered: bool,
}

impl From<DashboardData> for DashboardSnapshot {
    fn from(data: DashboardData) -> Self {
        DashboardSnapshot {
            risk_score: data.risk_level,
            // the server does not know the local met count
            met_count: 0,
            infected_met_count: data.number_of_infected_met,
            self_reported_infected: data.reported_self_infection,
            self_reported_recovered: data.reported_recovered,
        }
    }
}

/// Maps a non-2xx response to an [`ApiError`], preferring the server's
/// structured error body when it parses.
pub fn classify_failure(status: u16, body: &[u8]) -> ApiError {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) => ApiError::InvalidResponse {
            status: parsed.status,
            message: parsed.message,
        },
        Err(_) => ApiError::InvalidResponseCode {
            status,
            body: String::from_utf8(body.to_vec()).ok(),
        },
    }
}

/// Report endpoints answer with either dashboard data or nothing.
pub fn parse_report_body(body: &[u8]) -> Result<Option<DashboardSnapshot>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let data: Option<DashboardData> =
        serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))?;
    Ok(data.map(DashboardSnapshot::from))
}

pub fn parse_register_body(body: &[u8]) -> Result<RegistrationGrant, ApiError> {
    let parsed: RegisterResponse =
        serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))?;
    Ok(RegistrationGrant {
        major: parsed.major,
        minor: parsed.minor,
        status: parsed.status.map(DashboardSnapshot::from),
    })
}

pub fn parse_infected_ids(body: &[u8]) -> Result<Vec<String>, ApiError> {
    let parsed: StatusOnlyIds =
        serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))?;
    Ok(parsed.met_infected_ids)
}

#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    authorization: Option<String>,
}

impl ApiClient {
    /// Without a registration every call fails with [`ApiError::NoAuthData`].
    pub fn new(base_url: &str, registration: Option<&Registration>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("exposure-service/0.1")
            .build()
            .map_err(|e| anyhow!("http client: {e}"))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            authorization: registration.map(Registration::peer_id),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    fn authorization(&self) -> Result<&str, ApiError> {
        self.authorization.as_deref().ok_or(ApiError::NoAuthData)
    }

    async fn read_body(res: reqwest::Response) -> Result<Vec<u8>, ApiError> {
        let status = res.status();
        let body = res
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), &body));
        }
        Ok(body.to_vec())
    }

    async fn post_report(
        &self,
        endpoint: &str,
        tested_at: DateTime<Utc>,
    ) -> Result<Option<DashboardSnapshot>, ApiError> {
        let auth = self.authorization()?;
        let res = self
            .client
            .post(self.url(endpoint))
            .header(AUTHORIZATION, auth)
            .header(ACCEPT, "application/json")
            .json(&serde_json::json!({
                "testedAt": tested_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            }))
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let body = Self::read_body(res).await?;
        debug!(endpoint, "self report accepted");
        parse_report_body(&body)
    }
}

#[async_trait]
impl DeviceRegistrar for ApiClient {
    async fn register(&self, device_id: &str) -> Result<RegistrationGrant, ApiError> {
        let res = self
            .client
            .post(self.url(REGISTER_ENDPOINT))
            .header(ACCEPT, "application/json")
            .json(&serde_json::json!({ "deviceUUID": device_id }))
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let body = Self::read_body(res).await?;
        let grant = parse_register_body(&body)?;
        debug!(major = grant.major, minor = grant.minor, "device registered");
        Ok(grant)
    }
}

#[async_trait]
impl InfectedIdsFetcher for ApiClient {
    async fn fetch(&self) -> Result<Vec<String>, ApiError> {
        let auth = self.authorization()?;
        let res = self
            .client
            .get(self.url(INFECTED_IDS_ENDPOINT))
            .header(AUTHORIZATION, auth)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let body = Self::read_body(res).await?;
        let ids = parse_infected_ids(&body)?;
        debug!(count = ids.len(), "fetched infected ids");
        Ok(ids)
    }
}

#[async_trait]
impl SelfReportSubmitter for ApiClient {
    async fn report_infected(
        &self,
        tested_at: DateTime<Utc>,
    ) -> Result<Option<DashboardSnapshot>, ApiError> {
        self.post_report(REPORT_INFECTED_ENDPOINT, tested_at).await
    }

    async fn report_recovered(
        &self,
        tested_at: DateTime<Utc>,
    ) -> Result<Option<DashboardSnapshot>, ApiError> {
        self.post_report(REPORT_RECOVERED_ENDPOINT, tested_at).await
    }
}

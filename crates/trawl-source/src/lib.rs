//! Activity source contract + Helium HTTP API implementation.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use trawl_core::{ActivityRecord, DayWindow, HotspotIdentity, Page};
use trawl_storage::{FetchError, HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "trawl-source";

pub const HELIUM_API_URL: &str = "https://api.helium.io";
pub const STAKEJOY_API_URL: &str = "https://helium-api.stakejoy.com";

/// Query timestamps are sent without an offset and read as UTC by the API.
const WINDOW_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("activity source unavailable: {context}")]
    Unavailable {
        context: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("activity source reported an error: {0}")]
    Remote(String),
}

impl SourceError {
    pub fn unavailable(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Unavailable {
            context: context.into(),
            source: Some(source.into()),
        }
    }
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        Self::unavailable("fetching from activity api", err)
    }
}

/// Where hotspot identity and paginated activity come from.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn identity(&self, address: &str) -> Result<HotspotIdentity, SourceError>;

    async fn first_page(&self, address: &str, window: &DayWindow) -> Result<Page, SourceError>;

    async fn next_page(&self, address: &str, cursor: &str) -> Result<Page, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiBase {
    Helium,
    Stakejoy,
    Custom(String),
}

impl ApiBase {
    /// Pick the public Helium API or the Stakejoy mirror. Neither flag set
    /// means Helium; both set is a configuration error.
    pub fn from_flags(use_helium: bool, use_stakejoy: bool) -> anyhow::Result<Self> {
        match (use_helium, use_stakejoy) {
            (true, true) => bail!("can't use both the Helium and Stakejoy APIs - choose one"),
            (false, true) => Ok(Self::Stakejoy),
            _ => Ok(Self::Helium),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Helium => HELIUM_API_URL,
            Self::Stakejoy => STAKEJOY_API_URL,
            Self::Custom(url) => url.trim_end_matches('/'),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Helium => "Helium",
            Self::Stakejoy => "Stakejoy",
            Self::Custom(_) => "custom",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeliumApiConfig {
    pub base: ApiBase,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for HeliumApiConfig {
    fn default() -> Self {
        Self {
            base: ApiBase::Helium,
            user_agent: "heliumevents".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

pub struct HeliumApi {
    base: ApiBase,
    http: HttpFetcher,
}

impl HeliumApi {
    pub fn new(config: HeliumApiConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(&HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(config.user_agent),
        })
        .context("building helium api client")?;
        Ok(Self {
            base: config.base,
            http,
        })
    }

    fn details_url(&self, address: &str) -> String {
        format!("{}/v1/hotspots/{address}", self.base.url())
    }

    fn activity_url(&self, address: &str, params: &[(&str, &str)]) -> Result<Url, SourceError> {
        let base = format!("{}/v1/hotspots/{address}/activity", self.base.url());
        Url::parse_with_params(&base, params)
            .map_err(|e| SourceError::unavailable(format!("building activity url {base}"), e))
    }

    fn window_url(&self, address: &str, window: &DayWindow) -> Result<Url, SourceError> {
        let min_time = window.min_time.format(WINDOW_TIME_FORMAT).to_string();
        let max_time = window.max_time.format(WINDOW_TIME_FORMAT).to_string();
        self.activity_url(
            address,
            &[("min_time", min_time.as_str()), ("max_time", max_time.as_str())],
        )
    }

    fn cursor_url(&self, address: &str, cursor: &str) -> Result<Url, SourceError> {
        self.activity_url(address, &[("cursor", cursor)])
    }
}

#[async_trait]
impl ActivitySource for HeliumApi {
    async fn identity(&self, address: &str) -> Result<HotspotIdentity, SourceError> {
        let resp = self.http.fetch_text(&self.details_url(address)).await?;
        debug!(status = %resp.status, url = %resp.final_url, "hotspot details");
        parse_identity(address, &resp.body)
    }

    async fn first_page(&self, address: &str, window: &DayWindow) -> Result<Page, SourceError> {
        let url = self.window_url(address, window)?;
        let resp = self.http.fetch_text(url.as_str()).await?;
        debug!(
            status = %resp.status,
            url = %resp.final_url,
            min_time = %window.min_time,
            max_time = %window.max_time,
            "first activity page"
        );
        parse_page(&resp.body)
    }

    async fn next_page(&self, address: &str, cursor: &str) -> Result<Page, SourceError> {
        let url = self.cursor_url(address, cursor)?;
        let resp = self.http.fetch_text(url.as_str()).await?;
        debug!(status = %resp.status, url = %resp.final_url, "next activity page");
        parse_page(&resp.body)
    }
}

#[derive(Debug, Deserialize)]
struct HotspotDetailsEnvelope {
    data: HotspotDetails,
}

#[derive(Debug, Deserialize)]
struct HotspotDetails {
    name: String,
    timestamp_added: String,
}

#[derive(Debug, Deserialize)]
struct ActivityEnvelope {
    #[serde(default)]
    data: Option<Vec<JsonValue>>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    error: Option<JsonValue>,
}

/// Parse a `/v1/hotspots/{address}` response into the hotspot's identity.
pub fn parse_identity(address: &str, body: &str) -> Result<HotspotIdentity, SourceError> {
    let envelope: HotspotDetailsEnvelope = serde_json::from_str(body)
        .map_err(|e| SourceError::unavailable(format!("parsing details for {address}"), e))?;
    let birthday = DateTime::parse_from_rfc3339(&envelope.data.timestamp_added)
        .map_err(|e| {
            SourceError::unavailable(
                format!("parsing timestamp_added {:?}", envelope.data.timestamp_added),
                e,
            )
        })?
        .with_timezone(&Utc);
    Ok(HotspotIdentity {
        address: address.to_string(),
        name: envelope.data.name,
        birthday,
    })
}

/// Parse one activity page. A body carrying `error` is a remote failure even
/// when the transport succeeded.
pub fn parse_page(body: &str) -> Result<Page, SourceError> {
    let envelope: ActivityEnvelope = serde_json::from_str(body)
        .map_err(|e| SourceError::unavailable("parsing activity page", e))?;

    if let Some(error) = envelope.error {
        let message = match error {
            JsonValue::String(message) => message,
            other => other.to_string(),
        };
        return Err(SourceError::Remote(message));
    }

    let records = envelope
        .data
        .unwrap_or_default()
        .into_iter()
        .map(ActivityRecord::from_json)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SourceError::unavailable("parsing activity record", e))?;

    Ok(Page {
        records,
        cursor: envelope.cursor,
    })
}

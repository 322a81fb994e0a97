use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sync_core::{
    MessageApi, OlderPage, SyncError, SyncErrorCategory, WireMessage, classify_http_status,
    format_timestamp_rfc3339,
};
use tracing::debug;
use url::Url;

use crate::{RemoteEndpoints, SharedCredentials, load_token};

/// Largest page the recent-messages endpoint accepts.
pub const RECENT_LIMIT_CAP: u16 = 50;
/// Largest page the older-messages endpoint accepts.
pub const OLDER_LIMIT_CAP: u16 = 100;

#[derive(Debug, Deserialize)]
struct RecentResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct OlderResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default, alias = "hasMore")]
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    phone_number: &'a str,
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// [`MessageApi`] backed by the dashboard's REST endpoints.
#[derive(Clone)]
pub struct HttpMessageApi {
    http: reqwest::Client,
    api_url: Url,
    credentials: SharedCredentials,
}

impl HttpMessageApi {
    pub fn new(endpoints: &RemoteEndpoints, credentials: SharedCredentials) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(endpoints.request_timeout)
            .build()
            .map_err(|err| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "http_client_build_failed",
                    err.to_string(),
                )
            })?;
        Ok(Self::with_client(endpoints, credentials, http))
    }

    /// Use a preconfigured client, e.g. one with custom proxy or TLS settings.
    pub fn with_client(endpoints: &RemoteEndpoints, credentials: SharedCredentials, http: reqwest::Client) -> Self {
        Self {
            http,
            api_url: endpoints.api_url.clone(),
            credentials,
        }
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
        let mut url = self.api_url.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|()| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "invalid_url",
                    format!("'{}' cannot be a base URL", self.api_url),
                )
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn recent_url(&self, contact_id: &str, limit: u16) -> Result<Url, SyncError> {
        let mut url = self.endpoint(&["api", "messages", contact_id, "recent"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.clamp(1, RECENT_LIMIT_CAP).to_string());
        Ok(url)
    }

    fn older_url(&self, contact_id: &str, before_ms: u64, limit: u16) -> Result<Url, SyncError> {
        let mut url = self.endpoint(&["api", "messages", contact_id, "older"])?;
        url.query_pairs_mut()
            .append_pair("before_timestamp", &format_timestamp_rfc3339(before_ms))
            .append_pair("limit", &limit.clamp(1, OLDER_LIMIT_CAP).to_string());
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, SyncError> {
        Ok(match load_token(&self.credentials, &self.api_url)? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
        let response = self
            .authorized(request)?
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, &body, retry_after));
        }

        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        serde_json::from_slice(&bytes).map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Serialization,
                "response_decode_failed",
                format!("unexpected response body: {err}"),
            )
        })
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn fetch_recent(&self, contact_id: &str, limit: u16) -> Result<Vec<WireMessage>, SyncError> {
        let url = self.recent_url(contact_id, limit)?;
        debug!(contact_id, limit, "fetching recent messages");
        let response: RecentResponse = self.execute(self.http.get(url)).await?;
        Ok(response.messages)
    }

    async fn fetch_older(&self, contact_id: &str, before_ms: u64, limit: u16) -> Result<OlderPage, SyncError> {
        let url = self.older_url(contact_id, before_ms, limit)?;
        debug!(contact_id, before_ms, limit, "fetching older messages");
        let response: OlderResponse = self.execute(self.http.get(url)).await?;
        Ok(OlderPage {
            messages: response.messages,
            has_more: response.has_more,
        })
    }

    async fn send_message(&self, contact_id: &str, body: &str) -> Result<bool, SyncError> {
        let url = self.endpoint(&["api", "messages", "send"])?;
        let request = self.http.post(url).json(&SendRequest {
            phone_number: contact_id,
            message: body,
        });
        let response: SendResponse = self.execute(request).await?;
        Ok(response.success)
    }
}

/// `Retry-After` as delta seconds or an HTTP date.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = at.signed_duration_since(chrono::Utc::now());
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

fn map_status_error(status: StatusCode, body: &str, retry_after: Option<Duration>) -> SyncError {
    let detail = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            detail: serde_json::Value::String(detail),
        }) => detail,
        Ok(ErrorBody { detail }) => detail.to_string(),
        Err(_) => body.trim().to_owned(),
    };
    let message = if detail.is_empty() {
        format!("server returned {status}")
    } else {
        format!("server returned {status}: {detail}")
    };

    let error = SyncError::new(classify_http_status(status.as_u16()), "http_status", message);
    match retry_after {
        Some(delay) => error.with_retry_after(delay),
        None => error,
    }
}

fn map_reqwest_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::new(SyncErrorCategory::Network, "request_timeout", err.to_string())
    } else if err.is_decode() {
        SyncError::new(
            SyncErrorCategory::Serialization,
            "response_decode_failed",
            err.to_string(),
        )
    } else {
        SyncError::network(err.to_string())
    }
}

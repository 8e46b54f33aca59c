//! Backend API client
//!
//! The [`Backend`] trait is the only seam to the remote API. [`HttpBackend`]
//! implements it over HTTP; tests substitute in-process fakes.
//!
//! Routes consumed:
//! - `POST /creations`
//! - `GET /resources/by-key?key=<lookup_key>`
//! - `GET /resources/{id}/progress|stats|keywords|competitors|serp-rankings|sub-resource-progress`
//! - `GET /resources/{id}/logs?since=<cursor>`
//! - `GET /live/resources/{id}` (server-sent event stream, one JSON frame per event)

use crate::error::FetchError;
use agmon_common::events::{LogEntry, SourceName};
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("agmon/", env!("CARGO_PKG_VERSION"));

/// Raw JSON frames from the push channel
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, FetchError>> + Send>>;

/// `POST /creations` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationResponse {
    pub correlation_token: String,
    /// Present only when the backend created the resource synchronously
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

/// `GET /resources/{id}/logs` response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogPage {
    #[serde(default)]
    pub entries: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    resource_id: Option<String>,
}

/// Remote API consumed by the monitor
///
/// Implementations perform exactly one network read per call and never
/// mutate backend state except for `submit_creation`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Submit a creation request for `lookup_key`
    async fn submit_creation(&self, lookup_key: &str) -> Result<CreationResponse, FetchError>;

    /// Look a resource up by its human-given key; `Ok(None)` when not (yet) known
    async fn lookup_by_key(&self, lookup_key: &str) -> Result<Option<String>, FetchError>;

    /// Fetch the raw snapshot of one source
    async fn fetch_source(
        &self,
        resource_id: &str,
        source: SourceName,
    ) -> Result<serde_json::Value, FetchError>;

    /// Fetch log entries after `since` (backend cursor)
    async fn fetch_logs(&self, resource_id: &str, since: Option<&str>) -> Result<LogPage, FetchError>;

    /// Open the push channel
    ///
    /// The returned stream must end with a `Timeout` error if the channel is
    /// silent (heartbeats included) for longer than `idle_timeout`.
    async fn open_live(
        &self,
        resource_id: &str,
        idle_timeout: Duration,
    ) -> Result<FrameStream, FetchError>;
}

/// HTTP implementation of [`Backend`]
pub struct HttpBackend {
    http_client: reqwest::Client,
    base_url: reqwest::Url,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, FetchError> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| FetchError::malformed(format!("invalid backend URL '{}': {}", base_url, e)))?;

        // No client-wide timeout: it would also cut off the long-lived push stream.
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| FetchError::network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url,
            request_timeout,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::malformed(format!("backend URL '{}' cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T>(&self, request: reqwest::RequestBuilder) -> Result<T, FetchError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = request.timeout(self.request_timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status.as_u16(), &body));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn submit_creation(&self, lookup_key: &str) -> Result<CreationResponse, FetchError> {
        let url = self.endpoint(&["creations"])?;
        debug!(lookup_key = %lookup_key, url = %url, "Submitting creation");
        let request = self
            .http_client
            .post(url)
            .json(&serde_json::json!({ "lookup_key": lookup_key }));
        self.get_json(request).await
    }

    async fn lookup_by_key(&self, lookup_key: &str) -> Result<Option<String>, FetchError> {
        let url = self.endpoint(&["resources", "by-key"])?;
        let request = self.http_client.get(url).query(&[("key", lookup_key)]);
        match self.get_json::<LookupResponse>(request).await {
            Ok(found) => Ok(found.resource_id.filter(|id| !id.is_empty())),
            Err(e) if e.kind == agmon_common::events::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_source(
        &self,
        resource_id: &str,
        source: SourceName,
    ) -> Result<serde_json::Value, FetchError> {
        let url = self.endpoint(&["resources", resource_id, source.route()])?;
        self.get_json(self.http_client.get(url)).await
    }

    async fn fetch_logs(&self, resource_id: &str, since: Option<&str>) -> Result<LogPage, FetchError> {
        let url = self.endpoint(&["resources", resource_id, "logs"])?;
        let mut request = self.http_client.get(url);
        if let Some(cursor) = since {
            request = request.query(&[("since", cursor)]);
        }
        self.get_json(request).await
    }

    async fn open_live(
        &self,
        resource_id: &str,
        idle_timeout: Duration,
    ) -> Result<FrameStream, FetchError> {
        let url = self.endpoint(&["live", "resources", resource_id])?;
        debug!(url = %url, "Opening live channel");

        let send = self
            .http_client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send();
        let response = tokio::time::timeout(self.request_timeout, send).await??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status.as_u16(), &body));
        }

        let bytes = idle_watchdog(response.bytes_stream(), idle_timeout);
        let frames = bytes.eventsource().filter_map(|event| async move {
            match event {
                Ok(event) if event.data.trim().is_empty() => None,
                Ok(event) => Some(Ok(event.data)),
                Err(EventStreamError::Transport(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                    Some(Err(FetchError::timeout(e.to_string())))
                }
                Err(e) => Some(Err(FetchError::network(e.to_string()))),
            }
        });

        Ok(Box::pin(frames))
    }
}

/// End a byte stream with a `TimedOut` error after `idle` without data
fn idle_watchdog<S, B, E>(
    inner: S,
    idle: Duration,
) -> impl Stream<Item = Result<B, std::io::Error>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    stream::unfold((Box::pin(inner), false), move |(mut inner, finished)| async move {
        if finished {
            return None;
        }
        match tokio::time::timeout(idle, inner.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), (inner, false))),
            Ok(Some(Err(e))) => Some((Err(std::io::Error::other(e.to_string())), (inner, true))),
            Ok(None) => None,
            Err(_) => Some((
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("live channel silent for {:?}", idle),
                )),
                (inner, true),
            )),
        }
    })
}

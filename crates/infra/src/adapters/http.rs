//! JSON-over-HTTP capability adapters.
//!
//! Each adapter talks to one base URL with an optional bearer token. The
//! orchestrator applies stage timeouts, so requests carry no timeout of their
//! own.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use adsight_ai::{
    AccountSnapshot, AnalysisResults, Analyzer, CapabilityError, Notification, Notifier, NotifyAck,
    SnapshotSource,
};
use adsight_core::AccountId;
use adsight_metrics::NormalizedMetrics;

/// Shared request plumbing: base URL, token, client.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        match path.trim_start_matches('/') {
            "" => self.base_url.clone(),
            path => format!("{}/{path}", self.base_url),
        }
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, CapabilityError> {
        let resp = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| CapabilityError::unavailable(format!("request to {} failed: {e}", self.base_url)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CapabilityError> {
        let resp = self.send(self.client.post(self.url(path)).json(body)).await?;
        decode(resp).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, CapabilityError> {
        let resp = self.send(self.client.get(self.url(path))).await?;
        decode(resp).await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, CapabilityError> {
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| CapabilityError::unavailable(format!("failed to read response: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CapabilityError::invalid_response(format!("unexpected response body: {e}")))
}

/// Map a non-success status to a capability error.
///
/// Client errors mean the capability refused the request; server errors and
/// throttling mean it is currently unavailable.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> CapabilityError {
    let detail = body.trim();
    let message = if detail.is_empty() {
        format!("upstream returned {status}")
    } else {
        format!("upstream returned {status}: {}", truncate(detail, 200))
    };

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::UNAUTHORIZED
        || status.is_server_error()
    {
        CapabilityError::unavailable(message)
    } else {
        CapabilityError::rejected(message)
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    prompt: String,
    metrics: &'a NormalizedMetrics,
}

/// Posts the rendered prompt and normalized metrics to `{base}/analyze`.
#[derive(Debug, Clone)]
pub struct HttpAnalyzer {
    endpoint: HttpEndpoint,
}

impl HttpAnalyzer {
    pub fn new(endpoint: HttpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, metrics: &NormalizedMetrics) -> Result<AnalysisResults, CapabilityError> {
        let body = AnalyzeRequest {
            prompt: metrics.render_prompt(),
            metrics,
        };
        debug!(rows = metrics.total_rows, "requesting analysis");
        self.endpoint.post_json("analyze", &body).await
    }
}

/// Reads `{base}/accounts/{id}/snapshot`.
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    endpoint: HttpEndpoint,
}

impl HttpSnapshotSource {
    pub fn new(endpoint: HttpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_snapshot(&self, account: AccountId) -> Result<AccountSnapshot, CapabilityError> {
        let snapshot: AccountSnapshot = self
            .endpoint
            .get_json(&format!("accounts/{account}/snapshot"))
            .await?;
        if snapshot.account_id != account {
            return Err(CapabilityError::invalid_response(format!(
                "snapshot is for account {}, expected {account}",
                snapshot.account_id
            )));
        }
        Ok(snapshot)
    }
}

/// Posts the notification as JSON to the configured webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    endpoint: HttpEndpoint,
}

impl WebhookNotifier {
    pub fn new(endpoint: HttpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<NotifyAck, CapabilityError> {
        let resp = self
            .endpoint
            .send(self.endpoint.client.post(self.endpoint.url("")).json(notification))
            .await?;

        // Webhooks commonly answer 200/204 with no body.
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| CapabilityError::unavailable(format!("failed to read response: {e}")))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(NotifyAck::default());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| CapabilityError::invalid_response(format!("unexpected response body: {e}")))
    }
}

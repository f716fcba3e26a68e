use crate::errors::{DaemonError, Result};
use crate::status;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Opaque job identifier assigned by the remote queue. Echoed back verbatim
/// when reporting, so a numeric id stays numeric on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteJobId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RemoteJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteJobId::Number(n) => write!(f, "{}", n),
            RemoteJobId::Text(s) => f.write_str(s),
        }
    }
}

/// A pending document handed out by the remote queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJob {
    /// Document reference, usually a presigned download URL
    pub url: String,
    pub id: Option<RemoteJobId>,
    pub filename: Option<String>,
}

impl RemoteJob {
    /// Name to show in logs: the filename, or the masked URL.
    pub fn label(&self) -> String {
        match &self.filename {
            Some(name) if !name.is_empty() => name.clone(),
            _ => mask_url(&self.url),
        }
    }

    pub fn id_label(&self) -> String {
        self.id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    }
}

/// Source of work and sink for completion reports.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteQueueClient: Send + Sync {
    /// Next pending job, or `None` when the queue is empty.
    async fn fetch_next(&self, token: Option<String>) -> Result<Option<RemoteJob>>;

    async fn report_printed(&self, id: &RemoteJobId, token: Option<String>) -> Result<()>;
}

/// HTTP client for the print queue API.
pub struct HttpQueueClient {
    client: Client,
    base_url: String,
}

impl HttpQueueClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to create HTTP client with custom config: {}. Using defaults.", e);
                Client::new()
            });

        // Remove trailing slash from URL
        let base_url = base_url.trim_end_matches('/').to_string();

        info!("Initialized print queue client: {}", base_url);

        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        let builder = builder.header("Accept", "application/json");
        match token {
            Some(t) if !t.is_empty() => builder.header("Authorization", format!("Bearer {}", t)),
            _ => builder,
        }
    }

    async fn post_status(&self, id: &RemoteJobId, token: Option<&str>) -> Result<()> {
        let url = format!("{}/api/updatePdfStatus", self.base_url);

        let response = Self::authorized(self.client.post(&url), token)
            .json(&json!({ "id": id, "status": status::PRINTED }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DaemonError::Api {
                status: status.as_u16(),
                body: if body.is_empty() { "unknown error".to_string() } else { body },
            });
        }

        Ok(())
    }
}

#[async_trait]
impl RemoteQueueClient for HttpQueueClient {
    #[tracing::instrument(skip(self, token))]
    async fn fetch_next(&self, token: Option<String>) -> Result<Option<RemoteJob>> {
        let url = format!("{}/api/printQueue", self.base_url);

        let response = Self::authorized(self.client.get(&url), token.as_deref())
            .send()
            .await
            .map_err(|e| {
                warn!("Print queue request failed: {}", e);
                DaemonError::from(e)
            })?;

        let status = response.status();
        if status.as_u16() == 204 || status.as_u16() == 404 {
            return Ok(None);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Print queue request failed: {} - {}", status, body);
            return Err(DaemonError::Api {
                status: status.as_u16(),
                body: if body.is_empty() { "unknown error".to_string() } else { body },
            });
        }

        let body = response.text().await.unwrap_or_default();
        let value: Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(e) => {
                debug!("Print queue returned non-JSON body ({}), treating as empty", e);
                return Ok(None);
            }
        };

        Ok(parse_remote_job(&value))
    }

    #[tracing::instrument(skip(self, token))]
    async fn report_printed(&self, id: &RemoteJobId, token: Option<String>) -> Result<()> {
        let retry = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(4))
            .with_max_times(2);

        let token = token.as_deref();
        (|| async { self.post_status(id, token).await })
            .retry(retry)
            .when(|e| matches!(e, DaemonError::Network(_)))
            .notify(|e, dur| warn!("Status update for job {} failed ({}), retrying in {:?}", id, e, dur))
            .await?;

        debug!("Job {} reported as {}", id, status::PRINTED);
        Ok(())
    }
}

/// Accepts the payload shapes the queue API answers with:
/// a bare URL string, `{url, id, filename|name}` or `{s3_url, id, filename|name}`.
pub fn parse_remote_job(value: &Value) -> Option<RemoteJob> {
    if let Some(url) = value.as_str() {
        return (!url.is_empty()).then(|| RemoteJob {
            url: url.to_string(),
            id: None,
            filename: None,
        });
    }

    let url = ["url", "s3_url"]
        .iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str).filter(|s| !s.is_empty()))?;

    let id = match value.get("id") {
        Some(Value::Number(n)) => n.as_i64().map(RemoteJobId::Number),
        Some(Value::String(s)) if !s.is_empty() => Some(RemoteJobId::Text(s.clone())),
        _ => None,
    };

    let filename = ["filename", "name"]
        .iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str).filter(|s| !s.is_empty()))
        .map(String::from);

    Some(RemoteJob {
        url: url.to_string(),
        id,
        filename,
    })
}

const MASK_MAX_CHARS: usize = 72;

/// Shorten a document URL to `host/file` for logs. Presigned URLs carry
/// credentials in the query string, which must never reach a log line.
pub fn mask_url(raw: &str) -> String {
    let short = match url::Url::parse(raw) {
        Ok(parsed) => {
            let file = parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or("");
            format!("{}/{}", parsed.host_str().unwrap_or(""), file)
        }
        Err(_) => {
            let without_query = raw.split(['?', '#']).next().unwrap_or("");
            return truncate(without_query, true);
        }
    };
    truncate(&short, false)
}

fn truncate(s: &str, always_ellipsis: bool) -> String {
    if s.chars().count() > MASK_MAX_CHARS {
        let cut: String = s.chars().take(MASK_MAX_CHARS).collect();
        format!("{}…", cut)
    } else if always_ellipsis {
        format!("{}…", s)
    } else {
        s.to_string()
    }
}

/// Last path segment of a document URL, if any.
pub fn document_name(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    (!last.is_empty()).then(|| last.to_string())
}

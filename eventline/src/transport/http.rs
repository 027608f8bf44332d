//! HTTP collector transport.

use std::time::Duration;

use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER};
use tracing::warn;

use super::{Ack, BoxFuture, OutboundBatch, Transport};
use crate::compression::Compression;
use crate::error::{DeliveryError, PipelineError, PipelineResult};

/// Header carrying the stable batch id.
pub const BATCH_ID_HEADER: &str = "X-Batch-Id";

/// Header carrying the number of records in the body.
pub const RECORD_COUNT_HEADER: &str = "X-Record-Count";

/// Header carrying the collector API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Longest rejection reason kept for logs.
const MAX_REASON_CHARS: usize = 256;

/// Posts batches to a collector endpoint.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    /// Create a transport for `endpoint` with a per-request timeout.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> PipelineResult<Self> {
        let endpoint = endpoint.into();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(PipelineError::Config(format!(
                "collector endpoint must be an http(s) URL, got '{}'",
                endpoint
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("eventline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    fn send<'a>(&'a self, batch: &'a OutboundBatch) -> BoxFuture<'a, Result<Ack, DeliveryError>> {
        Box::pin(async move {
            let mut request = self
                .client
                .post(&self.endpoint)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(BATCH_ID_HEADER, batch.batch_id.as_str())
                .header(RECORD_COUNT_HEADER, batch.record_count.to_string())
                .body(batch.body.clone());
            if let Some(encoding) = batch.content_encoding {
                request = request.header(CONTENT_ENCODING, encoding);
            }
            if let Some(key) = &self.api_key {
                request = request.header(API_KEY_HEADER, key);
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Transient("request timed out".to_string())
                } else {
                    DeliveryError::Transient(format!("request failed: {}", e))
                }
            })?;

            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                return Ok(Ack { status });
            }

            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let encoding = response
                .headers()
                .get(CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();

            classify_status(status, retry_after, diagnostic_text(&body, encoding.as_deref()))
        })
    }
}

/// Map an HTTP status to an acknowledgement or a classified failure.
///
/// - 2xx: acknowledged
/// - 429, or 503 with a `Retry-After`: rate limited
/// - 408 and 5xx: transient
/// - other 4xx: permanent
/// - anything else: transient
pub fn classify_status(
    status: u16,
    retry_after: Option<Duration>,
    reason: String,
) -> Result<Ack, DeliveryError> {
    match status {
        200..=299 => Ok(Ack { status }),
        429 => Err(DeliveryError::RateLimited { retry_after }),
        503 if retry_after.is_some() => Err(DeliveryError::RateLimited { retry_after }),
        408 | 500..=599 => Err(DeliveryError::Transient(format!("HTTP {}: {}", status, reason))),
        400..=499 => Err(DeliveryError::Permanent { status, reason }),
        _ => Err(DeliveryError::Transient(format!(
            "unexpected HTTP {}: {}",
            status, reason
        ))),
    }
}

/// Parse a `Retry-After` value given in seconds.
///
/// HTTP-date values are not supported and yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Readable text from a rejection body, decompressing it if needed.
fn diagnostic_text(body: &[u8], encoding: Option<&str>) -> String {
    let bytes = match encoding {
        Some(enc) if enc.eq_ignore_ascii_case("deflate") => {
            match Compression::default().decompress(body) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "Could not decode collector diagnostic body");
                    return String::from("<undecodable body>");
                }
            }
        }
        _ => body.to_vec(),
    };
    String::from_utf8_lossy(&bytes)
        .chars()
        .take(MAX_REASON_CHARS)
        .collect()
}

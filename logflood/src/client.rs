//! The Loki push client.
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of pushes sent
//! `request_ok`: Pushes answered with a 2xx status
//! `request_failure`: Pushes answered with another status, or failed in
//! transport
//! `request_timeout`: Pushes that ran past the request timeout
//! `bytes_written`: Total batch bytes sent, framing excluded
//!

use std::{
    io::Write,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use flate2::{Compression as GzLevel, write::GzEncoder};
use logflood_payload::{LogBatch, loki};
use metrics::counter;
use reqwest::{
    StatusCode, Url,
    header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderValue},
};
use serde::Serialize;
use tokio::time::{self, Duration};
use tracing::{debug, error};

use crate::config::{Compression, Config};

/// The tenant header understood by Loki.
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Client`].
pub enum Error {
    /// Wrapper around [`reqwest::Error`].
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    /// The push URL could not be built from the target URI.
    #[error("Invalid push URL {uri}: {reason}")]
    Url {
        /// The target URI
        uri: String,
        /// Why the URL did not parse
        reason: String,
    },
    /// The tenant id cannot be sent as a header value.
    #[error("Tenant id {0:?} is not a valid header value")]
    Tenant(String),
}

/// The result of one push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOutcome {
    /// The endpoint accepted the batch
    Success,
    /// No response arrived within the request timeout
    ClientTimeout,
    /// The endpoint answered with a non-2xx status
    ServerError(u16),
    /// The connection failed or broke before a status arrived
    NetworkError,
}

impl PushOutcome {
    /// Classify a response status.
    #[must_use]
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_success() {
            Self::Success
        } else {
            Self::ServerError(status.as_u16())
        }
    }

    /// Whether this outcome belongs to the retryable class. Timeouts, network
    /// errors and 5xx statuses are; successes and every other status are not.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        match self {
            Self::Success => false,
            Self::ClientTimeout | Self::NetworkError => true,
            Self::ServerError(code) => (500..600).contains(&code),
        }
    }
}

/// Something that accepts batches.
#[async_trait]
pub trait Push: Send + Sync {
    /// Push `batch`, classifying what happened.
    async fn push(&self, batch: LogBatch) -> PushOutcome;
}

/// The Loki push client.
///
/// Clones share one connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    url: Url,
    timeout: Duration,
    tenant: Option<HeaderValue>,
    compression: Compression,
    metric_labels: Vec<(String, String)>,
}

impl Client {
    /// Create a new [`Client`] instance
    ///
    /// # Errors
    ///
    /// Creation will fail if the push URL cannot be derived from the target
    /// URI, if the tenant id is not a valid header value or if the underlying
    /// HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let url = push_url(&config.target_uri.to_string())?;
        let tenant = config
            .tenant_id
            .as_deref()
            .map(|tenant| {
                HeaderValue::from_str(tenant).map_err(|_| Error::Tenant(tenant.to_string()))
            })
            .transpose()?;
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_in_flight as usize)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            url,
            timeout: config.request_timeout(),
            tenant,
            compression: config.compression,
            metric_labels: vec![("component".to_string(), "loki_push".to_string())],
        })
    }

    /// The URL pushes are sent to.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    fn body(&self, batch: &LogBatch) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        // Pre-epoch clocks stamp from zero.
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let json = loki::encode(batch, now)?;
        match self.compression {
            Compression::None => Ok(json),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), GzLevel::fast());
                encoder.write_all(&json)?;
                Ok(encoder.finish()?)
            }
        }
    }
}

/// Append the Loki push path to `uri` unless it already ends with it.
fn push_url(uri: &str) -> Result<Url, Error> {
    let base = uri.trim_end_matches('/');
    let full = if base.ends_with(loki::PUSH_PATH) {
        base.to_string()
    } else {
        format!("{base}{}", loki::PUSH_PATH)
    };
    Url::parse(&full).map_err(|err| Error::Url {
        uri: uri.to_string(),
        reason: err.to_string(),
    })
}

#[async_trait]
impl Push for Client {
    async fn push(&self, batch: LogBatch) -> PushOutcome {
        let labels = &self.metric_labels;
        let batch_bytes = batch.size() as u64;

        let body = match self.body(&batch) {
            Ok(body) => body,
            Err(err) => {
                error!("Failed to encode push for {labels}: {err}", labels = batch.labels());
                counter!("request_failure", labels).increment(1);
                return PushOutcome::NetworkError;
            }
        };
        drop(batch);

        let mut request = self
            .http
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if self.compression == Compression::Gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }
        if let Some(tenant) = &self.tenant {
            request = request.header(TENANT_HEADER, tenant.clone());
        }

        counter!("requests_sent", labels).increment(1);
        let outcome = match time::timeout(self.timeout, request.send()).await {
            Err(_elapsed) => PushOutcome::ClientTimeout,
            Ok(Err(err)) if err.is_timeout() => PushOutcome::ClientTimeout,
            Ok(Err(err)) => {
                debug!("Failed to send push to {url}: {err}", url = self.url);
                let mut error_labels = labels.clone();
                error_labels.push(("error".to_string(), "network".to_string()));
                counter!("request_failure", &error_labels).increment(1);
                return PushOutcome::NetworkError;
            }
            Ok(Ok(response)) => {
                counter!("bytes_written", labels).increment(batch_bytes);
                PushOutcome::from_status(response.status())
            }
        };

        match outcome {
            PushOutcome::Success => counter!("request_ok", labels).increment(1),
            PushOutcome::ClientTimeout => counter!("request_timeout", labels).increment(1),
            PushOutcome::ServerError(code) => {
                let mut status_labels = labels.clone();
                status_labels.push(("status_code".to_string(), code.to_string()));
                counter!("request_failure", &status_labels).increment(1);
            }
            PushOutcome::NetworkError => {}
        }
        outcome
    }
}

//! Fetching events from an upstream calendar server
//!
//! The actual ICS-to-events parsing is not this crate's business: the
//! [`HttpFetcher`] downloads the feed and hands the body to a parser provided
//! by the integrating application. What *is* this crate's business is the
//! failure taxonomy: every failed fetch is classified, because the class
//! decides whether a background retry makes sense at all.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::config::USER_AGENT;
use crate::planning::Event;

/// Why a fetch attempt failed.
///
/// This is deliberately not an `Error` type: a failed fetch is an expected,
/// classified outcome that drives fallback and retry policy, never a bug to
/// bubble up.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchFailure {
    /// The upstream rejected the request or the resource is gone.
    /// Permanent: retrying will not help.
    #[serde(rename = "http_4xx")]
    Http4xx { status: u16 },
    /// The upstream is in trouble; worth retrying later.
    #[serde(rename = "http_5xx")]
    Http5xx { status: u16 },
    Timeout,
    NetworkError { detail: String },
    DnsError { detail: String },
    /// The feed downloaded fine but could not be parsed.
    ParseError { detail: String },
}

impl FetchFailure {
    /// Whether a later retry has a chance of succeeding.
    ///
    /// Parse errors count as transient here; whether they eventually become
    /// permanent is decided by [`ParseErrorPolicy`](crate::config::ParseErrorPolicy).
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchFailure::Http4xx { .. })
    }

    /// Stable machine-readable code for logs and API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            FetchFailure::Http4xx { .. } => "http_4xx",
            FetchFailure::Http5xx { .. } => "http_5xx",
            FetchFailure::Timeout => "timeout",
            FetchFailure::NetworkError { .. } => "network_error",
            FetchFailure::DnsError { .. } => "dns_error",
            FetchFailure::ParseError { .. } => "parse_error",
        }
    }
}

impl Display for FetchFailure {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            FetchFailure::Http4xx { status } => write!(f, "http_4xx (status {})", status),
            FetchFailure::Http5xx { status } => write!(f, "http_5xx (status {})", status),
            FetchFailure::Timeout => write!(f, "timeout"),
            FetchFailure::NetworkError { detail } => write!(f, "network_error ({})", detail),
            FetchFailure::DnsError { detail } => write!(f, "dns_error ({})", detail),
            FetchFailure::ParseError { detail } => write!(f, "parse_error ({})", detail),
        }
    }
}

/// The seam between this crate and the network.
///
/// The production implementation is [`HttpFetcher`]; tests use
/// [`MockFetcher`](crate::mocking::MockFetcher).
#[async_trait]
pub trait EventFetcher: Send + Sync {
    async fn fetch_events(&self, url: &Url) -> Result<Vec<Event>, FetchFailure>;
}

/// Turns a raw feed body into events. Supplied by the integrating
/// application, since calendar parsing is outside this crate.
pub type IcsParser = dyn Fn(&str) -> Result<Vec<Event>, String> + Send + Sync;

/// Fetches feeds over HTTP with a bounded timeout and classifies failures.
pub struct HttpFetcher {
    client: reqwest::Client,
    parser: Arc<IcsParser>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, parser: Arc<IcsParser>) -> Result<Self, anyhow::Error> {
        let user_agent = USER_AGENT.lock().unwrap().clone();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client, parser })
    }
}

#[async_trait]
impl EventFetcher for HttpFetcher {
    async fn fetch_events(&self, url: &Url) -> Result<Vec<Event>, FetchFailure> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status.is_client_error() {
            return Err(FetchFailure::Http4xx {
                status: status.as_u16(),
            });
        }
        if status.is_server_error() {
            return Err(FetchFailure::Http5xx {
                status: status.as_u16(),
            });
        }
        if status.is_success() == false {
            return Err(FetchFailure::NetworkError {
                detail: format!("unexpected HTTP status code {}", status),
            });
        }

        let body = response.text().await.map_err(classify_reqwest_error)?;
        (self.parser)(&body).map_err(|detail| FetchFailure::ParseError { detail })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> FetchFailure {
    if err.is_timeout() {
        return FetchFailure::Timeout;
    }
    // reqwest does not expose resolution failures as their own kind, so sniff
    // the rendered error chain
    let mut detail = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        detail = format!("{}: {}", detail, cause);
        source = cause.source();
    }
    if detail.to_lowercase().contains("dns") {
        FetchFailure::DnsError { detail }
    } else {
        FetchFailure::NetworkError { detail }
    }
}

use std::time::{Duration, Instant};

use reqwest::{Client, Method};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::endpoint::HostRewrite;

const USER_AGENT: &str = concat!("coe-nodes/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16, body: String },
    #[error("could not read response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpError {
    /// Connection refused, DNS failure, timeouts and other I/O level errors,
    /// including a connection that drops while the body is being read.
    /// These are the only errors that trigger the host fallback.
    pub fn is_transport(&self) -> bool {
        matches!(self, HttpError::Transport { .. } | HttpError::Body { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A fully read response. Status is not checked here.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value, HttpError> {
        serde_json::from_str(&self.body).map_err(|source| HttpError::Decode {
            url: self.url.clone(),
            source,
        })
    }

    /// Fails with [`HttpError::Status`] for non-2xx, otherwise parses JSON.
    pub fn into_json(self) -> Result<Value, HttpError> {
        if !self.is_success() {
            return Err(HttpError::Status {
                url: self.url,
                status: self.status,
                body: self.body,
            });
        }
        self.json()
    }
}

/// Thin reqwest wrapper that knows about the one-shot host fallback.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    client: Client,
    rewrite: HostRewrite,
    bearer: Option<String>,
}

impl Default for RemoteClient {
    fn default() -> Self {
        Self::new(HostRewrite::default())
    }
}

impl RemoteClient {
    pub fn new(rewrite: HostRewrite) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            rewrite,
            bearer: None,
        }
    }

    /// Bearer token sent to the model backend (discovery and chat), never to
    /// tool servers.
    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token.filter(|t| !t.trim().is_empty());
        self
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        timeout: Duration,
        body: Option<&Value>,
        query: Option<&[(String, String)]>,
        authorize: bool,
    ) -> Result<RawResponse, HttpError> {
        let started = Instant::now();
        let mut req = self.client.request(method.clone(), url).timeout(timeout);
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(query) = query {
            req = req.query(query);
        }
        if authorize {
            if let Some(token) = &self.bearer {
                req = req.bearer_auth(token);
            }
        }

        let resp = req.send().await.map_err(|source| HttpError::Transport {
            url: url.to_string(),
            source,
        })?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|source| HttpError::Body {
            url: url.to_string(),
            source,
        })?;

        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
        info!(
            target: "request",
            method = %method,
            url,
            status,
            latency_ms,
            "remote call finished"
        );
        Ok(RawResponse {
            url: url.to_string(),
            status,
            body: text,
        })
    }

    /// Sends once; on a transport failure retries exactly once against the
    /// rewritten host, if the rewrite changes the URL at all.
    async fn send_with_fallback(
        &self,
        method: Method,
        url: &str,
        timeout: Duration,
        body: Option<&Value>,
    ) -> Result<RawResponse, HttpError> {
        match self
            .send_once(method.clone(), url, timeout, body, None, true)
            .await
        {
            Err(err) if err.is_transport() => match self.rewrite.retry_target(url) {
                Some(fallback) => {
                    warn!(%err, %fallback, "primary host unreachable, retrying once");
                    self.send_once(method, &fallback, timeout, body, None, true)
                        .await
                }
                None => Err(err),
            },
            other => other,
        }
    }

    pub async fn get_json(&self, url: &str, timeout: Duration) -> Result<Value, HttpError> {
        debug!(url, "GET json");
        self.send_with_fallback(Method::GET, url, timeout, None)
            .await?
            .into_json()
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, HttpError> {
        debug!(url, "POST json");
        self.send_with_fallback(Method::POST, url, timeout, Some(body))
            .await?
            .into_json()
    }

    /// Generic tool call. GET sends `query` as URL parameters, every other
    /// method sends `body` as JSON. No host fallback and no status check.
    pub async fn call(
        &self,
        method: Method,
        url: &str,
        body: &Value,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<RawResponse, HttpError> {
        if method == Method::GET {
            self.send_once(method, url, timeout, None, Some(query), false)
                .await
        } else {
            self.send_once(method, url, timeout, Some(body), None, false)
                .await
        }
    }
}

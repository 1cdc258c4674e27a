//! Resolver backed by the platform API.
//!
//! `POST {api_url}/v1/projects/get_ssh_address` with `{"Name": "<project>"}`.
//! The API wraps every answer in a `{Success, Error, Content}` envelope;
//! rejected calls may instead carry a bare `{"error": "..."}` body.

use std::time::Duration;

use anyhow::{anyhow, Context};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{ResolveError, Resolver};
use crate::config::HttpResolverConfig;
use crate::credentials;

const LOOKUP_PATH: &str = "/v1/projects/get_ssh_address";

/// Bytes of a failed response kept for the error message.
const ERROR_BODY_LIMIT: usize = 1024;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LookupRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    content: Option<LookupContent>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct LookupContent {
    #[serde(rename = "SSHAddress", default)]
    ssh_address: String,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct HttpResolver {
    client: reqwest::Client,
    base_url: String,
    secret_header: String,
    shared_secret: Option<String>,
}

impl HttpResolver {
    pub fn new(config: &HttpResolverConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ssh-router/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        let shared_secret = if config.shared_secret.is_empty() {
            warn!("no resolver shared secret configured; calling the API unauthenticated");
            None
        } else {
            let raw = credentials::read_secret(&config.shared_secret)
                .context("failed to read resolver shared secret")?;
            let secret = String::from_utf8(raw).context("resolver shared secret is not UTF-8")?;
            // Header values cannot carry the trailing newline most secret files end with.
            Some(secret.trim_end().to_string())
        };

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            secret_header: config.shared_secret_header.clone(),
            shared_secret,
        })
    }
}

#[async_trait::async_trait]
impl Resolver for HttpResolver {
    #[instrument(skip(self))]
    async fn resolve(&self, project: &str) -> Result<String, ResolveError> {
        let url = format!("{}{LOOKUP_PATH}", self.base_url);
        let mut req = self.client.post(&url).json(&LookupRequest { name: project });
        if let Some(ref secret) = self.shared_secret {
            req = req.header(self.secret_header.as_str(), secret);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))
            .map_err(ResolveError::Internal)?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .context("failed to read resolver response body")
            .map_err(ResolveError::Internal)?;

        let address = interpret_response(project, status, &body)?;
        debug!(project, "resolved via platform API");
        Ok(address)
    }

    async fn check(&self) -> anyhow::Result<()> {
        // Any HTTP answer means the API is reachable; only transport errors count.
        let resp = self
            .client
            .head(&self.base_url)
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", self.base_url))?;
        debug!(status = %resp.status(), "resolver health probe");
        Ok(())
    }
}

/// Map an API response onto the resolver outcome.
fn interpret_response(project: &str, status: StatusCode, body: &[u8]) -> Result<String, ResolveError> {
    if status == StatusCode::NOT_FOUND {
        return Err(ResolveError::NotFound(project.to_string()));
    }

    if !status.is_success() {
        let body = &body[..body.len().min(ERROR_BODY_LIMIT)];
        let detail = serde_json::from_slice::<ErrorBody>(body)
            .map(|e| e.error)
            .or_else(|_| {
                serde_json::from_slice::<Envelope>(body)
                    .map(|e| e.error.unwrap_or_default())
            })
            .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
        return Err(ResolveError::Internal(anyhow!(
            "resolver returned {status}: {detail}"
        )));
    }

    let envelope: Option<Envelope> = serde_json::from_slice(body).ok();
    let envelope = envelope.ok_or_else(|| {
        ResolveError::Internal(anyhow!("resolver returned an undecodable body"))
    })?;

    if !envelope.success {
        let error = envelope.error.unwrap_or_default();
        if error.to_ascii_lowercase().contains("not found") {
            return Err(ResolveError::NotFound(project.to_string()));
        }
        return Err(ResolveError::Internal(anyhow!("resolver error: {error}")));
    }

    match envelope.content {
        Some(content) if !content.ssh_address.is_empty() => Ok(content.ssh_address),
        _ => Err(ResolveError::NotFound(project.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

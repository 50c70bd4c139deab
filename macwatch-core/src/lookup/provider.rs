//! HTTP vendor service and its error classes.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::config::LookupConfig;

/// Failure classes reported by a [`VendorService`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// No vendor is registered for the key.
    #[error("Not found")]
    NotFound,

    /// The service asked us to slow down (HTTP 429).
    #[error("Rate limited")]
    RateLimited,

    /// 5xx response, including gateway timeouts.
    #[error("Server error: HTTP {0}")]
    Server(u16),

    /// Connection failure or request timeout.
    #[error("Network error: {0}")]
    Network(String),

    /// Any other non-success status.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Response body or URL could not be understood.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Map a non-success HTTP status to the failure class it represents.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        match status.as_u16() {
            404 => ProviderError::NotFound,
            429 => ProviderError::RateLimited,
            code if status.is_server_error() => ProviderError::Server(code),
            code => ProviderError::Api {
                status: code,
                message: body.trim().chars().take(200).collect(),
            },
        }
    }

    /// Server and transport failures are worth an immediate retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Server(_) | ProviderError::Network(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ProviderError::from_status(status, "");
        }
        if err.is_decode() {
            return ProviderError::Parse(err.to_string());
        }
        ProviderError::Network(err.to_string())
    }
}

/// External vendor lookup keyed by a normalised hardware-address prefix.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VendorService: Send + Sync {
    /// Resolve `key` to an organisation name.
    async fn lookup(&self, key: &str) -> Result<String, ProviderError>;
}

/// HTTP client for the macvendors API.
///
/// Without an API key the free plain-text endpoint (`/{key}`) is used. With a
/// key, requests go to `/v1/lookup/{key}` with bearer auth and a JSON body is
/// expected.
pub struct MacVendorsProvider {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl fmt::Debug for MacVendorsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacVendorsProvider")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.api_key.is_some())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct LookupBody {
    #[serde(default)]
    data: Option<LookupData>,
    #[serde(default)]
    organization_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookupData {
    #[serde(default)]
    organization_name: Option<String>,
}

impl MacVendorsProvider {
    /// Client for the service at `base_url`. With an API key the
    /// authenticated JSON endpoint is used.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let mut base_url = Url::parse(base_url).map_err(|err| {
            ProviderError::Parse(format!("invalid base url {base_url}: {err}"))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("macwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    /// Provider built from the lookup settings.
    pub fn from_config(config: &LookupConfig) -> Result<Self, ProviderError> {
        Self::new(
            &config.base_url,
            config.api_key.clone(),
            config.request_timeout(),
        )
    }

    /// URL queried for `key`.
    pub fn endpoint(&self, key: &str) -> Result<Url, ProviderError> {
        let relative = match self.api_key {
            Some(_) => format!("v1/lookup/{key}"),
            None => key.to_string(),
        };
        self.base_url.join(&relative).map_err(|err| {
            ProviderError::Parse(format!("invalid lookup url for {key}: {err}"))
        })
    }
}

/// Pull the organisation name out of an authenticated response, falling back
/// to the raw text when the body is not the expected JSON.
fn parse_authenticated_body(body: &str) -> Option<String> {
    let name = match serde_json::from_str::<LookupBody>(body) {
        Ok(parsed) => parsed
            .data
            .and_then(|data| data.organization_name)
            .or(parsed.organization_name),
        Err(_) => None,
    };
    name.or_else(|| Some(body.trim().to_string()))
        .filter(|name| !name.is_empty())
}

#[async_trait]
impl VendorService for MacVendorsProvider {
    async fn lookup(&self, key: &str) -> Result<String, ProviderError> {
        let url = self.endpoint(key)?;
        let mut request = self.http.get(url);
        if let Some(token) = &self.api_key {
            request = request
                .bearer_auth(token)
                .header(reqwest::header::ACCEPT, "application/json");
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ProviderError::from_status(status, &body));
        }

        let name = if self.api_key.is_some() {
            parse_authenticated_body(&body)
        } else {
            Some(body.trim().to_string()).filter(|name| !name.is_empty())
        };
        name.ok_or_else(|| ProviderError::Parse("empty vendor name".into()))
    }
}

//! Per-job inputs handed from the job loop to the dispatcher.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Outbound HTTP method subset supported by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Head,
    Get,
    Delete,
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Head => "HEAD",
            Self::Get => "GET",
            Self::Delete => "DELETE",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        }
    }

    /// Parse the wire spelling, case-insensitively.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.to_ascii_uppercase().as_str() {
            "HEAD" => Ok(Self::Head),
            "GET" => Ok(Self::Get),
            "DELETE" => Ok(Self::Delete),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            other => Err(format!("unsupported HTTP method '{other}'")),
        }
    }
}

/// Connect/total deadline pair, in seconds. Non-positive means "client
/// default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "Timeouts::unset")]
    pub connection: i64,
    #[serde(default = "Timeouts::unset")]
    pub operation: i64,
}

impl Timeouts {
    fn unset() -> i64 {
        -1
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { connection: -1, operation: -1 }
    }
}

/// The user request a job asks the proxy to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub follow_location: bool,
    #[serde(default)]
    pub ssl_do_not_verify_peer: bool,
    #[serde(default)]
    pub proxy: String,
    #[serde(default)]
    pub ca_cert: String,
}

/// An explicit authorization-code exchange requested by a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRequest {
    /// Authorization code value; empty in auto mode.
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// When false, token values are redacted from the published response.
    #[serde(default)]
    pub expose: bool,
}

/// What the job asks for; exactly one variant per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Http(HttpRequestSpec),
    Grant(GrantRequest),
}

impl RequestKind {
    #[must_use]
    pub fn is_grant(&self) -> bool {
        matches!(self, Self::Grant(_))
    }
}

/// How the deferred talks to the external token store; built lazily per
/// step, never part of the inbound payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Response body transformation run inside the expression sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interceptor {
    /// Expression evaluated with `$.response` and `$.data` bound.
    pub expr: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Optional response caching and transformation policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseSpec {
    /// Local file the response body is cached to; empty disables caching.
    #[serde(default)]
    pub uri: String,
    /// Public URL served in place of the cached body.
    #[serde(default)]
    pub url: String,
    /// Deflate the cached body before writing.
    #[serde(default)]
    pub deflated: bool,
    /// Deflate level, 0..=9.
    #[serde(default)]
    pub level: u32,
    /// Cached file lifetime in seconds.
    #[serde(default)]
    pub validity: i64,
    #[serde(default)]
    pub interceptor: Option<Interceptor>,
}

impl ResponseSpec {
    #[must_use]
    pub fn caches_to_disk(&self) -> bool {
        !self.uri.is_empty()
    }
}

/// Everything the dispatcher needs to run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Provider id this job runs against.
    pub id: String,
    /// Raw job data object, exposed to templating as `$.data`.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Respond in primitive (length-prefixed) framing.
    #[serde(default)]
    pub primitive: bool,
    /// Job log verbosity, mirrors the queue's log level scale.
    #[serde(default)]
    pub log_level: i32,
    /// Scrub credentials from logged/traced HTTP lines.
    #[serde(default = "Parameters::default_redact")]
    pub log_redact: bool,
    pub request: RequestKind,
    #[serde(default)]
    pub response: Option<ResponseSpec>,
}

impl Parameters {
    fn default_redact() -> bool {
        true
    }
}

//! Plain outbound HTTP client.
//!
//! Each deferred owns its clients for its whole lifetime; nothing here is
//! shared across jobs, which is what lets per-request proxy, CA and peer
//! verification options be plain client state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_domain::{HttpMethod, Timeouts};
use tracing::debug;

/// Successful response as reported to the deferred.
#[derive(Debug, Clone)]
pub struct HttpValue {
    pub code: u16,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Round-trip time in milliseconds.
    pub rtt: u64,
}

/// Failure class of an outbound request that produced no HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpFailureKind {
    /// Deadline exceeded; surfaces as a synthesized 504.
    Timeout,
    /// Transport-level failure (DNS, TLS, connect, reset); synthesized 500.
    Transport,
    /// Client-side bug or misconfiguration; synthesized 500.
    Internal,
}

/// Transport or internal failure.
#[derive(Debug, Clone)]
pub struct HttpFailure {
    pub kind: HttpFailureKind,
    pub message: String,
}

impl HttpFailure {
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self { kind: HttpFailureKind::Internal, message: message.into() }
    }
}

impl std::fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            HttpFailureKind::Timeout => write!(f, "timeout: {}", self.message),
            HttpFailureKind::Transport => write!(f, "transport: {}", self.message),
            HttpFailureKind::Internal => write!(f, "internal: {}", self.message),
        }
    }
}

/// Hooks fed curl-style request/response lines for job logging and tracing.
#[derive(Clone)]
pub struct TraceHooks {
    pub on_request: Arc<dyn Fn(&str) + Send + Sync>,
    pub on_response: Arc<dyn Fn(u16, &str) + Send + Sync>,
}

/// Client construction options, fixed for the owning deferred's lifetime.
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    pub user_agent: String,
    pub follow_location: bool,
    pub ssl_do_not_verify_peer: bool,
    /// Proxy URL; empty disables.
    pub proxy: String,
    /// Extra root certificate, PEM text; empty disables.
    pub ca_cert: String,
    pub connect_timeout: Duration,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            user_agent: String::new(),
            follow_location: false,
            ssl_do_not_verify_peer: false,
            proxy: String::new(),
            ca_cert: String::new(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// One-request-at-a-time HTTP client.
pub struct HttpClient {
    client: reqwest::Client,
    trace: Option<TraceHooks>,
    redact: bool,
    secret_headers: Vec<String>,
}

impl HttpClient {
    /// Build a client for the given options.
    pub fn new(options: &HttpClientOptions) -> Result<Self, HttpFailure> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .redirect(if options.follow_location {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            });
        if !options.user_agent.is_empty() {
            builder = builder.user_agent(options.user_agent.clone());
        }
        if options.ssl_do_not_verify_peer {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if !options.proxy.is_empty() {
            let proxy = reqwest::Proxy::all(&options.proxy)
                .map_err(|e| HttpFailure::internal(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        if !options.ca_cert.is_empty() {
            let cert = reqwest::Certificate::from_pem(options.ca_cert.as_bytes())
                .map_err(|e| HttpFailure::internal(format!("invalid ca certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| HttpFailure::internal(format!("http client build failed: {e}")))?;
        Ok(Self { client, trace: None, redact: true, secret_headers: Vec::new() })
    }

    /// Install request/response trace hooks.
    ///
    /// `redact` scrubs `Authorization` and any header named in
    /// `secret_headers` before a line reaches the hooks.
    pub fn set_trace_hooks(&mut self, hooks: TraceHooks, redact: bool, secret_headers: Vec<String>) {
        self.trace = Some(hooks);
        self.redact = redact;
        self.secret_headers = secret_headers;
    }

    /// Perform one request. HEAD and GET never send a body.
    pub async fn execute(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
        timeouts: Timeouts,
    ) -> Result<HttpValue, HttpFailure> {
        let reqwest_method = match method {
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
        };

        let body = match method {
            HttpMethod::Head | HttpMethod::Get => None,
            _ => body.filter(|b| !b.is_empty()),
        };

        if let Some(trace) = &self.trace {
            let line = self.curl_request_line(method, url, headers, body);
            (trace.on_request)(&line);
        }

        let mut request = self.client.request(reqwest_method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body.to_string());
        }
        if timeouts.operation > 0 {
            request = request.timeout(Duration::from_secs(timeouts.operation as u64));
        }

        let started = Instant::now();
        let response = request.send().await.map_err(map_send_error)?;
        let code = response.status().as_u16();

        let mut response_headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                response_headers.insert(canonical_header(name.as_str()), value.to_string());
            }
        }
        let content_type = response_headers.get("Content-Type").cloned().unwrap_or_default();

        let body = response.text().await.map_err(map_send_error)?;
        let rtt = started.elapsed().as_millis() as u64;

        debug!(%url, method = method.as_str(), code, rtt, "outbound request completed");

        if let Some(trace) = &self.trace {
            let line = format!("HTTP {code} {content_type} ({rtt} ms) {body}");
            (trace.on_response)(code, &line);
        }

        Ok(HttpValue { code, content_type, headers: response_headers, body, rtt })
    }

    fn curl_request_line(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
    ) -> String {
        let mut line = format!("curl -X {} '{url}'", method.as_str());
        for (name, value) in headers {
            let value = if self.redact && self.is_secret(name) { "<redacted>" } else { value };
            line.push_str(&format!(" -H '{name}: {value}'"));
        }
        if let Some(body) = body {
            line.push_str(&format!(" --data-binary '{body}'"));
        }
        line
    }

    fn is_secret(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case("authorization")
            || self.secret_headers.iter().any(|secret| secret.eq_ignore_ascii_case(name))
    }
}

fn map_send_error(err: reqwest::Error) -> HttpFailure {
    if err.is_timeout() {
        HttpFailure { kind: HttpFailureKind::Timeout, message: err.to_string() }
    } else if err.is_builder() || err.is_decode() {
        HttpFailure { kind: HttpFailureKind::Internal, message: err.to_string() }
    } else {
        HttpFailure { kind: HttpFailureKind::Transport, message: err.to_string() }
    }
}

/// Normalize a header name to its canonical `Word-Word` spelling so lookups
/// do not depend on what the server sent.
fn canonical_header(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

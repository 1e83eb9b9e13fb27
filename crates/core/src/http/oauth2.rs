//! OAuth2-aware HTTP client.
//!
//! Wraps the plain client with bearer injection, the three supported grant
//! exchanges and a single refresh-token retry on 401. Token state lives in a
//! [`TokenCell`]; for storageless providers the cell is the registry's shared
//! copy, for storage providers it belongs to the running deferred alone.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use courier_domain::{GrantConfig, HttpMethod, OAuth2Endpoints, Timeouts, Tokens};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::client::{HttpClient, HttpClientOptions, HttpFailure, HttpValue, TraceHooks};

/// Shared, mutex-guarded token pair.
pub struct TokenCell {
    tokens: Mutex<Tokens>,
}

impl TokenCell {
    #[must_use]
    pub fn new(tokens: Tokens) -> Arc<Self> {
        Arc::new(Self { tokens: Mutex::new(tokens) })
    }

    /// Snapshot of the current pair.
    #[must_use]
    pub fn get(&self) -> Tokens {
        self.tokens.lock().expect("token cell poisoned").clone()
    }

    /// Replace the pair wholesale.
    pub fn set(&self, tokens: Tokens) {
        *self.tokens.lock().expect("token cell poisoned") = tokens;
    }

    /// Mutate the pair under the cell's lock.
    pub fn update(&self, f: impl FnOnce(&mut Tokens)) {
        f(&mut self.tokens.lock().expect("token cell poisoned"));
    }
}

/// Fields of a token endpoint response we act on.
#[derive(Debug, Default)]
struct TokenResponse {
    token_type: Option<String>,
    access_token: String,
    refresh_token: Option<String>,
    scope: Option<String>,
    expires_in: u64,
}

/// OAuth2 client owned by one deferred.
pub struct OAuth2HttpClient {
    api: HttpClient,
    token_http: HttpClient,
    endpoints: OAuth2Endpoints,
    grant: GrantConfig,
    tokens: Arc<TokenCell>,
    on_tokens_changed: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl OAuth2HttpClient {
    /// Build the wrapper. The API-facing client honors the caller's options;
    /// token endpoint traffic always runs without redirect following so a
    /// misconfigured grant surfaces as the raw 302.
    pub fn new(
        endpoints: OAuth2Endpoints,
        grant: GrantConfig,
        tokens: Arc<TokenCell>,
        api_options: &HttpClientOptions,
    ) -> Result<Self, HttpFailure> {
        let api = HttpClient::new(api_options)?;
        let mut token_options = api_options.clone();
        token_options.follow_location = false;
        let token_http = HttpClient::new(&token_options)?;
        Ok(Self { api, token_http, endpoints, grant, tokens, on_tokens_changed: None })
    }

    /// Callback fired after a refresh exchange mutates the token cell.
    pub fn set_on_tokens_changed(&mut self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.on_tokens_changed = Some(callback);
    }

    /// Install trace hooks on both underlying clients.
    pub fn set_trace_hooks(&mut self, hooks: TraceHooks, redact: bool, secrets: Vec<String>) {
        self.api.set_trace_hooks(hooks.clone(), redact, secrets.clone());
        self.token_http.set_trace_hooks(hooks, redact, secrets);
    }

    #[must_use]
    pub fn tokens(&self) -> Arc<TokenCell> {
        Arc::clone(&self.tokens)
    }

    // MARK: grants

    /// RFC 6749 §4.4 client credentials exchange. Returns the raw token
    /// endpoint response; the caller owns parsing and persistence.
    pub async fn client_credentials_grant(
        &self,
        timeouts: Timeouts,
    ) -> Result<HttpValue, HttpFailure> {
        let mut pairs = vec![("grant_type".to_string(), "client_credentials".to_string())];
        if !self.endpoints.scope.is_empty() {
            pairs.push(("scope".to_string(), self.endpoints.scope.clone()));
        }
        self.token_endpoint_request(pairs, timeouts).await
    }

    /// RFC 6749 §4.1.3 exchange of an explicit authorization code, with an
    /// optional scope/state echo.
    pub async fn authorization_code_grant(
        &self,
        code: &str,
        scope: Option<&str>,
        state: Option<&str>,
        timeouts: Timeouts,
    ) -> Result<HttpValue, HttpFailure> {
        let mut pairs = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
        ];
        if !self.endpoints.redirect_uri.is_empty() {
            pairs.push(("redirect_uri".to_string(), self.endpoints.redirect_uri.clone()));
        }
        if let Some(scope) = scope.filter(|s| !s.is_empty()) {
            pairs.push(("scope".to_string(), scope.to_string()));
        }
        if let Some(state) = state.filter(|s| !s.is_empty()) {
            pairs.push(("state".to_string(), state.to_string()));
        }
        self.token_endpoint_request(pairs, timeouts).await
    }

    /// Auto mode: drive the authorization redirect chain to completion and
    /// exchange the captured code.
    pub async fn authorization_code_auto_grant(
        &self,
        timeouts: Timeouts,
    ) -> Result<HttpValue, HttpFailure> {
        let state = chain_state(&self.endpoints.client_id);
        let mut url = url::Url::parse(&self.endpoints.authorization_url)
            .map_err(|e| HttpFailure::internal(format!("invalid authorization url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.endpoints.client_id)
            .append_pair("redirect_uri", &self.endpoints.redirect_uri)
            .append_pair("state", &state);
        if !self.endpoints.scope.is_empty() {
            url.query_pairs_mut().append_pair("scope", &self.endpoints.scope);
        }

        let mut location = url.to_string();
        for _hop in 0..10 {
            let value = self
                .token_http
                .execute(HttpMethod::Get, &location, &BTreeMap::new(), None, timeouts)
                .await?;
            if !matches!(value.code, 301 | 302 | 303 | 307 | 308) {
                return Err(HttpFailure::internal(format!(
                    "authorization chain stopped at {} without redirecting to the redirect_uri",
                    value.code
                )));
            }
            let next = value
                .headers
                .get("Location")
                .cloned()
                .ok_or_else(|| HttpFailure::internal("redirect without a Location header"))?;
            if next.starts_with(&self.endpoints.redirect_uri) {
                let code = extract_code(&next)?;
                debug!("authorization chain completed, exchanging code");
                return self.authorization_code_grant(&code, None, None, timeouts).await;
            }
            location = resolve_location(&location, &next)?;
        }
        Err(HttpFailure::internal("authorization redirect chain exceeded 10 hops"))
    }

    // MARK: authenticated requests

    /// Perform an authenticated request. On a 401 with a refresh token at
    /// hand, runs one refresh exchange and replays the request before
    /// surfacing anything to the caller.
    pub async fn fetch(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
        timeouts: Timeouts,
    ) -> Result<HttpValue, HttpFailure> {
        let value = self.authenticated(method, url, headers, body, timeouts).await?;
        if value.code != 401 {
            return Ok(value);
        }
        let refresh = self.tokens.get().refresh;
        if refresh.is_empty() {
            return Ok(value);
        }
        match self.refresh_exchange(&refresh, timeouts).await {
            Ok(()) => {
                debug!(%url, "access token refreshed, replaying request");
                self.authenticated(method, url, headers, body, timeouts).await
            }
            Err(message) => {
                warn!(%url, %message, "token refresh failed, surfacing original 401");
                Ok(value)
            }
        }
    }

    async fn authenticated(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
        timeouts: Timeouts,
    ) -> Result<HttpValue, HttpFailure> {
        let tokens = self.tokens.get();
        let mut headers = headers.clone();
        if !tokens.is_empty() {
            headers.insert("Authorization".to_string(), tokens.authorization());
        }
        self.api.execute(method, url, &headers, body, timeouts).await
    }

    /// RFC 6749 §6 refresh exchange. Mutates the token cell and fires the
    /// change callback on success; returns the failure reason otherwise.
    async fn refresh_exchange(&self, refresh: &str, timeouts: Timeouts) -> Result<(), String> {
        let pairs = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh.to_string()),
        ];
        let value = self
            .token_endpoint_request(pairs, timeouts)
            .await
            .map_err(|failure| failure.to_string())?;
        if value.code != 200 {
            return Err(format!("token endpoint answered {}", value.code));
        }
        let parsed = parse_token_response(&value.body, self.grant.rfc_6749_strict)?;
        self.tokens.update(|tokens| {
            tokens.access = parsed.access_token.clone();
            if let Some(refresh) = &parsed.refresh_token {
                tokens.refresh = refresh.clone();
            }
            if let Some(token_type) = &parsed.token_type {
                tokens.token_type = token_type.clone();
            }
            if let Some(scope) = &parsed.scope {
                tokens.scope = scope.clone();
            }
            tokens.expires_in = parsed.expires_in;
        });
        if let Some(callback) = &self.on_tokens_changed {
            callback();
        }
        Ok(())
    }

    async fn token_endpoint_request(
        &self,
        mut pairs: Vec<(String, String)>,
        timeouts: Timeouts,
    ) -> Result<HttpValue, HttpFailure> {
        let mut headers = BTreeMap::new();
        headers.insert(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        if self.grant.formpost {
            pairs.push(("client_id".to_string(), self.endpoints.client_id.clone()));
            pairs.push(("client_secret".to_string(), self.endpoints.client_secret.clone()));
        } else {
            let credentials = BASE64.encode(format!(
                "{}:{}",
                self.endpoints.client_id, self.endpoints.client_secret
            ));
            headers.insert("Authorization".to_string(), format!("Basic {credentials}"));
        }
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        self.token_http
            .execute(HttpMethod::Post, &self.endpoints.token_url, &headers, Some(&body), timeouts)
            .await
    }
}

/// Parse a token endpoint body. Strict mode enforces the RFC-required
/// `access_token` and `token_type` members; tolerant mode takes what is
/// there, which some vendors need.
fn parse_token_response(body: &str, strict: bool) -> Result<TokenResponse, String> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| format!("malformed token response: {e}"))?;
    let access_token = value
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "token response missing access_token".to_string())?
        .to_string();
    let token_type = value.get("token_type").and_then(|v| v.as_str()).map(str::to_string);
    if strict && token_type.is_none() {
        return Err("token response missing token_type".to_string());
    }
    Ok(TokenResponse {
        token_type,
        access_token,
        refresh_token: value.get("refresh_token").and_then(|v| v.as_str()).map(str::to_string),
        scope: value.get("scope").and_then(|v| v.as_str()).map(str::to_string),
        expires_in: value.get("expires_in").and_then(|v| v.as_u64()).unwrap_or(0),
    })
}

fn extract_code(redirect: &str) -> Result<String, HttpFailure> {
    let url = url::Url::parse(redirect)
        .map_err(|e| HttpFailure::internal(format!("invalid redirect target: {e}")))?;
    url.query_pairs()
        .find(|(name, _)| name == "code")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| HttpFailure::internal("redirect reached the redirect_uri without a code"))
}

fn resolve_location(base: &str, next: &str) -> Result<String, HttpFailure> {
    let base = url::Url::parse(base)
        .map_err(|e| HttpFailure::internal(format!("invalid redirect base: {e}")))?;
    base.join(next)
        .map(|url| url.to_string())
        .map_err(|e| HttpFailure::internal(format!("invalid redirect location: {e}")))
}

/// Nonce for the auto-grant state parameter.
fn chain_state(seed: &str) -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let digest = Sha256::digest(format!("{seed}:{nanos}"));
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        if out.len() >= chars {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out.truncate(chars);
    out
}

//! Per-job deferred execution engine.
//!
//! One deferred owns a job from push to publish. It chains the outbound
//! operations the job needs through a FIFO of pending operations, issuing
//! exactly one HTTP request per step:
//!
//! - `LoadTokens` - fetch the wrapped token pair from the external store
//! - `RestartOAuth2` - run the provider's grant against the token endpoint
//! - `PerformRequest` - the user's request, bearer-authenticated
//! - `SaveTokens` - persist a renewed pair back to the store
//!
//! Scheduling happens on the job-loop lane, HTTP callbacks land on the main
//! I/O lane, and completion is published through the looper. Between steps
//! the machine hops I/O -> looper -> job-loop so the next request starts on a
//! fresh turn of the I/O lane instead of inside the previous callback frame.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use courier_domain::{
    CourierError, CourierResult, GrantRequest, HttpMethod, HttpRequestSpec, Parameters,
    ProviderKind, RequestKind, StepResponse, StorageRequest, Tracking,
};
use tracing::{debug, warn};

use crate::crypto::{self, TokenCipher};
use crate::dispatcher::Provider;
use crate::exec::{Lane, Lanes};
use crate::http::client::{HttpClient, HttpClientOptions, HttpFailure, HttpFailureKind, HttpValue, TraceHooks};
use crate::http::oauth2::{OAuth2HttpClient, TokenCell};
use crate::http::options::HttpOptions;
use crate::shaping;

/// Job log level at which HTTP lines are logged instead of only traced.
pub const LOG_LEVEL_VERBOSE: i32 = 2;
/// Job log level at which non-OAuth2 (token store) traffic is logged too.
pub const LOG_LEVEL_DEBUG: i32 = 3;

/// Header identifying the worker to the token store.
const STORAGE_AGENT_HEADER: &str = "X-Courier-OAuth2-Agent";

/// Operations the machine chains; the absence of a current operation is the
/// not-yet-started state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operation {
    LoadTokens,
    RestartOAuth2,
    PerformRequest,
    SaveTokens,
}

impl Operation {
    fn log_tag(self) -> &'static str {
        match self {
            Operation::LoadTokens => "db/load-tokens",
            Operation::SaveTokens => "db/save-tokens",
            Operation::RestartOAuth2 => "http/authorize",
            Operation::PerformRequest => "http/perform",
        }
    }
}

/// Final-response selection order; first present wins.
const RESPONSE_PRIORITY: [Operation; 4] = [
    Operation::PerformRequest,
    Operation::SaveTokens,
    Operation::RestartOAuth2,
    Operation::LoadTokens,
];

/// Callbacks a deferred fires while it runs. `on_completed` fires exactly
/// once, on the looper lane.
#[derive(Clone)]
pub struct DeferredCallbacks {
    pub on_completed: Arc<dyn Fn(&Tracking, StepResponse, serde_json::Value) + Send + Sync>,
    pub on_log_step: Arc<dyn Fn(&Tracking, &str) + Send + Sync>,
    pub on_log_http: Arc<dyn Fn(&Tracking, &str) + Send + Sync>,
}

struct State {
    current: Option<Operation>,
    pending: VecDeque<Operation>,
    responses: BTreeMap<Operation, StepResponse>,
    allow_oauth2_restart: bool,
    options: HttpOptions,
    trace: Vec<String>,
    http: Option<Arc<HttpClient>>,
    oauth2: Option<Arc<OAuth2HttpClient>>,
    finalized: bool,
}

/// One in-flight job.
pub struct Deferred {
    tracking: Tracking,
    parameters: Parameters,
    provider: Arc<Provider>,
    lanes: Arc<Lanes>,
    cipher: Arc<dyn TokenCipher>,
    callbacks: DeferredCallbacks,
    tokens: Arc<TokenCell>,
    state: Mutex<State>,
}

impl Deferred {
    /// Build a deferred for one job. Storageless providers share their live
    /// token cell; storage and grant jobs get a cell of their own.
    #[must_use]
    pub fn new(
        tracking: Tracking,
        parameters: Parameters,
        provider: Arc<Provider>,
        lanes: Arc<Lanes>,
        cipher: Arc<dyn TokenCipher>,
        callbacks: DeferredCallbacks,
    ) -> Arc<Self> {
        let tokens = match (provider.config.kind, parameters.request.is_grant()) {
            (ProviderKind::Storageless, false) => provider.shared_tokens(),
            _ => TokenCell::new(courier_domain::Tokens::default()),
        };
        Arc::new(Self {
            tracking,
            parameters,
            provider,
            lanes,
            cipher,
            callbacks,
            tokens,
            state: Mutex::new(State {
                current: None,
                pending: VecDeque::new(),
                responses: BTreeMap::new(),
                allow_oauth2_restart: false,
                options: HttpOptions::OAUTH2 | HttpOptions::TRACE | HttpOptions::REDACT,
                trace: Vec::new(),
                http: None,
                oauth2: None,
                finalized: false,
            }),
        })
    }

    #[must_use]
    pub fn tracking(&self) -> &Tracking {
        &self.tracking
    }

    /// Start the machine. Job-loop lane only.
    pub fn run(self: &Arc<Self>) {
        Lane::JobLoop.ensure();

        {
            let mut state = self.lock();
            if self.parameters.log_level >= LOG_LEVEL_VERBOSE {
                state.options.insert(HttpOptions::LOG);
                if self.parameters.log_level >= LOG_LEVEL_DEBUG {
                    state.options.insert(HttpOptions::NON_OAUTH2);
                }
                if !self.parameters.log_redact {
                    state.options.remove(HttpOptions::REDACT);
                }
            }
        }

        if let Err(err) = self.prepare_oauth2_client() {
            self.abort(err);
            return;
        }

        match &self.parameters.request {
            RequestKind::Grant(_) => self.schedule_authorization(),
            RequestKind::Http(_) => match self.provider.config.kind {
                ProviderKind::Storage => {
                    let mut state = self.lock();
                    state.allow_oauth2_restart = false;
                    state.pending.push_back(Operation::PerformRequest);
                    drop(state);
                    self.schedule_load_tokens();
                }
                ProviderKind::Storageless => {
                    let grant = self.provider.config.grant.kind;
                    self.lock().allow_oauth2_restart = grant.is_self_authorizing();
                    if self.tokens.get().is_empty() {
                        if !grant.is_self_authorizing() {
                            self.abort(CourierError::UnsupportedGrant(format!(
                                "provider '{}' has no tokens and its grant cannot self-authorize",
                                self.provider.id
                            )));
                            return;
                        }
                        self.lock().pending.push_back(Operation::PerformRequest);
                        self.schedule_authorization();
                    } else {
                        self.schedule_perform_request();
                    }
                }
            },
        }
    }

    // MARK: - schedulers (job-loop lane)

    fn schedule_load_tokens(self: &Arc<Self>) {
        Lane::JobLoop.ensure();
        self.mark(Operation::LoadTokens);

        let storage = match self.storage_config() {
            Ok(storage) => storage,
            Err(err) => return self.abort(err),
        };
        let request = StorageRequest {
            method: HttpMethod::Get,
            url: storage.tokens_endpoint.clone(),
            body: String::new(),
            headers: self.storage_headers(&storage.headers),
            timeouts: storage.timeouts,
        };
        let client = match self.plain_http_client() {
            Ok(client) => client,
            Err(err) => return self.abort(err),
        };
        self.issue_storage_request(client, request);
    }

    fn schedule_save_tokens(self: &Arc<Self>) {
        Lane::JobLoop.ensure();
        self.mark(Operation::SaveTokens);

        let storage = match self.storage_config() {
            Ok(storage) => storage,
            Err(err) => return self.abort(err),
        };
        let body = match self.save_tokens_body() {
            Ok(body) => body,
            Err(err) => return self.abort(err),
        };
        let request = StorageRequest {
            method: HttpMethod::Post,
            url: storage.tokens_endpoint.clone(),
            body,
            headers: self.storage_headers(&storage.headers),
            timeouts: storage.timeouts,
        };
        let client = match self.plain_http_client() {
            Ok(client) => client,
            Err(err) => return self.abort(err),
        };
        self.issue_storage_request(client, request);
    }

    fn schedule_authorization(self: &Arc<Self>) {
        Lane::JobLoop.ensure();
        self.mark(Operation::RestartOAuth2);

        let oauth2 = match self.oauth2_client() {
            Ok(client) => client,
            Err(err) => return self.abort(err),
        };
        let grant_kind = self.provider.config.grant.kind;
        let grant_request = match &self.parameters.request {
            RequestKind::Grant(grant) => grant.clone(),
            RequestKind::Http(_) => GrantRequest::default(),
        };
        if grant_kind == courier_domain::GrantKind::AuthorizationCode
            && !self.parameters.request.is_grant()
            && grant_request.code.is_empty()
        {
            return self.abort(CourierError::UnsupportedGrant(
                "authorization_code grant cannot restart without an authorization code".into(),
            ));
        }

        let this = Arc::clone(self);
        self.lanes.main_io.post(move || {
            Lane::MainIo.ensure();
            let deferred = Arc::clone(&this);
            tokio::spawn(async move {
                let timeouts = grant_request.timeouts;
                let outcome = match grant_kind {
                    courier_domain::GrantKind::ClientCredentials => {
                        oauth2.client_credentials_grant(timeouts).await
                    }
                    courier_domain::GrantKind::AuthorizationCodeAuto => {
                        oauth2.authorization_code_auto_grant(timeouts).await
                    }
                    courier_domain::GrantKind::AuthorizationCode => {
                        oauth2
                            .authorization_code_grant(
                                &grant_request.code,
                                Some(&grant_request.scope),
                                Some(&grant_request.state),
                                timeouts,
                            )
                            .await
                    }
                };
                deferred.post_completion(outcome);
            });
        });
    }

    fn schedule_perform_request(self: &Arc<Self>) {
        Lane::JobLoop.ensure();
        self.mark(Operation::PerformRequest);

        let RequestKind::Http(spec) = &self.parameters.request else {
            return self.abort(CourierError::Internal(
                "perform-request scheduled for a grant job".into(),
            ));
        };
        let mut request = spec.clone();
        if let Err(err) = self.apply_templates(&mut request) {
            return self.abort(err);
        }

        let mut headers = self.provider.config.headers_for(request.method.as_str());
        if let Some(storageless) = &self.provider.config.storageless {
            headers.extend(storageless.headers.clone());
        }
        headers.extend(request.headers.clone());
        request.headers = headers;

        let oauth2 = match self.oauth2_client() {
            Ok(client) => client,
            Err(err) => return self.abort(err),
        };

        let this = Arc::clone(self);
        self.lanes.main_io.post(move || {
            Lane::MainIo.ensure();
            let deferred = Arc::clone(&this);
            tokio::spawn(async move {
                let body = (!request.body.is_empty()).then_some(request.body.as_str());
                let outcome = oauth2
                    .fetch(request.method, &request.url, &request.headers, body, request.timeouts)
                    .await;
                deferred.post_completion(outcome);
            });
        });
    }

    /// Issue a token-store request on the plain client.
    fn issue_storage_request(self: &Arc<Self>, client: Arc<HttpClient>, request: StorageRequest) {
        let this = Arc::clone(self);
        self.lanes.main_io.post(move || {
            Lane::MainIo.ensure();
            let deferred = Arc::clone(&this);
            tokio::spawn(async move {
                let body = (!request.body.is_empty()).then_some(request.body.as_str());
                let outcome = client
                    .execute(request.method, &request.url, &request.headers, body, request.timeouts)
                    .await;
                deferred.post_completion(outcome);
            });
        });
    }

    /// Route an HTTP outcome back onto the main I/O lane.
    fn post_completion(self: &Arc<Self>, outcome: Result<HttpValue, HttpFailure>) {
        let this = Arc::clone(self);
        self.lanes.main_io.post(move || match outcome {
            Ok(value) => this.on_http_completed(value),
            Err(failure) => this.on_http_failed(&failure),
        });
    }

    // MARK: - HTTP callbacks (main I/O lane)

    /// The post-step policy: parse, judge acceptability, guard pending token
    /// saves, then advance or finalize.
    fn on_http_completed(self: &Arc<Self>, value: HttpValue) {
        Lane::MainIo.ensure();

        let mut response = StepResponse::new(
            value.code,
            value.content_type.clone(),
            value.headers.clone(),
            value.body.clone(),
            value.rtt,
        );

        let mut state = self.lock();
        let Some(current) = state.current else {
            drop(state);
            self.abort(CourierError::Internal("step completed without a current operation".into()));
            return;
        };

        // 1. parse token-bearing step responses
        if response.is_json() {
            match current {
                Operation::LoadTokens => {
                    response.parse();
                    if response.code == 200 {
                        if let Err(err) = self.absorb_stored_tokens(&response) {
                            drop(state);
                            self.abort(err);
                            return;
                        }
                    }
                }
                Operation::RestartOAuth2 => {
                    response.parse();
                    if response.code == 200 {
                        self.absorb_grant_tokens(&response);
                        if self.provider.config.kind == ProviderKind::Storage {
                            state.pending.push_back(Operation::SaveTokens);
                        }
                    }
                }
                Operation::SaveTokens => response.parse(),
                Operation::PerformRequest => {}
            }
        }

        // 2. acceptability
        let mut acceptable = response.code == 200;
        if !acceptable {
            match current {
                Operation::LoadTokens => {
                    acceptable = response.code == 404;
                    let may_bootstrap = state.allow_oauth2_restart
                        || (self.provider.config.kind == ProviderKind::Storage
                            && self.provider.config.grant.kind.is_self_authorizing());
                    if acceptable && self.tokens.get().is_empty() && may_bootstrap {
                        state.pending.push_front(Operation::RestartOAuth2);
                    }
                }
                Operation::PerformRequest => {
                    if state.allow_oauth2_restart {
                        acceptable = response.code == 401;
                        if acceptable {
                            state.pending.clear();
                            state.pending.push_back(Operation::RestartOAuth2);
                            state.pending.push_back(Operation::PerformRequest);
                        }
                    }
                }
                _ => {}
            }
        }

        // 3. renewed tokens must be persisted even when the step failed
        if self.provider.config.kind == ProviderKind::Storage
            && !acceptable
            && current != Operation::SaveTokens
            && state.pending.contains(&Operation::SaveTokens)
        {
            warn!(rcid = %self.tracking.rcid, "step failed with a pending token save, keeping it");
            state.pending.clear();
            state.pending.push_back(Operation::SaveTokens);
            acceptable = true;
        }

        // 4. record and advance
        state.responses.insert(current, response.clone());
        let finalize = !acceptable || state.pending.is_empty();
        if !finalize {
            let next = state.pending.pop_front().expect("pending cannot be empty here");
            drop(state);
            debug!(rcid = %self.tracking.rcid, ?next, "advancing to next operation");
            let this = Arc::clone(self);
            self.lanes.hop_to_job_loop(move || match next {
                Operation::RestartOAuth2 => {
                    this.lock().allow_oauth2_restart = false;
                    this.schedule_authorization();
                }
                Operation::PerformRequest => this.schedule_perform_request(),
                Operation::SaveTokens => this.schedule_save_tokens(),
                Operation::LoadTokens => this.schedule_load_tokens(),
            });
            return;
        }

        // 5. select the final response
        let final_response = if value.code == 302 && current == Operation::RestartOAuth2 {
            let mut unsupported = StepResponse::new(
                500,
                "application/json".to_string(),
                BTreeMap::new(),
                serde_json::json!({
                    "error": "unsupported_response",
                    "error_description": "302 - 302 Moved Temporarily",
                })
                .to_string(),
                value.rtt,
            );
            unsupported.parse();
            unsupported
        } else if acceptable {
            RESPONSE_PRIORITY
                .iter()
                .find_map(|operation| state.responses.get(operation).cloned())
                .unwrap_or(response)
        } else {
            response
        };
        drop(state);
        self.finalize(final_response);
    }

    fn on_http_failed(self: &Arc<Self>, failure: &HttpFailure) {
        Lane::MainIo.ensure();
        let response = match failure.kind {
            HttpFailureKind::Timeout => StepResponse::gateway_timeout(&failure.message),
            _ => StepResponse::internal_error(&failure.message),
        };
        // a failed step with a pending SaveTokens still persists the renewal
        let rescued = {
            let mut state = self.lock();
            let current = state.current;
            if self.provider.config.kind == ProviderKind::Storage
                && current != Some(Operation::SaveTokens)
                && state.pending.contains(&Operation::SaveTokens)
            {
                if let Some(op) = current {
                    state.responses.insert(op, response.clone());
                }
                state.pending.clear();
                state.pending.push_back(Operation::SaveTokens);
                true
            } else {
                false
            }
        };
        if rescued {
            let this = Arc::clone(self);
            self.lanes.hop_to_job_loop(move || this.schedule_save_tokens());
        } else {
            self.finalize(response);
        }
    }

    /// Token-change hook, fired by the OAuth2 client after a refresh
    /// exchange. Storage providers persist on the next transition; for
    /// storageless providers the shared cell already is the source of truth.
    fn on_oauth2_tokens_changed(self: &Arc<Self>) {
        Lane::MainIo.ensure();
        if self.provider.config.kind == ProviderKind::Storage {
            self.lock().pending.push_front(Operation::SaveTokens);
        }
    }

    // MARK: - finalization (looper lane)

    fn finalize(self: &Arc<Self>, mut response: StepResponse) {
        let this = Arc::clone(self);
        self.lanes.looper.post(move || {
            Lane::Looper.ensure();
            {
                let mut state = this.lock();
                if state.finalized {
                    return;
                }
                state.finalized = true;

                // flush buffered trace lines when the job failed quietly
                if response.code != 200
                    && state.options.contains(HttpOptions::TRACE)
                    && !state.options.contains(HttpOptions::LOG)
                {
                    for line in state.trace.drain(..) {
                        (this.callbacks.on_log_http)(&this.tracking, &line);
                    }
                }
            }
            let shaped = this.shape_final(&mut response);
            (this.callbacks.on_completed)(&this.tracking, response, shaped);
        });
    }

    /// Abort without outbound I/O, synthesizing the taxonomy's status code.
    fn abort(self: &Arc<Self>, err: CourierError) {
        warn!(rcid = %self.tracking.rcid, error = %err, "deferred aborted");
        let response = match err.status_code() {
            504 => StepResponse::gateway_timeout(&err.to_string()),
            code => {
                let mut response = StepResponse::internal_error(&err.to_string());
                response.code = code;
                response
            }
        };
        self.finalize(response);
    }

    fn shape_final(&self, response: &mut StepResponse) -> serde_json::Value {
        if let RequestKind::Grant(grant) = &self.parameters.request {
            if !grant.expose {
                redact_grant_tokens(response);
            }
        }
        if let Some(spec) = &self.parameters.response {
            if let Some(interceptor) = &spec.interceptor {
                let result = {
                    let evaluator = self.provider.evaluator.lock().expect("evaluator poisoned");
                    shaping::apply_interceptor(&evaluator, interceptor, response)
                };
                if let Err(err) = result {
                    *response = StepResponse::internal_error(&err.to_string());
                }
            }
            if spec.caches_to_disk() {
                if let Err(err) = shaping::apply_disk_cache(spec, &self.provider.config.tmp, response)
                {
                    *response = StepResponse::internal_error(&err.to_string());
                }
            }
        }
        shaping::shape(self.parameters.primitive, response)
    }

    // MARK: - helpers

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("deferred state poisoned")
    }

    fn mark(&self, operation: Operation) {
        let mut state = self.lock();
        state.current = Some(operation);
        drop(state);
        (self.callbacks.on_log_step)(&self.tracking, &format!("{}...", operation.log_tag()));
    }

    fn storage_config(&self) -> CourierResult<courier_domain::StorageConfig> {
        self.provider.config.storage.clone().ok_or_else(|| {
            CourierError::Config(format!("provider '{}' has no storage section", self.provider.id))
        })
    }

    fn storage_headers(
        &self,
        base: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut headers = base.clone();
        headers.insert(
            STORAGE_AGENT_HEADER.to_string(),
            format!("{} ({})", self.tracking.ua, self.tracking.rjid),
        );
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers
    }

    /// `POST` body for the token store, with both token values wrapped.
    fn save_tokens_body(&self) -> CourierResult<String> {
        let tokens = self.tokens.get();
        let access = self.cipher.ede(&tokens.access)?;
        let refresh = self.cipher.ede(&tokens.refresh)?;
        let tracking_id = crypto::tracking_id(
            &self.tracking.ua,
            &self.tracking.rjid,
            &access,
            &refresh,
            &tokens.scope,
        );
        Ok(serde_json::json!({
            "pe": true,
            "access_token": access,
            "refresh_token": refresh,
            "expires_in": tokens.expires_in,
            "scope": tokens.scope,
            "tracking_id": tracking_id,
        })
        .to_string())
    }

    /// Read a `LoadTokens` 200 body into the active cell, unwrapping values.
    fn absorb_stored_tokens(&self, response: &StepResponse) -> CourierResult<()> {
        let data = response
            .json
            .as_ref()
            .ok_or_else(|| CourierError::Internal("token store answered non-JSON".into()))?;
        let field = |name: &str| -> CourierResult<String> {
            data.get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| CourierError::Internal(format!("token store omitted '{name}'")))
        };
        let access = self.cipher.edd(&field("access_token")?)?;
        let refresh = self.cipher.edd(&field("refresh_token")?)?;
        let token_type = field("token_type")?;
        let scope = data.get("scope").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let expires_in = data.get("expires_in").and_then(|v| v.as_u64()).unwrap_or(0);
        self.tokens.update(|tokens| {
            tokens.token_type = token_type;
            tokens.access = access;
            tokens.refresh = refresh;
            tokens.scope = scope;
            tokens.expires_in = expires_in;
        });
        Ok(())
    }

    /// Read a `RestartOAuth2` 200 body into the active cell. Optional fields
    /// keep their previous values; a missing `expires_in` resets to 0.
    fn absorb_grant_tokens(&self, response: &StepResponse) {
        let Some(data) = response.json.as_ref() else { return };
        self.tokens.update(|tokens| {
            if let Some(access) = data.get("access_token").and_then(|v| v.as_str()) {
                tokens.access = access.to_string();
            }
            if let Some(refresh) = data.get("refresh_token").and_then(|v| v.as_str()) {
                tokens.refresh = refresh.to_string();
            }
            if let Some(token_type) = data.get("token_type").and_then(|v| v.as_str()) {
                tokens.token_type = token_type.to_string();
            }
            if let Some(scope) = data.get("scope").and_then(|v| v.as_str()) {
                tokens.scope = scope.to_string();
            }
            tokens.expires_in = data.get("expires_in").and_then(|v| v.as_u64()).unwrap_or(0);
        });
    }

    // MARK: - clients

    fn prepare_oauth2_client(self: &Arc<Self>) -> CourierResult<()> {
        let api_options = match &self.parameters.request {
            RequestKind::Http(spec) => HttpClientOptions {
                user_agent: self.tracking.ua.clone(),
                follow_location: spec.follow_location,
                ssl_do_not_verify_peer: spec.ssl_do_not_verify_peer,
                proxy: spec.proxy.clone(),
                ca_cert: spec.ca_cert.clone(),
                ..HttpClientOptions::default()
            },
            RequestKind::Grant(_) => HttpClientOptions {
                user_agent: self.tracking.ua.clone(),
                ..HttpClientOptions::default()
            },
        };
        let mut oauth2 = OAuth2HttpClient::new(
            self.provider.config.oauth2.clone(),
            self.provider.config.grant.clone(),
            Arc::clone(&self.tokens),
            &api_options,
        )
        .map_err(|failure| CourierError::Internal(failure.to_string()))?;

        let hook_target = Arc::downgrade(self);
        let lanes = Arc::clone(&self.lanes);
        oauth2.set_on_tokens_changed(Arc::new(move || {
            if let Some(deferred) = hook_target.upgrade() {
                let inner = Arc::clone(&deferred);
                lanes.main_io.post(move || inner.on_oauth2_tokens_changed());
            }
        }));

        let (redact, secrets) = self.trace_redaction();
        if self.traces_or_logs() {
            oauth2.set_trace_hooks(self.trace_hooks(HttpOptions::OAUTH2), redact, secrets);
        }
        self.lock().oauth2 = Some(Arc::new(oauth2));
        Ok(())
    }

    fn oauth2_client(&self) -> CourierResult<Arc<OAuth2HttpClient>> {
        self.lock()
            .oauth2
            .clone()
            .ok_or_else(|| CourierError::Internal("oauth2 client not prepared".into()))
    }

    /// Plain client for token-store traffic, created on first use.
    fn plain_http_client(self: &Arc<Self>) -> CourierResult<Arc<HttpClient>> {
        if let Some(client) = self.lock().http.clone() {
            return Ok(client);
        }
        let options = HttpClientOptions {
            user_agent: self.tracking.ua.clone(),
            ..HttpClientOptions::default()
        };
        let mut client = HttpClient::new(&options)
            .map_err(|failure| CourierError::Internal(failure.to_string()))?;
        let (redact, secrets) = self.trace_redaction();
        if self.traces_or_logs() {
            client.set_trace_hooks(self.trace_hooks(HttpOptions::NON_OAUTH2), redact, secrets);
        }
        let client = Arc::new(client);
        self.lock().http = Some(Arc::clone(&client));
        Ok(client)
    }

    fn traces_or_logs(&self) -> bool {
        self.lock().options.intersects(HttpOptions::LOG | HttpOptions::TRACE)
    }

    fn trace_redaction(&self) -> (bool, Vec<String>) {
        let redact = self.lock().options.contains(HttpOptions::REDACT);
        (redact, self.provider.config.secret_headers.clone())
    }

    /// Hooks routing curl-style lines by channel: log immediately at verbose
    /// levels, buffer for the failure flush otherwise.
    fn trace_hooks(self: &Arc<Self>, channel: HttpOptions) -> TraceHooks {
        let request_target = Arc::downgrade(self);
        let response_target = Arc::downgrade(self);
        let request_channel = channel;
        TraceHooks {
            on_request: Arc::new(move |line: &str| {
                if let Some(deferred) = request_target.upgrade() {
                    deferred.route_trace_line(request_channel, line.to_string());
                }
            }),
            on_response: Arc::new(move |_code, line: &str| {
                if let Some(deferred) = response_target.upgrade() {
                    deferred.route_trace_line(channel, line.to_string());
                }
            }),
        }
    }

    fn route_trace_line(self: &Arc<Self>, channel: HttpOptions, line: String) {
        let this = Arc::clone(self);
        self.lanes.looper.post(move || {
            let options = this.lock().options;
            if !options.intersects(HttpOptions::LOG | HttpOptions::TRACE) {
                return;
            }
            if !options.intersects(channel) {
                return;
            }
            if options.contains(HttpOptions::LOG) {
                (this.callbacks.on_log_http)(&this.tracking, &line);
            } else {
                this.lock().trace.push(line);
            }
        });
    }

    // MARK: - templating

    fn apply_templates(&self, request: &mut HttpRequestSpec) -> CourierResult<()> {
        let Some(templates) = &self.provider.config.templates else {
            return Ok(());
        };
        if templates.is_empty() {
            return Ok(());
        }
        let scope = self.template_scope(request);
        let evaluator = self.provider.evaluator.lock().expect("evaluator poisoned");

        if let Some(expr) = &templates.url {
            request.url = value_as_string(&evaluator.evaluate(&scope, expr)?);
        }
        for (name, expr) in &templates.headers {
            let value = value_as_string(&evaluator.evaluate(&scope, expr)?);
            request.headers.insert(name.clone(), value);
        }
        if let Some(template) = &templates.body {
            let rendered = render_template(&evaluator, &scope, template)?;
            request.body = serde_json::to_string(&rendered)?;
        }
        Ok(())
    }

    /// The `$` object templating expressions see: the provider's signing
    /// material, the request body as `payload` and the job data as `data`.
    fn template_scope(&self, request: &HttpRequestSpec) -> serde_json::Value {
        let mut scope = match &self.provider.config.signing.keys {
            serde_json::Value::Object(map) => serde_json::Value::Object(map.clone()),
            _ => serde_json::json!({}),
        };
        let payload: serde_json::Value = serde_json::from_str(&request.body)
            .unwrap_or_else(|_| serde_json::Value::String(request.body.clone()));
        scope["payload"] = payload;
        scope["data"] = self.parameters.data.clone();
        if let Some(storage) = &self.provider.config.storage {
            scope["storage"] = storage.arguments.clone();
        }
        scope
    }
}

fn render_template(
    evaluator: &crate::eval::Evaluator,
    scope: &serde_json::Value,
    template: &serde_json::Value,
) -> CourierResult<serde_json::Value> {
    match template {
        serde_json::Value::String(expr) => evaluator.evaluate(scope, expr),
        serde_json::Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                rendered.insert(key.clone(), render_template(evaluator, scope, value)?);
            }
            Ok(serde_json::Value::Object(rendered))
        }
        serde_json::Value::Array(items) => {
            let rendered: CourierResult<Vec<_>> =
                items.iter().map(|item| render_template(evaluator, scope, item)).collect();
            Ok(serde_json::Value::Array(rendered?))
        }
        other => Ok(other.clone()),
    }
}

fn value_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Strip token material from a grant response that is not marked exposed.
fn redact_grant_tokens(response: &mut StepResponse) {
    response.parse();
    let Some(mut body) = response.json.take() else { return };
    if let Some(map) = body.as_object_mut() {
        for key in ["access_token", "refresh_token"] {
            if map.contains_key(key) {
                map.insert(key.to_string(), serde_json::Value::String("<redacted>".into()));
            }
        }
    }
    response.body = body.to_string();
    response.json = Some(body);
}

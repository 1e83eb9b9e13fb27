//! Dispatcher: owns the set of in-flight deferreds.
//!
//! Shared by all jobs on a tube; every map mutation happens on the job-loop
//! lane. Completion fires on the looper lane and hops back to the job loop,
//! where the entry is removed and the upstream publish callback runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use courier_domain::{
    CourierError, CourierResult, Parameters, ProviderConfig, ProviderKind, StepResponse, Tokens,
    Tracking,
};
use tracing::{debug, info, warn};

use crate::crypto::TokenCipher;
use crate::deferred::{Deferred, DeferredCallbacks};
use crate::eval::Evaluator;
use crate::exec::{Lane, Lanes};
use crate::http::oauth2::TokenCell;

/// Per-job log sink owned by the host; the deferred's step and HTTP lines go
/// through here instead of a hidden global.
pub trait JobLogSink: Send + Sync {
    fn log_step(&self, tracking: &Tracking, line: &str);
    fn log_http(&self, tracking: &Tracking, line: &str);
}

/// Default sink forwarding to `tracing`.
pub struct TracingJobLog;

impl JobLogSink for TracingJobLog {
    fn log_step(&self, tracking: &Tracking, line: &str) {
        debug!(rcid = %tracking.rcid, "{line}");
    }

    fn log_http(&self, tracking: &Tracking, line: &str) {
        debug!(rcid = %tracking.rcid, target = "http", "{line}");
    }
}

/// A registered provider: immutable config plus the pieces shared across
/// jobs (the storageless token cell and the expression evaluator).
pub struct Provider {
    pub id: String,
    pub config: ProviderConfig,
    pub evaluator: Mutex<Evaluator>,
    tokens: Option<Arc<TokenCell>>,
}

impl Provider {
    fn build(id: &str, config: ProviderConfig, scripts_dir: Option<&Path>) -> CourierResult<Self> {
        config.validate(id).map_err(CourierError::Config)?;
        let evaluator = Evaluator::load(scripts_dir, config.signing.output)?;
        let tokens = match (&config.kind, &config.storageless) {
            (ProviderKind::Storageless, Some(storageless)) => {
                Some(TokenCell::new(storageless.tokens.clone()))
            }
            _ => None,
        };
        Ok(Self { id: id.to_string(), config, evaluator: Mutex::new(evaluator), tokens })
    }

    /// The provider-lifetime token cell of a storageless provider. Falls
    /// back to a fresh empty cell if called for a storage provider, which
    /// only happens on a caller bug.
    #[must_use]
    pub fn shared_tokens(&self) -> Arc<TokenCell> {
        match &self.tokens {
            Some(cell) => Arc::clone(cell),
            None => TokenCell::new(Tokens::default()),
        }
    }
}

/// Read-mostly provider registry built at setup.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Build and validate every entry; any malformed provider fails setup.
    pub fn build(
        configs: impl IntoIterator<Item = (String, ProviderConfig)>,
        scripts_dir: Option<&Path>,
    ) -> CourierResult<Self> {
        let mut providers = HashMap::new();
        for (id, config) in configs {
            let provider = Provider::build(&id, config, scripts_dir)?;
            providers.insert(id, Arc::new(provider));
        }
        Ok(Self { providers })
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Provider>> {
        self.providers.get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Publish callback, invoked on the job-loop lane exactly once per accepted
/// push.
pub type PublishFn = Arc<dyn Fn(&Tracking, StepResponse, serde_json::Value) + Send + Sync>;

/// Owns the in-flight set and routes completions back to the publisher.
pub struct Dispatcher {
    lanes: Arc<Lanes>,
    cipher: Arc<dyn TokenCipher>,
    log: Arc<dyn JobLogSink>,
    registry: Mutex<Option<Arc<ProviderRegistry>>>,
    entries: Mutex<HashMap<String, Arc<Deferred>>>,
    accepting: AtomicBool,
}

impl Dispatcher {
    #[must_use]
    pub fn new(lanes: Arc<Lanes>, cipher: Arc<dyn TokenCipher>, log: Arc<dyn JobLogSink>) -> Arc<Self> {
        Arc::new(Self {
            lanes,
            cipher,
            log,
            registry: Mutex::new(None),
            entries: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        })
    }

    /// One-shot registry initialization; calling again is a no-op so a
    /// redelivered setup cannot wipe live provider state.
    pub fn setup(
        &self,
        configs: impl IntoIterator<Item = (String, ProviderConfig)>,
        scripts_dir: Option<&Path>,
    ) -> CourierResult<()> {
        let mut slot = self.registry.lock().expect("registry lock poisoned");
        if slot.is_some() {
            debug!("dispatcher already set up, keeping the existing registry");
            return Ok(());
        }
        let registry = ProviderRegistry::build(configs, scripts_dir)?;
        info!(providers = registry.len(), "dispatcher ready");
        *slot = Some(Arc::new(registry));
        Ok(())
    }

    /// Accept one job. Job-loop lane only.
    ///
    /// Fails with `DuplicateRequest` when the correlation id is already in
    /// flight, which is how queue redeliveries are deduplicated.
    pub fn push(
        self: &Arc<Self>,
        tracking: Tracking,
        parameters: Parameters,
        publish: PublishFn,
    ) -> CourierResult<()> {
        Lane::JobLoop.ensure();

        if !self.accepting.load(Ordering::SeqCst) {
            return Err(CourierError::Internal("dispatcher is shutting down".into()));
        }
        let registry = self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .clone()
            .ok_or_else(|| CourierError::Config("dispatcher setup has not run".into()))?;
        let provider = registry.get(&parameters.id).ok_or_else(|| {
            CourierError::BadRequest(format!("unknown provider '{}'", parameters.id))
        })?;

        let rcid = tracking.rcid.clone();
        {
            let entries = self.entries.lock().expect("entries lock poisoned");
            if entries.contains_key(&rcid) {
                return Err(CourierError::DuplicateRequest(rcid));
            }
        }

        let dispatcher = Arc::clone(self);
        let completion_rcid = rcid.clone();
        let callbacks = DeferredCallbacks {
            on_completed: Arc::new(move |tracking: &Tracking, response, shaped| {
                // looper lane; hop home so the map mutation and the publish
                // both run on the job loop
                let dispatcher = Arc::clone(&dispatcher);
                let tracking = tracking.clone();
                let rcid = completion_rcid.clone();
                let publish = Arc::clone(&publish);
                let lanes = Arc::clone(&dispatcher.lanes);
                lanes.job_loop.post(move || {
                    Lane::JobLoop.ensure();
                    let removed =
                        dispatcher.entries.lock().expect("entries lock poisoned").remove(&rcid);
                    if removed.is_none() {
                        warn!(%rcid, "completion for an untracked deferred");
                    }
                    publish(&tracking, response, shaped);
                });
            }),
            on_log_step: {
                let log = Arc::clone(&self.log);
                Arc::new(move |tracking: &Tracking, line: &str| log.log_step(tracking, line))
            },
            on_log_http: {
                let log = Arc::clone(&self.log);
                Arc::new(move |tracking: &Tracking, line: &str| log.log_http(tracking, line))
            },
        };

        let deferred = Deferred::new(
            tracking,
            parameters,
            provider,
            Arc::clone(&self.lanes),
            Arc::clone(&self.cipher),
            callbacks,
        );
        self.entries.lock().expect("entries lock poisoned").insert(rcid, Arc::clone(&deferred));
        deferred.run();
        Ok(())
    }

    /// Stop accepting pushes; in-flight deferreds run to completion or to
    /// their per-step timeouts.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!(in_flight = self.in_flight(), "dispatcher draining");
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.entries.lock().expect("entries lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use courier_domain::{
        GrantConfig, GrantKind, HttpMethod, HttpRequestSpec, OAuth2Endpoints, RequestKind,
        SigningConfig, StoragelessConfig, TmpConfig,
    };
    use tokio::sync::oneshot;

    use super::*;
    use crate::crypto::AesGcmTokenCipher;

    fn storageless_config() -> ProviderConfig {
        ProviderConfig {
            kind: ProviderKind::Storageless,
            oauth2: OAuth2Endpoints {
                authorization_url: "http://127.0.0.1:9/authorize".into(),
                token_url: "http://127.0.0.1:9/token".into(),
                client_id: "cid".into(),
                client_secret: "shh".into(),
                redirect_uri: String::new(),
                scope: String::new(),
            },
            grant: GrantConfig {
                kind: GrantKind::ClientCredentials,
                rfc_6749_strict: false,
                formpost: false,
            },
            headers: BTreeMap::new(),
            headers_per_method: BTreeMap::new(),
            secret_headers: Vec::new(),
            signing: SigningConfig::default(),
            templates: None,
            tmp: TmpConfig::default(),
            storage: None,
            storageless: Some(StoragelessConfig {
                headers: BTreeMap::new(),
                tokens: Tokens {
                    token_type: "Bearer".into(),
                    access: "seed".into(),
                    ..Default::default()
                },
            }),
        }
    }

    fn tracking(rcid: &str) -> Tracking {
        Tracking {
            bjid: 1,
            rjnr: "1".into(),
            rjid: "rj-1".into(),
            rcid: rcid.into(),
            dpi: "dpi".into(),
            ua: "courier-test/1.0".into(),
        }
    }

    fn parameters() -> Parameters {
        Parameters {
            id: "acme".into(),
            data: serde_json::Value::Null,
            primitive: false,
            log_level: 0,
            log_redact: true,
            request: RequestKind::Http(HttpRequestSpec {
                method: HttpMethod::Get,
                url: "http://127.0.0.1:9/unreachable".into(),
                body: String::new(),
                headers: BTreeMap::new(),
                timeouts: Default::default(),
                follow_location: false,
                ssl_do_not_verify_peer: false,
                proxy: String::new(),
                ca_cert: String::new(),
            }),
            response: None,
        }
    }

    fn dispatcher(lanes: &Arc<Lanes>) -> Arc<Dispatcher> {
        Dispatcher::new(
            Arc::clone(lanes),
            Arc::new(AesGcmTokenCipher::new(&[1u8; 32]).unwrap()),
            Arc::new(TracingJobLog),
        )
    }

    #[test]
    fn registry_rejects_malformed_providers() {
        let mut config = storageless_config();
        config.storageless = None;
        let err = ProviderRegistry::build([("acme".to_string(), config)], None).unwrap_err();
        assert!(matches!(err, CourierError::Config(_)));
    }

    #[tokio::test]
    async fn setup_is_idempotent() {
        let lanes = Lanes::start();
        let dispatcher = dispatcher(&lanes);
        dispatcher.setup([("acme".to_string(), storageless_config())], None).unwrap();
        // second call keeps the registry instead of failing or rebuilding
        dispatcher.setup(Vec::new(), None).unwrap();
        let registry = dispatcher.registry.lock().unwrap().clone().unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_rcid_is_rejected_while_in_flight() {
        let lanes = Lanes::start();
        let dispatcher = dispatcher(&lanes);
        dispatcher.setup([("acme".to_string(), storageless_config())], None).unwrap();

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&dispatcher);
        lanes.job_loop.post(move || {
            let publish: PublishFn = Arc::new(|_, _, _| {});
            let first = inner.push(tracking("rc-1"), parameters(), Arc::clone(&publish));
            let second = inner.push(tracking("rc-1"), parameters(), publish);
            let _ = tx.send((first.is_ok(), second));
        });
        let (first, second) = rx.await.unwrap();
        assert!(first);
        assert!(matches!(second, Err(CourierError::DuplicateRequest(_))));
    }

    #[tokio::test]
    async fn unknown_provider_is_a_bad_request() {
        let lanes = Lanes::start();
        let dispatcher = dispatcher(&lanes);
        dispatcher.setup([("acme".to_string(), storageless_config())], None).unwrap();

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&dispatcher);
        lanes.job_loop.post(move || {
            let mut parameters = parameters();
            parameters.id = "nope".into();
            let publish: PublishFn = Arc::new(|_, _, _| {});
            let _ = tx.send(inner.push(tracking("rc-2"), parameters, publish));
        });
        assert!(matches!(rx.await.unwrap(), Err(CourierError::BadRequest(_))));
    }

    #[tokio::test]
    async fn completion_removes_the_entry_and_publishes() {
        let lanes = Lanes::start();
        let dispatcher = dispatcher(&lanes);
        dispatcher.setup([("acme".to_string(), storageless_config())], None).unwrap();

        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let inner = Arc::clone(&dispatcher);
        lanes.job_loop.post(move || {
            let publish: PublishFn = Arc::new(move |_, response: StepResponse, _| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(response.code);
                }
            });
            inner.push(tracking("rc-3"), parameters(), publish).unwrap();
        });

        // the target port is unreachable, so the deferred completes with a
        // synthesized transport failure
        let code = rx.await.unwrap();
        assert_eq!(code, 500);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_pushes() {
        let lanes = Lanes::start();
        let dispatcher = dispatcher(&lanes);
        dispatcher.setup([("acme".to_string(), storageless_config())], None).unwrap();
        dispatcher.shutdown();

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&dispatcher);
        lanes.job_loop.post(move || {
            let publish: PublishFn = Arc::new(|_, _, _| {});
            let _ = tx.send(inner.push(tracking("rc-4"), parameters(), publish));
        });
        assert!(rx.await.unwrap().is_err());
    }
}

//! The job loop: dequeue, validate, push, publish.
//!
//! The queue transport lives behind [`JobSource`] and [`JobPublisher`]; this
//! module owns everything between the two ends - payload validation with the
//! job-level 400, tracking construction, progress events, the publish
//! envelope and cancellation suppression.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courier_core::{Dispatcher, Lanes, PublishFn};
use courier_domain::{
    CourierError, CourierResult, HttpMethod, HttpRequestSpec, JobPayload, Parameters,
    ProgressEvent, PublishEnvelope, RequestKind, StepResponse, Tracking,
};
use tracing::{debug, info, warn};

/// Source side of the queue transport.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Next raw payload from the subscribed tube; `None` once the transport
    /// closes, which drains the worker.
    async fn next_job(&self) -> Option<String>;
}

/// Publish side of the queue transport.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, tube: &str, message: serde_json::Value);
}

/// One worker's job loop.
pub struct JobLoop {
    lanes: Arc<Lanes>,
    dispatcher: Arc<Dispatcher>,
    publisher: Arc<dyn JobPublisher>,
    tube: String,
    user_agent: String,
    sequence: AtomicU64,
    cancelled: Mutex<HashSet<i64>>,
}

impl JobLoop {
    #[must_use]
    pub fn new(
        lanes: Arc<Lanes>,
        dispatcher: Arc<Dispatcher>,
        publisher: Arc<dyn JobPublisher>,
        tube: String,
        user_agent: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            lanes,
            dispatcher,
            publisher,
            tube,
            user_agent,
            sequence: AtomicU64::new(0),
            cancelled: Mutex::new(HashSet::new()),
        })
    }

    /// Consume the source until it closes, then drain the dispatcher.
    pub async fn run(self: Arc<Self>, source: Arc<dyn JobSource>) {
        info!(tube = %self.tube, "job loop subscribed");
        while let Some(raw) = source.next_job().await {
            self.dispatch_raw(raw);
        }
        info!(tube = %self.tube, "job source closed, draining");
        self.dispatcher.shutdown();
    }

    /// Mark a job cancelled: its response, if any, is not published.
    pub fn cancel(&self, id: i64) {
        self.cancelled.lock().expect("cancel set poisoned").insert(id);
    }

    /// Handle one raw payload. Parse and validation failures publish the
    /// job-level 400 instead of reaching the dispatcher.
    pub fn dispatch_raw(self: &Arc<Self>, raw: String) {
        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(tube = %self.tube, "unparseable job payload");
                self.publish_error(0, &CourierError::BadRequest(format!("payload is not JSON: {e}")));
                return;
            }
        };
        let payload: JobPayload = match serde_json::from_value(value.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                self.publish_error(0, &CourierError::BadRequest(format!("malformed payload: {e}")));
                return;
            }
        };
        if let Err(err) = payload.validate() {
            self.publish_error(payload.id, &err);
            return;
        }
        let parameters = match self.build_parameters(&payload, value) {
            Ok(parameters) => parameters,
            Err(err) => {
                self.publish_error(payload.id, &err);
                return;
            }
        };
        let tracking = self.build_tracking(&payload);

        self.publish_event(payload.id, ProgressEvent::in_progress());

        let this = Arc::clone(self);
        let job_id = payload.id;
        self.lanes.job_loop.post(move || {
            let publish: PublishFn = {
                let this = Arc::clone(&this);
                Arc::new(move |tracking: &Tracking, response: StepResponse, shaped| {
                    this.publish_response(tracking, &response, shaped);
                })
            };
            if let Err(err) = this.dispatcher.push(tracking, parameters, publish) {
                this.publish_error(job_id, &err);
            }
        });
    }

    fn build_tracking(&self, payload: &JobPayload) -> Tracking {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Tracking {
            bjid: payload.id,
            rjnr: sequence.to_string(),
            rjid: format!("{}:{}", self.tube, payload.id),
            rcid: format!("{}:{}", self.tube, payload.id),
            dpi: std::process::id().to_string(),
            ua: self.user_agent.clone(),
        }
    }

    fn build_parameters(
        &self,
        payload: &JobPayload,
        raw: serde_json::Value,
    ) -> CourierResult<Parameters> {
        let request = if let Some(grant) = &payload.grant {
            RequestKind::Grant(grant.clone())
        } else {
            let http = payload
                .http
                .as_ref()
                .ok_or_else(|| CourierError::BadRequest("missing 'http' object".into()))?;
            let method = if http.method.is_empty() {
                HttpMethod::Get
            } else {
                HttpMethod::parse(&http.method).map_err(CourierError::BadRequest)?
            };
            let body = match &http.body {
                serde_json::Value::Null => String::new(),
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            RequestKind::Http(HttpRequestSpec {
                method,
                url: http.url.clone(),
                body,
                headers: http.headers.clone(),
                timeouts: http.timeouts.unwrap_or_default(),
                follow_location: http.follow_location,
                ssl_do_not_verify_peer: false,
                proxy: String::new(),
                ca_cert: String::new(),
            })
        };
        Ok(Parameters {
            id: payload.provider_id().to_string(),
            data: raw,
            primitive: payload.primitive,
            log_level: 0,
            log_redact: true,
            request,
            response: payload.response.clone().map(Into::into),
        })
    }

    fn publish_response(
        self: &Arc<Self>,
        tracking: &Tracking,
        response: &StepResponse,
        shaped: serde_json::Value,
    ) {
        if self.cancelled.lock().expect("cancel set poisoned").remove(&tracking.bjid) {
            debug!(bjid = tracking.bjid, "job cancelled, response suppressed");
            return;
        }
        let success = response.code == 200;
        self.publish_message(PublishEnvelope { id: tracking.bjid, body: shaped });
        self.publish_event(tracking.bjid, ProgressEvent::done(success));
    }

    fn publish_error(self: &Arc<Self>, id: i64, err: &CourierError) {
        warn!(%id, error = %err, "job failed before dispatch");
        let body = serde_json::json!({
            "code": err.status_code(),
            "error": err.to_string(),
        });
        self.publish_message(PublishEnvelope { id, body });
        self.publish_event(id, ProgressEvent::done(false));
    }

    fn publish_event(self: &Arc<Self>, id: i64, event: ProgressEvent) {
        let body = serde_json::to_value(event).unwrap_or_default();
        self.publish_message(PublishEnvelope { id, body });
    }

    fn publish_message(self: &Arc<Self>, envelope: PublishEnvelope) {
        let message = match serde_json::to_value(&envelope) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "unpublishable envelope");
                return;
            }
        };
        let publisher = Arc::clone(&self.publisher);
        let tube = self.tube.clone();
        tokio::spawn(async move {
            publisher.publish(&tube, message).await;
        });
    }
}

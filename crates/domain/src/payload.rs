//! Wire shapes exchanged with the job queue.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CourierError;
use crate::parameters::{GrantRequest, Interceptor, ResponseSpec, Timeouts};

/// The `http` object of an inbound job payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadHttp {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Either a JSON object or a plain string.
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub timeouts: Option<Timeouts>,
    #[serde(default)]
    pub follow_location: bool,
}

/// The optional `response` object of an inbound job payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadResponse {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub deflated: bool,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub validity: i64,
    #[serde(default)]
    pub interceptor: Option<Interceptor>,
}

impl From<PayloadResponse> for ResponseSpec {
    fn from(p: PayloadResponse) -> Self {
        Self {
            uri: p.uri,
            url: p.url,
            deflated: p.deflated,
            level: p.level,
            validity: p.validity,
            interceptor: p.interceptor,
        }
    }
}

/// One job as read off the subscribed tube.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub id: i64,
    #[serde(default)]
    pub tube: String,
    #[serde(default)]
    pub ttr: i64,
    #[serde(default)]
    pub validity: i64,
    /// Provider id; defaults to the tube name when absent.
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub http: Option<PayloadHttp>,
    /// Present for OAuth2 grant jobs instead of `http`.
    #[serde(default)]
    pub grant: Option<GrantRequest>,
    #[serde(default)]
    pub response: Option<PayloadResponse>,
    #[serde(default)]
    pub primitive: bool,
}

impl JobPayload {
    /// Validate the minimum surface a proxied HTTP job must carry.
    pub fn validate(&self) -> Result<(), CourierError> {
        if self.grant.is_some() {
            return Ok(());
        }
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| CourierError::BadRequest("missing 'http' object".to_string()))?;
        if http.url.is_empty() {
            return Err(CourierError::BadRequest("missing 'http.url'".to_string()));
        }
        Ok(())
    }

    /// Provider id, falling back to the tube name.
    #[must_use]
    pub fn provider_id(&self) -> &str {
        if self.provider.is_empty() { &self.tube } else { &self.provider }
    }
}

/// Lifecycle step reported while a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStep {
    DoingIt,
    Done,
}

/// Status attached to a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStatus {
    InProgress,
    Completed,
    Failed,
}

/// Progress event published alongside the job response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub step: ProgressStep,
    pub status: ProgressStatus,
}

impl ProgressEvent {
    #[must_use]
    pub fn in_progress() -> Self {
        Self { step: ProgressStep::DoingIt, status: ProgressStatus::InProgress }
    }

    #[must_use]
    pub fn done(success: bool) -> Self {
        Self {
            step: ProgressStep::Done,
            status: if success { ProgressStatus::Completed } else { ProgressStatus::Failed },
        }
    }
}

/// Envelope published back to the queue subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEnvelope {
    #[serde(rename = "__id__")]
    pub id: i64,
    #[serde(flatten)]
    pub body: serde_json::Value,
}

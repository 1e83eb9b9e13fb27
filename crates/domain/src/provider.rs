//! Provider configuration records.
//!
//! The worker receives these already parsed; file formats and deserialization
//! belong to the host. Entries are registered once at setup and never mutated
//! afterwards, with the single exception of a Storageless provider's live
//! token pair, which the registry keeps behind a per-provider mutex.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::parameters::Timeouts;
use crate::tokens::Tokens;

/// Where a provider's tokens live between jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Tokens are persisted via an external HTTP endpoint.
    Storage,
    /// Tokens are kept in process memory for the provider's lifetime.
    Storageless,
}

/// OAuth2 grant flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    ClientCredentials,
    AuthorizationCode,
    /// Authorization-code with the redirect chain followed automatically.
    AuthorizationCodeAuto,
}

impl GrantKind {
    /// Grants that can mint tokens without operator interaction.
    #[must_use]
    pub fn is_self_authorizing(self) -> bool {
        matches!(self, Self::ClientCredentials | Self::AuthorizationCodeAuto)
    }
}

/// Grant execution policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantConfig {
    pub kind: GrantKind,
    /// When false, tolerate vendor extensions in token endpoint responses.
    #[serde(default)]
    pub rfc_6749_strict: bool,
    /// When true, send client credentials as form fields instead of a
    /// `Basic` authorization header.
    #[serde(default)]
    pub formpost: bool,
}

/// OAuth2 client endpoints and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Endpoints {
    pub authorization_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: String,
}

/// Output encoding of signatures produced for scripts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureOutput {
    #[default]
    Base64,
    Hex,
}

/// Opaque signing material handed to the expression evaluator as `$`-visible
/// data, plus the output encoding of the signing host function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(default)]
    pub keys: serde_json::Value,
    #[serde(default)]
    pub output: SignatureOutput,
}

/// Expression templates applied to outbound requests before they run.
///
/// String values are expressions evaluated with `$` bound to the template
/// scope (`$.payload`, `$.data`, plus the provider's signing material);
/// literal strings must be quoted inside the expression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplates {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body template; every string leaf is evaluated as an expression.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl RequestTemplates {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.headers.is_empty() && self.body.is_none()
    }
}

/// Disk cache policy for oversized or reusable response bodies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmpConfig {
    /// Cached file lifetime in seconds.
    #[serde(default)]
    pub validity: i64,
    /// Public base URL under which cached files are served.
    #[serde(default)]
    pub base_url: String,
}

/// Storage-mode settings: how to reach the external token store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Endpoint handling `GET` (load) and `POST` (save) of the token pair.
    pub tokens_endpoint: String,
    /// Opaque arguments echoed to the store, available to templating.
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Storageless-mode settings: the seed token pair and extra headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragelessConfig {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Seed tokens; usually empty so the first job triggers a grant.
    #[serde(default)]
    pub tokens: Tokens,
}

/// One named OAuth2 provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub oauth2: OAuth2Endpoints,
    pub grant: GrantConfig,
    /// Always-on headers for proxied requests.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Method-scoped headers, merged after `headers`.
    #[serde(default)]
    pub headers_per_method: BTreeMap<String, BTreeMap<String, String>>,
    /// Header names scrubbed from logged/traced request lines, in addition
    /// to `Authorization`.
    #[serde(default)]
    pub secret_headers: Vec<String>,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub templates: Option<RequestTemplates>,
    #[serde(default)]
    pub tmp: TmpConfig,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub storageless: Option<StoragelessConfig>,
}

impl ProviderConfig {
    /// Validate that the mode-specific section matching `kind` is present.
    pub fn validate(&self, id: &str) -> Result<(), String> {
        match self.kind {
            ProviderKind::Storage if self.storage.is_none() => {
                Err(format!("provider '{id}': storage section required for storage mode"))
            }
            ProviderKind::Storageless if self.storageless.is_none() => {
                Err(format!("provider '{id}': storageless section required for storageless mode"))
            }
            _ => {
                if self.oauth2.token_url.is_empty() {
                    return Err(format!("provider '{id}': oauth2.token_url must not be empty"));
                }
                Ok(())
            }
        }
    }

    /// Headers for `method`, merging always-on and method-scoped entries.
    #[must_use]
    pub fn headers_for(&self, method: &str) -> BTreeMap<String, String> {
        let mut merged = self.headers.clone();
        if let Some(scoped) = self.headers_per_method.get(method) {
            merged.extend(scoped.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }
}

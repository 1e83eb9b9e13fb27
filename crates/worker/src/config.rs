//! Worker configuration.
//!
//! The host hands the worker a parsed configuration record; this module only
//! defines its shape and the small amount of derivation the worker needs
//! (cipher construction, provider hand-off to the dispatcher).

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use courier_core::crypto::AesGcmTokenCipher;
use courier_domain::{CourierError, CourierResult, ProviderConfig};
use serde::{Deserialize, Serialize};

/// Top-level worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Tube this worker subscribes to.
    pub tube: String,
    /// User-agent attached to every outbound request.
    #[serde(default = "WorkerConfig::default_user_agent")]
    pub user_agent: String,
    /// Directory of evaluator scripts shared by all providers.
    #[serde(default)]
    pub scripts_dir: Option<PathBuf>,
    /// Base64 of the 32-byte token wrapping key.
    #[serde(skip_serializing)]
    pub cipher_key: String,
    /// Provider registry entries, keyed by id.
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl WorkerConfig {
    fn default_user_agent() -> String {
        concat!("courier-worker/", env!("CARGO_PKG_VERSION")).to_string()
    }

    /// Parse from a JSON value the host already loaded.
    pub fn from_value(value: serde_json::Value) -> CourierResult<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| CourierError::Config(format!("invalid worker config: {e}")))?;
        if config.tube.is_empty() {
            return Err(CourierError::Config("tube must not be empty".into()));
        }
        if config.providers.is_empty() {
            return Err(CourierError::Config("at least one provider is required".into()));
        }
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn load(path: &std::path::Path) -> CourierResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CourierError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let value = serde_json::from_str(&text)
            .map_err(|e| CourierError::Config(format!("config is not JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Build the token cipher from the configured key.
    pub fn token_cipher(&self) -> CourierResult<AesGcmTokenCipher> {
        let key = BASE64
            .decode(&self.cipher_key)
            .map_err(|e| CourierError::Config(format!("cipher_key is not base64: {e}")))?;
        AesGcmTokenCipher::new(&key)
    }
}

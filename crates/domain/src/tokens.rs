//! OAuth2 token pair with metadata.

use serde::{Deserialize, Serialize};

/// Access/refresh token pair as held in memory.
///
/// For Storage providers an instance lives only inside the active deferred;
/// for Storageless providers the live copy sits in the provider registry
/// behind a per-provider mutex and is shared across jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    /// Token type, normally `Bearer`.
    #[serde(default)]
    pub token_type: String,
    /// Access token, plaintext while in memory.
    #[serde(default)]
    pub access: String,
    /// Refresh token; empty when the provider does not issue one.
    #[serde(default)]
    pub refresh: String,
    /// Granted scopes, space separated.
    #[serde(default)]
    pub scope: String,
    /// Access token lifetime in seconds; 0 when the endpoint omitted it.
    #[serde(default)]
    pub expires_in: u64,
}

impl Tokens {
    /// True when no access token is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.access.is_empty()
    }

    /// `Authorization` header value for an authenticated request.
    #[must_use]
    pub fn authorization(&self) -> String {
        let token_type =
            if self.token_type.is_empty() { "Bearer" } else { self.token_type.as_str() };
        format!("{token_type} {}", self.access)
    }

    /// Reset to the all-empty state.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

//! Outbound HTTP: the plain client, the OAuth2 wrapper and shared options.

pub mod client;
pub mod oauth2;
pub mod options;

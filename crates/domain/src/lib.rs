//! Data model shared across the Courier crates.
//!
//! Everything in here is plain data: job tracking records, OAuth2 tokens,
//! provider configuration, per-job parameters, step responses and the wire
//! shapes exchanged with the job queue. No I/O lives in this crate.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod error;
pub mod parameters;
pub mod payload;
pub mod provider;
pub mod response;
pub mod tokens;
pub mod tracking;

pub use error::{CourierError, CourierResult};
pub use parameters::{
    GrantRequest, HttpMethod, HttpRequestSpec, Interceptor, Parameters, RequestKind, ResponseSpec,
    StorageRequest, Timeouts,
};
pub use payload::{JobPayload, ProgressEvent, ProgressStatus, ProgressStep, PublishEnvelope};
pub use provider::{
    GrantConfig, GrantKind, OAuth2Endpoints, ProviderConfig, ProviderKind, RequestTemplates,
    SignatureOutput, SigningConfig, StorageConfig, StoragelessConfig, TmpConfig,
};
pub use response::StepResponse;
pub use tokens::Tokens;
pub use tracking::Tracking;

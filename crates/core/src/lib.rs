//! The Courier engine.
//!
//! One deferred instance per in-flight job chains the outbound operations the
//! job needs (load cached tokens, restart the OAuth2 grant, perform the user
//! request, save refreshed tokens) across three serialized execution lanes.
//! The dispatcher owns the set of live deferreds and routes completion back
//! to the job-publishing layer.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod crypto;
pub mod deferred;
pub mod dispatcher;
pub mod eval;
pub mod exec;
pub mod http;
pub mod shaping;

pub use deferred::{Deferred, DeferredCallbacks, Operation};
pub use dispatcher::{
    Dispatcher, JobLogSink, Provider, ProviderRegistry, PublishFn, TracingJobLog,
};
pub use eval::Evaluator;
pub use exec::{Lane, Lanes, SerialExecutor};
pub use http::client::{HttpClient, HttpClientOptions, HttpFailure, HttpFailureKind, HttpValue};
pub use http::oauth2::{OAuth2HttpClient, TokenCell};
pub use http::options::HttpOptions;

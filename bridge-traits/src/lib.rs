//! # Host Bridge Traits
//!
//! Capabilities the session core needs from its host, expressed as traits.
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - Request/response transport to the gateway
//! - [`KeyValueStore`](storage::KeyValueStore) - Durable storage for the session record
//! - [`Clock`](time::Clock) - Wall-clock source for expiry arithmetic
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Implementations
//!
//! | Host    | Crate            |
//! |---------|------------------|
//! | Desktop | `bridge-desktop` |
//!
//! Other hosts inject their own adapters through `SessionConfig`. When a
//! required capability is missing and no default adapter is compiled in,
//! configuration fails with a `CapabilityMissing` error naming the trait.
//!
//! ## Error Handling
//!
//! Every trait reports failures as [`BridgeError`](error::BridgeError).
//! Adapters convert their platform errors into it and keep messages free of
//! credential material.
//!
//! All traits are `Send + Sync` so a single adapter instance can be shared
//! across the session's background tasks.

pub mod error;
pub mod http;
pub mod storage;
pub mod time;

pub use error::BridgeError;

pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use storage::KeyValueStore;
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, SystemClock};

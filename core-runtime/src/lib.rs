//! # Core Runtime
//!
//! Ambient infrastructure shared by the session core:
//! - [`config`]: `SessionConfig` builder with fail-fast bridge validation
//! - [`events`]: broadcast bus for session lifecycle events
//! - [`logging`]: tracing subscriber setup and credential-safe log helpers

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};

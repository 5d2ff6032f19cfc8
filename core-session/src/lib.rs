//! # Session Module
//!
//! Authenticated transport for a GraphQL gateway.
//!
//! ## Overview
//!
//! Attaches the current bearer token to every operation, recovers from
//! authentication failures with a single shared token refresh and replays
//! the failed operations afterwards. Credentials persist across restarts
//! through the host's key-value storage.
//!
//! ## Features
//!
//! - Single-flight refresh: concurrent failures trigger one exchange
//! - Proactive refresh shortly before the access token expires
//! - Forced-logout notification when the session cannot be renewed
//! - Durable session restore on startup

pub mod coordinator;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod refresh;
pub mod scheduler;
pub mod store;
pub mod types;

pub use coordinator::RefreshCoordinator;
pub use error::{RefreshFailure, Result, SessionError};
pub use manager::SessionManager;
pub use pipeline::RequestPipeline;
pub use refresh::{GraphQlRefreshClient, RefreshClient};
pub use scheduler::ProactiveScheduler;
pub use store::{Generation, SessionStore};
pub use types::{
    CredentialBundle, GraphQlError, GraphQlRequest, GraphQlResponse, Identity, Session, TokenGrant,
};

//! Umbrella crate for the gateway client core.
//!
//! Host applications depend on `gateway-client` and pick features instead of
//! wiring each workspace crate individually:
//!
//! - `desktop-shims` (default): inject the reqwest HTTP client and the
//!   file-backed session storage when the host provides none.
//! - `keyring-store`: additionally expose the OS keychain storage adapter.

pub use bridge_traits;
pub use core_runtime;
pub use core_session;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;

pub use core_runtime::config::SessionConfig;
pub use core_runtime::events::{EventBus, SessionEvent};
pub use core_session::{
    CredentialBundle, GraphQlRequest, GraphQlResponse, Identity, Session, SessionError,
    SessionManager,
};

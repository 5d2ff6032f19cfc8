//! # Desktop Bridge Implementations
//!
//! Default adapters for desktop hosts (macOS, Windows, Linux):
//! - [`ReqwestHttpClient`]: `HttpClient` over `reqwest` with rustls
//! - [`FileKeyValueStore`]: `KeyValueStore` persisted as a JSON file in the
//!   platform data directory
//! - [`MemoryKeyValueStore`]: non-durable `KeyValueStore` for tests
//! - [`KeyringKeyValueStore`]: `KeyValueStore` in the OS keychain
//!   (feature `keyring-store`)
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{FileKeyValueStore, ReqwestHttpClient};
//! use std::sync::Arc;
//!
//! let http = Arc::new(ReqwestHttpClient::new()?);
//! let store = Arc::new(FileKeyValueStore::default_location()?);
//! ```

mod file_store;
mod http;
mod memory_store;

#[cfg(feature = "keyring-store")]
mod keyring_store;

pub use file_store::FileKeyValueStore;
pub use http::ReqwestHttpClient;
pub use memory_store::MemoryKeyValueStore;

#[cfg(feature = "keyring-store")]
pub use keyring_store::KeyringKeyValueStore;

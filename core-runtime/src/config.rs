//! # Session Configuration
//!
//! Everything a `SessionManager` needs, assembled with a builder that fails
//! fast on missing host capabilities.
//!
//! ## Required
//!
//! - `gateway_url`: absolute http(s) URL of the GraphQL endpoint
//!
//! ## Host bridges (defaults with `desktop-shims`)
//!
//! - `HttpClient`: desktop default is `ReqwestHttpClient`
//! - `KeyValueStore`: desktop default is a `FileKeyValueStore` at
//!   `<data dir>/gateway-client/session.json`
//! - `Clock`: `SystemClock` everywhere
//!
//! Without `desktop-shims`, a missing bridge is reported as
//! [`Error::CapabilityMissing`] naming the trait to inject.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::SessionConfig;
//! use std::time::Duration;
//!
//! let config = SessionConfig::builder()
//!     .gateway_url("https://gateway.example.com/graphql")
//!     .refresh_margin(Duration::from_secs(120))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, HttpClient, KeyValueStore, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::events::DEFAULT_EVENT_BUFFER_SIZE;

/// Default lead time between the proactive refresh and token expiry.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Default per-request timeout for gateway operations.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// GraphQL error code the gateway uses for a rejected credential.
pub const DEFAULT_AUTH_ERROR_CODE: &str = "UNAUTHENTICATED";

pub const DEFAULT_REFRESH_DOCUMENT: &str = "mutation RefreshToken($refreshToken: String!) { \
     refreshToken(refreshToken: $refreshToken) { accessToken refreshToken expiresAt } }";

pub const DEFAULT_REFRESH_FIELD: &str = "refreshToken";

pub const DEFAULT_IDENTITY_DOCUMENT: &str = "query Me { me { id } }";

pub const DEFAULT_IDENTITY_FIELD: &str = "me";

/// Names of the durable entries that make up a persisted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub access_token: String,
    pub refresh_token: String,
    /// Cached identity and permission summary, stored as JSON
    pub identity: String,
    /// Access token expiry, stored as RFC 3339
    pub expires_at: String,
}

impl StorageKeys {
    /// Same layout with every key prefixed, for hosts sharing one store
    /// between several gateways.
    pub fn prefixed(prefix: &str) -> Self {
        let base = Self::default();
        Self {
            access_token: format!("{}{}", prefix, base.access_token),
            refresh_token: format!("{}{}", prefix, base.refresh_token),
            identity: format!("{}{}", prefix, base.identity),
            expires_at: format!("{}{}", prefix, base.expires_at),
        }
    }

    pub fn all(&self) -> [&str; 4] {
        [
            &self.access_token,
            &self.refresh_token,
            &self.identity,
            &self.expires_at,
        ]
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self {
            access_token: "accessToken".to_string(),
            refresh_token: "refreshToken".to_string(),
            identity: "identity".to_string(),
            expires_at: "expiresAt".to_string(),
        }
    }
}

/// Fully validated session configuration. Build with [`SessionConfig::builder`].
#[derive(Clone)]
pub struct SessionConfig {
    pub gateway_url: Url,
    pub http_client: Arc<dyn HttpClient>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    /// How long before expiry the proactive refresh fires
    pub refresh_margin: Duration,
    pub request_timeout: Duration,
    /// GraphQL `extensions.code` values treated as an authentication failure
    pub auth_error_codes: Vec<String>,
    pub storage_keys: StorageKeys,
    pub refresh_document: String,
    /// Field under `data` holding the refresh result
    pub refresh_field: String,
    pub identity_document: String,
    /// Field under `data` holding the identity record
    pub identity_field: String,
    /// Re-fetch the identity after restoring a stored session
    pub lookup_identity_on_bootstrap: bool,
    pub event_buffer_size: usize,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("gateway_url", &self.gateway_url.as_str())
            .field("http_client", &"HttpClient { ... }")
            .field("store", &"KeyValueStore { ... }")
            .field("refresh_margin", &self.refresh_margin)
            .field("request_timeout", &self.request_timeout)
            .field("auth_error_codes", &self.auth_error_codes)
            .field("storage_keys", &self.storage_keys)
            .field("refresh_field", &self.refresh_field)
            .field("identity_field", &self.identity_field)
            .field(
                "lookup_identity_on_bootstrap",
                &self.lookup_identity_on_bootstrap,
            )
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Whether a GraphQL error code marks the credential as rejected.
    pub fn is_auth_error_code(&self, code: &str) -> bool {
        self.auth_error_codes.iter().any(|c| c == code)
    }

    /// Checks invariants the builder cannot express through types.
    pub fn validate(&self) -> Result<()> {
        match self.gateway_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::Config(format!(
                    "Gateway URL must use http or https, got '{}'",
                    other
                )))
            }
        }

        if self.request_timeout.is_zero() {
            return Err(Error::Config(
                "Request timeout must be greater than zero".to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than zero".to_string(),
            ));
        }

        let keys = self.storage_keys.all();
        if keys.iter().any(|k| k.is_empty()) {
            return Err(Error::Config("Storage keys cannot be empty".to_string()));
        }
        for (i, key) in keys.iter().enumerate() {
            if keys[i + 1..].contains(key) {
                return Err(Error::Config(format!(
                    "Storage key '{}' is used for more than one entry",
                    key
                )));
            }
        }

        for (name, value) in [
            ("refresh_document", &self.refresh_document),
            ("refresh_field", &self.refresh_field),
            ("identity_document", &self.identity_document),
            ("identity_field", &self.identity_field),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} cannot be empty", name)));
            }
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "No HTTP client implementation provided. \
                 Desktop: enable the 'desktop-shims' feature to use ReqwestHttpClient. \
                 Other hosts: inject a platform-native adapter with .http_client()."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "KeyValueStore".to_string(),
        message: "Durable storage is required to persist the session. \
                 Desktop: enable the 'desktop-shims' feature to use FileKeyValueStore. \
                 Other hosts: inject platform storage (Keychain/DataStore/localStorage) with .store()."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new()?);
    Ok(client)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_store() -> Result<Arc<dyn KeyValueStore>> {
    use bridge_desktop::FileKeyValueStore;

    let store: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::default_location()?);
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_store() -> Result<Arc<dyn KeyValueStore>> {
    Err(store_missing_error())
}

/// Builder for [`SessionConfig`].
#[derive(Default)]
pub struct SessionConfigBuilder {
    gateway_url: Option<String>,
    http_client: Option<Arc<dyn HttpClient>>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    refresh_margin: Option<Duration>,
    request_timeout: Option<Duration>,
    auth_error_codes: Option<Vec<String>>,
    storage_keys: Option<StorageKeys>,
    refresh_document: Option<String>,
    refresh_field: Option<String>,
    identity_document: Option<String>,
    identity_field: Option<String>,
    lookup_identity_on_bootstrap: Option<bool>,
    event_buffer_size: Option<usize>,
}

impl SessionConfigBuilder {
    /// Sets the GraphQL endpoint. Required.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::SessionConfig;
    ///
    /// let builder = SessionConfig::builder()
    ///     .gateway_url("https://gateway.example.com/graphql");
    /// ```
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = Some(url.into());
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Durable storage for the session record.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Lead time for the proactive refresh. Defaults to 60 seconds.
    pub fn refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = Some(margin);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Replaces the GraphQL error codes that count as authentication failure.
    pub fn auth_error_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auth_error_codes = Some(codes.into_iter().map(Into::into).collect());
        self
    }

    pub fn storage_keys(mut self, keys: StorageKeys) -> Self {
        self.storage_keys = Some(keys);
        self
    }

    /// Refresh mutation and the `data` field carrying its result.
    pub fn refresh_operation(
        mut self,
        document: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        self.refresh_document = Some(document.into());
        self.refresh_field = Some(field.into());
        self
    }

    /// Identity query and the `data` field carrying the record.
    pub fn identity_operation(
        mut self,
        document: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        self.identity_document = Some(document.into());
        self.identity_field = Some(field.into());
        self
    }

    pub fn lookup_identity_on_bootstrap(mut self, enabled: bool) -> Self {
        self.lookup_identity_on_bootstrap = Some(enabled);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the gateway URL is missing or invalid, or a
    ///   setting fails validation
    /// - [`Error::CapabilityMissing`] if a bridge was not injected and no
    ///   default is compiled in
    pub fn build(self) -> Result<SessionConfig> {
        let raw_url = self.gateway_url.ok_or_else(|| {
            Error::Config("Gateway URL is required. Use .gateway_url() to set it.".to_string())
        })?;
        let gateway_url = Url::parse(&raw_url)
            .map_err(|e| Error::Config(format!("Invalid gateway URL '{}': {}", raw_url, e)))?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let store = match self.store {
            Some(store) => store,
            None => provide_default_store()?,
        };

        let config = SessionConfig {
            gateway_url,
            http_client,
            store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            refresh_margin: self.refresh_margin.unwrap_or(DEFAULT_REFRESH_MARGIN),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            auth_error_codes: self
                .auth_error_codes
                .unwrap_or_else(|| vec![DEFAULT_AUTH_ERROR_CODE.to_string()]),
            storage_keys: self.storage_keys.unwrap_or_default(),
            refresh_document: self
                .refresh_document
                .unwrap_or_else(|| DEFAULT_REFRESH_DOCUMENT.to_string()),
            refresh_field: self
                .refresh_field
                .unwrap_or_else(|| DEFAULT_REFRESH_FIELD.to_string()),
            identity_document: self
                .identity_document
                .unwrap_or_else(|| DEFAULT_IDENTITY_DOCUMENT.to_string()),
            identity_field: self
                .identity_field
                .unwrap_or_else(|| DEFAULT_IDENTITY_FIELD.to_string()),
            lookup_identity_on_bootstrap: self.lookup_identity_on_bootstrap.unwrap_or(true),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;
        Ok(config)
    }
}

//! # Session Manager
//!
//! The entry point host applications use. It wires the session store, the
//! refresh coordinator, the proactive scheduler and the request pipeline
//! from one [`SessionConfig`] and emits [`SessionEvent`]s as the session
//! changes.
//!
//! ## Usage
//!
//! ```no_run
//! use core_runtime::config::SessionConfig;
//! use core_session::{GraphQlRequest, SessionManager};
//! use serde_json::Value;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::builder()
//!     .gateway_url("https://gateway.example.com/graphql")
//!     .build()?;
//! let manager = SessionManager::new(config);
//!
//! let mut forced = manager.forced_logouts();
//! tokio::spawn(async move {
//!     while let Ok(event) = forced.recv().await {
//!         eprintln!("{}", event.description());
//!     }
//! });
//!
//! manager.bootstrap().await?;
//! let listings: Value = manager
//!     .execute(&GraphQlRequest::new("query { listings { id } }"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use core_runtime::config::SessionConfig;
use core_runtime::events::{EventBus, EventStream, RefreshTrigger, SessionEvent};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::broadcast::Receiver;
use tracing::{debug, info, instrument, warn};

use crate::coordinator::RefreshCoordinator;
use crate::error::{Result, SessionError};
use crate::pipeline::RequestPipeline;
use crate::refresh::{GraphQlRefreshClient, RefreshClient};
use crate::scheduler::ProactiveScheduler;
use crate::store::SessionStore;
use crate::types::{CredentialBundle, GraphQlRequest, GraphQlResponse, Identity, Session};

pub struct SessionManager {
    store: Arc<SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
    scheduler: Arc<ProactiveScheduler>,
    pipeline: RequestPipeline,
    events: EventBus,
    identity_document: String,
    identity_field: String,
    lookup_identity_on_bootstrap: bool,
}

impl SessionManager {
    /// Creates a manager that refreshes through the configured GraphQL
    /// mutation.
    pub fn new(config: SessionConfig) -> Self {
        let client = Arc::new(GraphQlRefreshClient::from_config(&config));
        Self::with_refresh_client(config, client)
    }

    /// Creates a manager with a custom token exchange.
    pub fn with_refresh_client(config: SessionConfig, client: Arc<dyn RefreshClient>) -> Self {
        let events = EventBus::new(config.event_buffer_size);
        let store = Arc::new(SessionStore::new(
            Arc::clone(&config.store),
            config.storage_keys.clone(),
        ));
        let scheduler = Arc::new(ProactiveScheduler::new(
            config.refresh_margin,
            Arc::clone(&config.clock),
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&store),
            client,
            Arc::clone(&scheduler),
            events.clone(),
        ));
        let pipeline = RequestPipeline::new(&config, Arc::clone(&store), Arc::clone(&coordinator));

        Self {
            store,
            coordinator,
            scheduler,
            pipeline,
            events,
            identity_document: config.identity_document,
            identity_field: config.identity_field,
            lookup_identity_on_bootstrap: config.lookup_identity_on_bootstrap,
        }
    }

    /// Install credentials obtained from a sign-in.
    ///
    /// # Errors
    ///
    /// [`SessionError::Storage`] if the credentials cannot be persisted; the
    /// previous session is then kept.
    #[instrument(skip_all)]
    pub async fn login(&self, bundle: CredentialBundle) -> Result<Arc<CredentialBundle>> {
        // Operations queued under the previous session must not be replayed
        // with these credentials.
        self.coordinator.abort(SessionError::SessionEnded);
        let bundle = self.store.login(bundle).await?;
        self.scheduler
            .arm(&bundle, Arc::downgrade(&self.coordinator));
        let _ = self.events.emit(SessionEvent::SignedIn {
            expires_at: bundle.expires_at(),
        });
        info!(expires_at = %bundle.expires_at(), "Signed in");
        Ok(bundle)
    }

    /// End the session. Idempotent.
    ///
    /// Operations waiting on a refresh are rejected with
    /// [`SessionError::SessionEnded`]. Returns whether a session was ended.
    #[instrument(skip_all)]
    pub async fn logout(&self) -> bool {
        self.coordinator.abort(SessionError::SessionEnded);
        self.scheduler.cancel();

        let ended = self.store.logout().await;
        // An episode that won the write lock may have armed meanwhile.
        self.coordinator.abort(SessionError::SessionEnded);
        self.scheduler.cancel();

        if ended {
            let _ = self.events.emit(SessionEvent::SignedOut);
            info!("Signed out");
        }
        ended
    }

    pub fn current(&self) -> Session {
        self.store.current()
    }

    /// Restore the persisted session, if any.
    ///
    /// Arms the proactive refresh and, when enabled, refreshes the cached
    /// identity through the gateway. A failed lookup keeps the cached
    /// identity unless it ended the session.
    ///
    /// # Errors
    ///
    /// [`SessionError::Storage`] if the durable store cannot be read.
    #[instrument(skip_all)]
    pub async fn bootstrap(&self) -> Result<Option<Arc<CredentialBundle>>> {
        let Some(bundle) = self.store.bootstrap().await? else {
            return Ok(None);
        };

        self.scheduler
            .arm(&bundle, Arc::downgrade(&self.coordinator));
        let _ = self.events.emit(SessionEvent::SessionRestored {
            expires_at: bundle.expires_at(),
        });

        if self.lookup_identity_on_bootstrap {
            match self.lookup_identity().await {
                Ok(_) => {}
                Err(e) if e.requires_login() => {
                    warn!(error = %e, "Restored session is no longer valid");
                }
                Err(e) => {
                    warn!(error = %e, "Identity lookup failed; keeping cached identity");
                }
            }
        }

        Ok(self.store.current().bundle().cloned())
    }

    /// Send a GraphQL operation with automatic refresh and replay.
    pub async fn send(&self, operation: &GraphQlRequest) -> Result<GraphQlResponse> {
        self.pipeline.send(operation).await
    }

    /// Send an operation and deserialize its `data`.
    ///
    /// GraphQL errors in the response become [`SessionError::GraphQl`].
    pub async fn execute<T: DeserializeOwned>(&self, operation: &GraphQlRequest) -> Result<T> {
        self.send(operation).await?.into_data()
    }

    /// Refresh now regardless of expiry, joining a refresh already running.
    pub async fn refresh_now(&self) -> Result<Arc<CredentialBundle>> {
        self.coordinator
            .request_refresh(None, RefreshTrigger::Manual)
            .await
    }

    /// Fetch the signed-in user's identity and cache it on the session.
    ///
    /// # Errors
    ///
    /// Any error of [`send`](Self::send), [`SessionError::GraphQl`] if the
    /// query returned errors, or [`SessionError::Serialization`] if the
    /// identity field is missing.
    #[instrument(skip(self))]
    pub async fn lookup_identity(&self) -> Result<Identity> {
        let (_, generation) = self.store.snapshot();

        let response = self
            .send(&GraphQlRequest::new(self.identity_document.clone()))
            .await?;
        if response.has_errors() {
            return Err(SessionError::GraphQl(response.errors));
        }

        let value = response
            .field(&self.identity_field)
            .filter(|value| !value.is_null())
            .cloned()
            .ok_or_else(|| {
                SessionError::Serialization(format!("missing data.{}", self.identity_field))
            })?;
        let identity = Identity::new(value);

        match self.store.update_identity(generation, identity.clone()).await {
            Some(_) => {
                let _ = self.events.emit(SessionEvent::IdentityUpdated);
                debug!("Identity updated");
            }
            None => debug!("Session changed during identity lookup; not caching"),
        }
        Ok(identity)
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stream of [`SessionEvent::ForcedLogout`] only, for hosts that route
    /// the user back to sign-in.
    pub fn forced_logouts(&self) -> EventStream {
        EventStream::new(self.events.subscribe()).filter(SessionEvent::is_forced_logout)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// When the proactive refresh will fire, if armed.
    pub fn next_refresh_at(&self) -> Option<DateTime<Utc>> {
        self.scheduler.next_fire_at()
    }

    pub fn is_refreshing(&self) -> bool {
        self.coordinator.is_refreshing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RefreshFailure;
    use crate::refresh::MockRefreshClient;
    use crate::types::TokenGrant;
    use async_trait::async_trait;
    use bridge_desktop::MemoryKeyValueStore;
    use bridge_traits::{BridgeError, HttpClient, HttpRequest, HttpResponse};
    use serde_json::json;

    struct OfflineHttp;

    #[async_trait]
    impl HttpClient for OfflineHttp {
        async fn execute(&self, _request: HttpRequest) -> bridge_traits::error::Result<HttpResponse> {
            Err(BridgeError::NotAvailable("offline".to_string()))
        }
    }

    fn manager(client: MockRefreshClient, backend: Arc<MemoryKeyValueStore>) -> SessionManager {
        let config = SessionConfig::builder()
            .gateway_url("https://gateway.example.com/graphql")
            .http_client(Arc::new(OfflineHttp))
            .store(backend)
            .build()
            .unwrap();
        SessionManager::with_refresh_client(config, Arc::new(client))
    }

    fn bundle() -> CredentialBundle {
        CredentialBundle::new(
            "at-1",
            "rt-1",
            Utc::now() + chrono::Duration::minutes(5),
            Identity::new(json!({ "id": "u-1" })),
        )
    }

    #[tokio::test]
    async fn test_login_arms_and_emits() {
        let manager = manager(MockRefreshClient::new(), Arc::new(MemoryKeyValueStore::new()));
        let mut rx = manager.subscribe();

        manager.login(bundle()).await.unwrap();

        assert_eq!(manager.current().access_token(), Some("at-1"));
        assert!(manager.next_refresh_at().is_some());
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::SignedIn { .. }
        ));
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let backend = Arc::new(MemoryKeyValueStore::new());
        let manager = manager(MockRefreshClient::new(), backend.clone());
        let mut rx = manager.subscribe();

        manager.login(bundle()).await.unwrap();
        assert!(manager.logout().await);
        assert!(!manager.logout().await);

        assert!(!manager.current().is_active());
        assert!(manager.next_refresh_at().is_none());
        assert!(backend.is_empty());

        let mut signed_out = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::SignedOut) {
                signed_out += 1;
            }
        }
        assert_eq!(signed_out, 1);
    }

    #[tokio::test]
    async fn test_refresh_now_uses_manual_trigger() {
        let mut client = MockRefreshClient::new();
        client.expect_refresh().times(1).returning(|_| {
            Ok(TokenGrant {
                access_token: "at-2".to_string(),
                refresh_token: "rt-2".to_string(),
                expires_at: Utc::now() + chrono::Duration::minutes(15),
            })
        });
        let manager = manager(client, Arc::new(MemoryKeyValueStore::new()));
        manager.login(bundle()).await.unwrap();
        let mut rx = manager.subscribe();

        let renewed = manager.refresh_now().await.unwrap();
        assert_eq!(renewed.access_token(), "at-2");
        assert_eq!(renewed.identity().field("id"), Some(&json!("u-1")));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::TokenRefreshing {
                trigger: RefreshTrigger::Manual
            }
        ));
    }

    #[tokio::test]
    async fn test_forced_logouts_stream_filters() {
        let mut client = MockRefreshClient::new();
        client
            .expect_refresh()
            .times(1)
            .returning(|_| Err(RefreshFailure::Rejected("revoked".into())));
        let manager = manager(client, Arc::new(MemoryKeyValueStore::new()));
        manager.login(bundle()).await.unwrap();
        let mut forced = manager.forced_logouts();

        assert!(manager.refresh_now().await.is_err());

        let event = forced.recv().await.unwrap();
        assert!(event.is_forced_logout());
        assert!(forced.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_keeps_identity_when_lookup_fails() {
        let backend = Arc::new(MemoryKeyValueStore::new());
        {
            let first = manager(MockRefreshClient::new(), backend.clone());
            first.login(bundle()).await.unwrap();
        }

        let second = manager(MockRefreshClient::new(), backend);
        let restored = second.bootstrap().await.unwrap().unwrap();
        assert_eq!(restored.access_token(), "at-1");
        assert_eq!(restored.identity().field("id"), Some(&json!("u-1")));
    }
}

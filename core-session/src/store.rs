//! The single source of truth for the current session.
//!
//! Reads are synchronous and never wait on I/O. Writes go through one async
//! lock that is held across persistence and the in-memory swap, so the
//! durable record and the in-memory session never disagree about which
//! write happened last.

use bridge_traits::{BridgeError, KeyValueStore};
use chrono::{DateTime, Utc};
use core_runtime::config::StorageKeys;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SessionError};
use crate::types::{CredentialBundle, Identity, Session, TokenGrant};

/// Monotonic counter bumped whenever a session starts or ends.
///
/// Refreshes and identity updates keep it. A write conditioned on a stale
/// generation belongs to a session that no longer exists and is dropped.
pub type Generation = u64;

#[derive(Default)]
struct Slot {
    generation: Generation,
    session: Session,
}

pub struct SessionStore {
    backend: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    slot: RwLock<Slot>,
    write_lock: Mutex<()>,
}

fn storage_error(e: BridgeError) -> SessionError {
    SessionError::Storage(e.to_string())
}

impl SessionStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, keys: StorageKeys) -> Self {
        Self {
            backend,
            keys,
            slot: RwLock::new(Slot::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// The current session. Never blocks on I/O.
    pub fn current(&self) -> Session {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .session
            .clone()
    }

    /// The current session together with its generation, read atomically.
    pub fn snapshot(&self) -> (Session, Generation) {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        (slot.session.clone(), slot.generation)
    }

    fn install(&self, session: Session, bump: bool) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if bump {
            slot.generation += 1;
        }
        slot.session = session;
    }

    fn generation(&self) -> Generation {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    fn encode(&self, bundle: &CredentialBundle) -> Result<Vec<(String, String)>> {
        Ok(vec![
            (
                self.keys.access_token.clone(),
                bundle.access_token().to_string(),
            ),
            (
                self.keys.refresh_token.clone(),
                bundle.refresh_token().to_string(),
            ),
            (
                self.keys.identity.clone(),
                serde_json::to_string(bundle.identity())?,
            ),
            (self.keys.expires_at.clone(), bundle.expires_at().to_rfc3339()),
        ])
    }

    async fn persist(&self, bundle: &CredentialBundle) -> Result<()> {
        let entries = self.encode(bundle)?;
        self.backend
            .set_many(&entries)
            .await
            .map_err(storage_error)
    }

    async fn erase(&self) -> Result<()> {
        let keys: Vec<String> = self.keys.all().iter().map(|k| k.to_string()).collect();
        self.backend.remove_many(&keys).await.map_err(storage_error)
    }

    /// Persist `bundle` and make it the active session.
    ///
    /// # Errors
    ///
    /// [`SessionError::Storage`] if persisting fails; the session is then
    /// left as it was.
    #[instrument(skip_all)]
    pub async fn login(&self, bundle: CredentialBundle) -> Result<Arc<CredentialBundle>> {
        let _guard = self.write_lock.lock().await;

        self.persist(&bundle).await?;

        let bundle = Arc::new(bundle);
        self.install(Session::Active(Arc::clone(&bundle)), true);
        info!(expires_at = %bundle.expires_at(), "Session installed");
        Ok(bundle)
    }

    /// End the session and erase the durable record.
    ///
    /// Idempotent. Returns whether a session was actually ended. The
    /// in-memory session is always cleared; an erase failure is logged.
    #[instrument(skip_all)]
    pub async fn logout(&self) -> bool {
        let _guard = self.write_lock.lock().await;

        let was_active = self.current().is_active();
        self.install(Session::Empty, true);

        if let Err(e) = self.erase().await {
            error!(error = %e, "Failed to erase stored session");
        }

        if was_active {
            info!("Session cleared");
        }
        was_active
    }

    /// Conditional logout used when the session cannot be renewed.
    ///
    /// Clears only if `generation` is still current and a session is
    /// active. Exactly one caller per session can observe `true`.
    pub async fn clear_if(&self, generation: Generation) -> bool {
        let _guard = self.write_lock.lock().await;

        let (session, current) = self.snapshot();
        if current != generation || !session.is_active() {
            debug!(generation, current, "Skipping clear for a session that already ended");
            return false;
        }

        self.install(Session::Empty, true);
        if let Err(e) = self.erase().await {
            error!(error = %e, "Failed to erase stored session");
        }
        true
    }

    /// Clear the session only if it still holds `access_token`.
    pub async fn clear_if_token(&self, access_token: &str) -> bool {
        let generation = {
            let (session, generation) = self.snapshot();
            if session.access_token() != Some(access_token) {
                return false;
            }
            generation
        };
        self.clear_if(generation).await
    }

    /// Install the result of a refresh, if the session it was started for
    /// is still current.
    ///
    /// The grant is applied to the bundle current at install time, so an
    /// identity update that landed during the refresh is kept. A persist
    /// failure is logged and the bundle is installed anyway: the previous
    /// refresh token may already be spent.
    pub async fn replace_if(
        &self,
        generation: Generation,
        grant: TokenGrant,
    ) -> Option<Arc<CredentialBundle>> {
        let _guard = self.write_lock.lock().await;

        let (session, current) = self.snapshot();
        let existing = match session {
            Session::Active(bundle) if current == generation => bundle,
            _ => {
                debug!(generation, current, "Discarding refresh result for a session that ended");
                return None;
            }
        };

        let renewed = existing.renewed(grant);
        if let Err(e) = self.persist(&renewed).await {
            warn!(error = %e, "Failed to persist refreshed credentials; keeping them in memory");
        }

        let renewed = Arc::new(renewed);
        self.install(Session::Active(Arc::clone(&renewed)), false);
        Some(renewed)
    }

    /// Replace the cached identity of the session identified by `generation`.
    pub async fn update_identity(
        &self,
        generation: Generation,
        identity: Identity,
    ) -> Option<Arc<CredentialBundle>> {
        let _guard = self.write_lock.lock().await;

        let (session, current) = self.snapshot();
        let existing = match session {
            Session::Active(bundle) if current == generation => bundle,
            _ => return None,
        };

        match serde_json::to_string(&identity) {
            Ok(encoded) => {
                if let Err(e) = self.backend.set_string(&self.keys.identity, &encoded).await {
                    warn!(error = %e, "Failed to persist identity; keeping it in memory");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode identity"),
        }

        let updated = Arc::new(existing.with_identity(identity));
        self.install(Session::Active(Arc::clone(&updated)), false);
        Some(updated)
    }

    /// Load the persisted session without contacting the gateway.
    ///
    /// Returns `Ok(None)` when nothing usable is stored. A partial or
    /// unreadable record is erased. If a session is already installed it is
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// [`SessionError::Storage`] when the backend cannot be read.
    #[instrument(skip_all)]
    pub async fn bootstrap(&self) -> Result<Option<Arc<CredentialBundle>>> {
        let _guard = self.write_lock.lock().await;

        if let Session::Active(bundle) = self.current() {
            return Ok(Some(bundle));
        }

        let access = self.read(&self.keys.access_token).await?;
        let refresh = self.read(&self.keys.refresh_token).await?;
        let identity = self.read(&self.keys.identity).await?;
        let expires_at = self.read(&self.keys.expires_at).await?;

        let (access, refresh) = match (access, refresh) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                (access, refresh)
            }
            (None, None) if identity.is_none() && expires_at.is_none() => {
                debug!("No stored session");
                return Ok(None);
            }
            _ => {
                self.discard_corrupt("incomplete token pair").await;
                return Ok(None);
            }
        };

        let identity = match identity {
            None => Identity::empty(),
            Some(raw) => match serde_json::from_str::<Identity>(&raw) {
                Ok(identity) => identity,
                Err(e) => {
                    self.discard_corrupt(&format!("unreadable identity: {}", e))
                        .await;
                    return Ok(None);
                }
            },
        };

        let expires_at = expires_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| {
                warn!("Stored session has no usable expiry; treating it as expired");
                DateTime::<Utc>::MIN_UTC
            });

        let bundle = Arc::new(CredentialBundle::new(access, refresh, expires_at, identity));
        self.install(Session::Active(Arc::clone(&bundle)), true);
        info!(expires_at = %bundle.expires_at(), generation = self.generation(), "Session restored");
        Ok(Some(bundle))
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        self.backend.get_string(key).await.map_err(storage_error)
    }

    async fn discard_corrupt(&self, reason: &str) {
        warn!(reason, "Stored session is corrupt; erasing it");
        if let Err(e) = self.erase().await {
            error!(error = %e, "Failed to erase corrupt session");
        }
    }
}

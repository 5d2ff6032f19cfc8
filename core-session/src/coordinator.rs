//! Single-flight token refresh.
//!
//! However many operations fail authentication at the same time, at most one
//! refresh exchange runs. Callers arriving while it runs are queued and all
//! receive the same outcome.
//!
//! ```text
//!            ensure_fresh_token                 episode task
//!  Idle ─────────────────────────> InFlight ───────────────────> Idle
//!                                  (waiters)    resolve/reject all
//! ```
//!
//! The state lives behind a synchronous mutex that is never held across an
//! `.await`, so the check-and-transition is atomic with respect to every
//! other caller.

use core_runtime::events::{EventBus, RefreshTrigger, SessionEvent};
use core_runtime::logging::token_fingerprint;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::refresh::RefreshClient;
use crate::scheduler::ProactiveScheduler;
use crate::store::{Generation, SessionStore};
use crate::types::{CredentialBundle, Session};

type Waiter = oneshot::Sender<Result<Arc<CredentialBundle>>>;

enum RefreshState {
    Idle,
    InFlight { episode: u64, waiters: Vec<Waiter> },
}

struct Inner {
    state: RefreshState,
    next_episode: u64,
}

/// What a caller got when asking for a fresh token.
enum Admission {
    Ready(Result<Arc<CredentialBundle>>),
    Queued(oneshot::Receiver<Result<Arc<CredentialBundle>>>),
    Started {
        receiver: oneshot::Receiver<Result<Arc<CredentialBundle>>>,
        episode: u64,
        generation: Generation,
        bundle: Arc<CredentialBundle>,
    },
}

pub struct RefreshCoordinator {
    store: Arc<SessionStore>,
    client: Arc<dyn RefreshClient>,
    scheduler: Arc<ProactiveScheduler>,
    events: EventBus,
    inner: Mutex<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        client: Arc<dyn RefreshClient>,
        scheduler: Arc<ProactiveScheduler>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            client,
            scheduler,
            events,
            inner: Mutex::new(Inner {
                state: RefreshState::Idle,
                next_episode: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a refresh episode is running.
    pub fn is_refreshing(&self) -> bool {
        matches!(self.lock().state, RefreshState::InFlight { .. })
    }

    /// Number of callers waiting on the running episode.
    pub fn waiter_count(&self) -> usize {
        match &self.lock().state {
            RefreshState::InFlight { waiters, .. } => waiters.len(),
            RefreshState::Idle => 0,
        }
    }

    /// Obtain a usable credential bundle after `attempted` was rejected.
    ///
    /// - A refresh already running: wait for its outcome.
    /// - No session: [`SessionError::NotAuthenticated`].
    /// - `attempted` is no longer the current access token: someone already
    ///   refreshed, so the current bundle is returned without a new exchange.
    /// - Otherwise a new episode starts and this caller waits on it.
    ///
    /// `None` for `attempted` always refreshes unless an episode is running.
    pub async fn ensure_fresh_token(
        self: &Arc<Self>,
        attempted: Option<&str>,
    ) -> Result<Arc<CredentialBundle>> {
        self.request_refresh(attempted, RefreshTrigger::Reactive)
            .await
    }

    pub(crate) async fn request_refresh(
        self: &Arc<Self>,
        attempted: Option<&str>,
        trigger: RefreshTrigger,
    ) -> Result<Arc<CredentialBundle>> {
        let receiver = match self.admit(attempted) {
            Admission::Ready(result) => return result,
            Admission::Queued(receiver) => {
                debug!(?trigger, "Refresh in flight; queued");
                receiver
            }
            Admission::Started {
                receiver,
                episode,
                generation,
                bundle,
            } => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.run_episode(episode, generation, bundle, trigger).await;
                });
                receiver
            }
        };

        // A dropped sender means the episode was abandoned by logout.
        receiver.await.unwrap_or(Err(SessionError::SessionEnded))
    }

    fn admit(&self, attempted: Option<&str>) -> Admission {
        let mut inner = self.lock();

        if let RefreshState::InFlight { waiters, .. } = &mut inner.state {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            return Admission::Queued(rx);
        }

        let (session, generation) = self.store.snapshot();
        let bundle = match session {
            Session::Active(bundle) => bundle,
            Session::Empty => return Admission::Ready(Err(SessionError::NotAuthenticated)),
        };

        if let Some(attempted) = attempted {
            if bundle.access_token() != attempted {
                debug!(
                    attempted = %token_fingerprint(attempted),
                    current = %token_fingerprint(bundle.access_token()),
                    "Token already rotated; no refresh needed"
                );
                return Admission::Ready(Ok(bundle));
            }
        }

        let episode = inner.next_episode;
        inner.next_episode += 1;
        let (tx, rx) = oneshot::channel();
        inner.state = RefreshState::InFlight {
            episode,
            waiters: vec![tx],
        };

        Admission::Started {
            receiver: rx,
            episode,
            generation,
            bundle,
        }
    }

    async fn run_episode(
        self: Arc<Self>,
        episode: u64,
        generation: Generation,
        bundle: Arc<CredentialBundle>,
        trigger: RefreshTrigger,
    ) {
        info!(episode, ?trigger, "Refreshing access token");
        let _ = self.events.emit(SessionEvent::TokenRefreshing { trigger });

        let result = match self.client.refresh(bundle.refresh_token()).await {
            Ok(grant) => match self.store.replace_if(generation, grant).await {
                Some(renewed) => {
                    if self.arm_if_current(episode, &renewed) {
                        let _ = self.events.emit(SessionEvent::TokenRefreshed {
                            expires_at: renewed.expires_at(),
                        });
                        info!(
                            episode,
                            token = %token_fingerprint(renewed.access_token()),
                            expires_at = %renewed.expires_at(),
                            "Access token refreshed"
                        );
                    }
                    Ok(renewed)
                }
                None => Err(SessionError::SessionEnded),
            },
            Err(failure) => {
                warn!(episode, error = %failure, "Token refresh failed");
                // Clear before going Idle so nobody can start another
                // refresh with the dead token.
                if self.store.clear_if(generation).await {
                    self.scheduler.cancel();
                    let _ = self.events.emit(SessionEvent::ForcedLogout {
                        reason: failure.to_string(),
                    });
                    warn!(episode, "Session ended after failed refresh");
                    Err(SessionError::from(failure))
                } else {
                    Err(SessionError::SessionEnded)
                }
            }
        };

        self.finish(episode, result);
    }

    /// Arm the proactive timer for `renewed` if `episode` is still the
    /// running one.
    ///
    /// Holds the state lock while arming, so an `abort` either happens first
    /// and nothing is armed, or happens after and its caller can cancel.
    fn arm_if_current(self: &Arc<Self>, episode: u64, renewed: &CredentialBundle) -> bool {
        let inner = self.lock();
        match &inner.state {
            RefreshState::InFlight { episode: current, .. } if *current == episode => {
                self.scheduler.arm(renewed, Arc::downgrade(self));
                true
            }
            _ => {
                debug!(episode, "Episode abandoned while installing; not arming");
                false
            }
        }
    }

    /// Deliver the result of `episode` to its waiters and return to Idle.
    ///
    /// No-op if the episode was already aborted.
    fn finish(&self, episode: u64, result: Result<Arc<CredentialBundle>>) {
        let waiters = {
            let mut inner = self.lock();
            match &inner.state {
                RefreshState::InFlight { episode: current, .. } if *current == episode => {
                    match mem::replace(&mut inner.state, RefreshState::Idle) {
                        RefreshState::InFlight { waiters, .. } => waiters,
                        RefreshState::Idle => Vec::new(),
                    }
                }
                _ => {
                    debug!(episode, "Episode was abandoned; dropping its result");
                    return;
                }
            }
        };

        debug!(episode, waiters = waiters.len(), ok = result.is_ok(), "Releasing waiters");
        for waiter in waiters {
            // The caller may have given up; that is fine.
            let _ = waiter.send(result.clone());
        }
    }

    /// Reject every queued caller with `error` and return to Idle.
    ///
    /// A running exchange is left to finish; its result is discarded.
    pub fn abort(&self, error: SessionError) {
        let waiters = {
            let mut inner = self.lock();
            match mem::replace(&mut inner.state, RefreshState::Idle) {
                RefreshState::InFlight { episode, waiters } => {
                    debug!(episode, waiters = waiters.len(), "Aborting refresh episode");
                    waiters
                }
                RefreshState::Idle => return,
            }
        };

        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// End the session because `rejected_token` failed even after a refresh.
    ///
    /// Only clears if the session still holds that token. Returns whether
    /// this call ended the session.
    pub async fn invalidate(&self, rejected_token: &str) -> bool {
        if !self.store.clear_if_token(rejected_token).await {
            return false;
        }

        let reason = "refreshed credentials were rejected".to_string();
        warn!(token = %token_fingerprint(rejected_token), "{}", reason);
        self.scheduler.cancel();
        let _ = self.events.emit(SessionEvent::ForcedLogout {
            reason: reason.clone(),
        });
        self.abort(SessionError::RefreshFailed(reason));
        true
    }
}

//! # Event Bus System
//!
//! Session lifecycle notifications over `tokio::sync::broadcast`.
//!
//! The session core never navigates or touches UI. Instead it publishes
//! [`SessionEvent`]s here and the host decides what to do, e.g. route to the
//! login screen on [`SessionEvent::ForcedLogout`].
//!
//! ```text
//! ┌────────────────────┐   emit    ┌────────────┐  subscribe  ┌───────────┐
//! │ SessionManager     ├──────────>│            ├────────────>│ Host UI   │
//! └────────────────────┘           │  EventBus  │             └───────────┘
//! ┌────────────────────┐   emit    │ (broadcast)│  subscribe  ┌───────────┐
//! │ RefreshCoordinator ├──────────>│            ├────────────>│ Audit log │
//! └────────────────────┘           └────────────┘             └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{EventBus, SessionEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(SessionEvent::SignedOut).ok();
//! assert_eq!(rx.recv().await.unwrap(), SessionEvent::SignedOut);
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; it can keep
//!   receiving.
//! - **`RecvError::Closed`**: every sender is gone, i.e. the manager was dropped.
//!
//! `emit` fails only when nobody is subscribed. Publishers ignore that case.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// What started a token refresh.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
    /// An operation was rejected as unauthenticated.
    Reactive,
    /// The scheduler fired ahead of expiry.
    Proactive,
    /// The host asked for it via `refresh_now`.
    Manual,
}

/// Session lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SessionEvent {
    /// A new session was installed by an explicit login.
    SignedIn {
        expires_at: DateTime<Utc>,
    },
    /// A persisted session was loaded at startup.
    SessionRestored {
        expires_at: DateTime<Utc>,
    },
    /// The user logged out.
    SignedOut,
    /// A refresh episode started.
    TokenRefreshing {
        trigger: RefreshTrigger,
    },
    /// A refreshed credential bundle was installed.
    TokenRefreshed {
        expires_at: DateTime<Utc>,
    },
    /// The cached identity was replaced by a fresh lookup.
    IdentityUpdated,
    /// The session was ended because it could not be renewed.
    ///
    /// Emitted exactly once per dead session, however many operations were
    /// waiting on the failed refresh.
    ForcedLogout {
        reason: String,
    },
}

impl SessionEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            SessionEvent::SignedIn { .. } => "User signed in",
            SessionEvent::SessionRestored { .. } => "Session restored from storage",
            SessionEvent::SignedOut => "User signed out",
            SessionEvent::TokenRefreshing { .. } => "Refreshing access token",
            SessionEvent::TokenRefreshed { .. } => "Access token refreshed",
            SessionEvent::IdentityUpdated => "User identity updated",
            SessionEvent::ForcedLogout { .. } => "Session ended: re-authentication required",
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            SessionEvent::ForcedLogout { .. } => EventSeverity::Warning,
            SessionEvent::SignedIn { .. }
            | SessionEvent::SessionRestored { .. }
            | SessionEvent::SignedOut => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    pub fn is_forced_logout(&self) -> bool {
        matches!(self, SessionEvent::ForcedLogout { .. })
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Broadcast hub for [`SessionEvent`]s.
///
/// Cloning is cheap; every clone publishes into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Creates a new event bus.
    ///
    /// `capacity` is the per-subscriber backlog; a subscriber further behind
    /// than that receives `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event, returning how many subscribers received it.
    pub fn emit(&self, event: SessionEvent) -> Result<usize, SendError<SessionEvent>> {
        self.sender.send(event)
    }

    /// Subscribes to all future events. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

type EventFilter = Box<dyn Fn(&SessionEvent) -> bool + Send + Sync>;

/// A `broadcast::Receiver` with an optional filter.
///
/// ```rust
/// use core_runtime::events::{EventBus, EventStream, SessionEvent};
///
/// let bus = EventBus::new(16);
/// let forced = EventStream::new(bus.subscribe()).filter(SessionEvent::is_forced_logout);
/// ```
pub struct EventStream {
    receiver: Receiver<SessionEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<SessionEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv`/`try_recv`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&SessionEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &SessionEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next matching event.
    ///
    /// # Errors
    ///
    /// `RecvError::Lagged(n)` if the subscriber fell behind, `RecvError::Closed`
    /// once every sender has been dropped.
    pub async fn recv(&mut self) -> Result<SessionEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking receive; `None` when nothing matching is queued.
    pub fn try_recv(&mut self) -> Option<Result<SessionEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

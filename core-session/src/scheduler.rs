//! Proactive refresh timer.
//!
//! Keeps at most one timer armed. It fires `refresh_margin` before the
//! access token expires and asks the coordinator for a refresh, so active
//! callers rarely see an authentication failure at all.

use bridge_traits::Clock;
use chrono::{DateTime, Utc};
use core_runtime::events::RefreshTrigger;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::coordinator::RefreshCoordinator;
use crate::types::CredentialBundle;

struct ArmedTimer {
    fire_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

pub struct ProactiveScheduler {
    margin: Duration,
    clock: Arc<dyn Clock>,
    timer: Mutex<Option<ArmedTimer>>,
}

impl ProactiveScheduler {
    pub fn new(margin: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            margin,
            clock,
            timer: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ArmedTimer>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm a timer for `bundle`, replacing any previous one.
    ///
    /// Returns when the timer will fire, or `None` if the fire time is
    /// already past. In that case the next authentication failure refreshes
    /// reactively.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(
        &self,
        bundle: &CredentialBundle,
        coordinator: Weak<RefreshCoordinator>,
    ) -> Option<DateTime<Utc>> {
        let mut timer = self.lock();
        if let Some(previous) = timer.take() {
            previous.handle.abort();
        }

        let margin = chrono::Duration::from_std(self.margin).ok()?;
        let fire_at = bundle.expires_at().checked_sub_signed(margin)?;
        let delay = match self.clock.until(fire_at) {
            Some(delay) if !delay.is_zero() => delay,
            _ => {
                debug!(%fire_at, "Refresh point already passed; not arming");
                return None;
            }
        };

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };
            debug!("Proactive refresh timer fired");
            if let Err(e) = coordinator
                .request_refresh(None, RefreshTrigger::Proactive)
                .await
            {
                warn!(error = %e, "Proactive refresh did not complete");
            }
        });

        debug!(%fire_at, delay_secs = delay.as_secs(), "Proactive refresh armed");
        *timer = Some(ArmedTimer { fire_at, handle });
        Some(fire_at)
    }

    /// Disarm the timer. Idempotent.
    pub fn cancel(&self) {
        if let Some(timer) = self.lock().take() {
            timer.handle.abort();
            debug!(fire_at = %timer.fire_at, "Proactive refresh cancelled");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|timer| !timer.handle.is_finished())
    }

    /// When the armed timer fires.
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.lock()
            .as_ref()
            .filter(|timer| !timer.handle.is_finished())
            .map(|timer| timer.fire_at)
    }
}

impl Drop for ProactiveScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.lock().take() {
            timer.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identity;
    use chrono::TimeZone;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn scheduler() -> ProactiveScheduler {
        ProactiveScheduler::new(Duration::from_secs(60), Arc::new(FixedClock(t0())))
    }

    fn bundle_expiring_in(secs: i64) -> CredentialBundle {
        CredentialBundle::new(
            "at-1",
            "rt-1",
            t0() + chrono::Duration::seconds(secs),
            Identity::empty(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_fires_margin_before_expiry() {
        let scheduler = scheduler();
        let fire_at = scheduler.arm(&bundle_expiring_in(300), Weak::new());

        assert_eq!(fire_at, Some(t0() + chrono::Duration::seconds(240)));
        assert!(scheduler.is_armed());
        assert_eq!(scheduler.next_fire_at(), fire_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_or_unknown_expiry_is_not_armed() {
        let scheduler = scheduler();
        assert_eq!(scheduler.arm(&bundle_expiring_in(30), Weak::new()), None);
        assert_eq!(scheduler.arm(&bundle_expiring_in(60), Weak::new()), None);

        let unknown = CredentialBundle::new("at", "rt", DateTime::<Utc>::MIN_UTC, Identity::empty());
        assert_eq!(scheduler.arm(&unknown, Weak::new()), None);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_timer() {
        let scheduler = scheduler();
        scheduler.arm(&bundle_expiring_in(300), Weak::new());
        scheduler.arm(&bundle_expiring_in(900), Weak::new());

        assert_eq!(
            scheduler.next_fire_at(),
            Some(t0() + chrono::Duration::seconds(840))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let scheduler = scheduler();
        scheduler.arm(&bundle_expiring_in(300), Weak::new());
        scheduler.cancel();
        scheduler.cancel();
        assert!(!scheduler.is_armed());
        assert_eq!(scheduler.next_fire_at(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_without_coordinator_finishes_quietly() {
        let scheduler = scheduler();
        scheduler.arm(&bundle_expiring_in(300), Weak::new());

        tokio::time::sleep(Duration::from_secs(241)).await;
        tokio::task::yield_now().await;
        assert!(!scheduler.is_armed());
    }
}

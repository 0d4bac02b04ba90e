use chrono::{DateTime, Utc};
use pkg_constants::lock::KEEPALIVE_MIN_DELAY_MS;
use pkg_types::lock::lease_expiry;
use std::time::Duration;
use tokio::sync::watch;
use pkg_state::StoreError;
use tracing::{debug, error, warn};

use crate::error::LockError;
use crate::lock::Lock;

/// Background renewal chain for one [`Lock`].
///
/// Sleeps until `expires - before_expiry`, renews with the lock's last TTL,
/// and schedules the next round from the new expiry. A failed renewal is
/// logged and the next round is scheduled as if it had succeeded, so a
/// struggling store is retried once per renewal period rather than in a
/// tight loop. The chain ends when the lock is released, the cancellation
/// channel fires, or the store reports this handle fenced.
pub(crate) struct RenewalTask {
    lock: Lock,
    before_expiry: Duration,
    generation: u64,
    cancelled: watch::Receiver<bool>,
}

/// `expires - before_expiry`, or the distant past if that underflows.
fn renewal_instant(expires: DateTime<Utc>, before_expiry: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(before_expiry)
        .ok()
        .and_then(|margin| expires.checked_sub_signed(margin))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Time left until `due`, never below the minimum scheduling delay.
fn delay_until(due: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let min = Duration::from_millis(KEEPALIVE_MIN_DELAY_MS);
    (due - now).to_std().unwrap_or(min).max(min)
}

async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    // A dropped sender means the chain was deregistered: same as cancel
    let _ = cancelled.wait_for(|cancelled| *cancelled).await;
}

impl RenewalTask {
    pub fn new(
        lock: Lock,
        before_expiry: Duration,
        generation: u64,
        cancelled: watch::Receiver<bool>,
    ) -> Self {
        Self {
            lock,
            before_expiry,
            generation,
            cancelled,
        }
    }

    pub async fn run(mut self) {
        let id = self.lock.id().to_string();
        let mut due = match self.lock.expires_at() {
            Some(expires) => renewal_instant(expires, self.before_expiry),
            None => Utc::now(),
        };
        debug!(
            "Keep-alive for lock {} started (before_expiry={}ms)",
            id,
            self.before_expiry.as_millis()
        );

        loop {
            let delay = delay_until(due, Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_cancelled(&mut self.cancelled) => break,
            }
            if *self.cancelled.borrow() {
                break;
            }

            let attempted_at = Utc::now();
            match self.lock.renew().await {
                Ok(true) => {
                    let expires = self.lock.expires_at().unwrap_or(attempted_at);
                    due = renewal_instant(expires, self.before_expiry);
                }
                Ok(false) => break,
                Err(LockError::Store(e @ StoreError::Fenced(_))) => {
                    error!("Keep-alive for lock {} stopped: {}", id, e);
                    break;
                }
                Err(e) => {
                    warn!("Keep-alive renewal of lock {} failed: {}", id, e);
                    let ttl = self.lock.last_ttl();
                    due = renewal_instant(lease_expiry(attempted_at, ttl), self.before_expiry);
                }
            }
            debug!("Next renewal of lock {} at {}", id, due);
        }

        self.lock.state().finish_renewal(self.generation);
        debug!("Keep-alive for lock {} ended", id);
    }
}

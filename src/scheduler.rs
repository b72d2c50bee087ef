//! Token Renewal Scheduler
//!
//! Keeps a profile's security token alive by refreshing it a safety margin
//! before it expires.
//!
//! State machine: `Stopped -> Armed -> (fire) -> Armed | Stopped`.
//! At most one timer task is outstanding; arming always cancels the previous
//! task's [`CancellationToken`] first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{CoreEvent, EventHub};
use crate::token::TokenManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Armed,
}

struct Inner {
    state: SchedulerState,
    cancel: Option<CancellationToken>,
    /// Bumped by every start/stop so stale tasks can tell they were replaced
    generation: u64,
    pending_delay: Option<Duration>,
}

/// Timer-driven token renewal loop
pub struct RenewalScheduler {
    tokens: Arc<TokenManager>,
    events: Arc<EventHub<CoreEvent>>,
    margin: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl RenewalScheduler {
    pub fn new(tokens: Arc<TokenManager>, events: Arc<EventHub<CoreEvent>>, margin: Duration) -> Self {
        Self {
            tokens,
            events,
            margin,
            inner: Arc::new(Mutex::new(Inner {
                state: SchedulerState::Stopped,
                cancel: None,
                generation: 0,
                pending_delay: None,
            })),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    pub fn is_armed(&self) -> bool {
        self.state() == SchedulerState::Armed
    }

    /// Delay the outstanding timer was armed with
    pub fn pending_delay(&self) -> Option<Duration> {
        self.inner.lock().pending_delay
    }

    pub fn token_manager(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Start automatic renewal
    ///
    /// An expired token is force-renewed immediately; otherwise a timer is
    /// armed for `time_to_expiry - margin`. Subscribers are notified of the
    /// outcome either way. Returns whether the token is usable.
    pub async fn start(&self) -> bool {
        info!("Starting token renewal scheduler...");
        let generation = {
            let mut inner = self.inner.lock();
            cancel_pending(&mut inner);
            inner.generation += 1;
            inner.state = SchedulerState::Armed;
            inner.generation
        };

        let success = if self.tokens.expired() {
            info!("Security token expired, forcing re-authentication");
            self.tokens.renew(true).await
        } else {
            true
        };

        if success {
            self.arm(generation);
        } else {
            let mut inner = self.inner.lock();
            if inner.generation == generation {
                inner.state = SchedulerState::Stopped;
            }
        }

        notify(&self.events, &self.tokens, success);
        success
    }

    /// Cancel any pending timer. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SchedulerState::Stopped && inner.cancel.is_none() {
            return;
        }
        info!("Stopping token renewal scheduler...");
        cancel_pending(&mut inner);
        inner.generation += 1;
        inner.state = SchedulerState::Stopped;
    }

    /// Spawn the timer task for `generation` unless it was superseded
    fn arm(&self, generation: u64) {
        let cancel = CancellationToken::new();
        let delay = renewal_delay(&self.tokens, self.margin);
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != SchedulerState::Armed {
                debug!("Scheduler superseded before arming");
                return;
            }
            cancel_pending(&mut inner);
            inner.cancel = Some(cancel.clone());
            inner.pending_delay = Some(delay);
        }
        info!("Token renewal scheduled in {} seconds", delay.as_secs());

        let tokens = self.tokens.clone();
        let events = self.events.clone();
        let inner = self.inner.clone();
        let margin = self.margin;

        tokio::spawn(async move {
            let mut delay = delay;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Token renewal timer cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                if cancel.is_cancelled() {
                    return;
                }

                debug!("Renewing token...");
                let success = tokens.renew(false).await;
                notify(&events, &tokens, success);

                delay = {
                    let mut guard = inner.lock();
                    if guard.generation != generation || cancel.is_cancelled() {
                        return;
                    }
                    if !success {
                        warn!("Token refresh failed; automatic renewal stopped");
                        guard.state = SchedulerState::Stopped;
                        guard.cancel = None;
                        guard.pending_delay = None;
                        return;
                    }
                    let next = renewal_delay(&tokens, margin);
                    guard.pending_delay = Some(next);
                    next
                };
                info!("Token renewal scheduled in {} seconds", delay.as_secs());
            }
        });
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        cancel_pending(&mut self.inner.lock());
    }
}

fn cancel_pending(inner: &mut Inner) {
    if let Some(cancel) = inner.cancel.take() {
        cancel.cancel();
    }
    inner.pending_delay = None;
}

fn renewal_delay(tokens: &TokenManager, margin: Duration) -> Duration {
    tokens.time_to_expiry().saturating_sub(margin)
}

fn notify(events: &EventHub<CoreEvent>, tokens: &TokenManager, success: bool) {
    events.publish(&CoreEvent::TokenRenewal {
        success,
        expiration: tokens.expiration().with_timezone(&Local),
    });
}

//! Bastion Session Provisioner
//!
//! Creates an ephemeral port-forwarding session, polls it until it is ACTIVE,
//! and optionally re-provisions it shortly before its TTL runs out.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Local;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::api::{ApiError, BastionApi};
use super::types::{BastionSession, CreateSessionRequest, SessionState, STATUS_ACCEPTED};
use crate::config::AppSettings;
use crate::events::{CoreEvent, EventHub};
use crate::util::random_token;

/// State label published when no session exists
pub const INACTIVE_STATE: &str = "INACTIVE";

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Failed to read public key {path}: {source}")]
    KeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Bastion API error: {0}")]
    Api(#[from] ApiError),

    #[error("Session create not accepted (status {0})")]
    NotAccepted(u16),

    #[error("Session create returned no session")]
    MissingSession,

    #[error("Session not active: last state {0}")]
    NotActive(SessionState),

    #[error("Session not active within {window:?} ({polls} polls)")]
    Timeout { polls: u32, window: Duration },
}

impl serde::Serialize for ProvisionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Polling and renewal timing
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    /// Re-provision this long before the session TTL elapses
    pub renewal_margin: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(60),
            renewal_margin: Duration::from_secs(120),
        }
    }
}

impl From<&AppSettings> for ProvisionConfig {
    fn from(settings: &AppSettings) -> Self {
        Self {
            poll_interval: Duration::from_secs(settings.settings.session_poll_interval_secs),
            poll_timeout: Duration::from_secs(settings.settings.session_poll_timeout_secs),
            renewal_margin: settings.settings.session_renewal_margin(),
        }
    }
}

/// What to open a session to
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub bastion_id: String,
    pub target_resource_id: String,
    pub target_port: u16,
    pub ttl_secs: u64,
    /// Read at every provisioning call
    pub public_key_path: PathBuf,
}

/// The outstanding session renewal task
struct RenewalTimer {
    generation: u64,
    cancel: CancellationToken,
}

/// Owns the current bastion session
pub struct BastionProvisioner {
    api: Arc<dyn BastionApi>,
    config: ProvisionConfig,
    events: Arc<EventHub<CoreEvent>>,
    session: RwLock<Option<BastionSession>>,
    auto_renew: AtomicBool,
    /// Tunnel state mirrored into session events
    link_connected: AtomicBool,
    renewal: Mutex<Option<RenewalTimer>>,
    renewal_generation: AtomicU64,
}

impl BastionProvisioner {
    pub fn new(
        api: Arc<dyn BastionApi>,
        config: ProvisionConfig,
        events: Arc<EventHub<CoreEvent>>,
    ) -> Self {
        Self {
            api,
            config,
            events,
            session: RwLock::new(None),
            auto_renew: AtomicBool::new(false),
            link_connected: AtomicBool::new(false),
            renewal: Mutex::new(None),
            renewal_generation: AtomicU64::new(0),
        }
    }

    /// Copy of the current session
    pub fn session(&self) -> Option<BastionSession> {
        self.session.read().clone()
    }

    pub fn auto_renew(&self) -> bool {
        self.auto_renew.load(Ordering::SeqCst)
    }

    pub fn is_renewal_scheduled(&self) -> bool {
        self.renewal.lock().is_some()
    }

    /// Record the tunnel state and publish a session event if it changed
    pub fn set_link_connected(&self, connected: bool) {
        if self.link_connected.swap(connected, Ordering::SeqCst) != connected {
            self.notify();
        }
    }

    /// Create a session and wait until it is ACTIVE
    pub async fn provision(&self, target: &SessionTarget) -> Result<BastionSession, ProvisionError> {
        let result = self.provision_inner(target).await;
        self.auto_renew.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    async fn provision_inner(&self, target: &SessionTarget) -> Result<BastionSession, ProvisionError> {
        info!("Starting bastion session creation process");
        debug!("Fetching public key from {:?}", target.public_key_path);
        let public_key = tokio::fs::read_to_string(&target.public_key_path)
            .await
            .map_err(|source| ProvisionError::KeyRead {
                path: target.public_key_path.clone(),
                source,
            })?;

        let request = CreateSessionRequest {
            bastion_id: target.bastion_id.clone(),
            target_resource_id: target.target_resource_id.clone(),
            target_port: target.target_port,
            ttl_secs: target.ttl_secs,
            public_key,
            display_name: format!("Session-{}", Local::now().format("%Y%m%d-%H%M")),
            retry_token: random_token(),
            request_id: random_token(),
        };

        let response = self.api.create_session(&request).await?;
        if response.status != STATUS_ACCEPTED {
            *self.session.write() = None;
            return Err(ProvisionError::NotAccepted(response.status));
        }
        let mut session = response.session.ok_or(ProvisionError::MissingSession)?;
        info!(session_id = %session.id, "Creating session...");
        *self.session.write() = Some(session.clone());

        let mut waited = Duration::ZERO;
        let mut polls = 0u32;
        while session.lifecycle_state == SessionState::Creating && waited < self.config.poll_timeout {
            debug!(session_id = %session.id, "Session not ready yet, retrying...");
            tokio::time::sleep(self.config.poll_interval).await;
            session = self.api.get_session(&session.id).await?;
            *self.session.write() = Some(session.clone());
            waited += self.config.poll_interval;
            polls += 1;
        }

        match session.lifecycle_state {
            SessionState::Active => {
                info!(session_id = %session.id, "Session created successfully");
                Ok(session)
            }
            SessionState::Creating => Err(ProvisionError::Timeout {
                polls,
                window: self.config.poll_timeout,
            }),
            other => Err(ProvisionError::NotActive(other)),
        }
    }

    /// Provision, log any failure, and publish the outcome
    pub async fn provision_and_notify(&self, target: &SessionTarget) -> bool {
        let success = match self.provision(target).await {
            Ok(_) => true,
            Err(e) => {
                error!("Error creating session: {}", e);
                false
            }
        };
        self.notify();
        success
    }

    /// Re-provision `renewal_margin` before the TTL elapses, repeatedly
    ///
    /// Replaces any previously scheduled renewal. The loop ends when a
    /// renewal fails, auto-renew is turned off, [`Self::stop_renewal`] is
    /// called, or the provisioner is dropped. The task only holds a weak
    /// reference between fires.
    pub fn schedule_renewal(self: &Arc<Self>, target: SessionTarget) {
        let cancel = CancellationToken::new();
        let generation = self.renewal_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.renewal.lock().replace(RenewalTimer {
            generation,
            cancel: cancel.clone(),
        });
        if let Some(prev) = previous {
            prev.cancel.cancel();
        }

        let delay = Duration::from_secs(target.ttl_secs).saturating_sub(self.config.renewal_margin);
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                info!("Session renewal scheduled in {} seconds", delay.as_secs());
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Session renewal cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                let Some(this) = weak.upgrade() else {
                    debug!("Provisioner dropped, session renewal ends");
                    return;
                };
                if cancel.is_cancelled() {
                    return;
                }

                if !this.auto_renew() {
                    this.notify();
                    this.clear_renewal(generation);
                    return;
                }

                info!("Attempting to renew bastion session...");
                if !this.provision_and_notify(&target).await {
                    this.clear_renewal(generation);
                    return;
                }
                if cancel.is_cancelled() {
                    return;
                }
            }
        });
    }

    /// Drop the timer slot if it still belongs to `generation`
    fn clear_renewal(&self, generation: u64) {
        let mut slot = self.renewal.lock();
        if slot.as_ref().is_some_and(|t| t.generation == generation) {
            *slot = None;
        }
    }

    /// Cancel the renewal timer and turn auto-renew off
    pub fn stop_renewal(&self) {
        self.auto_renew.store(false, Ordering::SeqCst);
        if let Some(timer) = self.renewal.lock().take() {
            info!("Stopping bastion session renewal");
            timer.cancel.cancel();
        }
    }

    /// Current `(state, connected, expiration, session)` as an event
    pub fn snapshot(&self) -> CoreEvent {
        let session = self.session();
        let (state, expiration) = match &session {
            Some(s) => (
                s.lifecycle_state.to_string(),
                s.expires_at().with_timezone(&Local),
            ),
            None => (INACTIVE_STATE.to_string(), Local::now()),
        };
        CoreEvent::Session {
            state,
            connected: self.link_connected.load(Ordering::SeqCst),
            expiration,
            session,
        }
    }

    pub fn notify(&self) {
        debug!("Notifying session subscribers");
        self.events.publish(&self.snapshot());
    }
}

impl Drop for BastionProvisioner {
    fn drop(&mut self) {
        if let Some(timer) = self.renewal.lock().take() {
            timer.cancel.cancel();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn target(dir: &Path, ttl_secs: u64) -> SessionTarget {
        let key = dir.join("id_rsa.pub");
        std::fs::write(&key, "ssh-rsa AAAA test@host\n").unwrap();
        SessionTarget {
            bastion_id: "ocid1.bastion.oc1..b".into(),
            target_resource_id: "ocid1.instance.oc1..i".into(),
            target_port: 22,
            ttl_secs,
            public_key_path: key,
        }
    }

    fn provisioner(api: Arc<FakeBastionApi>) -> (Arc<BastionProvisioner>, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(EventHub::new());
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        events.subscribe(move |e: &CoreEvent| {
            if let CoreEvent::Session { state, .. } = e {
                sink.lock().push(state.clone());
            }
        });
        (
            Arc::new(BastionProvisioner::new(api, ProvisionConfig::default(), events)),
            states,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_after_polls() {
        let temp = tempdir().unwrap();
        let api = Arc::new(FakeBastionApi::new(
            SessionState::Creating,
            vec![SessionState::Creating, SessionState::Active],
        ));
        let (prov, _) = provisioner(api.clone());

        let session = prov.provision(&target(temp.path(), 10800)).await.unwrap();
        assert!(session.is_active());
        assert_eq!(api.gets(), 2);
        assert!(prov.auto_renew());
        assert_eq!(prov.session().unwrap().lifecycle_state, SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediately_active_skips_polling() {
        let temp = tempdir().unwrap();
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (prov, _) = provisioner(api.clone());

        prov.provision(&target(temp.path(), 10800)).await.unwrap();
        assert_eq!(api.gets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_creating_times_out_after_twelve_polls() {
        let temp = tempdir().unwrap();
        let api = Arc::new(FakeBastionApi::new(
            SessionState::Creating,
            vec![SessionState::Creating],
        ));
        let (prov, _) = provisioner(api.clone());

        let err = prov.provision(&target(temp.path(), 10800)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { polls: 12, .. }));
        assert_eq!(api.gets(), 12);
        assert!(!prov.auto_renew());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_state_is_error() {
        let temp = tempdir().unwrap();
        let api = Arc::new(FakeBastionApi::new(
            SessionState::Creating,
            vec![SessionState::Failed],
        ));
        let (prov, _) = provisioner(api.clone());

        let err = prov.provision(&target(temp.path(), 10800)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotActive(SessionState::Failed)));
        assert_eq!(api.gets(), 1);
    }

    #[tokio::test]
    async fn test_not_accepted_clears_session() {
        let temp = tempdir().unwrap();
        let mut fake = FakeBastionApi::new(SessionState::Active, vec![]);
        fake.create_status = 400;
        let (prov, states) = provisioner(Arc::new(fake));

        assert!(!prov.provision_and_notify(&target(temp.path(), 10800)).await);
        assert!(prov.session().is_none());
        assert_eq!(*states.lock(), vec![INACTIVE_STATE.to_string()]);
    }

    #[tokio::test]
    async fn test_missing_key_aborts_before_api_call() {
        let temp = tempdir().unwrap();
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (prov, _) = provisioner(api.clone());

        let mut t = target(temp.path(), 10800);
        t.public_key_path = temp.path().join("missing.pub");
        let err = prov.provision(&t).await.unwrap_err();

        assert!(matches!(err, ProvisionError::KeyRead { .. }));
        assert_eq!(api.creates(), 0);
    }

    #[tokio::test]
    async fn test_fresh_tokens_per_call() {
        let temp = tempdir().unwrap();
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (prov, _) = provisioner(api.clone());
        let t = target(temp.path(), 10800);

        prov.provision(&t).await.unwrap();
        prov.provision(&t).await.unwrap();

        let requests = api.requests.lock();
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].retry_token, requests[0].request_id);
        assert_ne!(requests[0].retry_token, requests[1].retry_token);
        assert_ne!(requests[0].request_id, requests[1].request_id);
        assert_eq!(requests[0].public_key, "ssh-rsa AAAA test@host\n");
        assert!(requests[0].display_name.starts_with("Session-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_reprovisions_before_ttl() {
        let temp = tempdir().unwrap();
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (prov, states) = provisioner(api.clone());
        let t = target(temp.path(), 600);

        assert!(prov.provision_and_notify(&t).await);
        prov.schedule_renewal(t.clone());
        assert!(prov.is_renewal_scheduled());
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(470)).await;
        tokio::task::yield_now().await;
        assert_eq!(api.creates(), 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(api.creates(), 2);
        assert_eq!(states.lock().len(), 2);

        prov.stop_renewal();
        assert!(!prov.is_renewal_scheduled());
        tokio::time::advance(Duration::from_secs(1000)).await;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(api.creates(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_provisioner_stops_renewing() {
        let temp = tempdir().unwrap();
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (prov, _) = provisioner(api.clone());
        let t = target(temp.path(), 600);

        prov.provision(&t).await.unwrap();
        prov.schedule_renewal(t);
        tokio::task::yield_now().await;
        drop(prov);

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(481)).await;
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        assert_eq!(api.creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_clears_slot() {
        let temp = tempdir().unwrap();
        let mut fake = FakeBastionApi::new(SessionState::Failed, vec![]);
        fake.create_status = 400;
        let api = Arc::new(fake);
        let (prov, _) = provisioner(api.clone());
        let t = target(temp.path(), 600);

        // auto-renew stays on only after a success, so force it
        prov.auto_renew.store(true, Ordering::SeqCst);
        prov.schedule_renewal(t);
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(481)).await;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(api.creates(), 1);
        assert!(!prov.is_renewal_scheduled());
    }

    #[tokio::test]
    async fn test_stale_timer_cannot_clear_replacement() {
        let temp = tempdir().unwrap();
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (prov, _) = provisioner(api);
        let t = target(temp.path(), 600);

        prov.schedule_renewal(t.clone());
        prov.schedule_renewal(t);
        // the first timer finishing late must leave the second in place
        prov.clear_renewal(1);
        assert!(prov.is_renewal_scheduled());

        prov.clear_renewal(2);
        assert!(!prov.is_renewal_scheduled());
        prov.stop_renewal();
    }

    #[tokio::test]
    async fn test_link_state_publishes_on_change_only() {
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (prov, states) = provisioner(api);

        prov.set_link_connected(true);
        prov.set_link_connected(true);
        prov.set_link_connected(false);
        assert_eq!(states.lock().len(), 2);
    }
}

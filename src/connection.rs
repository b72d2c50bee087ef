//! Bastion Connection
//!
//! Wires the provisioner to a tunnel supervisor: provision a session, point
//! the forwarding client at it, mirror the tunnel state into session events,
//! and tear everything down again.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bastion::{BastionProvisioner, BastionSession, ProvisionError, SessionTarget};
use crate::context::CoreContext;
use crate::events::{CoreEvent, SubscriptionId};
use crate::tunnel::{ProcessLauncher, RetryPolicy, TunnelError, TunnelSpec, TunnelSupervisor};
use crate::util::is_port_in_use;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("{0} key path is not configured")]
    MissingKey(&'static str),

    #[error("Local port {0} is already in use")]
    PortInUse(u16),

    #[error("No bastion session available")]
    NoSession,

    #[error("Session {0} has no target IP")]
    NoTargetIp(String),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl serde::Serialize for ConnectionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// One bastion-backed port forward
pub struct BastionConnection {
    ctx: CoreContext,
    provisioner: Arc<BastionProvisioner>,
    launcher: Arc<dyn ProcessLauncher>,
    region: String,
    target: SessionTarget,
    private_key_path: PathBuf,
    policy: RetryPolicy,
    tunnel_id: String,
    tunnel: Mutex<Option<Arc<TunnelSupervisor>>>,
    link_subscription: SubscriptionId,
}

impl BastionConnection {
    /// Requires both key paths in settings
    pub fn new(
        ctx: CoreContext,
        provisioner: Arc<BastionProvisioner>,
        launcher: Arc<dyn ProcessLauncher>,
        region: impl Into<String>,
        bastion_id: impl Into<String>,
        target_resource_id: impl Into<String>,
    ) -> Result<Self, ConnectionError> {
        let settings = ctx.settings();
        let public_key_path = settings
            .keypaths
            .public_key_path
            .clone()
            .ok_or(ConnectionError::MissingKey("Public"))?;
        let private_key_path = settings
            .keypaths
            .private_key_path
            .clone()
            .ok_or(ConnectionError::MissingKey("Private"))?;

        let target = SessionTarget {
            bastion_id: bastion_id.into(),
            target_resource_id: target_resource_id.into(),
            target_port: settings.connection.target_port,
            ttl_secs: settings.connection.session_ttl_in_seconds,
            public_key_path,
        };
        let policy = RetryPolicy::from(&settings.settings);

        let tunnel_id = Uuid::new_v4().to_string();
        let link_subscription = {
            let provisioner = provisioner.clone();
            let tunnel_id = tunnel_id.clone();
            ctx.events().subscribe(move |event: &CoreEvent| {
                if let CoreEvent::TunnelConnection { tunnel_id: id, connected } = event {
                    if *id == tunnel_id {
                        provisioner.set_link_connected(*connected);
                    }
                }
            })
        };

        Ok(Self {
            ctx,
            provisioner,
            launcher,
            region: region.into(),
            target,
            private_key_path,
            policy,
            tunnel_id,
            tunnel: Mutex::new(None),
            link_subscription,
        })
    }

    /// Replace the retry policy derived from settings
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn provisioner(&self) -> &Arc<BastionProvisioner> {
        &self.provisioner
    }

    pub fn tunnel(&self) -> Option<Arc<TunnelSupervisor>> {
        self.tunnel.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.tunnel().is_some_and(|t| t.is_connected())
    }

    /// Provision a session, schedule its renewal and start the tunnel
    pub async fn open(&self) -> Result<BastionSession, ConnectionError> {
        let local_port = self.ctx.settings().connection.local_port;
        if is_port_in_use(local_port) {
            return Err(ConnectionError::PortInUse(local_port));
        }

        let result = self.provisioner.provision(&self.target).await;
        self.provisioner.notify();
        let session = result?;
        self.provisioner.schedule_renewal(self.target.clone());

        if let Err(e) = self.connect_tunnel() {
            self.provisioner.stop_renewal();
            return Err(e);
        }
        Ok(session)
    }

    /// Start a tunnel against the current session
    pub fn connect_tunnel(&self) -> Result<(), ConnectionError> {
        let session = self.provisioner.session().ok_or(ConnectionError::NoSession)?;
        let spec = TunnelSpec::for_session(
            &session,
            self.ctx.settings(),
            self.private_key_path.clone(),
            &self.region,
        )
        .ok_or_else(|| ConnectionError::NoTargetIp(session.id.clone()))?;

        let mut slot = self.tunnel.lock();
        if let Some(existing) = slot.as_ref() {
            if existing.is_running() {
                return Err(TunnelError::AlreadyRunning(self.tunnel_id.clone()).into());
            }
        }

        let tunnel = Arc::new(TunnelSupervisor::new(
            self.tunnel_id.clone(),
            spec,
            self.policy.clone(),
            self.launcher.clone(),
            self.ctx.events().clone(),
        ));
        tunnel.connect()?;
        *slot = Some(tunnel);
        Ok(())
    }

    /// Disconnect a connected tunnel, otherwise reconnect to the current session
    ///
    /// Returns whether a connect was started.
    pub async fn toggle(&self) -> Result<bool, ConnectionError> {
        if let Some(tunnel) = self.tunnel() {
            if tunnel.is_connected() || tunnel.is_running() {
                tunnel.disconnect().await;
                return Ok(false);
            }
        }
        self.connect_tunnel()?;
        Ok(true)
    }

    /// Stop the tunnel and the session renewal timer
    pub async fn close(&self) {
        info!(tunnel_id = %self.tunnel_id, "Closing bastion connection");
        let tunnel = self.tunnel.lock().take();
        if let Some(tunnel) = tunnel {
            tunnel.disconnect().await;
        }
        self.provisioner.stop_renewal();
        self.provisioner.notify();
    }
}

impl Drop for BastionConnection {
    fn drop(&mut self) {
        self.provisioner.stop_renewal();
        if !self.ctx.events().unsubscribe(self.link_subscription) {
            warn!(tunnel_id = %self.tunnel_id, "Link subscription already removed");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bastion::provisioner::test_support::FakeBastionApi;
    use crate::bastion::{ProvisionConfig, SessionState};
    use crate::config::AppSettings;
    use crate::events::EventHub;
    use crate::tunnel::test_support::ScriptLauncher;
    use crate::tunnel::TunnelState;
    use std::net::TcpListener;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn context(dir: &Path, local_port: u16) -> CoreContext {
        let public = dir.join("id_rsa.pub");
        std::fs::write(&public, "ssh-rsa AAAA test@host\n").unwrap();
        let mut settings = AppSettings::default();
        settings.keypaths.public_key_path = Some(public);
        settings.keypaths.private_key_path = Some(dir.join("id_rsa"));
        settings.connection.local_port = local_port;
        CoreContext::new(settings)
    }

    fn connection(
        ctx: &CoreContext,
        api: Arc<FakeBastionApi>,
        script: &str,
    ) -> (BastionConnection, Arc<ScriptLauncher>) {
        let provisioner = Arc::new(BastionProvisioner::new(
            api,
            ProvisionConfig::default(),
            ctx.events().clone(),
        ));
        let launcher = Arc::new(ScriptLauncher::new(script));
        let conn = BastionConnection::new(
            ctx.clone(),
            provisioner,
            launcher.clone(),
            "us-luke-1",
            "ocid1.bastion.oc1..b",
            "ocid1.instance.oc1..i",
        )
        .unwrap()
        .with_retry_policy(RetryPolicy {
            max_retries: 3,
            check_interval: Duration::from_millis(20),
            connect_grace: Some(Duration::from_millis(50)),
        });
        (conn, launcher)
    }

    fn record_sessions(events: &EventHub<CoreEvent>) -> Arc<Mutex<Vec<(String, bool)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.subscribe(move |e: &CoreEvent| {
            if let CoreEvent::Session { state, connected, .. } = e {
                sink.lock().push((state.clone(), *connected));
            }
        });
        seen
    }

    async fn until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_open_connects_and_mirrors_link_state() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path(), free_port());
        let sessions = record_sessions(ctx.events());
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (conn, launcher) = connection(&ctx, api.clone(), "exec sleep 30");

        let session = conn.open().await.unwrap();
        assert!(session.is_active());
        assert!(conn.provisioner().is_renewal_scheduled());

        until(|| conn.is_connected()).await;
        assert_eq!(launcher.launched(), 1);
        assert_eq!(
            conn.tunnel().unwrap().spec().endpoint,
            "ocid1.bastionsession.oc1..s@host.bastion.us-luke-1.oci.oraclecloud.com"
        );

        conn.close().await;
        assert!(!conn.is_connected());
        assert!(!conn.provisioner().is_renewal_scheduled());

        let sessions = sessions.lock().clone();
        assert_eq!(sessions.first(), Some(&("ACTIVE".to_string(), false)));
        assert!(sessions.contains(&("ACTIVE".to_string(), true)));
        assert_eq!(sessions.last(), Some(&("ACTIVE".to_string(), false)));
    }

    #[tokio::test]
    async fn test_port_in_use_refuses_before_provisioning() {
        let temp = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let ctx = context(temp.path(), port);
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (conn, _) = connection(&ctx, api.clone(), "exit 0");

        assert!(matches!(conn.open().await, Err(ConnectionError::PortInUse(p)) if p == port));
        assert_eq!(api.creates(), 0);
    }

    #[tokio::test]
    async fn test_toggle_without_session() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path(), free_port());
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (conn, _) = connection(&ctx, api, "exit 0");

        assert!(matches!(conn.toggle().await, Err(ConnectionError::NoSession)));
    }

    #[tokio::test]
    async fn test_toggle_round_trip() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path(), free_port());
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (conn, launcher) = connection(&ctx, api, "exec sleep 30");

        conn.open().await.unwrap();
        until(|| conn.is_connected()).await;

        assert!(!conn.toggle().await.unwrap());
        assert_eq!(conn.tunnel().unwrap().state(), TunnelState::Idle);

        assert!(conn.toggle().await.unwrap());
        until(|| conn.is_connected()).await;
        assert_eq!(launcher.launched(), 2);

        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_without_close_stops_renewal() {
        let temp = tempdir().unwrap();
        let mut settings = context(temp.path(), free_port()).settings().clone();
        settings.connection.session_ttl_in_seconds = 600;
        let ctx = CoreContext::new(settings);
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (conn, _) = connection(&ctx, api.clone(), "exec sleep 30");
        let provisioner = conn.provisioner().clone();

        conn.open().await.unwrap();
        assert!(provisioner.is_renewal_scheduled());
        drop(conn);
        assert!(!provisioner.is_renewal_scheduled());

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(481)).await;
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        assert_eq!(api.creates(), 1);
    }

    #[tokio::test]
    async fn test_tunnel_failure_after_provisioning_stops_renewal() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path(), free_port());
        let mut fake = FakeBastionApi::new(SessionState::Active, vec![]);
        fake.target_ip = None;
        let (conn, launcher) = connection(&ctx, Arc::new(fake), "exit 0");

        assert!(matches!(conn.open().await, Err(ConnectionError::NoTargetIp(_))));
        assert!(!conn.provisioner().is_renewal_scheduled());
        assert_eq!(launcher.launched(), 0);
    }

    #[test]
    fn test_missing_keys() {
        let ctx = CoreContext::new(AppSettings::default());
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let provisioner = Arc::new(BastionProvisioner::new(
            api,
            ProvisionConfig::default(),
            ctx.events().clone(),
        ));
        let result = BastionConnection::new(
            ctx,
            provisioner,
            Arc::new(ScriptLauncher::new("exit 0")),
            "r",
            "b",
            "i",
        );
        assert!(matches!(result, Err(ConnectionError::MissingKey("Public"))));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path(), free_port());
        let api = Arc::new(FakeBastionApi::new(SessionState::Active, vec![]));
        let (conn, _) = connection(&ctx, api, "exit 0");
        assert_eq!(ctx.events().len(), 1);
        drop(conn);
        assert!(ctx.events().is_empty());
    }
}

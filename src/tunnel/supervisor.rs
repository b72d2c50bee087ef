//! Tunnel Supervisor
//!
//! Runs the forwarding subprocess in a background worker and restarts it on
//! drops, with a fixed retry interval and a bounded retry budget.
//!
//! State machine:
//! `Idle -> Connecting -> Connected -> (drop) -> Connecting -> ... -> Failed`,
//! or back to `Idle` on an explicit disconnect. An authentication denial in
//! the child's stderr is terminal no matter how much budget is left.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command::{ProcessLauncher, TunnelSpec};
use crate::config::CoreSettings;
use crate::events::{CoreEvent, EventHub};

/// stderr marker of an authentication denial
pub const PERMISSION_DENIED_SIGNATURE: &str = "Permission denied";

/// How long a terminated child gets to exit before it is killed
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tunnel {0} is already running")]
    AlreadyRunning(String),
}

impl serde::Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Idle,
    Connecting,
    Connected,
    /// Retry budget exhausted or authentication denied
    Failed,
}

impl TunnelState {
    /// No worker is running in this state
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Idle | Self::Failed)
    }
}

/// Retry budget and pacing
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Fixed pause between attempts
    pub check_interval: Duration,
    /// A child still running after this long counts as connected.
    /// `None` marks connected only on a clean exit.
    pub connect_grace: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            check_interval: Duration::from_secs(10),
            connect_grace: Some(Duration::from_secs(3)),
        }
    }
}

impl From<&CoreSettings> for RetryPolicy {
    fn from(settings: &CoreSettings) -> Self {
        Self {
            max_retries: settings.connection_max_retries,
            check_interval: settings.check_interval(),
            ..Default::default()
        }
    }
}

/// State shared between the supervisor handle and its worker
struct Shared {
    id: String,
    spec: TunnelSpec,
    policy: RetryPolicy,
    launcher: Arc<dyn ProcessLauncher>,
    events: Arc<EventHub<CoreEvent>>,
    connected: AtomicBool,
    should_reconnect: AtomicBool,
    retry_count: AtomicU32,
    launches: AtomicU32,
    state: watch::Sender<TunnelState>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    /// Publish a connection event only when the value actually changes
    fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) == connected {
            return;
        }
        info!(tunnel_id = %self.id, connected, "Tunnel connection state changed");
        self.events.publish(&CoreEvent::TunnelConnection {
            tunnel_id: self.id.clone(),
            connected,
        });
    }

    fn set_state(&self, state: TunnelState) {
        self.state.send_replace(state);
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Supervises one forwarding subprocess
pub struct TunnelSupervisor {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl TunnelSupervisor {
    pub fn new(
        id: impl Into<String>,
        spec: TunnelSpec,
        policy: RetryPolicy,
        launcher: Arc<dyn ProcessLauncher>,
        events: Arc<EventHub<CoreEvent>>,
    ) -> Self {
        let (state, _) = watch::channel(TunnelState::Idle);
        Self {
            shared: Arc::new(Shared {
                id: id.into(),
                spec,
                policy,
                launcher,
                events,
                connected: AtomicBool::new(false),
                should_reconnect: AtomicBool::new(false),
                retry_count: AtomicU32::new(0),
                launches: AtomicU32::new(0),
                state,
                last_error: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.shared.spec
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TunnelState {
        *self.shared.state.borrow()
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::SeqCst)
    }

    /// Subprocesses started since creation
    pub fn launches(&self) -> u32 {
        self.shared.launches.load(Ordering::SeqCst)
    }

    /// stderr (or spawn error) of the last failed attempt
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Whether a worker task is alive
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Start the reconnect loop in the background
    ///
    /// Resets the retry budget. Fails if a worker is already running.
    pub fn connect(&self) -> Result<(), TunnelError> {
        let mut slot = self.worker.lock();
        if slot.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Err(TunnelError::AlreadyRunning(self.shared.id.clone()));
        }

        info!(
            tunnel_id = %self.shared.id,
            "Starting tunnel: {}",
            self.shared.spec.command_line()
        );
        self.shared.retry_count.store(0, Ordering::SeqCst);
        self.shared.should_reconnect.store(true, Ordering::SeqCst);
        *self.shared.last_error.lock() = None;
        self.shared.set_state(TunnelState::Connecting);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_worker(self.shared.clone(), cancel.clone()));
        *slot = Some(Worker { cancel, handle });
        Ok(())
    }

    /// Stop reconnecting, terminate the child and wait for the worker
    pub async fn disconnect(&self) {
        self.shared.should_reconnect.store(false, Ordering::SeqCst);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            info!(tunnel_id = %self.shared.id, "Disconnecting tunnel");
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                warn!(tunnel_id = %self.shared.id, "Tunnel worker ended abnormally: {}", e);
            }
        }
        self.shared.set_connected(false);
        self.shared.retry_count.store(0, Ordering::SeqCst);
        self.shared.set_state(TunnelState::Idle);
    }

    /// Disconnect when connected, connect otherwise
    ///
    /// Returns whether a connect was started.
    pub async fn toggle(&self) -> Result<bool, TunnelError> {
        if self.is_connected() {
            self.disconnect().await;
            Ok(false)
        } else {
            self.connect()?;
            Ok(true)
        }
    }

    /// Resolve once the worker has given up or been disconnected
    pub async fn wait_stopped(&self) -> TunnelState {
        let mut rx = self.shared.state.subscribe();
        let state = match rx.wait_for(|s| s.is_stopped()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }
}

impl Drop for TunnelSupervisor {
    fn drop(&mut self) {
        self.shared.should_reconnect.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            worker.cancel.cancel();
        }
    }
}

/// Why the wait on a child returned
enum Wake {
    Exited(Option<ExitStatus>),
    Cancelled,
    Grace,
}

async fn run_worker(shared: Arc<Shared>, cancel: CancellationToken) {
    let policy = &shared.policy;
    let id = shared.id.as_str();

    let final_state = loop {
        if !shared.should_reconnect.load(Ordering::SeqCst) || cancel.is_cancelled() {
            break TunnelState::Idle;
        }

        let attempt = shared.retry_count.load(Ordering::SeqCst);
        shared.launches.fetch_add(1, Ordering::SeqCst);
        debug!(tunnel_id = %id, attempt, max_retries = policy.max_retries, "Launching forwarding client");

        let stderr = match shared.launcher.launch(&shared.spec) {
            Ok(child) => match supervise_child(&shared, child, &cancel).await {
                Some(stderr) => stderr,
                None => break TunnelState::Idle,
            },
            Err(source) => TunnelError::Spawn {
                program: shared.spec.program.clone(),
                source,
            }
            .to_string(),
        };

        let stderr = stderr.trim();
        if stderr.is_empty() {
            // clean exit counts as a successful session
            shared.set_connected(true);
            shared.retry_count.store(0, Ordering::SeqCst);
        } else {
            warn!(tunnel_id = %id, "Tunnel error: {}", stderr);
            *shared.last_error.lock() = Some(stderr.to_string());
        }
        shared.set_connected(false);

        if !shared.should_reconnect.load(Ordering::SeqCst) || cancel.is_cancelled() {
            shared.retry_count.store(0, Ordering::SeqCst);
            break TunnelState::Idle;
        }

        if stderr.contains(PERMISSION_DENIED_SIGNATURE) {
            error!(tunnel_id = %id, "Authentication denied; not retrying");
            shared.retry_count.store(0, Ordering::SeqCst);
            break TunnelState::Failed;
        }

        let retries = shared.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        if retries > policy.max_retries {
            error!(tunnel_id = %id, max_retries = policy.max_retries, "Max retries reached. Giving up.");
            break TunnelState::Failed;
        }

        shared.set_state(TunnelState::Connecting);
        info!(
            tunnel_id = %id,
            "Reconnecting in {:.1}s (attempt {}/{})",
            policy.check_interval.as_secs_f64(),
            retries,
            policy.max_retries
        );
        tokio::select! {
            _ = cancel.cancelled() => break TunnelState::Idle,
            _ = tokio::time::sleep(policy.check_interval) => {}
        }
    };

    shared.set_connected(false);
    shared.set_state(final_state);
    debug!(tunnel_id = %id, state = ?final_state, "Tunnel worker exited");
}

/// Wait for `child` to exit and return its stderr
///
/// Returns `None` when cancelled; the child is terminated and reaped first.
async fn supervise_child(
    shared: &Shared,
    mut child: Child,
    cancel: &CancellationToken,
) -> Option<String> {
    let reader = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = String::new();
            if let Err(e) = pipe.read_to_string(&mut buf).await {
                debug!("stderr read ended: {}", e);
            }
            buf
        })
    });

    let mut grace_pending = shared.policy.connect_grace.is_some();
    let grace = tokio::time::sleep(shared.policy.connect_grace.unwrap_or_default());
    tokio::pin!(grace);

    let status = loop {
        let wake = tokio::select! {
            _ = cancel.cancelled() => Wake::Cancelled,
            status = child.wait() => Wake::Exited(status.ok()),
            _ = &mut grace, if grace_pending => Wake::Grace,
        };

        match wake {
            Wake::Exited(status) => break status,
            Wake::Grace => {
                grace_pending = false;
                shared.set_connected(true);
                shared.retry_count.store(0, Ordering::SeqCst);
                shared.set_state(TunnelState::Connected);
            }
            Wake::Cancelled => {
                terminate(&mut child).await;
                if let Some(reader) = reader {
                    reader.abort();
                }
                return None;
            }
        }
    };

    debug!(tunnel_id = %shared.id, ?status, "Forwarding client exited");
    match reader {
        Some(reader) => Some(reader.await.unwrap_or_default()),
        None => Some(String::new()),
    }
}

/// SIGTERM, then kill if the child outlives [`TERMINATE_TIMEOUT`]
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if tokio::time::timeout(TERMINATE_TIMEOUT, child.wait()).await.is_ok() {
                        return;
                    }
                    debug!("Forwarding client ignored SIGTERM, killing");
                }
                Err(e) => debug!("SIGTERM failed: {}", e),
            }
        }
    }

    if let Err(e) = child.kill().await {
        warn!("Failed to kill forwarding client: {}", e);
    }
}

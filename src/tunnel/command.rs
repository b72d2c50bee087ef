//! Forwarding client invocation
//!
//! Builds the `ssh -N -L` command line for a bastion session and spawns it
//! with a piped stderr so the supervisor can classify failures.

use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use crate::bastion::BastionSession;
use crate::config::AppSettings;

/// Everything needed to launch one forwarding subprocess
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    /// Forwarding client binary (usually `ssh`)
    pub program: String,
    pub private_key_path: PathBuf,
    pub local_port: u16,
    pub target_ip: String,
    pub target_port: u16,
    /// SSH port on the bastion host
    pub remote_port: u16,
    /// `user@host`
    pub endpoint: String,
}

impl TunnelSpec {
    /// Spec for an active bastion session
    ///
    /// Returns `None` when the session carries no target IP.
    pub fn for_session(
        session: &BastionSession,
        settings: &AppSettings,
        private_key_path: PathBuf,
        region: &str,
    ) -> Option<Self> {
        Some(Self {
            program: settings.settings.ssh_program.clone(),
            private_key_path,
            local_port: settings.connection.local_port,
            target_ip: session.target_ip.clone()?,
            target_port: session.target_port,
            remote_port: settings.connection.remote_port,
            endpoint: session.ssh_endpoint(region),
        })
    }

    /// `local_port:target_ip:target_port`
    pub fn forward_mapping(&self) -> String {
        format!("{}:{}:{}", self.local_port, self.target_ip, self.target_port)
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "-i".into(),
            self.private_key_path.to_string_lossy().into_owned(),
            "-N".into(),
            "-L".into(),
            self.forward_mapping(),
            "-p".into(),
            self.remote_port.to_string(),
            self.endpoint.clone(),
        ]
    }

    /// Printable command line for logs
    pub fn command_line(&self) -> String {
        format!("{} {}", self.program, self.args().join(" "))
    }
}

/// Spawns forwarding subprocesses
pub trait ProcessLauncher: Send + Sync {
    /// Start the process. stderr must be piped.
    fn launch(&self, spec: &TunnelSpec) -> std::io::Result<Child>;
}

/// Launches the real forwarding client
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &TunnelSpec) -> std::io::Result<Child> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(spec.args());
        spawn_piped(cmd)
    }
}

/// Spawn with null stdin/stdout, piped stderr, killed on drop
pub fn spawn_piped(mut cmd: Command) -> std::io::Result<Child> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

//! Small helpers shared by the provisioner, the connection orchestrator and the runner.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::process::Command;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Idempotency / request-tracing token: 20 random alphanumerics followed by a UUIDv4
pub fn random_token() -> String {
    let prefix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, Uuid::new_v4())
}

/// Whether something is already bound to `127.0.0.1:port`
pub fn is_port_in_use(port: u16) -> bool {
    let in_use = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_err();
    debug!("Port {} in use: {}", port, in_use);
    in_use
}

/// Probe `<program> --version`; false when the binary is missing or fails
pub async fn cli_installed(program: &str) -> bool {
    match Command::new(program).arg("--version").output().await {
        Ok(output) if output.status.success() => {
            info!(
                "{} version: {}",
                program,
                String::from_utf8_lossy(&output.stdout).trim()
            );
            true
        }
        Ok(output) => {
            error!("{} --version exited with {:?}", program, output.status.code());
            false
        }
        Err(e) => {
            error!("{} not found: {}", program, e);
            false
        }
    }
}

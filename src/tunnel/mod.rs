//! Tunnel Module
//!
//! Supervises the external forwarding client that carries a local port
//! through a bastion session to the target host.

mod command;
mod supervisor;

pub use command::{spawn_piped, ProcessLauncher, SystemLauncher, TunnelSpec};
pub use supervisor::{
    RetryPolicy, TunnelError, TunnelState, TunnelSupervisor, PERMISSION_DENIED_SIGNATURE,
};

#[cfg(all(test, unix))]
pub(crate) use supervisor::test_support;

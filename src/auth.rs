//! Cloud CLI authentication
//!
//! The token manager never talks to the identity provider directly. It asks an
//! [`AuthProvider`] to either run a full interactive authentication or a cheap
//! refresh of the existing token; the provider rewrites the token file.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Re-authentication seam used by the token manager
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Full (possibly interactive) authentication for `profile` in `region`
    async fn authenticate(&self, profile: &str, region: &str) -> Result<(), AuthError>;

    /// Lightweight refresh of the token already on disk
    async fn refresh(&self, profile: &str) -> Result<(), AuthError>;
}

/// [`AuthProvider`] backed by the cloud vendor's CLI
#[derive(Debug, Clone)]
pub struct OciCli {
    program: String,
}

impl OciCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments for `session authenticate`
    pub fn authenticate_args(profile: &str, region: &str) -> Vec<String> {
        vec![
            "session".into(),
            "authenticate".into(),
            "--profile-name".into(),
            profile.into(),
            "--auth".into(),
            "security_token".into(),
            "--region".into(),
            region.into(),
        ]
    }

    /// Arguments for `session refresh`
    pub fn refresh_args(profile: &str) -> Vec<String> {
        vec![
            "session".into(),
            "refresh".into(),
            "--profile".into(),
            profile.into(),
        ]
    }

    async fn run(&self, args: Vec<String>) -> Result<(), AuthError> {
        info!("Executing: {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| AuthError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            debug!("{} finished successfully", self.program);
            return Ok(());
        }

        Err(AuthError::Failed {
            program: self.program.clone(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl Default for OciCli {
    fn default() -> Self {
        Self::new("oci")
    }
}

#[async_trait]
impl AuthProvider for OciCli {
    async fn authenticate(&self, profile: &str, region: &str) -> Result<(), AuthError> {
        self.run(Self::authenticate_args(profile, region)).await
    }

    async fn refresh(&self, profile: &str) -> Result<(), AuthError> {
        self.run(Self::refresh_args(profile)).await
    }
}

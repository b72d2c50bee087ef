//! Application Settings
//!
//! Persisted tunables consumed by the lifecycle core. Field aliases accept the
//! flat lowercase names used by older config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current settings file version
pub const SETTINGS_VERSION: u32 = 1;

/// Default safety margin before token / session expiry
pub const DEFAULT_RENEWAL_MARGIN_SECS: u64 = 120;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SettingsError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
}

/// Root settings document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub version: u32,
    pub settings: CoreSettings,
    pub keypaths: KeyPaths,
    #[serde(alias = "connectionsettings")]
    pub connection: ConnectionSettings,
    pub profile: ProfileSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            settings: CoreSettings::default(),
            keypaths: KeyPaths::default(),
            connection: ConnectionSettings::default(),
            profile: ProfileSettings::default(),
        }
    }
}

impl AppSettings {
    /// Check every bounded value
    pub fn validate(&self) -> Result<(), SettingsError> {
        check_range(
            "connection_max_retries",
            self.settings.connection_max_retries as f64,
            1.0,
            9.0,
        )?;
        if !(self.settings.check_connection_interval > 0.0
            && self.settings.check_connection_interval < 100.0)
        {
            return Err(SettingsError::OutOfRange {
                field: "check_connection_interval",
                min: 0.0,
                max: 100.0,
                value: self.settings.check_connection_interval,
            });
        }
        check_range(
            "session_ttl_in_seconds",
            self.connection.session_ttl_in_seconds as f64,
            300.0,
            28800.0,
        )?;
        check_range(
            "session_poll_interval_secs",
            self.settings.session_poll_interval_secs as f64,
            1.0,
            60.0,
        )?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), SettingsError> {
    if value < min || value > max {
        return Err(SettingsError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

/// Retry, polling and renewal tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Tunnel retries after the first launch
    #[serde(alias = "connectionmaxretries")]
    pub connection_max_retries: u32,
    /// Fixed pause between tunnel launches (seconds)
    #[serde(alias = "checkconnectioninterval")]
    pub check_connection_interval: f64,
    pub token_renewal_margin_secs: u64,
    pub session_renewal_margin_secs: u64,
    pub session_poll_interval_secs: u64,
    pub session_poll_timeout_secs: u64,
    /// Authentication CLI binary
    pub cli_program: String,
    /// Forwarding client binary
    pub ssh_program: String,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            connection_max_retries: 3,
            check_connection_interval: 10.0,
            token_renewal_margin_secs: DEFAULT_RENEWAL_MARGIN_SECS,
            session_renewal_margin_secs: DEFAULT_RENEWAL_MARGIN_SECS,
            session_poll_interval_secs: 5,
            session_poll_timeout_secs: 60,
            cli_program: "oci".to_string(),
            ssh_program: "ssh".to_string(),
        }
    }
}

impl CoreSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_connection_interval.max(0.0))
    }

    pub fn token_renewal_margin(&self) -> Duration {
        Duration::from_secs(self.token_renewal_margin_secs)
    }

    pub fn session_renewal_margin(&self) -> Duration {
        Duration::from_secs(self.session_renewal_margin_secs)
    }
}

/// SSH key material used for bastion sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyPaths {
    #[serde(alias = "privkeypath")]
    pub private_key_path: Option<PathBuf>,
    #[serde(alias = "pubkeypath")]
    pub public_key_path: Option<PathBuf>,
}

/// Tunnel endpoints and session lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    #[serde(alias = "localport")]
    pub local_port: u16,
    #[serde(alias = "targetport")]
    pub target_port: u16,
    /// SSH port on the bastion host
    pub remote_port: u16,
    #[serde(alias = "sessionlength")]
    pub session_ttl_in_seconds: u64,
    #[serde(alias = "tenancyoverride")]
    pub tenancy_override: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            local_port: 32222,
            target_port: 22,
            remote_port: 22,
            session_ttl_in_seconds: 10800,
            tenancy_override: None,
        }
    }
}

/// Which cloud profile to authenticate with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    pub name: String,
    pub region: String,
    /// Cloud CLI config file, `~/.oci/config` when unset
    pub config_file: Option<PathBuf>,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            name: "DEFAULT".to_string(),
            region: String::new(),
            config_file: None,
        }
    }
}

//! Settings Storage
//!
//! One JSON document at ~/.bastion-core/config.json (%APPDATA%\BastionCore on
//! Windows). The first run writes the defaults so there is a file to edit;
//! older documents are stamped with the current version on load.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::settings::{AppSettings, SettingsError, SETTINGS_VERSION};

const APP_DIR: &str = ".bastion-core";
#[cfg(windows)]
const APP_DIR_WINDOWS: &str = "BastionCore";
const SETTINGS_FILE: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Invalid settings: {0}")]
    Invalid(#[from] SettingsError),
}

/// Per-user application directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join(APP_DIR_WINDOWS));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(APP_DIR))
        .ok_or(StorageError::NoConfigDir)
}

pub fn log_dir() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("logs"))
}

pub fn settings_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join(SETTINGS_FILE))
}

/// Where the settings handed out by [`SettingsStorage::load_or_init`] came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsOrigin {
    /// No file existed; defaults were written
    Created,
    Loaded,
    /// An older document was stamped with the current version and rewritten
    Upgraded { from: u32 },
    /// The file did not parse; it was moved aside and defaults were written
    Recovered { backup: PathBuf },
}

#[derive(Debug, Clone)]
pub struct LoadedSettings {
    pub settings: AppSettings,
    pub origin: SettingsOrigin,
}

pub struct SettingsStorage {
    path: PathBuf,
}

impl SettingsStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: settings_file()?,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the settings document, creating or repairing it as needed
    ///
    /// A document that parses but fails validation is left untouched and
    /// reported, since rewriting it would discard the user's edits.
    pub async fn load_or_init(&self) -> Result<LoadedSettings, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let settings = AppSettings::default();
                self.save(&settings).await?;
                tracing::info!("Created default settings at {:?}", self.path);
                return Ok(LoadedSettings {
                    settings,
                    origin: SettingsOrigin::Created,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut settings = match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Settings file corrupted: {}", e);
                let backup = self.set_aside().await?;
                let settings = AppSettings::default();
                self.save(&settings).await?;
                tracing::warn!("Corrupted settings moved to {:?}, using defaults", backup);
                return Ok(LoadedSettings {
                    settings,
                    origin: SettingsOrigin::Recovered { backup },
                });
            }
        };

        if settings.version > SETTINGS_VERSION {
            return Err(StorageError::VersionTooNew {
                found: settings.version,
                supported: SETTINGS_VERSION,
            });
        }
        settings.validate()?;

        let origin = if settings.version < SETTINGS_VERSION {
            let from = settings.version;
            settings.version = SETTINGS_VERSION;
            self.save(&settings).await?;
            tracing::info!("Upgraded settings from version {} to {}", from, SETTINGS_VERSION);
            SettingsOrigin::Upgraded { from }
        } else {
            tracing::debug!("Loaded settings from {:?}", self.path);
            SettingsOrigin::Loaded
        };
        Ok(LoadedSettings { settings, origin })
    }

    /// Validate, then replace the file atomically
    pub async fn save(&self, settings: &AppSettings) -> Result<(), StorageError> {
        settings.validate()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(serde_json::to_string_pretty(settings)?.as_bytes())
            .await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    /// Move an unreadable document out of the way, keeping it for inspection
    async fn set_aside(&self) -> Result<PathBuf, StorageError> {
        let backup = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::rename(&self.path, &backup).await?;
        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn storage_in(dir: &Path) -> SettingsStorage {
        SettingsStorage::with_path(dir.join("nested").join(SETTINGS_FILE))
    }

    #[tokio::test]
    async fn test_first_run_writes_defaults() {
        let temp = tempdir().unwrap();
        let storage = storage_in(temp.path());

        let loaded = storage.load_or_init().await.unwrap();
        assert_eq!(loaded.origin, SettingsOrigin::Created);
        assert_eq!(loaded.settings.settings.connection_max_retries, 3);
        assert!(storage.path().exists());

        let again = storage.load_or_init().await.unwrap();
        assert_eq!(again.origin, SettingsOrigin::Loaded);
    }

    #[tokio::test]
    async fn test_saved_settings_survive_reload() {
        let temp = tempdir().unwrap();
        let storage = storage_in(temp.path());

        let mut settings = AppSettings::default();
        settings.connection.local_port = 40022;
        storage.save(&settings).await.unwrap();

        let loaded = storage.load_or_init().await.unwrap();
        assert_eq!(loaded.origin, SettingsOrigin::Loaded);
        assert_eq!(loaded.settings.connection.local_port, 40022);
    }

    #[tokio::test]
    async fn test_save_refuses_invalid_settings() {
        let temp = tempdir().unwrap();
        let storage = storage_in(temp.path());

        let mut settings = AppSettings::default();
        settings.settings.connection_max_retries = 0;
        assert!(matches!(
            storage.save(&settings).await,
            Err(StorageError::Invalid(_))
        ));
        assert!(!storage.path().exists());
    }

    #[tokio::test]
    async fn test_corrupted_file_is_moved_aside() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(SETTINGS_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        let storage = SettingsStorage::with_path(path.clone());

        let loaded = storage.load_or_init().await.unwrap();
        let SettingsOrigin::Recovered { backup } = loaded.origin else {
            panic!("expected recovery, got {:?}", loaded.origin);
        };
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "{ not json");

        // the replacement is a valid document again
        let again = storage.load_or_init().await.unwrap();
        assert_eq!(again.origin, SettingsOrigin::Loaded);
    }

    #[tokio::test]
    async fn test_old_version_is_upgraded_in_place() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(SETTINGS_FILE);
        std::fs::write(&path, r#"{"version": 0, "connectionsettings": {"local_port": 40100}}"#)
            .unwrap();
        let storage = SettingsStorage::with_path(path.clone());

        let loaded = storage.load_or_init().await.unwrap();
        assert_eq!(loaded.origin, SettingsOrigin::Upgraded { from: 0 });
        assert_eq!(loaded.settings.connection.local_port, 40100);

        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["version"], SETTINGS_VERSION);
    }

    #[tokio::test]
    async fn test_invalid_file_is_reported_not_rewritten() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(SETTINGS_FILE);
        let contents = r#"{"version": 1, "settings": {"connection_max_retries": 42}}"#;
        std::fs::write(&path, contents).unwrap();
        let storage = SettingsStorage::with_path(path.clone());

        assert!(matches!(
            storage.load_or_init().await,
            Err(StorageError::Invalid(SettingsError::OutOfRange {
                field: "connection_max_retries",
                ..
            }))
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), contents);
    }

    #[tokio::test]
    async fn test_version_too_new() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(SETTINGS_FILE);
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();
        let storage = SettingsStorage::with_path(path);

        assert!(matches!(
            storage.load_or_init().await,
            Err(StorageError::VersionTooNew { found: 99, .. })
        ));
    }
}

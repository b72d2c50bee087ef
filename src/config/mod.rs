//! Configuration Management Module
//!
//! Persistent application settings plus the cloud CLI profile store the
//! token manager loads credentials from.

pub mod profile;
pub mod settings;
pub mod storage;

pub use profile::{
    default_config_path, expand_home, load_profile_config, parse_config_content, Profile,
    ProfileConfig, ProfileError,
};
pub use settings::{
    AppSettings, ConnectionSettings, CoreSettings, KeyPaths, ProfileSettings, SettingsError,
    DEFAULT_RENEWAL_MARGIN_SECS, SETTINGS_VERSION,
};
pub use storage::{
    config_dir, log_dir, settings_file, LoadedSettings, SettingsOrigin, SettingsStorage,
    StorageError,
};

//! Cloud CLI Profile Store
//!
//! Parses the cloud CLI's INI-style config file (`~/.oci/config`) and resolves
//! a named profile. Supports:
//! - `[PROFILE]` sections with `key=value` lines
//! - `DEFAULT` section inheritance
//! - per-instance overrides layered on top of the file values
//! - `~` expansion for path-valued keys (`key_file`, `security_token_file`)

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs;

const DEFAULT_SECTION: &str = "DEFAULT";

/// Profile store errors
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Profile '{profile}' not found in {path}")]
    ProfileNotFound { profile: String, path: PathBuf },

    #[error("security_token_file missing in profile '{0}'")]
    TokenFileMissing(String),

    #[error("Failed to read security token {path}: {source}")]
    TokenRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

impl serde::Serialize for ProfileError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Default cloud CLI config location
pub fn default_config_path() -> Result<PathBuf, ProfileError> {
    dirs::home_dir()
        .map(|home| home.join(".oci").join("config"))
        .ok_or(ProfileError::NoHomeDir)
}

/// Expand a leading `~/` against the home directory
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// A named set of cloud credentials. Immutable once built.
#[derive(Debug, Clone)]
pub struct Profile {
    name: String,
    region: String,
    config_file: PathBuf,
    overrides: HashMap<String, String>,
}

impl Profile {
    /// Profile backed by the default config file location
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Result<Self, ProfileError> {
        Ok(Self::with_config_file(name, region, default_config_path()?))
    }

    pub fn with_config_file(
        name: impl Into<String>,
        region: impl Into<String>,
        config_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            config_file: config_file.into(),
            overrides: HashMap::new(),
        }
    }

    /// Add an override applied on top of the loaded file values
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn overrides(&self) -> &HashMap<String, String> {
        &self.overrides
    }
}

/// Resolved values of one profile
#[derive(Debug, Clone, Default)]
pub struct ProfileConfig {
    profile: String,
    base: HashMap<String, String>,
    overrides: HashMap<String, String>,
}

impl ProfileConfig {
    /// Effective value (override first, then file)
    pub fn get(&self, key: &str) -> Option<&str> {
        self.overrides
            .get(key)
            .or_else(|| self.base.get(key))
            .map(String::as_str)
    }

    /// Value straight from the file, ignoring overrides
    pub fn base_value(&self, key: &str) -> Option<&str> {
        self.base.get(key).map(String::as_str)
    }

    pub fn profile_name(&self) -> &str {
        &self.profile
    }

    pub fn region(&self) -> Option<&str> {
        self.get("region")
    }

    pub fn tenancy(&self) -> Option<&str> {
        self.get("tenancy")
    }

    /// Tenancy as configured in the file
    pub fn root_tenancy(&self) -> Option<&str> {
        self.base_value("tenancy")
    }

    /// Signing key associated with the profile
    pub fn key_file(&self) -> Option<PathBuf> {
        self.get("key_file").map(expand_home)
    }

    pub fn security_token_file(&self) -> Option<PathBuf> {
        self.get("security_token_file")
            .filter(|v| !v.is_empty())
            .map(expand_home)
    }

    /// Read the security token referenced by this profile
    pub async fn read_security_token(&self) -> Result<String, ProfileError> {
        let path = self
            .security_token_file()
            .ok_or_else(|| ProfileError::TokenFileMissing(self.profile.clone()))?;
        let token = fs::read_to_string(&path)
            .await
            .map_err(|source| ProfileError::TokenRead {
                path: path.clone(),
                source,
            })?;
        Ok(token.trim().to_string())
    }
}

/// Load a profile's configuration from its config file
pub async fn load_profile_config(profile: &Profile) -> Result<ProfileConfig, ProfileError> {
    let content = match fs::read_to_string(profile.config_file()).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ProfileError::ConfigNotFound(profile.config_file().to_path_buf()));
        }
        Err(e) => return Err(ProfileError::Io(e)),
    };

    let mut sections = parse_config_content(&content)?;

    let defaults = sections.get(DEFAULT_SECTION).cloned().unwrap_or_default();
    let own = match sections.remove(profile.name()) {
        Some(values) => values,
        None => {
            return Err(ProfileError::ProfileNotFound {
                profile: profile.name().to_string(),
                path: profile.config_file().to_path_buf(),
            })
        }
    };

    let mut base = defaults;
    base.extend(own);

    tracing::debug!(
        "Profile '{}' loaded from {:?} ({} keys)",
        profile.name(),
        profile.config_file(),
        base.len()
    );

    Ok(ProfileConfig {
        profile: profile.name().to_string(),
        base,
        overrides: profile.overrides().clone(),
    })
}

/// Parse INI content into `section -> key -> value`
pub fn parse_config_content(
    content: &str,
) -> Result<HashMap<String, HashMap<String, String>>, ProfileError> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.strip_suffix(']').ok_or_else(|| ProfileError::Parse {
                line: idx + 1,
                message: format!("unterminated section header: {}", line),
            })?;
            let name = name.trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }

        let Some(eq_pos) = line.find('=') else {
            return Err(ProfileError::Parse {
                line: idx + 1,
                message: format!("expected key=value, got: {}", line),
            });
        };

        let Some(section) = current.as_ref() else {
            return Err(ProfileError::Parse {
                line: idx + 1,
                message: "key outside of any section".to_string(),
            });
        };

        let key = line[..eq_pos].trim().to_lowercase();
        let value = line[eq_pos + 1..].trim().to_string();
        sections
            .entry(section.clone())
            .or_default()
            .insert(key, value);
    }

    Ok(sections)
}

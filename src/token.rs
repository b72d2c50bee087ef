//! Security Token Manager
//!
//! Owns the bearer token of one cloud profile, decodes its `exp` claim and
//! drives re-authentication through an [`AuthProvider`].
//!
//! A token whose expiration cannot be decoded is treated as already expired;
//! that is a recoverable condition which leads to a forced renewal, never a
//! hard failure.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::auth::AuthProvider;
use crate::config::{load_profile_config, Profile, ProfileConfig, ProfileError};

/// Reasons the expiration claim could not be read
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenDecodeError {
    #[error("token has no payload segment")]
    MissingPayload,
    #[error("payload is not valid base64url")]
    Base64,
    #[error("payload is not a JSON object")]
    Json,
    #[error("payload has no exp claim")]
    MissingExp,
    #[error("exp claim is not a valid timestamp")]
    InvalidExp,
}

/// Decode the `exp` claim of a JWT-shaped token
///
/// The middle segment is padded to a multiple of 4 before base64url decoding.
pub fn decode_expiration(raw: &str) -> Result<DateTime<Utc>, TokenDecodeError> {
    let payload = raw.split('.').nth(1).ok_or(TokenDecodeError::MissingPayload)?;
    if payload.is_empty() {
        return Err(TokenDecodeError::MissingPayload);
    }

    let mut padded = payload.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    let bytes = URL_SAFE
        .decode(padded.as_bytes())
        .map_err(|_| TokenDecodeError::Base64)?;
    let claims: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|_| TokenDecodeError::Json)?;
    let claims = claims.as_object().ok_or(TokenDecodeError::Json)?;

    let exp = claims
        .get("exp")
        .ok_or(TokenDecodeError::MissingExp)?
        .as_f64()
        .ok_or(TokenDecodeError::InvalidExp)?;

    let secs = exp.trunc() as i64;
    let nanos = ((exp - exp.trunc()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or(TokenDecodeError::InvalidExp)
}

/// A signed token plus the expiration decoded from it
///
/// Replaced wholesale on every load; never mutated in place.
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityToken {
    raw: String,
    expires_at: Option<DateTime<Utc>>,
}

impl SecurityToken {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let expires_at = match decode_expiration(&raw) {
            Ok(exp) => Some(exp),
            Err(e) => {
                warn!("Error decoding token expiration: {}", e);
                None
            }
        };
        Self { raw, expires_at }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// `max(exp - now, 0)`; zero when the expiration is unknown
    pub fn time_to_expiry_at(&self, now: DateTime<Utc>) -> Duration {
        match self.expires_at {
            Some(exp) => (exp - now).to_std().unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }
}

impl std::fmt::Debug for SecurityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityToken")
            .field("len", &self.raw.len())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token lifecycle for one profile
pub struct TokenManager {
    profile: Profile,
    config: RwLock<ProfileConfig>,
    token: RwLock<Option<SecurityToken>>,
    auth: Arc<dyn AuthProvider>,
}

impl TokenManager {
    /// Load the profile and its token
    ///
    /// Missing config file, missing profile and a profile without a
    /// `security_token_file` are fatal. An unreadable token file is not: the
    /// manager starts without a token and reports itself expired.
    pub async fn load(profile: Profile, auth: Arc<dyn AuthProvider>) -> Result<Self, ProfileError> {
        debug!("Loading profile '{}' from config file...", profile.name());
        let config = load_profile_config(&profile).await?;
        if config.security_token_file().is_none() {
            return Err(ProfileError::TokenFileMissing(profile.name().to_string()));
        }

        let token = match config.read_security_token().await {
            Ok(raw) => {
                info!("Security token loaded for profile '{}'", profile.name());
                Some(SecurityToken::parse(raw))
            }
            Err(e) => {
                error!("Error loading security token: {}", e);
                None
            }
        };

        info!("Profile '{}' loaded successfully", profile.name());
        Ok(Self {
            profile,
            config: RwLock::new(config),
            token: RwLock::new(token),
            auth,
        })
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Snapshot of the resolved profile values
    pub fn config(&self) -> ProfileConfig {
        self.config.read().clone()
    }

    /// Copy of the current token, if any
    pub fn token(&self) -> Option<SecurityToken> {
        self.token.read().clone()
    }

    pub fn time_to_expiry(&self) -> Duration {
        self.time_to_expiry_at(Utc::now())
    }

    pub fn time_to_expiry_at(&self, now: DateTime<Utc>) -> Duration {
        // a missing token is reported once, at load
        self.token
            .read()
            .as_ref()
            .map_or(Duration::ZERO, |token| token.time_to_expiry_at(now))
    }

    /// True when no token is loaded or its remaining lifetime is zero
    pub fn expired(&self) -> bool {
        self.time_to_expiry().is_zero()
    }

    /// `now + time_to_expiry`
    pub fn expiration(&self) -> DateTime<Utc> {
        let now = Utc::now();
        now + chrono::Duration::from_std(self.time_to_expiry_at(now))
            .unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Renew the token
    ///
    /// `force_new` runs the full authentication flow, otherwise a refresh.
    /// Failures are logged and reported as `false`.
    pub async fn renew(&self, force_new: bool) -> bool {
        let result = if force_new {
            self.auth
                .authenticate(self.profile.name(), self.profile.region())
                .await
        } else {
            self.auth.refresh(self.profile.name()).await
        };

        if let Err(e) = result {
            error!("Token renewal failed: {}", e);
            return false;
        }

        match self.reload().await {
            Ok(()) => {
                info!("Token renewed successfully");
                true
            }
            Err(e) => {
                error!("Token renewed but could not be reloaded: {}", e);
                false
            }
        }
    }

    /// Re-read the profile and token file from disk
    pub async fn reload(&self) -> Result<(), ProfileError> {
        let config = load_profile_config(&self.profile).await?;
        let raw = config.read_security_token().await?;
        *self.config.write() = config;
        *self.token.write() = Some(SecurityToken::parse(raw));
        Ok(())
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("profile", &self.profile.name())
            .field("token", &*self.token.read())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use parking_lot::Mutex;

    use crate::auth::{AuthError, AuthProvider};

    /// Unsigned JWT-shaped token with the given claims
    pub fn make_token(claims: &str) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#),
            URL_SAFE_NO_PAD.encode(claims.as_bytes())
        )
    }

    pub fn token_expiring_in(secs: i64) -> String {
        make_token(&format!(
            r#"{{"sub":"user","exp":{}}}"#,
            chrono::Utc::now().timestamp() + secs
        ))
    }

    /// Write a profile config + token file; returns the config path
    pub fn write_profile(dir: &Path, profile: &str, token: &str) -> PathBuf {
        let token_path = dir.join("token");
        std::fs::write(&token_path, token).unwrap();
        let config_path = dir.join("config");
        std::fs::write(
            &config_path,
            format!(
                "[{}]\nregion=us-luke-1\nsecurity_token_file={}\n",
                profile,
                token_path.display()
            ),
        )
        .unwrap();
        config_path
    }

    /// Records calls and writes a fresh token on success
    pub struct FakeAuth {
        pub token_path: PathBuf,
        pub next_ttl_secs: i64,
        pub succeed: bool,
        pub refreshes: AtomicUsize,
        pub authentications: AtomicUsize,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeAuth {
        pub fn new(token_path: PathBuf, next_ttl_secs: i64, succeed: bool) -> Self {
            Self {
                token_path,
                next_ttl_secs,
                succeed,
                refreshes: AtomicUsize::new(0),
                authentications: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn refreshes(&self) -> usize {
            self.refreshes.load(Ordering::SeqCst)
        }

        pub fn authentications(&self) -> usize {
            self.authentications.load(Ordering::SeqCst)
        }

        fn finish(&self) -> Result<(), AuthError> {
            if !self.succeed {
                return Err(AuthError::Failed {
                    program: "fake".into(),
                    code: Some(1),
                    stderr: "denied".into(),
                });
            }
            std::fs::write(&self.token_path, token_expiring_in(self.next_ttl_secs)).unwrap();
            Ok(())
        }
    }

    #[async_trait]
    impl AuthProvider for FakeAuth {
        async fn authenticate(&self, profile: &str, region: &str) -> Result<(), AuthError> {
            self.authentications.fetch_add(1, Ordering::SeqCst);
            self.calls
                .lock()
                .push(format!("authenticate {} {}", profile, region));
            self.finish()
        }

        async fn refresh(&self, profile: &str) -> Result<(), AuthError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().push(format!("refresh {}", profile));
            self.finish()
        }
    }
}

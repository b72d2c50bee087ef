//! Core Context
//!
//! Built once at startup and passed explicitly to every component instead of
//! global singletons. Also the factory for the lifecycle components so they
//! all share one settings snapshot and one event hub.

use std::sync::Arc;

use crate::auth::{AuthProvider, OciCli};
use crate::bastion::{
    BastionApi, BastionProvisioner, ComputeApi, OciCliBastionApi, ProvisionConfig,
};
use crate::config::{default_config_path, expand_home, AppSettings, Profile, ProfileError};
use crate::events::{CoreEvent, EventHub};
use crate::scheduler::RenewalScheduler;
use crate::token::TokenManager;

#[derive(Debug, Clone)]
pub struct CoreContext {
    settings: Arc<AppSettings>,
    events: Arc<EventHub<CoreEvent>>,
}

impl CoreContext {
    pub fn new(settings: AppSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            events: Arc::new(EventHub::new()),
        }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn events(&self) -> &Arc<EventHub<CoreEvent>> {
        &self.events
    }

    /// Profile selected in settings, with the tenancy override applied
    pub fn profile(&self) -> Result<Profile, ProfileError> {
        let selected = &self.settings.profile;
        let config_file = match &selected.config_file {
            Some(path) => expand_home(&path.to_string_lossy()),
            None => default_config_path()?,
        };

        let mut profile = Profile::with_config_file(&selected.name, &selected.region, config_file);
        if let Some(tenancy) = &self.settings.connection.tenancy_override {
            profile = profile.with_override("tenancy", tenancy);
        }
        Ok(profile)
    }

    /// Authentication CLI from settings
    pub fn auth_provider(&self) -> Arc<dyn AuthProvider> {
        Arc::new(OciCli::new(&self.settings.settings.cli_program))
    }

    pub async fn token_manager(&self) -> Result<Arc<TokenManager>, ProfileError> {
        let tokens = TokenManager::load(self.profile()?, self.auth_provider()).await?;
        Ok(Arc::new(tokens))
    }

    pub fn renewal_scheduler(&self, tokens: Arc<TokenManager>) -> RenewalScheduler {
        RenewalScheduler::new(
            tokens,
            self.events.clone(),
            self.settings.settings.token_renewal_margin(),
        )
    }

    /// Bastion service client for a loaded profile
    ///
    /// The region comes from the profile file, falling back to settings.
    pub fn bastion_api(&self, tokens: &TokenManager) -> Arc<dyn BastionApi> {
        Arc::new(self.cli_client(tokens))
    }

    /// Instance listing client, same CLI and credentials as [`Self::bastion_api`]
    pub fn compute_api(&self, tokens: &TokenManager) -> Arc<dyn ComputeApi> {
        Arc::new(self.cli_client(tokens))
    }

    fn cli_client(&self, tokens: &TokenManager) -> OciCliBastionApi {
        OciCliBastionApi::new(
            &self.settings.settings.cli_program,
            tokens.profile().name(),
            self.region(tokens),
        )
    }

    pub fn provisioner(&self, api: Arc<dyn BastionApi>) -> Arc<BastionProvisioner> {
        Arc::new(BastionProvisioner::new(
            api,
            ProvisionConfig::from(self.settings.as_ref()),
            self.events.clone(),
        ))
    }

    /// Effective region: profile file first, then settings
    pub fn region(&self, tokens: &TokenManager) -> String {
        tokens
            .config()
            .region()
            .map(str::to_string)
            .unwrap_or_else(|| tokens.profile().region().to_string())
    }
}

use crate::application::error::SessionError;
use crate::application::retry::RetryPolicy;
use crate::application::session_controller::SessionController;
use crate::application::session_store::SessionStore;
use crate::domain::models::PracticeType;
use crate::infrastructure::config::{PracticeConfig, ensure_default_config, load_config};
use crate::infrastructure::credential_store::{KeyringTokenStore, TokenStore};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::practice_api_client::{PracticeApiClient, ReqwestPracticeApiClient};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared collaborators for every practice session the host opens.
pub struct PracticeServices<C, T>
where
    C: PracticeApiClient + 'static,
    T: TokenStore + 'static,
{
    config: PracticeConfig,
    store: Arc<SessionStore<C, T>>,
}

pub type DefaultPracticeServices = PracticeServices<ReqwestPracticeApiClient, KeyringTokenStore>;

impl<C, T> PracticeServices<C, T>
where
    C: PracticeApiClient + 'static,
    T: TokenStore + 'static,
{
    pub fn new(config: PracticeConfig, api_client: Arc<C>, token_store: Arc<T>) -> Self {
        let store = SessionStore::new(api_client, token_store)
            .with_start_retry(RetryPolicy::from(config.start_retry))
            .with_persist_retry(RetryPolicy::from(config.persist_retry));
        Self {
            config,
            store: Arc::new(store),
        }
    }

    pub fn config(&self) -> &PracticeConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<SessionStore<C, T>> {
        Arc::clone(&self.store)
    }

    /// New controller for one attempt at `practice_type`. Must be called
    /// inside a Tokio runtime.
    pub fn controller(
        &self,
        practice_type: PracticeType,
    ) -> Result<SessionController<C, T>, SessionError> {
        Ok(SessionController::new(practice_type, Arc::clone(&self.store))?
            .with_autosave_interval(Duration::from_secs(self.config.autosave_interval_seconds))
            .with_fetch_stats(self.config.fetch_stats_on_complete))
    }
}

/// Prepares `<workspace_root>/config/practice.json` and wires the HTTP client
/// and OS keyring from it. `lookup` supplies environment overrides.
pub fn bootstrap_workspace<F>(
    workspace_root: &Path,
    lookup: F,
) -> Result<DefaultPracticeServices, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let config_dir = workspace_root.join("config");
    ensure_default_config(&config_dir)?;
    let config = load_config(&config_dir, lookup)?;

    let api_client = ReqwestPracticeApiClient::new(
        &config.api_base_url,
        Duration::from_secs(config.request_timeout_seconds),
    )?;
    let token_store =
        KeyringTokenStore::new(config.credential_service.clone(), config.credential_account.clone());
    info!(
        api_base_url = %config.api_base_url,
        autosave_interval_seconds = config.autosave_interval_seconds,
        "practice services ready"
    );
    Ok(PracticeServices::new(
        config,
        Arc::new(api_client),
        Arc::new(token_store),
    ))
}

use crate::domain::models::AuthToken;
use crate::infrastructure::error::InfraError;
use std::sync::{Mutex, MutexGuard};

/// Where the signed-in user's API token lives. Read before every request so a
/// token refreshed by the host is picked up without restarting a session.
pub trait TokenStore: Send + Sync {
    fn save_token(&self, token: &AuthToken) -> Result<(), InfraError>;
    fn load_token(&self) -> Result<Option<AuthToken>, InfraError>;
    fn delete_token(&self) -> Result<(), InfraError>;
}

fn keyring_error(error: keyring::Error) -> InfraError {
    InfraError::Credential(error.to_string())
}

/// Decodes a keyring payload. Current clients write the token as JSON; older
/// ones wrote the bare access token. Blank payloads hold no token.
pub fn decode_stored_token(payload: &str) -> Result<Option<AuthToken>, InfraError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.starts_with('{') {
        return serde_json::from_str::<AuthToken>(trimmed)
            .map(Some)
            .map_err(|error| InfraError::Credential(format!("unreadable stored token: {error}")));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(InfraError::Credential(
            "stored token is neither JSON nor a bare access token".to_string(),
        ));
    }
    Ok(Some(AuthToken::bearer(trimmed)))
}

/// Token store backed by the platform keyring (Keychain, Credential Manager,
/// Secret Service).
#[derive(Debug, Clone)]
pub struct KeyringTokenStore {
    service: String,
    account: String,
}

impl KeyringTokenStore {
    pub const DEFAULT_SERVICE: &'static str = "practice.api.token";
    pub const DEFAULT_ACCOUNT: &'static str = "default";

    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, InfraError> {
        keyring::Entry::new(&self.service, &self.account).map_err(keyring_error)
    }
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SERVICE, Self::DEFAULT_ACCOUNT)
    }
}

impl TokenStore for KeyringTokenStore {
    fn save_token(&self, token: &AuthToken) -> Result<(), InfraError> {
        let payload = serde_json::to_string(token)?;
        self.entry()?.set_password(&payload).map_err(keyring_error)
    }

    fn load_token(&self) -> Result<Option<AuthToken>, InfraError> {
        match self.entry()?.get_password() {
            Ok(payload) => decode_stored_token(&payload),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(keyring_error(error)),
        }
    }

    fn delete_token(&self) -> Result<(), InfraError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(keyring_error(error)),
        }
    }
}

/// Process-local token store for hosts without a keyring and for tests.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    token: Mutex<Option<AuthToken>>,
}

impl InMemoryTokenStore {
    pub fn with_token(token: AuthToken) -> Self {
        Self {
            token: Mutex::new(Some(token)),
        }
    }

    fn slot(&self) -> Result<MutexGuard<'_, Option<AuthToken>>, InfraError> {
        self.token
            .lock()
            .map_err(|error| InfraError::Credential(format!("token slot poisoned: {error}")))
    }
}

impl TokenStore for InMemoryTokenStore {
    fn save_token(&self, token: &AuthToken) -> Result<(), InfraError> {
        *self.slot()? = Some(token.clone());
        Ok(())
    }

    fn load_token(&self) -> Result<Option<AuthToken>, InfraError> {
        Ok(self.slot()?.clone())
    }

    fn delete_token(&self) -> Result<(), InfraError> {
        self.slot()?.take();
        Ok(())
    }
}

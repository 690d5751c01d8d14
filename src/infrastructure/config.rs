use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const PRACTICE_JSON: &str = "practice.json";
const SUPPORTED_SCHEMA: u64 = 1;

const ENV_API_BASE_URL: &[&str] = &["PRACTICE_API_BASE_URL"];
const ENV_AUTOSAVE_INTERVAL: &[&str] = &["PRACTICE_AUTOSAVE_INTERVAL_SECONDS"];
const ENV_REQUEST_TIMEOUT: &[&str] = &["PRACTICE_REQUEST_TIMEOUT_SECONDS"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PracticeConfig {
    pub schema: u8,
    pub api_base_url: String,
    #[serde(default = "default_autosave_interval_seconds")]
    pub autosave_interval_seconds: u64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_persist_retry")]
    pub persist_retry: RetrySettings,
    #[serde(default = "default_start_retry")]
    pub start_retry: RetrySettings,
    #[serde(default = "default_fetch_stats_on_complete")]
    pub fetch_stats_on_complete: bool,
    #[serde(default = "default_credential_service")]
    pub credential_service: String,
    #[serde(default = "default_credential_account")]
    pub credential_account: String,
}

fn default_autosave_interval_seconds() -> u64 {
    10
}

fn default_request_timeout_seconds() -> u64 {
    15
}

fn default_persist_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: 3,
        base_delay_ms: 500,
    }
}

fn default_start_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: 2,
        base_delay_ms: 300,
    }
}

fn default_fetch_stats_on_complete() -> bool {
    true
}

fn default_credential_service() -> String {
    "practice.api.token".to_string()
}

fn default_credential_account() -> String {
    "default".to_string()
}

impl Default for PracticeConfig {
    fn default() -> Self {
        Self {
            schema: SUPPORTED_SCHEMA as u8,
            api_base_url: "http://localhost:3000/api/".to_string(),
            autosave_interval_seconds: default_autosave_interval_seconds(),
            request_timeout_seconds: default_request_timeout_seconds(),
            persist_retry: default_persist_retry(),
            start_retry: default_start_retry(),
            fetch_stats_on_complete: default_fetch_stats_on_complete(),
            credential_service: default_credential_service(),
            credential_account: default_credential_account(),
        }
    }
}

impl PracticeConfig {
    pub fn validate(&self) -> Result<(), InfraError> {
        if self.api_base_url.trim().is_empty() {
            return Err(InfraError::InvalidConfig(
                "apiBaseUrl must not be empty".to_string(),
            ));
        }
        if self.autosave_interval_seconds == 0 {
            return Err(InfraError::InvalidConfig(
                "autosaveIntervalSeconds must be > 0".to_string(),
            ));
        }
        if self.request_timeout_seconds == 0 {
            return Err(InfraError::InvalidConfig(
                "requestTimeoutSeconds must be > 0".to_string(),
            ));
        }
        if self.persist_retry.max_attempts == 0 || self.start_retry.max_attempts == 0 {
            return Err(InfraError::InvalidConfig(
                "retry maxAttempts must be >= 1".to_string(),
            ));
        }
        if self.credential_service.trim().is_empty() || self.credential_account.trim().is_empty() {
            return Err(InfraError::InvalidConfig(
                "credentialService and credentialAccount must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn ensure_default_config(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(PRACTICE_JSON);
    if !path.exists() {
        fs::create_dir_all(config_dir)?;
        let formatted = serde_json::to_string_pretty(&PracticeConfig::default())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

/// Reads `practice.json` and applies environment overrides from `lookup`.
pub fn load_config<F>(config_dir: &Path, lookup: F) -> Result<PracticeConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = read_config(&config_dir.join(PRACTICE_JSON))?;
    let mut config: PracticeConfig = serde_json::from_value(raw)?;
    apply_overrides(&mut config, &lookup)?;
    config.validate()?;
    Ok(config)
}

fn apply_overrides<F>(config: &mut PracticeConfig, lookup: &F) -> Result<(), InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(base_url) = optional_lookup_value(lookup, ENV_API_BASE_URL) {
        config.api_base_url = base_url;
    }
    if let Some(seconds) = seconds_lookup_value(lookup, ENV_AUTOSAVE_INTERVAL)? {
        config.autosave_interval_seconds = seconds;
    }
    if let Some(seconds) = seconds_lookup_value(lookup, ENV_REQUEST_TIMEOUT)? {
        config.request_timeout_seconds = seconds;
    }
    Ok(())
}

fn seconds_lookup_value<F>(lookup: &F, keys: &[&str]) -> Result<Option<u64>, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    optional_lookup_value(lookup, keys)
        .map(|raw| {
            raw.parse::<u64>().map_err(|_| {
                InfraError::InvalidConfig(format!(
                    "{} must be a whole number of seconds, got '{raw}'",
                    keys.join(", ")
                ))
            })
        })
        .transpose()
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}

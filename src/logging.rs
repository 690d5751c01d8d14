use crate::infrastructure::error::InfraError;
use tracing_subscriber::EnvFilter;

/// Installs a global fmt subscriber for the hosting shell. `RUST_LOG` takes
/// precedence over `default_directive` (e.g. `"practice_session=info"`).
pub fn init_tracing(default_directive: &str) -> Result<(), InfraError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|error| InfraError::InvalidConfig(format!("invalid log directive: {error}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|error| InfraError::InvalidConfig(format!("tracing already initialized: {error}")))
}

pub mod config;
pub mod credential_store;
pub mod error;
pub mod practice_api_client;

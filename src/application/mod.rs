pub mod bootstrap;
pub mod completion;
pub mod error;
pub mod progress_persister;
pub mod retry;
pub mod session_controller;
pub mod session_store;

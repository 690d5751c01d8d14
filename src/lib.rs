//! Lifecycle core for guided practice sessions: step flows, foreground time
//! tracking, progress persistence and completion against the practice API.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod logging;

#[cfg(test)]
mod testing;

pub use application::bootstrap::{DefaultPracticeServices, PracticeServices, bootstrap_workspace};
pub use application::completion::CompletionSummary;
pub use application::error::SessionError;
pub use application::progress_persister::{PersistHealth, PersistOutcome};
pub use application::session_controller::{
    AdvanceOutcome, ControllerPhase, SessionController, SessionView,
};
pub use domain::models::{
    AggregateStats, AuthToken, FieldValue, FormData, PracticeSession, PracticeType, SessionStatus,
};
pub use domain::step_flow::{StepFlowModel, StepKind};
pub use infrastructure::config::PracticeConfig;

pub mod clock;
pub mod models;
pub mod step_flow;
pub mod time_tracker;

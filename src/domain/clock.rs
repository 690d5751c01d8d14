use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Wall-clock source shared by every time-dependent component.
pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> NowProvider {
    Arc::new(Utc::now)
}

/// Milliseconds from `earlier` to `later`, clamped at zero so a clock stepping
/// backwards never subtracts time.
pub fn elapsed_millis(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
    (later - earlier).num_milliseconds().max(0) as u64
}

use crate::domain::clock::{NowProvider, elapsed_millis, system_clock};
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Stopped,
    Running,
    Completed,
}

/// Accumulates foreground practice time. Time spent while stopped (the app in
/// the background) never contributes to the total.
#[derive(Clone)]
pub struct TimeTracker {
    state: TrackerState,
    accumulated_millis: u64,
    baseline: Option<DateTime<Utc>>,
    now_provider: NowProvider,
}

impl fmt::Debug for TimeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeTracker")
            .field("state", &self.state)
            .field("accumulated_millis", &self.accumulated_millis)
            .field("baseline", &self.baseline)
            .finish()
    }
}

impl Default for TimeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeTracker {
    pub fn new() -> Self {
        Self {
            state: TrackerState::Stopped,
            accumulated_millis: 0,
            baseline: None,
            now_provider: system_clock(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    /// Seeds the tracker with time observed in an earlier, resumed attempt.
    pub fn with_accumulated_seconds(mut self, seconds: u64) -> Self {
        self.accumulated_millis = seconds.saturating_mul(1000);
        self
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == TrackerState::Running
    }

    pub fn start(&mut self) {
        if self.state != TrackerState::Stopped {
            return;
        }
        self.baseline = Some((self.now_provider)());
        self.state = TrackerState::Running;
    }

    pub fn suspend(&mut self) {
        if self.state != TrackerState::Running {
            return;
        }
        self.fold_running_time();
        self.state = TrackerState::Stopped;
    }

    pub fn resume(&mut self) {
        self.start();
    }

    /// Freezes the tracker and returns the final total in whole seconds.
    pub fn complete(&mut self) -> u64 {
        if self.state == TrackerState::Running {
            self.fold_running_time();
        }
        self.state = TrackerState::Completed;
        self.accumulated_millis / 1000
    }

    /// Drops all observed time and stops the tracker.
    pub fn reset(&mut self) {
        self.state = TrackerState::Stopped;
        self.accumulated_millis = 0;
        self.baseline = None;
    }

    pub fn current_total_millis(&self) -> u64 {
        match (self.state, self.baseline) {
            (TrackerState::Running, Some(baseline)) => self
                .accumulated_millis
                .saturating_add(elapsed_millis(baseline, (self.now_provider)())),
            _ => self.accumulated_millis,
        }
    }

    pub fn current_total(&self) -> u64 {
        self.current_total_millis() / 1000
    }

    fn fold_running_time(&mut self) {
        if let Some(baseline) = self.baseline.take() {
            let elapsed = elapsed_millis(baseline, (self.now_provider)());
            self.accumulated_millis = self.accumulated_millis.saturating_add(elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;
    use proptest::prelude::*;

    fn tracker(clock: &ManualClock) -> TimeTracker {
        TimeTracker::new().with_now_provider(clock.provider())
    }

    #[test]
    fn background_gap_contributes_nothing() {
        let clock = ManualClock::new();
        let mut tracker = tracker(&clock);

        tracker.start();
        clock.advance_seconds(5);
        tracker.suspend();
        clock.advance_seconds(100);
        assert_eq!(tracker.current_total(), 5);
        tracker.resume();
        clock.advance_seconds(3);

        assert_eq!(tracker.current_total(), 8);
    }

    #[test]
    fn current_total_does_not_mutate_state() {
        let clock = ManualClock::new();
        let mut tracker = tracker(&clock);
        tracker.start();
        clock.advance_seconds(2);

        let first = tracker.current_total();
        let second = tracker.current_total();
        assert_eq!(first, second);
        assert!(tracker.is_running());
    }

    #[test]
    fn sub_second_slices_are_not_lost_across_cycles() {
        let clock = ManualClock::new();
        let mut tracker = tracker(&clock);
        for _ in 0..4 {
            tracker.resume();
            clock.advance_millis(600);
            tracker.suspend();
        }
        assert_eq!(tracker.current_total(), 2);
    }

    #[test]
    fn clock_skew_is_clamped() {
        let clock = ManualClock::new();
        let mut tracker = tracker(&clock).with_accumulated_seconds(10);
        tracker.start();
        clock.advance_seconds(-30);
        assert_eq!(tracker.current_total(), 10);
        tracker.suspend();
        assert_eq!(tracker.current_total(), 10);
    }

    #[test]
    fn complete_freezes_total() {
        let clock = ManualClock::new();
        let mut tracker = tracker(&clock).with_accumulated_seconds(42);
        tracker.start();
        clock.advance_seconds(8);

        assert_eq!(tracker.complete(), 50);
        clock.advance_seconds(60);
        tracker.resume();
        assert_eq!(tracker.state(), TrackerState::Completed);
        assert_eq!(tracker.current_total(), 50);
    }

    #[test]
    fn reset_clears_time_and_stops() {
        let clock = ManualClock::new();
        let mut tracker = tracker(&clock).with_accumulated_seconds(42);
        tracker.start();
        tracker.reset();
        clock.advance_seconds(5);
        assert_eq!(tracker.current_total(), 0);
        assert_eq!(tracker.state(), TrackerState::Stopped);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start,
        Suspend,
        Wait(i64),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            Just(Op::Suspend),
            (0i64..5_000).prop_map(Op::Wait),
        ]
    }

    // Total equals foreground time only and never decreases.
    proptest! {
        #[test]
        fn total_tracks_foreground_time_only(ops in prop::collection::vec(arb_op(), 0..48)) {
            let clock = ManualClock::new();
            let mut tracker = tracker(&clock);
            let mut running = false;
            let mut expected_millis = 0u64;
            let mut previous = 0u64;

            for op in ops {
                match op {
                    Op::Start => {
                        tracker.resume();
                        running = true;
                    }
                    Op::Suspend => {
                        tracker.suspend();
                        running = false;
                    }
                    Op::Wait(millis) => {
                        clock.advance_millis(millis);
                        if running {
                            expected_millis += millis as u64;
                        }
                    }
                }
                let total = tracker.current_total_millis();
                prop_assert_eq!(total, expected_millis);
                prop_assert!(total >= previous);
                previous = total;
            }
        }
    }
}

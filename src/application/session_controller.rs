use crate::application::completion::{CompletionAggregator, CompletionSummary};
use crate::application::error::SessionError;
use crate::application::progress_persister::{
    AutosaveTicker, PersistHealth, PersistOutcome, ProgressPersister,
};
use crate::application::session_store::{ProgressSnapshot, SessionStore, StartedSession};
use crate::domain::clock::{NowProvider, system_clock};
use crate::domain::models::{
    FieldValue, FormData, PracticeSession, PracticeType, SessionStatus,
};
use crate::domain::step_flow::{StepFlowModel, StepKind, StepMove};
use crate::domain::time_tracker::TimeTracker;
use crate::infrastructure::credential_store::TokenStore;
use crate::infrastructure::practice_api_client::PracticeApiClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

static NEXT_COMPLETION_KEY: AtomicU64 = AtomicU64::new(1);

fn next_completion_key(now: DateTime<Utc>) -> String {
    let sequence = NEXT_COMPLETION_KEY.fetch_add(1, Ordering::Relaxed);
    format!("complete-{}-{sequence}", now.timestamp_micros())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    NotStarted,
    Starting,
    /// `start` failed; time is tracked locally and `start` may be retried.
    Degraded,
    Active,
    Completing,
    Completed,
}

impl ControllerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Degraded => "degraded",
            Self::Active => "active",
            Self::Completing => "completing",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Moved { step_index: usize },
    Stayed { step_index: usize },
    Completed {
        step_index: usize,
        summary: CompletionSummary,
    },
}

/// Read-only picture of the controller for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub phase: ControllerPhase,
    pub session: PracticeSession,
    pub step_id: &'static str,
    pub step_kind: StepKind,
    /// One-based position among applicable steps and their count.
    pub visible_position: (usize, usize),
    pub summary: Option<CompletionSummary>,
}

struct SessionRuntime {
    session: PracticeSession,
    tracker: TimeTracker,
    now_provider: NowProvider,
    phase: ControllerPhase,
    foreground: bool,
    next_seq: u64,
    summary: Option<CompletionSummary>,
}

impl SessionRuntime {
    fn new(flow: &StepFlowModel, now_provider: NowProvider) -> Self {
        Self {
            session: PracticeSession::placeholder(flow.practice_type(), flow.len()),
            tracker: TimeTracker::new().with_now_provider(Arc::clone(&now_provider)),
            now_provider,
            phase: ControllerPhase::NotStarted,
            foreground: true,
            next_seq: 0,
            summary: None,
        }
    }

    /// Captures the current progress under the next sequence number. Returns
    /// `None` until the server has assigned a session id.
    fn snapshot(&mut self) -> Option<ProgressSnapshot> {
        let session_id = self.session.session_id()?.to_string();
        self.next_seq += 1;
        Some(ProgressSnapshot {
            seq: self.next_seq,
            session_id,
            step_index: self.session.step_index,
            total_steps: self.session.total_steps,
            form_data: self.session.form_data.clone(),
            accumulated_seconds: self.tracker.current_total(),
        })
    }
}

/// Moves the phase back when an in-flight start or completion is abandoned.
struct PhaseRollback<'a> {
    runtime: &'a Mutex<SessionRuntime>,
    pending: ControllerPhase,
    fallback: ControllerPhase,
}

impl Drop for PhaseRollback<'_> {
    fn drop(&mut self) {
        if let Ok(mut runtime) = self.runtime.lock() {
            if runtime.phase == self.pending {
                runtime.phase = self.fallback;
            }
        }
    }
}

/// Drives one practice attempt from start to completion.
///
/// Must be created inside a Tokio runtime: progress persistence and autosave
/// run as background tasks on it. Dropping the controller stops autosave;
/// persists already queued still reach the server.
pub struct SessionController<C, T>
where
    C: PracticeApiClient + 'static,
    T: TokenStore + 'static,
{
    flow: Arc<StepFlowModel>,
    store: Arc<SessionStore<C, T>>,
    persister: ProgressPersister,
    aggregator: CompletionAggregator<C, T>,
    runtime: Arc<Mutex<SessionRuntime>>,
    autosave: Mutex<Option<AutosaveTicker>>,
    autosave_interval: Duration,
    completion_key: String,
    handle: Handle,
}

impl<C, T> SessionController<C, T>
where
    C: PracticeApiClient + 'static,
    T: TokenStore + 'static,
{
    pub fn new(
        practice_type: PracticeType,
        store: Arc<SessionStore<C, T>>,
    ) -> Result<Self, SessionError> {
        Self::with_flow(StepFlowModel::for_practice(practice_type), store)
    }

    pub fn with_flow(
        flow: StepFlowModel,
        store: Arc<SessionStore<C, T>>,
    ) -> Result<Self, SessionError> {
        let handle = Handle::try_current().map_err(|_| {
            SessionError::Config("session controller requires a Tokio runtime".to_string())
        })?;
        let now_provider = system_clock();
        let persister = ProgressPersister::spawn(&handle, Arc::clone(&store));
        let runtime = SessionRuntime::new(&flow, Arc::clone(&now_provider));
        Ok(Self {
            flow: Arc::new(flow),
            aggregator: CompletionAggregator::new(Arc::clone(&store)),
            store,
            persister,
            runtime: Arc::new(Mutex::new(runtime)),
            autosave: Mutex::new(None),
            autosave_interval: Duration::from_secs(10),
            completion_key: next_completion_key(now_provider()),
            handle,
        })
    }

    /// Replaces the clock used for time tracking. Call before `start`.
    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.runtime = Arc::new(Mutex::new(SessionRuntime::new(&self.flow, now_provider)));
        self
    }

    pub fn with_autosave_interval(mut self, interval: Duration) -> Self {
        self.autosave_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_fetch_stats(mut self, fetch_stats: bool) -> Self {
        self.aggregator = CompletionAggregator::new(Arc::clone(&self.store)).with_fetch_stats(fetch_stats);
        self
    }

    pub fn practice_type(&self) -> PracticeType {
        self.flow.practice_type()
    }

    pub fn flow(&self) -> &StepFlowModel {
        &self.flow
    }

    pub fn persist_health(&self) -> watch::Receiver<PersistHealth> {
        self.persister.health()
    }

    fn lock_runtime(&self) -> Result<MutexGuard<'_, SessionRuntime>, SessionError> {
        self.runtime.lock().map_err(|error| {
            SessionError::InvalidState(format!("session state lock poisoned: {error}"))
        })
    }

    pub fn phase(&self) -> Result<ControllerPhase, SessionError> {
        Ok(self.lock_runtime()?.phase)
    }

    pub fn view(&self) -> Result<SessionView, SessionError> {
        let runtime = self.lock_runtime()?;
        Ok(self.build_view(&runtime))
    }

    fn build_view(&self, runtime: &SessionRuntime) -> SessionView {
        let mut session = runtime.session.clone();
        if runtime.phase != ControllerPhase::Completed {
            session.accumulated_seconds = runtime.tracker.current_total();
        }
        let (step_id, step_kind) = self
            .flow
            .step(session.step_index)
            .map(|step| (step.id, step.kind))
            .unwrap_or(("", StepKind::Intro));
        SessionView {
            phase: runtime.phase,
            visible_position: self
                .flow
                .visible_position(session.step_index, &session.form_data),
            session,
            step_id,
            step_kind,
            summary: runtime.summary.clone(),
        }
    }

    fn enqueue_progress(&self, runtime: &mut SessionRuntime) {
        if let Some(snapshot) = runtime.snapshot() {
            if let Err(error) = self.persister.enqueue(snapshot) {
                warn!(error = %error, "progress snapshot dropped");
            }
        }
    }

    /// Starts or resumes the server session for this practice type.
    ///
    /// On failure the controller enters [`ControllerPhase::Degraded`]: time
    /// keeps being tracked and form fields can be edited, but navigation and
    /// completion report [`SessionError::SessionNotInitialized`] until a later
    /// `start` succeeds.
    pub async fn start(&self) -> Result<SessionView, SessionError> {
        let was_degraded = {
            let mut runtime = self.lock_runtime()?;
            let was_degraded = match runtime.phase {
                ControllerPhase::NotStarted => false,
                ControllerPhase::Degraded => true,
                ControllerPhase::Completed => return Err(SessionError::AlreadyCompleted),
                phase => {
                    return Err(SessionError::InvalidState(format!(
                        "session is {}",
                        phase.as_str()
                    )));
                }
            };
            runtime.phase = ControllerPhase::Starting;
            if runtime.foreground {
                runtime.tracker.start();
            }
            was_degraded
        };
        let _rollback = PhaseRollback {
            runtime: &self.runtime,
            pending: ControllerPhase::Starting,
            fallback: ControllerPhase::Degraded,
        };

        let result = self.store.start(self.flow.practice_type()).await;
        let mut runtime = self.lock_runtime()?;
        let started = match result {
            Ok(started) => started,
            Err(error) => {
                error!(
                    practice_type = %self.flow.practice_type(),
                    error = %error,
                    "failed to start practice session"
                );
                runtime.phase = ControllerPhase::Degraded;
                return Err(error);
            }
        };

        self.reconcile(&mut runtime, started, was_degraded);
        runtime.phase = ControllerPhase::Active;
        runtime.session.status = if runtime.foreground {
            SessionStatus::Active
        } else {
            SessionStatus::Suspended
        };
        info!(
            practice_type = %self.flow.practice_type(),
            session_id = runtime.session.session_id().unwrap_or_default(),
            fresh = runtime.session.is_fresh_session,
            step_index = runtime.session.step_index,
            "practice session started"
        );
        let view = self.build_view(&runtime);
        drop(runtime);

        self.start_autosave()?;
        Ok(view)
    }

    fn reconcile(&self, runtime: &mut SessionRuntime, started: StartedSession, was_degraded: bool) {
        // Without an explicit flag, any progress in the response means resume.
        let fresh = started
            .is_fresh_session
            .unwrap_or_else(|| !started.has_progress());
        if let Some(total) = started.total_steps {
            if total != self.flow.len() as i64 {
                debug!(
                    server_total = total,
                    local_total = self.flow.len(),
                    "server step count differs from flow"
                );
            }
        }
        runtime.session.session_id = Some(started.session_id);
        runtime.session.is_fresh_session = fresh;

        if fresh {
            // Work done while degraded belongs to the new session.
            if !was_degraded {
                runtime.session.step_index = 0;
                runtime.session.form_data.clear();
                runtime.tracker.reset();
            }
        } else {
            let practice_type = self.flow.practice_type();
            let (mut form, dropped) = match started.form_data.as_ref() {
                Some(raw) => self.flow.decode_form(raw),
                None => (FormData::new(practice_type), Vec::new()),
            };
            if !dropped.is_empty() {
                warn!(fields = ?dropped, "ignored server form fields outside the schema");
            }
            let mut seconds = started.accumulated_seconds.unwrap_or(0);
            if was_degraded {
                form.overlay(&runtime.session.form_data);
                seconds = seconds.saturating_add(runtime.tracker.current_total());
            }
            runtime.session.step_index = self.resume_index(started.step_index.unwrap_or(0));
            runtime.session.form_data = form;
            runtime.tracker = TimeTracker::new()
                .with_now_provider(Arc::clone(&runtime.now_provider))
                .with_accumulated_seconds(seconds);
        }
        runtime.session.accumulated_seconds = runtime.tracker.current_total();
        if runtime.foreground {
            runtime.tracker.start();
        }
    }

    /// Clamps a server step into range. A resumed session never lands on a
    /// post-completion step because it has not been completed.
    fn resume_index(&self, raw: i64) -> usize {
        let index = self.flow.clamp_index(raw);
        if self.flow.is_post_completion(index) {
            self.flow
                .first_post_completion_index()
                .map(|first| first.saturating_sub(1))
                .unwrap_or(index)
        } else {
            index
        }
    }

    fn ensure_navigable(&self, phase: ControllerPhase) -> Result<(), SessionError> {
        match phase {
            ControllerPhase::Active => Ok(()),
            ControllerPhase::Completed => Err(SessionError::AlreadyCompleted),
            ControllerPhase::Completing => Err(SessionError::InvalidState(
                "completion in progress".to_string(),
            )),
            ControllerPhase::NotStarted | ControllerPhase::Starting | ControllerPhase::Degraded => {
                Err(SessionError::SessionNotInitialized)
            }
        }
    }

    /// Moves to the next applicable step. Leaving the last content step
    /// completes the session first and only moves once completion succeeded;
    /// on failure the step is unchanged and the error can be retried.
    pub async fn advance(&self) -> Result<AdvanceOutcome, SessionError> {
        {
            let mut runtime = self.lock_runtime()?;
            let current = runtime.session.step_index;
            if runtime.phase == ControllerPhase::Completed {
                let target = match self.flow.next_step(current, &runtime.session.form_data) {
                    StepMove::Step(next) => next,
                    StepMove::Terminal => current,
                };
                return if target == current {
                    Ok(AdvanceOutcome::Stayed {
                        step_index: current,
                    })
                } else {
                    runtime.session.step_index = target;
                    Ok(AdvanceOutcome::Moved { step_index: target })
                };
            }
            self.ensure_navigable(runtime.phase)?;

            match self.flow.next_step(current, &runtime.session.form_data) {
                StepMove::Step(next) if !self.flow.is_post_completion(next) => {
                    if next == current {
                        return Ok(AdvanceOutcome::Stayed {
                            step_index: current,
                        });
                    }
                    runtime.session.step_index = next;
                    self.enqueue_progress(&mut runtime);
                    debug!(from = current, to = next, "advanced step");
                    return Ok(AdvanceOutcome::Moved { step_index: next });
                }
                StepMove::Step(_) | StepMove::Terminal => {}
            }
        }

        let summary = self.complete().await?;
        let step_index = self.lock_runtime()?.session.step_index;
        Ok(AdvanceOutcome::Completed {
            step_index,
            summary,
        })
    }

    pub fn retreat(&self) -> Result<usize, SessionError> {
        let mut runtime = self.lock_runtime()?;
        let current = runtime.session.step_index;
        let previous = self.flow.prev_step(current, &runtime.session.form_data);
        if runtime.phase == ControllerPhase::Completed {
            if previous == current || !self.flow.is_post_completion(previous) {
                return Err(SessionError::AlreadyCompleted);
            }
            runtime.session.step_index = previous;
            return Ok(previous);
        }
        self.ensure_navigable(runtime.phase)?;

        if previous != current {
            runtime.session.step_index = previous;
            self.enqueue_progress(&mut runtime);
            debug!(from = current, to = previous, "retreated step");
        }
        Ok(previous)
    }

    /// Moves directly to `index`, which must be applicable and must not skip
    /// past completion.
    pub fn jump_to(&self, index: usize) -> Result<usize, SessionError> {
        let mut runtime = self.lock_runtime()?;
        if index >= self.flow.len() {
            return Err(SessionError::Validation(format!(
                "step {index} is out of range for {} steps",
                self.flow.len()
            )));
        }
        if runtime.phase == ControllerPhase::Completed {
            if !self.flow.is_post_completion(index) {
                return Err(SessionError::AlreadyCompleted);
            }
            runtime.session.step_index = index;
            return Ok(index);
        }
        self.ensure_navigable(runtime.phase)?;

        if self.flow.is_post_completion(index) {
            return Err(SessionError::Validation(
                "cannot jump past completion".to_string(),
            ));
        }
        if !self.flow.is_visible(index, &runtime.session.form_data) {
            return Err(SessionError::Validation(format!(
                "step {index} does not apply to the current answers"
            )));
        }
        if index != runtime.session.step_index {
            runtime.session.step_index = index;
            self.enqueue_progress(&mut runtime);
        }
        Ok(index)
    }

    /// Validates and stores a form value. Persisted by the next autosave or
    /// step transition. If the answer makes the current step inapplicable the
    /// session moves to the nearest step that still applies.
    pub fn update_field(&self, name: &str, value: FieldValue) -> Result<(), SessionError> {
        let mut runtime = self.lock_runtime()?;
        match runtime.phase {
            ControllerPhase::Active | ControllerPhase::Degraded => {}
            ControllerPhase::NotStarted => return Err(SessionError::SessionNotInitialized),
            ControllerPhase::Completed => return Err(SessionError::AlreadyCompleted),
            phase => {
                return Err(SessionError::InvalidState(format!(
                    "session is {}",
                    phase.as_str()
                )));
            }
        }
        let value = self
            .flow
            .validate_field(name, value)
            .map_err(SessionError::Validation)?;
        runtime.session.form_data.set(name, value);

        let current = runtime.session.step_index;
        let snapped = self
            .flow
            .nearest_applicable(current, &runtime.session.form_data);
        if snapped != current {
            debug!(from = current, to = snapped, field = name, "current step no longer applies");
            runtime.session.step_index = snapped;
            if runtime.phase == ControllerPhase::Active {
                self.enqueue_progress(&mut runtime);
            }
        }
        Ok(())
    }

    /// The app lost foreground focus.
    pub fn suspend(&self) -> Result<(), SessionError> {
        let mut runtime = self.lock_runtime()?;
        runtime.foreground = false;
        runtime.tracker.suspend();
        if runtime.phase == ControllerPhase::Active {
            runtime.session.status = SessionStatus::Suspended;
            self.enqueue_progress(&mut runtime);
        }
        Ok(())
    }

    /// The app regained foreground focus.
    pub fn resume(&self) -> Result<(), SessionError> {
        let mut runtime = self.lock_runtime()?;
        runtime.foreground = true;
        match runtime.phase {
            ControllerPhase::NotStarted | ControllerPhase::Completed => {}
            ControllerPhase::Active => {
                runtime.tracker.resume();
                runtime.session.status = SessionStatus::Active;
            }
            _ => runtime.tracker.resume(),
        }
        Ok(())
    }

    /// Finalizes the session. Failures leave the session active so the user
    /// can retry; every attempt carries the same idempotency key.
    pub async fn complete(&self) -> Result<CompletionSummary, SessionError> {
        let (session_id, form_data, seconds) = {
            let mut runtime = self.lock_runtime()?;
            self.ensure_navigable(runtime.phase)?;
            let session_id = runtime
                .session
                .session_id()
                .map(ToOwned::to_owned)
                .ok_or(SessionError::SessionNotInitialized)?;
            runtime.phase = ControllerPhase::Completing;
            self.enqueue_progress(&mut runtime);
            (
                session_id,
                runtime.session.form_data.clone(),
                runtime.tracker.current_total(),
            )
        };
        let _rollback = PhaseRollback {
            runtime: &self.runtime,
            pending: ControllerPhase::Completing,
            fallback: ControllerPhase::Active,
        };

        let result = self
            .aggregator
            .finalize(
                &self.persister,
                &session_id,
                &form_data,
                seconds,
                &self.completion_key,
            )
            .await;

        let mut runtime = self.lock_runtime()?;
        let summary = match result {
            Ok(summary) => summary,
            Err(error) => {
                runtime.phase = ControllerPhase::Active;
                return Err(error);
            }
        };
        runtime.tracker.complete();
        runtime.session.accumulated_seconds = seconds;
        runtime.session.status = SessionStatus::Completed;
        runtime.phase = ControllerPhase::Completed;
        if !self.flow.is_post_completion(runtime.session.step_index) {
            if let Some(first) = self.flow.first_post_completion_index() {
                runtime.session.step_index = first;
            }
        }
        runtime.summary = Some(summary.clone());
        drop(runtime);

        self.stop_autosave();
        Ok(summary)
    }

    /// Waits until every progress change made so far has been handled.
    pub async fn flush_progress(&self) -> Result<PersistOutcome, SessionError> {
        self.persister.flush().await
    }

    fn start_autosave(&self) -> Result<(), SessionError> {
        let weak = Arc::downgrade(&self.runtime);
        let queue = self.persister.queue();
        let ticker = AutosaveTicker::spawn(&self.handle, self.autosave_interval, move || {
            let Some(shared) = weak.upgrade() else {
                return false;
            };
            let Ok(mut runtime) = shared.lock() else {
                return false;
            };
            match runtime.phase {
                ControllerPhase::Completed => return false,
                ControllerPhase::Active if runtime.session.status != SessionStatus::Suspended => {}
                _ => return true,
            }
            match runtime.snapshot() {
                Some(snapshot) => queue.enqueue(snapshot).is_ok(),
                None => true,
            }
        });
        let mut autosave = self.autosave.lock().map_err(|error| {
            SessionError::InvalidState(format!("autosave lock poisoned: {error}"))
        })?;
        *autosave = Some(ticker);
        Ok(())
    }

    fn stop_autosave(&self) {
        if let Ok(mut autosave) = self.autosave.lock() {
            autosave.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::retry::RetryPolicy;
    use crate::domain::models::AuthToken;
    use crate::infrastructure::credential_store::InMemoryTokenStore;
    use crate::infrastructure::error::InfraError;
    use crate::infrastructure::practice_api_client::StartPracticeResponse;
    use crate::testing::{FakePracticeApiClient, ManualClock, fresh_start, settle};
    use proptest::prelude::*;

    type TestController = SessionController<FakePracticeApiClient, InMemoryTokenStore>;

    fn controller(
        client: &Arc<FakePracticeApiClient>,
        clock: &ManualClock,
        practice_type: PracticeType,
    ) -> TestController {
        let store = SessionStore::new(
            Arc::clone(client),
            Arc::new(InMemoryTokenStore::with_token(AuthToken::bearer("tok"))),
        )
        .with_start_retry(RetryPolicy::no_retry())
        .with_persist_retry(RetryPolicy::no_retry())
        .with_now_provider(clock.provider());
        SessionController::new(practice_type, Arc::new(store))
            .expect("controller")
            .with_now_provider(clock.provider())
            .with_autosave_interval(Duration::from_secs(3600))
    }

    fn choice(value: &str) -> FieldValue {
        FieldValue::Choice(value.to_string())
    }

    fn text(value: &str) -> FieldValue {
        FieldValue::Text(value.to_string())
    }

    fn resume_response(step: i64, form: serde_json::Value, seconds: i64) -> StartPracticeResponse {
        StartPracticeResponse {
            practice_id: Some(serde_json::json!("prc-resume")),
            is_new_practice: Some(false),
            current_page: Some(step),
            total_pages: Some(8),
            form_data: Some(form),
            accumulated_seconds: Some(seconds),
        }
    }

    #[tokio::test]
    async fn fresh_start_ignores_stale_server_fields() {
        let client = Arc::new(FakePracticeApiClient::default());
        client.push_start(Ok(StartPracticeResponse {
            current_page: Some(4),
            form_data: Some(serde_json::json!({"pattern": "box"})),
            accumulated_seconds: Some(300),
            ..fresh_start("prc-1")
        }));
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);

        let view = controller.start().await.expect("start");
        assert_eq!(view.phase, ControllerPhase::Active);
        assert_eq!(view.session.session_id(), Some("prc-1"));
        assert_eq!(view.session.step_index, 0);
        assert!(view.session.form_data.is_empty());
        assert_eq!(view.session.accumulated_seconds, 0);
        assert!(view.session.is_fresh_session);
        assert_eq!(view.session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn resume_adopts_server_state_exactly() {
        let client = Arc::new(FakePracticeApiClient::default());
        client.push_start(Ok(resume_response(3, serde_json::json!({"pattern": "box"}), 42)));
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);

        let view = controller.start().await.expect("start");
        assert_eq!(view.session.step_index, 3);
        assert_eq!(view.session.form_data.text("pattern"), Some("box"));
        assert_eq!(view.session.form_data.len(), 1);
        assert_eq!(view.session.accumulated_seconds, 42);
        assert!(!view.session.is_fresh_session);
        assert_eq!(view.step_id, "box-breathing");
    }

    #[tokio::test]
    async fn resume_clamps_step_and_drops_unknown_fields() {
        let client = Arc::new(FakePracticeApiClient::default());
        client.push_start(Ok(resume_response(
            99,
            serde_json::json!({"pattern": "box", "legacy_note": "x", "feeling": 3}),
            10,
        )));
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);

        let view = controller.start().await.expect("start");
        assert_eq!(view.session.step_index, 5);
        assert_eq!(view.session.form_data.len(), 1);

        let client = Arc::new(FakePracticeApiClient::default());
        client.push_start(Ok(resume_response(-3, serde_json::Value::Null, 10)));
        let controller = self::controller(&client, &clock, PracticeType::Breathing);
        assert_eq!(controller.start().await.expect("start").session.step_index, 0);
    }

    #[tokio::test]
    async fn missing_fresh_flag_resumes_only_when_progress_present() {
        let clock = ManualClock::new();

        let client = Arc::new(FakePracticeApiClient::default());
        client.push_start(Ok(StartPracticeResponse {
            practice_id: Some(serde_json::json!("prc-1")),
            current_page: Some(2),
            ..StartPracticeResponse::default()
        }));
        let view = controller(&client, &clock, PracticeType::Breathing)
            .start()
            .await
            .expect("start");
        assert!(!view.session.is_fresh_session);
        assert_eq!(view.session.step_index, 2);

        let client = Arc::new(FakePracticeApiClient::default());
        client.push_start(Ok(StartPracticeResponse {
            practice_id: Some(serde_json::json!("prc-2")),
            ..StartPracticeResponse::default()
        }));
        let view = controller(&client, &clock, PracticeType::Breathing)
            .start()
            .await
            .expect("start");
        assert!(view.session.is_fresh_session);
    }

    #[tokio::test]
    async fn failed_start_degrades_without_blocking_time_or_input() {
        let client = Arc::new(FakePracticeApiClient::default());
        client.push_start(Err(InfraError::Network("offline".to_string())));
        client.push_start(Ok(fresh_start("prc-late")));
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);

        let error = controller.start().await.expect_err("start must fail");
        assert!(error.blocks_user());
        assert_eq!(controller.phase().expect("phase"), ControllerPhase::Degraded);

        clock.advance_seconds(20);
        controller
            .update_field("pattern", choice("box"))
            .expect("input allowed while degraded");
        assert_eq!(
            controller.advance().await.expect_err("advance blocked"),
            SessionError::SessionNotInitialized
        );
        assert_eq!(
            controller.complete().await.expect_err("complete blocked"),
            SessionError::SessionNotInitialized
        );
        assert_eq!(controller.view().expect("view").session.accumulated_seconds, 20);

        let view = controller.start().await.expect("retry start");
        assert_eq!(view.session.session_id(), Some("prc-late"));
        assert_eq!(view.session.form_data.text("pattern"), Some("box"));
        assert_eq!(view.session.accumulated_seconds, 20);
    }

    #[tokio::test]
    async fn degraded_resume_merges_local_input_and_time() {
        let client = Arc::new(FakePracticeApiClient::default());
        client.push_start(Err(InfraError::Http {
            status: 503,
            body: "maintenance".to_string(),
        }));
        client.push_start(Ok(resume_response(
            2,
            serde_json::json!({"pattern": "four-seven-eight", "noticed": "server"}),
            40,
        )));
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);

        controller.start().await.expect_err("start must fail");
        clock.advance_seconds(5);
        controller.update_field("pattern", choice("box")).expect("update");

        let view = controller.start().await.expect("retry start");
        assert_eq!(view.session.step_index, 2);
        assert_eq!(view.session.form_data.text("pattern"), Some("box"));
        assert_eq!(view.session.form_data.text("noticed"), Some("server"));
        assert_eq!(view.session.accumulated_seconds, 45);
    }

    #[tokio::test]
    async fn missing_session_id_is_surfaced() {
        let client = Arc::new(FakePracticeApiClient::default());
        client.push_start(Ok(StartPracticeResponse {
            is_new_practice: Some(true),
            ..StartPracticeResponse::default()
        }));
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Mindfulness);

        assert_eq!(
            controller.start().await.expect_err("must fail"),
            SessionError::MissingSessionId
        );
        assert_eq!(controller.phase().expect("phase"), ControllerPhase::Degraded);
    }

    #[tokio::test]
    async fn step_transition_persists_mutated_state() {
        let client = Arc::new(FakePracticeApiClient::default());
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);
        controller.start().await.expect("start");

        controller.advance().await.expect("advance");
        controller.advance().await.expect("advance");
        controller.update_field("pattern", choice("four-seven-eight")).expect("update");
        clock.advance_seconds(7);
        let outcome = controller.advance().await.expect("advance");
        assert_eq!(outcome, AdvanceOutcome::Moved { step_index: 4 });
        controller.flush_progress().await.expect("flush");

        let last = client.updates().pop().expect("persisted");
        assert_eq!(last.practice_id, "prc-default");
        assert_eq!(last.current_page, 4);
        assert_eq!(last.total_pages, 8);
        assert_eq!(last.form_data["pattern"], "four-seven-eight");
        assert_eq!(last.accumulated_seconds, Some(7));
    }

    #[tokio::test]
    async fn update_field_is_schema_checked_and_not_persisted() {
        let client = Arc::new(FakePracticeApiClient::default());
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::EmotionUnderstanding);
        controller.start().await.expect("start");

        assert!(matches!(
            controller.update_field("unknown", text("x")),
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            controller.update_field("intensity", FieldValue::Scale(11)),
            Err(SessionError::Validation(_))
        ));
        controller
            .update_field("intensity", FieldValue::Scale(6))
            .expect("valid update");
        settle().await;
        assert_eq!(client.update_calls(), 0);
    }

    #[tokio::test]
    async fn update_field_before_start_is_rejected() {
        let client = Arc::new(FakePracticeApiClient::default());
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);

        assert_eq!(
            controller.update_field("pattern", choice("box")),
            Err(SessionError::SessionNotInitialized)
        );
        let view = controller.start().await.expect("start");
        assert!(view.session.form_data.is_empty());
        controller.update_field("pattern", choice("box")).expect("update after start");
        assert_eq!(
            controller.view().expect("view").session.form_data.text("pattern"),
            Some("box")
        );
    }

    #[tokio::test]
    async fn changing_branch_answer_moves_off_inapplicable_step() {
        let client = Arc::new(FakePracticeApiClient::default());
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);
        controller.start().await.expect("start");
        controller.update_field("pattern", choice("box")).expect("update");
        assert_eq!(controller.jump_to(3).expect("jump"), 3);
        controller.flush_progress().await.expect("flush");

        controller
            .update_field("pattern", choice("four-seven-eight"))
            .expect("update");
        let view = controller.view().expect("view");
        assert_eq!(view.session.step_index, 4);
        assert_eq!(view.step_id, "four-seven-eight");
        assert_eq!(view.visible_position, (4, 7));

        controller.flush_progress().await.expect("flush");
        let last = client.updates().pop().expect("persisted");
        assert_eq!(last.current_page, 4);
        assert_eq!(last.form_data["pattern"], "four-seven-eight");
    }

    #[tokio::test]
    async fn jump_respects_visibility_and_completion_boundary() {
        let client = Arc::new(FakePracticeApiClient::default());
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);
        controller.start().await.expect("start");

        assert!(matches!(controller.jump_to(3), Err(SessionError::Validation(_))));
        assert!(matches!(controller.jump_to(6), Err(SessionError::Validation(_))));
        assert!(matches!(controller.jump_to(42), Err(SessionError::Validation(_))));
        controller.update_field("pattern", choice("box")).expect("update");
        assert_eq!(controller.jump_to(3).expect("jump"), 3);
        assert_eq!(controller.retreat().expect("retreat"), 2);
    }

    #[tokio::test]
    async fn suspend_enqueues_progress_and_pauses_time() {
        let client = Arc::new(FakePracticeApiClient::default());
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Mindfulness);
        controller.start().await.expect("start");

        clock.advance_seconds(12);
        controller.suspend().expect("suspend");
        controller.flush_progress().await.expect("flush");
        assert_eq!(client.updates()[0].accumulated_seconds, Some(12));
        assert_eq!(
            controller.view().expect("view").session.status,
            SessionStatus::Suspended
        );

        clock.advance_seconds(600);
        controller.resume().expect("resume");
        clock.advance_seconds(3);
        let view = controller.view().expect("view");
        assert_eq!(view.session.accumulated_seconds, 15);
        assert_eq!(view.session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn breathing_session_completes_with_foreground_time_only() {
        let client = Arc::new(FakePracticeApiClient::default());
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);
        controller.start().await.expect("start");

        controller.advance().await.expect("to posture");
        clock.advance_seconds(10);
        controller.advance().await.expect("to pattern");
        controller.update_field("pattern", choice("box")).expect("pattern");
        clock.advance_seconds(10);
        controller.advance().await.expect("to box breathing");
        clock.advance_seconds(10);
        let moved = controller.advance().await.expect("to reflection");
        assert_eq!(moved, AdvanceOutcome::Moved { step_index: 5 });

        controller.suspend().expect("background");
        clock.advance_seconds(600);
        controller.resume().expect("foreground");

        controller.update_field("feeling", choice("calm")).expect("feeling");
        controller
            .update_field("noticed", text("slower exhale"))
            .expect("noticed");
        let outcome = controller.advance().await.expect("to summary");

        let AdvanceOutcome::Completed {
            step_index,
            summary,
        } = outcome
        else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(step_index, 6);
        assert_eq!(summary.duration_seconds, 30);
        assert_eq!(summary.duration_minutes, 1);

        let completions = client.completions();
        assert_eq!(completions.len(), 1);
        let completion = &completions[0];
        assert_eq!(completion.duration_seconds, 30);
        assert_eq!(completion.feeling.as_deref(), Some("calm"));
        assert_eq!(completion.noticed.as_deref(), Some("slower exhale"));
        let form = completion.form_data.as_ref().expect("form data");
        assert_eq!(form["feeling"], "calm");
        assert_eq!(form["noticed"], "slower exhale");

        let last_update = client.updates().pop().expect("final flush");
        assert_eq!(last_update.current_page, 5);
        assert_eq!(last_update.form_data["noticed"], "slower exhale");
    }

    #[tokio::test]
    async fn completion_failure_keeps_step_and_retry_reuses_key() {
        let client = Arc::new(FakePracticeApiClient::default());
        client.push_complete(Err(InfraError::Network("offline".to_string())));
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Mindfulness);
        controller.start().await.expect("start");
        controller.update_field("anchor", choice("body")).expect("anchor");
        controller.jump_to(5).expect("jump to reflection");

        let error = controller.advance().await.expect_err("completion fails");
        assert!(error.blocks_user());
        let view = controller.view().expect("view");
        assert_eq!(view.phase, ControllerPhase::Active);
        assert_eq!(view.session.step_index, 5);

        let outcome = controller.advance().await.expect("retry");
        assert!(matches!(outcome, AdvanceOutcome::Completed { step_index: 6, .. }));
        let keys = client.completion_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn completed_session_allows_review_navigation_only() {
        let client = Arc::new(FakePracticeApiClient::default());
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);
        controller.start().await.expect("start");
        controller.jump_to(5).expect("jump");
        controller.complete().await.expect("complete");
        let updates_after_completion = client.update_calls();

        assert_eq!(controller.view().expect("view").step_kind, StepKind::Summary);
        assert_eq!(
            controller.advance().await.expect("to closing"),
            AdvanceOutcome::Moved { step_index: 7 }
        );
        assert_eq!(
            controller.advance().await.expect("stay"),
            AdvanceOutcome::Stayed { step_index: 7 }
        );
        assert_eq!(controller.retreat().expect("back to summary"), 6);
        assert_eq!(controller.retreat(), Err(SessionError::AlreadyCompleted));
        assert_eq!(
            controller.update_field("noticed", text("late")),
            Err(SessionError::AlreadyCompleted)
        );
        assert_eq!(
            controller.complete().await.expect_err("second completion"),
            SessionError::AlreadyCompleted
        );
        assert_eq!(controller.start().await.expect_err("restart"), SessionError::AlreadyCompleted);

        settle().await;
        assert_eq!(client.complete_calls(), 1);
        assert_eq!(client.update_calls(), updates_after_completion);
    }

    #[tokio::test(start_paused = true)]
    async fn autosave_persists_while_active_and_not_suspended() {
        let client = Arc::new(FakePracticeApiClient::default());
        let clock = ManualClock::new();
        let controller =
            controller(&client, &clock, PracticeType::Mindfulness).with_autosave_interval(Duration::from_secs(10));
        controller.start().await.expect("start");

        for _ in 0..2 {
            clock.advance_seconds(10);
            tokio::time::sleep(Duration::from_secs(10)).await;
            settle().await;
        }
        assert_eq!(client.update_calls(), 2);

        controller.suspend().expect("suspend");
        controller.flush_progress().await.expect("flush");
        let after_suspend = client.update_calls();
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(client.update_calls(), after_suspend);
    }

    #[tokio::test]
    async fn dropped_controller_lets_inflight_persist_finish() {
        let client = Arc::new(FakePracticeApiClient::default());
        let gate = client.hold_updates();
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);
        controller.start().await.expect("start");
        controller.advance().await.expect("advance");
        settle().await;

        drop(controller);
        gate.add_permits(4);
        settle().await;
        assert_eq!(client.updates().len(), 1);
        assert_eq!(client.updates()[0].current_page, 1);
    }

    #[tokio::test]
    async fn view_reports_visible_position() {
        let client = Arc::new(FakePracticeApiClient::default());
        let clock = ManualClock::new();
        let controller = controller(&client, &clock, PracticeType::Breathing);
        controller.start().await.expect("start");
        controller.update_field("pattern", choice("box")).expect("pattern");
        controller.jump_to(3).expect("jump");

        assert_eq!(controller.view().expect("view").visible_position, (4, 7));
    }

    #[derive(Debug, Clone)]
    enum NavOp {
        Advance,
        Retreat,
        Jump(usize),
        Pattern(bool),
    }

    fn arb_nav_op() -> impl Strategy<Value = NavOp> {
        prop_oneof![
            Just(NavOp::Advance),
            Just(NavOp::Retreat),
            (0usize..10).prop_map(NavOp::Jump),
            any::<bool>().prop_map(NavOp::Pattern),
        ]
    }

    // Step index stays in bounds and on an applicable step for any navigation sequence.
    proptest! {
        #[test]
        fn step_index_stays_in_bounds(ops in prop::collection::vec(arb_nav_op(), 0..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");
            runtime.block_on(async move {
                let client = Arc::new(FakePracticeApiClient::default());
                let clock = ManualClock::new();
                let controller = controller(&client, &clock, PracticeType::Breathing);
                controller.start().await.expect("start");
                let total = controller.flow().len();

                for op in ops {
                    let _ = match op {
                        NavOp::Advance => controller.advance().await.map(|_| ()),
                        NavOp::Retreat => controller.retreat().map(|_| ()),
                        NavOp::Jump(index) => controller.jump_to(index).map(|_| ()),
                        NavOp::Pattern(is_box) => controller.update_field(
                            "pattern",
                            choice(if is_box { "box" } else { "four-seven-eight" }),
                        ),
                    };
                    let view = controller.view().expect("view");
                    assert!(view.session.step_index < total);
                    assert!(controller
                        .flow()
                        .is_visible(view.session.step_index, &view.session.form_data));
                    assert!(client.complete_calls() <= 1);
                }
            });
        }
    }
}

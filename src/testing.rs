use crate::domain::clock::NowProvider;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::practice_api_client::{
    CompletePracticeRequest, PracticeApiClient, PracticeStatsResponse, StartPracticeRequest,
    StartPracticeResponse, UpdateProgressRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Clock that only moves when a test advances it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let start = DateTime::parse_from_rfc3339("2026-02-16T09:00:00Z")
            .expect("valid datetime")
            .with_timezone(&Utc);
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }

    pub fn provider(&self) -> NowProvider {
        let now = Arc::clone(&self.now);
        Arc::new(move || *now.lock().expect("clock lock"))
    }

    pub fn advance_seconds(&self, seconds: i64) {
        self.advance(Duration::seconds(seconds));
    }

    pub fn advance_millis(&self, millis: i64) {
        self.advance(Duration::milliseconds(millis));
    }

    fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += delta;
    }
}

/// Scripted practice API. Empty queues answer with a fresh session, an ack,
/// or empty stats.
#[derive(Default)]
pub struct FakePracticeApiClient {
    start_responses: Mutex<VecDeque<Result<StartPracticeResponse, InfraError>>>,
    update_responses: Mutex<VecDeque<Result<(), InfraError>>>,
    complete_responses: Mutex<VecDeque<Result<(), InfraError>>>,
    stats_responses: Mutex<VecDeque<Result<PracticeStatsResponse, InfraError>>>,
    start_tokens: Mutex<Vec<Option<String>>>,
    updates: Mutex<Vec<UpdateProgressRequest>>,
    completions: Mutex<Vec<CompletePracticeRequest>>,
    completion_keys: Mutex<Vec<String>>,
    update_gate: Mutex<Option<Arc<Semaphore>>>,
    start_calls: AtomicUsize,
    update_calls: AtomicUsize,
    complete_calls: AtomicUsize,
    stats_calls: AtomicUsize,
}

impl FakePracticeApiClient {
    pub fn push_start(&self, response: Result<StartPracticeResponse, InfraError>) {
        self.start_responses.lock().expect("lock").push_back(response);
    }

    pub fn push_update(&self, response: Result<(), InfraError>) {
        self.update_responses.lock().expect("lock").push_back(response);
    }

    pub fn push_complete(&self, response: Result<(), InfraError>) {
        self.complete_responses.lock().expect("lock").push_back(response);
    }

    pub fn set_stats(&self, response: Result<PracticeStatsResponse, InfraError>) {
        self.stats_responses.lock().expect("lock").push_back(response);
    }

    /// Makes every update wait for a permit on the returned semaphore.
    pub fn hold_updates(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.update_gate.lock().expect("lock") = Some(Arc::clone(&gate));
        gate
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }

    pub fn start_tokens(&self) -> Vec<Option<String>> {
        self.start_tokens.lock().expect("lock").clone()
    }

    pub fn updates(&self) -> Vec<UpdateProgressRequest> {
        self.updates.lock().expect("lock").clone()
    }

    pub fn completions(&self) -> Vec<CompletePracticeRequest> {
        self.completions.lock().expect("lock").clone()
    }

    pub fn completion_keys(&self) -> Vec<String> {
        self.completion_keys.lock().expect("lock").clone()
    }
}

pub fn fresh_start(id: &str) -> StartPracticeResponse {
    StartPracticeResponse {
        practice_id: Some(serde_json::Value::String(id.to_string())),
        is_new_practice: Some(true),
        ..StartPracticeResponse::default()
    }
}

#[async_trait]
impl PracticeApiClient for FakePracticeApiClient {
    async fn start_practice(
        &self,
        access_token: Option<&str>,
        _request: &StartPracticeRequest,
    ) -> Result<StartPracticeResponse, InfraError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.start_tokens
            .lock()
            .expect("lock")
            .push(access_token.map(ToOwned::to_owned));
        self.start_responses
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(fresh_start("prc-default")))
    }

    async fn update_progress(
        &self,
        _access_token: Option<&str>,
        request: &UpdateProgressRequest,
    ) -> Result<(), InfraError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.update_gate.lock().expect("lock").clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate open").forget();
        }
        let response = self
            .update_responses
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(Ok(()));
        if response.is_ok() {
            self.updates.lock().expect("lock").push(request.clone());
        }
        response
    }

    async fn complete_practice(
        &self,
        _access_token: Option<&str>,
        request: &CompletePracticeRequest,
        idempotency_key: &str,
    ) -> Result<(), InfraError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.completion_keys
            .lock()
            .expect("lock")
            .push(idempotency_key.to_string());
        let response = self
            .complete_responses
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(Ok(()));
        if response.is_ok() {
            self.completions.lock().expect("lock").push(request.clone());
        }
        response
    }

    async fn fetch_stats(
        &self,
        _access_token: Option<&str>,
    ) -> Result<PracticeStatsResponse, InfraError> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        self.stats_responses
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(PracticeStatsResponse::default()))
    }
}

/// Lets spawned tasks on the current-thread test runtime make progress.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

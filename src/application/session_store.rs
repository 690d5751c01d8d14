use crate::application::error::SessionError;
use crate::application::retry::{RetryPolicy, with_backoff};
use crate::domain::clock::{NowProvider, system_clock};
use crate::domain::models::{AggregateStats, CategoryStat, FormData, PracticeType};
use crate::infrastructure::credential_store::TokenStore;
use crate::infrastructure::practice_api_client::{
    CompletePracticeRequest, PracticeApiClient, PracticeStatsResponse, StartPracticeRequest,
    UpdateProgressRequest,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Server view of a session returned by `start`.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedSession {
    pub session_id: String,
    pub is_fresh_session: Option<bool>,
    pub step_index: Option<i64>,
    pub total_steps: Option<i64>,
    pub form_data: Option<serde_json::Value>,
    pub accumulated_seconds: Option<u64>,
}

impl StartedSession {
    /// True when the response carries any resumable progress.
    pub fn has_progress(&self) -> bool {
        self.step_index.is_some() || self.form_data.is_some() || self.accumulated_seconds.is_some()
    }
}

/// Progress pushed to the server. `seq` orders snapshots by issuance.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub seq: u64,
    pub session_id: String,
    pub step_index: usize,
    pub total_steps: usize,
    pub form_data: FormData,
    pub accumulated_seconds: u64,
}

impl ProgressSnapshot {
    /// Same server-visible content, ignoring the sequence number.
    pub fn same_content(&self, other: &ProgressSnapshot) -> bool {
        self.session_id == other.session_id
            && self.step_index == other.step_index
            && self.total_steps == other.total_steps
            && self.form_data == other.form_data
            && self.accumulated_seconds == other.accumulated_seconds
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionPayload {
    pub session_id: String,
    pub practice_type: PracticeType,
    pub duration_minutes: u64,
    pub duration_seconds: u64,
    pub feeling: Option<String>,
    pub noticed: Option<String>,
    pub reflection: Option<String>,
    pub emotion_data: Option<serde_json::Value>,
    pub form_data: FormData,
}

pub struct SessionStore<C, T>
where
    C: PracticeApiClient,
    T: TokenStore,
{
    api_client: Arc<C>,
    token_store: Arc<T>,
    start_retry: RetryPolicy,
    persist_retry: RetryPolicy,
    now_provider: NowProvider,
}

impl<C, T> SessionStore<C, T>
where
    C: PracticeApiClient,
    T: TokenStore,
{
    pub fn new(api_client: Arc<C>, token_store: Arc<T>) -> Self {
        Self {
            api_client,
            token_store,
            start_retry: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 300,
            },
            persist_retry: RetryPolicy::default(),
            now_provider: system_clock(),
        }
    }

    pub fn with_start_retry(mut self, policy: RetryPolicy) -> Self {
        self.start_retry = policy;
        self
    }

    pub fn with_persist_retry(mut self, policy: RetryPolicy) -> Self {
        self.persist_retry = policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    /// Reads the token fresh for every call. A missing, expired or unreadable
    /// token is sent as no token; the server's auth rejection then surfaces as
    /// `SessionError::Unauthenticated`.
    fn access_token(&self) -> Option<String> {
        match self.token_store.load_token() {
            Ok(Some(token)) if token.is_usable_at((self.now_provider)()) => {
                Some(token.access_token.trim().to_string())
            }
            Ok(Some(_)) => {
                debug!("stored access token is expired or blank");
                None
            }
            Ok(None) => None,
            Err(error) => {
                warn!(error = %error, "failed to read access token");
                None
            }
        }
    }

    pub async fn start(&self, practice_type: PracticeType) -> Result<StartedSession, SessionError> {
        let request = StartPracticeRequest {
            practice_type: practice_type.as_str().to_string(),
        };
        let request = &request;
        let response = with_backoff(self.start_retry, "start", move || async move {
            let token = self.access_token();
            self.api_client
                .start_practice(token.as_deref(), request)
                .await
                .map_err(SessionError::from)
        })
        .await?;

        let session_id = response.practice_id().ok_or(SessionError::MissingSessionId)?;
        Ok(StartedSession {
            session_id,
            is_fresh_session: response.is_new_practice,
            step_index: response.current_page,
            total_steps: response.total_pages,
            form_data: response.form_data.filter(|value| !value.is_null()),
            accumulated_seconds: response
                .accumulated_seconds
                .map(|seconds| seconds.max(0) as u64),
        })
    }

    pub async fn persist(&self, snapshot: &ProgressSnapshot) -> Result<(), SessionError> {
        let request = UpdateProgressRequest {
            practice_id: snapshot.session_id.clone(),
            current_page: snapshot.step_index,
            total_pages: snapshot.total_steps,
            form_data: snapshot.form_data.to_json(),
            accumulated_seconds: Some(snapshot.accumulated_seconds),
        };
        let request = &request;
        with_backoff(self.persist_retry, "update-progress", move || async move {
            let token = self.access_token();
            self.api_client
                .update_progress(token.as_deref(), request)
                .await
                .map_err(SessionError::from)
        })
        .await
    }

    /// Never retried here; repeat attempts come from the user and carry the
    /// same `idempotency_key`.
    pub async fn complete(
        &self,
        payload: &CompletionPayload,
        idempotency_key: &str,
    ) -> Result<(), SessionError> {
        let request = CompletePracticeRequest {
            practice_id: payload.session_id.clone(),
            practice_type: payload.practice_type.as_str().to_string(),
            duration: payload.duration_minutes,
            duration_seconds: payload.duration_seconds,
            feeling: payload.feeling.clone(),
            noticed: payload.noticed.clone(),
            reflection: payload.reflection.clone(),
            emotion_data: payload.emotion_data.clone(),
            form_data: Some(payload.form_data.to_json()),
        };
        let token = self.access_token();
        self.api_client
            .complete_practice(token.as_deref(), &request, idempotency_key)
            .await
            .map_err(SessionError::from)
    }

    pub async fn fetch_aggregate_stats(&self) -> Result<AggregateStats, SessionError> {
        let token = self.access_token();
        let response = self
            .api_client
            .fetch_stats(token.as_deref())
            .await
            .map_err(SessionError::from)?;
        Ok(to_aggregate_stats(response))
    }
}

fn to_aggregate_stats(response: PracticeStatsResponse) -> AggregateStats {
    AggregateStats {
        total_practices: response.total_practices,
        total_minutes: response.total_minutes,
        current_streak: response.current_streak,
        longest_streak: response.longest_streak,
        category_stats: response
            .category_stats
            .into_iter()
            .map(|category| CategoryStat {
                practice_type: category.practice_type,
                total_practices: category.total_practices,
                total_minutes: category.total_minutes,
            })
            .collect(),
    }
}

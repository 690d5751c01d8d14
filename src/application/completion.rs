use crate::application::error::SessionError;
use crate::application::progress_persister::{PersistOutcome, ProgressPersister};
use crate::application::session_store::{CompletionPayload, SessionStore};
use crate::domain::models::{AggregateStats, FieldValue, FormData, PracticeType};
use crate::infrastructure::credential_store::TokenStore;
use crate::infrastructure::practice_api_client::PracticeApiClient;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionSummary {
    pub duration_minutes: u64,
    pub duration_seconds: u64,
    pub stats: Option<AggregateStats>,
}

/// Whole minutes reported to the server, rounded to nearest and never below one.
pub fn duration_minutes(seconds: u64) -> u64 {
    (seconds.saturating_add(30) / 60).max(1)
}

pub struct CompletionAggregator<C, T>
where
    C: PracticeApiClient,
    T: TokenStore,
{
    store: Arc<SessionStore<C, T>>,
    fetch_stats: bool,
}

impl<C, T> CompletionAggregator<C, T>
where
    C: PracticeApiClient,
    T: TokenStore,
{
    pub fn new(store: Arc<SessionStore<C, T>>) -> Self {
        Self {
            store,
            fetch_stats: true,
        }
    }

    pub fn with_fetch_stats(mut self, fetch_stats: bool) -> Self {
        self.fetch_stats = fetch_stats;
        self
    }

    /// Flushes pending progress, submits the completion and optionally loads
    /// updated statistics. Only the completion call itself can fail the
    /// operation.
    pub async fn finalize(
        &self,
        persister: &ProgressPersister,
        session_id: &str,
        form_data: &FormData,
        seconds: u64,
        idempotency_key: &str,
    ) -> Result<CompletionSummary, SessionError> {
        match persister.flush().await {
            Ok(PersistOutcome::Failed(message)) => {
                warn!(session_id, error = %message, "final progress flush failed; completing anyway");
            }
            Ok(_) => {}
            Err(error) => {
                warn!(session_id, error = %error, "final progress flush unavailable");
            }
        }

        let payload = build_payload(session_id, form_data, seconds);
        if let Err(error) = self.store.complete(&payload, idempotency_key).await {
            error!(
                session_id,
                practice_type = %payload.practice_type,
                error = %error,
                "failed to complete practice"
            );
            return Err(error);
        }
        info!(
            session_id,
            practice_type = %payload.practice_type,
            duration_seconds = payload.duration_seconds,
            "practice completed"
        );

        let stats = if self.fetch_stats {
            match self.store.fetch_aggregate_stats().await {
                Ok(stats) => Some(stats),
                Err(error) => {
                    warn!(error = %error, "failed to fetch practice stats after completion");
                    None
                }
            }
        } else {
            None
        };

        Ok(CompletionSummary {
            duration_minutes: payload.duration_minutes,
            duration_seconds: payload.duration_seconds,
            stats,
        })
    }
}

pub fn build_payload(session_id: &str, form_data: &FormData, seconds: u64) -> CompletionPayload {
    let practice_type = form_data.practice_type();
    CompletionPayload {
        session_id: session_id.to_string(),
        practice_type,
        duration_minutes: duration_minutes(seconds),
        duration_seconds: seconds,
        feeling: form_data.text("feeling").map(ToOwned::to_owned),
        noticed: form_data.text("noticed").map(ToOwned::to_owned),
        reflection: form_data.text("reflection").map(ToOwned::to_owned),
        emotion_data: match practice_type {
            PracticeType::EmotionUnderstanding => emotion_data(form_data),
            _ => None,
        },
        form_data: form_data.clone(),
    }
}

fn emotion_data(form_data: &FormData) -> Option<serde_json::Value> {
    let mut object = serde_json::Map::new();
    for (field, key) in [
        ("emotion", "emotion"),
        ("intensity", "intensity"),
        ("triggers", "triggers"),
        ("body_sensations", "bodySensations"),
        ("strategy", "strategy"),
    ] {
        if let Some(value) = form_data.get(field).filter(|value| !value.is_blank()) {
            object.insert(key.to_string(), FieldValue::to_json(value));
        }
    }
    (!object.is_empty()).then_some(serde_json::Value::Object(object))
}

use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StartPracticeRequest {
    pub practice_type: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct StartPracticeResponse {
    #[serde(rename = "practiceId", default)]
    pub practice_id: Option<serde_json::Value>,
    #[serde(rename = "isNewPractice", default)]
    pub is_new_practice: Option<bool>,
    #[serde(rename = "currentPage", default)]
    pub current_page: Option<i64>,
    #[serde(rename = "totalPages", default)]
    pub total_pages: Option<i64>,
    #[serde(rename = "formData", default)]
    pub form_data: Option<serde_json::Value>,
    #[serde(rename = "accumulatedSeconds", default)]
    pub accumulated_seconds: Option<i64>,
}

impl StartPracticeResponse {
    /// Server ids arrive as strings or numbers; blank ids count as missing.
    pub fn practice_id(&self) -> Option<String> {
        let id = match self.practice_id.as_ref()? {
            serde_json::Value::String(value) => value.trim().to_string(),
            serde_json::Value::Number(value) => value.to_string(),
            _ => return None,
        };
        (!id.is_empty()).then_some(id)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpdateProgressRequest {
    pub practice_id: String,
    pub current_page: usize,
    pub total_pages: usize,
    pub form_data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accumulated_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletePracticeRequest {
    pub practice_id: String,
    pub practice_type: String,
    pub duration: u64,
    pub duration_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feeling: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noticed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion_data: Option<serde_json::Value>,
    #[serde(rename = "formData", skip_serializing_if = "Option::is_none")]
    pub form_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStatPayload {
    #[serde(default, alias = "category", alias = "practice_type")]
    pub practice_type: String,
    #[serde(default, alias = "count")]
    pub total_practices: u32,
    #[serde(default, alias = "minutes")]
    pub total_minutes: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PracticeStatsResponse {
    #[serde(default)]
    pub total_practices: u32,
    #[serde(default)]
    pub total_minutes: u32,
    #[serde(default)]
    pub current_streak: u32,
    #[serde(default)]
    pub longest_streak: u32,
    #[serde(default)]
    pub category_stats: Vec<CategoryStatPayload>,
}

#[async_trait]
pub trait PracticeApiClient: Send + Sync {
    async fn start_practice(
        &self,
        access_token: Option<&str>,
        request: &StartPracticeRequest,
    ) -> Result<StartPracticeResponse, InfraError>;

    async fn update_progress(
        &self,
        access_token: Option<&str>,
        request: &UpdateProgressRequest,
    ) -> Result<(), InfraError>;

    async fn complete_practice(
        &self,
        access_token: Option<&str>,
        request: &CompletePracticeRequest,
        idempotency_key: &str,
    ) -> Result<(), InfraError>;

    async fn fetch_stats(&self, access_token: Option<&str>)
    -> Result<PracticeStatsResponse, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestPracticeApiClient {
    client: Client,
    base_url: Url,
}

impl ReqwestPracticeApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InfraError> {
        let base_url = Url::parse(base_url.trim())
            .map_err(|error| InfraError::InvalidConfig(format!("invalid api base url: {error}")))?;
        if base_url.cannot_be_a_base() {
            return Err(InfraError::InvalidConfig(
                "api base url cannot be a base".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| InfraError::InvalidConfig(format!("failed to build http client: {error}")))?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, action: &str) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("api base url cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("practices");
            segments.push(action);
        }
        Ok(url)
    }

    fn authorize(request: RequestBuilder, access_token: Option<&str>) -> RequestBuilder {
        match access_token.map(str::trim).filter(|token| !token.is_empty()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        access_token: Option<&str>,
        operation: &str,
    ) -> Result<String, InfraError> {
        let response = Self::authorize(request, access_token)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    InfraError::Network(format!("request timed out during {operation}"))
                } else {
                    InfraError::Network(format!("network error during {operation}: {error}"))
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|error| {
            InfraError::Network(format!("failed reading {operation} response: {error}"))
        })?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(InfraError::Auth(format!(
                "{operation} rejected with http {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(InfraError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

/// Some deployments wrap payloads as `{"success": true, "data": {...}}`.
fn unwrap_envelope(value: serde_json::Value, expected_key: &str) -> serde_json::Value {
    match value {
        serde_json::Value::Object(mut object)
            if !object.contains_key(expected_key)
                && object.get("data").is_some_and(serde_json::Value::is_object) =>
        {
            object.remove("data").unwrap_or(serde_json::Value::Null)
        }
        other => other,
    }
}

fn parse_payload<T>(body: &str, expected_key: &str, operation: &str) -> Result<T, InfraError>
where
    T: serde::de::DeserializeOwned,
{
    let value: serde_json::Value = serde_json::from_str(body).map_err(|error| {
        InfraError::Protocol(format!("invalid {operation} payload: {error}; body={body}"))
    })?;
    serde_json::from_value(unwrap_envelope(value, expected_key)).map_err(|error| {
        InfraError::Protocol(format!("unexpected {operation} shape: {error}; body={body}"))
    })
}

#[async_trait]
impl PracticeApiClient for ReqwestPracticeApiClient {
    async fn start_practice(
        &self,
        access_token: Option<&str>,
        request: &StartPracticeRequest,
    ) -> Result<StartPracticeResponse, InfraError> {
        let endpoint = self.endpoint("start")?;
        let body = self
            .send(self.client.post(endpoint).json(request), access_token, "start")
            .await?;
        parse_payload(&body, "practiceId", "start")
    }

    async fn update_progress(
        &self,
        access_token: Option<&str>,
        request: &UpdateProgressRequest,
    ) -> Result<(), InfraError> {
        let endpoint = self.endpoint("update-progress")?;
        self.send(
            self.client.post(endpoint).json(request),
            access_token,
            "update-progress",
        )
        .await?;
        Ok(())
    }

    async fn complete_practice(
        &self,
        access_token: Option<&str>,
        request: &CompletePracticeRequest,
        idempotency_key: &str,
    ) -> Result<(), InfraError> {
        let endpoint = self.endpoint("complete")?;
        let builder = self
            .client
            .post(endpoint)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(request);
        self.send(builder, access_token, "complete").await?;
        Ok(())
    }

    async fn fetch_stats(
        &self,
        access_token: Option<&str>,
    ) -> Result<PracticeStatsResponse, InfraError> {
        let endpoint = self.endpoint("stats")?;
        let body = self
            .send(self.client.get(endpoint), access_token, "stats")
            .await?;
        parse_payload(&body, "totalPractices", "stats")
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PracticeType {
    Breathing,
    Mindfulness,
    EmotionUnderstanding,
    GratitudeJournal,
}

impl PracticeType {
    pub const ALL: [PracticeType; 4] = [
        PracticeType::Breathing,
        PracticeType::Mindfulness,
        PracticeType::EmotionUnderstanding,
        PracticeType::GratitudeJournal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Breathing => "breathing",
            Self::Mindfulness => "mindfulness",
            Self::EmotionUnderstanding => "emotion-understanding",
            Self::GratitudeJournal => "gratitude-journal",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "breathing" => Ok(Self::Breathing),
            "mindfulness" => Ok(Self::Mindfulness),
            "emotion-understanding" | "emotion" => Ok(Self::EmotionUnderstanding),
            "gratitude-journal" | "gratitude" => Ok(Self::GratitudeJournal),
            other => Err(format!("unsupported practice type: {other}")),
        }
    }
}

impl fmt::Display for PracticeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uninitialized,
    Active,
    Suspended,
    Completed,
}

/// A single user-entered value. The shape a field may take is fixed by the
/// practice's form schema, never inferred from the value itself.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Choice(String),
    Tags(Vec<String>),
    Scale(i64),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) | Self::Choice(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_scale(&self) -> Option<i64> {
        match self {
            Self::Scale(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_tags(&self) -> Option<&[String]> {
        match self {
            Self::Tags(values) => Some(values.as_slice()),
            _ => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text(value) | Self::Choice(value) => value.trim().is_empty(),
            Self::Tags(values) => values.is_empty(),
            Self::Scale(_) => false,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Text(value) | Self::Choice(value) => serde_json::Value::String(value.clone()),
            Self::Tags(values) => serde_json::Value::Array(
                values
                    .iter()
                    .cloned()
                    .map(serde_json::Value::String)
                    .collect(),
            ),
            Self::Scale(value) => serde_json::Value::from(*value),
        }
    }
}

/// Form state for one session, keyed by field name. Ordered so that two
/// persists of the same state produce byte-identical payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormData {
    practice_type: PracticeType,
    fields: BTreeMap<String, FieldValue>,
}

impl FormData {
    pub fn new(practice_type: PracticeType) -> Self {
        Self {
            practice_type,
            fields: BTreeMap::new(),
        }
    }

    pub fn practice_type(&self) -> PracticeType {
        self.practice_type
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(FieldValue::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Stores a value that has already been checked against the schema.
    /// Blank values remove the field.
    pub(crate) fn set(&mut self, name: &str, value: FieldValue) {
        if value.is_blank() {
            self.fields.remove(name);
        } else {
            self.fields.insert(name.to_string(), value);
        }
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Fields in `local` replace fields here; the client is the sole writer
    /// while a session is active.
    pub fn overlay(&mut self, local: &FormData) {
        for (name, value) in &local.fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let object = self
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(object)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PracticeSession {
    pub session_id: Option<String>,
    pub practice_type: PracticeType,
    pub step_index: usize,
    pub total_steps: usize,
    pub form_data: FormData,
    pub accumulated_seconds: u64,
    pub status: SessionStatus,
    pub is_fresh_session: bool,
}

impl PracticeSession {
    /// Client-side placeholder created before the server has assigned an id.
    pub fn placeholder(practice_type: PracticeType, total_steps: usize) -> Self {
        Self {
            session_id: None,
            practice_type,
            step_index: 0,
            total_steps,
            form_data: FormData::new(practice_type),
            accumulated_seconds: 0,
            status: SessionStatus::Uninitialized,
            is_fresh_session: true,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.total_steps == 0 {
            return Err("session.total_steps must be > 0".to_string());
        }
        if self.step_index >= self.total_steps {
            return Err(format!(
                "session.step_index {} must be < total_steps {}",
                self.step_index, self.total_steps
            ));
        }
        if self.form_data.practice_type() != self.practice_type {
            return Err("session.form_data belongs to a different practice type".to_string());
        }
        if self.status != SessionStatus::Uninitialized && self.session_id().is_none() {
            return Err("session.session_id must be set once the session is live".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CategoryStat {
    pub practice_type: String,
    pub total_practices: u32,
    pub total_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AggregateStats {
    pub total_practices: u32,
    pub total_minutes: u32,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub category_stats: Vec<CategoryStat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: "Bearer".to_string(),
            expires_at: None,
        }
    }

    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.trim().is_empty()
            && self.expires_at.map(|expires_at| expires_at > now).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_session() -> PracticeSession {
        let mut session = PracticeSession::placeholder(PracticeType::Breathing, 8);
        session.session_id = Some("prc-1".to_string());
        session.status = SessionStatus::Active;
        session
    }

    #[test]
    fn auth_token_usability_respects_expiry_and_blank_values() {
        let now = Utc::now();
        let mut token = AuthToken::bearer("abc");
        assert!(token.is_usable_at(now));
        token.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!token.is_usable_at(now));
        assert!(!AuthToken::bearer("  ").is_usable_at(now));
    }

    #[test]
    fn practice_type_parse_accepts_wire_and_legacy_spellings() {
        for practice_type in PracticeType::ALL {
            assert_eq!(PracticeType::parse(practice_type.as_str()), Ok(practice_type));
        }
        assert_eq!(
            PracticeType::parse("Emotion_Understanding"),
            Ok(PracticeType::EmotionUnderstanding)
        );
        assert!(PracticeType::parse("yoga").is_err());
    }

    #[test]
    fn practice_type_serializes_kebab_case() {
        let encoded = serde_json::to_string(&PracticeType::GratitudeJournal).expect("serialize");
        assert_eq!(encoded, "\"gratitude-journal\"");
    }

    #[test]
    fn session_validate_rejects_out_of_range_step() {
        let mut session = live_session();
        assert!(session.validate().is_ok());
        session.step_index = 8;
        assert!(session.validate().is_err());
    }

    #[test]
    fn session_validate_requires_id_once_live() {
        let mut session = live_session();
        session.session_id = Some("   ".to_string());
        assert!(session.validate().is_err());
    }

    #[test]
    fn form_data_blank_values_remove_fields() {
        let mut form = FormData::new(PracticeType::Mindfulness);
        form.set("noticed", FieldValue::Text("warm hands".to_string()));
        assert_eq!(form.text("noticed"), Some("warm hands"));
        form.set("noticed", FieldValue::Text("  ".to_string()));
        assert!(form.is_empty());
    }

    #[test]
    fn form_data_overlay_prefers_local_values() {
        let mut server = FormData::new(PracticeType::Mindfulness);
        server.set("noticed", FieldValue::Text("server".to_string()));
        server.set("reflection", FieldValue::Text("kept".to_string()));
        let mut local = FormData::new(PracticeType::Mindfulness);
        local.set("noticed", FieldValue::Text("local".to_string()));

        server.overlay(&local);
        assert_eq!(server.text("noticed"), Some("local"));
        assert_eq!(server.text("reflection"), Some("kept"));
    }

    #[test]
    fn form_data_json_is_stable_object() {
        let mut form = FormData::new(PracticeType::EmotionUnderstanding);
        form.set("intensity", FieldValue::Scale(7));
        form.set(
            "triggers",
            FieldValue::Tags(vec!["work".to_string(), "sleep".to_string()]),
        );
        form.set("emotion", FieldValue::Choice("anxiety".to_string()));

        assert_eq!(
            form.to_json(),
            serde_json::json!({
                "emotion": "anxiety",
                "intensity": 7,
                "triggers": ["work", "sleep"]
            })
        );
    }
}

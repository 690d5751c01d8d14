use crate::domain::models::{FieldValue, FormData, PracticeType};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Intro,
    Guidance,
    Exercise,
    Form,
    Summary,
    Closing,
}

impl StepKind {
    /// Steps shown once the session has been finalized.
    pub fn is_post_completion(self) -> bool {
        matches!(self, Self::Summary | Self::Closing)
    }
}

/// Rule deciding whether a step applies to the current form state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    Always,
    Equals {
        field: &'static str,
        value: &'static str,
    },
    OneOf {
        field: &'static str,
        values: &'static [&'static str],
    },
    AtLeast {
        field: &'static str,
        min: i64,
    },
    Filled {
        field: &'static str,
    },
}

impl Visibility {
    pub fn is_satisfied(&self, form: &FormData) -> bool {
        match self {
            Self::Always => true,
            Self::Equals { field, value } => form
                .get(field)
                .and_then(FieldValue::as_str)
                .map(|current| current == *value)
                .unwrap_or(false),
            Self::OneOf { field, values } => form
                .get(field)
                .and_then(FieldValue::as_str)
                .map(|current| values.contains(&current))
                .unwrap_or(false),
            Self::AtLeast { field, min } => form
                .get(field)
                .and_then(FieldValue::as_scale)
                .map(|current| current >= *min)
                .unwrap_or(false),
            Self::Filled { field } => form.get(field).is_some_and(|value| !value.is_blank()),
        }
    }

    fn referenced_field(&self) -> Option<&'static str> {
        match self {
            Self::Always => None,
            Self::Equals { field, .. }
            | Self::OneOf { field, .. }
            | Self::AtLeast { field, .. }
            | Self::Filled { field } => Some(*field),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDescriptor {
    pub id: &'static str,
    pub kind: StepKind,
    pub fields: &'static [&'static str],
    pub visibility: Visibility,
}

impl StepDescriptor {
    pub const fn new(id: &'static str, kind: StepKind) -> Self {
        Self {
            id,
            kind,
            fields: &[],
            visibility: Visibility::Always,
        }
    }

    pub fn with_fields(mut self, fields: &'static [&'static str]) -> Self {
        self.fields = fields;
        self
    }

    pub fn visible_when(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Text {
        max_len: usize,
    },
    Choice {
        options: &'static [&'static str],
    },
    Tags {
        options: Option<&'static [&'static str]>,
        max: usize,
    },
    Scale {
        min: i64,
        max: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }

    /// Checks a value entered by the user against this field's declared shape.
    pub fn check(&self, value: FieldValue) -> Result<FieldValue, String> {
        let name = self.name;
        match (&self.kind, value) {
            (FieldKind::Text { max_len }, FieldValue::Text(text)) => {
                if text.trim().chars().count() > *max_len {
                    return Err(format!("{name} must be at most {max_len} characters"));
                }
                Ok(FieldValue::Text(text))
            }
            (FieldKind::Choice { options }, FieldValue::Choice(choice)) => {
                let choice = choice.trim().to_string();
                if !choice.is_empty() && !options.contains(&choice.as_str()) {
                    return Err(format!(
                        "{name} must be one of: {}",
                        options.join(", ")
                    ));
                }
                Ok(FieldValue::Choice(choice))
            }
            (FieldKind::Tags { options, max }, FieldValue::Tags(tags)) => {
                let mut seen = HashSet::new();
                let mut normalized = Vec::new();
                for tag in tags {
                    let tag = tag.trim().to_string();
                    if tag.is_empty() || !seen.insert(tag.clone()) {
                        continue;
                    }
                    if let Some(options) = options {
                        if !options.contains(&tag.as_str()) {
                            return Err(format!("{name} does not accept tag '{tag}'"));
                        }
                    }
                    normalized.push(tag);
                }
                if normalized.len() > *max {
                    return Err(format!("{name} accepts at most {max} tags"));
                }
                Ok(FieldValue::Tags(normalized))
            }
            (FieldKind::Scale { min, max }, FieldValue::Scale(level)) => {
                if level < *min || level > *max {
                    return Err(format!("{name} must be between {min} and {max}"));
                }
                Ok(FieldValue::Scale(level))
            }
            (kind, value) => Err(format!(
                "{name} expects {} but received {}",
                kind_label(kind),
                value_label(&value)
            )),
        }
    }

    /// Interprets a server-held JSON value through this field's schema.
    pub fn decode(&self, raw: &serde_json::Value) -> Option<FieldValue> {
        let candidate = match &self.kind {
            FieldKind::Text { .. } => FieldValue::Text(raw.as_str()?.to_string()),
            FieldKind::Choice { .. } => FieldValue::Choice(raw.as_str()?.to_string()),
            FieldKind::Tags { .. } => FieldValue::Tags(
                raw.as_array()?
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(ToOwned::to_owned)
                    .collect(),
            ),
            FieldKind::Scale { .. } => match raw.as_i64() {
                Some(level) => FieldValue::Scale(level),
                None => FieldValue::Scale(raw.as_f64()?.round() as i64),
            },
        };
        self.check(candidate).ok()
    }
}

fn kind_label(kind: &FieldKind) -> &'static str {
    match kind {
        FieldKind::Text { .. } => "text",
        FieldKind::Choice { .. } => "a choice",
        FieldKind::Tags { .. } => "tags",
        FieldKind::Scale { .. } => "a scale value",
    }
}

fn value_label(value: &FieldValue) -> &'static str {
    match value {
        FieldValue::Text(_) => "text",
        FieldValue::Choice(_) => "a choice",
        FieldValue::Tags(_) => "tags",
        FieldValue::Scale(_) => "a scale value",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMove {
    Step(usize),
    Terminal,
}

/// Ordered, possibly branching steps of one practice plus the schema of the
/// fields those steps collect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFlowModel {
    practice_type: PracticeType,
    steps: Vec<StepDescriptor>,
    fields: Vec<FieldSpec>,
}

impl StepFlowModel {
    pub fn new(
        practice_type: PracticeType,
        steps: Vec<StepDescriptor>,
        fields: Vec<FieldSpec>,
    ) -> Result<Self, String> {
        if steps.is_empty() {
            return Err("flow must contain at least one step".to_string());
        }
        if steps[0].visibility != Visibility::Always {
            return Err("flow.steps[0] must always be visible".to_string());
        }

        let mut step_ids = HashSet::new();
        for step in &steps {
            if step.id.trim().is_empty() || !step_ids.insert(step.id) {
                return Err(format!("flow step id '{}' must be unique and non-empty", step.id));
            }
        }

        let mut field_names = HashSet::new();
        for field in &fields {
            if !field_names.insert(field.name) {
                return Err(format!("field '{}' is declared twice", field.name));
            }
        }
        for step in &steps {
            for field in step.fields {
                if !field_names.contains(field) {
                    return Err(format!("step '{}' collects undeclared field '{field}'", step.id));
                }
            }
            if let Some(field) = step.visibility.referenced_field() {
                if !field_names.contains(field) {
                    return Err(format!("step '{}' depends on undeclared field '{field}'", step.id));
                }
            }
        }

        if let Some(first_post) = steps.iter().position(|step| step.kind.is_post_completion()) {
            for step in &steps[first_post..] {
                if !step.kind.is_post_completion() {
                    return Err(format!(
                        "content step '{}' cannot follow the summary",
                        step.id
                    ));
                }
                if step.visibility != Visibility::Always {
                    return Err(format!("post-completion step '{}' must always be visible", step.id));
                }
            }
        }

        Ok(Self {
            practice_type,
            steps,
            fields,
        })
    }

    pub fn for_practice(practice_type: PracticeType) -> Self {
        let (steps, fields) = match practice_type {
            PracticeType::Breathing => breathing_flow(),
            PracticeType::Mindfulness => mindfulness_flow(),
            PracticeType::EmotionUnderstanding => emotion_understanding_flow(),
            PracticeType::GratitudeJournal => gratitude_journal_flow(),
        };
        Self {
            practice_type,
            steps,
            fields,
        }
    }

    pub fn practice_type(&self) -> PracticeType {
        self.practice_type
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    pub fn step(&self, index: usize) -> Option<&StepDescriptor> {
        self.steps.get(index)
    }

    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn clamp_index(&self, raw: i64) -> usize {
        raw.clamp(0, self.last_index() as i64) as usize
    }

    pub fn is_visible(&self, index: usize, form: &FormData) -> bool {
        self.steps
            .get(index)
            .is_some_and(|step| step.visibility.is_satisfied(form))
    }

    pub fn is_post_completion(&self, index: usize) -> bool {
        self.steps
            .get(index)
            .is_some_and(|step| step.kind.is_post_completion())
    }

    pub fn first_post_completion_index(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.kind.is_post_completion())
    }

    /// Next applicable step after `current`. From the last step the flow is
    /// terminal; when nothing ahead applies the result stays at the last step.
    pub fn next_step(&self, current: usize, form: &FormData) -> StepMove {
        let last = self.last_index();
        let current = current.min(last);
        if current == last {
            return StepMove::Terminal;
        }
        let next = (current + 1..=last)
            .find(|index| self.is_visible(*index, form))
            .unwrap_or(last);
        StepMove::Step(next)
    }

    /// Previous applicable step before `current`, falling back to step 0.
    pub fn prev_step(&self, current: usize, form: &FormData) -> usize {
        let current = current.min(self.last_index());
        (0..current)
            .rev()
            .find(|index| self.is_visible(*index, form))
            .unwrap_or(0)
    }

    /// `current` if it still applies to `form`, otherwise the next applicable
    /// content step, otherwise the previous applicable step.
    pub fn nearest_applicable(&self, current: usize, form: &FormData) -> usize {
        let current = current.min(self.last_index());
        if self.is_visible(current, form) {
            return current;
        }
        (current + 1..self.steps.len())
            .take_while(|index| !self.is_post_completion(*index))
            .find(|index| self.is_visible(*index, form))
            .unwrap_or_else(|| self.prev_step(current, form))
    }

    /// One-based position of `current` among the visible steps and the number
    /// of visible steps, for progress indicators.
    pub fn visible_position(&self, current: usize, form: &FormData) -> (usize, usize) {
        let current = current.min(self.last_index());
        let visible = (0..self.steps.len())
            .filter(|index| self.is_visible(*index, form))
            .collect::<Vec<_>>();
        let position = visible.iter().filter(|index| **index <= current).count();
        (position.max(1), visible.len().max(1))
    }

    pub fn validate_field(&self, name: &str, value: FieldValue) -> Result<FieldValue, String> {
        let field = self.field(name).ok_or_else(|| {
            format!("{} has no field named '{name}'", self.practice_type)
        })?;
        field.check(value)
    }

    /// Rebuilds form state from a server-held JSON object. Entries that are
    /// unknown or do not fit the schema are returned by name and left out.
    pub fn decode_form(&self, raw: &serde_json::Value) -> (FormData, Vec<String>) {
        let mut form = FormData::new(self.practice_type);
        let mut dropped = Vec::new();
        let Some(object) = raw.as_object() else {
            if !raw.is_null() {
                dropped.push("<root>".to_string());
            }
            return (form, dropped);
        };

        for (name, value) in object {
            match self.field(name).and_then(|field| field.decode(value)) {
                Some(decoded) => form.set(name, decoded),
                None => dropped.push(name.clone()),
            }
        }
        (form, dropped)
    }
}

const FEELINGS: &[&str] = &["calm", "relaxed", "neutral", "tense", "restless", "energized"];

fn reflection_fields() -> [FieldSpec; 3] {
    [
        FieldSpec::new("feeling", FieldKind::Choice { options: FEELINGS }),
        FieldSpec::new("noticed", FieldKind::Text { max_len: 500 }),
        FieldSpec::new("reflection", FieldKind::Text { max_len: 2000 }),
    ]
}

fn breathing_flow() -> (Vec<StepDescriptor>, Vec<FieldSpec>) {
    let steps = vec![
        StepDescriptor::new("intro", StepKind::Intro),
        StepDescriptor::new("posture", StepKind::Guidance),
        StepDescriptor::new("pattern", StepKind::Form).with_fields(&["pattern"]),
        StepDescriptor::new("box-breathing", StepKind::Exercise).visible_when(Visibility::Equals {
            field: "pattern",
            value: "box",
        }),
        StepDescriptor::new("four-seven-eight", StepKind::Exercise).visible_when(
            Visibility::Equals {
                field: "pattern",
                value: "four-seven-eight",
            },
        ),
        StepDescriptor::new("reflection", StepKind::Form)
            .with_fields(&["feeling", "noticed", "reflection"]),
        StepDescriptor::new("summary", StepKind::Summary),
        StepDescriptor::new("closing", StepKind::Closing),
    ];
    let mut fields = vec![FieldSpec::new(
        "pattern",
        FieldKind::Choice {
            options: &["box", "four-seven-eight"],
        },
    )];
    fields.extend(reflection_fields());
    (steps, fields)
}

fn mindfulness_flow() -> (Vec<StepDescriptor>, Vec<FieldSpec>) {
    let steps = vec![
        StepDescriptor::new("intro", StepKind::Intro),
        StepDescriptor::new("anchor", StepKind::Form).with_fields(&["anchor"]),
        StepDescriptor::new("breath-focus", StepKind::Exercise).visible_when(Visibility::Equals {
            field: "anchor",
            value: "breath",
        }),
        StepDescriptor::new("body-scan", StepKind::Exercise).visible_when(Visibility::Equals {
            field: "anchor",
            value: "body",
        }),
        StepDescriptor::new("sound-focus", StepKind::Exercise).visible_when(Visibility::Equals {
            field: "anchor",
            value: "sounds",
        }),
        StepDescriptor::new("reflection", StepKind::Form)
            .with_fields(&["feeling", "noticed", "reflection"]),
        StepDescriptor::new("summary", StepKind::Summary),
    ];
    let mut fields = vec![FieldSpec::new(
        "anchor",
        FieldKind::Choice {
            options: &["breath", "body", "sounds"],
        },
    )];
    fields.extend(reflection_fields());
    (steps, fields)
}

fn emotion_understanding_flow() -> (Vec<StepDescriptor>, Vec<FieldSpec>) {
    let steps = vec![
        StepDescriptor::new("intro", StepKind::Intro),
        StepDescriptor::new("name-emotion", StepKind::Form).with_fields(&["emotion", "intensity"]),
        StepDescriptor::new("triggers", StepKind::Form).with_fields(&["triggers"]),
        StepDescriptor::new("body-sensations", StepKind::Form)
            .with_fields(&["body_sensations"])
            .visible_when(Visibility::AtLeast {
                field: "intensity",
                min: 5,
            }),
        StepDescriptor::new("regulation", StepKind::Form)
            .with_fields(&["strategy"])
            .visible_when(Visibility::OneOf {
                field: "emotion",
                values: &["sadness", "anger", "anxiety", "shame"],
            }),
        StepDescriptor::new("reflection", StepKind::Form)
            .with_fields(&["feeling", "noticed", "reflection"]),
        StepDescriptor::new("summary", StepKind::Summary),
        StepDescriptor::new("closing", StepKind::Closing),
    ];
    let mut fields = vec![
        FieldSpec::new(
            "emotion",
            FieldKind::Choice {
                options: &["joy", "sadness", "anger", "anxiety", "shame", "calm"],
            },
        ),
        FieldSpec::new("intensity", FieldKind::Scale { min: 1, max: 10 }),
        FieldSpec::new(
            "triggers",
            FieldKind::Tags {
                options: Some(&[
                    "work",
                    "family",
                    "health",
                    "relationships",
                    "sleep",
                    "money",
                    "other",
                ]),
                max: 5,
            },
        ),
        FieldSpec::new(
            "body_sensations",
            FieldKind::Tags {
                options: Some(&[
                    "tight-chest",
                    "racing-heart",
                    "tense-shoulders",
                    "stomach-knots",
                    "warm-face",
                    "heavy-limbs",
                ]),
                max: 6,
            },
        ),
        FieldSpec::new(
            "strategy",
            FieldKind::Choice {
                options: &["breathing", "grounding", "movement", "journaling", "reach-out"],
            },
        ),
    ];
    fields.extend(reflection_fields());
    (steps, fields)
}

fn gratitude_journal_flow() -> (Vec<StepDescriptor>, Vec<FieldSpec>) {
    let steps = vec![
        StepDescriptor::new("intro", StepKind::Intro),
        StepDescriptor::new("entries", StepKind::Form).with_fields(&[
            "gratitude_1",
            "gratitude_2",
            "gratitude_3",
        ]),
        StepDescriptor::new("savor", StepKind::Form).with_fields(&["savor"]),
        StepDescriptor::new("deepen", StepKind::Form)
            .with_fields(&["deepen_note"])
            .visible_when(Visibility::Equals {
                field: "savor",
                value: "yes",
            }),
        StepDescriptor::new("reflection", StepKind::Form)
            .with_fields(&["feeling", "noticed", "reflection"]),
        StepDescriptor::new("summary", StepKind::Summary),
    ];
    let mut fields = vec![
        FieldSpec::new("gratitude_1", FieldKind::Text { max_len: 280 }),
        FieldSpec::new("gratitude_2", FieldKind::Text { max_len: 280 }),
        FieldSpec::new("gratitude_3", FieldKind::Text { max_len: 280 }),
        FieldSpec::new(
            "savor",
            FieldKind::Choice {
                options: &["yes", "no"],
            },
        ),
        FieldSpec::new("deepen_note", FieldKind::Text { max_len: 1000 }),
    ];
    fields.extend(reflection_fields());
    (steps, fields)
}

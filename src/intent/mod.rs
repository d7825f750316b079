//! Intent classification
//!
//! Turns a transcribed utterance into a [`StructuredIntent`]. Two variants
//! exist: a model-backed classifier and a deterministic pattern matcher. The
//! model is tried once at session start; if it cannot be loaded the pattern
//! matcher is used for the rest of the session.

mod model;
mod ollama;
mod pattern;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::locale::Locale;

pub use model::ModelClassifier;
#[cfg(test)]
pub use model::{ClassifierError, LanguageModel};
pub use ollama::OllamaModel;
pub use pattern::PatternClassifier;

/// Entity key holding the hive number, as spoken
pub const HIVE_ID: &str = "hive_id";
/// Entity key holding the note text
pub const CONTENT: &str = "content";

/// Fixed intent vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    CreateLog,
    ReadLastLog,
    ReadLastTask,
    Help,
    Unknown,
}

impl IntentKind {
    pub const ALL: [IntentKind; 5] = [
        IntentKind::CreateLog,
        IntentKind::ReadLastLog,
        IntentKind::ReadLastTask,
        IntentKind::Help,
        IntentKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::CreateLog => "create_log",
            IntentKind::ReadLastLog => "read_last_log",
            IntentKind::ReadLastTask => "read_last_task",
            IntentKind::Help => "help",
            IntentKind::Unknown => "unknown",
        }
    }

    /// Names outside the vocabulary map to `Unknown`
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name.trim())
            .unwrap_or(IntentKind::Unknown)
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredIntent {
    pub kind: IntentKind,
    /// Raw entity strings; numeric parsing happens in the dispatcher
    pub entities: BTreeMap<String, String>,
    /// Pre-formed reply supplied by a model-based classifier
    pub response_text: Option<String>,
}

impl StructuredIntent {
    pub fn new(kind: IntentKind) -> Self {
        Self {
            kind,
            entities: BTreeMap::new(),
            response_text: None,
        }
    }

    pub fn unknown() -> Self {
        Self::new(IntentKind::Unknown)
    }

    pub fn with_entity(mut self, key: &str, value: impl Into<String>) -> Self {
        self.entities.insert(key.to_string(), value.into());
        self
    }

    #[cfg(test)]
    pub fn with_response(mut self, text: impl Into<String>) -> Self {
        self.response_text = Some(text.into());
        self
    }

    /// Hive number, if present and numeric
    pub fn hive_id(&self) -> Option<i64> {
        self.entities.get(HIVE_ID)?.trim().parse().ok()
    }

    /// Note content, if present and not blank
    pub fn content(&self) -> Option<&str> {
        self.entities
            .get(CONTENT)
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
    }
}

/// An intent waiting for one more utterance from the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIntent {
    pub kind: IntentKind,
    pub entities: BTreeMap<String, String>,
}

impl PendingIntent {
    pub fn from_intent(intent: &StructuredIntent) -> Self {
        Self {
            kind: intent.kind,
            entities: intent.entities.clone(),
        }
    }

    /// Complete the intent with the next utterance as its content
    pub fn fill(self, content: &str) -> StructuredIntent {
        let mut intent = StructuredIntent {
            kind: self.kind,
            entities: self.entities,
            response_text: None,
        };
        intent
            .entities
            .insert(CONTENT.to_string(), content.trim().to_string());
        intent
    }
}

/// Converts free text into a structured intent
///
/// `classify` must always resolve: internal failures come back as
/// [`StructuredIntent::unknown`] rather than as an error.
#[async_trait]
pub trait IntentClassifier: Send + Sync + std::fmt::Debug {
    /// Short name reported in status output
    fn name(&self) -> &'static str;

    /// Load whatever the classifier needs; `false` if it cannot be used
    async fn initialize(&self, model_path: &Path) -> bool;

    async fn classify(&self, text: &str, locale: Locale) -> StructuredIntent;
}

/// Pick the classifier for this session
///
/// The preferred classifier is initialized once. If it fails, or no model
/// path is available, the pattern matcher is used instead and never
/// replaced for the lifetime of the session.
pub async fn select_classifier(
    preferred: Arc<dyn IntentClassifier>,
    model_path: Option<&Path>,
) -> Arc<dyn IntentClassifier> {
    if let Some(path) = model_path {
        if preferred.initialize(path).await {
            info!(classifier = preferred.name(), "intent classifier ready");
            return preferred;
        }
        warn!(
            classifier = preferred.name(),
            ?path,
            "intent classifier failed to initialize, falling back to patterns"
        );
    } else {
        warn!("no classifier model available, falling back to patterns");
    }

    Arc::new(PatternClassifier::new())
}

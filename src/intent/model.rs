//! Language-model backed classifier
//!
//! Builds an instruction prompt around the utterance, asks the model for a
//! single JSON object and extracts it from whatever prose surrounds it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{IntentClassifier, IntentKind, StructuredIntent, CONTENT, HIVE_ID};
use crate::locale::Locale;

/// Errors raised by a language model backend
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("model file missing or empty: {0}")]
    ModelMissing(PathBuf),

    #[error("model backend unavailable: {0}")]
    Unavailable(String),

    #[error("generation request failed: {0}")]
    Request(String),

    #[error("generation timed out after {0} seconds")]
    Timeout(u64),
}

/// Text generation engine behind [`ModelClassifier`]
#[async_trait]
pub trait LanguageModel: Send + Sync + std::fmt::Debug {
    /// Prepare the model stored at `model_path`
    async fn load(&self, model_path: &Path) -> Result<(), ClassifierError>;

    /// Complete a prompt
    async fn generate(&self, prompt: &str) -> Result<String, ClassifierError>;
}

/// Classifier delegating to a [`LanguageModel`]
#[derive(Debug)]
pub struct ModelClassifier<M> {
    model: M,
    loaded: AtomicBool,
    timeout: Duration,
}

impl<M: LanguageModel> ModelClassifier<M> {
    pub fn new(model: M, timeout: Duration) -> Self {
        Self {
            model,
            loaded: AtomicBool::new(false),
            timeout,
        }
    }

    async fn load(&self, model_path: &Path) -> Result<(), ClassifierError> {
        let metadata = tokio::fs::metadata(model_path)
            .await
            .map_err(|_| ClassifierError::ModelMissing(model_path.to_owned()))?;
        if metadata.len() == 0 {
            return Err(ClassifierError::ModelMissing(model_path.to_owned()));
        }
        self.model.load(model_path).await
    }

    async fn generate(&self, prompt: &str) -> Result<String, ClassifierError> {
        match tokio::time::timeout(self.timeout, self.model.generate(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(ClassifierError::Timeout(self.timeout.as_secs())),
        }
    }
}

#[async_trait]
impl<M: LanguageModel> IntentClassifier for ModelClassifier<M> {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn initialize(&self, model_path: &Path) -> bool {
        match self.load(model_path).await {
            Ok(()) => {
                info!(?model_path, "language model loaded");
                self.loaded.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                error!(error = %e, "failed to load language model");
                false
            }
        }
    }

    async fn classify(&self, text: &str, locale: Locale) -> StructuredIntent {
        if !self.loaded.load(Ordering::SeqCst) {
            warn!("classify called before the model was loaded");
            return StructuredIntent::unknown();
        }

        let prompt = build_prompt(text, locale);
        match self.generate(&prompt).await {
            Ok(output) => parse_response(&output),
            Err(e) => {
                error!(error = %e, "intent generation failed");
                StructuredIntent::unknown()
            }
        }
    }
}

const ENGLISH_EXAMPLES: &str = r#"1. User text: "create a note for beehive 10 that says the queen is healthy"
   JSON: {"intent":"create_log","entities":{"hive_id":"10","content":"the queen is healthy"},"responseText":"Note saved for beehive 10."}
2. User text: "note for hive 4"
   JSON: {"intent":"create_log","entities":{"hive_id":"4"},"responseText":"Okay, what is the note for beehive 4?"}
3. User text: "read last note for hive 5"
   JSON: {"intent":"read_last_log","entities":{"hive_id":"5"}}
4. User text: "what is the last task for beehive 2"
   JSON: {"intent":"read_last_task","entities":{"hive_id":"2"}}
5. User text: "what can I say"
   JSON: {"intent":"help","entities":{}}
6. User text: "what's the weather like"
   JSON: {"intent":"unknown","entities":{}}"#;

const SERBIAN_EXAMPLES: &str = r#"1. User text: "beleška za košnicu 10 matica je zdrava"
   JSON: {"intent":"create_log","entities":{"hive_id":"10","content":"matica je zdrava"},"responseText":"Beleška sačuvana za košnicu 10."}
2. User text: "beleška za košnicu 4"
   JSON: {"intent":"create_log","entities":{"hive_id":"4"},"responseText":"U redu, koja je beleška za košnicu 4?"}
3. User text: "zadnja beleška za košnicu 5"
   JSON: {"intent":"read_last_log","entities":{"hive_id":"5"}}
4. User text: "zadnji zadatak za košnicu 2"
   JSON: {"intent":"read_last_task","entities":{"hive_id":"2"}}
5. User text: "pomoć"
   JSON: {"intent":"help","entities":{}}
6. User text: "kakvo je vreme"
   JSON: {"intent":"unknown","entities":{}}"#;

/// Instruction prompt for one utterance
pub(crate) fn build_prompt(text: &str, locale: Locale) -> String {
    let vocabulary = IntentKind::ALL
        .iter()
        .map(|k| format!("'{}'", k.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let examples = match locale {
        Locale::English => ENGLISH_EXAMPLES,
        Locale::Serbian => SERBIAN_EXAMPLES,
    };

    format!(
        "You are a JSON formatting API for a beekeeping assistant. Your ONLY job is to \
         analyze the user's text and convert it into one JSON object.\n\
         \n\
         Instructions:\n\
         - The possible intents are: {vocabulary}.\n\
         - Extract '{HIVE_ID}' (the hive number) and '{CONTENT}' (the note) when present.\n\
         - Add 'responseText', a short spoken reply in the user's language, when useful.\n\
         - Respond with ONLY the JSON object and no other text.\n\
         \n\
         Examples:\n\
         {examples}\n\
         \n\
         User text: \"{text}\"\n\
         JSON:"
    )
}

#[derive(Debug, Deserialize)]
struct RawIntent {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    entities: Option<serde_json::Map<String, Value>>,
    #[serde(default, rename = "responseText")]
    response_text: Option<String>,
    /// Some models put the note next to `entities` instead of inside it
    #[serde(default)]
    content: Option<Value>,
}

/// Extract the intent from raw model output
pub(crate) fn parse_response(output: &str) -> StructuredIntent {
    let (Some(first), Some(last)) = (output.find('{'), output.rfind('}')) else {
        warn!(output, "model output contained no JSON object");
        return StructuredIntent::unknown();
    };
    if last < first {
        warn!(output, "model output contained no JSON object");
        return StructuredIntent::unknown();
    }

    let json = &output[first..=last];
    let raw: RawIntent = match serde_json::from_str(json) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, json, "failed to parse model output");
            return StructuredIntent::unknown();
        }
    };

    let kind = IntentKind::from_name(raw.intent.as_deref().unwrap_or("unknown"));
    if kind == IntentKind::Unknown {
        return StructuredIntent::unknown();
    }

    let mut intent = StructuredIntent::new(kind);
    let entities = raw.entities.unwrap_or_default();
    for key in [HIVE_ID, CONTENT] {
        if let Some(value) = entities.get(key).and_then(entity_string) {
            intent = intent.with_entity(key, value);
        }
    }
    if let Some(content) = raw.content.as_ref().and_then(entity_string) {
        intent = intent.with_entity(CONTENT, content);
    }
    intent.response_text = raw.response_text.filter(|t| !t.trim().is_empty());

    debug!(intent = %intent.kind, entities = ?intent.entities, "model classified utterance");
    intent
}

fn entity_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

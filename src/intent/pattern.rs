//! Deterministic prefix matching classifier
//!
//! Recognizes a small fixed command vocabulary per locale. It only ever
//! extracts the hive number; note content is always gathered through the
//! follow-up question, so this classifier never emits a `content` entity.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::{IntentClassifier, IntentKind, StructuredIntent, HIVE_ID};
use crate::locale::Locale;

/// A command prefix and the intent it selects
struct Command {
    prefix: &'static str,
    kind: IntentKind,
}

const ENGLISH_COMMANDS: &[Command] = &[
    Command { prefix: "last note for beehive", kind: IntentKind::ReadLastLog },
    Command { prefix: "last task for beehive", kind: IntentKind::ReadLastTask },
    Command { prefix: "note for beehive", kind: IntentKind::CreateLog },
];

const ENGLISH_HELP: &[&str] = &["help", "what can i say"];

const SERBIAN_COMMANDS: &[Command] = &[
    Command { prefix: "zadnja beleška za košnicu", kind: IntentKind::ReadLastLog },
    Command { prefix: "zadnji zadatak za košnicu", kind: IntentKind::ReadLastTask },
    Command { prefix: "beleška za košnicu", kind: IntentKind::CreateLog },
];

const SERBIAN_HELP: &[&str] = &["pomoć", "pomoc", "šta mogu da kažem"];

/// Fallback classifier built on prefix matching
#[derive(Debug, Default)]
pub struct PatternClassifier;

impl PatternClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify synchronously; the trait method just wraps this
    pub fn match_text(&self, text: &str, locale: Locale) -> StructuredIntent {
        let normalized = text
            .trim()
            .trim_end_matches(['.', '!', '?', ','])
            .to_lowercase();

        let (commands, help) = match locale {
            Locale::English => (ENGLISH_COMMANDS, ENGLISH_HELP),
            Locale::Serbian => (SERBIAN_COMMANDS, SERBIAN_HELP),
        };

        if help.contains(&normalized.as_str()) {
            return StructuredIntent::new(IntentKind::Help);
        }

        // Longest prefix first, so "last note for beehive" never reads as a create
        let mut by_length: Vec<&Command> = commands.iter().collect();
        by_length.sort_by_key(|c| std::cmp::Reverse(c.prefix.len()));

        for command in by_length {
            if let Some(rest) = normalized.strip_prefix(command.prefix) {
                let mut intent = StructuredIntent::new(command.kind);
                let hive = rest.trim();
                if !hive.is_empty() {
                    intent = intent.with_entity(HIVE_ID, hive);
                }
                return intent;
            }
        }

        debug!(text = %normalized, %locale, "no command pattern matched");
        StructuredIntent::unknown()
    }
}

#[async_trait]
impl IntentClassifier for PatternClassifier {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn initialize(&self, _model_path: &Path) -> bool {
        true
    }

    async fn classify(&self, text: &str, locale: Locale) -> StructuredIntent {
        self.match_text(text, locale)
    }
}

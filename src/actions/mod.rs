//! Executes classified intents
//!
//! Each intent maps to one action and produces the sentence to speak back.
//! Note creation only touches the local store; reads go to the server and
//! are not retried when the network fails.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::api::HiveApi;
use crate::intent::{IntentKind, PendingIntent, StructuredIntent};
use crate::locale::Locale;
use crate::store::NoteStore;
use crate::sync::SyncHandle;

/// What the controller should do after dispatching an intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Speak this and return to hotword listening
    Respond(String),
    /// Ask `prompt`, then complete `pending` with the next utterance
    NeedsMoreInfo {
        prompt: String,
        pending: PendingIntent,
    },
}

/// Maps intents to side effects and spoken responses
pub struct ActionDispatcher {
    store: Arc<NoteStore>,
    api: Arc<dyn HiveApi>,
    sync: SyncHandle,
}

impl ActionDispatcher {
    pub fn new(store: Arc<NoteStore>, api: Arc<dyn HiveApi>, sync: SyncHandle) -> Self {
        Self { store, api, sync }
    }

    pub async fn dispatch(&self, intent: StructuredIntent, locale: Locale) -> DispatchOutcome {
        let phrases = locale.phrases();
        debug!(intent = %intent.kind, entities = ?intent.entities, "dispatching intent");

        match intent.kind {
            IntentKind::CreateLog => self.create_log(intent, locale),
            IntentKind::ReadLastLog => {
                let Some(hive_id) = intent.hive_id() else {
                    return DispatchOutcome::Respond(phrases.missing_hive.to_string());
                };
                DispatchOutcome::Respond(self.read_last_log(hive_id, locale).await)
            }
            IntentKind::ReadLastTask => {
                let Some(hive_id) = intent.hive_id() else {
                    return DispatchOutcome::Respond(phrases.missing_hive.to_string());
                };
                DispatchOutcome::Respond(self.read_last_task(hive_id, locale).await)
            }
            IntentKind::Help => DispatchOutcome::Respond(phrases.help.to_string()),
            IntentKind::Unknown => DispatchOutcome::Respond(phrases.not_understood.to_string()),
        }
    }

    /// Finish a multi-turn intent with the utterance that answered it
    pub fn complete_pending(&self, pending: PendingIntent, text: &str, locale: Locale) -> String {
        let phrases = locale.phrases();
        let intent = pending.fill(text);

        match (intent.kind, intent.hive_id(), intent.content()) {
            (IntentKind::CreateLog, Some(hive_id), Some(content)) => {
                self.save_note(hive_id, content, None, locale)
            }
            (IntentKind::CreateLog, Some(_), None) => phrases.error(phrases.not_heard),
            _ => {
                warn!(intent = %intent.kind, "pending intent could not be completed");
                phrases.error(phrases.lost_pending)
            }
        }
    }

    fn create_log(&self, intent: StructuredIntent, locale: Locale) -> DispatchOutcome {
        let phrases = locale.phrases();

        let Some(hive_id) = intent.hive_id() else {
            return DispatchOutcome::Respond(phrases.missing_hive.to_string());
        };

        match intent.content() {
            Some(content) => DispatchOutcome::Respond(self.save_note(
                hive_id,
                content,
                intent.response_text.as_deref(),
                locale,
            )),
            None => DispatchOutcome::NeedsMoreInfo {
                prompt: intent
                    .response_text
                    .clone()
                    .unwrap_or_else(|| phrases.note_prompt(hive_id)),
                pending: PendingIntent::from_intent(&intent),
            },
        }
    }

    fn save_note(&self, hive_id: i64, content: &str, reply: Option<&str>, locale: Locale) -> String {
        let phrases = locale.phrases();
        match self.store.create_log(hive_id, content) {
            Ok(note) => {
                info!(local_id = note.id, hive_id, "note recorded");
                self.sync.request();
                reply
                    .map(str::to_string)
                    .unwrap_or_else(|| phrases.note_saved(hive_id))
            }
            Err(e) => {
                error!(error = %e, hive_id, "failed to store note");
                phrases.error(phrases.save_failed)
            }
        }
    }

    async fn read_last_log(&self, hive_id: i64, locale: Locale) -> String {
        let phrases = locale.phrases();
        match self.api.last_log(hive_id).await {
            Ok(Some(log)) if !log.content.trim().is_empty() => phrases.last_note(&log.content),
            Ok(_) => phrases.no_notes(hive_id),
            Err(e) => {
                warn!(error = %e, hive_id, "failed to fetch last note");
                phrases.network_error.to_string()
            }
        }
    }

    async fn read_last_task(&self, hive_id: i64, locale: Locale) -> String {
        let phrases = locale.phrases();
        match self.api.last_task(hive_id).await {
            Ok(Some(task)) if !task.content.trim().is_empty() => phrases.last_task(&task.content),
            Ok(_) => phrases.no_tasks(hive_id),
            Err(e) => {
                warn!(error = %e, hive_id, "failed to fetch last task");
                phrases.network_error.to_string()
            }
        }
    }
}

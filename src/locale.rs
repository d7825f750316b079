//! Session language and the spoken phrases for each language
//!
//! The locale is chosen once at startup and handed to the session
//! controller, which passes it to every classify and transcribe call.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Languages the assistant can listen and answer in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locale {
    #[default]
    English,
    Serbian,
}

impl Locale {
    /// Parse a language tag such as `en`, `en-US` or `sr-Latn`
    ///
    /// Unknown tags fall back to English.
    pub fn from_tag(tag: &str) -> Self {
        let language = tag
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();

        match language.as_str() {
            "en" => Locale::English,
            "sr" => Locale::Serbian,
            other => {
                warn!(tag = other, "unsupported locale, falling back to English");
                Locale::English
            }
        }
    }

    /// Short language tag
    pub fn tag(&self) -> &'static str {
        match self {
            Locale::English => "en",
            Locale::Serbian => "sr",
        }
    }

    /// Spoken phrases for this locale
    pub fn phrases(&self) -> &'static Phrases {
        match self {
            Locale::English => &ENGLISH,
            Locale::Serbian => &SERBIAN,
        }
    }
}

impl std::fmt::Display for Locale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Every fixed sentence the assistant speaks
#[derive(Debug)]
pub struct Phrases {
    pub wake_prompt: &'static str,
    pub help: &'static str,
    pub not_understood: &'static str,
    pub missing_hive: &'static str,
    pub network_error: &'static str,
    pub listen_timeout: &'static str,
    pub not_heard: &'static str,
    pub lost_pending: &'static str,
    pub save_failed: &'static str,
    pub apology: &'static str,
    note_prompt: &'static str,
    note_saved: &'static str,
    last_note: &'static str,
    last_task: &'static str,
    no_notes: &'static str,
    no_tasks: &'static str,
}

impl Phrases {
    /// Prompt asking for the content of a note for `hive_id`
    pub fn note_prompt(&self, hive_id: i64) -> String {
        fill(self.note_prompt, hive_id)
    }

    /// Confirmation after a note was stored
    pub fn note_saved(&self, hive_id: i64) -> String {
        fill(self.note_saved, hive_id)
    }

    pub fn last_note(&self, content: &str) -> String {
        self.last_note.replace("{content}", content)
    }

    pub fn last_task(&self, content: &str) -> String {
        self.last_task.replace("{content}", content)
    }

    pub fn no_notes(&self, hive_id: i64) -> String {
        fill(self.no_notes, hive_id)
    }

    pub fn no_tasks(&self, hive_id: i64) -> String {
        fill(self.no_tasks, hive_id)
    }

    /// Apology spoken for a recoverable failure
    pub fn error(&self, message: &str) -> String {
        format!("{} {}", self.apology, message)
    }
}

fn fill(template: &str, hive_id: i64) -> String {
    template.replace("{hive}", &hive_id.to_string())
}

static ENGLISH: Phrases = Phrases {
    wake_prompt: "Yes?",
    help: "You can say: note for beehive, followed by a number, to record a note. \
           Last note for beehive, or last task for beehive, followed by a number, to hear them.",
    not_understood: "Sorry, I didn't understand that command.",
    missing_hive: "I understood you want to create a note, but I didn't catch the hive number.",
    network_error: "There was a network error. Please try again later.",
    listen_timeout: "I didn't hear anything.",
    not_heard: "I didn't catch that.",
    lost_pending: "I lost track of which hive to save the note for.",
    save_failed: "I couldn't save the note.",
    apology: "Sorry.",
    note_prompt: "Okay, I'm ready to record your note for beehive {hive}.",
    note_saved: "Note saved for beehive {hive}.",
    last_note: "The last note is: {content}",
    last_task: "The last task is: {content}",
    no_notes: "No notes found for beehive {hive}.",
    no_tasks: "No tasks found for beehive {hive}.",
};

static SERBIAN: Phrases = Phrases {
    wake_prompt: "Da?",
    help: "Možete reći: beleška za košnicu, pa broj, da zabeležite belešku. \
           Zadnja beleška za košnicu, ili zadnji zadatak za košnicu, pa broj, da ih čujete.",
    not_understood: "Izvinite, nisam razumeo komandu.",
    missing_hive: "Razumeo sam da želite belešku, ali nisam čuo broj košnice.",
    network_error: "Došlo je do greške na mreži. Pokušajte ponovo kasnije.",
    listen_timeout: "Nisam ništa čuo.",
    not_heard: "Nisam razumeo.",
    lost_pending: "Izgubio sam broj košnice za belešku.",
    save_failed: "Nisam uspeo da sačuvam belešku.",
    apology: "Izvinite.",
    note_prompt: "U redu, spreman sam da zabeležim belešku za košnicu {hive}.",
    note_saved: "Beleška sačuvana za košnicu {hive}.",
    last_note: "Zadnja beleška je: {content}",
    last_task: "Zadnji zadatak je: {content}",
    no_notes: "Nema beleški za košnicu {hive}.",
    no_tasks: "Nema zadataka za košnicu {hive}.",
};

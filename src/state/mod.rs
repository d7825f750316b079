//! Session state management
//!
//! The conversation runs through nine states:
//! - Stopped: not started, or terminated
//! - Initializing: components loading
//! - Idle: listening for the wake phrase
//! - Awoken: acknowledging the wake phrase
//! - AwaitingCommand / AwaitingNote: capturing an utterance
//! - AwaitingAnswer: asking a follow-up question
//! - Processing: classifying and executing a command
//! - Speaking: answering

mod machine;

pub use machine::{SessionController, SessionState, Subsystems};

/// Human-readable status for hosts
pub fn status_line(state: SessionState, wake_phrase: &str) -> String {
    match state {
        SessionState::Stopped => "Stopped".to_string(),
        SessionState::Initializing => "Loading models...".to_string(),
        SessionState::Idle => format!("Listening for '{}'...", wake_phrase),
        SessionState::Awoken => "Wake phrase heard".to_string(),
        SessionState::AwaitingCommand => "Listening for a command...".to_string(),
        SessionState::AwaitingNote => "Listening for your note...".to_string(),
        SessionState::AwaitingAnswer => "Asking for details...".to_string(),
        SessionState::Processing => "Thinking...".to_string(),
        SessionState::Speaking => "Speaking...".to_string(),
    }
}

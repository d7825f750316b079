//! Voice capability interfaces
//!
//! The wake-word detector, command transcriber and announcer are black-box
//! engines behind these traits. None of them decides when to run: the
//! session controller starts and stops them, and they report back by posting
//! events through the [`EventSink`] they were started with.

mod console;
mod microphone;

use std::path::Path;

use async_trait::async_trait;

use crate::assets::ModelKind;
use crate::events::{EventSink, UtteranceId};
use crate::locale::Locale;

pub use console::{ConsoleAnnouncer, ConsoleDetector, ConsoleInput, ConsoleTranscriber};
pub use microphone::{MicOwner, Microphone};

/// Errors raised by voice components
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("microphone is held by the {0}")]
    MicrophoneBusy(MicOwner),

    #[error("component used before initialization")]
    NotInitialized,

    #[error("speech engine error: {0}")]
    Engine(String),
}

/// Low-power listener for the wake phrase
#[async_trait]
pub trait HotwordDetector: Send + Sync {
    /// Model the detector needs from the asset provider, if any
    fn required_model(&self) -> Option<ModelKind> {
        None
    }

    async fn initialize(&self, model_path: Option<&Path>) -> Result<(), VoiceError>;

    /// Acquire the microphone and post `HotwordDetected` once on the wake phrase
    fn start(&self, sink: EventSink) -> Result<(), VoiceError>;

    /// Stop listening and release the microphone; idempotent
    fn stop(&self);

    fn is_active(&self) -> bool;
}

/// On-demand transcription of a single utterance
#[async_trait]
pub trait CommandTranscriber: Send + Sync {
    fn required_model(&self) -> Option<ModelKind> {
        None
    }

    async fn initialize(&self, model_path: Option<&Path>) -> Result<(), VoiceError>;

    /// Acquire the microphone and post one `UtteranceTranscribed`, or a
    /// recoverable failure if nothing usable was heard
    fn start(&self, locale: Locale, sink: EventSink) -> Result<(), VoiceError>;

    /// Stop listening and release the microphone; idempotent
    fn stop(&self);

    fn is_active(&self) -> bool;
}

/// Models the composed listeners need before the session can start
pub fn required_models(
    detector: &dyn HotwordDetector,
    transcriber: &dyn CommandTranscriber,
) -> Vec<ModelKind> {
    [detector.required_model(), transcriber.required_model()]
        .into_iter()
        .flatten()
        .collect()
}

/// Text-to-speech output
#[async_trait]
pub trait VoiceAnnouncer: Send + Sync {
    async fn initialize(&self, locale: Locale) -> Result<(), VoiceError>;

    /// Replace anything being spoken with `text`; post `SpeakDone(utterance)`
    /// when finished
    fn speak(&self, text: &str, utterance: UtteranceId, sink: EventSink) -> Result<(), VoiceError>;

    /// Drop the current utterance without posting its completion
    fn stop(&self);

    /// Release the engine for good
    fn shutdown(&self);

    fn is_active(&self) -> bool;
}

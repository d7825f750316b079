//! Events flowing into and out of the session controller
//!
//! Components never call back into the controller. Everything they have to
//! say is turned into a [`SessionEvent`] and posted to the controller's inbox,
//! where events are handled one at a time in arrival order. State changes go
//! the other way as [`StateEvent`]s on a broadcast channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::actions::DispatchOutcome;
use crate::intent::{IntentClassifier, StructuredIntent};
use crate::state::SessionState;

/// Subsystems coordinated by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Assets,
    Detector,
    Transcriber,
    Announcer,
    Classifier,
    Storage,
    Host,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Component::Assets => "assets",
            Component::Detector => "detector",
            Component::Transcriber => "transcriber",
            Component::Announcer => "announcer",
            Component::Classifier => "classifier",
            Component::Storage => "storage",
            Component::Host => "host",
        };
        f.write_str(name)
    }
}

/// The only error shape the controller ever sees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentFailure {
    pub source: Component,
    /// Message suitable for speaking back to the user
    pub message: String,
    pub fatal: bool,
}

impl ComponentFailure {
    pub fn fatal(source: Component, message: impl Into<String>) -> Self {
        Self {
            source,
            message: message.into(),
            fatal: true,
        }
    }

    pub fn recoverable(source: Component, message: impl Into<String>) -> Self {
        Self {
            source,
            message: message.into(),
            fatal: false,
        }
    }
}

impl std::fmt::Display for ComponentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.fatal { "fatal" } else { "recoverable" };
        write!(f, "{} {} failure: {}", self.source, kind, self.message)
    }
}

/// Why an utterance was spoken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtterancePurpose {
    /// Wake acknowledgement, followed by command capture
    Prompt,
    /// Follow-up question, followed by capture of the missing piece
    MultiTurn,
    /// Final answer, followed by a return to hotword listening
    Response,
}

/// Correlation id attached to every announcer request
///
/// The sequence number makes two utterances with the same purpose distinct,
/// so a late completion for an earlier one never matches a newer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtteranceId {
    pub purpose: UtterancePurpose,
    pub seq: u64,
}

impl std::fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let purpose = match self.purpose {
            UtterancePurpose::Prompt => "PROMPT",
            UtterancePurpose::MultiTurn => "MULTI_TURN",
            UtterancePurpose::Response => "RESPONSE",
        };
        write!(f, "{}#{}", purpose, self.seq)
    }
}

/// Everything the controller reacts to
#[derive(Debug)]
pub enum SessionEvent {
    /// Host asked for the session to start
    Start,
    /// Host asked for the session to stop
    Stop,
    /// A subsystem finished asynchronous initialization
    ComponentReady(Component),
    /// Classifier selection finished, possibly on the fallback
    ClassifierSelected(Arc<dyn IntentClassifier>),
    HotwordDetected,
    UtteranceTranscribed(String),
    /// The listening window armed with this generation elapsed
    ListenTimeout { generation: u64 },
    SpeakDone(UtteranceId),
    Classified(StructuredIntent),
    Dispatched(DispatchOutcome),
    Failed(ComponentFailure),
}

/// Handle components use to post events to the controller inbox
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SessionEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Post an event, waiting for inbox capacity
    pub async fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).await.is_err() {
            warn!("session inbox closed, event dropped");
        }
    }

    /// Post an event from a context that cannot await
    pub fn try_emit(&self, event: SessionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "failed to post session event");
        }
    }
}

/// Notifications emitted by the controller on every transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
        /// How long the previous state lasted
        duration_ms: u64,
    },
    /// The session settled on its intent classifier
    ClassifierSelected { name: String },
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateEvent::StateChanged {
                from,
                to,
                duration_ms,
            } => write!(f, "STATE_CHANGED {} -> {} ({}ms)", from, to, duration_ms),
            StateEvent::ClassifierSelected { name } => write!(f, "CLASSIFIER_SELECTED {}", name),
        }
    }
}

//! Terminal-backed voice components
//!
//! Lines typed on stdin stand in for microphone audio and spoken output is
//! printed. A single reader task owns stdin and hands each line to whichever
//! component holds the microphone, so the routing mirrors the real audio
//! pipeline: nothing is heard while neither listener is running.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CommandTranscriber, HotwordDetector, MicOwner, Microphone, VoiceAnnouncer, VoiceError};
use crate::events::{Component, ComponentFailure, EventSink, SessionEvent, UtteranceId};
use crate::locale::Locale;

/// Simulated speaking time per word
const WORD_DURATION: Duration = Duration::from_millis(60);

struct DetectorRoute {
    sink: EventSink,
    fired: bool,
}

struct TranscriberRoute {
    sink: EventSink,
    locale: Locale,
}

#[derive(Default)]
struct Routes {
    detector: Option<DetectorRoute>,
    transcriber: Option<TranscriberRoute>,
}

/// Shared stdin line router
pub struct ConsoleInput {
    mic: Arc<Microphone>,
    wake_phrase: String,
    routes: Mutex<Routes>,
}

impl ConsoleInput {
    pub fn new(wake_phrase: &str, mic: Arc<Microphone>) -> Arc<Self> {
        Arc::new(Self {
            mic,
            wake_phrase: wake_phrase.trim().to_lowercase(),
            routes: Mutex::new(Routes::default()),
        })
    }

    /// Read stdin until EOF, routing every line
    pub fn spawn_reader(self: &Arc<Self>) -> JoinHandle<()> {
        let input = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => input.route_line(&line),
                    Ok(None) => {
                        info!("console input closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read console input");
                        break;
                    }
                }
            }
        })
    }

    /// Deliver one line of "audio" to the current listener
    pub fn route_line(&self, line: &str) {
        let mut routes = self.routes.lock();

        if let Some(route) = routes.transcriber.take() {
            self.mic.release(MicOwner::Transcriber);
            let text = line.trim();
            if text.is_empty() {
                route.sink.try_emit(SessionEvent::Failed(ComponentFailure::recoverable(
                    Component::Transcriber,
                    route.locale.phrases().not_heard,
                )));
            } else {
                debug!(text, "utterance transcribed");
                route
                    .sink
                    .try_emit(SessionEvent::UtteranceTranscribed(text.to_string()));
            }
            return;
        }

        if let Some(route) = routes.detector.as_mut() {
            if !route.fired && line.to_lowercase().contains(&self.wake_phrase) {
                route.fired = true;
                debug!("wake phrase heard");
                route.sink.try_emit(SessionEvent::HotwordDetected);
            }
            return;
        }

        debug!("no listener, line dropped");
    }
}

/// Wake phrase detector over [`ConsoleInput`]
pub struct ConsoleDetector {
    input: Arc<ConsoleInput>,
    ready: AtomicBool,
}

impl ConsoleDetector {
    pub fn new(input: Arc<ConsoleInput>) -> Self {
        Self {
            input,
            ready: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl HotwordDetector for ConsoleDetector {
    async fn initialize(&self, _model_path: Option<&Path>) -> Result<(), VoiceError> {
        info!(phrase = %self.input.wake_phrase, "console wake detector ready");
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn start(&self, sink: EventSink) -> Result<(), VoiceError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(VoiceError::NotInitialized);
        }
        self.input.mic.acquire(MicOwner::Detector)?;
        self.input.routes.lock().detector = Some(DetectorRoute { sink, fired: false });
        Ok(())
    }

    fn stop(&self) {
        self.input.routes.lock().detector = None;
        self.input.mic.release(MicOwner::Detector);
    }

    fn is_active(&self) -> bool {
        self.input.routes.lock().detector.is_some()
    }
}

/// Single-utterance transcriber over [`ConsoleInput`]
pub struct ConsoleTranscriber {
    input: Arc<ConsoleInput>,
    ready: AtomicBool,
}

impl ConsoleTranscriber {
    pub fn new(input: Arc<ConsoleInput>) -> Self {
        Self {
            input,
            ready: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl CommandTranscriber for ConsoleTranscriber {
    async fn initialize(&self, _model_path: Option<&Path>) -> Result<(), VoiceError> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn start(&self, locale: Locale, sink: EventSink) -> Result<(), VoiceError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(VoiceError::NotInitialized);
        }
        self.input.mic.acquire(MicOwner::Transcriber)?;
        self.input.routes.lock().transcriber = Some(TranscriberRoute { sink, locale });
        Ok(())
    }

    fn stop(&self) {
        self.input.routes.lock().transcriber = None;
        self.input.mic.release(MicOwner::Transcriber);
    }

    fn is_active(&self) -> bool {
        self.input.routes.lock().transcriber.is_some()
    }
}

/// Announcer that prints instead of speaking
#[derive(Default)]
pub struct ConsoleAnnouncer {
    current: Arc<Mutex<Option<UtteranceId>>>,
    ready: AtomicBool,
}

impl ConsoleAnnouncer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VoiceAnnouncer for ConsoleAnnouncer {
    async fn initialize(&self, locale: Locale) -> Result<(), VoiceError> {
        info!(%locale, "console announcer ready");
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn speak(&self, text: &str, utterance: UtteranceId, sink: EventSink) -> Result<(), VoiceError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(VoiceError::NotInitialized);
        }

        writeln!(std::io::stdout().lock(), "{text}")
            .map_err(|e| VoiceError::Engine(e.to_string()))?;
        *self.current.lock() = Some(utterance);

        let words = text.split_whitespace().count().max(1) as u32;
        let current = Arc::clone(&self.current);
        tokio::spawn(async move {
            tokio::time::sleep(WORD_DURATION * words).await;
            let finished = {
                let mut current = current.lock();
                if *current == Some(utterance) {
                    *current = None;
                    true
                } else {
                    false
                }
            };
            // Stopped or replaced utterances never report completion
            if finished {
                sink.emit(SessionEvent::SpeakDone(utterance)).await;
            }
        });
        Ok(())
    }

    fn stop(&self) {
        self.current.lock().take();
    }

    fn shutdown(&self) {
        self.stop();
        self.ready.store(false, Ordering::SeqCst);
        debug!("console announcer shut down");
    }

    fn is_active(&self) -> bool {
        self.current.lock().is_some()
    }
}

//! Session controller
//!
//! Owns the session state and is the only place that starts or stops the
//! detector and transcriber or asks the announcer to speak. Components and
//! spawned work report back through the inbox, and events are handled one
//! at a time, so every read and write of the state happens here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionDispatcher, DispatchOutcome};
use crate::assets::{AssetProvider, ModelKind};
use crate::events::{
    Component, ComponentFailure, EventSink, SessionEvent, StateEvent, UtteranceId, UtterancePurpose,
};
use crate::intent::{select_classifier, IntentClassifier, PendingIntent, StructuredIntent};
use crate::locale::Locale;
use crate::voice::{CommandTranscriber, HotwordDetector, VoiceAnnouncer, VoiceError};

/// Session states; exactly one is current at any time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not started, or terminated
    #[default]
    Stopped,
    /// Components are loading
    Initializing,
    /// Listening for the wake phrase
    Idle,
    /// Wake phrase heard, acknowledging
    Awoken,
    /// Capturing a command
    AwaitingCommand,
    /// Capturing the answer to a follow-up question
    AwaitingNote,
    /// Asking the follow-up question
    AwaitingAnswer,
    /// Classifying and executing a command
    Processing,
    /// Speaking a response
    Speaking,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Stopped => "Stopped",
            SessionState::Initializing => "Initializing",
            SessionState::Idle => "Idle",
            SessionState::Awoken => "Awoken",
            SessionState::AwaitingCommand => "AwaitingCommand",
            SessionState::AwaitingNote => "AwaitingNote",
            SessionState::AwaitingAnswer => "AwaitingAnswer",
            SessionState::Processing => "Processing",
            SessionState::Speaking => "Speaking",
        };
        f.write_str(name)
    }
}

/// Voice subsystem a state keeps running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Detector,
    Transcriber,
    Announcer,
}

impl SessionState {
    pub fn owner(&self) -> Option<Owner> {
        match self {
            SessionState::Idle => Some(Owner::Detector),
            SessionState::AwaitingCommand | SessionState::AwaitingNote => Some(Owner::Transcriber),
            SessionState::Awoken | SessionState::AwaitingAnswer | SessionState::Speaking => {
                Some(Owner::Announcer)
            }
            SessionState::Stopped | SessionState::Initializing | SessionState::Processing => None,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.owner() == Some(Owner::Transcriber)
    }
}

/// Components that must report ready before the session leaves Initializing
const REQUIRED_COMPONENTS: [Component; 4] = [
    Component::Announcer,
    Component::Detector,
    Component::Transcriber,
    Component::Classifier,
];

/// Everything the controller drives
pub struct Subsystems {
    pub assets: Arc<dyn AssetProvider>,
    pub detector: Arc<dyn HotwordDetector>,
    pub transcriber: Arc<dyn CommandTranscriber>,
    pub announcer: Arc<dyn VoiceAnnouncer>,
    /// Tried first at startup; the pattern matcher replaces it on failure
    pub classifier: Arc<dyn IntentClassifier>,
    pub dispatcher: Arc<ActionDispatcher>,
}

/// The single authority over [`SessionState`]
pub struct SessionController {
    state: SessionState,
    state_entered_at: Instant,
    locale: Locale,
    listen_timeout: Duration,
    subsystems: Subsystems,
    /// Classifier chosen for this session
    classifier: Option<Arc<dyn IntentClassifier>>,
    ready: HashSet<Component>,
    pending: Option<PendingIntent>,
    /// Only this completion may advance the state
    expected_utterance: Option<UtteranceId>,
    utterance_seq: u64,
    /// Bumped every time the transcriber starts, so old timeouts are ignored
    listen_generation: u64,
    listen_timer: Option<JoinHandle<()>>,
    /// In-flight classification or dispatch
    work: Option<JoinHandle<()>>,
    init_tasks: Vec<JoinHandle<()>>,
    inbox: EventSink,
    event_tx: broadcast::Sender<StateEvent>,
    terminated: bool,
}

impl SessionController {
    pub fn new(
        subsystems: Subsystems,
        locale: Locale,
        listen_timeout: Duration,
        inbox: EventSink,
        event_tx: broadcast::Sender<StateEvent>,
    ) -> Self {
        Self {
            state: SessionState::Stopped,
            state_entered_at: Instant::now(),
            locale,
            listen_timeout,
            subsystems,
            classifier: None,
            ready: HashSet::new(),
            pending: None,
            expected_utterance: None,
            utterance_seq: 0,
            listen_generation: 0,
            listen_timer: None,
            work: None,
            init_tasks: Vec::new(),
            inbox,
            event_tx,
            terminated: false,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn pending(&self) -> Option<&PendingIntent> {
        self.pending.as_ref()
    }

    pub fn classifier_name(&self) -> Option<&'static str> {
        self.classifier.as_ref().map(|c| c.name())
    }

    /// True once the session reached its terminal `Stopped` state
    #[cfg(test)]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Process inbox events until the session stops
    pub async fn run(mut self, mut inbox_rx: mpsc::Receiver<SessionEvent>) {
        info!(locale = %self.locale, "session controller started");

        while let Some(event) = inbox_rx.recv().await {
            self.handle(event);
            if self.terminated {
                break;
            }
        }

        if !self.terminated {
            self.shutdown();
        }
        info!("session controller stopped");
    }

    /// Handle one event
    pub fn handle(&mut self, event: SessionEvent) {
        if self.terminated {
            debug!(?event, "session stopped, event ignored");
            return;
        }

        match event {
            SessionEvent::Start => self.on_start(),
            SessionEvent::Stop => {
                info!(state = %self.state, "session stop requested");
                self.shutdown();
            }
            SessionEvent::ComponentReady(component) => self.on_component_ready(component),
            SessionEvent::ClassifierSelected(classifier) => self.on_classifier_selected(classifier),
            SessionEvent::HotwordDetected => self.on_hotword(),
            SessionEvent::UtteranceTranscribed(text) => self.on_utterance(&text),
            SessionEvent::ListenTimeout { generation } => self.on_listen_timeout(generation),
            SessionEvent::SpeakDone(utterance) => self.on_speak_done(utterance),
            SessionEvent::Classified(intent) => self.on_classified(intent),
            SessionEvent::Dispatched(outcome) => self.on_dispatched(outcome),
            SessionEvent::Failed(failure) => self.on_failure(failure),
        }
    }

    fn on_start(&mut self) {
        if self.state != SessionState::Stopped {
            debug!(state = %self.state, "session already started");
            return;
        }

        self.transition_to(SessionState::Initializing);

        if !self.subsystems.assets.check_prerequisites() {
            self.on_failure(ComponentFailure::fatal(
                Component::Assets,
                "required models are missing",
            ));
            return;
        }

        self.spawn_initialization();
    }

    fn spawn_initialization(&mut self) {
        let locale = self.locale;
        let assets = &self.subsystems.assets;
        let detector_model = self
            .subsystems
            .detector
            .required_model()
            .map(|kind| assets.model_path(kind));
        let transcriber_model = self
            .subsystems
            .transcriber
            .required_model()
            .map(|kind| assets.model_path(kind));
        let classifier_model = assets.model_path(ModelKind::Classify);

        let announcer = Arc::clone(&self.subsystems.announcer);
        let sink = self.inbox.clone();
        self.init_tasks.push(tokio::spawn(async move {
            let result = announcer.initialize(locale).await;
            report_ready(&sink, Component::Announcer, result).await;
        }));

        let detector = Arc::clone(&self.subsystems.detector);
        let sink = self.inbox.clone();
        self.init_tasks.push(tokio::spawn(async move {
            let result = detector.initialize(detector_model.as_deref()).await;
            report_ready(&sink, Component::Detector, result).await;
        }));

        let transcriber = Arc::clone(&self.subsystems.transcriber);
        let sink = self.inbox.clone();
        self.init_tasks.push(tokio::spawn(async move {
            let result = transcriber.initialize(transcriber_model.as_deref()).await;
            report_ready(&sink, Component::Transcriber, result).await;
        }));

        let preferred = Arc::clone(&self.subsystems.classifier);
        let sink = self.inbox.clone();
        self.init_tasks.push(tokio::spawn(async move {
            let chosen = select_classifier(preferred, Some(&classifier_model)).await;
            sink.emit(SessionEvent::ClassifierSelected(chosen)).await;
        }));
    }

    fn on_classifier_selected(&mut self, classifier: Arc<dyn IntentClassifier>) {
        if self.state != SessionState::Initializing {
            debug!(state = %self.state, "classifier selection ignored");
            return;
        }

        let name = classifier.name();
        self.classifier = Some(classifier);
        let _ = self.event_tx.send(StateEvent::ClassifierSelected {
            name: name.to_string(),
        });
        self.on_component_ready(Component::Classifier);
    }

    fn on_component_ready(&mut self, component: Component) {
        if self.state != SessionState::Initializing {
            debug!(%component, state = %self.state, "late ready report ignored");
            return;
        }

        self.ready.insert(component);
        debug!(%component, "component ready");

        if REQUIRED_COMPONENTS.iter().all(|c| self.ready.contains(c)) {
            self.init_tasks.clear();
            info!(
                classifier = self.classifier_name().unwrap_or("none"),
                "all components ready"
            );
            self.transition_to(SessionState::Idle);
            self.start_detector();
        }
    }

    fn on_hotword(&mut self) {
        if self.state != SessionState::Idle {
            debug!(state = %self.state, "hotword ignored");
            return;
        }

        info!("wake phrase detected");
        let prompt = self.locale.phrases().wake_prompt;
        self.speak(SessionState::Awoken, prompt, UtterancePurpose::Prompt);
    }

    fn on_speak_done(&mut self, utterance: UtteranceId) {
        if self.expected_utterance != Some(utterance) {
            debug!(
                %utterance,
                expected = ?self.expected_utterance,
                state = %self.state,
                "stale speak completion ignored"
            );
            return;
        }
        self.expected_utterance = None;

        match (self.state, utterance.purpose) {
            (SessionState::Awoken, UtterancePurpose::Prompt) => {
                self.transition_to(SessionState::AwaitingCommand);
                self.start_transcriber();
            }
            (SessionState::AwaitingAnswer, UtterancePurpose::MultiTurn) => {
                self.transition_to(SessionState::AwaitingNote);
                self.start_transcriber();
            }
            (SessionState::Speaking, UtterancePurpose::Response) => self.return_to_idle(),
            (state, purpose) => {
                debug!(%state, ?purpose, "speak completion does not apply to state");
            }
        }
    }

    fn on_utterance(&mut self, text: &str) {
        let text = text.trim();

        match self.state {
            SessionState::AwaitingCommand | SessionState::AwaitingNote if text.is_empty() => {
                self.on_failure(ComponentFailure::recoverable(
                    Component::Transcriber,
                    self.locale.phrases().not_heard,
                ));
            }
            SessionState::AwaitingCommand => self.classify(text),
            SessionState::AwaitingNote => self.complete_pending(text),
            state => debug!(%state, "utterance ignored"),
        }
    }

    fn classify(&mut self, text: &str) {
        let Some(classifier) = self.classifier.clone() else {
            warn!("no classifier selected");
            self.on_failure(ComponentFailure::recoverable(
                Component::Classifier,
                self.locale.phrases().not_understood,
            ));
            return;
        };

        self.transition_to(SessionState::Processing);
        info!(text, classifier = classifier.name(), "classifying utterance");

        let text = text.to_string();
        let locale = self.locale;
        let sink = self.inbox.clone();
        self.work = Some(tokio::spawn(async move {
            let intent = classifier.classify(&text, locale).await;
            sink.emit(SessionEvent::Classified(intent)).await;
        }));
    }

    fn on_classified(&mut self, intent: StructuredIntent) {
        if self.state != SessionState::Processing {
            debug!(state = %self.state, "classification result ignored");
            return;
        }

        info!(intent = %intent.kind, entities = ?intent.entities, "utterance classified");

        let dispatcher = Arc::clone(&self.subsystems.dispatcher);
        let locale = self.locale;
        let sink = self.inbox.clone();
        self.work = Some(tokio::spawn(async move {
            let outcome = dispatcher.dispatch(intent, locale).await;
            sink.emit(SessionEvent::Dispatched(outcome)).await;
        }));
    }

    fn on_dispatched(&mut self, outcome: DispatchOutcome) {
        if self.state != SessionState::Processing {
            debug!(state = %self.state, "dispatch result ignored");
            return;
        }
        self.work = None;

        match outcome {
            DispatchOutcome::Respond(text) => {
                self.speak(SessionState::Speaking, &text, UtterancePurpose::Response);
            }
            DispatchOutcome::NeedsMoreInfo { prompt, pending } => {
                debug!(intent = %pending.kind, "waiting for more information");
                self.pending = Some(pending);
                self.speak(SessionState::AwaitingAnswer, &prompt, UtterancePurpose::MultiTurn);
            }
        }
    }

    fn complete_pending(&mut self, text: &str) {
        let phrases = self.locale.phrases();
        let reply = match self.pending.take() {
            Some(pending) => self
                .subsystems
                .dispatcher
                .complete_pending(pending, text, self.locale),
            None => {
                warn!("answer received without a pending intent");
                phrases.error(phrases.lost_pending)
            }
        };
        self.speak(SessionState::Speaking, &reply, UtterancePurpose::Response);
    }

    fn on_listen_timeout(&mut self, generation: u64) {
        if generation != self.listen_generation || !self.state.is_listening() {
            debug!(generation, current = self.listen_generation, "stale listen timeout ignored");
            return;
        }

        info!(state = %self.state, "nothing heard before the listen timeout");
        self.on_failure(ComponentFailure::recoverable(
            Component::Transcriber,
            self.locale.phrases().listen_timeout,
        ));
    }

    fn on_failure(&mut self, failure: ComponentFailure) {
        if failure.fatal {
            error!(%failure, state = %self.state, "fatal component failure");
            self.shutdown();
            return;
        }

        let relevant = match failure.source {
            Component::Detector => self.state == SessionState::Idle,
            Component::Transcriber => self.state.is_listening(),
            Component::Announcer => self.state.owner() == Some(Owner::Announcer),
            _ => !matches!(self.state, SessionState::Stopped | SessionState::Initializing),
        };
        if !relevant {
            debug!(%failure, state = %self.state, "failure from inactive component ignored");
            return;
        }

        warn!(%failure, state = %self.state, "recoverable component failure");
        if self.pending.take().is_some() {
            debug!("pending intent discarded");
        }

        if failure.source == Component::Announcer {
            self.return_to_idle();
            return;
        }

        let message = self.locale.phrases().error(&failure.message);
        self.speak(SessionState::Speaking, &message, UtterancePurpose::Response);
    }

    fn start_detector(&mut self) {
        if self.subsystems.transcriber.is_active() {
            warn!("transcriber still running when detector starts, stopping it");
            self.subsystems.transcriber.stop();
        }
        if let Err(e) = self.subsystems.detector.start(self.inbox.clone()) {
            self.on_failure(ComponentFailure::fatal(Component::Detector, e.to_string()));
        }
    }

    fn start_transcriber(&mut self) {
        if let Err(e) = self.subsystems.transcriber.start(self.locale, self.inbox.clone()) {
            warn!(error = %e, "failed to start transcriber");
            self.on_failure(ComponentFailure::recoverable(
                Component::Transcriber,
                self.locale.phrases().not_heard,
            ));
            return;
        }

        self.listen_generation += 1;
        let generation = self.listen_generation;
        let timeout = self.listen_timeout;
        let sink = self.inbox.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            sink.emit(SessionEvent::ListenTimeout { generation }).await;
        });
        if let Some(old) = self.listen_timer.replace(timer) {
            old.abort();
        }
    }

    /// Enter `next` and ask the announcer to speak `text`
    fn speak(&mut self, next: SessionState, text: &str, purpose: UtterancePurpose) {
        self.transition_to(next);

        self.utterance_seq += 1;
        let utterance = UtteranceId {
            purpose,
            seq: self.utterance_seq,
        };
        self.expected_utterance = Some(utterance);
        debug!(%utterance, text, "speaking");

        let announcer = &self.subsystems.announcer;
        if announcer.is_active() {
            announcer.stop();
        }
        if let Err(e) = announcer.speak(text, utterance, self.inbox.clone()) {
            self.on_failure(ComponentFailure::recoverable(Component::Announcer, e.to_string()));
        }
    }

    fn return_to_idle(&mut self) {
        self.expected_utterance = None;
        self.transition_to(SessionState::Idle);
        if !self.subsystems.detector.is_active() {
            self.start_detector();
        }
    }

    /// Stop whatever `state` kept running
    fn release(&mut self, state: SessionState) {
        match state.owner() {
            Some(Owner::Detector) => self.subsystems.detector.stop(),
            Some(Owner::Transcriber) => {
                self.subsystems.transcriber.stop();
                if let Some(timer) = self.listen_timer.take() {
                    timer.abort();
                }
            }
            Some(Owner::Announcer) => {
                self.subsystems.announcer.stop();
                self.expected_utterance = None;
            }
            None => {}
        }

        if state == SessionState::Processing {
            if let Some(work) = self.work.take() {
                work.abort();
            }
        }
    }

    /// Move to `next`, releasing the old state's subsystem first
    ///
    /// Returns false for a same-state transition, which does nothing.
    fn transition_to(&mut self, next: SessionState) -> bool {
        let previous = self.state;
        if next == previous {
            debug!(state = %next, "already in state, transition skipped");
            return false;
        }

        self.release(previous);

        let duration_ms = self.state_entered_at.elapsed().as_millis() as u64;
        info!(
            from = %previous,
            to = %next,
            duration_ms = duration_ms,
            "state transition"
        );

        self.state = next;
        self.state_entered_at = Instant::now();
        let _ = self.event_tx.send(StateEvent::StateChanged {
            from: previous,
            to: next,
            duration_ms,
        });
        true
    }

    /// Cancel everything and enter the terminal `Stopped` state
    fn shutdown(&mut self) {
        for task in self.init_tasks.drain(..) {
            task.abort();
        }
        if let Some(work) = self.work.take() {
            work.abort();
        }
        if let Some(timer) = self.listen_timer.take() {
            timer.abort();
        }

        self.subsystems.detector.stop();
        self.subsystems.transcriber.stop();
        self.subsystems.announcer.stop();
        self.subsystems.announcer.shutdown();

        self.pending = None;
        self.expected_utterance = None;
        self.transition_to(SessionState::Stopped);
        self.terminated = true;
    }
}

async fn report_ready(sink: &EventSink, component: Component, result: Result<(), VoiceError>) {
    let event = match result {
        Ok(()) => SessionEvent::ComponentReady(component),
        Err(e) => SessionEvent::Failed(ComponentFailure::fatal(component, e.to_string())),
    };
    sink.emit(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::api::testing::FakeHiveApi;
    use crate::intent::{ClassifierError, LanguageModel, ModelClassifier, PatternClassifier};
    use crate::store::NoteStore;
    use crate::sync::SyncHandle;
    use crate::voice::{MicOwner, Microphone};

    struct FakeAssets {
        ready: bool,
        classify_path: PathBuf,
    }

    impl AssetProvider for FakeAssets {
        fn check_prerequisites(&self) -> bool {
            self.ready
        }

        fn model_path(&self, kind: ModelKind) -> PathBuf {
            match kind {
                ModelKind::Classify => self.classify_path.clone(),
                other => PathBuf::from("/models").join(other.to_string()),
            }
        }
    }

    struct FakeDetector {
        mic: Arc<Microphone>,
        active: AtomicBool,
        starts: AtomicUsize,
    }

    #[async_trait]
    impl HotwordDetector for FakeDetector {
        async fn initialize(&self, _model_path: Option<&Path>) -> Result<(), VoiceError> {
            Ok(())
        }

        fn start(&self, _sink: EventSink) -> Result<(), VoiceError> {
            self.mic.acquire(MicOwner::Detector)?;
            self.active.store(true, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.active.store(false, Ordering::SeqCst);
            self.mic.release(MicOwner::Detector);
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    struct FakeTranscriber {
        mic: Arc<Microphone>,
        active: AtomicBool,
        starts: AtomicUsize,
        locales: Mutex<Vec<Locale>>,
    }

    #[async_trait]
    impl CommandTranscriber for FakeTranscriber {
        async fn initialize(&self, _model_path: Option<&Path>) -> Result<(), VoiceError> {
            Ok(())
        }

        fn start(&self, locale: Locale, _sink: EventSink) -> Result<(), VoiceError> {
            self.mic.acquire(MicOwner::Transcriber)?;
            self.active.store(true, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.locales.lock().push(locale);
            Ok(())
        }

        fn stop(&self) {
            self.active.store(false, Ordering::SeqCst);
            self.mic.release(MicOwner::Transcriber);
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct FakeAnnouncer {
        spoken: Mutex<Vec<(String, UtteranceId)>>,
        active: AtomicBool,
        broken: bool,
        shut_down: AtomicBool,
    }

    #[async_trait]
    impl VoiceAnnouncer for FakeAnnouncer {
        async fn initialize(&self, _locale: Locale) -> Result<(), VoiceError> {
            if self.broken {
                return Err(VoiceError::Engine("no speech engine".into()));
            }
            Ok(())
        }

        fn speak(&self, text: &str, utterance: UtteranceId, _sink: EventSink) -> Result<(), VoiceError> {
            self.spoken.lock().push((text.to_string(), utterance));
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.active.store(false, Ordering::SeqCst);
        }

        fn shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug)]
    struct CannedModel(String);

    #[async_trait]
    impl LanguageModel for CannedModel {
        async fn load(&self, _model_path: &Path) -> Result<(), ClassifierError> {
            Ok(())
        }

        async fn generate(&self, _prompt: &str) -> Result<String, ClassifierError> {
            Ok(self.0.clone())
        }
    }

    /// Classifier that never answers
    #[derive(Debug)]
    struct Stalled;

    #[async_trait]
    impl IntentClassifier for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn initialize(&self, _model_path: &Path) -> bool {
            true
        }

        async fn classify(&self, _text: &str, _locale: Locale) -> StructuredIntent {
            std::future::pending().await
        }
    }

    struct Setup {
        assets_ready: bool,
        announcer_broken: bool,
        classifier: Arc<dyn IntentClassifier>,
        classify_path: PathBuf,
        listen_timeout: Duration,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                assets_ready: true,
                announcer_broken: false,
                classifier: Arc::new(PatternClassifier::new()),
                classify_path: PathBuf::from("/nonexistent/llm/model.bin"),
                listen_timeout: Duration::from_secs(60),
            }
        }
    }

    struct Harness {
        controller: SessionController,
        rx: mpsc::Receiver<SessionEvent>,
        state_rx: broadcast::Receiver<StateEvent>,
        detector: Arc<FakeDetector>,
        transcriber: Arc<FakeTranscriber>,
        announcer: Arc<FakeAnnouncer>,
        store: Arc<NoteStore>,
    }

    impl Harness {
        fn new(setup: Setup) -> Self {
            let mic = Arc::new(Microphone::new());
            let detector = Arc::new(FakeDetector {
                mic: mic.clone(),
                active: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
            });
            let transcriber = Arc::new(FakeTranscriber {
                mic,
                active: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
                locales: Mutex::new(Vec::new()),
            });
            let announcer = Arc::new(FakeAnnouncer {
                broken: setup.announcer_broken,
                ..Default::default()
            });

            let api = Arc::new(FakeHiveApi::new());
            let store = Arc::new(NoteStore::in_memory(api.clone()).unwrap());
            let dispatcher = Arc::new(ActionDispatcher::new(store.clone(), api, SyncHandle::new()));

            let (tx, rx) = mpsc::channel(64);
            let (event_tx, state_rx) = broadcast::channel(64);
            let controller = SessionController::new(
                Subsystems {
                    assets: Arc::new(FakeAssets {
                        ready: setup.assets_ready,
                        classify_path: setup.classify_path,
                    }),
                    detector: detector.clone(),
                    transcriber: transcriber.clone(),
                    announcer: announcer.clone(),
                    classifier: setup.classifier,
                    dispatcher,
                },
                Locale::English,
                setup.listen_timeout,
                EventSink::new(tx),
                event_tx,
            );

            Self {
                controller,
                rx,
                state_rx,
                detector,
                transcriber,
                announcer,
                store,
            }
        }

        /// Start the session and wait until it is listening for the wake phrase
        async fn started(setup: Setup) -> Self {
            let mut h = Self::new(setup);
            h.controller.handle(SessionEvent::Start);
            for _ in 0..REQUIRED_COMPONENTS.len() {
                h.pump().await;
            }
            assert_eq!(h.controller.state(), SessionState::Idle);
            h
        }

        /// Deliver the next inbox event to the controller
        async fn pump(&mut self) {
            let event = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("inbox closed");
            self.controller.handle(event);
        }

        async fn settle(&mut self) {
            while self.controller.state() == SessionState::Processing {
                self.pump().await;
            }
        }

        fn last_spoken(&self) -> (String, UtteranceId) {
            self.announcer.spoken.lock().last().cloned().expect("nothing spoken")
        }

        fn finish_speaking(&mut self) {
            let (_, utterance) = self.last_spoken();
            self.controller.handle(SessionEvent::SpeakDone(utterance));
        }

        fn say(&mut self, text: &str) {
            self.controller
                .handle(SessionEvent::UtteranceTranscribed(text.to_string()));
        }

        /// Wake the assistant and let the prompt finish
        fn wake(&mut self) {
            self.controller.handle(SessionEvent::HotwordDetected);
            assert_eq!(self.controller.state(), SessionState::Awoken);
            self.finish_speaking();
            assert_eq!(self.controller.state(), SessionState::AwaitingCommand);
        }

        fn assert_exclusive(&self) {
            let detecting = self.detector.is_active();
            let transcribing = self.transcriber.is_active();
            let state = self.controller.state();
            assert!(!(detecting && transcribing), "both listeners active in {state}");
            match state.owner() {
                Some(Owner::Detector) => assert!(detecting, "detector idle in {state}"),
                Some(Owner::Transcriber) => assert!(transcribing, "transcriber idle in {state}"),
                _ => assert!(!detecting && !transcribing, "listener active in {state}"),
            }
        }
    }

    #[tokio::test]
    async fn test_start_reaches_idle() {
        let h = Harness::started(Setup::default()).await;
        assert!(h.detector.is_active());
        assert!(!h.transcriber.is_active());
        assert_eq!(h.controller.classifier_name(), Some("pattern"));
    }

    #[tokio::test]
    async fn test_missing_models_are_fatal() {
        let mut h = Harness::new(Setup {
            assets_ready: false,
            ..Default::default()
        });
        h.controller.handle(SessionEvent::Start);

        assert_eq!(h.controller.state(), SessionState::Stopped);
        assert!(h.controller.is_terminated());
        assert!(h.announcer.shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_announcer_init_failure_is_fatal() {
        let mut h = Harness::new(Setup {
            announcer_broken: true,
            ..Default::default()
        });
        h.controller.handle(SessionEvent::Start);
        while !h.controller.is_terminated() {
            h.pump().await;
        }

        assert_eq!(h.controller.state(), SessionState::Stopped);
        assert_eq!(h.detector.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_model_falls_back_to_patterns() {
        let h = Harness::started(Setup {
            classifier: Arc::new(ModelClassifier::new(
                CannedModel("{}".into()),
                Duration::from_secs(1),
            )),
            ..Default::default()
        })
        .await;
        assert_eq!(h.controller.classifier_name(), Some("pattern"));
    }

    #[tokio::test]
    async fn test_read_command_round_trip() {
        let mut h = Harness::started(Setup::default()).await;
        h.wake();
        assert_eq!(h.last_spoken().0, "Yes?");
        assert_eq!(h.transcriber.locales.lock().as_slice(), &[Locale::English]);

        h.say("last note for beehive 5");
        assert_eq!(h.controller.state(), SessionState::Processing);
        h.assert_exclusive();
        h.settle().await;

        assert_eq!(h.controller.state(), SessionState::Speaking);
        let (text, utterance) = h.last_spoken();
        assert_eq!(text, "No notes found for beehive 5.");
        assert_eq!(utterance.purpose, UtterancePurpose::Response);

        h.finish_speaking();
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(h.detector.is_active());
        assert_eq!(h.detector.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_follow_up_question_saves_note() {
        let mut h = Harness::started(Setup::default()).await;
        h.wake();
        h.say("note for beehive 7");
        h.settle().await;

        assert_eq!(h.controller.state(), SessionState::AwaitingAnswer);
        assert!(h.controller.pending().is_some());
        let (prompt, utterance) = h.last_spoken();
        assert_eq!(prompt, "Okay, I'm ready to record your note for beehive 7.");
        assert_eq!(utterance.purpose, UtterancePurpose::MultiTurn);

        h.finish_speaking();
        assert_eq!(h.controller.state(), SessionState::AwaitingNote);
        assert!(h.transcriber.is_active());

        h.say("the queen is healthy");
        assert_eq!(h.controller.state(), SessionState::Speaking);
        assert!(h.controller.pending().is_none());
        assert_eq!(h.last_spoken().0, "Note saved for beehive 7.");

        let notes = h.store.get_unsynced_logs().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].hive_id, 7);
        assert_eq!(notes[0].content, "the queen is healthy");
        assert!(!notes[0].synced);

        h.finish_speaking();
        assert_eq!(h.controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_model_classifier_end_to_end() {
        let model_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(model_file.path(), b"weights").unwrap();
        let output = r#"Here you go: {"intent":"create_log","entities":{"hive_id":"10","content":"queen is healthy"},"responseText":"Note saved for beehive 10."}"#;

        let mut h = Harness::started(Setup {
            classifier: Arc::new(ModelClassifier::new(
                CannedModel(output.into()),
                Duration::from_secs(5),
            )),
            classify_path: model_file.path().to_path_buf(),
            ..Default::default()
        })
        .await;
        assert_eq!(h.controller.classifier_name(), Some("model"));

        h.wake();
        while h.state_rx.try_recv().is_ok() {}

        h.say("note for beehive 10 queen is healthy");
        h.settle().await;
        assert_eq!(h.last_spoken().0, "Note saved for beehive 10.");
        h.finish_speaking();

        let mut path = Vec::new();
        while let Ok(event) = h.state_rx.try_recv() {
            if let StateEvent::StateChanged { from, to, .. } = event {
                if path.is_empty() {
                    path.push(from);
                }
                path.push(to);
            }
        }
        assert_eq!(
            path,
            vec![
                SessionState::AwaitingCommand,
                SessionState::Processing,
                SessionState::Speaking,
                SessionState::Idle,
            ]
        );

        let notes = h.store.get_unsynced_logs().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].hive_id, 10);
        assert_eq!(notes[0].content, "queen is healthy");
    }

    #[tokio::test]
    async fn test_unmatched_command_is_not_understood() {
        let mut h = Harness::started(Setup::default()).await;
        h.wake();
        h.say("sing me a song");
        h.settle().await;
        assert_eq!(
            h.last_spoken().0,
            Locale::English.phrases().not_understood
        );
    }

    #[tokio::test]
    async fn test_stale_speak_done_is_ignored() {
        let mut h = Harness::started(Setup::default()).await;
        h.wake();
        h.say("help");
        h.settle().await;
        let (_, old_response) = h.last_spoken();
        h.finish_speaking();
        assert_eq!(h.controller.state(), SessionState::Idle);

        h.controller.handle(SessionEvent::HotwordDetected);
        let (_, prompt) = h.last_spoken();

        // Completion of an earlier utterance
        h.controller.handle(SessionEvent::SpeakDone(old_response));
        assert_eq!(h.controller.state(), SessionState::Awoken);

        // Right sequence, wrong purpose
        h.controller.handle(SessionEvent::SpeakDone(UtteranceId {
            purpose: UtterancePurpose::Response,
            seq: prompt.seq,
        }));
        assert_eq!(h.controller.state(), SessionState::Awoken);

        h.controller.handle(SessionEvent::SpeakDone(prompt));
        assert_eq!(h.controller.state(), SessionState::AwaitingCommand);

        // Duplicate completion
        h.controller.handle(SessionEvent::SpeakDone(prompt));
        assert_eq!(h.controller.state(), SessionState::AwaitingCommand);
        assert_eq!(h.transcriber.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_listen_timeout_returns_to_idle() {
        let mut h = Harness::started(Setup {
            listen_timeout: Duration::from_millis(20),
            ..Default::default()
        })
        .await;
        h.wake();
        h.pump().await;

        assert_eq!(h.controller.state(), SessionState::Speaking);
        assert_eq!(h.last_spoken().0, "Sorry. I didn't hear anything.");
        assert!(!h.transcriber.is_active());

        h.finish_speaking();
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(h.detector.is_active());
    }

    #[tokio::test]
    async fn test_stale_listen_timeout_is_ignored() {
        let mut h = Harness::started(Setup::default()).await;
        h.wake();
        let current = h.controller.listen_generation;

        h.controller.handle(SessionEvent::ListenTimeout {
            generation: current - 1,
        });
        assert_eq!(h.controller.state(), SessionState::AwaitingCommand);

        h.say("help");
        h.controller.handle(SessionEvent::ListenTimeout {
            generation: current,
        });
        assert_eq!(h.controller.state(), SessionState::Processing);
    }

    #[tokio::test]
    async fn test_failure_while_answering_clears_pending() {
        let mut h = Harness::started(Setup::default()).await;
        h.wake();
        h.say("note for beehive 3");
        h.settle().await;
        h.finish_speaking();
        assert_eq!(h.controller.state(), SessionState::AwaitingNote);

        h.say("   ");
        assert_eq!(h.controller.state(), SessionState::Speaking);
        assert!(h.controller.pending().is_none());
        assert_eq!(h.last_spoken().0, "Sorry. I didn't catch that.");
        assert_eq!(h.store.count_unsynced().unwrap(), 0);

        h.finish_speaking();
        assert_eq!(h.controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_transcriber_failure_outside_listening_is_ignored() {
        let mut h = Harness::started(Setup::default()).await;
        h.controller.handle(SessionEvent::Failed(ComponentFailure::recoverable(
            Component::Transcriber,
            "late error",
        )));
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(h.announcer.spoken.lock().is_empty());
    }

    #[tokio::test]
    async fn test_announcer_failure_skips_apology() {
        let mut h = Harness::started(Setup::default()).await;
        h.controller.handle(SessionEvent::HotwordDetected);
        let spoken = h.announcer.spoken.lock().len();

        h.controller.handle(SessionEvent::Failed(ComponentFailure::recoverable(
            Component::Announcer,
            "audio output lost",
        )));
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(h.detector.is_active());
        assert_eq!(h.announcer.spoken.lock().len(), spoken);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_terminal() {
        let mut h = Harness::started(Setup::default()).await;
        h.wake();

        h.controller.handle(SessionEvent::Failed(ComponentFailure::fatal(
            Component::Host,
            "microphone permission denied",
        )));
        assert_eq!(h.controller.state(), SessionState::Stopped);
        assert!(!h.transcriber.is_active());
        assert!(h.announcer.shut_down.load(Ordering::SeqCst));

        let starts = h.detector.starts.load(Ordering::SeqCst);
        h.controller.handle(SessionEvent::Start);
        h.controller.handle(SessionEvent::HotwordDetected);
        assert_eq!(h.controller.state(), SessionState::Stopped);
        assert_eq!(h.detector.starts.load(Ordering::SeqCst), starts);
    }

    #[tokio::test]
    async fn test_stop_cancels_classification() {
        let mut h = Harness::started(Setup {
            classifier: Arc::new(Stalled),
            ..Default::default()
        })
        .await;
        h.wake();
        h.say("last note for beehive 1");
        assert_eq!(h.controller.state(), SessionState::Processing);

        h.controller.handle(SessionEvent::Stop);
        assert_eq!(h.controller.state(), SessionState::Stopped);
        assert!(h.controller.work.is_none());
        assert!(!h.detector.is_active());
        assert!(!h.transcriber.is_active());

        let next = tokio::time::timeout(Duration::from_millis(50), h.rx.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_same_state_transition_is_noop() {
        let mut h = Harness::started(Setup::default()).await;
        assert!(!h.controller.transition_to(SessionState::Idle));
        assert!(h.detector.is_active());

        h.wake();
        h.controller.handle(SessionEvent::HotwordDetected);
        assert_eq!(h.controller.state(), SessionState::AwaitingCommand);
        assert!(h.transcriber.is_active());
    }

    #[tokio::test]
    async fn test_listeners_never_overlap() {
        for seed in 1..=16u64 {
            let mut h = Harness::started(Setup::default()).await;
            let mut rng = seed;

            for _ in 0..60 {
                rng = rng
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let event = match (rng >> 33) % 9 {
                    0 => SessionEvent::HotwordDetected,
                    1 => match h.announcer.spoken.lock().last() {
                        Some((_, utterance)) => SessionEvent::SpeakDone(*utterance),
                        None => SessionEvent::HotwordDetected,
                    },
                    2 => SessionEvent::SpeakDone(UtteranceId {
                        purpose: UtterancePurpose::Response,
                        seq: 10_000,
                    }),
                    3 => SessionEvent::UtteranceTranscribed("note for beehive 3".into()),
                    4 => SessionEvent::UtteranceTranscribed("last task for beehive 2".into()),
                    5 => SessionEvent::UtteranceTranscribed("help".into()),
                    6 => SessionEvent::UtteranceTranscribed("the queen is healthy".into()),
                    7 => SessionEvent::Failed(ComponentFailure::recoverable(
                        Component::Transcriber,
                        "I didn't catch that.",
                    )),
                    _ => SessionEvent::ListenTimeout {
                        generation: h.controller.listen_generation,
                    },
                };

                h.controller.handle(event);
                h.settle().await;
                h.assert_exclusive();
                assert_ne!(h.controller.state(), SessionState::Stopped);
            }
        }
    }
}

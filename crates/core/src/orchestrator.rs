use crate::Command;
use crate::chunk_loop::{ChunkLoop, ChunkOutcome, LoopRequest};
use crate::completion::{CompletionSlot, WaitToken};
use crate::content::{Chunk, ContentService, LectureDetail};
use crate::context::RecentContext;
use crate::error::ContentError;
use crate::intent::ResumePhrase;
use crate::persistence::{ProgressStore, progress_key};
use crate::protocol::{OutboundCommand, ProtocolAdapter, ProtocolEvent};
use crate::question::{QuestionContext, compose_prompt};
use crate::recovery::{ErrorRecoveryPolicy, RecoveryDecision};
use crate::session_state::{PlaybackState, Session, SessionView};
use crate::settings::PlaybackSettings;
use crate::transport::{ConnectionState, RealtimeCredential, Transport, TransportEvent};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything that reaches the orchestrator from tasks it spawned itself.
#[derive(Debug)]
pub(crate) enum Event {
    Connected {
        attempt: u64,
        outcome: std::result::Result<Connection, String>,
    },
    Loop {
        loop_id: u64,
        request: LoopRequest,
    },
    WaitTimeout(WaitToken),
    QuestionReady {
        generation: u64,
        question: String,
        context: Option<String>,
    },
    /// A held question has waited long enough for the previous response.
    ReleaseQuestion { generation: u64 },
}

#[derive(Debug)]
pub(crate) struct Connection {
    detail: LectureDetail,
    instructions: String,
    voice: String,
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A question whose dispatch waits for an earlier response to start and wind down.
struct DeferredQuestion {
    question: String,
    context: Option<String>,
}

/// Cloneable front end for a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<SessionView>,
}

impl OrchestratorHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("orchestrator has shut down"))
    }

    pub async fn start(&self, resume: bool) -> Result<()> {
        self.send(Command::Start { resume }).await
    }

    pub async fn restart(&self) -> Result<()> {
        self.send(Command::Restart).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    pub async fn interrupt(&self) -> Result<()> {
        self.send(Command::Interrupt).await
    }

    pub async fn send_question(&self, text: &str) -> Result<()> {
        self.send(Command::SendQuestion(text.to_string())).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(Command::Resume).await
    }

    pub async fn set_microphone(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetMicrophone(enabled)).await
    }

    /// A receiver that sees every published `SessionView`.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }
}

/// Single owner of all playback state.
///
/// Commands from the UI, events from the transport and messages from the tasks the
/// orchestrator spawns (chunk loop, timers, connect, question dispatch) are all handled
/// one at a time on the task running [`Orchestrator::run`], so no two handlers ever
/// observe a half-updated session.
pub struct Orchestrator {
    lecture_id: String,
    settings: PlaybackSettings,
    content: Arc<dyn ContentService>,
    store: Arc<dyn ProgressStore>,
    transport: Arc<dyn Transport>,
    adapter: ProtocolAdapter,

    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
    transport_events: broadcast::Receiver<TransportEvent>,
    transport_closed: bool,
    view_tx: watch::Sender<SessionView>,

    session: Session,
    question: QuestionContext,
    context: RecentContext,
    recovery: ErrorRecoveryPolicy,
    resume_phrase: ResumePhrase,
    completion: CompletionSlot,

    lecture_title: Option<String>,
    current_chunk: Option<Chunk>,
    last_recorded: Option<usize>,
    retry_pending: bool,
    resume_deferred: bool,
    deferred_question: Option<DeferredQuestion>,
    stale_cancel_sent: bool,
    stray_response: bool,

    connect_attempt: u64,
    connect_task: Option<JoinHandle<()>>,
    loop_id: u64,
    chunk_loop: Option<LoopHandle>,
    question_generation: u64,
    question_task: Option<JoinHandle<()>>,

    partial_transcript: String,
    last_transcript: Option<String>,
    error_message: Option<String>,
    notice: Option<String>,
    mic_enabled: bool,
}

impl Orchestrator {
    pub fn new(
        lecture_id: &str,
        settings: PlaybackSettings,
        content: Arc<dyn ContentService>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ProgressStore>,
    ) -> (Self, OrchestratorHandle) {
        let (command_tx, commands) = mpsc::channel(32);
        let (events_tx, events) = mpsc::channel(64);
        let (view_tx, view) = watch::channel(SessionView::default());
        let transport_events = transport.subscribe();

        let orchestrator = Self {
            lecture_id: lecture_id.to_string(),
            context: RecentContext::new(settings.context_window_secs),
            recovery: ErrorRecoveryPolicy::new(
                settings.error_window,
                settings.fatal_error_threshold,
            ),
            resume_phrase: ResumePhrase::new(&settings.resume_phrase),
            settings,
            content,
            store,
            adapter: ProtocolAdapter::new(transport.clone()),
            transport,
            commands,
            events,
            events_tx,
            transport_events,
            transport_closed: false,
            view_tx,
            session: Session::default(),
            question: QuestionContext::default(),
            completion: CompletionSlot::new(),
            lecture_title: None,
            current_chunk: None,
            last_recorded: None,
            retry_pending: false,
            resume_deferred: false,
            deferred_question: None,
            stale_cancel_sent: false,
            stray_response: false,
            connect_attempt: 0,
            connect_task: None,
            loop_id: 0,
            chunk_loop: None,
            question_generation: 0,
            question_task: None,
            partial_transcript: String::new(),
            last_transcript: None,
            error_message: None,
            notice: None,
            mic_enabled: false,
        };
        let handle = OrchestratorHandle {
            commands: command_tx,
            view,
        };
        (orchestrator, handle)
    }

    /// Build an orchestrator and run it on its own task.
    pub fn spawn(
        lecture_id: &str,
        settings: PlaybackSettings,
        content: Arc<dyn ContentService>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ProgressStore>,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let (orchestrator, handle) = Self::new(lecture_id, settings, content, transport, store);
        (handle, tokio::spawn(orchestrator.run()))
    }

    /// Process messages until every handle has been dropped.
    pub async fn run(mut self) {
        tracing::info!(lecture_id = %self.lecture_id, "orchestrator started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event).await,
                received = self.transport_events.recv(), if !self.transport_closed => match received {
                    Ok(event) => self.handle_transport_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("orchestrator fell behind, {} transport events dropped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("transport event stream closed");
                        self.transport_closed = true;
                    }
                },
            }
            self.publish();
        }
        self.shutdown().await;
        tracing::info!(lecture_id = %self.lecture_id, "orchestrator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        tracing::debug!(state = %self.session.state, "command {:?}", command);
        match command {
            Command::Start { resume } => self.start(resume).await,
            Command::Restart => self.restart().await,
            Command::Pause => self.pause().await,
            Command::Stop => self.stop().await,
            Command::Interrupt => self.interrupt().await,
            Command::SendQuestion(text) => self.ask(&text).await,
            Command::Resume => self.resume().await,
            Command::SetMicrophone(enabled) => self.set_microphone(enabled).await,
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected { attempt, outcome } => self.on_connected(attempt, outcome).await,
            Event::Loop { loop_id, request } => self.on_loop_request(loop_id, request).await,
            Event::WaitTimeout(token) => {
                if self.completion.is_current(token) {
                    tracing::warn!(state = %self.session.state, "response wait timed out");
                    self.resolve_wait().await;
                }
            }
            Event::QuestionReady {
                generation,
                question,
                context,
            } => self.on_question_ready(generation, question, context).await,
            Event::ReleaseQuestion { generation } => self.release_question(generation).await,
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionState(ConnectionState::Connected) => {
                tracing::info!("realtime channel open");
                if let Err(e) = self.adapter.set_writable(true).await {
                    self.fail(format!("failed to flush queued events: {e:#}")).await;
                }
            }
            TransportEvent::ConnectionState(ConnectionState::Connecting) => {
                tracing::debug!("realtime channel connecting");
            }
            TransportEvent::ConnectionState(ConnectionState::Disconnected) => {
                self.on_connection_lost("realtime connection closed".to_string())
                    .await;
            }
            TransportEvent::ConnectionState(ConnectionState::Failed(reason)) => {
                self.on_connection_lost(format!("realtime connection failed: {reason}"))
                    .await;
            }
            TransportEvent::Message(text) => {
                if let Some(event) = self.adapter.handle_inbound(&text) {
                    self.on_protocol_event(event).await;
                }
            }
        }
    }

    async fn on_connection_lost(&mut self, reason: String) {
        // a close we caused ourselves lands before the new channel ever became writable
        let was_open = self.adapter.is_writable();
        let _ = self.adapter.set_writable(false).await;
        if was_open && self.session.state.needs_connection() {
            self.fail(reason).await;
        } else {
            tracing::debug!(state = %self.session.state, "{}", reason);
        }
    }

    // ---- commands -------------------------------------------------------------------

    async fn start(&mut self, resume: bool) {
        if !self.session.state.can_start() {
            tracing::debug!(state = %self.session.state, "start ignored");
            return;
        }

        self.teardown_activity();
        self.disconnect_transport().await;

        self.session.reset_transient();
        self.session.chunk_index = if resume { self.load_progress() } else { 0 };
        self.question = QuestionContext::default();
        self.context.clear();
        self.recovery.reset();
        self.current_chunk = None;
        self.last_recorded = None;
        self.partial_transcript.clear();
        self.last_transcript = None;
        self.error_message = None;
        self.notice = None;
        self.transition(PlaybackState::Connecting);

        self.connect_attempt += 1;
        let attempt = self.connect_attempt;
        let content = self.content.clone();
        let transport = self.transport.clone();
        let lecture_id = self.lecture_id.clone();
        let inbox = self.events_tx.clone();
        self.connect_task = Some(tokio::spawn(async move {
            let outcome = establish(content, transport, &lecture_id)
                .await
                .map_err(|e| format!("{e:#}"));
            if inbox.send(Event::Connected { attempt, outcome }).await.is_err() {
                tracing::debug!("orchestrator gone before connect finished");
            }
        }));
    }

    async fn on_connected(
        &mut self,
        attempt: u64,
        outcome: std::result::Result<Connection, String>,
    ) {
        if attempt != self.connect_attempt || self.session.state != PlaybackState::Connecting {
            tracing::debug!(attempt, "ignoring stale connect result");
            return;
        }
        self.connect_task = None;

        let connection = match outcome {
            Ok(connection) => connection,
            Err(message) => {
                self.fail(format!("could not start lecture: {message}")).await;
                return;
            }
        };

        tracing::info!(
            lecture_id = %self.lecture_id,
            title = %connection.detail.title,
            chunks = connection.detail.num_chunks,
            "lecture ready"
        );
        self.session.total_chunks = connection.detail.num_chunks;
        self.lecture_title = Some(connection.detail.title);

        let configure = OutboundCommand::ConfigureSession {
            instructions: connection.instructions,
            voice: connection.voice,
        };
        if let Err(e) = self.adapter.send(configure).await {
            self.fail(format!("failed to configure realtime session: {e:#}"))
                .await;
            return;
        }
        self.set_microphone(false).await;
        self.set_remote_audio_muted(false).await;

        self.transition(PlaybackState::Playing);
        self.spawn_chunk_loop();
    }

    async fn restart(&mut self) {
        self.clear_progress();
        if self.session.state != PlaybackState::Idle {
            self.stop().await;
        }
        self.start(false).await;
    }

    async fn pause(&mut self) {
        if !(self.session.state == PlaybackState::Playing || self.session.state.in_dialog()) {
            tracing::debug!(state = %self.session.state, "pause ignored");
            return;
        }
        self.teardown_activity();
        self.cancel_response_if_active().await;
        self.persist_progress(self.session.resume_index());
        self.set_microphone(false).await;
        self.set_remote_audio_muted(true).await;
        self.transition(PlaybackState::Paused);
    }

    async fn stop(&mut self) {
        if self.session.state == PlaybackState::Idle {
            return;
        }
        self.teardown_activity();
        self.cancel_response_if_active().await;
        self.set_microphone(false).await;
        self.disconnect_transport().await;
        self.transition(PlaybackState::Idle);
    }

    async fn interrupt(&mut self) {
        match self.session.state {
            PlaybackState::Playing => {
                self.cancel_chunk_loop();
                self.completion.abandon();
                self.cancel_response_if_active().await;
                self.session.mark_for_replay();
                tracing::info!(
                    rollback = ?self.session.rollback_chunk_index,
                    "narration interrupted"
                );
                self.transition(PlaybackState::Interrupted);
                self.set_microphone(true).await;
            }
            PlaybackState::Answering | PlaybackState::WaitingToResume => {
                self.begin_followup().await;
            }
            state => tracing::debug!(%state, "interrupt ignored"),
        }
    }

    async fn ask(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.last_transcript = Some(text.to_string());
        if self.resume_phrase.matches(text) {
            self.resume().await;
            return;
        }
        match self.session.state {
            PlaybackState::Playing => self.interrupt().await,
            PlaybackState::Answering | PlaybackState::WaitingToResume => {
                self.begin_followup().await
            }
            PlaybackState::Interrupted => {}
            state => {
                tracing::debug!(%state, "question ignored");
                return;
            }
        }
        self.schedule_question(text.to_string(), Duration::ZERO);
    }

    async fn resume(&mut self) {
        match self.session.state {
            PlaybackState::Interrupted | PlaybackState::WaitingToResume => {
                self.resume_playback().await
            }
            PlaybackState::Answering if self.adapter.response_active() => {
                tracing::info!("resume requested mid-answer, cancelling the answer first");
                self.resume_deferred = true;
                self.cancel_question_task();
                self.cancel_response_if_active().await;
            }
            PlaybackState::Answering => self.resume_playback().await,
            state => tracing::debug!(%state, "resume ignored"),
        }
    }

    async fn set_microphone(&mut self, enabled: bool) {
        if let Err(e) = self.transport.set_microphone_enabled(enabled).await {
            tracing::warn!("failed to switch microphone: {:#}", e);
        }
        self.mic_enabled = enabled;
    }

    async fn set_remote_audio_muted(&mut self, muted: bool) {
        if let Err(e) = self.transport.set_remote_audio_muted(muted).await {
            tracing::warn!("failed to switch remote audio: {:#}", e);
        }
    }

    // ---- dialog ---------------------------------------------------------------------

    /// A new interruption while the model is answering or done answering.
    async fn begin_followup(&mut self) {
        self.cancel_question_task();
        self.deferred_question = None;
        self.completion.abandon();
        if self.session.state == PlaybackState::Answering {
            let partial = self.adapter.assistant_text().trim().to_string();
            self.question.last_answer = (!partial.is_empty()).then_some(partial);
        }
        self.cancel_response_if_active().await;
        self.resume_deferred = false;
        self.question.pending_followup = true;
        self.transition(PlaybackState::Interrupted);
        self.set_microphone(true).await;
    }

    async fn on_utterance(&mut self, text: String) {
        self.partial_transcript.clear();
        self.last_transcript = Some(text.clone());
        if self.resume_phrase.matches(&text) {
            self.cancel_question_task();
            self.resume().await;
            return;
        }
        match self.session.state {
            PlaybackState::Interrupted => {}
            PlaybackState::Answering | PlaybackState::WaitingToResume => {
                self.begin_followup().await
            }
            state => {
                tracing::debug!(%state, "utterance ignored: {}", text);
                return;
            }
        }
        self.schedule_question(text, self.settings.question_debounce);
    }

    async fn on_transcript_delta(&mut self, fragment: String) {
        self.partial_transcript.push_str(&fragment);
        self.last_transcript = Some(self.partial_transcript.clone());
        if self.session.state.in_dialog() && self.resume_phrase.matches(&self.partial_transcript)
        {
            self.partial_transcript.clear();
            self.cancel_question_task();
            self.resume().await;
        }
    }

    /// Arm question dispatch. A newer call replaces any pending one, so bursts of
    /// transcripts collapse into a single dispatch carrying the last text.
    fn schedule_question(&mut self, question: String, debounce: Duration) {
        self.cancel_question_task();
        self.question_generation += 1;
        let generation = self.question_generation;
        let cached = self.question.cached_context().map(str::to_string);
        let index = self
            .session
            .rollback_chunk_index
            .or(self.session.active_chunk_index)
            .unwrap_or(self.session.chunk_index);
        let window = self.settings.context_window_secs;
        let content = self.content.clone();
        let lecture_id = self.lecture_id.clone();
        let inbox = self.events_tx.clone();

        self.question_task = Some(tokio::spawn(async move {
            if !debounce.is_zero() {
                tokio::time::sleep(debounce).await;
            }
            let context = match cached {
                Some(context) => Some(context),
                None => match content.fetch_context(&lecture_id, index, window).await {
                    Ok(text) => Some(text),
                    Err(e) => {
                        tracing::warn!("context fetch failed, using local window: {}", e);
                        None
                    }
                },
            };
            let ready = Event::QuestionReady {
                generation,
                question,
                context,
            };
            if inbox.send(ready).await.is_err() {
                tracing::debug!("orchestrator gone before question dispatch");
            }
        }));
    }

    async fn on_question_ready(
        &mut self,
        generation: u64,
        question: String,
        context: Option<String>,
    ) {
        if generation != self.question_generation
            || self.session.state != PlaybackState::Interrupted
        {
            tracing::debug!(generation, "dropping stale question");
            return;
        }
        self.question_task = None;
        if self.adapter.response_in_flight() {
            // a late response.created would otherwise be taken for the answer
            tracing::debug!("previous response still in flight, holding question");
            self.deferred_question = Some(DeferredQuestion { question, context });
            let limit = self.settings.inflight_limit;
            let inbox = self.events_tx.clone();
            self.question_task = Some(tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                let _ = inbox.send(Event::ReleaseQuestion { generation }).await;
            }));
            return;
        }
        self.dispatch_question(question, context).await;
    }

    async fn release_question(&mut self, generation: u64) {
        if generation != self.question_generation
            || self.session.state != PlaybackState::Interrupted
        {
            return;
        }
        self.question_task = None;
        if let Some(held) = self.deferred_question.take() {
            tracing::warn!("previous response never settled, sending question anyway");
            self.adapter.clear_response_active();
            self.stray_response = false;
            self.dispatch_question(held.question, held.context).await;
        }
    }

    async fn dispatch_question(&mut self, question: String, context: Option<String>) {
        self.set_microphone(false).await;

        let context = context
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.context.text().to_string());
        let passage = self.current_chunk.as_ref().map(|c| c.text.as_str());
        let prompt = compose_prompt(
            &question,
            &context,
            passage,
            self.question.previous_exchange(),
        );

        if !self.question.pending_followup {
            self.question.last_answer = None;
        }
        self.question.last_question = Some(question);
        self.question.last_context = Some(context);
        self.question.pending_followup = false;

        if let Err(e) = self.send_turn(prompt).await {
            self.fail(format!("failed to send question: {e:#}")).await;
            return;
        }
        tracing::info!("question dispatched");
        self.transition(PlaybackState::Answering);
        self.begin_wait(self.settings.question_timeout, None);
    }

    async fn resume_playback(&mut self) {
        self.cancel_question_task();
        self.deferred_question = None;
        self.completion.abandon();
        self.resume_deferred = false;
        self.question.pending_followup = false;
        self.set_microphone(false).await;
        tracing::info!(
            from = self.session.resume_index(),
            "resuming narration"
        );
        self.transition(PlaybackState::Playing);
        self.spawn_chunk_loop();
    }

    // ---- protocol -------------------------------------------------------------------

    async fn on_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::ResponseStarted => {
                self.stale_cancel_sent = false;
                // nothing waits on it, or it answers an older request than the awaited one
                let stray =
                    !self.completion.is_pending() || self.adapter.requests_outstanding() > 0;
                self.stray_response = stray;
                if stray {
                    tracing::debug!(state = %self.session.state, "cancelling unrequested response");
                    self.cancel_response_if_active().await;
                }
            }
            ProtocolEvent::ResponseCompleted => self.on_response_completed().await,
            ProtocolEvent::Error { code, message } => self.on_protocol_error(code, message).await,
            ProtocolEvent::UtteranceCompleted(text) => self.on_utterance(text).await,
            ProtocolEvent::TranscriptDelta(fragment) => self.on_transcript_delta(fragment).await,
            ProtocolEvent::AssistantTextDelta(_) => {}
        }
    }

    async fn on_response_completed(&mut self) {
        self.stale_cancel_sent = false;
        let stray = std::mem::take(&mut self.stray_response);
        if self.completion.is_pending() && !stray {
            self.resolve_wait().await;
        } else if self.session.state == PlaybackState::Interrupted
            && !self.adapter.response_in_flight()
        {
            if let Some(held) = self.deferred_question.take() {
                self.cancel_question_task();
                self.dispatch_question(held.question, held.context).await;
            }
        }
    }

    async fn on_protocol_error(&mut self, code: String, message: String) {
        match self.recovery.observe(&code, Instant::now()) {
            RecoveryDecision::Benign => {
                tracing::info!(%code, "benign realtime error: {}", message);
                self.notice = Some(message);
            }
            RecoveryDecision::Recover { attempt } => {
                tracing::warn!(%code, attempt, "realtime error: {}", message);
                self.notice = Some(format!("{code}: {message}"));
                if self.session.state == PlaybackState::Playing {
                    self.session.mark_for_replay();
                    self.retry_pending = true;
                    self.spawn_chunk_loop();
                }
            }
            RecoveryDecision::Fatal { attempts } => {
                self.fail(format!(
                    "realtime error {code} ({attempts} in quick succession): {message}"
                ))
                .await;
            }
        }
    }

    // ---- completion -----------------------------------------------------------------

    fn begin_wait(&mut self, timeout: Duration, waiter: Option<oneshot::Sender<()>>) {
        let token = self.completion.issue(waiter);
        let inbox = self.events_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inbox.send(Event::WaitTimeout(token)).await;
        });
        self.completion.arm_timer(token, timer.abort_handle());
    }

    async fn resolve_wait(&mut self) {
        self.completion.resolve();
        self.adapter.clear_response_active();

        match self.session.state {
            PlaybackState::Answering => {
                let answer = self.adapter.assistant_text().trim().to_string();
                self.question.last_answer = (!answer.is_empty()).then_some(answer);
                self.transition(PlaybackState::WaitingToResume);
                self.set_microphone(true).await;
            }
            PlaybackState::Playing if self.retry_pending => {
                tracing::info!("recovered chunk completed");
                self.retry_pending = false;
            }
            _ => {}
        }

        if self.resume_deferred {
            self.resume_deferred = false;
            self.resume_playback().await;
        }
    }

    // ---- chunk loop -----------------------------------------------------------------

    fn spawn_chunk_loop(&mut self) {
        self.cancel_chunk_loop();
        self.completion.abandon();
        self.loop_id += 1;
        let cancel = CancellationToken::new();
        let chunk_loop = ChunkLoop {
            id: self.loop_id,
            lecture_id: self.lecture_id.clone(),
            content: self.content.clone(),
            inbox: self.events_tx.clone(),
            cancel: cancel.clone(),
            inflight_poll: self.settings.inflight_poll,
            inflight_limit: self.settings.inflight_limit,
        };
        tracing::debug!(loop_id = self.loop_id, "chunk loop started");
        let task = tokio::spawn(chunk_loop.run());
        self.chunk_loop = Some(LoopHandle { cancel, task });
    }

    fn cancel_chunk_loop(&mut self) {
        if let Some(handle) = self.chunk_loop.take() {
            handle.cancel.cancel();
            drop(handle.task);
        }
    }

    async fn on_loop_request(&mut self, loop_id: u64, request: LoopRequest) {
        if loop_id != self.loop_id || self.chunk_loop.is_none() {
            // dropping the request drops its reply sender, which stops the stale loop
            tracing::debug!(loop_id, "request from stale chunk loop");
            return;
        }
        match request {
            LoopRequest::NextIndex { reply } => {
                let next = self.next_chunk_index().await;
                let _ = reply.send(next);
            }
            LoopRequest::Activate { index, chunk, reply } => {
                let _ = reply.send(self.activate_chunk(index, chunk));
            }
            LoopRequest::ResponseInFlight { reply } => {
                let _ = reply.send(self.adapter.response_in_flight());
            }
            LoopRequest::CancelStale { reply } => {
                if self.stale_cancel_sent {
                    tracing::warn!("lingering response ignored its cancel, dropping it");
                    self.adapter.clear_response_active();
                } else {
                    self.cancel_response_if_active().await;
                    self.stale_cancel_sent = true;
                }
                let _ = reply.send(());
            }
            LoopRequest::Deliver { index, reply } => {
                let completion = self.deliver_chunk(index).await;
                let _ = reply.send(completion);
            }
            LoopRequest::Delivered { index, reply } => {
                let _ = reply.send(self.delivery_outcome(index));
            }
            LoopRequest::Advance { index, reply } => {
                let keep_going = self.advance(index).await;
                let _ = reply.send(keep_going);
            }
            LoopRequest::FetchFailed { index, error } => self.on_fetch_failed(index, error).await,
        }
    }

    async fn next_chunk_index(&mut self) -> Option<usize> {
        if self.session.state != PlaybackState::Playing {
            return None;
        }
        self.session.apply_rollback();
        if self.session.chunk_index >= self.session.total_chunks {
            self.finish(true).await;
            return None;
        }
        Some(self.session.chunk_index)
    }

    fn activate_chunk(&mut self, index: usize, chunk: Chunk) -> bool {
        if self.session.state != PlaybackState::Playing {
            return false;
        }
        self.session.active_chunk_index = Some(index);
        self.current_chunk = Some(chunk);
        true
    }

    async fn deliver_chunk(&mut self, index: usize) -> Option<oneshot::Receiver<()>> {
        if self.session.state != PlaybackState::Playing
            || self.session.active_chunk_index != Some(index)
        {
            return None;
        }
        let chunk = self.current_chunk.clone()?;

        if let Err(e) = self.send_turn(chunk.text.clone()).await {
            self.fail(format!("failed to send chunk {index}: {e:#}")).await;
            return None;
        }
        tracing::info!(
            index,
            total = self.session.total_chunks,
            approx_seconds = chunk.approx_seconds,
            "narrating chunk"
        );

        let (tx, rx) = oneshot::channel();
        self.begin_wait(self.settings.chunk_timeout(chunk.approx_seconds), Some(tx));
        Some(rx)
    }

    fn delivery_outcome(&self, index: usize) -> ChunkOutcome {
        if self.session.state != PlaybackState::Playing {
            ChunkOutcome::Stop
        } else if self.session.rollback_chunk_index.is_some()
            || self.session.active_chunk_index != Some(index)
        {
            ChunkOutcome::Replay
        } else {
            ChunkOutcome::Pace
        }
    }

    async fn advance(&mut self, index: usize) -> bool {
        if self.session.state != PlaybackState::Playing {
            return false;
        }
        if self.session.active_chunk_index != Some(index)
            || self.session.rollback_chunk_index.is_some()
        {
            // a replay was requested while pacing; let the next iteration pick it up
            return true;
        }
        self.session.chunk_index = index + 1;
        self.session.active_chunk_index = None;
        self.persist_progress(self.session.chunk_index);

        // only narrated passages count as context
        if self.last_recorded != Some(index) {
            if let Some(chunk) = &self.current_chunk {
                self.context.record(&chunk.text, chunk.approx_seconds);
            }
            self.last_recorded = Some(index);
        }

        if self.session.chunk_index >= self.session.total_chunks {
            self.finish(true).await;
            return false;
        }
        true
    }

    async fn on_fetch_failed(&mut self, index: usize, error: ContentError) {
        if error.is_not_found() {
            tracing::info!(index, "no chunk at index, lecture complete");
            self.finish(false).await;
        } else {
            self.fail(format!("failed to fetch chunk {index}: {error}"))
                .await;
        }
    }

    async fn finish(&mut self, clear_progress: bool) {
        self.teardown_activity();
        if clear_progress {
            self.clear_progress();
        }
        self.set_microphone(false).await;
        self.disconnect_transport().await;
        tracing::info!(lecture_id = %self.lecture_id, "lecture finished");
        self.transition(PlaybackState::Finished);
    }

    // ---- shared helpers -------------------------------------------------------------

    async fn send_turn(&mut self, text: String) -> Result<()> {
        self.adapter
            .send(OutboundCommand::CreateUserTurn(text))
            .await?;
        self.adapter.send(OutboundCommand::RequestResponse).await
    }

    async fn cancel_response_if_active(&mut self) {
        if !self.adapter.response_active() {
            return;
        }
        if let Err(e) = self.adapter.send(OutboundCommand::CancelResponse).await {
            tracing::warn!("failed to cancel active response: {:#}", e);
        }
    }

    fn cancel_question_task(&mut self) {
        if let Some(task) = self.question_task.take() {
            task.abort();
        }
    }

    /// Stop every background activity tied to the current attempt.
    fn teardown_activity(&mut self) {
        self.cancel_chunk_loop();
        self.completion.abandon();
        self.cancel_question_task();
        self.deferred_question = None;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.retry_pending = false;
        self.resume_deferred = false;
    }

    async fn disconnect_transport(&mut self) {
        self.adapter.reset();
        self.stale_cancel_sent = false;
        self.stray_response = false;
        if let Err(e) = self.transport.disconnect().await {
            tracing::warn!("disconnect failed: {:#}", e);
        }
    }

    async fn fail(&mut self, message: String) {
        tracing::error!(state = %self.session.state, "{}", message);
        self.teardown_activity();
        self.cancel_response_if_active().await;
        self.set_microphone(false).await;
        self.disconnect_transport().await;
        self.error_message = Some(message);
        self.transition(PlaybackState::Error);
    }

    fn transition(&mut self, next: PlaybackState) {
        if self.session.state != next {
            tracing::info!(from = %self.session.state, to = %next, "playback state");
            self.session.state = next;
        }
    }

    fn load_progress(&self) -> usize {
        match self.store.get(&progress_key(&self.lecture_id)) {
            Ok(Some(index)) => {
                tracing::info!(index, "restoring saved progress");
                index
            }
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!("failed to read saved progress: {:#}", e);
                0
            }
        }
    }

    fn persist_progress(&self, index: usize) {
        if let Err(e) = self.store.set(&progress_key(&self.lecture_id), index) {
            tracing::warn!(index, "failed to save progress: {:#}", e);
        }
    }

    fn clear_progress(&self) {
        if let Err(e) = self.store.delete(&progress_key(&self.lecture_id)) {
            tracing::warn!("failed to clear saved progress: {:#}", e);
        }
    }

    fn publish(&self) {
        let chunk = self.current_chunk.as_ref();
        let next = SessionView {
            state: self.session.state,
            lecture_title: self.lecture_title.clone(),
            chunk_index: self
                .session
                .active_chunk_index
                .unwrap_or(self.session.chunk_index),
            total_chunks: self.session.total_chunks,
            chunk_text: chunk.map(|c| c.text.clone()),
            section_name: chunk.and_then(|c| c.section_name.clone()),
            context_text: self.context.text().to_string(),
            last_transcript: self.last_transcript.clone(),
            assistant_text: self.adapter.assistant_text().to_string(),
            error_message: self.error_message.clone(),
            notice: self.notice.clone(),
            mic_enabled: self.mic_enabled,
        };
        self.view_tx.send_if_modified(|view| {
            if *view == next {
                false
            } else {
                *view = next;
                true
            }
        });
    }

    async fn shutdown(&mut self) {
        self.teardown_activity();
        if self.session.state.needs_connection() {
            self.persist_progress(self.session.resume_index());
        }
        self.cancel_response_if_active().await;
        if self.session.state != PlaybackState::Idle {
            self.disconnect_transport().await;
        }
    }
}

/// Everything needed before the first chunk: lecture metadata, session instructions,
/// a fresh credential and an open channel.
async fn establish(
    content: Arc<dyn ContentService>,
    transport: Arc<dyn Transport>,
    lecture_id: &str,
) -> Result<Connection> {
    let detail = content
        .fetch_lecture(lecture_id)
        .await
        .context("failed to load lecture")?;
    let instructions = content
        .fetch_instructions(lecture_id)
        .await
        .context("failed to load realtime instructions")?;
    let token = content
        .mint_token(lecture_id)
        .await
        .context("failed to mint realtime credential")?;
    let credential = RealtimeCredential {
        secret: token.secret,
        model: token.model,
    };
    transport
        .connect(&credential)
        .await
        .context("failed to open realtime channel")?;
    Ok(Connection {
        detail,
        instructions,
        voice: token.voice,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{MockContentService, RealtimeToken};
    use crate::persistence::MemoryProgressStore;
    use crate::transport::MockTransport;
    use secrecy::SecretString;

    fn lecture(num_chunks: usize) -> LectureDetail {
        LectureDetail {
            lecture_id: "bio-101".into(),
            title: "Cell Biology".into(),
            status: "ready".into(),
            num_chunks,
            duration_estimate: None,
            chunks_ready: true,
        }
    }

    fn quiet_transport(events: &broadcast::Sender<TransportEvent>) -> MockTransport {
        let mut transport = MockTransport::new();
        let rx = events.subscribe();
        transport.expect_subscribe().return_once(move || rx);
        transport.expect_disconnect().returning(|| Ok(()));
        transport
            .expect_set_microphone_enabled()
            .returning(|_| Ok(()));
        transport
            .expect_set_remote_audio_muted()
            .returning(|_| Ok(()));
        transport
    }

    async fn wait_for(handle: &OrchestratorHandle, state: PlaybackState) -> SessionView {
        let mut view = handle.subscribe();
        let seen = tokio::time::timeout(
            Duration::from_secs(5),
            view.wait_for(|v| v.state == state),
        )
        .await
        .expect("timed out waiting for state")
        .expect("orchestrator stopped")
        .clone();
        seen
    }

    #[tokio::test]
    async fn failed_credential_mint_ends_in_error() {
        // --- 1. Arrange ---
        let mut content = MockContentService::new();
        content.expect_fetch_lecture().returning(|_| Ok(lecture(3)));
        content
            .expect_fetch_instructions()
            .returning(|_| Ok("Narrate.".to_string()));
        content.expect_mint_token().returning(|_| {
            Err(ContentError::Status {
                status: 500,
                body: "OPENAI_API_KEY is not configured".into(),
            })
        });

        let (events, _) = broadcast::channel(16);
        let mut transport = quiet_transport(&events);
        transport.expect_connect().never();

        let (handle, _task) = Orchestrator::spawn(
            "bio-101",
            PlaybackSettings::default(),
            Arc::new(content),
            Arc::new(transport),
            Arc::new(MemoryProgressStore::new()),
        );

        // --- 2. Act ---
        handle.start(false).await.unwrap();

        // --- 3. Assert ---
        let view = wait_for(&handle, PlaybackState::Error).await;
        let message = view.error_message.expect("error message should be published");
        assert!(message.contains("mint"), "unexpected message: {message}");
        assert!(message.contains("500"), "status should be surfaced: {message}");
    }

    #[tokio::test]
    async fn missing_first_chunk_finishes_without_touching_progress() {
        let mut content = MockContentService::new();
        content.expect_fetch_lecture().returning(|_| Ok(lecture(4)));
        content
            .expect_fetch_instructions()
            .returning(|_| Ok("Narrate.".to_string()));
        content.expect_mint_token().returning(|_| {
            Ok(RealtimeToken {
                secret: SecretString::from("ek_test".to_string()),
                expires_at: 0,
                model: "gpt-realtime".into(),
                voice: "marin".into(),
            })
        });
        content
            .expect_fetch_chunk()
            .returning(|_, index| Err(ContentError::NotFound(format!("chunk {index}"))));

        let (events, _) = broadcast::channel(16);
        let mut transport = quiet_transport(&events);
        let connected = events.clone();
        transport.expect_connect().returning(move |_| {
            let _ = connected.send(TransportEvent::ConnectionState(ConnectionState::Connected));
            Ok(())
        });
        transport.expect_send_text().returning(|_| Ok(()));

        let store = Arc::new(MemoryProgressStore::new());
        store.set(&progress_key("bio-101"), 2).unwrap();

        let (handle, _task) = Orchestrator::spawn(
            "bio-101",
            PlaybackSettings::default(),
            Arc::new(content),
            Arc::new(transport),
            store.clone(),
        );
        handle.start(true).await.unwrap();

        let view = wait_for(&handle, PlaybackState::Finished).await;
        assert_eq!(view.chunk_index, 2);
        assert_eq!(store.get(&progress_key("bio-101")).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn commands_outside_their_states_are_ignored() {
        let content = MockContentService::new();
        let (events, _) = broadcast::channel(16);
        let transport = quiet_transport(&events);

        let (handle, _task) = Orchestrator::spawn(
            "bio-101",
            PlaybackSettings::default(),
            Arc::new(content),
            Arc::new(transport),
            Arc::new(MemoryProgressStore::new()),
        );

        handle.pause().await.unwrap();
        handle.resume().await.unwrap();
        handle.interrupt().await.unwrap();
        handle.stop().await.unwrap();
        handle.send_question("anyone there?").await.unwrap();

        // a round trip through the queue proves the earlier commands were handled
        handle.set_microphone(true).await.unwrap();
        let mut view = handle.subscribe();
        let view = tokio::time::timeout(Duration::from_secs(5), view.wait_for(|v| v.mic_enabled))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(view.state, PlaybackState::Idle);
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_orchestrator() {
        let (events, _) = broadcast::channel(16);
        let transport = quiet_transport(&events);
        let (handle, task) = Orchestrator::spawn(
            "bio-101",
            PlaybackSettings::default(),
            Arc::new(MockContentService::new()),
            Arc::new(transport),
            Arc::new(MemoryProgressStore::new()),
        );

        drop(handle);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("orchestrator should exit")
            .unwrap();
    }
}

//! The translation pipeline state machine.
//!
//! One task owns all session state and reacts to discrete events: speech
//! source updates, debounce expiry, retry timers and backend completions.
//! Every transition runs to completion before the next event is processed,
//! so no locks guard the session state. Segments are dispatched strictly
//! sequentially, which preserves output order without a reorder buffer.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, InflightTranslation, TranslationBackend, TranslationEvent};
use crate::protocol::{LanguageSelector, PendingSegment, TranslationRequest};
use crate::segment::split_segments;
use crate::speech::{TranscriptState, TranscriptUpdate};

/// Bounded-retry policy applied when a backend call fails.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Automatic retries per segment after the initial attempt.
    pub max_retries: u32,
    /// Fixed delay before a retry is dispatched.
    pub backoff: Duration,
    /// Whether an empty backend response is worth a retry.
    pub retry_on_empty: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Duration::from_secs(3),
            retry_on_empty: false,
        }
    }
}

impl RetryPolicy {
    /// Decide whether to retry after `attempts_made` failed attempts.
    pub fn should_retry(&self, error: &BackendError, attempts_made: u32) -> bool {
        if attempts_made > self.max_retries {
            return false;
        }
        match error {
            BackendError::Unavailable(_) => true,
            BackendError::Empty => self.retry_on_empty,
            BackendError::Rejected(_) => false,
        }
    }
}

/// Tunables of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum segment length in characters (see [`crate::segment`]).
    pub max_segment_len: usize,
    /// Minimum number of pending characters (strict) before the debounce
    /// timer is armed. Stop always flushes regardless of this threshold.
    pub min_pending_chars: usize,
    /// Quiet period after a transcript change before dispatching.
    pub debounce: Duration,
    /// Shorter quiet period before the first dispatch of a session, to cut
    /// perceived startup latency.
    pub first_debounce: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_segment_len: 120,
            min_pending_chars: 5,
            debounce: Duration::from_millis(600),
            first_debounce: Duration::from_millis(150),
            retry: RetryPolicy::default(),
        }
    }
}

/// Externally observable pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineStatus {
    #[default]
    Idle,
    Listening,
    Translating,
    Retrying,
}

/// Read-only snapshot published to the rendering layer after every event.
#[derive(Debug, Clone, Default)]
pub struct TranslationSnapshot {
    pub status: PipelineStatus,
    /// Translated fragments in arrival order, append-only per session.
    pub fragments: Vec<String>,
    /// Accumulated translated text.
    pub text: String,
    /// Source language, recorded at most once per session (auto mode).
    pub detected_language: Option<String>,
    /// Latest recognizer state, for rendering the original panel.
    pub transcript: TranscriptState,
    /// Most recent surfaced error, if any.
    pub last_error: Option<String>,
    /// When the current session began listening.
    pub session_started_at: Option<chrono::DateTime<chrono::Utc>>,
}

enum Command {
    Start,
    Stop,
    SetTargetLanguage(LanguageSelector),
    Transcript(TranscriptUpdate),
}

/// Cloneable handle to a running pipeline.
///
/// Commands are delivered over a channel; state is read back only through
/// snapshots, so the rendering layer never touches pipeline internals.
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<TranslationSnapshot>,
}

impl PipelineHandle {
    /// Begin a new listening session, clearing all prior session state.
    pub async fn start(&self) -> crate::Result<()> {
        self.send(Command::Start).await
    }

    /// Stop capturing. Cancels the in-flight request, flushes unconsumed
    /// transcript text and drains to idle.
    pub async fn stop(&self) -> crate::Result<()> {
        self.send(Command::Stop).await
    }

    /// Switch the target language. Cancels the in-flight request.
    pub async fn set_target_language(&self, language: LanguageSelector) -> crate::Result<()> {
        self.send(Command::SetTargetLanguage(language)).await
    }

    /// Feed one speech source change notification.
    pub async fn push_transcript(&self, update: TranscriptUpdate) -> crate::Result<()> {
        self.send(Command::Transcript(update)).await
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<TranslationSnapshot> {
        self.snapshots.clone()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> TranslationSnapshot {
        self.snapshots.borrow().clone()
    }

    async fn send(&self, command: Command) -> crate::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| crate::TranslatorError::PipelineClosed)
    }
}

/// Forward every update of a speech source stream into the pipeline until
/// the stream ends.
pub async fn pump_speech(
    handle: &PipelineHandle,
    mut updates: mpsc::Receiver<TranscriptUpdate>,
) -> crate::Result<()> {
    while let Some(update) = updates.recv().await {
        handle.push_transcript(update).await?;
    }
    Ok(())
}

/// Spawns the pipeline task and hands out control handles.
pub struct TranslationPipeline;

impl TranslationPipeline {
    pub fn spawn<B: TranslationBackend>(
        backend: B,
        target: LanguageSelector,
        config: PipelineConfig,
    ) -> PipelineHandle {
        let (commands_tx, commands_rx) = mpsc::channel(128);
        let (snapshots_tx, snapshots_rx) = watch::channel(TranslationSnapshot::default());

        let worker = Worker {
            backend,
            config,
            commands: commands_rx,
            snapshots: snapshots_tx,
            target,
            status: PipelineStatus::Idle,
            session_active: false,
            transcript: TranscriptState::default(),
            watermark: 0,
            debounce_deadline: None,
            first_dispatch_done: false,
            queue: VecDeque::new(),
            next_sequence: 0,
            inflight: None,
            retry: None,
            fragments: Vec::new(),
            text: String::new(),
            detected_language: None,
            last_error: None,
            session_started_at: None,
        };
        tokio::spawn(worker.run());

        PipelineHandle {
            commands: commands_tx,
            snapshots: snapshots_rx,
        }
    }
}

struct Inflight {
    segment: PendingSegment,
    call: InflightTranslation,
    attempt: u32,
    /// Whether this attempt already appended output. A retry after partial
    /// output would duplicate text, so such failures are surfaced instead.
    appended: bool,
}

struct PendingRetry {
    segment: PendingSegment,
    attempt: u32,
    deadline: Instant,
}

struct Worker<B> {
    backend: B,
    config: PipelineConfig,
    commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<TranslationSnapshot>,

    target: LanguageSelector,
    status: PipelineStatus,
    session_active: bool,
    transcript: TranscriptState,
    /// Byte offset into `transcript.final_text` up to which text has been
    /// dispatched. Non-decreasing within a session.
    watermark: usize,
    debounce_deadline: Option<Instant>,
    first_dispatch_done: bool,
    queue: VecDeque<PendingSegment>,
    next_sequence: usize,
    inflight: Option<Inflight>,
    retry: Option<PendingRetry>,

    fragments: Vec<String>,
    text: String,
    detected_language: Option<String>,
    last_error: Option<String>,
    session_started_at: Option<chrono::DateTime<chrono::Utc>>,
}

async fn recv_event(inflight: &mut Option<Inflight>) -> Option<TranslationEvent> {
    match inflight {
        Some(inflight) => inflight.call.recv().await,
        None => std::future::pending().await,
    }
}

impl<B: TranslationBackend> Worker<B> {
    async fn run(mut self) {
        self.publish();
        loop {
            let debounce_at = self.debounce_deadline;
            let retry_at = self.retry.as_ref().map(|r| r.deadline);

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                _ = sleep_until(debounce_at.unwrap_or_else(Instant::now)), if debounce_at.is_some() => {
                    self.flush_watermark();
                }
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.redispatch_retry();
                }
                event = recv_event(&mut self.inflight), if self.inflight.is_some() => {
                    self.handle_backend_event(event);
                }
            }

            self.maybe_dispatch();
            self.update_status();
            self.publish();
        }
        debug!("translation pipeline loop ended");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start_session(),
            Command::Stop => self.stop_session(),
            Command::SetTargetLanguage(language) => self.change_target(language),
            Command::Transcript(update) => self.apply_transcript(update),
        }
    }

    fn start_session(&mut self) {
        info!(target_language = %self.target, "starting listening session");
        self.cancel_inflight();
        self.retry = None;
        self.session_active = true;
        self.transcript = TranscriptState {
            is_listening: true,
            ..TranscriptState::default()
        };
        self.watermark = 0;
        self.debounce_deadline = None;
        self.first_dispatch_done = false;
        self.queue.clear();
        self.next_sequence = 0;
        self.fragments.clear();
        self.text.clear();
        self.detected_language = None;
        self.last_error = None;
        self.session_started_at = Some(chrono::Utc::now());
    }

    fn stop_session(&mut self) {
        if !self.session_active {
            return;
        }
        info!("stopping listening session");
        self.session_active = false;
        self.transcript.is_listening = false;
        self.cancel_inflight();
        self.retry = None;
        // Unconsumed text bypasses the debounce on stop.
        self.flush_watermark();
    }

    fn change_target(&mut self, language: LanguageSelector) {
        if language == self.target {
            return;
        }
        info!(from = %self.target, to = %language, "target language changed");
        self.target = language;
        self.cancel_inflight();
        self.retry = None;
    }

    fn cancel_inflight(&mut self) {
        if let Some(inflight) = self.inflight.take() {
            debug!(
                correlation = %inflight.call.correlation(),
                sequence = inflight.segment.sequence_index,
                "cancelling in-flight translation"
            );
            inflight.call.cancel();
        }
    }

    fn apply_transcript(&mut self, update: TranscriptUpdate) {
        if let Some(error) = &update.error {
            warn!("speech source error: {}", error);
            self.last_error = Some(error.to_string());
        }
        if !self.session_active {
            return;
        }

        let incoming = update.transcript;
        if incoming.final_text.get(self.watermark..).is_none() {
            // The source contract says the final transcript only grows
            // while listening; a shrink, or a rewrite that leaves the
            // watermark inside a multibyte character, would corrupt it.
            warn!("final transcript inconsistent with the dispatch watermark, ignoring update");
            return;
        }

        let stopped = self.transcript.is_listening && !incoming.is_listening;
        self.transcript = incoming;

        if stopped {
            self.stop_session();
            return;
        }

        let pending = self.transcript.final_text[self.watermark..].trim();
        if pending.chars().count() > self.config.min_pending_chars {
            let delay = if self.first_dispatch_done {
                self.config.debounce
            } else {
                self.config.first_debounce
            };
            // Each qualifying update restarts the quiet period.
            self.debounce_deadline = Some(Instant::now() + delay);
        }
    }

    /// Consume everything past the watermark and queue it as segments.
    ///
    /// The watermark advances before any call is issued, so transcript
    /// growth during a call is neither lost nor dispatched twice.
    fn flush_watermark(&mut self) {
        self.debounce_deadline = None;
        let pending = match self.transcript.final_text.get(self.watermark..) {
            Some(rest) => rest.trim().to_string(),
            None => {
                warn!("dispatch watermark out of sync with the transcript, resetting");
                String::new()
            }
        };
        self.watermark = self.transcript.final_text.len();
        if pending.is_empty() {
            return;
        }

        for text in split_segments(&pending, self.config.max_segment_len) {
            let segment = PendingSegment::new(text, self.next_sequence);
            self.next_sequence += 1;
            self.queue.push_back(segment);
        }
        self.first_dispatch_done = true;
    }

    fn maybe_dispatch(&mut self) {
        if self.inflight.is_some() || self.retry.is_some() {
            return;
        }
        if let Some(segment) = self.queue.pop_front() {
            self.dispatch(segment, 1);
        }
    }

    fn dispatch(&mut self, segment: PendingSegment, attempt: u32) {
        let request = TranslationRequest::new(segment.clone(), self.target);
        debug!(
            sequence = segment.sequence_index,
            attempt,
            correlation = %request.correlation,
            "dispatching segment"
        );
        let call = self.backend.translate(request);
        self.inflight = Some(Inflight {
            segment,
            call,
            attempt,
            appended: false,
        });
    }

    fn redispatch_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            self.dispatch(retry.segment, retry.attempt + 1);
        }
    }

    fn handle_backend_event(&mut self, event: Option<TranslationEvent>) {
        match event {
            Some(TranslationEvent::Token(token)) => {
                if let Some(inflight) = self.inflight.as_mut() {
                    inflight.appended = true;
                }
                self.text.push_str(&token);
                self.fragments.push(token);
            }
            Some(TranslationEvent::DetectedLanguage(language)) => {
                if self.target == LanguageSelector::Auto && self.detected_language.is_none() {
                    info!(%language, "detected source language");
                    self.detected_language = Some(language);
                }
            }
            Some(TranslationEvent::Done) => {
                if let Some(inflight) = self.inflight.take() {
                    debug!(sequence = inflight.segment.sequence_index, "segment translated");
                }
                if !self.text.is_empty() && !self.text.ends_with(char::is_whitespace) {
                    self.text.push(' ');
                }
            }
            Some(TranslationEvent::Failed(error)) => self.handle_failure(error),
            None => {
                // Channel closed without a terminal event: cancelled call.
                self.inflight = None;
            }
        }
    }

    fn handle_failure(&mut self, error: BackendError) {
        let Some(inflight) = self.inflight.take() else {
            return;
        };

        if !inflight.appended && self.config.retry.should_retry(&error, inflight.attempt) {
            info!(
                sequence = inflight.segment.sequence_index,
                backoff_ms = self.config.retry.backoff.as_millis() as u64,
                "transient failure, scheduling retry: {}",
                error
            );
            self.retry = Some(PendingRetry {
                segment: inflight.segment,
                attempt: inflight.attempt,
                deadline: Instant::now() + self.config.retry.backoff,
            });
        } else {
            warn!(
                sequence = inflight.segment.sequence_index,
                "segment translation failed: {}", error
            );
            self.last_error = Some(error.to_string());
        }
    }

    fn update_status(&mut self) {
        self.status = if self.retry.is_some() {
            PipelineStatus::Retrying
        } else if self.inflight.is_some() {
            PipelineStatus::Translating
        } else if self.session_active {
            PipelineStatus::Listening
        } else {
            PipelineStatus::Idle
        };
    }

    fn publish(&self) {
        let snapshot = TranslationSnapshot {
            status: self.status,
            fragments: self.fragments.clone(),
            text: self.text.trim_end().to_string(),
            detected_language: self.detected_language.clone(),
            transcript: self.transcript.clone(),
            last_error: self.last_error.clone(),
            session_started_at: self.session_started_at,
        };
        self.snapshots.send_replace(snapshot);
    }
}

//! The continuous speech-to-text capability consumed by the pipeline.
//!
//! Real recognition runs in an external engine (the browser capability in
//! the deployed app); this module defines the narrow interface the
//! pipeline consumes plus a scripted source for tests and demos.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Errors reported by a speech source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpeechSourceError {
    /// The capability is unavailable on this platform. Surfaced once,
    /// disables the feature entry point.
    #[error("speech recognition is not supported on this platform")]
    Unsupported,

    /// Recognition engine failure mid-session. Surfaced to the user, the
    /// session stays in whatever state it was.
    #[error("speech recognition failed: {0}")]
    Engine(String),
}

/// Snapshot of the recognizer state carried by every change notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptState {
    /// Finalized transcript. Append-only while listening.
    pub final_text: String,
    /// Provisional transcript, replaced wholesale on each update.
    pub interim_text: String,
    /// Whether the recognizer is currently capturing.
    pub is_listening: bool,
}

/// One change notification from a speech source.
#[derive(Debug, Clone, Default)]
pub struct TranscriptUpdate {
    pub transcript: TranscriptState,
    pub error: Option<SpeechSourceError>,
}

impl TranscriptUpdate {
    pub fn new(final_text: impl Into<String>, interim_text: impl Into<String>, is_listening: bool) -> Self {
        Self {
            transcript: TranscriptState {
                final_text: final_text.into(),
                interim_text: interim_text.into(),
                is_listening,
            },
            error: None,
        }
    }

    pub fn with_error(mut self, error: SpeechSourceError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Continuous, incremental speech-to-text capability.
///
/// `start` hands back the stream of change notifications for one listening
/// session; the stream ends when capture stops or the source is dropped.
pub trait SpeechSource: Send {
    fn start(&mut self) -> Result<mpsc::Receiver<TranscriptUpdate>, SpeechSourceError>;
    fn stop(&mut self);
}

/// A speech source that replays a fixed script of updates on a timer.
///
/// Each step extends the finalized transcript, mirroring how a real
/// recognizer promotes interim text. Used by the pipeline tests and the
/// demo wiring.
pub struct ScriptedSpeechSource {
    steps: Vec<TranscriptUpdate>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl ScriptedSpeechSource {
    pub fn new(steps: Vec<TranscriptUpdate>, interval: Duration) -> Self {
        Self {
            steps,
            interval,
            task: None,
        }
    }

    /// Build a script from phrases, each step appending one phrase to the
    /// finalized transcript. The last update reports `is_listening: false`.
    pub fn from_phrases(phrases: &[&str], interval: Duration) -> Self {
        let mut steps = Vec::with_capacity(phrases.len() + 1);
        let mut final_text = String::new();
        for phrase in phrases {
            if !final_text.is_empty() {
                final_text.push(' ');
            }
            final_text.push_str(phrase);
            steps.push(TranscriptUpdate::new(final_text.clone(), "", true));
        }
        steps.push(TranscriptUpdate::new(final_text, "", false));
        Self::new(steps, interval)
    }
}

impl SpeechSource for ScriptedSpeechSource {
    fn start(&mut self) -> Result<mpsc::Receiver<TranscriptUpdate>, SpeechSourceError> {
        let (tx, rx) = mpsc::channel(64);
        let steps = self.steps.clone();
        let interval = self.interval;

        let task = tokio::spawn(async move {
            for step in steps {
                tokio::time::sleep(interval).await;
                if tx.send(step).await.is_err() {
                    debug!("scripted speech source receiver dropped");
                    return;
                }
            }
        });

        self.task = Some(task);
        Ok(rx)
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ScriptedSpeechSource {
    fn drop(&mut self) {
        self.stop();
    }
}

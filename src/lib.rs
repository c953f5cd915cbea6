//! Salon Translator - live speech translation for the conference companion
//!
//! This crate turns a continuously growing speech transcript into a stream
//! of translated text. It features:
//!
//! - Debounced, watermark-based consumption of the finalized transcript
//! - Sentence-respecting segmentation into bounded translation requests
//! - Strictly sequential dispatch, preserving output order
//! - Streamed token delivery with bounded retry and cancellation
//! - An HTTP relay that keeps the upstream LLM API key server-side
//!
//! # Example
//!
//! ```rust,no_run
//! use salon_translator::{
//!     backend::{BackendConfig, HttpRelayBackend},
//!     pipeline::{PipelineConfig, TranslationPipeline},
//!     protocol::LanguageSelector,
//!     speech::TranscriptUpdate,
//! };
//!
//! #[tokio::main]
//! async fn main() -> salon_translator::Result<()> {
//!     let backend = HttpRelayBackend::new(BackendConfig::default())?;
//!     let pipeline = TranslationPipeline::spawn(
//!         backend,
//!         LanguageSelector::Auto,
//!         PipelineConfig::default(),
//!     );
//!
//!     pipeline.start().await?;
//!     pipeline
//!         .push_transcript(TranscriptUpdate::new("Bonjour à tous.", "", true))
//!         .await?;
//!
//!     let mut snapshots = pipeline.subscribe();
//!     while snapshots.changed().await.is_ok() {
//!         println!("{}", snapshots.borrow().text);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod pipeline;
pub mod protocol;
pub mod relay;
pub mod segment;
pub mod speech;

// Re-export commonly used types for convenience
pub use backend::{BackendConfig, BackendError, HttpRelayBackend, TranslationBackend};
pub use pipeline::{PipelineConfig, PipelineHandle, PipelineStatus, TranslationPipeline, TranslationSnapshot};
pub use protocol::{LanguageSelector, PendingSegment, TranslationRequest};
pub use relay::{RelayConfig, RelayServer};
pub use speech::{SpeechSource, TranscriptState, TranscriptUpdate};

use thiserror::Error;

/// Errors that can occur in the salon-translator system
#[derive(Error, Debug)]
pub enum TranslatorError {
    /// The pipeline task is gone; its handle can no longer deliver commands
    #[error("translation pipeline is no longer running")]
    PipelineClosed,

    /// Relay server failed to start or bind
    #[error("relay server error: {0}")]
    Relay(String),

    /// Speech source error
    #[error("speech source error: {0}")]
    Speech(#[from] speech::SpeechSourceError),

    /// Translation backend error
    #[error("backend error: {0}")]
    Backend(#[from] backend::BackendError),

    /// HTTP client error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for salon-translator operations
pub type Result<T> = std::result::Result<T, TranslatorError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Path the relay serves and clients call
pub const RELAY_PATH: &str = "/api/groq-proxy";

/// Environment variable holding the upstream API key
pub const API_KEY_ENV: &str = "GROQ_API_KEY";

/// Upstream chat-completions endpoint
pub const UPSTREAM_COMPLETIONS_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

/// Default relay bind address
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constants() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "salon-translator");
    }

    #[test]
    fn test_error_display_includes_cause() {
        let err = TranslatorError::Relay("address in use".to_string());
        assert!(err.to_string().contains("address in use"));
        assert!(TranslatorError::PipelineClosed
            .to_string()
            .contains("no longer running"));
    }
}

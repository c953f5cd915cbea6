//! Translation backend adapter.
//!
//! Turns one segment into a stream of translated tokens by calling the
//! relay endpoint. Handles both response shapes of the relay contract: a
//! streamed `text/event-stream` body framed as `data: <json>\n\n`, or a
//! single JSON object with the full translation.

use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{
    RelayErrorBody, RelayRequest, RelayResult, StreamFrame, SummarizePayload, TranslatePayload,
    TranslationRequest, STREAM_DONE,
};

/// Failures a backend call can report for one segment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Network failure, server error or timeout. Transient: retried once.
    #[error("translation backend unavailable: {0}")]
    Unavailable(String),

    /// The relay rejected the request shape (4xx). Not retried.
    #[error("translation request rejected: {0}")]
    Rejected(String),

    /// Success status but no usable text in the response.
    #[error("translation backend returned no text")]
    Empty,
}

impl BackendError {
    /// Whether the failure is worth an automatic retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Events delivered by an in-flight translation, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationEvent {
    /// One incremental translated token.
    Token(String),
    /// Source language reported by the backend (auto mode).
    DetectedLanguage(String),
    /// Terminal marker: the translation completed.
    Done,
    /// Terminal marker: the translation failed.
    Failed(BackendError),
}

/// Handle to one in-flight backend call.
///
/// Dropping the handle or calling [`cancel`](Self::cancel) aborts the
/// underlying task; a cancelled call delivers no further events.
/// Cancellation is idempotent.
pub struct InflightTranslation {
    correlation: Uuid,
    events: mpsc::Receiver<TranslationEvent>,
    task: JoinHandle<()>,
}

impl InflightTranslation {
    pub fn new(
        correlation: Uuid,
        events: mpsc::Receiver<TranslationEvent>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            correlation,
            events,
            task,
        }
    }

    /// Correlation token of the request this call serves.
    pub fn correlation(&self) -> Uuid {
        self.correlation
    }

    /// Receive the next event, or `None` once the call is cancelled or its
    /// terminal event has been consumed.
    pub async fn recv(&mut self) -> Option<TranslationEvent> {
        self.events.recv().await
    }

    /// Abort the call. No further events are delivered after this returns.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for InflightTranslation {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Text-in, token-stream-out translation capability.
pub trait TranslationBackend: Send + Sync + 'static {
    /// Start one translation call. Must return promptly; all network work
    /// happens behind the returned handle.
    fn translate(&self, request: TranslationRequest) -> InflightTranslation;
}

/// Configuration for the HTTP relay backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Relay endpoint URL.
    pub endpoint: String,
    /// Caller-side bound on one backend call. Timeout counts as transient.
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: format!("http://127.0.0.1:8787{}", crate::RELAY_PATH),
            request_timeout: Duration::from_secs(12),
        }
    }
}

/// Translation backend speaking the relay HTTP contract.
#[derive(Clone)]
pub struct HttpRelayBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRelayBackend {
    pub fn new(config: BackendConfig) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
        })
    }

    /// Summarize a transcript through the relay. Shares the endpoint with
    /// translation but always returns a single completed string.
    pub async fn summarize(&self, text: &str) -> Result<String, BackendError> {
        let body = RelayRequest::Summarize(SummarizePayload {
            text: text.to_string(),
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, read_error_body(response).await));
        }

        let result: RelayResult = response
            .json()
            .await
            .map_err(|e| BackendError::Unavailable(format!("malformed relay response: {}", e)))?;

        if result.result.trim().is_empty() {
            return Err(BackendError::Empty);
        }
        Ok(result.result)
    }
}

impl TranslationBackend for HttpRelayBackend {
    fn translate(&self, request: TranslationRequest) -> InflightTranslation {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let correlation = request.correlation;

        let task = tokio::spawn(async move {
            run_translate(client, endpoint, request, tx).await;
        });

        InflightTranslation::new(correlation, rx, task)
    }
}

async fn run_translate(
    client: reqwest::Client,
    endpoint: String,
    request: TranslationRequest,
    tx: mpsc::Sender<TranslationEvent>,
) {
    let body = RelayRequest::Translate(TranslatePayload {
        text: request.segment.text.clone(),
        target_lang: request.target_language,
    });

    debug!(
        correlation = %request.correlation,
        sequence = request.segment.sequence_index,
        "dispatching translation request"
    );

    let response = match client.post(&endpoint).json(&body).send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = tx
                .send(TranslationEvent::Failed(request_error(e)))
                .await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let message = read_error_body(response).await;
        let _ = tx
            .send(TranslationEvent::Failed(status_error(status, message)))
            .await;
        return;
    }

    if is_event_stream(&response) {
        stream_translation(response, tx).await;
    } else {
        single_translation(response, tx).await;
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false)
}

/// Consume a streamed translation response frame by frame.
///
/// Frames may be split across network reads; the buffer reassembles them.
/// `[DONE]` is the authoritative end of stream even if the transport stays
/// open. Malformed frames are skipped without aborting the stream.
async fn stream_translation(response: reqwest::Response, tx: mpsc::Sender<TranslationEvent>) {
    let mut stream = response.bytes_stream();
    let mut frames = SseFrameBuffer::default();
    let mut emitted = false;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx
                    .send(TranslationEvent::Failed(BackendError::Unavailable(
                        format!("stream read failed: {}", e),
                    )))
                    .await;
                return;
            }
        };

        for payload in frames.push(&chunk) {
            if payload == STREAM_DONE {
                let event = if emitted {
                    TranslationEvent::Done
                } else {
                    TranslationEvent::Failed(BackendError::Empty)
                };
                let _ = tx.send(event).await;
                return;
            }

            let frame: StreamFrame = match serde_json::from_str(&payload) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("skipping malformed stream frame: {}", e);
                    continue;
                }
            };

            if let Some(message) = frame.error {
                let _ = tx
                    .send(TranslationEvent::Failed(BackendError::Unavailable(message)))
                    .await;
                return;
            }

            for choice in frame.choices {
                if let Some(language) = choice.detected_language {
                    if tx
                        .send(TranslationEvent::DetectedLanguage(language))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                if let Some(content) = choice.delta.content {
                    if !content.is_empty() {
                        emitted = true;
                        if tx.send(TranslationEvent::Token(content)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    // Transport closed without a terminal marker.
    warn!("translation stream ended without [DONE]");
    let event = if emitted {
        TranslationEvent::Done
    } else {
        TranslationEvent::Failed(BackendError::Unavailable(
            "stream ended before any data".to_string(),
        ))
    };
    let _ = tx.send(event).await;
}

/// Consume the non-streaming fallback: a single JSON object with the full
/// translated text.
async fn single_translation(response: reqwest::Response, tx: mpsc::Sender<TranslationEvent>) {
    let result: RelayResult = match response.json().await {
        Ok(result) => result,
        Err(e) => {
            let _ = tx
                .send(TranslationEvent::Failed(BackendError::Unavailable(
                    format!("malformed relay response: {}", e),
                )))
                .await;
            return;
        }
    };

    if let Some(language) = result.detected_language {
        if tx
            .send(TranslationEvent::DetectedLanguage(language))
            .await
            .is_err()
        {
            return;
        }
    }

    if result.result.trim().is_empty() {
        let _ = tx
            .send(TranslationEvent::Failed(BackendError::Empty))
            .await;
        return;
    }

    if tx
        .send(TranslationEvent::Token(result.result))
        .await
        .is_err()
    {
        return;
    }
    let _ = tx.send(TranslationEvent::Done).await;
}

fn request_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Unavailable("request timed out".to_string())
    } else {
        BackendError::Unavailable(e.to_string())
    }
}

fn status_error(status: reqwest::StatusCode, message: String) -> BackendError {
    if status.is_client_error() {
        BackendError::Rejected(message)
    } else {
        BackendError::Unavailable(message)
    }
}

async fn read_error_body(response: reqwest::Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) => match serde_json::from_str::<RelayErrorBody>(&body) {
            Ok(parsed) => parsed.error,
            Err(_) => format!("relay responded with status {}", status),
        },
        Err(_) => format!("relay responded with status {}", status),
    }
}

/// Reassembles `data: <payload>\n\n` frames from a byte stream that may be
/// split at arbitrary boundaries.
#[derive(Debug, Default)]
pub struct SseFrameBuffer {
    buf: Vec<u8>,
}

impl SseFrameBuffer {
    /// Feed one chunk of bytes; returns the payloads of every frame
    /// completed by this chunk, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(pos) = find_frame_boundary(&self.buf) {
            let frame: Vec<u8> = self.buf.drain(..pos + 2).collect();
            let text = String::from_utf8_lossy(&frame[..pos]);
            for line in text.lines() {
                let line = line.trim();
                if let Some(rest) = line.strip_prefix("data:") {
                    let payload = rest.trim();
                    if !payload.is_empty() {
                        payloads.push(payload.to_string());
                    }
                }
            }
        }
        payloads
    }
}

fn find_frame_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LanguageSelector, PendingSegment};
    use tiny_http::{Header, Response, Server};

    #[test]
    fn test_frame_buffer_single_chunk_multiple_frames() {
        let mut buffer = SseFrameBuffer::default();
        let payloads = buffer.push(b"data: one\n\ndata: two\n\n");
        assert_eq!(payloads, vec!["one", "two"]);
    }

    #[test]
    fn test_frame_buffer_frame_split_across_reads() {
        let mut buffer = SseFrameBuffer::default();
        assert!(buffer.push(b"data: {\"choices\":").is_empty());
        assert!(buffer.push(b"[]}").is_empty());
        let payloads = buffer.push(b"\n\n");
        assert_eq!(payloads, vec!["{\"choices\":[]}"]);
    }

    #[test]
    fn test_frame_buffer_split_at_every_boundary() {
        let raw = b"data: {\"a\":1}\n\ndata: [DONE]\n\n";
        for split in 0..raw.len() {
            let mut buffer = SseFrameBuffer::default();
            let mut payloads = buffer.push(&raw[..split]);
            payloads.extend(buffer.push(&raw[split..]));
            assert_eq!(payloads, vec!["{\"a\":1}", "[DONE]"], "split at {}", split);
        }
    }

    #[test]
    fn test_frame_buffer_ignores_non_data_lines() {
        let mut buffer = SseFrameBuffer::default();
        let payloads = buffer.push(b": keep-alive\nevent: message\ndata: x\n\n");
        assert_eq!(payloads, vec!["x"]);
    }

    #[test]
    fn test_frame_buffer_handles_crlf() {
        let mut buffer = SseFrameBuffer::default();
        let payloads = buffer.push(b"data: y\r\n\ndata: z\n\n");
        assert_eq!(payloads, vec!["y", "z"]);
    }

    #[test]
    fn test_backend_error_transience() {
        assert!(BackendError::Unavailable("down".into()).is_transient());
        assert!(!BackendError::Rejected("bad".into()).is_transient());
        assert!(!BackendError::Empty.is_transient());
    }

    fn sse_response(body: &str) -> Response<std::io::Cursor<Vec<u8>>> {
        Response::from_data(body.as_bytes().to_vec()).with_header(
            Header::from_bytes(&b"Content-Type"[..], &b"text/event-stream"[..]).unwrap(),
        )
    }

    fn serve_one(response: Response<std::io::Cursor<Vec<u8>>>) -> String {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let _ = request.respond(response);
            }
        });
        format!("http://{}{}", addr, crate::RELAY_PATH)
    }

    fn test_request() -> TranslationRequest {
        TranslationRequest::new(
            PendingSegment::new("Bonjour à tous. Ceci est un test.", 0),
            LanguageSelector::En,
        )
    }

    async fn collect_events(mut inflight: InflightTranslation) -> Vec<TranslationEvent> {
        let mut events = Vec::new();
        while let Some(event) = inflight.recv().await {
            let terminal = matches!(
                event,
                TranslationEvent::Done | TranslationEvent::Failed(_)
            );
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_http_backend_streams_tokens_in_order() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" everyone.\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let endpoint = serve_one(sse_response(body));
        let backend = HttpRelayBackend::new(BackendConfig {
            endpoint,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();

        let events = collect_events(backend.translate(test_request())).await;
        assert_eq!(
            events,
            vec![
                TranslationEvent::Token("Hello".to_string()),
                TranslationEvent::Token(" everyone.".to_string()),
                TranslationEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_http_backend_reports_detected_language_and_skips_bad_frames() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"\"},\"detected_language\":\"français\"}]}\n\n",
            "data: not json at all\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let endpoint = serve_one(sse_response(body));
        let backend = HttpRelayBackend::new(BackendConfig {
            endpoint,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();

        let events = collect_events(backend.translate(test_request())).await;
        assert_eq!(
            events,
            vec![
                TranslationEvent::DetectedLanguage("français".to_string()),
                TranslationEvent::Token("Hi".to_string()),
                TranslationEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_http_backend_mid_stream_error_is_transient() {
        let body = concat!(
            "data: {\"error\":\"upstream exploded\"}\n\n",
            "data: [DONE]\n\n",
        );
        let endpoint = serve_one(sse_response(body));
        let backend = HttpRelayBackend::new(BackendConfig {
            endpoint,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();

        let events = collect_events(backend.translate(test_request())).await;
        assert_eq!(
            events,
            vec![TranslationEvent::Failed(BackendError::Unavailable(
                "upstream exploded".to_string()
            ))]
        );
    }

    #[tokio::test]
    async fn test_http_backend_empty_stream_is_backend_empty() {
        let endpoint = serve_one(sse_response("data: [DONE]\n\n"));
        let backend = HttpRelayBackend::new(BackendConfig {
            endpoint,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();

        let events = collect_events(backend.translate(test_request())).await;
        assert_eq!(
            events,
            vec![TranslationEvent::Failed(BackendError::Empty)]
        );
    }

    #[tokio::test]
    async fn test_http_backend_json_fallback() {
        let response = Response::from_string(
            r#"{"result":"Hello everyone.","detected_language":"français"}"#,
        )
        .with_header(
            Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
        );
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let _ = request.respond(response);
            }
        });

        let backend = HttpRelayBackend::new(BackendConfig {
            endpoint: format!("http://{}{}", addr, crate::RELAY_PATH),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();

        let events = collect_events(backend.translate(test_request())).await;
        assert_eq!(
            events,
            vec![
                TranslationEvent::DetectedLanguage("français".to_string()),
                TranslationEvent::Token("Hello everyone.".to_string()),
                TranslationEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_http_backend_client_error_is_rejected() {
        let response = Response::from_string(r#"{"error":"Langue cible non supportée."}"#)
            .with_status_code(400);
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let _ = request.respond(response);
            }
        });

        let backend = HttpRelayBackend::new(BackendConfig {
            endpoint: format!("http://{}{}", addr, crate::RELAY_PATH),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();

        let events = collect_events(backend.translate(test_request())).await;
        assert_eq!(
            events,
            vec![TranslationEvent::Failed(BackendError::Rejected(
                "Langue cible non supportée.".to_string()
            ))]
        );
    }

    #[tokio::test]
    async fn test_http_backend_connection_refused_is_transient() {
        // Nothing listens on this port.
        let backend = HttpRelayBackend::new(BackendConfig {
            endpoint: "http://127.0.0.1:9/api/groq-proxy".to_string(),
            request_timeout: Duration::from_secs(2),
        })
        .unwrap();

        let events = collect_events(backend.translate(test_request())).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            TranslationEvent::Failed(BackendError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let endpoint = serve_one(sse_response("data: [DONE]\n\n"));
        let backend = HttpRelayBackend::new(BackendConfig {
            endpoint,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();

        let inflight = backend.translate(test_request());
        inflight.cancel();
        inflight.cancel();
        drop(inflight);
    }
}

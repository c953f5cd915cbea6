//! HTTP relay between the client and the upstream completion API.
//!
//! The upstream API key lives only in the relay's environment; the client
//! never sees it. One POST endpoint serves two request types: `translate`
//! streams tokens back as `text/event-stream` frames, `summarize` returns
//! a single JSON body.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

use crate::protocol::{LanguageSelector, RelayErrorBody, RelayResult, StreamFrame, STREAM_DONE};

/// Configuration for the relay server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address. Port 0 picks a free port.
    pub bind_addr: String,
    /// Upstream chat-completions endpoint.
    pub upstream_url: String,
    /// Environment variable holding the upstream API key. Read per
    /// request, so the relay picks up a key added after startup.
    pub api_key_env: String,
    /// Fast model used for streamed translations.
    pub translate_model: String,
    /// Larger model used for summaries.
    pub summarize_model: String,
    /// Bound on one non-streaming upstream call.
    pub upstream_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: crate::DEFAULT_BIND_ADDR.to_string(),
            upstream_url: crate::UPSTREAM_COMPLETIONS_URL.to_string(),
            api_key_env: crate::API_KEY_ENV.to_string(),
            translate_model: "llama3-8b-8192".to_string(),
            summarize_model: "llama3-70b-8192".to_string(),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

/// Running relay server. Stops on [`stop`](Self::stop) or drop.
pub struct RelayServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RelayServer {
    /// Bind and start serving on a dedicated thread.
    pub fn start(config: RelayConfig) -> crate::Result<Self> {
        let server = Server::http(&config.bind_addr)
            .map_err(|e| crate::TranslatorError::Relay(e.to_string()))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| crate::TranslatorError::Relay("no ip address bound".to_string()))?;

        info!("relay listening on http://{}{}", addr, crate::RELAY_PATH);

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = shutdown.clone();
        let handle = thread::spawn(move || run_relay(server, Arc::new(config), worker_shutdown));

        Ok(Self {
            addr,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint URL clients should POST to.
    pub fn endpoint(&self) -> String {
        format!("http://{}{}", self.addr, crate::RELAY_PATH)
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("relay server thread panicked");
            }
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_relay(server: Server, config: Arc<RelayConfig>, shutdown: Arc<AtomicBool>) {
    // The blocking client is built on this thread; streamed responses hold
    // a connection open for the lifetime of one translation, so only a
    // connect timeout applies here. Summaries add a per-request timeout.
    let client = match reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("failed to build upstream http client: {}", e);
            return;
        }
    };

    while !shutdown.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(250)) {
            Ok(Some(request)) => {
                let config = config.clone();
                let client = client.clone();
                thread::spawn(move || handle_request(request, &config, &client));
            }
            Ok(None) => continue,
            Err(e) => {
                warn!("relay receive error: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_request(mut request: Request, config: &Arc<RelayConfig>, client: &reqwest::blocking::Client) {
    if request.method() != &Method::Post {
        respond_json(request, 405, &RelayErrorBody::new("Method Not Allowed"));
        return;
    }
    let path = request.url().split('?').next().unwrap_or_default();
    if path != crate::RELAY_PATH {
        respond_json(request, 404, &RelayErrorBody::new("Not Found"));
        return;
    }

    let Some(api_key) = api_key(&config.api_key_env) else {
        error!("{} is not configured", config.api_key_env);
        respond_json(
            request,
            500,
            &RelayErrorBody::new("La configuration du serveur est incomplète."),
        );
        return;
    };

    let mut body = Vec::new();
    if let Err(e) = request.as_reader().read_to_end(&mut body) {
        debug!("failed to read request body: {}", e);
        respond_json(
            request,
            400,
            &RelayErrorBody::new("Corps de requête JSON invalide."),
        );
        return;
    }

    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            respond_json(
                request,
                400,
                &RelayErrorBody::new("Corps de requête JSON invalide."),
            );
            return;
        }
    };

    let kind = value.get("type").and_then(|v| v.as_str());
    let payload = value.get("payload");
    let (Some(kind), Some(payload)) = (kind, payload) else {
        respond_json(
            request,
            400,
            &RelayErrorBody::new("La requête est malformée. Le type ou le payload est manquant."),
        );
        return;
    };

    let text = payload
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();

    match kind {
        "translate" => {
            if text.is_empty() {
                respond_json(
                    request,
                    400,
                    &RelayErrorBody::new("Le texte pour la traduction est manquant."),
                );
                return;
            }
            let target = match payload.get("targetLang").and_then(|v| v.as_str()) {
                None => LanguageSelector::Auto,
                Some(code) => match LanguageSelector::from_code(code) {
                    Some(target) => target,
                    None => {
                        respond_json(
                            request,
                            400,
                            &RelayErrorBody::new("Langue cible non supportée."),
                        );
                        return;
                    }
                },
            };
            handle_translate(request, config.clone(), client.clone(), api_key, text, target);
        }
        "summarize" => {
            if text.is_empty() {
                respond_json(
                    request,
                    400,
                    &RelayErrorBody::new("Le texte pour le résumé est manquant."),
                );
                return;
            }
            handle_summarize(request, config, client, &api_key, &text);
        }
        _ => {
            respond_json(request, 400, &RelayErrorBody::new("Type de requête invalide."));
        }
    }
}

fn api_key(env_var: &str) -> Option<String> {
    std::env::var(env_var)
        .ok()
        .filter(|key| !key.trim().is_empty())
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

fn handle_summarize(
    request: Request,
    config: &RelayConfig,
    client: &reqwest::blocking::Client,
    api_key: &str,
    text: &str,
) {
    let body = json!({
        "messages": [
            {
                "role": "system",
                "content": "Tu es un assistant expert en pneumologie. Ton rôle est de résumer des transcriptions de conférences de manière concise et claire, en structurant le résumé en quelques points clés importants sur des lignes séparées."
            },
            { "role": "user", "content": format!("Voici la transcription:\n\n\"{}\"", text) }
        ],
        "model": config.summarize_model,
    });

    let response = client
        .post(&config.upstream_url)
        .bearer_auth(api_key)
        .timeout(config.upstream_timeout)
        .json(&body)
        .send();

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            error!("upstream summarize call failed: {}", e);
            respond_json(
                request,
                500,
                &RelayErrorBody::new(format!("Erreur lors du résumé: {}", e)),
            );
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        error!("upstream summarize error {}: {}", status, body);
        respond_json(
            request,
            500,
            &RelayErrorBody::new(format!("L'API Groq a répondu avec le statut {}", status.as_u16())),
        );
        return;
    }

    let completion: ChatCompletion = match response.json() {
        Ok(completion) => completion,
        Err(e) => {
            error!("malformed upstream summarize response: {}", e);
            respond_json(
                request,
                500,
                &RelayErrorBody::new("La réponse de l'API Groq était vide ou malformée."),
            );
            return;
        }
    };

    let result = completion
        .choices
        .first()
        .and_then(|c| c.message.content.as_deref())
        .map(str::trim)
        .unwrap_or("");

    if result.is_empty() {
        respond_json(
            request,
            500,
            &RelayErrorBody::new("La réponse de l'API Groq était vide ou malformée."),
        );
    } else {
        respond_json(
            request,
            200,
            &RelayResult {
                result: result.to_string(),
                detected_language: None,
            },
        );
    }
}

fn handle_translate(
    request: Request,
    config: Arc<RelayConfig>,
    client: reqwest::blocking::Client,
    api_key: String,
    text: String,
    target: LanguageSelector,
) {
    let detected = detect_language(&text);
    let prompt = build_prompt(target, detected);

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let feeder = thread::spawn(move || {
        stream_upstream(client, &config, &api_key, &prompt, &text, &tx);
    });

    let headers = vec![
        Header::from_bytes(&b"Content-Type"[..], &b"text/event-stream"[..]).unwrap(),
        Header::from_bytes(&b"Cache-Control"[..], &b"no-cache"[..]).unwrap(),
        Header::from_bytes(&b"Access-Control-Allow-Origin"[..], &b"*"[..]).unwrap(),
    ];
    let response = Response::new(StatusCode(200), headers, ChannelReader::new(rx), None, None);

    // Blocks until the stream ends or the client goes away. A dropped
    // receiver makes the feeder's sends fail, which stops the upstream read.
    if let Err(e) = request.respond(response) {
        debug!("translation client disconnected: {}", e);
    }
    let _ = feeder.join();
}

struct TranslationPrompt {
    system: String,
    /// Source language announced as the first stream frame (auto mode).
    announce: Option<&'static str>,
}

fn build_prompt(target: LanguageSelector, detected: &'static str) -> TranslationPrompt {
    match target {
        LanguageSelector::Auto => {
            let target_name = if detected == "français" {
                "anglais"
            } else {
                "français"
            };
            TranslationPrompt {
                system: format!(
                    "Tu es un traducteur professionnel. Traduis le texte suivant du {} vers le {}. Fournis uniquement la traduction, sans aucune explication.",
                    detected, target_name
                ),
                announce: Some(detected),
            }
        }
        other => TranslationPrompt {
            system: format!(
                "Tu es un traducteur professionnel. Traduis le texte suivant vers le {}. Fournis uniquement la traduction, sans aucune explication.",
                language_name(other)
            ),
            announce: None,
        },
    }
}

fn language_name(language: LanguageSelector) -> &'static str {
    match language {
        LanguageSelector::Fr | LanguageSelector::Auto => "français",
        LanguageSelector::En => "anglais",
        LanguageSelector::Es => "espagnol",
        LanguageSelector::Ar => "arabe",
    }
}

const FRENCH_KEYWORDS: &[&str] = &[
    "le", "la", "les", "un", "une", "des", "et", "de", "du", "que", "qui", "avec", "dans", "pour",
    "sur", "par", "est", "sont", "avoir", "être", "vous", "nous", "ils", "elle",
];
const ENGLISH_KEYWORDS: &[&str] = &[
    "the", "and", "or", "that", "which", "with", "in", "for", "on", "by", "of", "is", "are",
    "have", "be", "to", "you", "we", "they", "she", "he",
];
const SPANISH_KEYWORDS: &[&str] = &[
    "el", "la", "los", "las", "un", "una", "y", "o", "que", "con", "en", "para", "por", "de",
    "es", "son", "tener", "ser", "estar", "usted", "nosotros",
];

/// Keyword-count language detection over whole words, case-insensitive.
/// French wins ties and is the fallback when nothing matches.
pub fn detect_language(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    let mut french = 0usize;
    let mut english = 0usize;
    let mut spanish = 0usize;

    for word in lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        if FRENCH_KEYWORDS.contains(&word) {
            french += 1;
        }
        if ENGLISH_KEYWORDS.contains(&word) {
            english += 1;
        }
        if SPANISH_KEYWORDS.contains(&word) {
            spanish += 1;
        }
    }

    let mut best = ("français", french);
    if english > best.1 {
        best = ("anglais", english);
    }
    if spanish > best.1 {
        best = ("espagnol", spanish);
    }
    best.0
}

/// Call the upstream completion API and forward its stream as relay frames.
///
/// Upstream `data:` lines are re-emitted one per frame; keep-alive comments
/// and blank lines are dropped. The relay always appends its own `[DONE]`
/// terminator, and upstream failures become an error frame before it.
fn stream_upstream(
    client: reqwest::blocking::Client,
    config: &RelayConfig,
    api_key: &str,
    prompt: &TranslationPrompt,
    text: &str,
    tx: &mpsc::Sender<Vec<u8>>,
) {
    if let Some(language) = prompt.announce {
        if send_frame(tx, &StreamFrame::detected_language(language)).is_err() {
            return;
        }
    }

    let body = json!({
        "messages": [
            { "role": "system", "content": prompt.system },
            { "role": "user", "content": text }
        ],
        "model": config.translate_model,
        "stream": true,
        "temperature": 0.1,
        "max_tokens": 500,
        "top_p": 0.9,
        "presence_penalty": 0.1,
        "frequency_penalty": 0.1,
        "stop": null
    });

    let response = match client
        .post(&config.upstream_url)
        .bearer_auth(api_key)
        .json(&body)
        .send()
    {
        Ok(response) => response,
        Err(e) => {
            error!("upstream translate call failed: {}", e);
            let _ = send_frame(tx, &StreamFrame::error(format!("Erreur de connexion à Groq: {}", e)));
            let _ = send_done(tx);
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        error!("upstream translate error {}: {}", status, body);
        let _ = send_frame(
            tx,
            &StreamFrame::error(format!("API Groq Error: {}", status.as_u16())),
        );
        let _ = send_done(tx);
        return;
    }

    let mut reader = response;
    let mut buf = [0u8; 4096];
    // Lines are cut at byte level; '\n' is ASCII so multibyte characters
    // split across reads are never broken.
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("upstream stream read failed: {}", e);
                let _ = send_frame(tx, &StreamFrame::error("Erreur de streaming.".to_string()));
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();

            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload.is_empty() {
                continue;
            }
            if payload == STREAM_DONE {
                // The relay owns the terminator; stop forwarding here.
                let _ = send_done(tx);
                return;
            }
            if tx
                .send(format!("data: {}\n\n", payload).into_bytes())
                .is_err()
            {
                debug!("translation stream receiver dropped");
                return;
            }
        }
    }

    let _ = send_done(tx);
}

fn send_frame(tx: &mpsc::Sender<Vec<u8>>, frame: &StreamFrame) -> Result<(), mpsc::SendError<Vec<u8>>> {
    let json = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    tx.send(format!("data: {}\n\n", json).into_bytes())
}

fn send_done(tx: &mpsc::Sender<Vec<u8>>) -> Result<(), mpsc::SendError<Vec<u8>>> {
    tx.send(format!("data: {}\n\n", STREAM_DONE).into_bytes())
}

fn respond_json<T: Serialize>(request: Request, status: u16, body: &T) {
    let body = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let response = Response::from_string(body)
        .with_status_code(StatusCode(status))
        .with_header(Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap());
    if let Err(e) = request.respond(response) {
        debug!("failed to send relay response: {}", e);
    }
}

/// Adapts a channel of byte chunks into the reader tiny_http streams from.
struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.pending.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

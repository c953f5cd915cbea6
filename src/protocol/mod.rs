use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Target-language selector for a translation request.
///
/// `Auto` asks the backend to detect the source language and pick the
/// complementary target (French text is translated to English, anything
/// else to French).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageSelector {
    #[default]
    Auto,
    Fr,
    En,
    Es,
    Ar,
}

impl LanguageSelector {
    /// All selectors accepted on the wire.
    pub const ALL: [LanguageSelector; 5] = [
        LanguageSelector::Auto,
        LanguageSelector::Fr,
        LanguageSelector::En,
        LanguageSelector::Es,
        LanguageSelector::Ar,
    ];

    /// The wire code for this selector (e.g. `"fr"`).
    pub fn code(&self) -> &'static str {
        match self {
            LanguageSelector::Auto => "auto",
            LanguageSelector::Fr => "fr",
            LanguageSelector::En => "en",
            LanguageSelector::Es => "es",
            LanguageSelector::Ar => "ar",
        }
    }

    /// Parse a wire code back into a selector.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|l| l.code() == code)
    }
}

impl std::fmt::Display for LanguageSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// One bounded chunk of newly finalized transcript text, ready to be
/// dispatched as a single translation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSegment {
    /// Trimmed segment text, never empty.
    pub text: String,
    /// Position of this segment in dispatch order within the session.
    pub sequence_index: usize,
}

impl PendingSegment {
    pub fn new(text: impl Into<String>, sequence_index: usize) -> Self {
        Self {
            text: text.into(),
            sequence_index,
        }
    }
}

/// A translation request owned by the pipeline for its lifetime.
///
/// The correlation token ties an in-flight backend call to the
/// cancellation that should abort it.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub segment: PendingSegment,
    pub target_language: LanguageSelector,
    pub correlation: Uuid,
}

impl TranslationRequest {
    pub fn new(segment: PendingSegment, target_language: LanguageSelector) -> Self {
        Self {
            segment,
            target_language,
            correlation: Uuid::new_v4(),
        }
    }
}

/// Request body accepted by the relay endpoint.
///
/// Serializes as `{ "type": "translate", "payload": { ... } }`, matching
/// the contract the web client already speaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum RelayRequest {
    Translate(TranslatePayload),
    Summarize(SummarizePayload),
}

/// Payload of a `translate` relay request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatePayload {
    pub text: String,
    #[serde(rename = "targetLang", default)]
    pub target_lang: LanguageSelector,
}

/// Payload of a `summarize` relay request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizePayload {
    pub text: String,
}

/// Non-streaming success body returned by the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayResult {
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<String>,
}

/// JSON error body used for every non-2xx relay response and for
/// mid-stream error frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayErrorBody {
    pub error: String,
}

impl RelayErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Literal payload of the frame that terminates a translation stream.
pub const STREAM_DONE: &str = "[DONE]";

/// One framed event of a streamed translation response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

impl StreamFrame {
    /// Frame carrying one incremental text token.
    pub fn token(content: impl Into<String>) -> Self {
        Self {
            choices: vec![StreamChoice {
                delta: StreamDelta {
                    content: Some(content.into()),
                },
                detected_language: None,
            }],
            error: None,
        }
    }

    /// Frame announcing the detected source language (empty delta).
    pub fn detected_language(language: impl Into<String>) -> Self {
        Self {
            choices: vec![StreamChoice {
                delta: StreamDelta {
                    content: Some(String::new()),
                },
                detected_language: Some(language.into()),
            }],
            error: None,
        }
    }

    /// Frame signalling a mid-stream failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            choices: Vec::new(),
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_selector_codes_round_trip() {
        for lang in LanguageSelector::ALL {
            assert_eq!(LanguageSelector::from_code(lang.code()), Some(lang));
        }
        assert_eq!(LanguageSelector::from_code("de"), None);
    }

    #[test]
    fn test_translate_request_wire_shape() {
        let request = RelayRequest::Translate(TranslatePayload {
            text: "Bonjour à tous.".to_string(),
            target_lang: LanguageSelector::En,
        });

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "translate",
                "payload": { "text": "Bonjour à tous.", "targetLang": "en" }
            })
        );
    }

    #[test]
    fn test_translate_request_defaults_to_auto() {
        let parsed: RelayRequest =
            serde_json::from_str(r#"{ "type": "translate", "payload": { "text": "hola" } }"#)
                .unwrap();

        match parsed {
            RelayRequest::Translate(payload) => {
                assert_eq!(payload.target_lang, LanguageSelector::Auto);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_target_language_is_rejected() {
        let parsed: Result<RelayRequest, _> = serde_json::from_str(
            r#"{ "type": "translate", "payload": { "text": "x", "targetLang": "de" } }"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_summarize_request_wire_shape() {
        let parsed: RelayRequest =
            serde_json::from_str(r#"{ "type": "summarize", "payload": { "text": "transcript" } }"#)
                .unwrap();
        assert!(matches!(parsed, RelayRequest::Summarize(p) if p.text == "transcript"));
    }

    #[test]
    fn test_stream_frame_token_shape() {
        let frame = StreamFrame::token("Hello");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["choices"][0]["delta"]["content"], "Hello");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_stream_frame_parses_upstream_shape() {
        // The upstream completion API sends extra fields we do not care about.
        let frame: StreamFrame = serde_json::from_str(
            r#"{"id":"cmpl-1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":" test."},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(frame.choices[0].delta.content.as_deref(), Some(" test."));
    }

    #[test]
    fn test_detected_language_frame_has_empty_delta() {
        let frame = StreamFrame::detected_language("français");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["choices"][0]["delta"]["content"], "");
        assert_eq!(json["choices"][0]["detected_language"], "français");
    }
}

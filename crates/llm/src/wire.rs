//! JSON shapes of the Ollama chat API.
//!
//! Reference: <https://github.com/ollama/ollama/blob/main/docs/api.md#generate-a-chat-completion>

use protocol::{AggregateResponse, ChatPayload, InferenceError, UsageStats};
use serde::{Deserialize, Serialize};

/// Body of `POST /api/chat`.
#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<WireMessage<'a>>,
    pub stream: bool,
    #[serde(skip_serializing_if = "EngineOptions::is_empty")]
    pub options: EngineOptions,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

/// Sampling options in the engine's own vocabulary.
#[derive(Debug, Default, Serialize)]
pub(crate) struct EngineOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl EngineOptions {
    fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.top_p.is_none()
            && self.num_predict.is_none()
            && self.stop.is_empty()
            && self.seed.is_none()
    }
}

impl<'a> ChatRequest<'a> {
    /// Builds the engine request; `payload.options.model` wins over `default_model`.
    pub fn from_payload(payload: &'a ChatPayload, default_model: &'a str, stream: bool) -> Self {
        let options = &payload.options;
        Self {
            model: options.model.as_deref().unwrap_or(default_model),
            messages: payload
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream,
            options: EngineOptions {
                temperature: options.temperature,
                top_p: options.top_p,
                num_predict: options.max_tokens,
                stop: options.stop.clone(),
                seed: options.seed,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

/// One response object: the whole body when not streaming, one line otherwise.
#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

impl ChatResponse {
    pub fn into_aggregate(self) -> Result<AggregateResponse, InferenceError> {
        if let Some(error) = self.error {
            return Err(InferenceError::stream_decode_msg(format!(
                "engine reported an error: {error}"
            )));
        }
        let usage = (self.prompt_eval_count.is_some() || self.eval_count.is_some()).then(|| {
            UsageStats {
                prompt_tokens: self.prompt_eval_count.unwrap_or(0),
                completion_tokens: self.eval_count.unwrap_or(0),
            }
        });
        Ok(AggregateResponse {
            content: self.message.map(|m| m.content).unwrap_or_default(),
            finish_reason: self.done_reason,
            usage,
        })
    }
}

/// What one streamed line means for the fragment stream.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct StreamLine {
    /// Non-empty content carried by this line.
    pub fragment: Option<String>,
    /// The engine marked this line as the last one.
    pub done: bool,
}

/// Parses one NDJSON line of a streaming response.
pub(crate) fn parse_stream_line(line: &str) -> Result<StreamLine, InferenceError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(StreamLine {
            fragment: None,
            done: false,
        });
    }

    let response: ChatResponse = serde_json::from_str(line)
        .map_err(|e| InferenceError::stream_decode("malformed stream line", e))?;
    if let Some(error) = response.error {
        return Err(InferenceError::stream_decode_msg(format!(
            "engine reported an error mid-stream: {error}"
        )));
    }

    Ok(StreamLine {
        fragment: response
            .message
            .map(|m| m.content)
            .filter(|content| !content.is_empty()),
        done: response.done,
    })
}

/// Extracts `{"error": "..."}` from an error body, falling back to the raw text.
pub(crate) fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error,
        Err(_) if body.trim().is_empty() => "no response body".to_string(),
        Err(_) => body.trim().to_string(),
    }
}

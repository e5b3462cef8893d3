//! [`InferenceClient`] for Ollama's `/api/chat` endpoint.

use std::io;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use protocol::{ChatPayload, FragmentStream, InferenceClient, InferenceError, InferenceOutput};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::config::OllamaConfig;
use crate::error::LlmError;
use crate::wire::{self, ChatRequest, ChatResponse};

/// HTTP client for an Ollama-compatible engine.
///
/// Cheap to share behind an `Arc`; the underlying connection pool is reused
/// across requests.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    chat_url: String,
    config: OllamaConfig,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig) -> Result<Self, LlmError> {
        let base = config.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(LlmError::InvalidBaseUrl {
                url: config.base_url.clone(),
            });
        }
        if config.default_model.trim().is_empty() {
            return Err(LlmError::EmptyModel);
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(LlmError::HttpClient)?;

        Ok(Self {
            http,
            chat_url: config.chat_url(),
            config,
        })
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    async fn send(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response, InferenceError> {
        let response = self
            .http
            .post(&self.chat_url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // Best effort: the status alone is enough to classify the failure.
        let text = response.text().await.unwrap_or_default();
        let message = wire::error_message(&text);
        warn!(status = status.as_u16(), %message, "engine rejected chat request");
        Err(InferenceError::HttpStatus {
            status: status.as_u16(),
            message,
        })
    }

    fn send_error(&self, err: reqwest::Error) -> InferenceError {
        if err.is_builder() {
            return InferenceError::Internal {
                message: "failed to build chat request".to_string(),
                source: Some(Box::new(err)),
            };
        }
        let message = if err.is_timeout() {
            format!("timed out reaching inference engine at {}", self.chat_url)
        } else {
            format!("failed to reach inference engine at {}", self.chat_url)
        };
        InferenceError::connection(message, err)
    }
}

#[async_trait]
impl InferenceClient for OllamaClient {
    async fn invoke(
        &self,
        payload: &ChatPayload,
        streaming: bool,
    ) -> Result<InferenceOutput, InferenceError> {
        let body = ChatRequest::from_payload(payload, &self.config.default_model, streaming);
        debug!(
            model = body.model,
            streaming,
            messages = body.messages.len(),
            "sending chat request"
        );

        let response = self.send(&body).await?;

        if streaming {
            return Ok(InferenceOutput::Stream(fragment_stream(
                response,
                self.config.max_line_bytes,
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| InferenceError::connection("failed to read engine response body", e))?;
        let parsed: ChatResponse = serde_json::from_slice(&bytes)
            .map_err(|e| InferenceError::stream_decode("malformed engine response body", e))?;
        Ok(InferenceOutput::Aggregate(parsed.into_aggregate()?))
    }
}

// ---------------------------------------------------------------------------
// Streaming body
// ---------------------------------------------------------------------------

/// Turns an NDJSON response body into a stream of non-empty content deltas.
///
/// The stream ends cleanly on the line marked `done`. Running out of body
/// before that line is a decode failure; the stream yields at most one error
/// and then ends.
fn fragment_stream(response: reqwest::Response, max_line_bytes: usize) -> FragmentStream {
    let body = StreamReader::new(response.bytes_stream().map_err(io::Error::other).boxed());
    let lines = FramedRead::new(body, LinesCodec::new_with_max_length(max_line_bytes));

    stream::unfold(Some(lines), move |state| async move {
        let mut lines = state?;
        loop {
            let line = match lines.next().await {
                Some(Ok(line)) => line,
                Some(Err(err)) => return Some((Err(line_error(err, max_line_bytes)), None)),
                None => {
                    let err = InferenceError::stream_decode_msg(
                        "engine stream ended before completion was reported",
                    );
                    return Some((Err(err), None));
                }
            };

            match wire::parse_stream_line(&line) {
                Err(err) => return Some((Err(err), None)),
                Ok(parsed) if parsed.done => return parsed.fragment.map(|text| (Ok(text), None)),
                Ok(parsed) => {
                    if let Some(text) = parsed.fragment {
                        return Some((Ok(text), Some(lines)));
                    }
                }
            }
        }
    })
    .boxed()
}

fn line_error(err: LinesCodecError, max_line_bytes: usize) -> InferenceError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => InferenceError::stream_decode_msg(format!(
            "engine stream line exceeded {max_line_bytes} bytes"
        )),
        LinesCodecError::Io(err) if err.kind() == io::ErrorKind::InvalidData => {
            InferenceError::stream_decode("engine stream was not valid UTF-8", err)
        }
        LinesCodecError::Io(err) => InferenceError::connection("engine stream interrupted", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use protocol::ErrorKind;

    #[test]
    fn test_rejects_non_http_base_url() {
        let config = OllamaConfig {
            base_url: "127.0.0.1:11434".into(),
            ..OllamaConfig::default()
        };
        assert!(matches!(
            OllamaClient::new(config),
            Err(LlmError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn test_rejects_blank_model() {
        let config = OllamaConfig {
            default_model: "  ".into(),
            ..OllamaConfig::default()
        };
        assert!(matches!(OllamaClient::new(config), Err(LlmError::EmptyModel)));
    }

    #[test]
    fn test_line_errors_are_classified() {
        assert_eq!(
            line_error(LinesCodecError::MaxLineLengthExceeded, 8).kind(),
            ErrorKind::StreamDecodeError
        );
        let utf8 = io::Error::new(io::ErrorKind::InvalidData, "bad utf-8");
        assert_eq!(
            line_error(LinesCodecError::Io(utf8), 8).kind(),
            ErrorKind::StreamDecodeError
        );
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(
            line_error(LinesCodecError::Io(reset), 8).kind(),
            ErrorKind::ConnectionError
        );
    }
}

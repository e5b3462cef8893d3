//! Connection settings for the Ollama-compatible engine.

use std::time::Duration;

/// Where the engine lives and how to talk to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OllamaConfig {
    /// Base URL without the `/api/...` suffix, e.g. `http://127.0.0.1:11434`.
    pub base_url: String,
    /// Model used when a request does not name one.
    pub default_model: String,
    /// Upper bound on establishing the TCP/TLS connection.
    pub connect_timeout: Duration,
    /// Longest single NDJSON line accepted from a streaming response.
    pub max_line_bytes: usize,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            default_model: "llama3.2".to_string(),
            connect_timeout: Duration::from_secs(5),
            max_line_bytes: 1024 * 1024,
        }
    }
}

impl OllamaConfig {
    pub(crate) fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url_ignores_trailing_slash() {
        let mut config = OllamaConfig::default();
        assert_eq!(config.chat_url(), "http://127.0.0.1:11434/api/chat");
        config.base_url = "http://engine:8080/".to_string();
        assert_eq!(config.chat_url(), "http://engine:8080/api/chat");
    }
}

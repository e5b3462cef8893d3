//! Command-line and environment configuration.

use std::time::Duration;

use bridge::DispatcherConfig;
use clap::{Parser, ValueEnum};
use llm::OllamaConfig;
use transport::WorkerConfig;

/// Serves LLM inference requests over stdin/stdout.
///
/// Control messages are read from stdin and events are written to stdout,
/// one JSON object per line. Logs go to stderr.
#[derive(Debug, Parser)]
#[command(name = "llm-bridge-worker", version)]
pub struct WorkerArgs {
    /// Base URL of the Ollama-compatible inference engine.
    #[arg(long, env = "LLM_BRIDGE_ENGINE_URL", default_value = "http://127.0.0.1:11434")]
    pub engine_url: String,

    /// Model used when a request does not name one.
    #[arg(long, env = "LLM_BRIDGE_MODEL", default_value = "llama3.2")]
    pub model: String,

    #[arg(long, env = "LLM_BRIDGE_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Capacity of the bounded event channel (at least 1).
    #[arg(long, env = "LLM_BRIDGE_EVENT_BUFFER", default_value_t = 64, value_parser = positive)]
    pub event_buffer: usize,

    /// Longest control line accepted, in bytes.
    #[arg(long, env = "LLM_BRIDGE_MAX_FRAME_BYTES", default_value_t = 1024 * 1024, value_parser = positive)]
    pub max_frame_bytes: usize,

    /// How long shutdown waits for cancelled requests to report.
    #[arg(long, env = "LLM_BRIDGE_CANCEL_GRACE_MS", default_value_t = 2000)]
    pub cancel_grace_ms: u64,

    #[arg(long, env = "LLM_BRIDGE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// OTLP/gRPC collector endpoint; tracing export is off when unset.
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl WorkerArgs {
    pub fn ollama_config(&self) -> OllamaConfig {
        OllamaConfig {
            base_url: self.engine_url.clone(),
            default_model: self.model.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..OllamaConfig::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            dispatcher: DispatcherConfig {
                event_buffer: self.event_buffer,
                cancel_grace: Duration::from_millis(self.cancel_grace_ms),
            },
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

fn positive(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn test_command_definition_is_valid() {
        WorkerArgs::command().debug_assert();
    }

    #[test]
    fn test_flags_map_onto_library_configs() {
        let args = WorkerArgs::try_parse_from([
            "llm-bridge-worker",
            "--engine-url",
            "http://engine:8080",
            "--model",
            "qwen2.5",
            "--connect-timeout-ms",
            "250",
            "--event-buffer",
            "8",
            "--max-frame-bytes",
            "4096",
            "--cancel-grace-ms",
            "500",
            "--log-format",
            "pretty",
        ])
        .unwrap();

        let ollama = args.ollama_config();
        assert_eq!(ollama.base_url, "http://engine:8080");
        assert_eq!(ollama.default_model, "qwen2.5");
        assert_eq!(ollama.connect_timeout, Duration::from_millis(250));

        let worker = args.worker_config();
        assert_eq!(worker.dispatcher.event_buffer, 8);
        assert_eq!(worker.dispatcher.cancel_grace, Duration::from_millis(500));
        assert_eq!(worker.max_frame_bytes, 4096);
        assert_eq!(args.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_zero_event_buffer_is_rejected() {
        let result = WorkerArgs::try_parse_from(["llm-bridge-worker", "--event-buffer", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_positive_parser() {
        assert_eq!(positive("3"), Ok(3));
        assert!(positive("0").is_err());
        assert!(positive("-1").is_err());
    }
}

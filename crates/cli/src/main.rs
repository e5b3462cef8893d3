//! LLM bridge worker entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration** from flags and `LLM_BRIDGE_*` environment
//!    variables.
//! 2. **Wire observability**: `tracing-subscriber` to stderr, plus an
//!    OpenTelemetry OTLP exporter when an endpoint is given.
//! 3. **Construct infrastructure**: the [`llm::OllamaClient`] that backs every
//!    request.
//! 4. **Serve** control messages from stdin and write events to stdout until
//!    stdin closes, then drain and exit.

mod config;
mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use llm::OllamaClient;
use protocol::WorkerSessionId;
use tracing::{error, info, info_span, Instrument};

use crate::config::WorkerArgs;
use crate::telemetry::Telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = WorkerArgs::parse();
    let telemetry = Telemetry::init(args.log_format, args.otlp_endpoint.as_deref())?;

    let result = run(&args).await;
    if let Err(err) = &result {
        error!("worker failed: {err:#}");
    }

    telemetry.shutdown();
    result
}

async fn run(args: &WorkerArgs) -> anyhow::Result<()> {
    let session = WorkerSessionId::new_random();
    let span = info_span!("worker", session_id = %session);

    async {
        let client =
            OllamaClient::new(args.ollama_config()).context("invalid engine configuration")?;
        info!(
            engine_url = %client.config().base_url,
            model = %client.config().default_model,
            version = env!("CARGO_PKG_VERSION"),
            "worker starting"
        );

        let summary = transport::serve(
            tokio::io::stdin(),
            tokio::io::stdout(),
            Arc::new(client),
            args.worker_config(),
        )
        .await
        .context("control channel failed")?;

        info!(
            accepted = summary.accepted,
            rejected = summary.rejected,
            "worker exiting"
        );
        Ok(())
    }
    .instrument(span)
    .await
}

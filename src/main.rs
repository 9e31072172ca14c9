//! # Completion Gateway
//!
//! Loopback driver for the gateway's reliable-delivery and admission core.
//!
//! Reads newline-delimited JSON frames from stdin, runs them through frame
//! processing and admission control against a local echo backend, and
//! writes control frames and completions to stdout as NDJSON. Logs go to
//! stderr.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults, or config/gateway.yaml when present
//! completion-gateway < frames.ndjson
//!
//! # Custom config file and verbose logging
//! completion-gateway --config gateway.toml --log-level debug < frames.ndjson
//!
//! # Environment overrides
//! GATEWAY_SCHEDULER_CAPACITY=2 completion-gateway < frames.ndjson
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use gateway_config::ConfigLoader;
use gateway_core::{
    CompletionBackend, CompletionRequest, CompletionResponse, Frame, GatewayResult, Usage,
};
use gateway_ingress::{AdmissionCore, DispatchOutcome};
use gateway_telemetry::init_logging;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

/// Cost of one echoed token in micro-dollars
const ECHO_USD_MICROS_PER_TOKEN: u64 = 2;

/// Completion gateway loopback driver
#[derive(Parser, Debug)]
#[command(name = "completion-gateway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level directive, overrides the configured level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print a gateway snapshot to stdout at end of input
    #[arg(long)]
    snapshot: bool,

    /// Interval between idle-state sweeps
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    purge_interval: Duration,
}

/// Backend that answers with the request's own payloads
struct EchoBackend;

#[async_trait]
impl CompletionBackend for EchoBackend {
    fn id(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: CompletionRequest) -> GatewayResult<CompletionResponse> {
        let content: Vec<_> = request.payloads.iter().map(|p| p.content.clone()).collect();
        let chars: usize = content.iter().map(|c| c.to_string().len()).sum();
        let tokens = (chars as u64).div_ceil(4).max(1);
        Ok(CompletionResponse {
            key: request.key,
            content: json!(content),
            usage: Usage::new(tokens, tokens * ECHO_USD_MICROS_PER_TOKEN),
        })
    }
}

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("completion-gateway: {e:#}");
        std::process::exit(1);
    }
}

/// Main application logic
async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load().context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging).context("Failed to initialize logging")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting completion gateway loopback"
    );

    let core = AdmissionCore::from_config(&config, Arc::new(EchoBackend));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut purge = tokio::time::interval(cli.purge_interval);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                for record in handle_line(&core, &line).await {
                    write_record(&mut stdout, &record).await?;
                }
            }
            _ = purge.tick() => {
                let purged = core.purge_idle();
                if purged > 0 {
                    info!(purged, "Discarded idle message and session state");
                }
            }
        }
    }

    if cli.snapshot {
        let snapshot = serde_json::to_value(core.snapshot())?;
        write_record(&mut stdout, &json!({ "type": "SNAPSHOT", "snapshot": snapshot })).await?;
    }
    stdout.flush().await?;
    info!("Input closed, shutting down");
    Ok(())
}

/// Turn one input line into output records
async fn handle_line(core: &AdmissionCore, line: &str) -> Vec<serde_json::Value> {
    let frame = match Frame::from_json(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Rejected inbound frame");
            return vec![json!({ "type": "ERROR", "message": e.to_string() })];
        }
    };

    let handled = match core.handle_frame(&frame).await {
        Ok(handled) => handled,
        Err(e) => {
            warn!(error = %e, session = %frame.session_id, "Rejected inbound frame");
            return vec![json!({ "type": "ERROR", "message": e.to_string() })];
        }
    };
    let mut records = Vec::with_capacity(handled.controls.len() + 2);
    for control in &handled.controls {
        match serde_json::to_value(control) {
            Ok(value) => records.push(value),
            Err(e) => warn!(error = %e, kind = control.kind(), "Dropping unencodable control frame"),
        }
    }
    if handled.burn_rate_spike {
        records.push(json!({
            "type": "ANOMALY",
            "session_id": frame.session_id,
            "msg_seq": frame.msg_seq,
        }));
    }

    match handled.outcome {
        Some(DispatchOutcome::Completed(response)) => records.push(json!({
            "type": "COMPLETION",
            "key": response.key,
            "content": response.content,
            "usage": response.usage,
        })),
        Some(DispatchOutcome::Throttled(reason)) => records.push(json!({
            "type": "THROTTLED",
            "session_id": frame.session_id,
            "msg_seq": frame.msg_seq,
            "reason": reason,
            "message": reason.to_string(),
        })),
        Some(DispatchOutcome::Failed(error)) => records.push(json!({
            "type": "FAILED",
            "session_id": frame.session_id,
            "msg_seq": frame.msg_seq,
            "message": error.to_string(),
        })),
        None => {}
    }
    records
}

async fn write_record(stdout: &mut tokio::io::Stdout, record: &serde_json::Value) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    Ok(())
}

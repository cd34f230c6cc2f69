// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, OutputFormatArg};
use muxi_mcp::CancelToken;
use muxi_orchestrator::{ChatRequest, Orchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Some(Commands::Completions { shell }) => {
            cli::print_completions(*shell);
            return Ok(());
        }
        Some(Commands::ShowConfig) => {
            let config = muxi_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            return Ok(());
        }
        Some(Commands::Chat { message, user_id, agent, conversation_id, output_format }) => {
            let config = Arc::new(muxi_config::load(cli.config.as_deref())?);
            let orchestrator = Orchestrator::new(config).await.context("building orchestrator")?;
            run_chat(&orchestrator, message, *user_id, agent.as_deref(), conversation_id.as_deref(), *output_format).await
        }
        Some(Commands::Serve { user_id, agent }) => {
            let config = Arc::new(muxi_config::load(cli.config.as_deref())?);
            let orchestrator = Orchestrator::new(config).await.context("building orchestrator")?;
            run_serve(&orchestrator, *user_id, agent.as_deref()).await
        }
        None => {
            Cli::parse_from(["muxi", "--help"]);
            Ok(())
        }
    }
}

/// `muxi chat <message>` (spec §6 `chat`): run exactly one turn, print the
/// result, and exit.
async fn run_chat(
    orchestrator: &Orchestrator,
    message: &str,
    user_id: u64,
    agent: Option<&str>,
    conversation_id: Option<&str>,
    output_format: OutputFormatArg,
) -> anyhow::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);

    let print_events = matches!(output_format, OutputFormatArg::Jsonl);
    let stdout = io::stdout();
    let drain = tokio::spawn(async move {
        let mut out = stdout.lock();
        while let Some(event) = rx.recv().await {
            if print_events {
                let _ = writeln!(out, "{}", serde_json::to_string(&JsonEvent::from(&event)).unwrap_or_default());
            }
        }
    });

    let result = orchestrator
        .chat(ChatRequest {
            message,
            user_id,
            agent_id: agent,
            conversation_id,
            stream_sink: tx,
            cancel: CancelToken::never(),
        })
        .await;
    let _ = drain.await;

    match result {
        Ok(outcome) => {
            match output_format {
                OutputFormatArg::Text => println!("{}", outcome.reply),
                OutputFormatArg::Json => println!(
                    "{}",
                    serde_json::json!({
                        "reply": outcome.reply,
                        "tool_rounds": outcome.tool_rounds,
                        "trace_id": outcome.trace_id,
                    })
                ),
                OutputFormatArg::Jsonl => {}
            }
            Ok(())
        }
        Err(e) => anyhow::bail!("{e}"),
    }
}

/// `muxi serve` (no HTTP router per spec §1 non-goals): a stdin/stdout REPL
/// over the same orchestrator, one line in, one reply out, all turns sharing
/// `user_id`/`agent` and a fixed conversation id so Buffer Memory
/// accumulates across the session.
async fn run_serve(orchestrator: &Orchestrator, user_id: u64, agent: Option<&str>) -> anyhow::Result<()> {
    let conversation_id = uuid::Uuid::new_v4().to_string();
    println!("muxi serve — conversation {conversation_id}. One message per line; Ctrl-D to exit.");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush().ok();
        let Some(line) = lines.next() else { break };
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let print_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let muxi_core::TurnEvent::Token(text) = event {
                    print!("{text}");
                    io::stdout().flush().ok();
                }
            }
            println!();
        });

        let result = orchestrator
            .chat(ChatRequest {
                message: &line,
                user_id,
                agent_id: agent,
                conversation_id: Some(&conversation_id),
                stream_sink: tx,
                cancel: CancelToken::never(),
            })
            .await;
        let _ = print_task.await;

        if let Err(e) = result {
            eprintln!("error: {e}");
        }
    }

    orchestrator.shutdown(std::time::Duration::from_secs(5)).await;
    Ok(())
}

/// JSON rendering of [`muxi_core::TurnEvent`] for `--output-format jsonl`
/// (spec §6 stream event union).
#[derive(serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JsonEvent {
    Token { text: String },
    ToolCallStart { id: String, name: String },
    ToolCallResult { id: String, is_error: bool },
    Done { tool_rounds: u32, trace_id: String },
    Error { kind: String, message: String },
}

impl From<&muxi_core::TurnEvent> for JsonEvent {
    fn from(event: &muxi_core::TurnEvent) -> Self {
        match event {
            muxi_core::TurnEvent::Token(text) => JsonEvent::Token { text: text.clone() },
            muxi_core::TurnEvent::ToolCallStart { id, name } => JsonEvent::ToolCallStart { id: id.clone(), name: name.clone() },
            muxi_core::TurnEvent::ToolCallResult { id, is_error } => JsonEvent::ToolCallResult { id: id.clone(), is_error: *is_error },
            muxi_core::TurnEvent::Done { tool_rounds, trace_id } => JsonEvent::Done { tool_rounds: *tool_rounds, trace_id: trace_id.clone() },
            muxi_core::TurnEvent::Error { kind, message } => JsonEvent::Error { kind: kind.clone(), message: message.clone() },
        }
    }
}

/// Tracing setup: `RUST_LOG` drives the filter; default to `info` with `-v`
/// bumping to `debug` and `-vv` to `trace` (grounded on the teacher's
/// `init_logging`, minus the TUI-vs-headless stderr-corruption workaround
/// this binary has no TUI mode to trip over).
fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry().with(fmt::layer().with_target(true)).with(filter).try_init();
}

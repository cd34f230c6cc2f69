// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

/// Output format for a one-shot `muxi chat` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormatArg {
    /// Only the final assistant reply, newline-terminated.
    #[default]
    Text,
    /// `{reply, tool_rounds, trace_id}` as a single JSON object.
    Json,
    /// One JSON-encoded `TurnEvent` per line, as they stream.
    Jsonl,
}

#[derive(Parser, Debug)]
#[command(
    name = "muxi",
    about = "A multi-agent orchestration runtime",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to config file (overrides auto-discovery).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one message through the orchestrator and print the reply.
    Chat {
        /// The message to send.
        message: String,
        /// User id for memory/Memobase scoping (0 = anonymous; the default).
        #[arg(long, default_value_t = 0)]
        user_id: u64,
        /// Pin routing to this agent id instead of letting Routing decide.
        #[arg(long)]
        agent: Option<String>,
        /// Conversation id, for Buffer Memory scoping across calls.
        #[arg(long)]
        conversation_id: Option<String>,
        /// Output format.
        #[arg(long, value_enum, default_value = "text")]
        output_format: OutputFormatArg,
    },

    /// Run an interactive loop: read messages from stdin, print replies to
    /// stdout. Every line is one turn against the same `conversation_id`.
    Serve {
        /// User id for the whole session (0 = anonymous).
        #[arg(long, default_value_t = 0)]
        user_id: u64,
        /// Pin routing to this agent id instead of letting Routing decide.
        #[arg(long)]
        agent: Option<String>,
    },

    /// Print the effective configuration and exit.
    ShowConfig,

    /// Generate a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "muxi", &mut std::io::stdout());
}

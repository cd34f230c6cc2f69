// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Command (subprocess stdio) MCP transport (spec §4.3, §6): JSON-RPC
//! frames exchanged one-per-line over the child's stdin/stdout.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PendingMap, WriteHalf};
use crate::rpc::RpcResponse;

pub(crate) async fn connect(command_line: &[String], pending: PendingMap) -> anyhow::Result<(WriteHalf, JoinHandle<()>)> {
    let Some((program, args)) = command_line.split_first() else {
        anyhow::bail!("empty command_line");
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    let stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("failed to open child stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("failed to open child stdout"))?;

    let write = WriteHalf::Command { stdin };

    let demux = tokio::spawn(async move {
        // Own the child so it is killed if the demultiplexer task is
        // aborted (connection close / service shutdown).
        let mut child = child;
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<RpcResponse>(&line) {
                        Ok(resp) => super::deliver(&pending, resp),
                        Err(e) => warn!(error = %e, line, "unparseable JSON-RPC line from subprocess"),
                    }
                }
                Ok(None) => {
                    debug!("subprocess stdout closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "error reading subprocess stdout");
                    break;
                }
            }
        }
        let _ = child.kill().await;
    });

    Ok((write, demux))
}

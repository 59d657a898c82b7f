//! JSON-lines tool host
//!
//! Each input line is `{"tool": "<name>", "args": {...}}`; each output line
//! is `{"ok": bool, "text": "..."}`. Tools map one-to-one onto
//! [`TmuxControlClient`] operations.

use anyhow::Context;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tmuxctl_core::{PaneDescriptor, TmuxControlClient};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolResponse {
    pub ok: bool,
    pub text: String,
}

impl ToolResponse {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            ok: true,
            text: text.into(),
        }
    }

    fn error(text: impl Into<String>) -> Self {
        Self {
            ok: false,
            text: text.into(),
        }
    }
}

#[derive(Deserialize)]
struct ConnectArgs {
    session: Option<String>,
}

#[derive(Deserialize)]
struct CommandArgs {
    command: String,
}

#[derive(Deserialize)]
struct ListPanesArgs {
    target: Option<String>,
}

#[derive(Deserialize)]
struct SendKeysArgs {
    pane_id: String,
    keys: String,
}

#[derive(Deserialize)]
struct CapturePaneArgs {
    pane_id: String,
    lines: Option<u32>,
}

#[derive(Deserialize)]
struct WaitArgs {
    pane_id: String,
    pattern: String,
    /// Milliseconds
    timeout: Option<u64>,
}

/// Run one tool call. Failures become `ok: false` responses.
pub async fn dispatch(client: &TmuxControlClient, request: ToolRequest) -> ToolResponse {
    tracing::debug!(tool = %request.tool, "Tool call");
    match call(client, request).await {
        Ok(text) => ToolResponse::ok(text),
        Err(e) => ToolResponse::error(format!("Error: {e:#}")),
    }
}

async fn call(client: &TmuxControlClient, request: ToolRequest) -> anyhow::Result<String> {
    let args = request.args;
    match request.tool.as_str() {
        "tmux_control_connect" => {
            let args: ConnectArgs = parse_args(args)?;
            if client.is_connected() {
                return Ok("Already connected".to_string());
            }
            client.connect(args.session.as_deref()).await?;
            Ok("Connected to tmux control mode".to_string())
        }
        "tmux_control_disconnect" => {
            if !client.is_connected() {
                return Ok("Not connected".to_string());
            }
            client.disconnect().await;
            Ok("Disconnected".to_string())
        }
        "tmux_control_command" => {
            let args: CommandArgs = parse_args(args)?;
            let result = client.run_command(&args.command).await?;
            Ok(or_placeholder(result.output(), "(no output)"))
        }
        "tmux_control_list_sessions" => {
            let sessions = client.list_sessions().await?;
            Ok(or_placeholder(sessions.join("\n"), "(no sessions)"))
        }
        "tmux_control_list_panes" => {
            let args: ListPanesArgs = parse_args(args)?;
            let panes = client.list_panes(args.target.as_deref()).await?;
            let lines: Vec<String> = panes.iter().map(format_pane).collect();
            Ok(or_placeholder(lines.join("\n"), "(no panes)"))
        }
        "tmux_control_send_keys" => {
            let args: SendKeysArgs = parse_args(args)?;
            client.send_keys(&args.pane_id, &args.keys).await?;
            Ok(format!("Keys sent to {}", args.pane_id))
        }
        "tmux_control_capture_pane" => {
            let args: CapturePaneArgs = parse_args(args)?;
            let content = client.capture_pane(&args.pane_id, args.lines).await?;
            Ok(or_placeholder(content, "(empty)"))
        }
        "tmux_control_wait_for_output" => {
            let args: WaitArgs = parse_args(args)?;
            let pattern = Regex::new(&args.pattern).with_context(|| format!("invalid pattern `{}`", args.pattern))?;
            let timeout = args.timeout.map(Duration::from_millis);
            Ok(client.wait_for_output(&args.pane_id, &pattern, timeout).await?)
        }
        "tmux_control_status" => Ok(serde_json::to_string_pretty(&client.status())?),
        other => anyhow::bail!("Unknown tool: {}", other),
    }
}

fn parse_args<T: DeserializeOwned>(args: Value) -> anyhow::Result<T> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).context("invalid arguments")
}

fn or_placeholder(text: String, placeholder: &str) -> String {
    if text.is_empty() {
        placeholder.to_string()
    } else {
        text
    }
}

pub fn format_pane(pane: &PaneDescriptor) -> String {
    format!("{}\t{}\t{}", pane.id, pane.command, pane.path)
}

/// Answer tool calls from `input` until it closes, then disconnect.
pub async fn serve<R, W>(client: &TmuxControlClient, input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ToolRequest>(&line) {
            Ok(request) => dispatch(client, request).await,
            Err(e) => ToolResponse::error(format!("Error: invalid request: {e}")),
        };

        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        output.write_all(encoded.as_bytes()).await?;
        output.flush().await?;
    }

    client.disconnect().await;
    Ok(())
}

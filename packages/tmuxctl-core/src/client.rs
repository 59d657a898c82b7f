//! High-level tmux control client
//!
//! [`TmuxControlClient`] owns at most one control mode connection and turns
//! the protocol pieces into plain async calls: run a command, list sessions
//! and panes, send keys, capture a pane, wait for output.

use regex::Regex;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::control_mode::{
    self, wait_for_match, CommandResult, ConnectionHandle, ConnectionState, EventFilter, PaneOutputAccumulator,
    Subscription,
};
use crate::error::{ControlError, Result};
use crate::normalize::strip_ansi;

/// Format used for `list-panes`; fields are split on the first two colons.
pub const PANE_FORMAT: &str = "#{pane_id}:#{pane_current_command}:#{pane_current_path}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaneDescriptor {
    /// Pane id such as `%3`
    pub id: String,
    pub command: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub state: ConnectionState,
    pub session: Option<String>,
    pub pending_commands: usize,
}

/// Client for one tmux control mode connection.
///
/// Every operation other than `connect`/`disconnect`/`status` needs a live
/// connection and fails with [`ControlError::NotConnected`] otherwise.
pub struct TmuxControlClient {
    config: ClientConfig,
    connection: Mutex<Option<ConnectionHandle>>,
}

impl TmuxControlClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start `tmux -C`, attaching to `session` or creating a new one.
    pub async fn connect(&self, session: Option<&str>) -> Result<()> {
        self.ensure_disconnected()?;
        let handle = control_mode::open(&self.config, session).await?;
        self.install(handle).await
    }

    /// Connect over an existing byte stream pair instead of spawning tmux,
    /// e.g. `tmux -C` reached through ssh.
    pub async fn attach<R, W>(&self, reader: R, writer: W, expect_handshake: bool) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.ensure_disconnected()?;
        let handle = control_mode::start(reader, writer, None, &self.config, expect_handshake).await?;
        self.install(handle).await
    }

    /// Detach and tear the connection down. Commands and waits still in
    /// flight fail with `ConnectionClosed`. Does nothing when not connected.
    pub async fn disconnect(&self) {
        let handle = self.slot().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    pub fn status(&self) -> ClientStatus {
        match self.slot().as_ref() {
            Some(handle) => {
                let status = handle.status();
                ClientStatus {
                    state: status.state,
                    session: status.session,
                    pending_commands: status.pending_commands,
                }
            }
            None => ClientStatus {
                state: ConnectionState::Disconnected,
                session: None,
                pending_commands: 0,
            },
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status().state == ConnectionState::Connected
    }

    /// Run a raw tmux command. An `%error` answer is `CommandError`.
    pub async fn run_command(&self, command: &str) -> Result<CommandResult> {
        self.handle()?.execute(command).await
    }

    pub async fn run_command_with_timeout(&self, command: &str, timeout: Duration) -> Result<CommandResult> {
        self.handle()?.execute_with_timeout(command, timeout).await
    }

    /// Send a command and ignore its result.
    pub async fn send_command_detached(&self, command: &str) -> Result<()> {
        self.handle()?.send_detached(command).await
    }

    /// Names of all sessions on the server.
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let result = self.run_command("list-sessions -F '#{session_name}'").await?;
        Ok(result
            .lines
            .into_iter()
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Panes of `target` (a session, window or pane), or of every session.
    pub async fn list_panes(&self, target: Option<&str>) -> Result<Vec<PaneDescriptor>> {
        let command = match target {
            Some(target) => format!("list-panes -t {} -F '{}'", quote_tmux_arg(target), PANE_FORMAT),
            None => format!("list-panes -a -F '{}'", PANE_FORMAT),
        };
        let result = self.run_command(&command).await?;
        Ok(result.lines.iter().filter_map(|line| parse_pane_line(line)).collect())
    }

    /// Type `keys` into a pane. Newlines become `Enter`. Returns once tmux
    /// has accepted the keys, not when the pane has reacted to them.
    pub async fn send_keys(&self, pane_id: &str, keys: &str) -> Result<()> {
        self.run_command(&send_keys_command(pane_id, keys)).await?;
        Ok(())
    }

    /// Visible content of a pane, or the last `lines` lines of history with
    /// it, with escape sequences removed.
    pub async fn capture_pane(&self, pane_id: &str, lines: Option<u32>) -> Result<String> {
        let mut command = format!("capture-pane -p -t {}", quote_tmux_arg(pane_id));
        if let Some(lines) = lines {
            command.push_str(&format!(" -S -{lines}"));
        }
        let result = self.run_command(&command).await?;
        Ok(strip_ansi(&result.output()))
    }

    /// Wait until `pattern` matches the output a pane produces from now on.
    ///
    /// Output is decoded and stripped of escape sequences before matching.
    /// `timeout` defaults to the configured `wait_timeout_ms`.
    pub async fn wait_for_output(&self, pane_id: &str, pattern: &Regex, timeout: Option<Duration>) -> Result<String> {
        self.wait_for_output_with_cancel(pane_id, pattern, timeout, CancellationToken::new())
            .await
    }

    pub async fn wait_for_output_with_cancel(
        &self,
        pane_id: &str,
        pattern: &Regex,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let handle = self.handle()?;
        let timeout = timeout.unwrap_or_else(|| self.config.wait_timeout());
        let subscription = handle
            .subscribe(EventFilter::PaneOutput(pane_id.to_string()))
            .await?;

        tracing::debug!(pane_id, pattern = %pattern, timeout_ms = timeout.as_millis() as u64, "Waiting for output");
        let accumulator = PaneOutputAccumulator::new(pane_id, pattern.clone(), Instant::now() + timeout);
        wait_for_match(subscription, accumulator, cancel).await
    }

    /// Raw notifications as they arrive.
    pub async fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        self.handle()?.subscribe(filter).await
    }

    fn slot(&self) -> MutexGuard<'_, Option<ConnectionHandle>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self) -> Result<ConnectionHandle> {
        match self.slot().as_ref() {
            Some(handle) if handle.is_connected() => Ok(handle.clone()),
            _ => Err(ControlError::NotConnected),
        }
    }

    fn ensure_disconnected(&self) -> Result<()> {
        match self.slot().as_ref() {
            Some(handle) if handle.state() != ConnectionState::Disconnected => Err(ControlError::AlreadyConnected),
            _ => Ok(()),
        }
    }

    async fn install(&self, handle: ConnectionHandle) -> Result<()> {
        let rejected = {
            let mut slot = self.slot();
            match slot.as_ref() {
                Some(existing) if existing.state() != ConnectionState::Disconnected => Some(handle),
                _ => {
                    *slot = Some(handle);
                    None
                }
            }
        };

        // Lost a race with a concurrent connect
        if let Some(handle) = rejected {
            handle.shutdown().await;
            return Err(ControlError::AlreadyConnected);
        }
        Ok(())
    }
}

/// Quote a tmux command argument: single quotes, `'` written as `'\''`.
/// Keeps tmux from expanding `$VARS` and `#{formats}` in user text.
pub fn quote_tmux_arg(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// `send-keys` command for `keys`, one quoted argument per line with
/// `Enter` between them.
pub fn send_keys_command(pane_id: &str, keys: &str) -> String {
    let mut command = format!("send-keys -t {}", quote_tmux_arg(pane_id));
    let mut segments = keys.split('\n').peekable();
    while let Some(segment) = segments.next() {
        let segment = segment.strip_suffix('\r').unwrap_or(segment);
        if !segment.is_empty() {
            command.push(' ');
            command.push_str(&quote_tmux_arg(segment));
        }
        if segments.peek().is_some() {
            command.push_str(" Enter");
        }
    }
    command
}

/// Parse one line of [`PANE_FORMAT`] output. Paths may contain colons.
pub fn parse_pane_line(line: &str) -> Option<PaneDescriptor> {
    let mut fields = line.splitn(3, ':');
    let id = fields.next()?;
    let command = fields.next()?;
    let path = fields.next()?;
    if !id.starts_with('%') {
        tracing::debug!(line, "Skipping unexpected list-panes line");
        return None;
    }
    Some(PaneDescriptor {
        id: id.to_string(),
        command: command.to_string(),
        path: path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_tmux_arg() {
        assert_eq!(quote_tmux_arg("hello world"), "'hello world'");
        assert_eq!(quote_tmux_arg("echo $HOME #{pane_id}"), "'echo $HOME #{pane_id}'");
        assert_eq!(quote_tmux_arg("it's"), "'it'\\''s'");
        assert_eq!(quote_tmux_arg(""), "''");
    }

    #[test]
    fn test_send_keys_command() {
        assert_eq!(send_keys_command("%1", "ls -la"), "send-keys -t '%1' 'ls -la'");
        assert_eq!(send_keys_command("%1", "ls\n"), "send-keys -t '%1' 'ls' Enter");
        assert_eq!(
            send_keys_command("%2", "cd /tmp\r\npwd\n"),
            "send-keys -t '%2' 'cd /tmp' Enter 'pwd' Enter"
        );
        assert_eq!(send_keys_command("%1", "C-c"), "send-keys -t '%1' 'C-c'");
    }

    #[test]
    fn test_parse_pane_line() {
        assert_eq!(
            parse_pane_line("%3:vim:/home/me/src"),
            Some(PaneDescriptor {
                id: "%3".to_string(),
                command: "vim".to_string(),
                path: "/home/me/src".to_string(),
            })
        );
        assert_eq!(parse_pane_line("%4:bash:/mnt/c:/odd").map(|p| p.path), Some("/mnt/c:/odd".to_string()));
        assert_eq!(parse_pane_line("garbage"), None);
        assert_eq!(parse_pane_line("x:y:z"), None);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let client = TmuxControlClient::new(ClientConfig::default());
        assert!(matches!(client.run_command("list-sessions").await, Err(ControlError::NotConnected)));
        assert!(matches!(client.list_panes(None).await, Err(ControlError::NotConnected)));
        assert!(matches!(client.send_keys("%1", "x").await, Err(ControlError::NotConnected)));
        let pattern = Regex::new("x").unwrap();
        assert!(matches!(
            client.wait_for_output("%1", &pattern, None).await,
            Err(ControlError::NotConnected)
        ));
        assert_eq!(client.status().state, ConnectionState::Disconnected);

        // Idempotent when never connected
        client.disconnect().await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let config = ClientConfig {
            tmux_binary: "/nonexistent/tmux-binary".to_string(),
            ..ClientConfig::default()
        };
        let client = TmuxControlClient::new(config);
        assert!(matches!(client.connect(None).await, Err(ControlError::Spawn(_))));
        assert!(!client.is_connected());
    }
}

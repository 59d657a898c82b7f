//! Connection to a `tmux -C` process
//!
//! A single driver task per connection owns tmux's stdin, the [`Correlator`]
//! and the [`EventBus`]. It waits on three things at once: lines from the
//! reader task, requests from [`ConnectionHandle`]s, and the earliest
//! command deadline. Nothing else touches the protocol state, so there is no
//! lock around it.

use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::correlator::{CommandReply, CommandResult, Correlator, Handshake};
use super::events::{EventBus, EventFilter, Subscription};
use super::parser::{classify, ControlLine, Notification};
use super::reader::{spawn_reader_task, StreamEvent, LINE_CHANNEL_CAPACITY};
use crate::config::ClientConfig;
use crate::error::{ControlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// What the driver last published about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Attached session, from `%session-changed` / `%session-renamed`
    pub session: Option<String>,
    pub pending_commands: usize,
}

enum Request {
    Submit {
        command: String,
        timeout: Duration,
        reply: Option<CommandReply>,
    },
    Subscribe {
        filter: EventFilter,
        reply: oneshot::Sender<Subscription>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Why the driver loop stopped.
enum Exit {
    StreamClosed,
    TmuxExit(Option<String>),
    Violation(String),
    WriteFailed,
    HandshakeFailed,
    Shutdown(oneshot::Sender<()>),
    HandlesDropped,
}

/// Arguments for starting tmux in control mode.
pub fn control_mode_args(config: &ClientConfig, session: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(socket) = &config.socket_name {
        args.push("-L".to_string());
        args.push(socket.clone());
    }
    args.push("-C".to_string());
    match session {
        Some(name) => {
            args.push("attach-session".to_string());
            args.push("-t".to_string());
            args.push(name.to_string());
        }
        None => args.push("new-session".to_string()),
    }
    args
}

/// Spawn `tmux -C` and wait for it to acknowledge control mode.
pub async fn open(config: &ClientConfig, session: Option<&str>) -> Result<ConnectionHandle> {
    let args = control_mode_args(config, session);
    tracing::info!(binary = %config.tmux_binary, args = ?args, "Starting tmux control mode");

    let mut child = Command::new(&config.tmux_binary)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ControlError::Spawn(format!("{}: {}", config.tmux_binary, e)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ControlError::Spawn("stdin was not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ControlError::Spawn("stdout was not captured".to_string()))?;
    let stderr_task = child.stderr.take().map(spawn_stderr_task);

    match start(stdout, stdin, Some(child), config, true).await {
        Err(ControlError::Spawn(message)) => {
            let stderr = match stderr_task {
                Some(task) => last_stderr_line(task, config.shutdown_grace()).await,
                None => None,
            };
            Err(ControlError::Spawn(with_stderr(message, stderr)))
        }
        outcome => outcome,
    }
}

/// Run the protocol over an arbitrary byte stream pair.
///
/// With `expect_handshake`, the first block on the stream is taken as the
/// answer to tmux's startup command and this returns once it has arrived
/// (or fails after `ack_timeout`). Without it the connection is usable
/// right away.
pub async fn start<R, W>(
    reader: R,
    writer: W,
    child: Option<Child>,
    config: &ClientConfig,
    expect_handshake: bool,
) -> Result<ConnectionHandle>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let reader_task = spawn_reader_task(reader, line_tx);

    let (request_tx, request_rx) = mpsc::channel(config.request_queue_capacity.max(1));
    let (status_tx, status_rx) = watch::channel(ConnectionStatus {
        state: if expect_handshake {
            ConnectionState::Connecting
        } else {
            ConnectionState::Connected
        },
        session: None,
        pending_commands: 0,
    });

    let (ack_tx, ack_rx) = oneshot::channel();
    let (correlator, handshake) = if expect_handshake {
        (Correlator::new(), Some(ack_tx))
    } else {
        (Correlator::without_handshake(), None)
    };

    let driver = Driver {
        writer,
        lines: line_rx,
        requests: request_rx,
        correlator,
        bus: EventBus::new(),
        status: status_tx,
        handshake,
        child,
        reader_task,
        shutdown_grace: config.shutdown_grace(),
    };
    tokio::spawn(driver.run());

    let handle = ConnectionHandle {
        requests: request_tx,
        status: status_rx,
        command_timeout: config.command_timeout(),
    };

    if !expect_handshake {
        return Ok(handle);
    }

    match tokio::time::timeout(config.ack_timeout(), ack_rx).await {
        Ok(Ok(Ok(()))) => Ok(handle),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_)) => Err(ControlError::Spawn(
            "tmux exited before acknowledging control mode".to_string(),
        )),
        Err(_) => {
            handle.shutdown().await;
            Err(ControlError::Spawn(format!(
                "no control mode acknowledgment within {}ms",
                config.ack_timeout_ms
            )))
        }
    }
}

/// Forward tmux's stderr to the log. Resolves to the last non-empty line.
fn spawn_stderr_task(stderr: ChildStderr) -> JoinHandle<Option<String>> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut last = None;
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(stderr = %line, "tmux");
            if !line.trim().is_empty() {
                last = Some(line);
            }
        }
        last
    })
}

async fn last_stderr_line(task: JoinHandle<Option<String>>, wait: Duration) -> Option<String> {
    match tokio::time::timeout(wait, task).await {
        Ok(Ok(line)) => line,
        _ => None,
    }
}

fn with_stderr(message: String, stderr: Option<String>) -> String {
    match stderr {
        Some(line) if !message.contains(line.trim()) => format!("{}: {}", message, line.trim()),
        _ => message,
    }
}

/// Cloneable handle to a running connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<ConnectionStatus>,
    command_timeout: Duration,
}

impl ConnectionHandle {
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Run a command with the configured timeout.
    pub async fn execute(&self, command: &str) -> Result<CommandResult> {
        self.execute_with_timeout(command, self.command_timeout).await
    }

    pub async fn execute_with_timeout(&self, command: &str, timeout: Duration) -> Result<CommandResult> {
        let (tx, rx) = oneshot::channel();
        self.submit(command, timeout, Some(tx)).await?;
        rx.await.unwrap_or(Err(ControlError::ConnectionClosed))
    }

    /// Write a command without waiting for its result. Its block is still
    /// consumed in order.
    pub async fn send_detached(&self, command: &str) -> Result<()> {
        self.submit(command, self.command_timeout, None).await
    }

    pub async fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        self.ensure_connected()?;
        let (tx, rx) = oneshot::channel();
        self.send(Request::Subscribe { filter, reply: tx }).await?;
        rx.await.map_err(|_| ControlError::ConnectionClosed)
    }

    /// Detach from tmux and wait for the driver to finish. Safe to call in
    /// any state, any number of times.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
        self.closed().await;
    }

    /// Resolves once the connection is fully disconnected.
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|s| s.state == ConnectionState::Disconnected)
            .await;
    }

    async fn submit(&self, command: &str, timeout: Duration, reply: Option<CommandReply>) -> Result<()> {
        if command.contains(['\n', '\r']) {
            return Err(ControlError::InvalidCommand(format!(
                "line break in command {command:?}"
            )));
        }
        self.ensure_connected()?;
        self.send(Request::Submit {
            command: command.to_string(),
            timeout,
            reply,
        })
        .await
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ControlError::NotConnected)
        }
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ControlError::NotConnected)
    }
}

struct Driver<W> {
    writer: W,
    lines: mpsc::Receiver<StreamEvent>,
    requests: mpsc::Receiver<Request>,
    correlator: Correlator,
    bus: EventBus,
    status: watch::Sender<ConnectionStatus>,
    handshake: Option<oneshot::Sender<Result<()>>>,
    child: Option<Child>,
    reader_task: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl<W> Driver<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let exit = self.drive().await;
        self.finish(exit).await;
    }

    async fn drive(&mut self) -> Exit {
        loop {
            let deadline = self.correlator.next_deadline();

            tokio::select! {
                event = self.lines.recv() => match event {
                    Some(StreamEvent::Line(line)) => {
                        if let Some(exit) = self.handle_line(line) {
                            return exit;
                        }
                    }
                    Some(StreamEvent::Closed) | None => return Exit::StreamClosed,
                },

                request = self.requests.recv() => match request {
                    Some(Request::Submit { command, timeout, reply }) => {
                        if let Some(exit) = self.submit(command, timeout, reply).await {
                            return exit;
                        }
                    }
                    Some(Request::Subscribe { filter, reply }) => {
                        let _ = reply.send(self.bus.subscribe(filter));
                    }
                    Some(Request::Shutdown { reply }) => return Exit::Shutdown(reply),
                    None => return Exit::HandlesDropped,
                },

                _ = sleep_until_deadline(deadline) => {
                    let expired = self.correlator.expire(Instant::now());
                    tracing::debug!(expired, "command deadline reached");
                }
            }

            self.publish_pending();
        }
    }

    fn handle_line(&mut self, line: String) -> Option<Exit> {
        let classified = match classify(&line) {
            Ok(classified) => classified,
            Err(e) => return Some(violation(e)),
        };

        match classified {
            // Lines inside a block are body even when they start with `%`
            // (pane ids in list-panes output, for one). tmux never writes a
            // notification inside a block, so this holds for well-formed
            // notification text in captured pane content as well.
            ControlLine::Notification(_) if self.correlator.block_open() => {
                self.correlator.handle_body(line);
            }
            ControlLine::Notification(notification) => return self.dispatch(notification),
            ControlLine::Body(text) => {
                if !self.correlator.handle_body(text) {
                    tracing::warn!(line = %line, "Dropping line outside any block");
                }
            }
            ControlLine::BlockBegin(header) => {
                if let Err(e) = self.correlator.handle_begin(header) {
                    return Some(violation(e));
                }
            }
            ControlLine::BlockEnd { header, success } => match self.correlator.handle_end(header, success) {
                Ok(Some(handshake)) => return self.complete_handshake(handshake),
                Ok(None) => {}
                Err(e) => return Some(violation(e)),
            },
        }
        None
    }

    fn dispatch(&mut self, notification: Notification) -> Option<Exit> {
        match &notification {
            Notification::SessionChanged { name, .. } | Notification::SessionRenamed { name, .. } => {
                let name = name.clone();
                self.status.send_modify(|s| s.session = Some(name));
            }
            _ => {}
        }

        let delivered = self.bus.publish(&notification);
        tracing::trace!(?notification, delivered, "notification");

        match notification {
            Notification::Exit { reason } => Some(Exit::TmuxExit(reason)),
            _ => None,
        }
    }

    fn complete_handshake(&mut self, handshake: Handshake) -> Option<Exit> {
        if handshake.success {
            tracing::info!("tmux control mode ready");
            self.status.send_modify(|s| s.state = ConnectionState::Connected);
            if let Some(ack) = self.handshake.take() {
                let _ = ack.send(Ok(()));
            }
            return None;
        }

        let message = if handshake.lines.is_empty() {
            "tmux rejected the startup command".to_string()
        } else {
            handshake.lines.join("\n")
        };
        tracing::error!(error = %message, "tmux control mode startup failed");
        if let Some(ack) = self.handshake.take() {
            let _ = ack.send(Err(ControlError::Spawn(message)));
        }
        Some(Exit::HandshakeFailed)
    }

    async fn submit(&mut self, command: String, timeout: Duration, reply: Option<CommandReply>) -> Option<Exit> {
        if let Err(e) = self.write_line(&command).await {
            tracing::error!(error = %e, command = %command, "Failed to write command");
            if let Some(reply) = reply {
                let _ = reply.send(Err(ControlError::Io(e)));
            }
            return Some(Exit::WriteFailed);
        }
        tracing::debug!(command = %command, "command sent");
        self.correlator.submit(command, timeout, reply);
        None
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    fn publish_pending(&self) {
        let pending = self.correlator.pending();
        self.status.send_if_modified(|s| {
            let changed = s.pending_commands != pending;
            s.pending_commands = pending;
            changed
        });
    }

    async fn finish(mut self, exit: Exit) {
        self.status
            .send_modify(|s| s.state = ConnectionState::Disconnecting);
        // New requests fail fast from here on
        self.requests.close();

        let mut shutdown_reply = None;
        let mut detach = false;
        let mut reason = None;
        match exit {
            Exit::StreamClosed => tracing::info!("tmux control stream closed"),
            Exit::TmuxExit(why) => {
                tracing::info!(reason = ?why, "tmux ended the control client");
            }
            Exit::Violation(why) => {
                tracing::error!(reason = %why, "Protocol violation, dropping connection");
                detach = true;
                reason = Some(why);
            }
            Exit::WriteFailed => {}
            Exit::HandshakeFailed => {}
            Exit::Shutdown(reply) => {
                tracing::info!("Disconnecting from tmux");
                detach = true;
                shutdown_reply = Some(reply);
            }
            Exit::HandlesDropped => {
                tracing::debug!("All connection handles dropped");
                detach = true;
            }
        }

        self.correlator.fail_all(reason.as_deref());
        self.bus.close_all();
        if let Some(ack) = self.handshake.take() {
            let message = reason.unwrap_or_else(|| "tmux exited before acknowledging control mode".to_string());
            let _ = ack.send(Err(ControlError::Spawn(message)));
        }
        while let Ok(request) = self.requests.try_recv() {
            match request {
                Request::Submit { reply: Some(reply), .. } => {
                    let _ = reply.send(Err(ControlError::ConnectionClosed));
                }
                Request::Shutdown { reply } => {
                    let _ = reply.send(());
                }
                _ => {}
            }
        }

        if detach {
            if let Err(e) = self.write_line("detach-client").await {
                tracing::debug!(error = %e, "detach-client not delivered");
            }
        }
        let _ = self.writer.shutdown().await;

        if let Some(child) = self.child.as_mut() {
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "tmux exited"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Error waiting for tmux to exit"),
                Err(_) => {
                    tracing::warn!(
                        grace_ms = self.shutdown_grace.as_millis() as u64,
                        "tmux did not exit after detach, killing it"
                    );
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill tmux");
                    }
                }
            }
        }
        self.reader_task.abort();

        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.pending_commands = 0;
        });
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }
}

fn violation(err: ControlError) -> Exit {
    match err {
        ControlError::ProtocolViolation(reason) => Exit::Violation(reason),
        other => Exit::Violation(other.to_string()),
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

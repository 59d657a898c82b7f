//! Error types for the control mode client.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the control mode client.
///
/// Connection-level faults (`Spawn`, `ProtocolViolation`, `ConnectionClosed`)
/// end the connection. The rest are scoped to the call that produced them.
#[derive(Debug, Error)]
pub enum ControlError {
    /// tmux could not be started or exited before acknowledging control mode.
    #[error("failed to start tmux control mode: {0}")]
    Spawn(String),

    /// Block framing on the control stream can no longer be trusted.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No `%end`/`%error` arrived for the command before its deadline.
    #[error("command timed out after {}ms: {command}", timeout.as_millis())]
    CommandTimeout { command: String, timeout: Duration },

    /// tmux answered the command with an `%error` block.
    #[error("tmux error for `{command}`: {}", lines.join("\n"))]
    CommandError { command: String, lines: Vec<String> },

    /// The pattern did not show up in pane output before the deadline.
    #[error("timed out waiting for pattern `{pattern}`")]
    WaitTimeout { pattern: String, accumulated: String },

    /// The wait was cancelled by the caller.
    #[error("wait cancelled")]
    Cancelled,

    /// The command text cannot be written as a single control mode line.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Operation attempted while the client is not connected.
    #[error("not connected to tmux")]
    NotConnected,

    /// `connect` called on a client that already has a live connection.
    #[error("already connected to tmux")]
    AlreadyConnected,

    /// The connection closed while the operation was outstanding.
    #[error("control mode connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ControlError {
    /// Whether this error ended the connection (as opposed to one call).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ControlError::Spawn(_) | ControlError::ProtocolViolation(_) | ControlError::ConnectionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_message_joins_lines() {
        let err = ControlError::CommandError {
            command: "kill-pane -t %9".to_string(),
            lines: vec!["can't find pane: %9".to_string()],
        };
        assert_eq!(err.to_string(), "tmux error for `kill-pane -t %9`: can't find pane: %9");
    }

    #[test]
    fn test_timeout_message_in_millis() {
        let err = ControlError::CommandTimeout {
            command: "list-sessions".to_string(),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "command timed out after 1500ms: list-sessions");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ControlError::ProtocolViolation("x".into()).is_fatal());
        assert!(ControlError::ConnectionClosed.is_fatal());
        assert!(!ControlError::Cancelled.is_fatal());
        assert!(!ControlError::NotConnected.is_fatal());
    }
}

//! Command correlator
//!
//! tmux answers control mode commands strictly in the order they were
//! written, one `%begin`..`%end` block per command. The correlator keeps the
//! written-but-unanswered commands in a FIFO queue and pairs each block with
//! the queue head.
//!
//! A command that times out is answered immediately with `CommandTimeout`
//! but stays in the queue as a tombstone: tmux still owes its block, and
//! that block is read and thrown away when it arrives. This keeps every
//! later command paired with its own block without reconnecting.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::parser::BlockHeader;
use crate::error::{ControlError, Result};

/// Completed response to one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    /// Command number tmux reported in `%begin`/`%end`
    pub sequence: u64,
    pub timestamp: u64,
    /// Body lines between `%begin` and `%end`
    pub lines: Vec<String>,
    pub success: bool,
    pub error_lines: Option<Vec<String>>,
}

impl CommandResult {
    /// Body lines joined with newlines.
    pub fn output(&self) -> String {
        self.lines.join("\n")
    }
}

/// Where a command's result goes. `None` means nobody is listening.
pub type CommandReply = oneshot::Sender<Result<CommandResult>>;

struct PendingCommand {
    command: String,
    submitted_at: Instant,
    deadline: Instant,
    /// Learned from the `%begin` line of this command's block
    sequence: Option<u64>,
    /// Taken exactly once; `None` afterwards (answered, timed out or detached)
    reply: Option<CommandReply>,
}

impl PendingCommand {
    fn complete(&mut self, result: Result<CommandResult>) {
        if let Some(reply) = self.reply.take() {
            // Receiver may have been dropped by a caller that gave up
            let _ = reply.send(result);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockOwner {
    /// Response to the command tmux was started with
    Handshake,
    /// Response to the queue head
    Command,
}

struct OpenBlock {
    header: BlockHeader,
    owner: BlockOwner,
    lines: Vec<String>,
}

/// Outcome of the startup block tmux emits for its initial command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub success: bool,
    pub lines: Vec<String>,
}

/// FIFO command/response correlator. Owned by the connection driver.
pub struct Correlator {
    queue: VecDeque<PendingCommand>,
    open: Option<OpenBlock>,
    last_sequence: Option<u64>,
    awaiting_handshake: bool,
}

impl Correlator {
    /// Correlator for a fresh `tmux -C` process, which answers its startup
    /// command before anything else.
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            open: None,
            last_sequence: None,
            awaiting_handshake: true,
        }
    }

    /// Correlator for a stream whose startup block was already consumed.
    pub fn without_handshake() -> Self {
        Self {
            awaiting_handshake: false,
            ..Self::new()
        }
    }

    pub fn awaiting_handshake(&self) -> bool {
        self.awaiting_handshake
    }

    /// Whether a `%begin` block is open. Lines inside it are body, whatever they look like.
    pub fn block_open(&self) -> bool {
        self.open.is_some()
    }

    /// Commands written to tmux whose block has not completed, tombstones included.
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Commands still waiting for a result.
    pub fn pending(&self) -> usize {
        self.queue.iter().filter(|p| p.reply.is_some()).count()
    }

    /// Record a command that was just written to tmux.
    pub fn submit(&mut self, command: String, timeout: Duration, reply: Option<CommandReply>) {
        let now = Instant::now();
        self.queue.push_back(PendingCommand {
            command,
            submitted_at: now,
            deadline: now + timeout,
            sequence: None,
            reply,
        });
    }

    pub fn handle_begin(&mut self, header: BlockHeader) -> Result<()> {
        if let Some(open) = &self.open {
            return Err(ControlError::ProtocolViolation(format!(
                "%begin {} while block {} is still open",
                header.sequence, open.header.sequence
            )));
        }

        if let Some(last) = self.last_sequence {
            if header.sequence <= last {
                return Err(ControlError::ProtocolViolation(format!(
                    "%begin {} does not follow previous block {}",
                    header.sequence, last
                )));
            }
        }

        let owner = if self.awaiting_handshake {
            BlockOwner::Handshake
        } else {
            let head = self.queue.front_mut().ok_or_else(|| {
                ControlError::ProtocolViolation(format!(
                    "%begin {} with no command in flight",
                    header.sequence
                ))
            })?;
            head.sequence = Some(header.sequence);
            BlockOwner::Command
        };

        self.last_sequence = Some(header.sequence);
        self.open = Some(OpenBlock {
            header,
            owner,
            lines: Vec::new(),
        });
        Ok(())
    }

    /// Append a body line to the open block. Returns `false` when no block
    /// is open and the line was dropped.
    pub fn handle_body(&mut self, line: String) -> bool {
        match &mut self.open {
            Some(open) => {
                open.lines.push(line);
                true
            }
            None => false,
        }
    }

    /// Close the open block. Returns the handshake outcome when the block was
    /// the startup response.
    pub fn handle_end(&mut self, header: BlockHeader, success: bool) -> Result<Option<Handshake>> {
        let open = self.open.take().ok_or_else(|| {
            ControlError::ProtocolViolation(format!("%end {} without %begin", header.sequence))
        })?;

        if open.header.sequence != header.sequence {
            let expected = open.header.sequence;
            // Keep the block so fail_all can blame its owner
            self.open = Some(open);
            return Err(ControlError::ProtocolViolation(format!(
                "block {} closed by %end {}",
                expected, header.sequence
            )));
        }

        match open.owner {
            BlockOwner::Handshake => {
                self.awaiting_handshake = false;
                Ok(Some(Handshake {
                    success,
                    lines: open.lines,
                }))
            }
            BlockOwner::Command => {
                let Some(mut pending) = self.queue.pop_front() else {
                    return Err(ControlError::ProtocolViolation(format!(
                        "block {} has no command",
                        header.sequence
                    )));
                };

                if pending.reply.is_none() {
                    tracing::debug!(
                        sequence = header.sequence,
                        command = %pending.command,
                        "discarding block of abandoned command"
                    );
                    return Ok(None);
                }

                tracing::trace!(
                    sequence = header.sequence,
                    command = %pending.command,
                    success,
                    elapsed_ms = pending.submitted_at.elapsed().as_millis() as u64,
                    "command completed"
                );

                let result = if success {
                    Ok(CommandResult {
                        sequence: header.sequence,
                        timestamp: header.timestamp,
                        lines: open.lines,
                        success: true,
                        error_lines: None,
                    })
                } else {
                    Err(ControlError::CommandError {
                        command: pending.command.clone(),
                        lines: open.lines,
                    })
                };
                pending.complete(result);
                Ok(None)
            }
        }
    }

    /// Earliest deadline among commands still waiting for a result.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue
            .iter()
            .filter(|p| p.reply.is_some())
            .map(|p| p.deadline)
            .min()
    }

    /// Reject every command whose deadline has passed. Returns how many.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for pending in self.queue.iter_mut() {
            if pending.reply.is_some() && pending.deadline <= now {
                tracing::warn!(
                    command = %pending.command,
                    sequence = ?pending.sequence,
                    "command timed out; its block will be discarded"
                );
                let err = ControlError::CommandTimeout {
                    command: pending.command.clone(),
                    timeout: pending.deadline - pending.submitted_at,
                };
                pending.complete(Err(err));
                expired += 1;
            }
        }
        expired
    }

    /// Reject everything still waiting. With a `violation`, the command
    /// owning the open block (or the queue head) gets `ProtocolViolation`
    /// and the rest `ConnectionClosed`.
    pub fn fail_all(&mut self, violation: Option<&str>) {
        let mut violation = violation;
        if matches!(self.open.take(), Some(OpenBlock { owner: BlockOwner::Handshake, .. })) {
            // The handshake waiter is told separately by the driver
            violation = None;
        }

        for mut pending in self.queue.drain(..) {
            let err = match violation {
                Some(reason) if pending.reply.is_some() => {
                    violation = None;
                    ControlError::ProtocolViolation(reason.to_string())
                }
                _ => ControlError::ConnectionClosed,
            };
            pending.complete(Err(err));
        }
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(sequence: u64) -> BlockHeader {
        BlockHeader {
            timestamp: 1733500000,
            sequence,
            flags: 0,
        }
    }

    fn submit(c: &mut Correlator, cmd: &str) -> oneshot::Receiver<Result<CommandResult>> {
        let (tx, rx) = oneshot::channel();
        c.submit(cmd.to_string(), Duration::from_secs(10), Some(tx));
        rx
    }

    fn block(c: &mut Correlator, seq: u64, lines: &[&str], success: bool) {
        c.handle_begin(header(seq)).unwrap();
        for line in lines {
            assert!(c.handle_body(line.to_string()));
        }
        assert_eq!(c.handle_end(header(seq), success).unwrap(), None);
    }

    #[test]
    fn test_handshake_block() {
        let mut c = Correlator::new();
        assert!(c.awaiting_handshake());
        c.handle_begin(header(0)).unwrap();
        let outcome = c.handle_end(header(0), true).unwrap();
        assert_eq!(
            outcome,
            Some(Handshake {
                success: true,
                lines: vec![]
            })
        );
        assert!(!c.awaiting_handshake());
    }

    #[test]
    fn test_single_command_resolves() {
        let mut c = Correlator::without_handshake();
        let mut rx = submit(&mut c, "list-sessions");
        block(&mut c, 1, &["session-name"], true);

        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(result.sequence, 1);
        assert_eq!(result.lines, vec!["session-name"]);
        assert!(result.success);
        assert_eq!(c.in_flight(), 0);
    }

    #[test]
    fn test_error_block_rejects_with_lines() {
        let mut c = Correlator::without_handshake();
        let mut rx = submit(&mut c, "kill-pane -t %99");
        block(&mut c, 4, &["can't find pane: %99"], false);

        match rx.try_recv().unwrap() {
            Err(ControlError::CommandError { command, lines }) => {
                assert_eq!(command, "kill-pane -t %99");
                assert_eq!(lines, vec!["can't find pane: %99"]);
            }
            other => panic!("Expected CommandError, got {other:?}"),
        }
    }

    #[test]
    fn test_pipelined_commands_resolve_in_order() {
        let mut c = Correlator::without_handshake();
        let mut receivers: Vec<_> = (0..5).map(|i| submit(&mut c, &format!("cmd-{i}"))).collect();
        assert_eq!(c.pending(), 5);

        for (i, rx) in receivers.iter_mut().enumerate() {
            assert!(rx.try_recv().is_err(), "cmd-{i} resolved early");
            let seq = 10 + i as u64;
            let body = format!("out-{i}");
            block(&mut c, seq, &[&body], true);
            let result = rx.try_recv().unwrap().unwrap();
            assert_eq!(result.sequence, seq);
            assert_eq!(result.lines, vec![body]);
        }
    }

    #[test]
    fn test_begin_with_nothing_in_flight_is_violation() {
        let mut c = Correlator::without_handshake();
        assert!(matches!(
            c.handle_begin(header(3)),
            Err(ControlError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_sequence_must_increase() {
        let mut c = Correlator::without_handshake();
        let _a = submit(&mut c, "a");
        let _b = submit(&mut c, "b");
        block(&mut c, 7, &[], true);
        assert!(matches!(
            c.handle_begin(header(7)),
            Err(ControlError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_mismatched_end_is_violation_and_blames_head() {
        let mut c = Correlator::without_handshake();
        let mut a = submit(&mut c, "a");
        let mut b = submit(&mut c, "b");
        c.handle_begin(header(1)).unwrap();
        let err = c.handle_end(header(2), true).unwrap_err();
        assert!(matches!(err, ControlError::ProtocolViolation(_)));

        c.fail_all(Some("bad framing"));
        assert!(matches!(a.try_recv().unwrap(), Err(ControlError::ProtocolViolation(_))));
        assert!(matches!(b.try_recv().unwrap(), Err(ControlError::ConnectionClosed)));
    }

    #[test]
    fn test_end_without_begin_is_violation() {
        let mut c = Correlator::without_handshake();
        assert!(matches!(
            c.handle_end(header(1), true),
            Err(ControlError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_body_without_block_is_dropped() {
        let mut c = Correlator::without_handshake();
        assert!(!c.handle_body("stray".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_tombstone_discards_late_block() {
        let mut c = Correlator::without_handshake();
        let (tx, mut slow) = oneshot::channel();
        c.submit("slow".to_string(), Duration::from_millis(100), Some(tx));
        let mut fast = submit(&mut c, "fast");

        assert_eq!(c.next_deadline(), Some(Instant::now() + Duration::from_millis(100)));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(c.expire(Instant::now()), 1);

        match slow.try_recv().unwrap() {
            Err(ControlError::CommandTimeout { command, timeout }) => {
                assert_eq!(command, "slow");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("Expected CommandTimeout, got {other:?}"),
        }

        // Late block for "slow" is swallowed, "fast" still gets its own
        block(&mut c, 1, &["late"], true);
        assert!(fast.try_recv().is_err());
        block(&mut c, 2, &["mine"], true);
        assert_eq!(fast.try_recv().unwrap().unwrap().lines, vec!["mine"]);
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_fire_early_or_twice() {
        let mut c = Correlator::without_handshake();
        let mut rx = submit(&mut c, "a");
        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert_eq!(c.expire(Instant::now()), 0);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(c.expire(Instant::now()), 1);
        assert_eq!(c.expire(Instant::now()), 0);
        assert!(c.next_deadline().is_none());
        assert!(matches!(rx.try_recv().unwrap(), Err(ControlError::CommandTimeout { .. })));
    }

    #[test]
    fn test_detached_command_keeps_fifo() {
        let mut c = Correlator::without_handshake();
        c.submit("refresh-client".to_string(), Duration::from_secs(1), None);
        let mut rx = submit(&mut c, "display -p hi");
        assert_eq!(c.pending(), 1);
        assert_eq!(c.in_flight(), 2);

        block(&mut c, 1, &[], true);
        block(&mut c, 2, &["hi"], true);
        assert_eq!(rx.try_recv().unwrap().unwrap().output(), "hi");
    }

    #[test]
    fn test_fail_all_closes_everything() {
        let mut c = Correlator::without_handshake();
        let mut a = submit(&mut c, "a");
        let mut b = submit(&mut c, "b");
        c.fail_all(None);
        assert!(matches!(a.try_recv().unwrap(), Err(ControlError::ConnectionClosed)));
        assert!(matches!(b.try_recv().unwrap(), Err(ControlError::ConnectionClosed)));
        assert_eq!(c.in_flight(), 0);
    }
}

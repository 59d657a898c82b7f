//! Waiting for a pattern to show up in pane output

use regex::Regex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::Subscription;
use super::parser::Notification;
use crate::error::{ControlError, Result};
use crate::normalize::strip_ansi;

/// Upper bound on buffered output per wait; older output is dropped first.
pub const MAX_ACCUMULATED_BYTES: usize = 1 << 20;

/// Output collected for one `wait_for_output` call.
///
/// Decoded bytes are kept unstripped, so an escape sequence or a UTF-8
/// character split over two `%output` lines is still recognized once both
/// halves are in.
#[derive(Debug)]
pub struct PaneOutputAccumulator {
    pane_id: String,
    raw: Vec<u8>,
    pattern: Regex,
    deadline: Instant,
}

impl PaneOutputAccumulator {
    pub fn new(pane_id: impl Into<String>, pattern: Regex, deadline: Instant) -> Self {
        Self {
            pane_id: pane_id.into(),
            raw: Vec::new(),
            pattern,
            deadline,
        }
    }

    pub fn pane_id(&self) -> &str {
        &self.pane_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Feed a notification. Returns the normalized text once the pattern matches.
    pub fn push(&mut self, notification: &Notification) -> Option<String> {
        if notification.pane_id() != Some(self.pane_id.as_str()) {
            return None;
        }
        let chunk = notification.output_bytes()?;
        self.raw.extend_from_slice(&chunk);
        self.trim();

        let text = self.text();
        self.pattern.is_match(&text).then_some(text)
    }

    /// Accumulated output with escape sequences removed. A character still
    /// missing its last bytes is left out until they arrive.
    pub fn text(&self) -> String {
        let complete = self.raw.len() - incomplete_tail(&self.raw);
        strip_ansi(&String::from_utf8_lossy(&self.raw[..complete]))
    }

    fn trim(&mut self) {
        if self.raw.len() <= MAX_ACCUMULATED_BYTES {
            return;
        }
        let mut cut = self.raw.len() - MAX_ACCUMULATED_BYTES;
        while cut < self.raw.len() && is_continuation(self.raw[cut]) {
            cut += 1;
        }
        self.raw.drain(..cut);
    }

    fn into_timeout(self) -> ControlError {
        ControlError::WaitTimeout {
            pattern: self.pattern.as_str().to_string(),
            accumulated: self.text(),
        }
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Length of a trailing UTF-8 sequence whose remaining bytes have not
/// arrived yet, or 0.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if is_continuation(byte) {
            continue;
        }
        let width = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Drive a wait to completion: first match, deadline, cancellation or
/// connection close, whichever happens first. The subscription is released
/// in every case.
pub async fn wait_for_match(
    mut subscription: Subscription,
    mut accumulator: PaneOutputAccumulator,
    cancel: CancellationToken,
) -> Result<String> {
    let deadline = tokio::time::sleep_until(accumulator.deadline());
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break Err(ControlError::Cancelled),

            _ = &mut deadline => break Err(accumulator.into_timeout()),

            notification = subscription.recv() => match notification {
                Some(notification) => {
                    if let Some(text) = accumulator.push(&notification) {
                        break Ok(text);
                    }
                }
                None => break Err(ControlError::ConnectionClosed),
            },
        }
    };

    subscription.unsubscribe();
    outcome
}

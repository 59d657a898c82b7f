//! Tmux Control Mode protocol
//!
//! Talks to tmux over `tmux -C`: commands go in on stdin, and stdout carries
//! `%begin`/`%end` response blocks interleaved with `%` notifications.
//!
//! ## Key components:
//! - `reader` - Split the raw byte stream into lines
//! - `octal` - Decode tmux's octal escape sequences
//! - `parser` - Classify lines and decode notifications
//! - `correlator` - Pair response blocks with the commands that caused them
//! - `events` - Fan notifications out to subscribers
//! - `wait` - Wait for a pattern in pane output
//! - `connection` - Own the tmux process and drive all of the above

mod connection;
mod correlator;
mod events;
mod octal;
mod parser;
mod reader;
mod wait;

pub use connection::{control_mode_args, open, start, ConnectionHandle, ConnectionState, ConnectionStatus};
pub use correlator::{CommandReply, CommandResult, Correlator, Handshake};
pub use events::{EventBus, EventFilter, Subscription, SubscriptionId};
pub use octal::{decode_octal, decode_octal_lossy};
pub use parser::{classify, parse_notification, BlockHeader, ControlLine, Notification};
pub use reader::{spawn_reader_task, LineBuffer, StreamEvent, LINE_CHANNEL_CAPACITY};
pub use wait::{wait_for_match, PaneOutputAccumulator, MAX_ACCUMULATED_BYTES};

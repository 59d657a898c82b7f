//! Async client for tmux control mode (`tmux -C`).
//!
//! ```no_run
//! use tmuxctl_core::{ClientConfig, TmuxControlClient};
//!
//! # async fn demo() -> tmuxctl_core::Result<()> {
//! let client = TmuxControlClient::new(ClientConfig::default());
//! client.connect(Some("work")).await?;
//! for pane in client.list_panes(None).await? {
//!     println!("{} {} {}", pane.id, pane.command, pane.path);
//! }
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod control_mode;
pub mod error;
pub mod normalize;

pub use client::{ClientStatus, PaneDescriptor, TmuxControlClient};
pub use config::ClientConfig;
pub use control_mode::{CommandResult, ConnectionState, EventFilter, Notification, Subscription};
pub use error::{ControlError, Result};
pub use normalize::strip_ansi;

/// Re-exported so callers can cancel waits without depending on tokio-util.
pub use tokio_util::sync::CancellationToken;

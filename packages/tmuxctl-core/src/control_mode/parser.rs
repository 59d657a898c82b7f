//! Parser for tmux control mode lines
//!
//! Every line tmux writes in control mode is one of:
//! - `%begin <time> <number> <flags>` - start of a command response block
//! - `%end <time> <number> <flags>` / `%error ...` - end of that block
//! - `%<name> ...` - an asynchronous notification (`%output`, `%window-add`, ...)
//! - anything else - a body line of the block currently open
//!
//! Classification is stateless. Which block a body line belongs to is the
//! correlator's business.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use super::octal::decode_octal;
use crate::error::{ControlError, Result};

static OUTPUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^%output (%\d+)(?: (.*))?$").expect("OUTPUT_RE pattern is valid"));
static SESSION_CHANGED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^%session-changed \$(\d+) (.+)$").expect("SESSION_CHANGED_RE pattern is valid"));
static SESSION_RENAMED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^%session-renamed \$(\d+) (.+)$").expect("SESSION_RENAMED_RE pattern is valid"));
static WINDOW_ADD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^%window-add (@\d+)$").expect("WINDOW_ADD_RE pattern is valid"));
static WINDOW_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^%window-close (@\d+)$").expect("WINDOW_CLOSE_RE pattern is valid"));
static WINDOW_RENAMED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^%window-renamed (@\d+) (.*)$").expect("WINDOW_RENAMED_RE pattern is valid"));
static LAYOUT_CHANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^%layout-change (@\d+) (\S+) (\S+)(?: (\S*))?$").expect("LAYOUT_CHANGE_RE pattern is valid")
});
static PANE_MODE_CHANGED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^%pane-mode-changed (%\d+)$").expect("PANE_MODE_CHANGED_RE pattern is valid"));
static EXIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^%exit(?: (.*))?$").expect("EXIT_RE pattern is valid"));

/// Asynchronous notifications from tmux.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    /// Pane output; `data` is verbatim from the wire (still octal-escaped)
    ///
    /// Bytes that were not valid UTF-8 on the wire arrive here as `\ooo`
    /// escapes too (see [`LineBuffer`](super::reader::LineBuffer)), so
    /// [`Notification::output_bytes`] gives back exactly what the pane wrote.
    Output { pane_id: String, data: String },

    /// The attached session changed
    SessionChanged { session_id: u32, name: String },

    /// A session was created or destroyed
    SessionsChanged,

    /// The attached session was renamed
    SessionRenamed { session_id: u32, name: String },

    WindowAdd { window_id: String },

    WindowClose { window_id: String },

    WindowRenamed { window_id: String, name: String },

    LayoutChange {
        window_id: String,
        layout: String,
        visible_layout: String,
        flags: String,
    },

    /// Pane entered or left a mode such as copy mode
    PaneModeChanged { pane_id: String },

    /// tmux is about to close the control client
    Exit { reason: Option<String> },

    /// Any `%` line this parser does not know. Surfaced, never an error.
    Unknown { raw: String },
}

impl Notification {
    /// Pane the notification is about, if any.
    pub fn pane_id(&self) -> Option<&str> {
        match self {
            Notification::Output { pane_id, .. } | Notification::PaneModeChanged { pane_id } => Some(pane_id),
            _ => None,
        }
    }

    /// Raw bytes of an `Output` notification. A UTF-8 character may be
    /// split between two consecutive notifications.
    pub fn output_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Notification::Output { data, .. } => Some(decode_octal(data)),
            _ => None,
        }
    }

}

/// `%begin`/`%end`/`%error` header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub timestamp: u64,
    pub sequence: u64,
    pub flags: u32,
}

/// Classification of a single control mode line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    Notification(Notification),
    BlockBegin(BlockHeader),
    BlockEnd { header: BlockHeader, success: bool },
    Body(String),
}

/// Classify one line.
///
/// Malformed block framing is a protocol violation: once `%begin`/`%end`
/// can't be read reliably, command correlation is no longer trustworthy.
pub fn classify(line: &str) -> Result<ControlLine> {
    if !line.starts_with('%') {
        return Ok(ControlLine::Body(line.to_string()));
    }

    let keyword = line.split(' ').next().unwrap_or(line);
    match keyword {
        "%begin" => Ok(ControlLine::BlockBegin(parse_header(line)?)),
        "%end" => Ok(ControlLine::BlockEnd {
            header: parse_header(line)?,
            success: true,
        }),
        "%error" => Ok(ControlLine::BlockEnd {
            header: parse_header(line)?,
            success: false,
        }),
        _ => Ok(ControlLine::Notification(parse_notification(line))),
    }
}

fn parse_header(line: &str) -> Result<BlockHeader> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [_, timestamp, sequence, flags] = fields.as_slice() else {
        return Err(ControlError::ProtocolViolation(format!(
            "malformed block line: {line:?}"
        )));
    };

    let number = |field: &str| -> Result<u64> {
        field
            .parse()
            .map_err(|_| ControlError::ProtocolViolation(format!("non-numeric field {field:?} in {line:?}")))
    };

    Ok(BlockHeader {
        timestamp: number(*timestamp)?,
        sequence: number(*sequence)?,
        flags: u32::try_from(number(*flags)?)
            .map_err(|_| ControlError::ProtocolViolation(format!("flags out of range in {line:?}")))?,
    })
}

/// Decode a `%` notification line. First matching pattern wins.
pub fn parse_notification(line: &str) -> Notification {
    if let Some(caps) = OUTPUT_RE.captures(line) {
        return Notification::Output {
            pane_id: caps[1].to_string(),
            data: caps.get(2).map_or("", |m| m.as_str()).to_string(),
        };
    }

    if let Some(caps) = SESSION_CHANGED_RE.captures(line) {
        if let Ok(session_id) = caps[1].parse() {
            return Notification::SessionChanged {
                session_id,
                name: caps[2].to_string(),
            };
        }
    }

    if line == "%sessions-changed" {
        return Notification::SessionsChanged;
    }

    if let Some(caps) = SESSION_RENAMED_RE.captures(line) {
        if let Ok(session_id) = caps[1].parse() {
            return Notification::SessionRenamed {
                session_id,
                name: caps[2].to_string(),
            };
        }
    }

    if let Some(caps) = WINDOW_ADD_RE.captures(line) {
        return Notification::WindowAdd {
            window_id: caps[1].to_string(),
        };
    }

    if let Some(caps) = WINDOW_CLOSE_RE.captures(line) {
        return Notification::WindowClose {
            window_id: caps[1].to_string(),
        };
    }

    if let Some(caps) = WINDOW_RENAMED_RE.captures(line) {
        return Notification::WindowRenamed {
            window_id: caps[1].to_string(),
            name: caps[2].to_string(),
        };
    }

    if let Some(caps) = LAYOUT_CHANGE_RE.captures(line) {
        return Notification::LayoutChange {
            window_id: caps[1].to_string(),
            layout: caps[2].to_string(),
            visible_layout: caps[3].to_string(),
            flags: caps.get(4).map_or("", |m| m.as_str()).to_string(),
        };
    }

    if let Some(caps) = PANE_MODE_CHANGED_RE.captures(line) {
        return Notification::PaneModeChanged {
            pane_id: caps[1].to_string(),
        };
    }

    if let Some(caps) = EXIT_RE.captures(line) {
        return Notification::Exit {
            reason: caps.get(1).map(|m| m.as_str().to_string()).filter(|r| !r.is_empty()),
        };
    }

    Notification::Unknown { raw: line.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(line: &str) -> Notification {
        match classify(line) {
            Ok(ControlLine::Notification(n)) => n,
            other => panic!("Expected notification for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(
            notification("%output %50 Hello World"),
            Notification::Output {
                pane_id: "%50".to_string(),
                data: "Hello World".to_string(),
            }
        );
    }

    #[test]
    fn test_output_keeps_escapes_verbatim() {
        let n = notification(r"%output %1 \033[0mHello");
        assert_eq!(n.pane_id(), Some("%1"));
        match &n {
            Notification::Output { data, .. } => assert_eq!(data, r"\033[0mHello"),
            _ => panic!("Expected Output"),
        }
        assert_eq!(n.output_bytes(), Some(b"\x1b[0mHello".to_vec()));
    }

    #[test]
    fn test_output_without_payload() {
        assert_eq!(
            notification("%output %3"),
            Notification::Output {
                pane_id: "%3".to_string(),
                data: String::new(),
            }
        );
    }

    #[test]
    fn test_parse_session_changed() {
        assert_eq!(
            notification("%session-changed $0 main"),
            Notification::SessionChanged {
                session_id: 0,
                name: "main".to_string(),
            }
        );
    }

    #[test]
    fn test_session_changed_name_with_spaces() {
        assert_eq!(
            notification("%session-changed $12 my work"),
            Notification::SessionChanged {
                session_id: 12,
                name: "my work".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_session_renamed() {
        assert_eq!(
            notification("%session-renamed $1 newname"),
            Notification::SessionRenamed {
                session_id: 1,
                name: "newname".to_string(),
            }
        );
        assert_eq!(
            notification("%session-renamed $4 two words"),
            Notification::SessionRenamed {
                session_id: 4,
                name: "two words".to_string(),
            }
        );
        // No session id: not something tmux sends
        assert!(matches!(
            notification("%session-renamed newname"),
            Notification::Unknown { .. }
        ));
    }

    #[test]
    fn test_parse_window_add_and_close() {
        assert_eq!(
            notification("%window-add @1"),
            Notification::WindowAdd {
                window_id: "@1".to_string()
            }
        );
        assert_eq!(
            notification("%window-close @7"),
            Notification::WindowClose {
                window_id: "@7".to_string()
            }
        );
    }

    #[test]
    fn test_parse_layout_change() {
        assert_eq!(
            notification("%layout-change @0 abc1,80x24,0,0 abc1,80x24,0,0 *"),
            Notification::LayoutChange {
                window_id: "@0".to_string(),
                layout: "abc1,80x24,0,0".to_string(),
                visible_layout: "abc1,80x24,0,0".to_string(),
                flags: "*".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_exit() {
        assert_eq!(notification("%exit"), Notification::Exit { reason: None });
        assert_eq!(
            notification("%exit detached"),
            Notification::Exit {
                reason: Some("detached".to_string())
            }
        );
    }

    #[test]
    fn test_misc_notifications() {
        assert_eq!(notification("%sessions-changed"), Notification::SessionsChanged);
        assert_eq!(
            notification("%pane-mode-changed %4"),
            Notification::PaneModeChanged {
                pane_id: "%4".to_string()
            }
        );
        assert_eq!(
            notification("%window-renamed @2 logs"),
            Notification::WindowRenamed {
                window_id: "@2".to_string(),
                name: "logs".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_notification_is_not_an_error() {
        assert_eq!(
            notification("%client-detached /dev/pts/3"),
            Notification::Unknown {
                raw: "%client-detached /dev/pts/3".to_string()
            }
        );
        // Known name, unexpected shape
        assert_eq!(
            notification("%window-add 5"),
            Notification::Unknown {
                raw: "%window-add 5".to_string()
            }
        );
        // Prefix of a framing keyword is still just a notification
        assert!(matches!(notification("%beginning"), Notification::Unknown { .. }));
    }

    #[test]
    fn test_parse_block_framing() {
        let header = BlockHeader {
            timestamp: 1733500000,
            sequence: 1,
            flags: 0,
        };
        assert_eq!(classify("%begin 1733500000 1 0").unwrap(), ControlLine::BlockBegin(header));
        assert_eq!(
            classify("%end 1733500000 1 0").unwrap(),
            ControlLine::BlockEnd { header, success: true }
        );
        assert_eq!(
            classify("%error 1733500000 1 0").unwrap(),
            ControlLine::BlockEnd { header, success: false }
        );
    }

    #[test]
    fn test_malformed_framing_is_protocol_violation() {
        for line in ["%begin", "%begin 1 2", "%end 1 x 0", "%error 1 2 3 4", "%begin -1 2 0"] {
            assert!(
                matches!(classify(line), Err(ControlError::ProtocolViolation(_))),
                "{line:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_body_lines() {
        assert_eq!(
            classify("session-name").unwrap(),
            ControlLine::Body("session-name".to_string())
        );
        assert_eq!(classify("").unwrap(), ControlLine::Body(String::new()));
    }

    #[test]
    fn test_notification_serializes_with_type_tag() {
        let json = serde_json::to_value(notification("%window-add @3")).unwrap();
        assert_eq!(json["type"], "window-add");
        assert_eq!(json["window_id"], "@3");
    }
}

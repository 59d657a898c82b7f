//! Text normalization for pane content
//!
//! - [`strip_ansi`]: remove terminal escape sequences, keep printable text.
//! - [`last_line`] / [`has_prompt`]: small heuristics over captured output.

const ESC: char = '\x1b';
const BEL: char = '\x07';

/// Remove ANSI/VT escape sequences.
///
/// Handles CSI (`ESC [` params final), OSC (`ESC ]` ... BEL or ST), string
/// sequences (`ESC P`, `ESC X`, `ESC ^`, `ESC _` ... ST), charset
/// designations (`ESC ( B`) and other two-byte escapes. A truncated sequence
/// at the end of the input is dropped. Ordinary text, tabs and newlines are
/// kept as they are, and stripping twice gives the same result as once.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != ESC {
            out.push(c);
            continue;
        }

        // A second ESC starts a new sequence of its own
        if chars.peek() == Some(&ESC) {
            continue;
        }

        match chars.next() {
            Some('[') => {
                // Parameter and intermediate bytes, then one final byte in 0x40..=0x7e
                for c in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                while let Some(c) = chars.next() {
                    if c == BEL {
                        break;
                    }
                    if c == ESC && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some('P' | 'X' | '^' | '_') => {
                while let Some(c) = chars.next() {
                    if c == ESC && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some('(' | ')' | '*' | '+' | '-' | '.' | '/' | '#' | '%' | ' ') => {
                chars.next();
            }
            // Two-byte escape (ESC 7, ESC =, ESC M, ...) or dangling ESC
            Some(_) | None => {}
        }
    }

    out
}

/// Last non-empty line of `text`, right-trimmed.
pub fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim_end)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

/// Whether `line` looks like a shell prompt waiting for input
/// (ends with `$`, `#` or `>`, optionally followed by whitespace).
pub fn has_prompt(line: &str) -> bool {
    matches!(line.trim_end().chars().last(), Some('$' | '#' | '>'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_sgr() {
        assert_eq!(strip_ansi("\x1b[32mGreen Text\x1b[0m"), "Green Text");
        assert_eq!(strip_ansi("\x1b[1;31;40mBold Red on Black\x1b[0m"), "Bold Red on Black");
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(strip_ansi("plain"), "plain");
        assert_eq!(strip_ansi("tabs\tand\nnewlines\r\n"), "tabs\tand\nnewlines\r\n");
        assert_eq!(strip_ansi("ünïcödé ✓"), "ünïcödé ✓");
    }

    #[test]
    fn test_strip_cursor_and_private_modes() {
        assert_eq!(strip_ansi("\x1b[?25l\x1b[2J\x1b[Hhello\x1b[K"), "hello");
    }

    #[test]
    fn test_strip_osc() {
        assert_eq!(strip_ansi("\x1b]0;title\x07text"), "text");
        assert_eq!(
            strip_ansi("\x1b]8;;https://example.com\x1b\\link\x1b]8;;\x1b\\"),
            "link"
        );
    }

    #[test]
    fn test_strip_dcs_and_charset() {
        assert_eq!(strip_ansi("a\x1bPq#0;2;0;0;0\x1b\\b"), "ab");
        assert_eq!(strip_ansi("\x1b(Bbox\x1b(0"), "box");
        assert_eq!(strip_ansi("\x1b7saved\x1b8"), "saved");
    }

    #[test]
    fn test_truncated_sequences_do_not_panic() {
        assert_eq!(strip_ansi("abc\x1b"), "abc");
        assert_eq!(strip_ansi("abc\x1b["), "abc");
        assert_eq!(strip_ansi("abc\x1b[38;5"), "abc");
        assert_eq!(strip_ansi("abc\x1b]0;never ends"), "abc");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "\x1b[32mGreen\x1b[0m",
            "plain",
            "\x1b]0;t\x07x\x1b[1m\x1b[",
            "esc at end \x1b",
            "\x1b\x1b[31mdouble",
        ];
        assert_eq!(strip_ansi("\x1b\x1b[31mdouble"), "double");
        for s in samples {
            let once = strip_ansi(s);
            assert_eq!(strip_ansi(&once), once, "not idempotent for {s:?}");
        }
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("line1\nline2\nline3"), "line3");
        assert_eq!(last_line("line1\nprompt$ \n\n"), "prompt$");
        assert_eq!(last_line(""), "");
    }

    #[test]
    fn test_has_prompt() {
        assert!(has_prompt("user@host:~$ "));
        assert!(has_prompt("# "));
        assert!(has_prompt("> "));
        assert!(!has_prompt("output text"));
        assert!(!has_prompt(""));
    }
}

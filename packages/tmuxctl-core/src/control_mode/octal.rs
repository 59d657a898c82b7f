//! Octal escape decoding for `%output` payloads
//!
//! tmux escapes bytes below 32 and the backslash itself as `\ooo` when it
//! writes pane output to a control client, e.g. `\033` for ESC and `\134`
//! for `\`. Multi-byte UTF-8 characters may also arrive one escaped byte at
//! a time, so decoding works on bytes and converts to text afterwards.

/// Decode `\ooo` escapes into raw bytes.
///
/// Sequences that are not exactly three octal digits, or whose value does not
/// fit in a byte, are copied through unchanged.
///
/// # Examples
/// ```
/// use tmuxctl_core::control_mode::decode_octal;
///
/// assert_eq!(decode_octal(r"\033[1mhi"), b"\x1b[1mhi".to_vec());
/// assert_eq!(decode_octal(r"C:\134tmp"), b"C:\\tmp".to_vec());
/// ```
pub fn decode_octal(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(byte) = bytes.get(i + 1..i + 4).and_then(octal_byte) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    out
}

/// Decode escapes and convert to text, replacing invalid UTF-8.
pub fn decode_octal_lossy(input: &str) -> String {
    String::from_utf8_lossy(&decode_octal(input)).into_owned()
}

fn octal_byte(digits: &[u8]) -> Option<u8> {
    let value = digits.iter().try_fold(0u16, |acc, &d| match d {
        b'0'..=b'7' => Some(acc * 8 + u16::from(d - b'0')),
        _ => None,
    })?;
    u8::try_from(value).ok()
}

//! Hex formatting for raw frames in log lines

use std::fmt::Write;

/// Default number of bytes shown by [`dump_frame`] before truncating
pub const DEFAULT_DUMP_LIMIT: usize = 64;

fn push_hex(out: &mut String, bytes: &[u8], sep: Option<char>) {
    for (i, byte) in bytes.iter().enumerate() {
        if let (Some(sep), true) = (sep, i > 0) {
            out.push(sep);
        }
        // String as fmt::Write cannot fail
        let _ = write!(out, "{byte:02X}");
    }
}

/// Compact uppercase hex, `[0x12, 0x34, 0xAB]` -> `"1234AB"`
pub fn encode_upper(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    push_hex(&mut out, data, None);
    out
}

/// Space separated dump of at most `limit` bytes, `...` appended when truncated
///
/// Example: `dump_frame(&[0x01, 0x03, 0x90], 2)` -> `"01 03 ..."`
pub fn dump_frame(data: &[u8], limit: usize) -> String {
    let truncated = data.len() > limit;
    let shown = &data[..data.len().min(limit)];
    let mut out = String::with_capacity(shown.len() * 3 + 4);
    push_hex(&mut out, shown, Some(' '));
    if truncated {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str("...");
    }
    out
}

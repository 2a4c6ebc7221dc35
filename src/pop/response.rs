//! Multi-line response framing helpers.

/// Splits a payload on CRLF boundaries for multi-line framing. A payload
/// ending in CRLF yields a final empty line, which the framing turns
/// into the blank line preceding the terminator.
pub fn crlf_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut rest = data;
    while let Some(i) = rest.windows(2).position(|w| w == b"\r\n") {
        lines.push(&rest[..i]);
        rest = &rest[i + 2..];
    }
    lines.push(rest);
    lines
}

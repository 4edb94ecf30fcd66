//! Log-safe display wrappers.
//!
//! Session keys, nonces, password verifiers and RSA plaintexts pass through
//! the same code paths that emit `tracing` events. Wrapping them in one of
//! these types before they reach a log macro keeps the secret out of the
//! output while still recording that something was there.

use std::fmt;

/// Prints `[REDACTED]` in place of the wrapped value.
pub struct Redacted<T>(pub T);

impl<T: fmt::Display> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: fmt::Debug> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Prints only the length of a secret byte string.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// First eight characters of a hex digest, enough to tell two tags apart
/// in a log without printing the whole value.
pub struct ShortHex<'a>(pub &'a str);

impl<'a> fmt::Display for ShortHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.get(..8) {
            Some(prefix) if self.0.len() > 8 => write!(f, "{}..", prefix),
            _ => f.write_str(self.0),
        }
    }
}

/// Make a peer-supplied string safe for a single log line.
///
/// Control characters are replaced and the result is capped so a hostile
/// request line cannot forge extra log records.
pub fn sanitize_for_log(s: &str) -> String {
    const MAX_LEN: usize = 128;

    let mut out: String = s
        .chars()
        .take(MAX_LEN)
        .map(|c| if c.is_control() { '?' } else { c })
        .collect();
    if s.chars().count() > MAX_LEN {
        out.push_str("...");
    }
    out
}

/// Escape control characters so `s` stays on one line, keeping every other
/// character. Used for persisted records where truncation would lose
/// information.
pub fn escape_control(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_control() {
            out.extend(c.escape_default());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_display() {
        let secret = Redacted("pw1");
        assert_eq!(format!("{}", secret), "[REDACTED]");
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
    }

    #[test]
    fn test_redacted_bytes() {
        let key = [7u8; 16];
        assert_eq!(format!("{}", RedactedBytes(&key)), "[16 bytes]");
    }

    #[test]
    fn test_short_hex() {
        let tag = "0123456789abcdef0123456789abcdef";
        assert_eq!(format!("{}", ShortHex(tag)), "01234567..");
        assert_eq!(format!("{}", ShortHex("abcd")), "abcd");
    }

    #[test]
    fn test_sanitize_for_log() {
        assert_eq!(sanitize_for_log("notes.txt"), "notes.txt");
        assert_eq!(sanitize_for_log("evil\nline"), "evil?line");

        let long = "a".repeat(200);
        let cleaned = sanitize_for_log(&long);
        assert!(cleaned.ends_with("..."));
        assert_eq!(cleaned.len(), 131);
    }

    #[test]
    fn test_escape_control_keeps_length() {
        assert_eq!(escape_control("evil\nline\t"), "evil\\nline\\t");

        let long = "b".repeat(200);
        assert_eq!(escape_control(&long), long);
    }
}

//! Prelude normalisation applied before any artifact pass.
//!
//! Converter output arrives with mixed line endings and stray zero-width
//! code points depending on the source PDF's producer. Both confuse the
//! line-oriented detectors (a `\r` before `\n` hides the last character of a
//! line; a soft hyphen splits an otherwise clean camelCase check), so they are
//! removed up front. Neither rule is an artifact category: they are not
//! counted in [`crate::output::RepairResult`], and both are idempotent.

/// Apply all prelude rules in order.
///
/// 1. Normalise line endings (CRLF / CR → LF)
/// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens, etc.)
pub fn prelude(input: &str) -> String {
    let s = normalise_line_endings(input);
    remove_invisible_chars(&s)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Remove invisible Unicode characters ─────────────────────────────

/// Code points stripped by the prelude. The mojibake table never maps onto
/// any of these, so the prelude stays a fixed point after repair.
pub const INVISIBLE_CHARS: [char; 6] = [
    '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
];

fn remove_invisible_chars(input: &str) -> String {
    input.replace(INVISIBLE_CHARS, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_remove_invisible() {
        let input = "hello\u{200B}world\u{FEFF}foo\u{00AD}bar";
        assert_eq!(remove_invisible_chars(input), "helloworldfoobar");
    }

    #[test]
    fn prelude_is_idempotent() {
        let once = prelude("a\r\n\u{200B}b\r");
        assert_eq!(prelude(&once), once);
        assert_eq!(once, "a\nb\n");
    }
}

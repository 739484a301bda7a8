//! Markdown structure helpers shared by the artifact detectors.
//!
//! The detectors work on raw byte offsets into the document, so everything
//! here reports positions rather than copies: lines as `start..end` pairs,
//! verbatim regions (code blocks, front matter) as per-line flags, and
//! protected regions as merged, sorted byte ranges.

use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

/// One line of the document. `end` points at the `\n` (or end of text).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line {
    pub start: usize,
    pub end: usize,
}

impl Line {
    pub fn text<'a>(&self, doc: &'a str) -> &'a str {
        &doc[self.start..self.end]
    }
}

/// Split into lines without dropping the empty line after a trailing `\n`.
pub fn split_lines(text: &str) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            lines.push(Line { start, end: i });
            start = i + 1;
        }
    }
    lines.push(Line {
        start,
        end: text.len(),
    });
    lines
}

/// Flag lines that must be left byte-for-byte intact: YAML front matter,
/// fenced code blocks (fence lines included) and indented code blocks. An
/// unclosed fence runs to the end of the document.
///
/// A line indented four or more columns is code only when it starts a new
/// block (after a blank line) or continues one, and is not the continuation
/// of a list item.
pub fn verbatim_lines(text: &str, lines: &[Line]) -> Vec<bool> {
    let mut flags = vec![false; lines.len()];
    let mut i = 0;

    if lines.first().map(|l| l.text(text).trim_end()) == Some("---") {
        let close = lines.iter().skip(1).position(|l| {
            let s = l.text(text).trim_end();
            s == "---" || s == "..."
        });
        if let Some(close) = close {
            let last = close + 1;
            for flag in flags.iter_mut().take(last + 1) {
                *flag = true;
            }
            i = last + 1;
        }
    }

    let mut open: Option<(char, usize)> = None;
    let mut prev_blank = true;
    let mut prev_code = false;
    let mut in_list = false;
    while i < lines.len() {
        let s = lines[i].text(text);
        let blank = s.trim().is_empty();
        let mut code = false;
        match open {
            None if blank => {}
            None if indent_width(s) >= 4 => {
                code = prev_code || (prev_blank && (!in_list || indent_width(s) >= 8));
                flags[i] = code;
            }
            None => {
                in_list = is_list_marker(s);
                if let Some(marker) = fence_marker(s) {
                    open = Some(marker);
                    flags[i] = true;
                }
            }
            Some((ch, len)) => {
                flags[i] = true;
                if let Some((c2, l2)) = fence_marker(s) {
                    let rest = s.trim_start().trim_start_matches(c2);
                    if c2 == ch && l2 >= len && rest.trim().is_empty() {
                        open = None;
                    }
                }
            }
        }
        prev_code = code || (blank && prev_code);
        prev_blank = blank;
        i += 1;
    }
    flags
}

/// Returns the fence character and run length when `line` opens or closes a
/// fenced code block.
pub fn fence_marker(line: &str) -> Option<(char, usize)> {
    if indent_width(line) > 3 {
        return None;
    }
    let t = line.trim_start();
    let ch = t.chars().next()?;
    if ch != '`' && ch != '~' {
        return None;
    }
    let len = t.chars().take_while(|&c| c == ch).count();
    (len >= 3).then_some((ch, len))
}

/// Width of leading indentation, counting a tab as four columns.
pub fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width += 4,
            _ => break,
        }
    }
    width
}

pub fn is_heading(line: &str) -> bool {
    if indent_width(line) > 3 {
        return false;
    }
    let t = line.trim_start();
    let hashes = t.chars().take_while(|&c| c == '#').count();
    (1..=6).contains(&hashes)
        && t[hashes..]
            .chars()
            .next()
            .map_or(true, |c| c == ' ' || c == '\t')
}

pub fn is_table_row(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

/// `---`, `***`, `___` (optionally spaced) on a line of their own.
pub fn is_thematic_break(line: &str) -> bool {
    let t: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    t.len() >= 3
        && (t.chars().all(|c| c == '-') || t.chars().all(|c| c == '*') || t.chars().all(|c| c == '_'))
}

pub fn is_html_line(line: &str) -> bool {
    line.trim_start().starts_with('<')
}

static RE_LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[-*+]|\d{1,9}[.)])(?:\s|$)").unwrap());

pub fn is_list_marker(line: &str) -> bool {
    RE_LIST_MARKER.is_match(line.trim_start())
}

// ── URL-shaped tokens ────────────────────────────────────────────────────────

/// Characters that may appear inside a URL as extracted from running text.
/// Parentheses are excluded: they are far more often Markdown link syntax or
/// prose punctuation than part of the address.
pub fn is_url_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._~:/?#[]@!$&'*+,;=%".contains(c)
}

/// Byte offset of the first `scheme://` or `www.` inside `token`.
pub fn find_url_start(token: &str) -> Option<usize> {
    let lower = token.to_ascii_lowercase();
    ["https://", "http://", "ftp://", "www."]
        .iter()
        .filter_map(|pat| lower.find(pat))
        .filter(|&idx| {
            idx == 0
                || !token[..idx]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_ascii_alphanumeric())
        })
        .min()
}

static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)+").unwrap());

// Country and generic TLDs that are not also common English words, so that
// "Whatever.it" or "end.in" are not mistaken for host names.
static RE_DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[A-Za-z0-9-]+\.)+(?:com|org|net|edu|gov|mil|int|io|ai|dev|app|info|biz|uk|de|fr|jp|cn|ru|ca|au|nl|eu|ch|se|pl|br)(?:[/:?#].*)?$",
    )
    .unwrap()
});

static RE_FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^[\w-]+(?:\.[\w-]+)*\.(?:pdf|txt|md|markdown|html?|xml|json|toml|ya?ml|csv|tsv|rs|py|js|ts|c|h|cpp|java|go|rb|sh|zip|tar|gz|png|jpe?g|gif|svg|docx?|xlsx?|pptx?|exe|dll|so)$",
    )
    .unwrap()
});

/// Whether a whitespace-delimited token is a URL, e-mail address, bare
/// domain, or file name, after stripping surrounding prose punctuation.
pub fn looks_like_link_token(token: &str) -> bool {
    let core = token
        .trim_start_matches(['(', '[', '<', '"', '\'', '*', '_', '“', '‘'])
        .trim_end_matches([')', ']', '>', '"', '\'', '*', '_', '.', ',', ';', ':', '!', '?', '”', '’']);
    if core.is_empty() {
        return false;
    }
    core.contains("://")
        || core.to_ascii_lowercase().starts_with("www.")
        || RE_EMAIL.is_match(core)
        || RE_DOMAIN.is_match(core)
        || RE_FILENAME.is_match(core)
}

/// Byte length of the link-shaped head of `token` when a URL, e-mail address,
/// domain or file name has been glued to the next word by its closing
/// punctuation, as in `example.com.Then` or `jane@example.org,and`.
///
/// After a `.` the tail must be capitalised, since `example.co.uk` and
/// `archive.tar.gz` are single names. A head with a path keeps its tail.
pub fn glued_link_head(token: &str) -> Option<usize> {
    let (idx, punct) = token
        .char_indices()
        .rev()
        .find(|&(_, c)| matches!(c, '.' | ',' | ';' | ':'))?;
    let head = &token[..idx];
    let tail = token[idx + punct.len_utf8()..]
        .trim_end_matches([')', ']', '"', '\'', '*', '_', '.', ',', ';', ':', '!', '?', '”', '’']);

    let first = tail.chars().next()?;
    let capitalised = first.is_uppercase() && tail.chars().any(char::is_lowercase);
    if !tail.chars().all(char::is_alphabetic) || (punct == '.' && !capitalised) {
        return None;
    }
    if !head.chars().next_back().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let after_scheme = head.find("://").map_or(head, |i| &head[i + 3..]);
    if after_scheme.contains(['/', '?', '#']) {
        return None;
    }
    looks_like_link_token(head).then_some(idx)
}

// ── Protected regions ────────────────────────────────────────────────────────

static RE_INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`[^`\n]+`").unwrap());
static RE_LINK_TARGET: Lazy<Regex> = Lazy::new(|| Regex::new(r"\]\([^)\s]*\)").unwrap());
static RE_HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^<>\n]+>").unwrap());
static RE_ENTITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"&#?[A-Za-z0-9]+;").unwrap());
static RE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+").unwrap());

/// Sorted, merged byte ranges that the in-line repair passes must not touch.
#[derive(Debug, Clone, Default)]
pub struct Protected {
    ranges: Vec<Range<usize>>,
}

impl Protected {
    /// Build the protected set for `text`. `extra` carries ranges the caller
    /// already knows about (e.g. broken-URL continuation tokens).
    pub fn build(
        text: &str,
        lines: &[Line],
        verbatim: &[bool],
        extra: impl IntoIterator<Item = Range<usize>>,
    ) -> Self {
        let mut ranges: Vec<Range<usize>> = lines
            .iter()
            .zip(verbatim)
            .filter(|(_, &v)| v)
            .map(|(l, _)| l.start..(l.end + 1).min(text.len()))
            .collect();

        for re in [&*RE_INLINE_CODE, &*RE_LINK_TARGET, &*RE_HTML_TAG, &*RE_ENTITY] {
            ranges.extend(re.find_iter(text).map(|m| m.range()));
        }
        ranges.extend(RE_TOKEN.find_iter(text).filter_map(|m| {
            let token = m.as_str();
            match glued_link_head(token) {
                Some(head) => Some(m.start()..m.start() + head),
                None => looks_like_link_token(token).then(|| m.range()),
            }
        }));
        ranges.extend(extra);

        ranges.sort_by_key(|r| (r.start, r.end));
        let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
        for r in ranges {
            if r.is_empty() {
                continue;
            }
            match merged.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        Self { ranges: merged }
    }

    pub fn contains(&self, pos: usize) -> bool {
        let idx = self.ranges.partition_point(|r| r.end <= pos);
        self.ranges.get(idx).is_some_and(|r| r.start <= pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_lines_keeps_trailing_empty_line() {
        let lines = split_lines("ab\ncd\n");
        assert_eq!(
            lines,
            vec![
                Line { start: 0, end: 2 },
                Line { start: 3, end: 5 },
                Line { start: 6, end: 6 }
            ]
        );
    }

    #[test]
    fn fenced_block_lines_are_verbatim() {
        let text = "intro\n```rust\nlet x = 1;\n```\noutro";
        let lines = split_lines(text);
        assert_eq!(verbatim_lines(text, &lines), vec![false, true, true, true, false]);
    }

    #[test]
    fn unclosed_fence_runs_to_end() {
        let text = "a\n~~~\nb\nc";
        let lines = split_lines(text);
        assert_eq!(verbatim_lines(text, &lines), vec![false, true, true, true]);
    }

    #[test]
    fn indented_code_is_verbatim() {
        let text = "Intro.\n\n    obj.method(fooBar)\n\n    more()\nAfter.";
        let lines = split_lines(text);
        assert_eq!(
            verbatim_lines(text, &lines),
            vec![false, false, true, false, true, false]
        );
    }

    #[test]
    fn indented_lines_need_a_blank_line_or_no_list() {
        // Paragraph continuation, not code.
        let text = "Intro text\n    still the paragraph";
        assert_eq!(verbatim_lines(text, &split_lines(text)), vec![false, false]);

        // List item continuation paragraph.
        let text = "- item one\n\n    more about item one\n";
        assert_eq!(
            verbatim_lines(text, &split_lines(text)),
            vec![false, false, false, false]
        );

        // Code nested in a list item.
        let text = "- item one\n\n        let x = a.b;\n";
        assert_eq!(
            verbatim_lines(text, &split_lines(text)),
            vec![false, false, true, false]
        );
    }

    #[test]
    fn front_matter_is_verbatim() {
        let text = "---\ntitle: x\nauthor: y\n---\nbody";
        let lines = split_lines(text);
        assert_eq!(
            verbatim_lines(text, &lines),
            vec![true, true, true, true, false]
        );
    }

    #[test]
    fn heading_detection() {
        assert!(is_heading("# Title"));
        assert!(is_heading("### Deep"));
        assert!(is_heading("#"));
        assert!(!is_heading("#section"));
        assert!(!is_heading("####### seven"));
    }

    #[test]
    fn thematic_breaks() {
        assert!(is_thematic_break("---"));
        assert!(is_thematic_break("* * *"));
        assert!(!is_thematic_break("--"));
        assert!(!is_thematic_break("-a-"));
    }

    #[test]
    fn list_markers() {
        assert!(is_list_marker("- item"));
        assert!(is_list_marker("12. item"));
        assert!(!is_list_marker("-item"));
        assert!(!is_list_marker("mple.com"));
    }

    #[test]
    fn link_tokens() {
        assert!(looks_like_link_token("https://example.com/a"));
        assert!(looks_like_link_token("(www.example.org)."));
        assert!(looks_like_link_token("jane.doe@example.com,"));
        assert!(looks_like_link_token("mple.com/page"));
        assert!(looks_like_link_token("README.md"));
        assert!(!looks_like_link_token("Hello.World"));
        assert!(!looks_like_link_token("end.it"));
        assert!(!looks_like_link_token("3.14"));
    }

    #[test]
    fn glued_link_heads() {
        assert_eq!(glued_link_head("example.com.Then"), Some(11));
        assert_eq!(glued_link_head("(www.example.org.The"), Some(16));
        assert_eq!(glued_link_head("jane@example.org,and"), Some(16));
        assert_eq!(glued_link_head("report.pdf.Next"), Some(10));
        assert_eq!(glued_link_head("example.co.uk"), None);
        assert_eq!(glued_link_head("www.example.COM"), None);
        assert_eq!(glued_link_head("https://x.com/Foo.Bar"), None);
        assert_eq!(glued_link_head("Hello.World"), None);
        assert_eq!(glued_link_head("J.R.R.Tolkien"), None);
    }

    #[test]
    fn url_start_requires_word_boundary() {
        assert_eq!(find_url_start("(https://x.io"), Some(1));
        assert_eq!(find_url_start("see:www.x.com"), Some(4));
        assert_eq!(find_url_start("awww.x"), None);
        assert_eq!(find_url_start("plain"), None);
    }

    #[test]
    fn protected_ranges_cover_code_and_links() {
        let text = "use `fooBar` at https://x.com/aB now";
        let lines = split_lines(text);
        let verbatim = verbatim_lines(text, &lines);
        let p = Protected::build(text, &lines, &verbatim, std::iter::empty());
        let code = text.find("fooBar").unwrap();
        let url = text.find("aB").unwrap();
        assert!(p.contains(code));
        assert!(p.contains(url));
        assert!(!p.contains(text.find("now").unwrap()));
    }
}

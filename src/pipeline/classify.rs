//! Artifact detection.
//!
//! [`ArtifactClassifier`] finds the byte spans of each conversion artifact
//! category in a Markdown document. Detection never modifies text; the repair
//! engine turns spans into edits. Every detector is a pure function of the
//! input text and the term dictionary, so repeated calls give identical spans.

use crate::pipeline::dictionary::Dictionary;
use crate::pipeline::markup::{self, Line, Protected};
use crate::pipeline::mojibake;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// The five artifact kinds, declared in repair order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactCategory {
    UnicodeMojibake,
    SentenceBreak,
    MissingSpace,
    #[serde(rename = "CAMELCASE_SPLIT")]
    CamelCaseSplit,
    BrokenUrl,
}

impl ArtifactCategory {
    /// All categories in the order the repair engine applies them.
    pub const ALL: [ArtifactCategory; 5] = [
        ArtifactCategory::UnicodeMojibake,
        ArtifactCategory::SentenceBreak,
        ArtifactCategory::MissingSpace,
        ArtifactCategory::CamelCaseSplit,
        ArtifactCategory::BrokenUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactCategory::UnicodeMojibake => "UNICODE_MOJIBAKE",
            ArtifactCategory::SentenceBreak => "SENTENCE_BREAK",
            ArtifactCategory::MissingSpace => "MISSING_SPACE",
            ArtifactCategory::CamelCaseSplit => "CAMELCASE_SPLIT",
            ArtifactCategory::BrokenUrl => "BROKEN_URL",
        }
    }
}

impl fmt::Display for ArtifactCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected artifact: byte range `[start, end)` in the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpan {
    pub start: usize,
    pub end: usize,
    pub category: ArtifactCategory,
}

impl ArtifactSpan {
    fn new(range: Range<usize>, category: ArtifactCategory) -> Self {
        Self {
            start: range.start,
            end: range.end,
            category,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// A line break inside a URL: the `\n` at `newline` joins the URL token on
/// the line above with `continuation` at the start of the line below.
#[derive(Debug, Clone)]
struct UrlJoin {
    newline: usize,
    continuation: Range<usize>,
}

/// Line structure computed once per scan and shared by every detector.
struct Document<'a> {
    text: &'a str,
    lines: Vec<Line>,
    verbatim: Vec<bool>,
    url_joins: Vec<UrlJoin>,
}

impl<'a> Document<'a> {
    fn new(text: &'a str) -> Self {
        let lines = markup::split_lines(text);
        let verbatim = markup::verbatim_lines(text, &lines);
        let url_joins = find_url_joins(text, &lines, &verbatim);
        Self {
            text,
            lines,
            verbatim,
            url_joins,
        }
    }

    fn protected(&self) -> Protected {
        Protected::build(
            self.text,
            &self.lines,
            &self.verbatim,
            self.url_joins.iter().map(|j| j.continuation.clone()),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactClassifier {
    dictionary: Arc<Dictionary>,
}

impl ArtifactClassifier {
    pub fn new(dictionary: Dictionary) -> Self {
        Self {
            dictionary: Arc::new(dictionary),
        }
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    /// Every artifact in `text`, all categories, sorted by start offset.
    /// Spans of different categories may overlap.
    pub fn classify(&self, text: &str) -> Vec<ArtifactSpan> {
        let doc = Document::new(text);
        let protected = doc.protected();
        let mut spans = Vec::new();
        spans.extend(mojibake_spans(&doc));
        spans.extend(sentence_break_spans(&doc));
        spans.extend(missing_space_spans(&doc, &protected));
        spans.extend(camelcase_spans(&doc, &protected, &self.dictionary));
        spans.extend(broken_url_spans(&doc));
        spans.sort_by_key(|s| (s.start, s.end, s.category));
        spans
    }

    /// Spans of a single category, sorted and non-overlapping.
    pub fn detect(&self, category: ArtifactCategory, text: &str) -> Vec<ArtifactSpan> {
        match category {
            ArtifactCategory::UnicodeMojibake => self.detect_mojibake(text),
            ArtifactCategory::SentenceBreak => self.detect_sentence_breaks(text),
            ArtifactCategory::MissingSpace => self.detect_missing_spaces(text),
            ArtifactCategory::CamelCaseSplit => self.detect_camelcase(text),
            ArtifactCategory::BrokenUrl => self.detect_broken_urls(text),
        }
    }

    pub fn detect_mojibake(&self, text: &str) -> Vec<ArtifactSpan> {
        mojibake_spans(&Document::new(text))
    }

    pub fn detect_sentence_breaks(&self, text: &str) -> Vec<ArtifactSpan> {
        sentence_break_spans(&Document::new(text))
    }

    pub fn detect_missing_spaces(&self, text: &str) -> Vec<ArtifactSpan> {
        let doc = Document::new(text);
        missing_space_spans(&doc, &doc.protected())
    }

    pub fn detect_camelcase(&self, text: &str) -> Vec<ArtifactSpan> {
        let doc = Document::new(text);
        camelcase_spans(&doc, &doc.protected(), &self.dictionary)
    }

    pub fn detect_broken_urls(&self, text: &str) -> Vec<ArtifactSpan> {
        broken_url_spans(&Document::new(text))
    }
}

// ── UNICODE_MOJIBAKE ─────────────────────────────────────────────────────────

fn mojibake_spans(doc: &Document<'_>) -> Vec<ArtifactSpan> {
    mojibake::find_all(doc.text)
        .into_iter()
        .map(|r| ArtifactSpan::new(r, ArtifactCategory::UnicodeMojibake))
        .collect()
}

// ── SENTENCE_BREAK ───────────────────────────────────────────────────────────

/// A line ends a sentence when its last character is `.`, `!` or `?`,
/// optionally followed by closing quotes or brackets.
fn ends_with_terminal(line: &str) -> bool {
    const CLOSERS: &[char] = &['"', '\'', '”', '’', '»', ')', ']'];
    let core = line.trim_end_matches(CLOSERS);
    matches!(core.chars().next_back(), Some('.' | '!' | '?' | '…'))
}

fn can_continue_past(line: &str) -> bool {
    !(markup::is_heading(line)
        || markup::is_table_row(line)
        || markup::is_thematic_break(line)
        || markup::is_html_line(line)
        || markup::fence_marker(line).is_some()
        || ends_with_terminal(line.trim_end()))
}

fn continues_sentence(line: &str) -> bool {
    markup::indent_width(line) < 4
        && line
            .trim_start()
            .chars()
            .next()
            .is_some_and(char::is_lowercase)
}

fn sentence_break_spans(doc: &Document<'_>) -> Vec<ArtifactSpan> {
    let url_newlines: HashSet<usize> = doc.url_joins.iter().map(|j| j.newline).collect();
    let lines = &doc.lines;
    let mut spans = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let current = lines[i].text(doc.text);
        if current.trim().is_empty() {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < lines.len() && lines[j].text(doc.text).trim().is_empty() {
            j += 1;
        }
        if j >= lines.len() {
            break;
        }
        let next = lines[j].text(doc.text);
        let is_url = j == i + 1 && url_newlines.contains(&lines[i].end);

        if !doc.verbatim[i]
            && !doc.verbatim[j]
            && !is_url
            && can_continue_past(current)
            && continues_sentence(next)
        {
            let start = lines[i].start + current.trim_end().len();
            let end = lines[j].start + (next.len() - next.trim_start().len());
            spans.push(ArtifactSpan::new(start..end, ArtifactCategory::SentenceBreak));
        }
        i = j;
    }
    spans
}

// ── MISSING_SPACE ────────────────────────────────────────────────────────────

fn missing_space_spans(doc: &Document<'_>, protected: &Protected) -> Vec<ArtifactSpan> {
    let chars: Vec<(usize, char)> = doc.text.char_indices().collect();
    let mut spans = Vec::new();

    for k in 1..chars.len().saturating_sub(1) {
        let (pos, c) = chars[k];
        if !matches!(c, '.' | ',' | ';' | ':') || !chars[k + 1].1.is_alphabetic() {
            continue;
        }
        let prev = chars[k - 1].1;
        if prev.is_whitespace() {
            continue;
        }
        // Initials and dotted abbreviations: "J.R.R.", "e.g.", "i.e."
        if c == '.' && prev.is_alphabetic() {
            let before = k.checked_sub(2).map(|p| chars[p].1);
            if !before.is_some_and(char::is_alphabetic) {
                continue;
            }
        }
        if protected.contains(pos) {
            continue;
        }
        spans.push(ArtifactSpan::new(
            pos..pos + c.len_utf8(),
            ArtifactCategory::MissingSpace,
        ));
    }
    spans
}

// ── CAMELCASE_SPLIT ──────────────────────────────────────────────────────────

fn camelcase_spans(
    doc: &Document<'_>,
    protected: &Protected,
    dictionary: &Dictionary,
) -> Vec<ArtifactSpan> {
    let text = doc.text;
    let mut spans = Vec::new();
    let mut rest = text.char_indices().peekable();

    while let Some((start, c)) = rest.next() {
        if !c.is_alphanumeric() {
            continue;
        }
        let mut end = start + c.len_utf8();
        while let Some(&(i, n)) = rest.peek() {
            if !n.is_alphanumeric() {
                break;
            }
            end = i + n.len_utf8();
            rest.next();
        }
        let token = &text[start..end];
        let boundaries = camel_boundaries(token);
        if boundaries.is_empty() || protected.contains(start) || dictionary.contains(token) {
            continue;
        }
        spans.extend(boundaries.into_iter().map(|r| {
            ArtifactSpan::new(start + r.start..start + r.end, ArtifactCategory::CamelCaseSplit)
        }));
    }
    spans
}

/// Lowercase→uppercase letter pairs inside `token`, as ranges covering both
/// letters. `Mc`/`Mac` name prefixes do not count.
fn camel_boundaries(token: &str) -> Vec<Range<usize>> {
    let chars: Vec<(usize, char)> = token.char_indices().collect();
    let mut out = Vec::new();
    for w in chars.windows(2) {
        let ((i, a), (j, b)) = (w[0], w[1]);
        if !(a.is_lowercase() && b.is_uppercase()) {
            continue;
        }
        let prefix = &token[..j];
        if prefix == "Mc" || prefix == "Mac" {
            continue;
        }
        out.push(i..j + b.len_utf8());
    }
    out
}

// ── BROKEN_URL ───────────────────────────────────────────────────────────────

fn find_url_joins(text: &str, lines: &[Line], verbatim: &[bool]) -> Vec<UrlJoin> {
    let mut joins = Vec::new();
    for i in 0..lines.len().saturating_sub(1) {
        if verbatim[i] || verbatim[i + 1] {
            continue;
        }
        let current = lines[i].text(text);
        let next = lines[i + 1].text(text);
        if current.is_empty() || current.ends_with(char::is_whitespace) {
            continue;
        }
        if !next.starts_with(markup::is_url_char)
            || markup::is_heading(next)
            || markup::is_list_marker(next)
        {
            continue;
        }

        let token_start = current
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
            .map(|(p, c)| p + c.len_utf8())
            .unwrap_or(0);
        let token = &current[token_start..];
        let Some(offset) = markup::find_url_start(token) else {
            continue;
        };
        let url = &token[offset..];
        if !url.chars().all(markup::is_url_char) {
            continue;
        }

        let cont_len = next
            .find(|c: char| !markup::is_url_char(c))
            .unwrap_or(next.len());
        let continuation = &next[..cont_len];
        if should_join(url, continuation) {
            joins.push(UrlJoin {
                newline: lines[i].end,
                continuation: lines[i + 1].start..lines[i + 1].start + cont_len,
            });
        }
    }
    joins
}

/// Decide whether `continuation` is the rest of `url` or the start of prose.
fn should_join(url: &str, continuation: &str) -> bool {
    let Some(last) = url.chars().next_back() else {
        return false;
    };
    let structured = continuation.contains(['/', '.', '?', '=', '&', '#', '%']);
    match last {
        // A URL ending in sentence punctuation is usually a finished URL.
        '.' | ',' | ';' | ':' | '!' | '?' => structured,
        '/' | '-' | '_' | '=' | '&' | '#' | '%' | '~' | '+' => true,
        c if c.is_ascii_alphanumeric() => structured || !host_has_dot(url),
        _ => false,
    }
}

fn host_has_dot(url: &str) -> bool {
    let after_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    after_scheme
        .split(['/', '?', '#'])
        .next()
        .is_some_and(|host| host.contains('.'))
}

fn broken_url_spans(doc: &Document<'_>) -> Vec<ArtifactSpan> {
    doc.url_joins
        .iter()
        .map(|j| ArtifactSpan::new(j.newline..j.newline + 1, ArtifactCategory::BrokenUrl))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ArtifactClassifier {
        ArtifactClassifier::default()
    }

    fn categories(text: &str) -> Vec<ArtifactCategory> {
        classifier().classify(text).into_iter().map(|s| s.category).collect()
    }

    #[test]
    fn category_names() {
        assert_eq!(ArtifactCategory::CamelCaseSplit.to_string(), "CAMELCASE_SPLIT");
        let json = serde_json::to_string(&ArtifactCategory::CamelCaseSplit).unwrap();
        assert_eq!(json, "\"CAMELCASE_SPLIT\"");
        let json = serde_json::to_string(&ArtifactCategory::UnicodeMojibake).unwrap();
        assert_eq!(json, "\"UNICODE_MOJIBAKE\"");
    }

    #[test]
    fn clean_text_has_no_artifacts() {
        assert!(classifier()
            .classify("The cat sat on the mat.\n\nA second paragraph.")
            .is_empty());
    }

    #[test]
    fn sentence_break_across_blank_line() {
        let text = "The cat sat\n\non the mat.";
        let spans = classifier().detect_sentence_breaks(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(&text[spans[0].range()], "\n\n");
    }

    #[test]
    fn sentence_break_skips_terminated_lines() {
        assert!(classifier()
            .detect_sentence_breaks("It ended.\nthen more")
            .is_empty());
        assert!(classifier()
            .detect_sentence_breaks("He said \"stop.\"\nand left")
            .is_empty());
    }

    #[test]
    fn sentence_break_skips_structure() {
        let c = classifier();
        assert!(c.detect_sentence_breaks("# Heading\nlowercase body").is_empty());
        assert!(c.detect_sentence_breaks("| a | b |\nnext").is_empty());
        assert!(c.detect_sentence_breaks("text\n    indented code").is_empty());
        assert!(c.detect_sentence_breaks("```\nlet a\nb = 1\n```").is_empty());
        assert!(c.detect_sentence_breaks("word\nUppercase start").is_empty());
        assert!(c.detect_sentence_breaks("---\n\nlower after rule").is_empty());
    }

    #[test]
    fn missing_space_detected() {
        let text = "Hello.World";
        let spans = classifier().detect_missing_spaces(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(&text[spans[0].range()], ".");
    }

    #[test]
    fn missing_space_exceptions() {
        let c = classifier();
        assert!(c.detect_missing_spaces("pi is 3.14 today").is_empty());
        assert!(c.detect_missing_spaces("see e.g.this").is_empty());
        assert!(c.detect_missing_spaces("J.R.R.Tolkien").is_empty());
        assert!(c.detect_missing_spaces("visit example.com now").is_empty());
        assert!(c.detect_missing_spaces("open README.md first").is_empty());
        assert!(c.detect_missing_spaces("mail jane.doe@example.org").is_empty());
        assert!(c.detect_missing_spaces("run `a.b` here").is_empty());
        assert!(c.detect_missing_spaces("[x](http://a.b/c.d)").is_empty());
        assert!(c.detect_missing_spaces("see example.co.uk today").is_empty());
    }

    #[test]
    fn missing_space_after_glued_link() {
        let c = classifier();
        let text = "Visit example.com.Then we left.";
        let spans = c.detect_missing_spaces(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, text.find(".Then").unwrap());

        let text = "Write to jane@example.org,and wait.";
        let spans = c.detect_missing_spaces(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, text.find(",and").unwrap());
    }

    #[test]
    fn missing_space_other_punctuation() {
        let text = "red,green;blue:yellow";
        assert_eq!(classifier().detect_missing_spaces(text).len(), 3);
    }

    #[test]
    fn camelcase_detected_outside_dictionary() {
        let text = "the quickBrown fox";
        let spans = classifier().detect_camelcase(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(&text[spans[0].range()], "kB");
    }

    #[test]
    fn camelcase_respects_dictionary_and_names() {
        let c = classifier();
        assert!(c.detect_camelcase("my iPhone and JavaScript").is_empty());
        assert!(c.detect_camelcase("McDonald and MacArthur").is_empty());
        assert!(c.detect_camelcase("call `parseJson` now").is_empty());
    }

    #[test]
    fn camelcase_custom_dictionary() {
        let c = ArtifactClassifier::new(Dictionary::builtin().with_terms(["deBruijn"]));
        assert!(c.detect_camelcase("a deBruijn graph").is_empty());
    }

    #[test]
    fn broken_url_detected() {
        let text = "see https://exa\nmple.com/page for details";
        let spans = classifier().detect_broken_urls(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, text.find('\n').unwrap());
    }

    #[test]
    fn broken_url_ignores_finished_urls() {
        let c = classifier();
        assert!(c.detect_broken_urls("see https://example.com/page.\nthe end").is_empty());
        assert!(c.detect_broken_urls("see https://example.com/page\n- item").is_empty());
        assert!(c.detect_broken_urls("see https://example.com/page\n\nmore").is_empty());
    }

    #[test]
    fn broken_url_is_not_a_sentence_break() {
        let cats = categories("see https://exa\nmple.com/page for details");
        assert_eq!(cats, vec![ArtifactCategory::BrokenUrl]);
    }

    #[test]
    fn mojibake_detected() {
        let spans = classifier().detect_mojibake("donâ€™t");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].category, ArtifactCategory::UnicodeMojibake);
    }

    #[test]
    fn detection_is_deterministic() {
        let text = "Ã© sat\non it.Then camelCase https://a\nb.org/x";
        assert_eq!(classifier().classify(text), classifier().classify(text));
    }
}

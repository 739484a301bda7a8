//! Provenance matching: link a cleaned document to its catalog record.
//!
//! ## Scoring
//!
//! Three signals, each in `0.0..=1.0`:
//!
//! | Signal   | Weight | Computation |
//! |----------|--------|-------------|
//! | filename | 0.4    | Jaro-Winkler between the normalised source file stem and the record's filename stem (or title) |
//! | title    | 0.4    | Dice overlap of normalised title tokens |
//! | author   | 0.2    | Dice overlap of normalised author tokens |
//!
//! A signal is only counted when both sides have data; the weights of the
//! signals present are renormalised to sum to one. The best candidate is
//! linked when it clears the threshold and beats the runner-up by more than
//! the ambiguity margin. Everything else is UNMATCHED with a reason and goes to
//! manual review: no document is ever dropped.

use crate::config::MatcherConfig;
use crate::error::{CatalogError, RefineryError};
use crate::pipeline::markup;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const FILENAME_WEIGHT: f64 = 0.4;
const TITLE_WEIGHT: f64 = 0.4;
const AUTHOR_WEIGHT: f64 = 0.2;

/// Lines scanned for a title or author.
const HEADER_LINES: usize = 40;

/// Candidates fetched per lookup.
const MAX_CANDIDATES: usize = 50;

/// Candidates kept on a link for reviewers.
const REVIEW_CANDIDATES: usize = 3;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "the", "of", "in", "on", "for", "to", "with", "by", "at", "from",
];

// ── Catalog ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Normalised lookup keys for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogQuery {
    pub filename_key: String,
    pub title_tokens: Vec<String>,
    pub author_tokens: Vec<String>,
}

/// Read-only access to the external record store.
pub trait Catalog: Send + Sync {
    /// Candidate records sharing at least one normalised token with the query.
    fn lookup(&self, query: &CatalogQuery) -> Result<Vec<CatalogRecord>, CatalogError>;
}

/// A catalog loaded from a JSONL file, with an in-memory token index.
#[derive(Debug, Clone, Default)]
pub struct JsonlCatalog {
    records: Vec<CatalogRecord>,
    index: HashMap<String, Vec<usize>>,
}

impl JsonlCatalog {
    pub fn from_records(records: Vec<CatalogRecord>) -> Self {
        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, r) in records.iter().enumerate() {
            let mut keys: HashSet<String> = tokens(&r.title).into_iter().collect();
            keys.extend(r.authors.iter().flat_map(|a| tokens(a)));
            if let Some(f) = &r.filename {
                keys.extend(tokens(&file_stem(f)));
            }
            for k in keys {
                index.entry(k).or_default().push(i);
            }
        }
        Self { records, index }
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|e| CatalogError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut records = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|e| CatalogError::Parse {
                path: path.to_path_buf(),
                line: i + 1,
                detail: e.to_string(),
            })?;
            records.push(record);
        }
        debug!("Loaded {} catalog records from {}", records.len(), path.display());
        Ok(Self::from_records(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Catalog for JsonlCatalog {
    fn lookup(&self, query: &CatalogQuery) -> Result<Vec<CatalogRecord>, CatalogError> {
        let mut hits: HashMap<usize, usize> = HashMap::new();
        let filename_tokens = tokens(&query.filename_key);
        for t in query
            .title_tokens
            .iter()
            .chain(&query.author_tokens)
            .chain(&filename_tokens)
        {
            for &i in self.index.get(t).into_iter().flatten() {
                *hits.entry(i).or_insert(0) += 1;
            }
        }
        let mut ranked: Vec<(usize, usize)> = hits.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(ranked
            .into_iter()
            .take(MAX_CANDIDATES)
            .map(|(i, _)| self.records[i].clone())
            .collect())
    }
}

// ── Links ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkTarget {
    Record(String),
    Unmatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    /// Best candidate scored below the threshold.
    LowConfidence,
    /// Two or more candidates within the ambiguity margin of each other.
    Ambiguous,
    /// The catalog returned nothing for this document.
    NoCandidates,
    /// The catalog lookup itself failed.
    CatalogUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub record_id: String,
    pub score: f64,
}

/// The outcome of matching one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogLink {
    pub job_id: String,
    pub target: LinkTarget,
    /// Score of the best candidate (0 when there was none).
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnmatchedReason>,
    /// Top candidates, kept so reviewers see what was considered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<ScoredCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl CatalogLink {
    pub fn is_linked(&self) -> bool {
        matches!(self.target, LinkTarget::Record(_))
    }

    pub fn record_id(&self) -> Option<&str> {
        match &self.target {
            LinkTarget::Record(id) => Some(id),
            LinkTarget::Unmatched => None,
        }
    }
}

// ── Metadata extraction ──────────────────────────────────────────────────────

/// Title and author pulled from the head of a cleaned document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
}

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s{0,3}#{1,6}\s+(.+?)\s*#*\s*$").unwrap());
static RE_AUTHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:by|authors?\s*:)\s+(.+?)\s*$").unwrap());
static RE_FRONT_MATTER_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(title|authors?)\s*:\s*(.+?)\s*$").unwrap());

fn strip_emphasis(s: &str) -> String {
    s.trim_matches(|c: char| c == '*' || c == '_' || c.is_whitespace())
        .trim_matches('"')
        .to_string()
}

pub fn extract_metadata(text: &str) -> DocumentMetadata {
    let mut meta = DocumentMetadata::default();
    let mut lines = text.lines().take(HEADER_LINES).peekable();

    if lines.peek().map(|l| l.trim_end()) == Some("---") {
        lines.next();
        for line in lines.by_ref() {
            if matches!(line.trim_end(), "---" | "...") {
                break;
            }
            if let Some(c) = RE_FRONT_MATTER_FIELD.captures(line) {
                let value = strip_emphasis(&c[2]);
                if c[1].starts_with("title") {
                    meta.title.get_or_insert(value);
                } else {
                    meta.author.get_or_insert(value);
                }
            }
        }
    }

    let mut first_line: Option<String> = None;
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if meta.title.is_none() {
            if let Some(c) = RE_HEADING.captures(line) {
                meta.title = Some(strip_emphasis(&c[1]));
                continue;
            }
        }
        if meta.author.is_none() {
            if let Some(c) = RE_AUTHOR.captures(line) {
                meta.author = Some(strip_emphasis(&c[1]));
                continue;
            }
        }
        if first_line.is_none()
            && !trimmed.starts_with(['<', '!', '|', '`'])
            && !markup::is_list_marker(trimmed)
            && !markup::is_thematic_break(trimmed)
        {
            first_line = Some(trimmed.chars().take(200).collect());
        }
    }
    if meta.title.is_none() {
        meta.title = first_line.map(|l| strip_emphasis(&l));
    }
    meta
}

// ── Normalisation ────────────────────────────────────────────────────────────

/// Lowercase, alphanumeric words with stopwords removed.
pub fn tokens(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Normalised comparison key: tokens joined by single spaces.
pub fn normalize_key(s: &str) -> String {
    tokens(s).join(" ")
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn dice(a: &[String], b: &[String]) -> f64 {
    let a: HashSet<&String> = a.iter().collect();
    let b: HashSet<&String> = b.iter().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count();
    2.0 * shared as f64 / (a.len() + b.len()) as f64
}

// ── Matcher ──────────────────────────────────────────────────────────────────

pub struct ProvenanceMatcher {
    catalog: Arc<dyn Catalog>,
    threshold: f64,
    ambiguity_margin: f64,
}

impl ProvenanceMatcher {
    pub fn new(catalog: Arc<dyn Catalog>, threshold: f64, ambiguity_margin: f64) -> Self {
        Self {
            catalog,
            threshold,
            ambiguity_margin,
        }
    }

    /// Matcher for the configured catalog, or `None` when matching is off.
    pub fn from_config(config: &MatcherConfig) -> Result<Option<Self>, RefineryError> {
        let Some(path) = &config.catalog_path else {
            return Ok(None);
        };
        let catalog = JsonlCatalog::load(path)?;
        Ok(Some(Self::new(
            Arc::new(catalog),
            config.threshold,
            config.ambiguity_margin,
        )))
    }

    pub fn query_for(source: &Path, meta: &DocumentMetadata) -> CatalogQuery {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        CatalogQuery {
            filename_key: normalize_key(&stem),
            title_tokens: meta.title.as_deref().map(tokens).unwrap_or_default(),
            author_tokens: meta.author.as_deref().map(tokens).unwrap_or_default(),
        }
    }

    /// Score one record against a query.
    pub fn score(query: &CatalogQuery, record: &CatalogRecord) -> f64 {
        let mut total = 0.0;
        let mut weight = 0.0;

        if !query.filename_key.is_empty() {
            let title_key = normalize_key(&record.title);
            let by_title = strsim::jaro_winkler(&query.filename_key, &title_key);
            let by_file = record
                .filename
                .as_deref()
                .map(|f| strsim::jaro_winkler(&query.filename_key, &normalize_key(&file_stem(f))))
                .unwrap_or(0.0);
            total += FILENAME_WEIGHT * by_title.max(by_file);
            weight += FILENAME_WEIGHT;
        }

        if !query.title_tokens.is_empty() {
            total += TITLE_WEIGHT * dice(&query.title_tokens, &tokens(&record.title));
            weight += TITLE_WEIGHT;
        }

        if !query.author_tokens.is_empty() && !record.authors.is_empty() {
            let record_authors: Vec<String> = record.authors.iter().flat_map(|a| tokens(a)).collect();
            total += AUTHOR_WEIGHT * dice(&query.author_tokens, &record_authors);
            weight += AUTHOR_WEIGHT;
        }

        if weight == 0.0 {
            0.0
        } else {
            total / weight
        }
    }

    /// Link `clean_text` (converted from `source`) to a catalog record.
    /// Always returns a link; failures become UNMATCHED for review.
    pub fn match_document(&self, job_id: &str, source: &Path, clean_text: &str) -> CatalogLink {
        let meta = extract_metadata(clean_text);
        let query = Self::query_for(source, &meta);
        let unmatched = |reason, confidence, candidates| CatalogLink {
            job_id: job_id.to_string(),
            target: LinkTarget::Unmatched,
            confidence,
            reason: Some(reason),
            candidates,
            source: Some(source.to_path_buf()),
        };

        let records = match self.catalog.lookup(&query) {
            Ok(r) => r,
            Err(e) => {
                warn!("{job_id}: catalog lookup failed: {e}");
                return unmatched(UnmatchedReason::CatalogUnavailable, 0.0, Vec::new());
            }
        };
        if records.is_empty() {
            return unmatched(UnmatchedReason::NoCandidates, 0.0, Vec::new());
        }

        let mut scored: Vec<ScoredCandidate> = records
            .iter()
            .map(|r| ScoredCandidate {
                record_id: r.id.clone(),
                score: Self::score(&query, r),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        scored.truncate(REVIEW_CANDIDATES);

        let best = scored[0].clone();
        debug!("{job_id}: best candidate {} at {:.3}", best.record_id, best.score);

        if best.score < self.threshold {
            return unmatched(UnmatchedReason::LowConfidence, best.score, scored);
        }
        if let Some(second) = scored.get(1) {
            if second.score >= self.threshold && best.score - second.score <= self.ambiguity_margin {
                return unmatched(UnmatchedReason::Ambiguous, best.score, scored);
            }
        }
        CatalogLink {
            job_id: job_id.to_string(),
            target: LinkTarget::Record(best.record_id),
            confidence: best.score,
            reason: None,
            candidates: Vec::new(),
            source: Some(source.to_path_buf()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, title: &str, authors: &[&str]) -> CatalogRecord {
        CatalogRecord {
            id: id.into(),
            title: title.into(),
            authors: authors.iter().map(|s| s.to_string()).collect(),
            filename: None,
        }
    }

    fn matcher(records: Vec<CatalogRecord>) -> ProvenanceMatcher {
        ProvenanceMatcher::new(Arc::new(JsonlCatalog::from_records(records)), 0.75, 0.02)
    }

    const DOC: &str = "# Deep Learning for Cats\n\nby Jane Smith\n\nCats are great.";

    #[test]
    fn metadata_from_heading_and_byline() {
        let meta = extract_metadata(DOC);
        assert_eq!(meta.title.as_deref(), Some("Deep Learning for Cats"));
        assert_eq!(meta.author.as_deref(), Some("Jane Smith"));
    }

    #[test]
    fn metadata_from_front_matter() {
        let meta = extract_metadata("---\ntitle: \"On Graphs\"\nauthor: A. Turing\n---\n\nBody");
        assert_eq!(meta.title.as_deref(), Some("On Graphs"));
        assert_eq!(meta.author.as_deref(), Some("A. Turing"));
    }

    #[test]
    fn metadata_falls_back_to_first_line() {
        let meta = extract_metadata("\n\n**A Plain Title**\n\ntext");
        assert_eq!(meta.title.as_deref(), Some("A Plain Title"));
        assert!(meta.author.is_none());
    }

    #[test]
    fn tokens_drop_stopwords_and_punctuation() {
        assert_eq!(tokens("The Art of War!"), vec!["art", "war"]);
        assert_eq!(normalize_key("deep_learning-for_cats"), "deep learning cats");
    }

    #[test]
    fn exact_match_links() {
        let m = matcher(vec![
            record("cat-1", "Deep Learning for Cats", &["Jane Smith"]),
            record("dog-1", "Shallow Learning for Dogs", &["Bob Jones"]),
        ]);
        let link = m.match_document("job-1", Path::new("/c/deep_learning_for_cats.pdf"), DOC);
        assert!(link.is_linked(), "{link:?}");
        assert_eq!(link.record_id(), Some("cat-1"));
        assert!(link.confidence > 0.95);
        assert!(link.reason.is_none());
    }

    #[test]
    fn weak_match_is_low_confidence() {
        let m = matcher(vec![record("x", "Cats in Medieval Art", &["Someone Else"])]);
        let link = m.match_document("job-1", Path::new("/c/scan0001.pdf"), DOC);
        assert!(!link.is_linked());
        assert_eq!(link.reason, Some(UnmatchedReason::LowConfidence));
        assert_eq!(link.candidates.len(), 1);
    }

    #[test]
    fn duplicate_records_are_ambiguous() {
        let m = matcher(vec![
            record("a", "Deep Learning for Cats", &["Jane Smith"]),
            record("b", "Deep Learning for Cats", &["Jane Smith"]),
        ]);
        let link = m.match_document("job-1", Path::new("/c/deep_learning_for_cats.pdf"), DOC);
        assert_eq!(link.target, LinkTarget::Unmatched);
        assert_eq!(link.reason, Some(UnmatchedReason::Ambiguous));
        assert_eq!(link.candidates.len(), 2);
    }

    #[test]
    fn no_candidates() {
        let m = matcher(vec![record("x", "Quantum Chromodynamics", &[])]);
        let link = m.match_document("job-1", Path::new("/c/zzz.pdf"), "# Botany\n");
        assert_eq!(link.reason, Some(UnmatchedReason::NoCandidates));
        assert_eq!(link.confidence, 0.0);
    }

    struct BrokenCatalog;

    impl Catalog for BrokenCatalog {
        fn lookup(&self, _q: &CatalogQuery) -> Result<Vec<CatalogRecord>, CatalogError> {
            Err(CatalogError::Query("connection refused".into()))
        }
    }

    #[test]
    fn catalog_failure_routes_to_review() {
        let m = ProvenanceMatcher::new(Arc::new(BrokenCatalog), 0.75, 0.02);
        let link = m.match_document("job-1", Path::new("a.pdf"), DOC);
        assert_eq!(link.reason, Some(UnmatchedReason::CatalogUnavailable));
    }

    #[test]
    fn link_json_shape() {
        let m = matcher(vec![record("cat-1", "Deep Learning for Cats", &["Jane Smith"])]);
        let link = m.match_document("job-1", Path::new("deep_learning_for_cats.pdf"), DOC);
        let json = serde_json::to_string(&link).unwrap();
        assert!(json.contains("\"target\":{\"RECORD\":\"cat-1\"}"), "{json}");
        let unmatched = serde_json::to_string(&LinkTarget::Unmatched).unwrap();
        assert_eq!(unmatched, "\"UNMATCHED\"");
    }

    #[test]
    fn load_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.jsonl");
        std::fs::write(&path, "{\"id\":\"a\",\"title\":\"T\"}\n\nnot json\n").unwrap();
        match JsonlCatalog::load(&path).unwrap_err() {
            CatalogError::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn matching_disabled_without_catalog() {
        assert!(ProvenanceMatcher::from_config(&MatcherConfig::default())
            .unwrap()
            .is_none());
    }
}

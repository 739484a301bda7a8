//! Deterministic, idempotent artifact repair.
//!
//! The engine runs one pass per [`ArtifactCategory`] in a fixed order
//! (mojibake, sentence break, missing space, camelCase, broken URL). Each pass
//! detects spans, applies every fix in one sweep, and repeats until its
//! detector comes back empty. Because a later pass can in principle expose
//! work for an earlier one, the whole ordered round is repeated until a round
//! makes no fixes at all, which makes `repair(repair(x)) == repair(x)`.
//!
//! ## Fail-soft
//!
//! A pass that returns an error (or panics) is skipped for the rest of the
//! call and recorded in [`RepairResult::detail`]; the remaining passes still
//! run. A repair call itself never fails.

use crate::error::RepairPassError;
use crate::output::RepairResult;
use crate::pipeline::classify::{ArtifactCategory, ArtifactClassifier, ArtifactSpan};
use crate::pipeline::mojibake;
use crate::pipeline::normalize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Upper bound on detect→fix sweeps inside one pass.
const MAX_PASS_SWEEPS: usize = 16;

/// Upper bound on ordered rounds over all passes.
const MAX_ROUNDS: usize = 4;

/// A text replacement derived from one span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub range: Range<usize>,
    pub replacement: String,
}

impl Edit {
    fn insert(at: usize, s: &str) -> Self {
        Self {
            range: at..at,
            replacement: s.to_string(),
        }
    }
}

/// Static description of one category: how to find it and how to fix a span.
pub struct ArtifactPattern {
    pub category: ArtifactCategory,
    pub detector: fn(&ArtifactClassifier, &str) -> Vec<ArtifactSpan>,
    pub fixer: fn(&str, &ArtifactSpan) -> Option<Edit>,
}

/// The built-in patterns, in repair order.
pub static PATTERNS: [ArtifactPattern; 5] = [
    ArtifactPattern {
        category: ArtifactCategory::UnicodeMojibake,
        detector: ArtifactClassifier::detect_mojibake,
        fixer: fix_mojibake,
    },
    ArtifactPattern {
        category: ArtifactCategory::SentenceBreak,
        detector: ArtifactClassifier::detect_sentence_breaks,
        fixer: fix_sentence_break,
    },
    ArtifactPattern {
        category: ArtifactCategory::MissingSpace,
        detector: ArtifactClassifier::detect_missing_spaces,
        fixer: fix_missing_space,
    },
    ArtifactPattern {
        category: ArtifactCategory::CamelCaseSplit,
        detector: ArtifactClassifier::detect_camelcase,
        fixer: fix_camelcase,
    },
    ArtifactPattern {
        category: ArtifactCategory::BrokenUrl,
        detector: ArtifactClassifier::detect_broken_urls,
        fixer: fix_broken_url,
    },
];

fn fix_mojibake(text: &str, span: &ArtifactSpan) -> Option<Edit> {
    let ch = mojibake::replacement(&text[span.range()])?;
    Some(Edit {
        range: span.range(),
        replacement: ch.to_string(),
    })
}

fn fix_sentence_break(_text: &str, span: &ArtifactSpan) -> Option<Edit> {
    Some(Edit {
        range: span.range(),
        replacement: " ".to_string(),
    })
}

fn fix_missing_space(_text: &str, span: &ArtifactSpan) -> Option<Edit> {
    Some(Edit::insert(span.end, " "))
}

fn fix_camelcase(text: &str, span: &ArtifactSpan) -> Option<Edit> {
    let lower = text[span.start..].chars().next()?;
    Some(Edit::insert(span.start + lower.len_utf8(), " "))
}

fn fix_broken_url(_text: &str, span: &ArtifactSpan) -> Option<Edit> {
    Some(Edit {
        range: span.range(),
        replacement: String::new(),
    })
}

/// Apply non-overlapping edits in one left-to-right sweep. Edits that overlap
/// an earlier one are dropped (they are re-detected on the next sweep).
pub fn apply_edits(text: &str, mut edits: Vec<Edit>) -> (String, usize) {
    edits.sort_by_key(|e| (e.range.start, e.range.end));
    let mut out = String::with_capacity(text.len() + edits.len());
    let mut cursor = 0;
    let mut applied = 0;
    for edit in edits {
        if edit.range.start < cursor {
            continue;
        }
        out.push_str(&text[cursor..edit.range.start]);
        out.push_str(&edit.replacement);
        cursor = edit.range.end;
        applied += 1;
    }
    out.push_str(&text[cursor..]);
    (out, applied)
}

// ── Passes ───────────────────────────────────────────────────────────────────

/// Output of one pass over a document.
#[derive(Debug, Clone)]
pub struct PassOutput {
    pub text: String,
    pub fixes: usize,
}

/// One repair stage. The engine holds one per category.
pub trait RepairPass: Send + Sync {
    fn category(&self) -> ArtifactCategory;

    fn apply(&self, text: &str) -> Result<PassOutput, RepairPassError>;
}

/// A [`RepairPass`] driven by an [`ArtifactPattern`].
pub struct PatternPass {
    pattern: &'static ArtifactPattern,
    classifier: Arc<ArtifactClassifier>,
}

impl PatternPass {
    pub fn new(pattern: &'static ArtifactPattern, classifier: Arc<ArtifactClassifier>) -> Self {
        Self {
            pattern,
            classifier,
        }
    }
}

impl RepairPass for PatternPass {
    fn category(&self) -> ArtifactCategory {
        self.pattern.category
    }

    fn apply(&self, text: &str) -> Result<PassOutput, RepairPassError> {
        let mut current = text.to_string();
        let mut fixes = 0;
        for _ in 0..MAX_PASS_SWEEPS {
            let spans = (self.pattern.detector)(&self.classifier, &current);
            if spans.is_empty() {
                return Ok(PassOutput {
                    text: current,
                    fixes,
                });
            }
            let edits: Vec<Edit> = spans
                .iter()
                .filter_map(|s| (self.pattern.fixer)(&current, s))
                .collect();
            let (next, applied) = apply_edits(&current, edits);
            if applied == 0 || next == current {
                return Err(RepairPassError {
                    category: self.pattern.category,
                    detail: format!("{} spans detected but none could be fixed", spans.len()),
                });
            }
            fixes += applied;
            current = next;
        }
        Err(RepairPassError {
            category: self.pattern.category,
            detail: format!("did not settle after {MAX_PASS_SWEEPS} sweeps"),
        })
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Output of [`RepairEngine::repair`]: the cleaned text plus its accounting.
#[derive(Debug, Clone)]
pub struct Repaired {
    pub text: String,
    pub result: RepairResult,
}

pub struct RepairEngine {
    passes: Vec<Box<dyn RepairPass>>,
}

impl Default for RepairEngine {
    fn default() -> Self {
        Self::new(ArtifactClassifier::default())
    }
}

impl RepairEngine {
    /// Engine with the built-in passes, sharing `classifier`'s dictionary.
    pub fn new(classifier: ArtifactClassifier) -> Self {
        let classifier = Arc::new(classifier);
        let passes = PATTERNS
            .iter()
            .map(|p| Box::new(PatternPass::new(p, Arc::clone(&classifier))) as Box<dyn RepairPass>)
            .collect();
        Self { passes }
    }

    /// Replace the pass for `pass.category()`, keeping the fixed order.
    pub fn with_pass(mut self, pass: Box<dyn RepairPass>) -> Self {
        let category = pass.category();
        match self.passes.iter().position(|p| p.category() == category) {
            Some(idx) => self.passes[idx] = pass,
            None => {
                self.passes.push(pass);
                self.passes.sort_by_key(|p| p.category());
            }
        }
        self
    }

    /// Repair `raw` and account for every fix. Never fails.
    pub fn repair(&self, raw: &str, job_id: Option<&str>) -> Repaired {
        let mut text = normalize::prelude(raw);
        let mut fixes: BTreeMap<ArtifactCategory, usize> =
            ArtifactCategory::ALL.iter().map(|c| (*c, 0)).collect();
        let mut failed: BTreeSet<ArtifactCategory> = BTreeSet::new();
        let mut detail = Vec::new();
        let mut settled = false;

        for round in 0..MAX_ROUNDS {
            let mut round_fixes = 0;
            for pass in &self.passes {
                let category = pass.category();
                if failed.contains(&category) {
                    continue;
                }
                match run_guarded(pass.as_ref(), &text) {
                    Ok(out) => {
                        if out.fixes > 0 {
                            debug!(?job_id, %category, round, fixes = out.fixes, "repair pass applied");
                        }
                        *fixes.entry(category).or_insert(0) += out.fixes;
                        round_fixes += out.fixes;
                        text = out.text;
                    }
                    Err(e) => {
                        warn!(?job_id, "{}", e);
                        failed.insert(category);
                        detail.push(e.to_string());
                    }
                }
            }
            if round_fixes == 0 {
                settled = true;
                break;
            }
        }
        if !settled {
            warn!(?job_id, "repair did not settle after {MAX_ROUNDS} rounds");
            detail.push(format!("repair did not settle after {MAX_ROUNDS} rounds"));
        }

        let result = RepairResult {
            job_id: job_id.map(str::to_string),
            fixes_by_category: fixes,
            output_hash: hash_text(&text),
            detail,
        };
        Repaired { text, result }
    }
}

/// Run a pass, converting a panic into a [`RepairPassError`].
fn run_guarded(pass: &dyn RepairPass, text: &str) -> Result<PassOutput, RepairPassError> {
    match panic::catch_unwind(AssertUnwindSafe(|| pass.apply(text))) {
        Ok(result) => result,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "pass panicked".to_string());
            Err(RepairPassError {
                category: pass.category(),
                detail,
            })
        }
    }
}

/// Lowercase hex SHA-256 of the cleaned text.
pub fn hash_text(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingPass(ArtifactCategory);

    impl RepairPass for FailingPass {
        fn category(&self) -> ArtifactCategory {
            self.0
        }

        fn apply(&self, _text: &str) -> Result<PassOutput, RepairPassError> {
            Err(RepairPassError {
                category: self.0,
                detail: "synthetic failure".into(),
            })
        }
    }

    struct PanickingPass;

    impl RepairPass for PanickingPass {
        fn category(&self) -> ArtifactCategory {
            ArtifactCategory::BrokenUrl
        }

        fn apply(&self, _text: &str) -> Result<PassOutput, RepairPassError> {
            panic!("detector blew up")
        }
    }

    fn engine() -> RepairEngine {
        RepairEngine::default()
    }

    #[test]
    fn patterns_are_in_repair_order() {
        let order: Vec<_> = PATTERNS.iter().map(|p| p.category).collect();
        assert_eq!(order, ArtifactCategory::ALL.to_vec());
    }

    #[test]
    fn apply_edits_skips_overlaps() {
        let edits = vec![
            Edit { range: 0..3, replacement: "X".into() },
            Edit { range: 2..4, replacement: "Y".into() },
            Edit::insert(5, "-"),
        ];
        let (out, applied) = apply_edits("abcdefg", edits);
        assert_eq!(out, "Xde-fg");
        assert_eq!(applied, 2);
    }

    #[test]
    fn sentence_break_is_joined() {
        let r = engine().repair("The cat sat\n\non the mat.", None);
        assert_eq!(r.text, "The cat sat on the mat.");
        assert_eq!(r.result.fixes_by_category[&ArtifactCategory::SentenceBreak], 1);
    }

    #[test]
    fn mojibake_is_decoded() {
        let r = engine().repair("Itâ€™s a cafÃ©.", None);
        assert_eq!(r.text, "It’s a café.");
        assert_eq!(r.result.fixes_by_category[&ArtifactCategory::UnicodeMojibake], 2);
    }

    #[test]
    fn every_category_is_reported() {
        let r = engine().repair("clean text.", None);
        assert_eq!(r.result.fixes_by_category.len(), 5);
        assert!(r.result.fixes_by_category.values().all(|&n| n == 0));
        assert!(r.result.detail.is_empty());
    }

    #[test]
    fn failing_pass_is_skipped() {
        let e = engine().with_pass(Box::new(FailingPass(ArtifactCategory::CamelCaseSplit)));
        let r = e.repair("Hello.World and fooBar", Some("job-1"));
        assert_eq!(r.text, "Hello. World and fooBar");
        assert_eq!(r.result.fixes_by_category[&ArtifactCategory::MissingSpace], 1);
        assert_eq!(r.result.fixes_by_category[&ArtifactCategory::CamelCaseSplit], 0);
        assert_eq!(r.result.detail.len(), 1);
        assert!(r.result.detail[0].contains("CAMELCASE_SPLIT"));
    }

    #[test]
    fn panicking_pass_is_contained() {
        let e = engine().with_pass(Box::new(PanickingPass));
        let r = e.repair("see https://exa\nmple.com/x", None);
        assert_eq!(r.result.detail.len(), 1);
        assert!(r.result.detail[0].contains("detector blew up"));
        assert_eq!(r.result.fixes_by_category[&ArtifactCategory::BrokenUrl], 0);
    }

    #[test]
    fn output_hash_matches_text() {
        let r = engine().repair("abc", None);
        assert_eq!(r.result.output_hash, hash_text(&r.text));
        assert_eq!(r.result.output_hash.len(), 64);
    }
}

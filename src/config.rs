//! Configuration for single-document and batch runs.
//!
//! Every knob lives in [`RefineryConfig`], built via [`RefineryConfigBuilder`].
//! Setters clamp obviously out-of-range values; [`RefineryConfigBuilder::build`]
//! rejects combinations that cannot work (a heartbeat timeout shorter than the
//! heartbeat interval, an uncompilable failure-rule regex).
//!
//! The same knobs can come from a TOML file ([`FileConfig`]):
//!
//! ```toml
//! [batch]
//! workers = 8
//! max_attempts = 3
//! output_dir = "refinery-out"
//!
//! [converter]
//! program = "marker_single"
//! timeout_secs = 900
//!
//! [[converter.failure_rules]]
//! kind = "permanent"
//! stderr_pattern = "(?i)encrypted"
//!
//! [repair]
//! extra_terms = ["QuickSilver"]
//!
//! [matcher]
//! catalog_path = "catalog.jsonl"
//! threshold = 0.8
//! ```

use crate::error::RefineryError;
use crate::pipeline::dictionary::Dictionary;
use crate::progress::ProgressCallback;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for conversion runs.
///
/// # Example
/// ```rust
/// use pdf_refinery::RefineryConfig;
///
/// let config = RefineryConfig::builder()
///     .workers(4)
///     .max_attempts(5)
///     .output_dir("out")
///     .build()
///     .unwrap();
/// assert_eq!(config.workers, 4);
/// ```
#[derive(Clone)]
pub struct RefineryConfig {
    /// Concurrent Converter processes. Default: number of logical CPUs.
    pub workers: usize,

    /// Attempts per job before a transient failure becomes permanent. Default: 3.
    pub max_attempts: u32,

    /// First retry delay in milliseconds; doubles per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Ceiling for a single retry delay. Default: 30 000.
    pub max_backoff_ms: u64,

    pub converter: ConverterConfig,

    /// How often the scheduler refreshes its ledger lock. Default: 15.
    pub heartbeat_interval_secs: u64,

    /// A lock older than this belongs to a dead scheduler. Default: 60.
    pub heartbeat_timeout_secs: u64,

    /// Grace period for in-flight jobs after a stop request. Default: 30.
    pub hard_stop_timeout_secs: u64,

    /// Root for `ledger.jsonl`, `raw/`, `clean/`, `links.jsonl` and
    /// `review.jsonl`. Default: `refinery-out`.
    pub output_dir: PathBuf,

    /// Keep each job's raw Converter output under `raw/`. Default: true.
    pub keep_raw: bool,

    pub repair: RepairConfig,

    pub matcher: MatcherConfig,

    /// Receives batch and job events. Default: None.
    pub progress_callback: Option<ProgressCallback>,
}

/// How the external Converter is invoked and how its failures are read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Program name or path. Default: `converter`.
    pub program: String,
    /// Arguments placed before `<input.pdf> <output.md>`.
    pub args: Vec<String>,
    /// Per-invocation wall-clock limit. Default: 600.
    pub timeout_secs: u64,
    /// Ordered classification table; first match wins.
    pub failure_rules: Vec<FailureRule>,
    /// Kind assigned when no rule matches. Default: transient.
    pub unknown_failure: FailureKind,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: "converter".to_string(),
            args: Vec::new(),
            timeout_secs: 600,
            failure_rules: default_failure_rules(),
            unknown_failure: FailureKind::Transient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// One row of the failure classification table. A rule with neither an exit
/// code nor a stderr pattern never matches. When both are set, both must
/// match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRule {
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_pattern: Option<String>,
}

impl FailureRule {
    pub fn stderr(kind: FailureKind, pattern: &str) -> Self {
        Self {
            kind,
            exit_code: None,
            stderr_pattern: Some(pattern.to_string()),
        }
    }

    pub fn exit(kind: FailureKind, code: i32) -> Self {
        Self {
            kind,
            exit_code: Some(code),
            stderr_pattern: None,
        }
    }
}

/// Classification used when the configuration supplies no rules.
pub fn default_failure_rules() -> Vec<FailureRule> {
    vec![
        FailureRule::stderr(
            FailureKind::Permanent,
            r"(?i)corrupt|damaged|not a pdf|invalid pdf|unsupported|encrypted|password|xref",
        ),
        FailureRule::stderr(
            FailureKind::Transient,
            r"(?i)out of memory|resource temporarily unavailable|timed out|killed",
        ),
        FailureRule::exit(FailureKind::Transient, 137),
    ]
}

/// Operator extensions to the CAMELCASE_SPLIT dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepairConfig {
    pub extra_terms: Vec<String>,
    pub dictionary_path: Option<PathBuf>,
}

impl RepairConfig {
    /// The built-in dictionary plus configured terms and file.
    pub fn dictionary(&self) -> Result<Dictionary, RefineryError> {
        let dict = Dictionary::builtin().with_terms(&self.extra_terms);
        match &self.dictionary_path {
            Some(path) => dict.load_file(path).map_err(|e| {
                RefineryError::InvalidConfig(format!(
                    "cannot read dictionary '{}': {e}",
                    path.display()
                ))
            }),
            None => Ok(dict),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// JSONL catalog. Matching is disabled when unset.
    pub catalog_path: Option<PathBuf>,
    /// Minimum confidence for an automatic link. Default: 0.75.
    pub threshold: f64,
    /// The best candidate must beat the runner-up by more than this. Default: 0.02.
    pub ambiguity_margin: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            catalog_path: None,
            threshold: 0.75,
            ambiguity_margin: 0.02,
        }
    }
}

impl Default for RefineryConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            max_attempts: 3,
            retry_backoff_ms: 500,
            max_backoff_ms: 30_000,
            converter: ConverterConfig::default(),
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 60,
            hard_stop_timeout_secs: 30,
            output_dir: PathBuf::from("refinery-out"),
            keep_raw: true,
            repair: RepairConfig::default(),
            matcher: MatcherConfig::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for RefineryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefineryConfig")
            .field("workers", &self.workers)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("converter", &self.converter)
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .field("heartbeat_timeout_secs", &self.heartbeat_timeout_secs)
            .field("hard_stop_timeout_secs", &self.hard_stop_timeout_secs)
            .field("output_dir", &self.output_dir)
            .field("keep_raw", &self.keep_raw)
            .field("repair", &self.repair)
            .field("matcher", &self.matcher)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn BatchProgressCallback>"),
            )
            .finish()
    }
}

impl RefineryConfig {
    pub fn builder() -> RefineryConfigBuilder {
        RefineryConfigBuilder {
            config: Self::default(),
        }
    }

    /// Delay before attempt `attempt + 1`: `retry_backoff_ms * 2^(attempt-1)`,
    /// capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn hard_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_stop_timeout_secs)
    }

    pub fn converter_timeout(&self) -> Duration {
        Duration::from_secs(self.converter.timeout_secs)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.output_dir.join("ledger.jsonl")
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.output_dir.join("raw")
    }

    pub fn clean_dir(&self) -> PathBuf {
        self.output_dir.join("clean")
    }

    pub fn links_path(&self) -> PathBuf {
        self.output_dir.join("links.jsonl")
    }

    pub fn review_path(&self) -> PathBuf {
        self.output_dir.join("review.jsonl")
    }
}

/// Builder for [`RefineryConfig`].
#[derive(Debug)]
pub struct RefineryConfigBuilder {
    config: RefineryConfig,
}

impl RefineryConfigBuilder {
    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn converter_program(mut self, program: impl Into<String>) -> Self {
        self.config.converter.program = program.into();
        self
    }

    pub fn converter_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.converter.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn converter_timeout_secs(mut self, secs: u64) -> Self {
        self.config.converter.timeout_secs = secs.max(1);
        self
    }

    pub fn failure_rules(mut self, rules: Vec<FailureRule>) -> Self {
        self.config.converter.failure_rules = rules;
        self
    }

    pub fn unknown_failure(mut self, kind: FailureKind) -> Self {
        self.config.converter.unknown_failure = kind;
        self
    }

    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.config.heartbeat_interval_secs = secs.max(1);
        self
    }

    pub fn heartbeat_timeout_secs(mut self, secs: u64) -> Self {
        self.config.heartbeat_timeout_secs = secs.max(1);
        self
    }

    pub fn hard_stop_timeout_secs(mut self, secs: u64) -> Self {
        self.config.hard_stop_timeout_secs = secs;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn keep_raw(mut self, v: bool) -> Self {
        self.config.keep_raw = v;
        self
    }

    pub fn extra_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .repair
            .extra_terms
            .extend(terms.into_iter().map(Into::into));
        self
    }

    pub fn dictionary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.repair.dictionary_path = Some(path.into());
        self
    }

    pub fn catalog_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.matcher.catalog_path = Some(path.into());
        self
    }

    pub fn match_threshold(mut self, t: f64) -> Self {
        self.config.matcher.threshold = t.clamp(0.0, 1.0);
        self
    }

    pub fn ambiguity_margin(mut self, m: f64) -> Self {
        self.config.matcher.ambiguity_margin = m.clamp(0.0, 1.0);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Overlay every value present in `file`.
    pub fn apply_file(mut self, file: FileConfig) -> Self {
        let b = file.batch;
        let c = &mut self.config;
        if let Some(v) = b.workers {
            c.workers = v.max(1);
        }
        if let Some(v) = b.max_attempts {
            c.max_attempts = v.max(1);
        }
        if let Some(v) = b.retry_backoff_ms {
            c.retry_backoff_ms = v;
        }
        if let Some(v) = b.max_backoff_ms {
            c.max_backoff_ms = v;
        }
        if let Some(v) = b.heartbeat_interval_secs {
            c.heartbeat_interval_secs = v.max(1);
        }
        if let Some(v) = b.heartbeat_timeout_secs {
            c.heartbeat_timeout_secs = v.max(1);
        }
        if let Some(v) = b.hard_stop_timeout_secs {
            c.hard_stop_timeout_secs = v;
        }
        if let Some(v) = b.output_dir {
            c.output_dir = v;
        }
        if let Some(v) = b.keep_raw {
            c.keep_raw = v;
        }

        let conv = file.converter;
        if let Some(v) = conv.program {
            c.converter.program = v;
        }
        if let Some(v) = conv.args {
            c.converter.args = v;
        }
        if let Some(v) = conv.timeout_secs {
            c.converter.timeout_secs = v.max(1);
        }
        if let Some(v) = conv.unknown_failure {
            c.converter.unknown_failure = v;
        }
        if !conv.failure_rules.is_empty() {
            c.converter.failure_rules = conv.failure_rules;
        }

        c.repair.extra_terms.extend(file.repair.extra_terms);
        if let Some(v) = file.repair.dictionary_path {
            c.repair.dictionary_path = Some(v);
        }

        if let Some(v) = file.matcher.catalog_path {
            c.matcher.catalog_path = Some(v);
        }
        if let Some(v) = file.matcher.threshold {
            c.matcher.threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = file.matcher.ambiguity_margin {
            c.matcher.ambiguity_margin = v.clamp(0.0, 1.0);
        }
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<RefineryConfig, RefineryError> {
        let c = &self.config;
        if c.converter.program.trim().is_empty() {
            return Err(RefineryError::InvalidConfig(
                "Converter program must not be empty".into(),
            ));
        }
        if c.heartbeat_timeout_secs <= c.heartbeat_interval_secs {
            return Err(RefineryError::InvalidConfig(format!(
                "heartbeat timeout ({}s) must exceed heartbeat interval ({}s)",
                c.heartbeat_timeout_secs, c.heartbeat_interval_secs
            )));
        }
        if c.max_backoff_ms < c.retry_backoff_ms {
            return Err(RefineryError::InvalidConfig(format!(
                "max backoff ({}ms) is below the initial backoff ({}ms)",
                c.max_backoff_ms, c.retry_backoff_ms
            )));
        }
        for (i, rule) in c.converter.failure_rules.iter().enumerate() {
            if let Some(pattern) = &rule.stderr_pattern {
                Regex::new(pattern).map_err(|e| {
                    RefineryError::InvalidConfig(format!("failure rule {}: {e}", i + 1))
                })?;
            }
        }
        Ok(self.config)
    }
}

// ── TOML file ────────────────────────────────────────────────────────────

/// On-disk configuration. Every field is optional; absent values keep the
/// builder's current setting.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub batch: BatchSection,
    pub converter: ConverterSection,
    pub repair: RepairConfig,
    pub matcher: MatcherSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSection {
    pub workers: Option<usize>,
    pub max_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub hard_stop_timeout_secs: Option<u64>,
    pub output_dir: Option<PathBuf>,
    pub keep_raw: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConverterSection {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
    pub unknown_failure: Option<FailureKind>,
    pub failure_rules: Vec<FailureRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatcherSection {
    pub catalog_path: Option<PathBuf>,
    pub threshold: Option<f64>,
    pub ambiguity_margin: Option<f64>,
}

impl FileConfig {
    pub fn parse(text: &str) -> Result<Self, RefineryError> {
        toml::from_str(text).map_err(|e| RefineryError::InvalidConfig(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, RefineryError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RefineryError::InvalidConfig(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::parse(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = RefineryConfig::default();
        assert!(c.workers >= 1);
        assert_eq!(c.max_attempts, 3);
        assert_eq!(c.converter.program, "converter");
        assert_eq!(c.converter.timeout_secs, 600);
        assert_eq!(c.output_dir, PathBuf::from("refinery-out"));
        assert!(c.keep_raw);
        assert_eq!(c.matcher.threshold, 0.75);
        assert!(c.matcher.catalog_path.is_none());
        assert_eq!(c.converter.failure_rules.len(), 3);
    }

    #[test]
    fn builder_clamps() {
        let c = RefineryConfig::builder()
            .workers(0)
            .max_attempts(0)
            .match_threshold(3.0)
            .build()
            .unwrap();
        assert_eq!(c.workers, 1);
        assert_eq!(c.max_attempts, 1);
        assert_eq!(c.matcher.threshold, 1.0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let c = RefineryConfig::builder()
            .retry_backoff_ms(100)
            .max_backoff_ms(350)
            .build()
            .unwrap();
        assert_eq!(c.backoff(1), Duration::from_millis(100));
        assert_eq!(c.backoff(2), Duration::from_millis(200));
        assert_eq!(c.backoff(3), Duration::from_millis(350));
        assert_eq!(c.backoff(60), Duration::from_millis(350));
    }

    #[test]
    fn heartbeat_timeout_must_exceed_interval() {
        let err = RefineryConfig::builder()
            .heartbeat_interval_secs(30)
            .heartbeat_timeout_secs(10)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("heartbeat"));
    }

    #[test]
    fn bad_failure_rule_regex_is_rejected() {
        let err = RefineryConfig::builder()
            .failure_rules(vec![FailureRule::stderr(FailureKind::Permanent, "(unclosed")])
            .build()
            .unwrap_err();
        assert!(matches!(err, RefineryError::InvalidConfig(_)));
    }

    #[test]
    fn file_config_overlays_builder() {
        let file = FileConfig::parse(
            r#"
            [batch]
            workers = 2
            output_dir = "elsewhere"

            [converter]
            program = "marker_single"
            args = ["--batch"]

            [[converter.failure_rules]]
            kind = "permanent"
            exit_code = 3

            [repair]
            extra_terms = ["QuickSilver"]

            [matcher]
            threshold = 0.9
            "#,
        )
        .unwrap();
        let c = RefineryConfig::builder().apply_file(file).build().unwrap();
        assert_eq!(c.workers, 2);
        assert_eq!(c.output_dir, PathBuf::from("elsewhere"));
        assert_eq!(c.converter.program, "marker_single");
        assert_eq!(c.converter.args, vec!["--batch".to_string()]);
        assert_eq!(
            c.converter.failure_rules,
            vec![FailureRule::exit(FailureKind::Permanent, 3)]
        );
        assert_eq!(c.repair.extra_terms, vec!["QuickSilver".to_string()]);
        assert_eq!(c.matcher.threshold, 0.9);
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(FileConfig::parse("[batch]\nworkerz = 2").is_err());
    }

    #[test]
    fn dictionary_includes_extra_terms() {
        let c = RefineryConfig::builder()
            .extra_terms(["deBruijn"])
            .build()
            .unwrap();
        assert!(c.repair.dictionary().unwrap().contains("deBruijn"));
    }

    #[test]
    fn output_layout() {
        let c = RefineryConfig::builder().output_dir("out").build().unwrap();
        assert_eq!(c.ledger_path(), PathBuf::from("out/ledger.jsonl"));
        assert_eq!(c.clean_dir(), PathBuf::from("out/clean"));
        assert_eq!(c.review_path(), PathBuf::from("out/review.jsonl"));
    }
}

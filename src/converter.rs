//! The external Converter boundary.
//!
//! The Converter is a black box invoked as
//! `<program> [args...] <input.pdf> <output.md>`. On success it exits 0 and
//! writes a non-empty Markdown file; on failure it exits non-zero and explains
//! itself on stderr. [`FailureClassifier`] turns that exit code and stderr into
//! a transient or permanent [`ConverterError`] using the configured rule table.
//!
//! [`Converter`] is a trait so the scheduler can be driven by in-process stubs
//! in tests; [`CommandConverter`] is the subprocess implementation.

use crate::config::{ConverterConfig, FailureKind, FailureRule};
use crate::error::{ConverterError, RefineryError};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Longest stderr excerpt carried into an error detail.
const MAX_DETAIL_CHARS: usize = 400;

#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `input` into Markdown at `output`.
    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ConverterError>;

    /// Check the Converter can run at all. Called once before any job moves.
    fn preflight(&self) -> Result<(), RefineryError> {
        Ok(())
    }
}

// ── Failure classification ───────────────────────────────────────────────────

struct CompiledRule {
    kind: FailureKind,
    exit_code: Option<i32>,
    stderr_pattern: Option<Regex>,
}

impl CompiledRule {
    fn matches(&self, exit_code: Option<i32>, stderr: &str) -> bool {
        if self.exit_code.is_none() && self.stderr_pattern.is_none() {
            return false;
        }
        let code_ok = self.exit_code.map_or(true, |c| exit_code == Some(c));
        let stderr_ok = self
            .stderr_pattern
            .as_ref()
            .map_or(true, |re| re.is_match(stderr));
        code_ok && stderr_ok
    }
}

/// Ordered rule table; the first matching rule decides.
pub struct FailureClassifier {
    rules: Vec<CompiledRule>,
    unknown: FailureKind,
}

impl FailureClassifier {
    pub fn new(rules: &[FailureRule], unknown: FailureKind) -> Result<Self, RefineryError> {
        let rules = rules
            .iter()
            .map(|r| {
                let stderr_pattern = r
                    .stderr_pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| RefineryError::InvalidConfig(format!("failure rule: {e}")))?;
                Ok(CompiledRule {
                    kind: r.kind,
                    exit_code: r.exit_code,
                    stderr_pattern,
                })
            })
            .collect::<Result<Vec<_>, RefineryError>>()?;
        Ok(Self { rules, unknown })
    }

    pub fn classify(&self, exit_code: Option<i32>, stderr: &str) -> FailureKind {
        self.rules
            .iter()
            .find(|r| r.matches(exit_code, stderr))
            .map_or(self.unknown, |r| r.kind)
    }

    pub fn error(&self, exit_code: Option<i32>, stderr: &str) -> ConverterError {
        let detail = failure_detail(exit_code, stderr);
        match self.classify(exit_code, stderr) {
            FailureKind::Transient => ConverterError::transient(detail),
            FailureKind::Permanent => ConverterError::permanent(detail),
        }
    }
}

fn failure_detail(exit_code: Option<i32>, stderr: &str) -> String {
    let last_line = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("no diagnostic output");
    let excerpt: String = last_line.chars().take(MAX_DETAIL_CHARS).collect();
    match exit_code {
        Some(code) => format!("exit code {code}: {excerpt}"),
        None => format!("terminated by signal: {excerpt}"),
    }
}

// ── Subprocess converter ─────────────────────────────────────────────────────

pub struct CommandConverter {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    classifier: FailureClassifier,
}

impl CommandConverter {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        classifier: FailureClassifier,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            classifier,
        }
    }

    pub fn from_config(config: &ConverterConfig) -> Result<Self, RefineryError> {
        let classifier = FailureClassifier::new(&config.failure_rules, config.unknown_failure)?;
        Ok(Self::new(
            config.program.clone(),
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
            classifier,
        ))
    }

    /// Resolve the program to an executable path.
    pub fn resolve_program(&self) -> Result<PathBuf, RefineryError> {
        let unavailable = |detail: String| RefineryError::ConverterUnavailable {
            program: self.program.clone(),
            detail,
        };
        let as_path = Path::new(&self.program);
        if as_path.components().count() > 1 || as_path.is_absolute() {
            return if as_path.is_file() {
                Ok(as_path.to_path_buf())
            } else {
                Err(unavailable("no such file".into()))
            };
        }
        which::which(&self.program).map_err(|e| unavailable(e.to_string()))
    }
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ConverterError> {
        debug!(
            "Running {} on '{}' → '{}'",
            self.program,
            input.display(),
            output.display()
        );
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(input)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConverterError::transient(format!("failed to spawn: {e}")))?;

        // On timeout the child handle is dropped, which kills the process.
        let out = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Err(_) => {
                return Err(ConverterError::transient(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
            Ok(Err(e)) => return Err(ConverterError::transient(format!("wait failed: {e}"))),
            Ok(Ok(out)) => out,
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return match out.status.code() {
                Some(code) => Err(self.classifier.error(Some(code), &stderr)),
                None => Err(ConverterError::transient(failure_detail(None, &stderr))),
            };
        }

        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            Ok(_) => Err(ConverterError::transient("empty output")),
            Err(_) => Err(ConverterError::transient("empty output: no file written")),
        }
    }

    fn preflight(&self) -> Result<(), RefineryError> {
        let path = self.resolve_program()?;
        debug!("Converter resolved to {}", path.display());
        Ok(())
    }
}

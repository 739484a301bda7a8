//! CLI binary for pdf-refinery.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `RefineryConfig`, runs one subcommand and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pdf_refinery::{
    convert, convert_to_file, repair_file, BatchProgressCallback, BatchScheduler, BatchSummary,
    ErrorCategory, FileConfig, JobOutcome, JobStatus, ProgressCallback, RefineryConfig,
    RefineryError, RunLedger,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

/// Exit codes shared by all subcommands.
const EXIT_OK: u8 = 0;
/// Repair pass skipped, document sent to review, or batch jobs failed.
const EXIT_DEGRADED: u8 = 1;
/// Converter failure or any other fatal error.
const EXIT_FATAL: u8 = 2;

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the batch plus a log line per
/// finished job. Jobs finish out of order, so every line names its job.
struct CliProgressCallback {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Scanning corpus…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            failed: AtomicUsize::new(0),
        })
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn truncate(msg: &str, max: usize) -> String {
    if msg.chars().count() > max {
        let head: String = msg.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        msg.to_string()
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} jobs  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }

    fn on_job_start(&self, _job_id: &str, path: &Path, attempt: u32) {
        if attempt > 1 {
            self.bar
                .set_message(format!("{} (attempt {attempt})", display_name(path)));
        } else {
            self.bar.set_message(display_name(path));
        }
    }

    fn on_job_retry(&self, _job_id: &str, path: &Path, attempt: u32, error: &str) {
        self.bar.println(format!(
            "  {} {}  {}",
            yellow("↻"),
            display_name(path),
            dim(&format!("attempt {attempt}: {}", truncate(error, 80))),
        ));
    }

    fn on_job_complete(&self, _job_id: &str, path: &Path, outcome: &JobOutcome) {
        let link = match &outcome.link {
            Some(l) => match l.record_id() {
                Some(id) => dim(&format!("→ {id}")),
                None => yellow("→ review"),
            },
            None => String::new(),
        };
        let mark = if outcome.repair.has_pass_errors() {
            yellow("⚠")
        } else {
            green("✓")
        };
        self.bar.println(format!(
            "  {} {}  {}  {}",
            mark,
            display_name(path),
            dim(&format!("{:>4} fixes", outcome.repair.total_fixes())),
            link,
        ));
        self.bar.inc(1);
    }

    fn on_job_failed(&self, _job_id: &str, path: &Path, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {}  {}",
            red("✗"),
            display_name(path),
            red(&truncate(error, 80)),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, _summary: &BatchSummary) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one PDF to stdout
  refinery --converter marker_single convert paper.pdf

  # Convert one PDF to a file, linking it against a catalog
  refinery --catalog catalog.jsonl convert paper.pdf -o paper.md

  # Convert a corpus with 8 workers
  refinery convert-batch corpus/ --workers 8 --out refinery-out

  # Continue an interrupted batch
  refinery convert-batch corpus/ --resume

  # See what a resumed run would do, without converting anything
  refinery convert-batch corpus/ --dry-run --json

  # Repair an existing Markdown file
  refinery repair refinery-out/raw/job-0123456789abcdef.md -o fixed.md

  # Ledger status
  refinery status --out refinery-out

EXIT CODES:
  0  success
  1  repair pass skipped, document sent to manual review, or batch jobs failed
  2  Converter failure or fatal error (ledger, configuration, input)

ENVIRONMENT VARIABLES:
  REFINERY_CONFIG       TOML configuration file
  REFINERY_CONVERTER    Converter program (invoked as <program> <in.pdf> <out.md>)
  REFINERY_OUT          Output directory (ledger, raw/, clean/, links, review)
  REFINERY_CATALOG      JSONL catalog for provenance matching
  RUST_LOG              Log filter, overrides -v / -q
"#;

/// Batch PDF-to-text conversion with artifact repair and provenance matching.
#[derive(Parser, Debug)]
#[command(
    name = "refinery",
    version,
    about = "Batch PDF-to-text conversion with artifact repair and provenance matching",
    long_about = "Convert PDF documents with an external Converter program, repair the \
systematic artifacts it leaves behind, and link each output to its catalog record. Batch runs \
are recorded in an append-only ledger and can be resumed after a crash.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// TOML configuration file; flags override its values.
    #[arg(long, global = true, env = "REFINERY_CONFIG")]
    config: Option<PathBuf>,

    /// Converter program name or path.
    #[arg(long, global = true, env = "REFINERY_CONVERTER")]
    converter: Option<String>,

    /// Converter timeout per attempt, in seconds.
    #[arg(long, global = true, env = "REFINERY_TIMEOUT")]
    timeout: Option<u64>,

    /// Output directory for ledger, raw, clean, links and review files.
    #[arg(long, global = true, env = "REFINERY_OUT")]
    out: Option<PathBuf>,

    /// JSONL catalog for provenance matching.
    #[arg(long, global = true, env = "REFINERY_CATALOG")]
    catalog: Option<PathBuf>,

    /// Extra CAMELCASE dictionary, one term per line.
    #[arg(long, global = true, env = "REFINERY_DICTIONARY")]
    dictionary: Option<PathBuf>,

    /// Attempts per job before a transient failure becomes permanent.
    #[arg(long, global = true, env = "REFINERY_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Print structured JSON instead of human-readable output.
    #[arg(long, global = true, env = "REFINERY_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "REFINERY_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "REFINERY_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "REFINERY_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a single PDF.
    Convert {
        /// PDF file to convert.
        pdf: PathBuf,

        /// Write clean Markdown to this file instead of stdout.
        #[arg(short, long, env = "REFINERY_OUTPUT")]
        output: Option<PathBuf>,
    },

    /// Convert every PDF under a directory.
    ConvertBatch {
        /// Corpus directory (searched recursively).
        dir: PathBuf,

        /// Concurrent Converter processes.
        #[arg(short, long, env = "REFINERY_WORKERS")]
        workers: Option<usize>,

        /// Continue from the existing ledger, skipping terminal jobs.
        #[arg(long, env = "REFINERY_RESUME")]
        resume: bool,

        /// Report the plan without converting or writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Repair an existing Markdown file.
    Repair {
        /// Markdown file to repair.
        markdown: PathBuf,

        /// Write the repaired text here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Summarise the ledger in the output directory.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let common = &cli.common;

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = matches!(cli.command, Command::ConvertBatch { dry_run: false, .. })
        && !common.quiet
        && !common.no_progress
        && !common.json;
    let filter = if common.verbose {
        "debug"
    } else if common.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match run(&cli, show_progress).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {e:#}", red("error:"));
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: &Cli, show_progress: bool) -> Result<u8> {
    let common = &cli.common;
    match &cli.command {
        Command::Convert { pdf, output } => {
            let config = build_config(common, None, None)?;
            run_convert(common, &config, pdf, output.as_deref()).await
        }
        Command::ConvertBatch {
            dir,
            workers,
            resume,
            dry_run,
        } => {
            let progress = show_progress.then(|| CliProgressCallback::new() as ProgressCallback);
            let config = build_config(common, *workers, progress)?;
            if *dry_run {
                run_dry_run(common, config, dir).await
            } else {
                run_batch(common, config, dir, *resume).await
            }
        }
        Command::Repair { markdown, output } => {
            let config = build_config(common, None, None)?;
            run_repair(common, &config, markdown, output.as_deref()).await
        }
        Command::Status => {
            let config = build_config(common, None, None)?;
            run_status(common, &config)
        }
    }
}

// ── Subcommands ──────────────────────────────────────────────────────────

async fn run_convert(
    common: &CommonArgs,
    config: &RefineryConfig,
    pdf: &Path,
    output_path: Option<&Path>,
) -> Result<u8> {
    let result = match output_path {
        Some(path) => convert_to_file(pdf, path, config).await,
        None => convert(pdf, config).await,
    };
    let output = match result {
        Ok(output) => output,
        Err(RefineryError::Converter(e)) => {
            eprintln!("{} Converter failed on {}: {e}", red("✘"), pdf.display());
            return Ok(EXIT_FATAL);
        }
        Err(e) => return Err(e).context("Conversion failed"),
    };

    if common.json {
        let mut value = serde_json::to_value(&output).context("Failed to serialise output")?;
        if output_path.is_none() {
            value["markdown"] = serde_json::Value::String(output.markdown.clone());
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("Failed to serialise output")?
        );
    } else if output_path.is_none() {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(output.markdown.as_bytes())
            .context("Failed to write to stdout")?;
        if !output.markdown.ends_with('\n') {
            handle.write_all(b"\n").ok();
        }
    }

    if !common.quiet && !common.json {
        eprintln!(
            "{}  {}  {} fixes  {} attempt(s){}",
            if output.is_clean() { green("✔") } else { yellow("⚠") },
            output.job_id,
            output.repair.total_fixes(),
            output.attempts,
            output_path
                .map(|p| format!("  →  {}", bold(&p.display().to_string())))
                .unwrap_or_default(),
        );
        for line in &output.repair.detail {
            eprintln!("   {} {}", yellow("skipped:"), line);
        }
        if let Some(link) = &output.link {
            match link.record_id() {
                Some(id) => eprintln!("   linked to {} ({:.2})", bold(id), link.confidence),
                None => eprintln!(
                    "   {} {:?} ({:.2})",
                    yellow("needs review:"),
                    link.reason,
                    link.confidence
                ),
            }
        }
    }

    Ok(if output.is_clean() { EXIT_OK } else { EXIT_DEGRADED })
}

async fn run_batch(
    common: &CommonArgs,
    config: RefineryConfig,
    dir: &Path,
    resume: bool,
) -> Result<u8> {
    let scheduler = BatchScheduler::from_config(config).context("Invalid configuration")?;

    let stop = scheduler.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received: no new jobs will start");
            eprintln!(
                "{} stopping: in-flight jobs may finish, rerun with --resume to continue",
                yellow("⚠")
            );
            stop.stop();
        }
    });

    let summary = scheduler
        .run(dir, resume)
        .await
        .context("Batch run failed")?;

    if common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else if !common.quiet {
        print_summary(&summary);
    }

    let clean = summary.count(JobStatus::FailedPermanent) == 0 && summary.incomplete() == 0;
    Ok(if clean { EXIT_OK } else { EXIT_DEGRADED })
}

fn print_summary(summary: &BatchSummary) {
    eprintln!(
        "{} {} succeeded  {} failed  {} incomplete  {}",
        if summary.count(JobStatus::FailedPermanent) == 0 && summary.incomplete() == 0 {
            green("✔")
        } else {
            yellow("⚠")
        },
        bold(&summary.count(JobStatus::Succeeded).to_string()),
        summary.count(JobStatus::FailedPermanent),
        summary.incomplete(),
        dim(&format!("{:.1}s", summary.duration_ms as f64 / 1000.0)),
    );
    eprintln!(
        "   {} dispatched  {} skipped  {} duplicates  {} linked  {} for review",
        summary.dispatched, summary.skipped, summary.duplicates, summary.linked, summary.unmatched
    );
    for category in [
        ErrorCategory::TransientConverter,
        ErrorCategory::PermanentConverter,
        ErrorCategory::RepairPass,
        ErrorCategory::MatchAmbiguous,
    ] {
        let n = summary.errors(category);
        if n > 0 {
            eprintln!("   {:<20} {}", category.to_string(), n);
        }
    }
    if summary.stopped {
        eprintln!("   {}", yellow("stopped early; rerun with --resume"));
    }
}

async fn run_dry_run(common: &CommonArgs, config: RefineryConfig, dir: &Path) -> Result<u8> {
    let scheduler = BatchScheduler::from_config(config).context("Invalid configuration")?;
    let report = scheduler.dry_run(dir).await.context("Dry run failed")?;

    if common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
        return Ok(EXIT_OK);
    }

    for job in &report.jobs {
        let status = job
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "NEW".to_string());
        let mut line = format!(
            "{} {:<18} {:<17} {}",
            if job.would_dispatch { "→" } else { " " },
            job.job_id,
            status,
            job.source.display()
        );
        if let Some(artifacts) = &job.artifacts {
            let total: usize = artifacts.values().sum();
            line.push_str(&dim(&format!("  {total} artifacts")));
        }
        if let Some(link) = &job.link {
            line.push_str(&dim(&format!(
                "  {}",
                link.record_id().unwrap_or("review")
            )));
        }
        println!("{line}");
    }
    if !common.quiet {
        eprintln!(
            "{} would dispatch, {} already terminal, {} duplicates",
            bold(&report.would_dispatch.to_string()),
            report.skipped,
            report.duplicates
        );
    }
    Ok(EXIT_OK)
}

async fn run_repair(
    common: &CommonArgs,
    config: &RefineryConfig,
    markdown: &Path,
    output_path: Option<&Path>,
) -> Result<u8> {
    let repaired = repair_file(markdown, config)
        .await
        .with_context(|| format!("Failed to repair {}", markdown.display()))?;

    match output_path {
        Some(path) => pdf_refinery::output::write_atomic(path, &repaired.text)
            .await
            .context("Failed to write output")?,
        None if !common.json => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(repaired.text.as_bytes())
                .context("Failed to write to stdout")?;
        }
        None => {}
    }

    if common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&repaired.result).context("Failed to serialise result")?
        );
    } else if !common.quiet {
        for (category, n) in &repaired.result.fixes_by_category {
            eprintln!("   {:<18} {}", category.to_string(), n);
        }
        for line in &repaired.result.detail {
            eprintln!("   {} {}", yellow("skipped:"), line);
        }
    }
    Ok(if repaired.result.has_pass_errors() {
        EXIT_DEGRADED
    } else {
        EXIT_OK
    })
}

fn run_status(common: &CommonArgs, config: &RefineryConfig) -> Result<u8> {
    let path = config.ledger_path();
    let state = RunLedger::read_state(&path)
        .with_context(|| format!("Failed to read ledger {}", path.display()))?;

    if common.json {
        let jobs: Vec<_> = state.jobs().collect();
        let value = serde_json::json!({
            "ledger": path,
            "entries": state.entry_count(),
            "skipped_lines": state.skipped_lines(),
            "counts": state.counts(),
            "jobs": jobs,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("Failed to serialise status")?
        );
        return Ok(EXIT_OK);
    }

    println!("Ledger:   {}", path.display());
    println!("Entries:  {}", state.entry_count());
    if state.skipped_lines() > 0 {
        println!("Skipped:  {} malformed lines", state.skipped_lines());
    }
    let counts = state.counts();
    for status in JobStatus::ALL {
        println!(
            "{:<18} {}",
            status.to_string(),
            counts.get(&status).copied().unwrap_or(0)
        );
    }
    if common.verbose {
        for job in state.with_status(JobStatus::FailedPermanent) {
            println!(
                "  {} {} ({} attempts)",
                red("✗"),
                job.source
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| job.job_id.clone()),
                job.attempt_count
            );
        }
    }
    Ok(EXIT_OK)
}

// ── Config ───────────────────────────────────────────────────────────────

/// Map CLI args (over an optional TOML file) to `RefineryConfig`.
fn build_config(
    common: &CommonArgs,
    workers: Option<usize>,
    progress: Option<ProgressCallback>,
) -> Result<RefineryConfig> {
    let mut builder = RefineryConfig::builder();

    if let Some(ref path) = common.config {
        let file = FileConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?;
        builder = builder.apply_file(file);
    }
    if let Some(ref program) = common.converter {
        builder = builder.converter_program(program);
    }
    if let Some(secs) = common.timeout {
        builder = builder.converter_timeout_secs(secs);
    }
    if let Some(ref out) = common.out {
        builder = builder.output_dir(out);
    }
    if let Some(ref catalog) = common.catalog {
        builder = builder.catalog_path(catalog);
    }
    if let Some(ref dictionary) = common.dictionary {
        builder = builder.dictionary_path(dictionary);
    }
    if let Some(n) = common.max_attempts {
        builder = builder.max_attempts(n);
    }
    if let Some(n) = workers {
        builder = builder.workers(n);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

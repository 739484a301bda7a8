//! Single-document entry points.
//!
//! These run the same steps as one batch job (Converter, repair, provenance
//! match) without a ledger. Transient Converter failures are retried in place
//! with the configured backoff; the final failure is returned as
//! [`RefineryError::Converter`].

use crate::config::RefineryConfig;
use crate::converter::{CommandConverter, Converter};
use crate::corpus::{hash_file, validate_pdf};
use crate::error::{ConverterError, RefineryError};
use crate::job::job_id_for_hash;
use crate::output::{write_atomic, ConversionOutput};
use crate::pipeline::classify::ArtifactClassifier;
use crate::pipeline::repair::{RepairEngine, Repaired};
use crate::provenance::ProvenanceMatcher;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Convert one PDF with the configured Converter program.
///
/// # Errors
/// Returns `Err` for input errors, an unavailable Converter, a Converter
/// failure that outlived every retry, or a catalog that fails to load.
/// Repair pass failures and unmatched documents are reported on the
/// returned [`ConversionOutput`], never as errors.
pub async fn convert(
    pdf: impl AsRef<Path>,
    config: &RefineryConfig,
) -> Result<ConversionOutput, RefineryError> {
    let converter = CommandConverter::from_config(&config.converter)?;
    convert_document(pdf, config, Arc::new(converter)).await
}

/// Convert one PDF with an explicit [`Converter`].
pub async fn convert_document(
    pdf: impl AsRef<Path>,
    config: &RefineryConfig,
    converter: Arc<dyn Converter>,
) -> Result<ConversionOutput, RefineryError> {
    let start = Instant::now();
    let pdf = validate_pdf(pdf.as_ref())?;
    converter.preflight()?;

    let (content_hash, byte_size) = hash_file(&pdf)?;
    let job_id = job_id_for_hash(&content_hash);
    info!("Converting '{}' as {job_id} ({byte_size} bytes)", pdf.display());

    let engine = RepairEngine::new(ArtifactClassifier::new(config.repair.dictionary()?));
    let matcher = ProvenanceMatcher::from_config(&config.matcher)?;

    let (raw, attempts) = run_converter(&pdf, config, converter.as_ref()).await?;

    let Repaired { text, result } = engine.repair(&raw, Some(&job_id));
    let link = matcher
        .as_ref()
        .map(|m| m.match_document(&job_id, &pdf, &text));

    info!(
        "Converted {job_id} in {}ms: {} fixes after {attempts} attempt(s)",
        start.elapsed().as_millis(),
        result.total_fixes()
    );
    Ok(ConversionOutput {
        source: pdf,
        job_id,
        markdown: text,
        repair: result,
        link,
        attempts,
    })
}

/// Convert a PDF and write the clean Markdown to `output_path`.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn convert_to_file(
    pdf: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    config: &RefineryConfig,
) -> Result<ConversionOutput, RefineryError> {
    let output = convert(pdf, config).await?;
    write_atomic(output_path.as_ref(), &output.markdown).await?;
    Ok(output)
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    pdf: impl AsRef<Path>,
    config: &RefineryConfig,
) -> Result<ConversionOutput, RefineryError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| RefineryError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(pdf, config))
}

/// Run the RepairEngine over an existing Markdown file, e.g. a stored raw
/// output. Invalid UTF-8 is replaced rather than rejected.
pub async fn repair_file(
    path: impl AsRef<Path>,
    config: &RefineryConfig,
) -> Result<Repaired, RefineryError> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => RefineryError::FileNotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => RefineryError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => RefineryError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        },
    })?;
    let engine = RepairEngine::new(ArtifactClassifier::new(config.repair.dictionary()?));
    Ok(engine.repair(&String::from_utf8_lossy(&bytes), None))
}

/// Invoke the Converter with retries. Returns the raw text and the number of
/// attempts it took.
async fn run_converter(
    pdf: &Path,
    config: &RefineryConfig,
    converter: &dyn Converter,
) -> Result<(String, u32), RefineryError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match convert_once(pdf, converter).await {
            Ok(raw) => return Ok((raw, attempt)),
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                let delay = config.backoff(attempt);
                warn!(
                    "Converter failed on '{}': {e}: retry {}/{} after {}ms",
                    pdf.display(),
                    attempt,
                    config.max_attempts - 1,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(RefineryError::Converter(e)),
        }
    }
}

async fn convert_once(pdf: &Path, converter: &dyn Converter) -> Result<String, ConverterError> {
    let scratch = tempfile::tempdir()
        .map_err(|e| ConverterError::transient(format!("cannot create scratch dir: {e}")))?;
    let raw_path = scratch.path().join("raw.md");
    converter.convert(pdf, &raw_path).await?;
    let bytes = tokio::fs::read(&raw_path)
        .await
        .map_err(|e| ConverterError::transient(format!("cannot read converter output: {e}")))?;
    debug!("Converter wrote {} bytes", bytes.len());
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

//! Corpus discovery and single-file validation.
//!
//! A batch starts by walking the corpus directory, hashing every `*.pdf`, and
//! collapsing byte-identical files into one [`SourceDocument`]. Paths are
//! sorted before hashing so the surviving path of a duplicate group, and the
//! order jobs are first written to the ledger, are the same on every run.

use crate::error::RefineryError;
use crate::job::SourceDocument;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Result of [`scan_corpus`].
#[derive(Debug, Clone, Default)]
pub struct CorpusScan {
    /// One entry per distinct content hash, in path order.
    pub documents: Vec<SourceDocument>,
    /// `(duplicate path, path it duplicates)`.
    pub duplicates: Vec<(PathBuf, PathBuf)>,
    /// Files that could not be read; they never become jobs.
    pub unreadable: Vec<PathBuf>,
}

/// Validate a user-supplied PDF path: existence, read permission and the
/// `%PDF` magic bytes.
pub fn validate_pdf(path: &Path) -> Result<PathBuf, RefineryError> {
    let path = path.to_path_buf();

    if !path.exists() {
        return Err(RefineryError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_err() || &magic != b"%PDF" {
                return Err(RefineryError::NotAPdf { path, magic });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(RefineryError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(RefineryError::FileNotFound { path });
        }
    }

    debug!("Validated PDF: {}", path.display());
    Ok(path)
}

/// Stream `path` through SHA-256. Returns the lowercase hex digest and size.
pub fn hash_file(path: &Path) -> Result<(String, u64), RefineryError> {
    let read_failed = |e: std::io::Error| RefineryError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = std::fs::File::open(path).map_err(read_failed)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(read_failed)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Build the [`SourceDocument`] for one file under `root`.
pub fn source_document(path: &Path, root: &Path) -> Result<SourceDocument, RefineryError> {
    let (content_hash, byte_size) = hash_file(path)?;
    let relative_path = path
        .strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| PathBuf::from(path.file_name().unwrap_or_default()));
    Ok(SourceDocument {
        path: path.to_path_buf(),
        relative_path,
        content_hash,
        byte_size,
    })
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
}

/// Walk `root` recursively and return one document per distinct PDF.
///
/// Blocking; call through `spawn_blocking` from async code.
pub fn scan_corpus(root: &Path) -> Result<CorpusScan, RefineryError> {
    if !root.is_dir() {
        return Err(RefineryError::CorpusNotFound {
            path: root.to_path_buf(),
        });
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                warn!("Skipping unreadable corpus entry: {err}");
                None
            }
        })
        .filter(|e| e.file_type().is_file() && is_pdf(e.path()))
        .map(|e| e.into_path())
        .collect();
    paths.sort();

    let mut scan = CorpusScan::default();
    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    for path in paths {
        let doc = match source_document(&path, root) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("{e}");
                scan.unreadable.push(path);
                continue;
            }
        };
        if let Some(first) = seen.get(&doc.content_hash) {
            warn!(
                "Duplicate content: '{}' is identical to '{}'",
                path.display(),
                first.display()
            );
            scan.duplicates.push((path, first.clone()));
            continue;
        }
        seen.insert(doc.content_hash.clone(), path);
        scan.documents.push(doc);
    }

    info!(
        "Scanned '{}': {} documents, {} duplicates, {} unreadable",
        root.display(),
        scan.documents.len(),
        scan.duplicates.len(),
        scan.unreadable.len()
    );
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn validate_missing_file() {
        let err = validate_pdf(Path::new("/no/such/file.pdf")).unwrap_err();
        assert!(matches!(err, RefineryError::FileNotFound { .. }));
    }

    #[test]
    fn validate_rejects_non_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("x.pdf");
        write(&p, b"hello world");
        let err = validate_pdf(&p).unwrap_err();
        assert!(matches!(err, RefineryError::NotAPdf { magic, .. } if &magic == b"hell"));
    }

    #[test]
    fn validate_accepts_pdf_magic() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("x.pdf");
        write(&p, b"%PDF-1.7\n");
        assert_eq!(validate_pdf(&p).unwrap(), p);
    }

    #[test]
    fn hash_is_sha256_hex() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.pdf");
        write(&p, b"abc");
        let (hash, size) = hash_file(&p).unwrap();
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(size, 3);
    }

    #[test]
    fn scan_sorts_filters_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("b.pdf"), b"%PDF same");
        write(&root.join("a.PDF"), b"%PDF same");
        write(&root.join("nested/c.pdf"), b"%PDF other");
        write(&root.join("notes.txt"), b"ignored");

        let scan = scan_corpus(root).unwrap();
        let rels: Vec<_> = scan.documents.iter().map(|d| d.relative_path.clone()).collect();
        assert_eq!(rels, vec![PathBuf::from("a.PDF"), PathBuf::from("nested/c.pdf")]);
        assert_eq!(scan.duplicates.len(), 1);
        assert_eq!(scan.duplicates[0].0, root.join("b.pdf"));
    }

    #[test]
    fn scan_missing_dir() {
        let err = scan_corpus(Path::new("/no/such/corpus")).unwrap_err();
        assert!(matches!(err, RefineryError::CorpusNotFound { .. }));
    }
}

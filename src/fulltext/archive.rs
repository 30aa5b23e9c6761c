//! Extraction of article PDFs from gzip-compressed tar packages.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use super::ArchiveError;

/// File-name marker of supplementary material (`..._s001.pdf`).
const SUPPLEMENT_MARKER: &str = "s00";

/// Local name for a package member, or `None` if it is not an article PDF.
///
/// Article PDFs are named after their parent directory, so
/// `PMC123/article.pdf` becomes `PMC123.pdf`.
#[must_use]
pub fn output_name(member: &Path) -> Option<String> {
    let file_name = member.file_name()?.to_string_lossy().to_lowercase();
    if !file_name.ends_with(".pdf") || file_name.contains(SUPPLEMENT_MARKER) {
        return None;
    }
    let parent = member
        .parent()
        .and_then(Path::file_name)
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty());
    Some(match parent {
        Some(parent) => format!("{parent}.pdf"),
        None => member.file_name()?.to_string_lossy().into_owned(),
    })
}

/// Extracts article PDFs from `archive_path` into `output_dir`.
///
/// The output directory is created if needed. A member that cannot be
/// written is skipped; a corrupt archive aborts the whole extraction.
///
/// # Errors
///
/// [`ArchiveError::Corrupt`] for unreadable archives, [`ArchiveError::Io`]
/// when the archive or output directory cannot be opened.
pub async fn extract_documents(archive_path: &Path, output_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let archive_path = archive_path.to_path_buf();
    let output_dir = output_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive_path, &output_dir))
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?
}

fn extract_blocking(archive_path: &Path, output_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    std::fs::create_dir_all(output_dir).map_err(|e| ArchiveError::io(output_dir, e))?;
    let file = File::open(archive_path).map_err(|e| ArchiveError::io(archive_path, e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let mut extracted = Vec::new();
    let entries = archive
        .entries()
        .map_err(|e| ArchiveError::corrupt(archive_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveError::corrupt(archive_path, e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let member = entry
            .path()
            .map_err(|e| ArchiveError::corrupt(archive_path, e))?
            .into_owned();
        let Some(name) = output_name(&member) else {
            debug!(member = %member.display(), "skipping package member");
            continue;
        };

        let dest = output_dir.join(name);
        let written = File::create(&dest).and_then(|mut out| std::io::copy(&mut entry, &mut out));
        match written {
            Ok(bytes) => {
                debug!(member = %member.display(), dest = %dest.display(), bytes, "extracted");
                extracted.push(dest);
            }
            Err(e) => {
                warn!(member = %member.display(), error = %e, "failed to extract member");
                let _ = std::fs::remove_file(&dest);
            }
        }
    }

    info!(archive = %archive_path.display(), files = extracted.len(), "package extracted");
    Ok(extracted)
}

/// Whether `path` names a gzip-compressed tar package.
#[must_use]
pub fn is_package(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

//! Vocabulary file discovery and loading utilities.

use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{VocabError, VocabFiles, VocabResult};

/// Discovers vocabulary files in an Athena export directory.
///
/// Matches `CONCEPT`, `CONCEPT_RELATIONSHIP` and `SOURCE_TO_CONCEPT_MAP`
/// case-insensitively with a `.csv` or `.txt` extension. If the directory
/// itself holds no concept file, one level of subdirectories is searched.
pub fn discover_vocabulary_files<P: AsRef<Path>>(path: P) -> VocabResult<VocabFiles> {
    let path = path.as_ref();

    if !path.is_dir() {
        return Err(VocabError::DirectoryNotFound {
            path: path.display().to_string(),
        });
    }

    let vocab_dir = find_vocabulary_dir(path)?;
    let mut files = VocabFiles::new();

    for entry in fs::read_dir(&vocab_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(stem) = table_name(&entry.path()) else {
            continue;
        };

        match stem.as_str() {
            "CONCEPT" => files.concept_file = Some(entry.path()),
            "CONCEPT_RELATIONSHIP" => files.concept_relationship_file = Some(entry.path()),
            "SOURCE_TO_CONCEPT_MAP" => files.source_to_concept_file = Some(entry.path()),
            _ => {}
        }
    }

    if !files.has_required_files() {
        return Err(VocabError::RequiredFileMissing {
            file_type: files.missing_files().join(", "),
            directory: vocab_dir.display().to_string(),
        });
    }

    Ok(files)
}

/// Returns the upper-cased table name of a vocabulary file, if it has a
/// supported extension.
fn table_name(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if ext != "csv" && ext != "txt" {
        return None;
    }
    Some(path.file_stem()?.to_str()?.to_ascii_uppercase())
}

fn has_concept_file(dir: &Path) -> VocabResult<bool> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if table_name(&entry.path()).as_deref() == Some("CONCEPT") {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Finds the directory holding the export within `base`.
fn find_vocabulary_dir(base: &Path) -> VocabResult<PathBuf> {
    if has_concept_file(base)? {
        return Ok(base.to_path_buf());
    }

    for entry in fs::read_dir(base)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && has_concept_file(&entry.path())? {
            return Ok(entry.path());
        }
    }

    // Let the caller report which files are missing.
    Ok(base.to_path_buf())
}

/// Formats a byte count as a human-readable string.
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

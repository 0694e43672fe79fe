//! Small filesystem helpers shared by the export pipelines.

use crate::error::PipelineError;
use std::fs;
use std::path::Path;

/// Makes sure the directory that will hold `file_path` exists, creating it if needed.
pub fn validate_output_dir(file_path: impl AsRef<Path>) -> Result<(), PipelineError> {
    let path = file_path.as_ref();
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            if parent.exists() && !parent.is_dir() {
                return Err(PipelineError::IoError(format!(
                    "output parent {:?} is not a directory",
                    parent
                )));
            }
            fs::create_dir_all(parent)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Turns a crawl identity into a safe file stem.
pub fn file_stem_for(crawl_id: &str) -> String {
    let stem: String = crawl_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_start_matches('.');
    if stem.is_empty() {
        "crawl".to_string()
    } else {
        stem.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_missing_parent_directories() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("a/b/items.jsonl");
        validate_output_dir(&target).unwrap();
        assert!(tmp.path().join("a/b").is_dir());
    }

    #[test]
    fn crawl_ids_become_safe_file_stems() {
        assert_eq!(file_stem_for("huxiu"), "huxiu");
        assert_eq!(file_stem_for("../etc/passwd"), "_etc_passwd");
        assert_eq!(file_stem_for("..."), "crawl");
    }
}

//! Reading and validating a submitted source table.

use std::fs;
use std::path::{Component, Path, PathBuf};

use csv::ReaderBuilder;
use tracing::debug;

use crate::error::SubmitError;

/// Header naming the input column.
pub const INPUT_COLUMN: &str = "InputPath";
/// Header used by older source tables.
pub const LEGACY_INPUT_COLUMN: &str = "STIL_Path";

/// Reads the input column of a source table, in row order.
///
/// Values are trimmed; validation happens separately in [`validate_inputs`].
pub fn read_inputs(source: &Path) -> Result<Vec<String>, SubmitError> {
    if !source.is_file() {
        return Err(SubmitError::SourceNotFound(source.to_path_buf()));
    }

    let mut reader = ReaderBuilder::new().flexible(true).from_path(source)?;
    let column = reader
        .headers()?
        .iter()
        .position(|h| {
            let h = h.trim_start_matches('\u{feff}').trim();
            h == INPUT_COLUMN || h == LEGACY_INPUT_COLUMN
        })
        .ok_or(SubmitError::MissingInputColumn)?;

    let mut inputs = Vec::new();
    for record in reader.records() {
        let record = record?;
        inputs.push(record.get(column).unwrap_or_default().trim().to_string());
    }
    debug!(source = %source.display(), rows = inputs.len(), "Read source table");
    Ok(inputs)
}

/// Checks every input path, stopping at the first bad row.
///
/// A path is accepted when it is non-empty, absolute, names an existing
/// regular file, and resolves to itself once `.`, `..` and repeated
/// separators are folded away. The last check rejects symlinks anywhere in
/// the path. Accepted paths are returned in their normalized form.
pub fn validate_inputs(inputs: &[String]) -> Result<Vec<PathBuf>, SubmitError> {
    if inputs.is_empty() {
        return Err(SubmitError::Empty);
    }

    inputs
        .iter()
        .enumerate()
        .map(|(idx, raw)| validate_input(idx + 1, raw))
        .collect()
}

fn validate_input(row: usize, raw: &str) -> Result<PathBuf, SubmitError> {
    if raw.is_empty() {
        return Err(SubmitError::MissingPath { row });
    }

    let path = PathBuf::from(raw);
    if !path.is_absolute() {
        return Err(SubmitError::NotAbsolute {
            row,
            path: raw.to_string(),
        });
    }
    if !path.is_file() {
        return Err(SubmitError::NotFound {
            row,
            path: raw.to_string(),
        });
    }

    let normalized = normalize(&path);
    match fs::canonicalize(&path) {
        Ok(canonical) if canonical == normalized => Ok(normalized),
        _ => Err(SubmitError::PathMismatch {
            row,
            path: raw.to_string(),
        }),
    }
}

/// Lexical normalization: no filesystem access, so symlinks are left alone.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

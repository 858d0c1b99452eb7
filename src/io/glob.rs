//! Input file list expansion.
//!
//! A load may name its input as plain paths, glob patterns, or a mix, e.g.
//! `exports/orders_*.tbl.gz`. Patterns expand to files in sorted order so two
//! runs over the same directory feed rows in the same order.

use crate::error::{LoadError, Result};
use glob::glob;
use std::path::PathBuf;

fn has_glob_meta(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Expand one glob pattern into the sorted list of matching files.
///
/// Directories are skipped. No match yields an empty list.
///
/// # Errors
/// An invalid pattern or an unreadable directory entry.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob(pattern)
        .map_err(|e| LoadError::config(format!("invalid glob pattern {pattern}: {e}")))?;

    let mut result = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| LoadError::Io(e.into_error()))?;
        if path.is_file() {
            result.push(path);
        }
    }
    result.sort();
    Ok(result)
}

/// Expand a list of inputs, keeping plain paths as given and replacing each
/// pattern by its matches.
///
/// # Errors
/// A pattern that matches nothing, a plain path that does not exist, or any
/// error from [`expand_glob`].
pub fn expand_inputs<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        let input = input.as_ref();
        if has_glob_meta(input) {
            let matched = expand_glob(input)?;
            if matched.is_empty() {
                return Err(LoadError::config(format!(
                    "no files found matching pattern: {input}"
                )));
            }
            files.extend(matched);
        } else {
            let path = PathBuf::from(input);
            if !path.is_file() {
                return Err(LoadError::config(format!("input file not found: {input}")));
            }
            files.push(path);
        }
    }
    Ok(files)
}

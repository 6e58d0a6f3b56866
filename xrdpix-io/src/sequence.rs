//! Discovery of neighbouring files in an image sequence.
//!
//! The next or previous file is found either by incrementing a numeric
//! token in the file name or by walking the folder sorted by name or
//! modification time. Only files whose extension is in the caller's
//! allow-list (lower case, no dot) are considered.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;
use xrdpix_core::FileIterationMode;

use crate::Result;

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

/// Byte ranges of the ASCII digit runs in `name`.
fn numeric_groups(name: &str) -> Vec<(usize, usize)> {
    let mut groups = Vec::new();
    let mut start = None;
    for (i, b) in name.bytes().enumerate() {
        match (b.is_ascii_digit(), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                groups.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        groups.push((s, name.len()));
    }
    groups
}

/// Replace the `pos`-th numeric group counted from the end of `stem`,
/// shifted by `delta`. Zero padding of the group is preserved.
fn shift_number(stem: &str, pos: usize, delta: i64) -> Option<String> {
    let groups = numeric_groups(stem);
    let &(start, end) = groups.iter().rev().nth(pos)?;
    let value: i64 = stem[start..end].parse().ok()?;
    let shifted = value.checked_add(delta)?;
    if shifted < 0 {
        return None;
    }
    let width = end - start;
    Some(format!(
        "{}{shifted:0width$}{}",
        &stem[..start],
        &stem[end..]
    ))
}

/// File `step` positions after `path`.
///
/// In number mode `pos` selects the numeric group counted from the end of
/// the file name (`None` = the last one). Returns `Ok(None)` when no such
/// file exists.
///
/// # Errors
/// Returns an I/O error if the folder cannot be listed.
pub fn next_file(
    path: &Path,
    step: usize,
    pos: Option<usize>,
    mode: FileIterationMode,
    known_extensions: &BTreeSet<String>,
) -> Result<Option<PathBuf>> {
    let delta = i64::try_from(step).unwrap_or(i64::MAX);
    neighbour(path, delta, pos, mode, known_extensions)
}

/// File `step` positions before `path`.
///
/// # Errors
/// Returns an I/O error if the folder cannot be listed.
pub fn previous_file(
    path: &Path,
    step: usize,
    pos: Option<usize>,
    mode: FileIterationMode,
    known_extensions: &BTreeSet<String>,
) -> Result<Option<PathBuf>> {
    let delta = -i64::try_from(step).unwrap_or(i64::MAX);
    neighbour(path, delta, pos, mode, known_extensions)
}

fn neighbour(
    path: &Path,
    delta: i64,
    pos: Option<usize>,
    mode: FileIterationMode,
    known_extensions: &BTreeSet<String>,
) -> Result<Option<PathBuf>> {
    match mode {
        FileIterationMode::Number => Ok(numbered_neighbour(
            path,
            delta,
            pos.unwrap_or(0),
            known_extensions,
        )),
        FileIterationMode::Time | FileIterationMode::Alphabetical => {
            listed_neighbour(path, delta, mode, known_extensions)
        }
    }
}

fn numbered_neighbour(
    path: &Path,
    delta: i64,
    pos: usize,
    known_extensions: &BTreeSet<String>,
) -> Option<PathBuf> {
    let stem = path.file_stem()?.to_str()?;
    let shifted = shift_number(stem, pos, delta)?;
    let parent = path.parent().unwrap_or_else(|| Path::new(""));

    let own = extension_of(path);
    let candidates = own.iter().chain(
        known_extensions
            .iter()
            .filter(|e| Some(*e) != own.as_ref()),
    );
    for ext in candidates {
        // keep the original spelling of the extension when it matches
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(original) if original.eq_ignore_ascii_case(ext) => original.to_string(),
            _ => ext.clone(),
        };
        let candidate = parent.join(format!("{shifted}.{ext}"));
        if candidate.is_file() {
            debug!("next numbered file {}", candidate.display());
            return Some(candidate);
        }
    }
    None
}

fn listed_neighbour(
    path: &Path,
    delta: i64,
    mode: FileIterationMode,
    known_extensions: &BTreeSet<String>,
) -> Result<Option<PathBuf>> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let accepts =
        |p: &Path| extension_of(p).is_some_and(|e| known_extensions.contains(&e));
    let mut files: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        let candidate = entry.path();
        if !candidate.is_file() || !(accepts(&candidate) || candidate == path) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        files.push((candidate, modified));
    }
    if mode == FileIterationMode::Time {
        files.sort_by(|a, b| match a.1.cmp(&b.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });
    } else {
        files.sort_by(|a, b| a.0.cmp(&b.0));
    }
    let Some(index) = files.iter().position(|(p, _)| p == path) else {
        return Ok(None);
    };
    let target = i64::try_from(index)
        .ok()
        .and_then(|i| i.checked_add(delta))
        .and_then(|i| usize::try_from(i).ok());
    Ok(target.and_then(|i| files.get(i)).map(|(p, _)| p.clone()))
}

fn sibling_with_same_name(path: &Path, forward: bool) -> Result<Option<PathBuf>> {
    let Some(file_name) = path.file_name() else {
        return Ok(None);
    };
    let Some(folder) = path.parent() else {
        return Ok(None);
    };
    let Some(root) = folder.parent() else {
        return Ok(None);
    };
    let mut folders: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    folders.sort();
    let Some(index) = folders.iter().position(|f| f == folder) else {
        return Ok(None);
    };
    let found = if forward {
        folders[index + 1..]
            .iter()
            .map(|f| f.join(file_name))
            .find(|p| p.is_file())
    } else {
        folders[..index]
            .iter()
            .rev()
            .map(|f| f.join(file_name))
            .find(|p| p.is_file())
    };
    Ok(found)
}

/// The same file name in the next sibling folder (alphabetical order) that
/// contains it.
///
/// # Errors
/// Returns an I/O error if the parent folder cannot be listed.
pub fn next_folder(path: &Path) -> Result<Option<PathBuf>> {
    sibling_with_same_name(path, true)
}

/// The same file name in the previous sibling folder that contains it.
///
/// # Errors
/// Returns an I/O error if the parent folder cannot be listed.
pub fn previous_folder(path: &Path) -> Result<Option<PathBuf>> {
    sibling_with_same_name(path, false)
}

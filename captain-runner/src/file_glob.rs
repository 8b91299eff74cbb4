// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Expansion of file globs into sorted, de-duplicated file lists.

use crate::{errors::FileGlobError, helpers::absolutize};
use camino::{Utf8Path, Utf8PathBuf};
use globset::GlobBuilder;
use std::collections::{BTreeSet, HashSet};
use walkdir::WalkDir;

const GLOB_CHARS: &[char] = &['*', '?', '[', '{'];

/// Expands `patterns` relative to `working_dir`.
///
/// Returned paths keep the form they were written in: relative patterns produce relative paths.
/// Only files are returned. Patterns without glob characters are treated as literal paths and
/// included if the file exists.
///
/// A file reached through differently spelled patterns, for example `spec/*.rb` and
/// `./spec/*.rb`, is returned once, in the spelling that sorts first.
pub fn expand_globs(
    working_dir: &Utf8Path,
    patterns: &[impl AsRef<str>],
) -> Result<Vec<Utf8PathBuf>, FileGlobError> {
    let mut files = BTreeSet::new();
    for pattern in patterns {
        expand_one(working_dir, pattern.as_ref(), &mut files)?;
    }

    let mut seen = HashSet::new();
    Ok(files
        .into_iter()
        .filter(|file| seen.insert(absolutize(working_dir, file)))
        .collect())
}

fn expand_one(
    working_dir: &Utf8Path,
    pattern: &str,
    files: &mut BTreeSet<Utf8PathBuf>,
) -> Result<(), FileGlobError> {
    let Some(base) = literal_base(pattern) else {
        if working_dir.join(pattern).is_file() {
            files.insert(Utf8PathBuf::from(pattern));
        }
        return Ok(());
    };

    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|err| FileGlobError::InvalidPattern {
            pattern: pattern.to_owned(),
            err,
        })?
        .compile_matcher();

    let walk_root = working_dir.join(&base);
    if !walk_root.is_dir() {
        return Ok(());
    }

    for entry in WalkDir::new(&walk_root).follow_links(true) {
        let entry = entry.map_err(|err| FileGlobError::Walk {
            pattern: pattern.to_owned(),
            err,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = Utf8Path::from_path(entry.path()).ok_or_else(|| FileGlobError::NonUtf8Path {
            path: entry.path().to_owned(),
        })?;
        let Ok(relative) = path.strip_prefix(&walk_root) else {
            continue;
        };

        // Rebuild the path in the form the pattern was written in, so that matching and output
        // both see e.g. `./spec/a_spec.rb` for a pattern of `./spec/**/*_spec.rb`.
        let candidate = base.join(relative);
        if matcher.is_match(candidate.as_str()) {
            files.insert(candidate);
        }
    }

    Ok(())
}

/// Returns the leading components of `pattern` that contain no glob characters, or `None` if the
/// pattern has no glob characters at all.
fn literal_base(pattern: &str) -> Option<Utf8PathBuf> {
    if !pattern.contains(GLOB_CHARS) {
        return None;
    }

    let literal: Vec<&str> = pattern
        .split('/')
        .take_while(|component| !component.contains(GLOB_CHARS))
        .collect();
    let base = literal.join("/");
    if base.is_empty() && pattern.starts_with('/') {
        Some(Utf8PathBuf::from("/"))
    } else {
        Some(Utf8PathBuf::from(base))
    }
}

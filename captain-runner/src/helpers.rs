// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for captain-runner.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

/// Utilities for pluralizing various words based on count or plurality.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "file" if `count` is 1, otherwise "files".
    pub fn files_str(count: usize) -> &'static str {
        if count == 1 { "file" } else { "files" }
    }

    /// Returns "partition" if `count` is 1, otherwise "partitions".
    pub fn partitions_str(count: usize) -> &'static str {
        if count == 1 {
            "partition"
        } else {
            "partitions"
        }
    }
}

/// Resolves `path` against `base` and normalizes it lexically, without touching the file system.
///
/// `.` components are dropped and `..` components pop the previous component. A `..` at the root
/// stays at the root.
pub(crate) fn absolutize(base: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    let joined = base.join(path);
    let mut out = Utf8PathBuf::new();
    for component in joined.components() {
        match component {
            Utf8Component::Prefix(_) | Utf8Component::RootDir => {
                out.push(component.as_str());
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                // pop() returns false at the root, which is the behavior we want.
                out.pop();
            }
            Utf8Component::Normal(name) => out.push(name),
        }
    }
    out
}

/// Returns `path` with any root or prefix components removed.
pub(crate) fn strip_root(path: &Utf8Path) -> Utf8PathBuf {
    path.components()
        .filter_map(|component| match component {
            Utf8Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect()
}

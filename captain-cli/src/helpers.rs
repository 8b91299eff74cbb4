// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::ExpectedError;
use camino::Utf8PathBuf;

/// Returns the current directory as a UTF-8 path.
pub(crate) fn current_dir() -> Result<Utf8PathBuf, ExpectedError> {
    let dir = std::env::current_dir().map_err(|err| ExpectedError::CurrentDirFailed { err })?;
    Utf8PathBuf::try_from(dir).map_err(|err| ExpectedError::CurrentDirInvalidUtf8 {
        path: err.into_path_buf(),
    })
}

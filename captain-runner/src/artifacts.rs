// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Intermediate artifact storage.
//!
//! Every command invocation writes its result files to the same configured paths, so each
//! invocation's files are moved aside into their own directory before the next one runs. The
//! layout under the storage root is `<retry-id>/[<command-id>/]<path>`, where `<path>` is the
//! artifact's path relative to the working directory. Artifacts outside the working directory are
//! stored under their path relative to the file system root.

use crate::{
    errors::ArtifactStoreError,
    helpers::{absolutize, strip_root},
};
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use std::{fmt, fs};
use tracing::{debug, warn};

/// The retry ID used for the original run of the test command.
pub const ORIGINAL_ATTEMPT_ID: &str = "original-attempt";

enum ArtifactRoot {
    Ephemeral(Utf8TempDir),
    Explicit(Utf8PathBuf),
}

impl ArtifactRoot {
    fn path(&self) -> &Utf8Path {
        match self {
            Self::Ephemeral(dir) => dir.path(),
            Self::Explicit(path) => path,
        }
    }
}

/// Storage for the result files of every command invocation in a run.
pub struct IntermediateArtifacts {
    root: ArtifactRoot,
    working_dir: Utf8PathBuf,
    retry_id: String,
    command_id: Option<String>,
}

impl fmt::Debug for IntermediateArtifacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntermediateArtifacts")
            .field("root", &self.root.path())
            .field("ephemeral", &self.is_ephemeral())
            .field("working_dir", &self.working_dir)
            .field("retry_id", &self.retry_id)
            .field("command_id", &self.command_id)
            .finish()
    }
}

impl IntermediateArtifacts {
    /// Sets up storage.
    ///
    /// With `path`, storage lives there (resolved against `working_dir`), and the directory is
    /// created if it doesn't exist. Otherwise a temporary directory is allocated, which is removed
    /// when this is dropped or [`delete`](Self::delete)d.
    pub fn new(
        path: Option<&Utf8Path>,
        working_dir: impl Into<Utf8PathBuf>,
    ) -> Result<Self, ArtifactStoreError> {
        let working_dir = working_dir.into();
        let working_dir = absolutize(&working_dir, Utf8Path::new("."));

        let root = match path {
            Some(path) => {
                let path = absolutize(&working_dir, path);
                if path.exists() && !path.is_dir() {
                    return Err(ArtifactStoreError::NotADirectory { path });
                }
                fs::create_dir_all(&path).map_err(|err| ArtifactStoreError::CreateDir {
                    path: path.clone(),
                    err,
                })?;
                ArtifactRoot::Explicit(path)
            }
            None => ArtifactRoot::Ephemeral(
                camino_tempfile::Builder::new()
                    .prefix("captain-artifacts-")
                    .tempdir()
                    .map_err(ArtifactStoreError::TempDir)?,
            ),
        };
        debug!("storing intermediate artifacts in {}", root.path());

        Ok(Self {
            root,
            working_dir,
            retry_id: ORIGINAL_ATTEMPT_ID.to_owned(),
            command_id: None,
        })
    }

    /// Returns the storage root.
    pub fn root(&self) -> &Utf8Path {
        self.root.path()
    }

    /// Returns true if `path` lies under the storage root.
    ///
    /// Result globs broad enough to match the storage root would otherwise pick up stored
    /// artifacts again.
    pub fn contains(&self, path: &Utf8Path) -> bool {
        absolutize(&self.working_dir, path).starts_with(self.root.path())
    }

    /// Returns true if the storage root is a temporary directory.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self.root, ArtifactRoot::Ephemeral(_))
    }

    /// Returns the current retry ID.
    pub fn retry_id(&self) -> &str {
        &self.retry_id
    }

    /// Returns the current command ID, if any.
    pub fn command_id(&self) -> Option<&str> {
        self.command_id.as_deref()
    }

    /// Tags subsequent moves with `retry-<round>`, clearing the command ID.
    pub fn set_retry(&mut self, round: usize) {
        self.retry_id = format!("retry-{round}");
        self.command_id = None;
    }

    /// Tags subsequent moves with `command-<index>`.
    pub fn set_command(&mut self, index: usize) {
        self.command_id = Some(format!("command-{index}"));
    }

    /// Returns where `artifact` would be moved to under the current tags.
    pub fn destination_for(&self, artifact: &Utf8Path) -> Utf8PathBuf {
        let absolute = absolutize(&self.working_dir, artifact);
        let relative = match absolute.strip_prefix(&self.working_dir) {
            Ok(relative) => relative.to_owned(),
            Err(_) => strip_root(&absolute),
        };

        let mut destination = self.root.path().join(&self.retry_id);
        if let Some(command_id) = &self.command_id {
            destination.push(command_id);
        }
        destination.push(relative);
        destination
    }

    /// Moves each artifact to its destination, returning the new paths in order.
    ///
    /// A rename that fails (for example across file systems) falls back to copying the file and
    /// removing the original.
    pub fn move_results(
        &self,
        artifacts: &[Utf8PathBuf],
    ) -> Result<Vec<Utf8PathBuf>, ArtifactStoreError> {
        artifacts
            .iter()
            .map(|artifact| {
                let from = absolutize(&self.working_dir, artifact);
                let to = self.destination_for(artifact);
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent).map_err(|err| ArtifactStoreError::CreateDir {
                        path: parent.to_owned(),
                        err,
                    })?;
                }
                move_file(&from, &to).map_err(|err| ArtifactStoreError::Move {
                    from: from.clone(),
                    to: to.clone(),
                    err,
                })?;
                debug!("moved {from} to {to}");
                Ok(to)
            })
            .collect()
    }

    /// Removes any of `artifacts` that are still in place.
    ///
    /// Used after a failed [`move_results`](Self::move_results) so that stale files aren't
    /// read again by the next invocation. Failures are logged, not returned.
    pub fn discard(&self, artifacts: &[Utf8PathBuf]) {
        for artifact in artifacts {
            let path = absolutize(&self.working_dir, artifact);
            match fs::remove_file(&path) {
                Ok(()) => debug!("discarded {path}"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("failed to remove {path}: {err}"),
            }
        }
    }

    /// Removes the storage root and everything in it.
    ///
    /// Failures are logged, not returned.
    pub fn delete(self) {
        let result = match self.root {
            ArtifactRoot::Ephemeral(dir) => {
                let path = dir.path().to_owned();
                dir.close().map_err(|err| (path, err))
            }
            ArtifactRoot::Explicit(path) => fs::remove_dir_all(&path).map_err(|err| (path, err)),
        };
        if let Err((path, err)) = result {
            warn!("failed to remove intermediate artifacts at {path}: {err}");
        }
    }
}

fn move_file(from: &Utf8Path, to: &Utf8Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sources of server-side knowledge: historical timings and known quarantined and flaky tests.
//!
//! The [`LocalBackend`] reads these from files in the repository, which is how captain works
//! without a hosted service.

use crate::{errors::BackendError, identity::TestIdentity};
use camino::{Utf8Path, Utf8PathBuf};
use captain_metadata::Test;
use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use std::time::Duration;

/// One historical measurement of how long a test file took.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TestFileTiming {
    /// The file path, as recorded by whoever reported the timing.
    pub filepath: Utf8PathBuf,

    /// How long the file took, in nanoseconds when serialized.
    #[serde(deserialize_with = "deserialize_nanos")]
    pub duration: Duration,
}

impl TestFileTiming {
    /// Creates a new timing.
    pub fn new(filepath: impl Into<Utf8PathBuf>, duration: Duration) -> Self {
        Self {
            filepath: filepath.into(),
            duration,
        }
    }
}

fn deserialize_nanos<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_nanos)
}

/// Quarantined and flaky tests known to the backend for a suite.
///
/// Fetched once per run and read-only afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunConfiguration {
    /// Tests whose failures don't fail the run.
    pub quarantined_tests: Vec<TestIdentity>,

    /// Tests known to fail intermittently. These get their own retry budget.
    pub flaky_tests: Vec<TestIdentity>,
}

impl RunConfiguration {
    /// Returns true if `test` is quarantined.
    pub fn is_quarantined(&self, test: &Test) -> bool {
        crate::identity::matches_any(test, &self.quarantined_tests)
    }

    /// Returns true if `test` is known to be flaky.
    pub fn is_flaky(&self, test: &Test) -> bool {
        crate::identity::matches_any(test, &self.flaky_tests)
    }
}

/// Supplies historical per-file durations for a suite.
pub trait TimingCatalog {
    /// Returns the timing manifest for `suite_id`.
    fn get_test_timing_manifest(&self, suite_id: &str) -> Result<Vec<TestFileTiming>, BackendError>;
}

/// Supplies per-run configuration for a suite.
pub trait Backend: TimingCatalog {
    /// Returns the quarantined and flaky tests for `suite_id`.
    fn get_run_configuration(&self, suite_id: &str) -> Result<RunConfiguration, BackendError>;
}

/// A backend that reads from files under a directory, one subdirectory per suite.
///
/// For a suite `my-suite`, the files are:
///
/// * `<root>/my-suite/timings.json`: a list of `{"filepath": .., "duration": <nanoseconds>}`.
/// * `<root>/my-suite/quarantines.json` and `<root>/my-suite/flakes.json`: lists of
///   `{"compositeIdentifier": .., "identityComponents": [..], "strictIdentity": bool}`.
///
/// Missing files are treated as empty.
#[derive(Clone, Debug)]
pub struct LocalBackend {
    root: Utf8PathBuf,
}

impl LocalBackend {
    /// The default root directory, relative to the working directory.
    pub const DEFAULT_ROOT: &'static str = ".captain";

    /// Creates a new local backend rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the directory for a suite.
    pub fn suite_dir(&self, suite_id: &str) -> Utf8PathBuf {
        self.root.join(suite_id)
    }

    fn read_list<T: DeserializeOwned>(&self, path: &Utf8Path) -> Result<Vec<T>, BackendError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{path} not found, treating as empty");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(BackendError::Read {
                    path: path.to_owned(),
                    err,
                });
            }
        };

        serde_json::from_str(&contents).map_err(|err| BackendError::Parse {
            path: path.to_owned(),
            err,
        })
    }
}

impl TimingCatalog for LocalBackend {
    fn get_test_timing_manifest(&self, suite_id: &str) -> Result<Vec<TestFileTiming>, BackendError> {
        self.read_list(&self.suite_dir(suite_id).join("timings.json"))
    }
}

impl Backend for LocalBackend {
    fn get_run_configuration(&self, suite_id: &str) -> Result<RunConfiguration, BackendError> {
        let dir = self.suite_dir(suite_id);
        Ok(RunConfiguration {
            quarantined_tests: self.read_list(&dir.join("quarantines.json"))?,
            flaky_tests: self.read_list(&dir.join("flakes.json"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn local_backend_reads_files() {
        let dir = Utf8TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        let suite_dir = backend.suite_dir("rspec");
        std::fs::create_dir_all(&suite_dir).unwrap();

        std::fs::write(
            suite_dir.join("timings.json"),
            indoc! {r#"
                [
                  { "filepath": "spec/a_spec.rb", "duration": 4000000000 },
                  { "filepath": "/ci/work/spec/b_spec.rb", "duration": 12 }
                ]
            "#},
        )
        .unwrap();
        std::fs::write(
            suite_dir.join("quarantines.json"),
            indoc! {r#"
                [
                  {
                    "compositeIdentifier": "a -captain- spec/a_spec.rb",
                    "identityComponents": ["description", "file"],
                    "strictIdentity": true
                  }
                ]
            "#},
        )
        .unwrap();

        let timings = backend.get_test_timing_manifest("rspec").unwrap();
        assert_eq!(
            timings,
            vec![
                TestFileTiming::new("spec/a_spec.rb", Duration::from_secs(4)),
                TestFileTiming::new("/ci/work/spec/b_spec.rb", Duration::from_nanos(12)),
            ]
        );

        let run_configuration = backend.get_run_configuration("rspec").unwrap();
        assert_eq!(run_configuration.quarantined_tests.len(), 1);
        assert!(run_configuration.quarantined_tests[0].strict_identity);
        assert_eq!(run_configuration.flaky_tests, Vec::new(), "missing file is empty");
    }

    #[test]
    fn local_backend_rejects_malformed_files() {
        let dir = Utf8TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        std::fs::create_dir_all(backend.suite_dir("jest")).unwrap();
        std::fs::write(backend.suite_dir("jest").join("flakes.json"), "{not json").unwrap();

        let err = backend.get_run_configuration("jest").unwrap_err();
        assert!(matches!(err, BackendError::Parse { .. }), "{err:?}");
    }
}

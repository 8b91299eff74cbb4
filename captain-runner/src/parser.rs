// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing test result files.

use crate::errors::ResultParseError;
use camino::{Utf8Path, Utf8PathBuf};
use captain_metadata::TestResults;
use tracing::debug;

/// Turns result files written by a test framework into [`TestResults`].
pub trait ResultParser {
    /// Parses `files` into a single set of results.
    fn parse(&self, files: &[Utf8PathBuf]) -> Result<TestResults, ResultParseError>;
}

/// Parses captain's native JSON result format.
///
/// Tests from multiple files are concatenated. The framework is taken from the first file that
/// names a known framework.
#[derive(Clone, Debug)]
pub struct JsonResultParser {
    working_dir: Utf8PathBuf,
}

impl JsonResultParser {
    /// Creates a new parser. Relative paths are resolved against `working_dir`.
    pub fn new(working_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    fn parse_one(&self, file: &Utf8Path) -> Result<TestResults, ResultParseError> {
        let path = self.working_dir.join(file);
        let contents = std::fs::read_to_string(&path).map_err(|err| ResultParseError::Read {
            path: path.clone(),
            err,
        })?;
        serde_json::from_str(&contents).map_err(|err| ResultParseError::Parse { path, err })
    }
}

impl ResultParser for JsonResultParser {
    fn parse(&self, files: &[Utf8PathBuf]) -> Result<TestResults, ResultParseError> {
        let mut combined = TestResults::default();
        for file in files {
            let results = self.parse_one(file)?;
            debug!("parsed {} tests from {file}", results.tests.len());
            if combined.framework.is_other() && !results.framework.is_other() {
                combined.framework = results.framework;
            }
            combined.tests.extend(results.tests);
            combined.other_errors.extend(results.other_errors);
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use captain_metadata::Framework;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_and_concatenates() {
        let dir = Utf8TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            indoc! {r#"
                {
                  "framework": { "language": "Other", "kind": "Other" },
                  "tests": [
                    { "name": "one", "attempt": { "status": { "kind": "successful" } } }
                  ]
                }
            "#},
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.json"),
            indoc! {r#"
                {
                  "framework": { "language": "Ruby", "kind": "RSpec" },
                  "tests": [
                    { "name": "two", "attempt": { "status": { "kind": "failed" } } }
                  ],
                  "otherErrors": [{ "message": "load error" }]
                }
            "#},
        )
        .unwrap();

        let parser = JsonResultParser::new(dir.path());
        let results = parser
            .parse(&["a.json".into(), "b.json".into()])
            .unwrap();
        assert_eq!(results.framework, Framework::RubyRSpec);
        assert_eq!(
            results.tests.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["one", "two"]
        );
        assert_eq!(results.other_errors.len(), 1);
    }

    #[test]
    fn reports_bad_files() {
        let dir = Utf8TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), "[").unwrap();
        let parser = JsonResultParser::new(dir.path());

        assert!(matches!(
            parser.parse(&["bad.json".into()]),
            Err(ResultParseError::Parse { .. })
        ));
        assert!(matches!(
            parser.parse(&["missing.json".into()]),
            Err(ResultParseError::Read { .. })
        ));
    }
}

// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};

/// The results of one or more invocations of a test suite.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    /// The framework that produced these results.
    #[serde(default)]
    pub framework: Framework,

    /// The tests that were run.
    #[serde(default)]
    pub tests: Vec<Test>,

    /// Errors reported by the framework that aren't attributable to a single test, for example
    /// a file that failed to load.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other_errors: Vec<OtherError>,
}

impl TestResults {
    /// Creates a new, empty set of results for the given framework.
    pub fn new(framework: Framework) -> Self {
        Self {
            framework,
            tests: Vec::new(),
            other_errors: Vec::new(),
        }
    }

    /// Returns a summary of these results.
    pub fn summary(&self) -> Summary {
        Summary::new(self)
    }

    /// Returns an iterator over tests whose current attempt implies a failure.
    pub fn failed_tests(&self) -> impl Iterator<Item = &Test> + '_ {
        self.tests.iter().filter(|test| test.implies_failure())
    }

    /// Returns true if any errors not attributable to a test were reported.
    pub fn has_other_errors(&self) -> bool {
        !self.other_errors.is_empty()
    }

    /// Merges the results of a retry into these results, returning the combined results.
    ///
    /// A retried test that matches an existing test (see [`Test::is_same_test`]) has the
    /// existing attempt moved into its past attempts and takes on the retried attempt. Retried
    /// tests without a match are appended. Tests that weren't retried are carried over as-is.
    pub fn merge(mut self, retried: TestResults) -> TestResults {
        if self.framework.is_other() {
            self.framework = retried.framework;
        }

        for retried_test in retried.tests {
            match self
                .tests
                .iter_mut()
                .find(|test| test.is_same_test(&retried_test))
            {
                Some(existing) => existing.push_attempt(retried_test),
                None => self.tests.push(retried_test),
            }
        }

        self.other_errors.extend(retried.other_errors);
        self
    }
}

/// The test framework that produced a set of results.
///
/// Captain knows how to retry individual tests for the named frameworks. Everything else is
/// carried as `Other` and can only be retried through a framework-agnostic substitution.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(from = "FrameworkRepr", into = "FrameworkRepr")]
pub enum Framework {
    /// RSpec (Ruby).
    RubyRSpec,
    /// Jest (JavaScript).
    JavaScriptJest,
    /// pytest (Python).
    PythonPytest,
    /// Any other framework.
    Other {
        /// The language, as reported by the result file.
        language: String,
        /// The framework kind, as reported by the result file.
        kind: String,
    },
}

impl Framework {
    /// Returns the generic framework used when nothing more specific is known.
    pub fn other() -> Self {
        Self::Other {
            language: "other".to_owned(),
            kind: "other".to_owned(),
        }
    }

    /// Returns the language for this framework.
    pub fn language(&self) -> &str {
        match self {
            Self::RubyRSpec => "Ruby",
            Self::JavaScriptJest => "JavaScript",
            Self::PythonPytest => "Python",
            Self::Other { language, .. } => language,
        }
    }

    /// Returns the kind of framework.
    pub fn kind(&self) -> &str {
        match self {
            Self::RubyRSpec => "RSpec",
            Self::JavaScriptJest => "Jest",
            Self::PythonPytest => "pytest",
            Self::Other { kind, .. } => kind,
        }
    }

    /// Returns true if this is not one of the frameworks captain knows about.
    pub fn is_other(&self) -> bool {
        matches!(self, Self::Other { .. })
    }
}

impl Default for Framework {
    fn default() -> Self {
        Self::other()
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.language(), self.kind())
    }
}

#[derive(Deserialize, Serialize)]
struct FrameworkRepr {
    language: String,
    kind: String,
}

impl From<FrameworkRepr> for Framework {
    fn from(repr: FrameworkRepr) -> Self {
        // Matching is case-insensitive since result files come from many different writers.
        match (
            repr.language.to_ascii_lowercase().as_str(),
            repr.kind.to_ascii_lowercase().as_str(),
        ) {
            ("ruby", "rspec") => Self::RubyRSpec,
            ("javascript", "jest") => Self::JavaScriptJest,
            ("python", "pytest") => Self::PythonPytest,
            _ => Self::Other {
                language: repr.language,
                kind: repr.kind,
            },
        }
    }
}

impl From<Framework> for FrameworkRepr {
    fn from(framework: Framework) -> Self {
        Self {
            language: framework.language().to_owned(),
            kind: framework.kind().to_owned(),
        }
    }
}

/// A single test and all of its attempts.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Test {
    /// A framework-specific identifier for the test, if the framework provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The display name of the test.
    pub name: String,

    /// Where the test is defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    /// The most recent attempt.
    pub attempt: TestAttempt,

    /// Earlier attempts, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub past_attempts: Vec<TestAttempt>,
}

impl Test {
    /// Creates a new test with a single attempt of the given status.
    pub fn new(name: impl Into<String>, status: TestStatus) -> Self {
        Self {
            id: None,
            name: name.into(),
            location: None,
            attempt: TestAttempt::new(status),
            past_attempts: Vec::new(),
        }
    }

    /// Returns true if the current attempt implies a failure.
    pub fn implies_failure(&self) -> bool {
        self.attempt.status.implies_failure()
    }

    /// Returns the file this test is located in, if known.
    pub fn file(&self) -> Option<&str> {
        self.location.as_ref().map(|location| location.file.as_str())
    }

    /// Returns true if `other` refers to the same test as `self`, possibly from a different run.
    ///
    /// Tests are matched by ID when both carry one; otherwise by name and file.
    pub fn is_same_test(&self, other: &Test) -> bool {
        match (&self.id, &other.id) {
            (Some(id), Some(other_id)) => id == other_id,
            _ => self.name == other.name && self.file() == other.file(),
        }
    }

    /// Records a new attempt for this test, taken from a rerun of the same test.
    pub fn push_attempt(&mut self, rerun: Test) {
        let previous = std::mem::replace(&mut self.attempt, rerun.attempt);
        self.past_attempts.push(previous);
        self.past_attempts.extend(rerun.past_attempts);
    }

    /// Marks the current attempt as quarantined, preserving the original status.
    pub fn quarantine(&mut self) {
        let status = std::mem::take(&mut self.attempt.status);
        self.attempt.status = status.quarantine();
    }
}

/// The location of a test in source.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// The file the test is defined in.
    pub file: String,
    /// The line number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// The column number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl Location {
    /// Creates a location pointing at a file.
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
            column: None,
        }
    }
}

/// One execution of a test.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestAttempt {
    /// The outcome of this attempt.
    pub status: TestStatus,

    /// How long the attempt took.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_nanos"
    )]
    pub duration: Option<Duration>,

    /// Free-form metadata reported by the framework. Used for identifying tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<BTreeMap<String, serde_json::Value>>,

    /// Captured standard output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    /// Captured standard error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    /// When the attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<FixedOffset>>,

    /// When the attempt finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<FixedOffset>>,
}

impl TestAttempt {
    /// Creates an attempt with the given status and nothing else.
    pub fn new(status: TestStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }
}

/// The outcome of a test attempt.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TestStatus {
    /// The kind of outcome.
    pub kind: TestStatusKind,

    /// A message associated with the outcome, typically the failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// For quarantined tests, the status before quarantining.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_status: Option<Box<TestStatus>>,
}

impl TestStatus {
    /// Creates a status of the given kind.
    pub fn new(kind: TestStatusKind) -> Self {
        Self {
            kind,
            message: None,
            original_status: None,
        }
    }

    /// Creates a successful status.
    pub fn successful() -> Self {
        Self::new(TestStatusKind::Successful)
    }

    /// Creates a failed status with an optional message.
    pub fn failed(message: Option<String>) -> Self {
        Self {
            message,
            ..Self::new(TestStatusKind::Failed)
        }
    }

    /// Returns true if this status counts as a test failure.
    pub fn implies_failure(&self) -> bool {
        matches!(
            self.kind,
            TestStatusKind::Failed | TestStatusKind::TimedOut | TestStatusKind::Canceled
        )
    }

    /// Returns true if a test with this status could be failing intermittently.
    ///
    /// Canceled tests were stopped from the outside and say nothing about the test itself.
    pub fn potentially_flaky(&self) -> bool {
        matches!(self.kind, TestStatusKind::Failed | TestStatusKind::TimedOut)
    }

    /// Converts this status into a quarantined status, preserving the original.
    pub fn quarantine(self) -> Self {
        Self {
            kind: TestStatusKind::Quarantined,
            message: None,
            original_status: Some(Box::new(self)),
        }
    }
}

/// The kind of a [`TestStatus`].
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TestStatusKind {
    /// The test passed.
    #[default]
    Successful,
    /// The test failed.
    Failed,
    /// The test ran past its time limit.
    TimedOut,
    /// The test was stopped before finishing.
    Canceled,
    /// The test is pending.
    Pended,
    /// The test was skipped.
    Skipped,
    /// The test is marked as to-do.
    Todo,
    /// The test failed, but is quarantined.
    Quarantined,
}

/// An error reported alongside test results that doesn't belong to a single test.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OtherError {
    /// The error message.
    pub message: String,
    /// The exception or error class, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

/// Counts derived from a [`TestResults`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Total number of tests.
    pub tests: usize,
    /// Tests that passed.
    pub successful: usize,
    /// Tests that failed.
    pub failed: usize,
    /// Tests that timed out.
    pub timed_out: usize,
    /// Tests that were canceled.
    pub canceled: usize,
    /// Tests that are pending.
    pub pended: usize,
    /// Tests that were skipped.
    pub skipped: usize,
    /// Tests marked as to-do.
    pub todo: usize,
    /// Tests that failed but were quarantined.
    pub quarantined: usize,
    /// Tests that were attempted more than once.
    pub retries: usize,
    /// Errors not attributable to a test.
    pub other_errors: usize,
}

impl Summary {
    fn new(results: &TestResults) -> Self {
        let mut summary = Summary {
            tests: results.tests.len(),
            other_errors: results.other_errors.len(),
            ..Default::default()
        };

        for test in &results.tests {
            if !test.past_attempts.is_empty() {
                summary.retries += 1;
            }
            let counter = match test.attempt.status.kind {
                TestStatusKind::Successful => &mut summary.successful,
                TestStatusKind::Failed => &mut summary.failed,
                TestStatusKind::TimedOut => &mut summary.timed_out,
                TestStatusKind::Canceled => &mut summary.canceled,
                TestStatusKind::Pended => &mut summary.pended,
                TestStatusKind::Skipped => &mut summary.skipped,
                TestStatusKind::Todo => &mut summary.todo,
                TestStatusKind::Quarantined => &mut summary.quarantined,
            };
            *counter += 1;
        }

        summary
    }
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            // u64 nanoseconds cover ~584 years, which is plenty for a test.
            Some(duration) => serializer.serialize_some(&(duration.as_nanos() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(TestStatusKind::Successful, false, false ; "successful")]
    #[test_case(TestStatusKind::Failed, true, true ; "failed")]
    #[test_case(TestStatusKind::TimedOut, true, true ; "timed out")]
    #[test_case(TestStatusKind::Canceled, true, false ; "canceled")]
    #[test_case(TestStatusKind::Pended, false, false ; "pended")]
    #[test_case(TestStatusKind::Skipped, false, false ; "skipped")]
    #[test_case(TestStatusKind::Todo, false, false ; "todo")]
    #[test_case(TestStatusKind::Quarantined, false, false ; "quarantined")]
    fn status_predicates(kind: TestStatusKind, implies_failure: bool, potentially_flaky: bool) {
        let status = TestStatus::new(kind);
        assert_eq!(status.implies_failure(), implies_failure, "implies_failure");
        assert_eq!(status.potentially_flaky(), potentially_flaky, "potentially_flaky");
    }

    #[test]
    fn quarantine_preserves_original_status() {
        let mut test = Test::new("flaky", TestStatus::failed(Some("boom".to_owned())));
        test.quarantine();

        assert_eq!(test.attempt.status.kind, TestStatusKind::Quarantined);
        assert!(!test.implies_failure());
        assert_eq!(
            test.attempt.status.original_status.as_deref(),
            Some(&TestStatus::failed(Some("boom".to_owned())))
        );
    }

    #[test]
    fn deserialize_results() {
        let input = indoc! {r#"
            {
              "framework": { "language": "Ruby", "kind": "RSpec" },
              "tests": [
                {
                  "id": "./spec/a_spec.rb[1:1]",
                  "name": "A works",
                  "location": { "file": "./spec/a_spec.rb", "line": 3 },
                  "attempt": {
                    "status": { "kind": "failed", "message": "expected true" },
                    "duration": 1500,
                    "meta": { "foo": "bar", "nothing": null }
                  }
                },
                {
                  "name": "B works",
                  "attempt": { "status": { "kind": "timedOut" } }
                }
              ],
              "otherErrors": [{ "message": "failed to load spec/c_spec.rb" }]
            }
        "#};

        let results: TestResults = serde_json::from_str(input).expect("results are valid");
        assert_eq!(results.framework, Framework::RubyRSpec);
        assert_eq!(results.tests.len(), 2);
        assert_eq!(
            results.tests[0].attempt.duration,
            Some(Duration::from_nanos(1500))
        );
        assert_eq!(results.tests[0].file(), Some("./spec/a_spec.rb"));
        assert_eq!(
            results.tests[0].attempt.meta.as_ref().map(|meta| meta.len()),
            Some(2)
        );
        assert_eq!(results.tests[1].attempt.status.kind, TestStatusKind::TimedOut);

        let summary = results.summary();
        assert_eq!(summary.tests, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.other_errors, 1);
    }

    #[test]
    fn unknown_framework_round_trips_as_other() {
        let framework: Framework =
            serde_json::from_str(r#"{"language": "Elixir", "kind": "ExUnit"}"#).unwrap();
        assert_eq!(
            framework,
            Framework::Other {
                language: "Elixir".to_owned(),
                kind: "ExUnit".to_owned(),
            }
        );
        assert_eq!(
            serde_json::to_string(&framework).unwrap(),
            r#"{"language":"Elixir","kind":"ExUnit"}"#
        );
    }

    #[test]
    fn merge_replaces_attempts_and_keeps_history() {
        let mut a = Test::new("a", TestStatus::failed(None));
        a.location = Some(Location::new("a_spec.rb"));
        let b = Test::new("b", TestStatus::successful());
        let original = TestResults {
            framework: Framework::RubyRSpec,
            tests: vec![a.clone(), b.clone()],
            other_errors: Vec::new(),
        };

        let mut a_retry = Test::new("a", TestStatus::successful());
        a_retry.location = Some(Location::new("a_spec.rb"));
        let new_test = Test::new("c", TestStatus::successful());
        let retried = TestResults {
            framework: Framework::RubyRSpec,
            tests: vec![a_retry, new_test.clone()],
            other_errors: Vec::new(),
        };

        let merged = original.merge(retried);
        assert_eq!(merged.tests.len(), 3);

        let merged_a = &merged.tests[0];
        assert_eq!(merged_a.attempt.status, TestStatus::successful());
        assert_eq!(merged_a.past_attempts, vec![a.attempt]);

        assert_eq!(merged.tests[1], b, "untouched test is carried over");
        assert_eq!(merged.tests[2], new_test, "unmatched retried test is appended");
        assert_eq!(merged.summary().retries, 1);
    }

    #[test]
    fn same_test_prefers_ids() {
        let mut a = Test::new("same name", TestStatus::successful());
        a.id = Some("1".to_owned());
        let mut b = a.clone();
        b.id = Some("2".to_owned());
        assert!(!a.is_same_test(&b), "differing ids win over equal names");

        b.id = None;
        assert!(a.is_same_test(&b), "falls back to name and file");
    }
}

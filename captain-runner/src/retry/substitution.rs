// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::template::CompiledTemplate;
use crate::errors::SubstitutionError;
use camino_tempfile::Utf8TempDir;
use captain_metadata::{Framework, Test, TestResults};
use indexmap::IndexMap;
use std::{borrow::Cow, collections::BTreeMap};
use tracing::{debug, warn};

/// Replaced with the path to a JSON file listing the tests to retry.
pub const JSON_FILE_PATH_KEYWORD: &str = "jsonFilePath";

/// Replaced with the tests to retry, as framework-specific identifiers.
pub const TESTS_KEYWORD: &str = "tests";

/// Replaced with a single test file (Jest).
pub const TEST_FILE_PATH_KEYWORD: &str = "testFilePath";

/// Replaced with a regex matching the names of the tests to retry in a file (Jest).
pub const TEST_NAME_PATTERN_KEYWORD: &str = "testNamePattern";

/// The values to substitute into the retry command template for one invocation.
pub type SubstitutionValues = BTreeMap<String, String>;

/// A strategy for turning a list of tests to retry into retry command invocations.
#[derive(Debug)]
pub enum Substitution {
    /// Writes the tests to a JSON file. Works for any framework.
    Json(JsonSubstitution),

    /// RSpec: one invocation with every test id.
    RubyRSpec,

    /// pytest: one invocation with every node id.
    PythonPytest,

    /// Jest: one invocation per test file, with a name pattern.
    JavaScriptJest,
}

impl Substitution {
    /// Picks the substitution for `template`.
    ///
    /// The JSON substitution is preferred. If the template doesn't use exactly its keywords, the
    /// substitution registered for `framework` is tried.
    pub fn select(
        template: &CompiledTemplate,
        framework: &Framework,
    ) -> Result<Self, SubstitutionError> {
        let json = Self::Json(JsonSubstitution::new());
        if template.uses_exactly(json.keywords()) {
            debug!("using the JSON file substitution");
            return Ok(json);
        }

        match Self::for_framework(framework) {
            Some(substitution) if template.uses_exactly(substitution.keywords()) => {
                debug!("using the {framework} substitution");
                Ok(substitution)
            }
            _ => Err(SubstitutionError::NoSubstitution {
                framework: framework.clone(),
            }),
        }
    }

    /// Returns the substitution registered for `framework`, if any.
    pub fn for_framework(framework: &Framework) -> Option<Self> {
        match framework {
            Framework::RubyRSpec => Some(Self::RubyRSpec),
            Framework::PythonPytest => Some(Self::PythonPytest),
            Framework::JavaScriptJest => Some(Self::JavaScriptJest),
            Framework::Other { .. } => None,
        }
    }

    /// Returns the keywords a template must use, exactly, for this substitution.
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::Json(_) => &[JSON_FILE_PATH_KEYWORD],
            Self::RubyRSpec | Self::PythonPytest => &[TESTS_KEYWORD],
            Self::JavaScriptJest => &[TEST_FILE_PATH_KEYWORD, TEST_NAME_PATTERN_KEYWORD],
        }
    }

    /// Returns the values for each retry invocation needed to rerun `tests`.
    ///
    /// Values are shell-quoted, since the substituted template is split into arguments again.
    pub fn substitutions(
        &mut self,
        framework: &Framework,
        tests: &[&Test],
    ) -> Result<Vec<SubstitutionValues>, SubstitutionError> {
        match self {
            Self::Json(json) => json.write(framework, tests).map(|values| vec![values]),
            Self::RubyRSpec => Ok(one_invocation(tests, rspec_identifier)),
            Self::PythonPytest => Ok(one_invocation(tests, pytest_identifier)),
            Self::JavaScriptJest => Ok(jest_invocations(tests)),
        }
    }

    /// Removes any files written for substitutions.
    pub fn clean_up(self) {
        if let Self::Json(json) = self {
            json.clean_up();
        }
    }
}

/// Writes the tests to retry to temporary JSON files in captain's native result format.
#[derive(Debug, Default)]
pub struct JsonSubstitution {
    dir: Option<Utf8TempDir>,
    files_written: usize,
}

impl JsonSubstitution {
    /// Creates a new substitution. The temporary directory is created on first use.
    pub fn new() -> Self {
        Self::default()
    }

    fn write(
        &mut self,
        framework: &Framework,
        tests: &[&Test],
    ) -> Result<SubstitutionValues, SubstitutionError> {
        let dir = match &mut self.dir {
            Some(dir) => dir,
            slot @ None => slot.insert(
                camino_tempfile::Builder::new()
                    .prefix("captain-retry-")
                    .tempdir()
                    .map_err(SubstitutionError::TempDir)?,
            ),
        };

        self.files_written += 1;
        let path = dir.path().join(format!("retry-{}.json", self.files_written));

        let results = TestResults {
            framework: framework.clone(),
            tests: tests.iter().map(|test| (*test).clone()).collect(),
            other_errors: Vec::new(),
        };
        let contents = serde_json::to_vec(&results).map_err(SubstitutionError::Serialize)?;
        std::fs::write(&path, contents).map_err(|err| SubstitutionError::WriteFile {
            path: path.clone(),
            err,
        })?;

        let mut values = SubstitutionValues::new();
        values.insert(
            JSON_FILE_PATH_KEYWORD.to_owned(),
            shell_words::quote(path.as_str()).into_owned(),
        );
        Ok(values)
    }

    fn clean_up(self) {
        if let Some(dir) = self.dir {
            let path = dir.path().to_owned();
            if let Err(err) = dir.close() {
                warn!("failed to remove retry files at {path}: {err}");
            }
        }
    }
}

fn one_invocation(
    tests: &[&Test],
    identifier: fn(&Test) -> Option<Cow<'_, str>>,
) -> Vec<SubstitutionValues> {
    let identifiers: Vec<_> = tests
        .iter()
        .filter_map(|test| {
            let id = identifier(test);
            if id.is_none() {
                warn!("test `{}` has no id or location and can't be retried", test.name);
            }
            id
        })
        .map(|id| shell_words::quote(&id).into_owned())
        .collect();

    if identifiers.is_empty() {
        return Vec::new();
    }
    let mut values = SubstitutionValues::new();
    values.insert(TESTS_KEYWORD.to_owned(), identifiers.join(" "));
    vec![values]
}

fn rspec_identifier(test: &Test) -> Option<Cow<'_, str>> {
    if let Some(id) = &test.id {
        return Some(Cow::Borrowed(id));
    }
    let location = test.location.as_ref()?;
    Some(match location.line {
        Some(line) => Cow::Owned(format!("{}:{line}", location.file)),
        None => Cow::Borrowed(&location.file),
    })
}

fn pytest_identifier(test: &Test) -> Option<Cow<'_, str>> {
    if let Some(id) = &test.id {
        return Some(Cow::Borrowed(id));
    }
    let file = test.file()?;
    Some(Cow::Owned(format!("{file}::{}", test.name)))
}

fn jest_invocations(tests: &[&Test]) -> Vec<SubstitutionValues> {
    let mut by_file: IndexMap<&str, Vec<String>> = IndexMap::new();
    for test in tests {
        match test.file() {
            Some(file) => by_file
                .entry(file)
                .or_default()
                .push(regex::escape(&test.name)),
            None => warn!("test `{}` has no file and can't be retried", test.name),
        }
    }

    by_file
        .into_iter()
        .map(|(file, names)| {
            let pattern = format!("^(?:{})$", names.join("|"));
            let mut values = SubstitutionValues::new();
            values.insert(
                TEST_FILE_PATH_KEYWORD.to_owned(),
                shell_words::quote(file).into_owned(),
            );
            values.insert(
                TEST_NAME_PATTERN_KEYWORD.to_owned(),
                shell_words::quote(&pattern).into_owned(),
            );
            values
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use captain_metadata::{Location, TestStatus};
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn test(name: &str, id: Option<&str>, file: Option<&str>, line: Option<u32>) -> Test {
        let mut test = Test::new(name, TestStatus::failed(None));
        test.id = id.map(str::to_owned);
        test.location = file.map(|file| Location {
            line,
            ..Location::new(file)
        });
        test
    }

    fn compile(template: &str) -> CompiledTemplate {
        CompiledTemplate::compile(template).unwrap()
    }

    #[test]
    fn select_prefers_json() {
        let substitution = Substitution::select(
            &compile("bin/retry {{ jsonFilePath }}"),
            &Framework::RubyRSpec,
        )
        .unwrap();
        assert!(matches!(substitution, Substitution::Json(_)));

        let substitution =
            Substitution::select(&compile("rspec {{ tests }}"), &Framework::RubyRSpec).unwrap();
        assert!(matches!(substitution, Substitution::RubyRSpec));
    }

    #[test]
    fn select_fails_without_match() {
        let err = Substitution::select(&compile("rspec {{ tests }}"), &Framework::other())
            .unwrap_err();
        assert!(matches!(err, SubstitutionError::NoSubstitution { .. }));
        assert_eq!(err.kind(), crate::errors::ErrorKind::Internal);

        let err = Substitution::select(
            &compile("jest {{ testFilePath }}"),
            &Framework::JavaScriptJest,
        )
        .unwrap_err();
        assert!(matches!(err, SubstitutionError::NoSubstitution { .. }));
    }

    #[test]
    fn rspec_uses_ids_then_locations() {
        let a = test("a", Some("./spec/a_spec.rb[1:1]"), Some("./spec/a_spec.rb"), Some(3));
        let b = test("b", None, Some("./spec/b c_spec.rb"), Some(7));
        let c = test("c", None, None, None);

        let values = Substitution::RubyRSpec
            .substitutions(&Framework::RubyRSpec, &[&a, &b, &c])
            .unwrap();
        assert_eq!(
            values,
            vec![btreemap! {
                "tests".to_owned() => "'./spec/a_spec.rb[1:1]' './spec/b c_spec.rb:7'".to_owned(),
            }]
        );
    }

    #[test]
    fn pytest_builds_node_ids() {
        let a = test("test_add", None, Some("tests/test_math.py"), None);
        let b = test("ignored", Some("tests/test_io.py::test_read"), None, None);

        let values = Substitution::PythonPytest
            .substitutions(&Framework::PythonPytest, &[&a, &b])
            .unwrap();
        assert_eq!(
            values[0]["tests"],
            "tests/test_math.py::test_add tests/test_io.py::test_read"
        );
    }

    #[test]
    fn jest_invocation_per_file() {
        let a = test("adds (1 + 1)", None, Some("math.test.js"), None);
        let b = test("io reads", None, Some("io.test.js"), None);
        let c = test("subtracts", None, Some("math.test.js"), None);

        let values = Substitution::JavaScriptJest
            .substitutions(&Framework::JavaScriptJest, &[&a, &b, &c])
            .unwrap();
        assert_eq!(
            values,
            vec![
                btreemap! {
                    "testFilePath".to_owned() => "math.test.js".to_owned(),
                    "testNamePattern".to_owned() =>
                        r"'^(?:adds \(1 \+ 1\)|subtracts)$'".to_owned(),
                },
                btreemap! {
                    "testFilePath".to_owned() => "io.test.js".to_owned(),
                    "testNamePattern".to_owned() => "'^(?:io reads)$'".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn json_writes_and_cleans_up_files() {
        let a = test("a", Some("a"), None, None);
        let mut substitution = Substitution::Json(JsonSubstitution::new());

        let values = substitution
            .substitutions(&Framework::other(), &[&a])
            .unwrap();
        let path = values[0][JSON_FILE_PATH_KEYWORD].clone();
        let written: TestResults =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.tests, vec![a.clone()]);

        let second = substitution
            .substitutions(&Framework::other(), &[&a])
            .unwrap();
        assert_ne!(second[0][JSON_FILE_PATH_KEYWORD], path);

        substitution.clean_up();
        assert!(!std::path::Path::new(&path).exists());
    }
}

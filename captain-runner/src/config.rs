// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Captain's configuration file.
//!
//! The config lives at `.captain/config.toml` by default, and holds one table per test suite:
//!
//! ```toml
//! [test-suites.rspec]
//! command = "bundle exec rspec --format json --out tmp/rspec.json"
//! results = ["tmp/rspec.json"]
//!
//! [test-suites.rspec.retries]
//! attempts = 2
//! command = "bundle exec rspec {{ tests }} --format json --out tmp/rspec.json"
//!
//! [test-suites.rspec.partition]
//! command = "bundle exec rspec {{ testFiles }} --format json --out tmp/rspec.json"
//! globs = ["spec/**/*_spec.rb"]
//! ```

use crate::{
    errors::ConfigParseError,
    retry::{MaxTestsToRetry, RetryConfig},
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, File, FileFormat};
use indexmap::IndexMap;
use serde::Deserialize;

/// The parsed contents of the config file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CaptainConfig {
    /// Configuration for each suite, by suite ID.
    #[serde(default)]
    pub test_suites: IndexMap<String, SuiteConfig>,
}

impl CaptainConfig {
    /// The default config path, relative to the working directory.
    pub const CONFIG_PATH: &'static str = ".captain/config.toml";

    /// Reads the config from `file`, or from [`Self::CONFIG_PATH`] under `working_dir`.
    ///
    /// The default file is optional. An explicitly passed file must exist.
    pub fn from_sources(
        working_dir: &Utf8Path,
        file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let (config_file, source) = match file {
            Some(file) => {
                let config_file = working_dir.join(file);
                let source = File::new(config_file.as_str(), FileFormat::Toml);
                (config_file, source)
            }
            None => {
                let config_file = working_dir.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        Config::builder()
            .add_source(source)
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| ConfigParseError::new(config_file, err))
    }

    /// Returns the config for a suite, if there is one.
    pub fn suite(&self, suite_id: &str) -> Option<&SuiteConfig> {
        self.test_suites.get(suite_id)
    }
}

/// Configuration for a single test suite.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SuiteConfig {
    /// The command that runs the suite.
    #[serde(default)]
    pub command: Option<String>,

    /// Globs matching the result files the command writes.
    #[serde(default)]
    pub results: Vec<String>,

    /// Retry settings.
    #[serde(default)]
    pub retries: RetriesConfig,

    /// Partition settings.
    #[serde(default)]
    pub partition: Option<PartitionSettings>,
}

/// The `retries` table of a suite.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetriesConfig {
    /// Retries for tests not known to be flaky.
    #[serde(default)]
    pub attempts: Option<usize>,

    /// Retries for tests known to be flaky.
    #[serde(default)]
    pub flaky_attempts: Option<usize>,

    /// The retry command template.
    #[serde(default)]
    pub command: Option<String>,

    /// The most tests a retry round may retry.
    #[serde(default)]
    pub max_tests: MaxTestsToRetry,

    /// Stop retrying once any test has used up its retries and is still failing.
    #[serde(default)]
    pub fail_fast: bool,

    /// Commands to run before each retry.
    #[serde(default)]
    pub pre_retry_commands: Vec<String>,

    /// Commands to run after each retry.
    #[serde(default)]
    pub post_retry_commands: Vec<String>,

    /// Where to keep the results of every attempt.
    #[serde(default)]
    pub intermediate_artifacts_path: Option<Utf8PathBuf>,
}

impl RetriesConfig {
    /// Converts this table into a [`RetryConfig`].
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            retries: self.attempts,
            flaky_retries: self.flaky_attempts,
            retry_command_template: self.command.clone(),
            max_tests_to_retry: self.max_tests,
            fail_retries_fast: self.fail_fast,
            pre_retry_commands: self.pre_retry_commands.clone(),
            post_retry_commands: self.post_retry_commands.clone(),
            intermediate_artifacts_path: self.intermediate_artifacts_path.clone(),
        }
    }
}

/// The `partition` table of a suite.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionSettings {
    /// The command to run a partition, with a `{{ testFiles }}` placeholder.
    #[serde(default)]
    pub command: Option<String>,

    /// Globs matching the suite's test files.
    #[serde(default)]
    pub globs: Vec<String>,

    /// The delimiter to join test files with.
    #[serde(default)]
    pub delimiter: Option<String>,

    /// Skip timings and assign files round-robin.
    #[serde(default)]
    pub round_robin: bool,

    /// A prefix to strip from test file paths.
    #[serde(default)]
    pub trim_prefix: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn write_config(dir: &Utf8Path, contents: &str) {
        let path = dir.join(CaptainConfig::CONFIG_PATH);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn parse_full_config() {
        let dir = Utf8TempDir::new().unwrap();
        write_config(
            dir.path(),
            indoc! {r#"
                [test-suites.rspec]
                command = "bundle exec rspec"
                results = ["tmp/rspec.json"]

                [test-suites.rspec.retries]
                attempts = 2
                flaky-attempts = 4
                command = "bundle exec rspec {{ tests }}"
                max-tests = "10%"
                fail-fast = true
                pre-retry-commands = ["bin/reset"]
                intermediate-artifacts-path = "tmp/captain"

                [test-suites.rspec.partition]
                command = "bundle exec rspec {{ testFiles }}"
                globs = ["spec/**/*_spec.rb"]
                round-robin = true

                [test-suites.jest]
                command = "npx jest"
            "#},
        );

        let config = CaptainConfig::from_sources(dir.path(), None).unwrap();
        assert_eq!(
            config.test_suites.keys().collect::<Vec<_>>(),
            vec!["rspec", "jest"]
        );

        let rspec = config.suite("rspec").unwrap();
        assert_eq!(rspec.command.as_deref(), Some("bundle exec rspec"));
        assert_eq!(rspec.results, vec!["tmp/rspec.json"]);

        let retry = rspec.retries.to_retry_config();
        assert_eq!(
            retry,
            RetryConfig {
                retries: Some(2),
                flaky_retries: Some(4),
                retry_command_template: Some("bundle exec rspec {{ tests }}".to_owned()),
                max_tests_to_retry: MaxTestsToRetry::Percentage(10.0),
                fail_retries_fast: true,
                pre_retry_commands: vec!["bin/reset".to_owned()],
                post_retry_commands: Vec::new(),
                intermediate_artifacts_path: Some("tmp/captain".into()),
            }
        );

        let partition = rspec.partition.as_ref().unwrap();
        assert_eq!(partition.globs, vec!["spec/**/*_spec.rb"]);
        assert!(partition.round_robin);
        assert_eq!(partition.delimiter, None);

        let jest = config.suite("jest").unwrap();
        assert!(!jest.retries.to_retry_config().is_enabled());
        assert!(jest.partition.is_none());
    }

    #[test]
    fn missing_default_file_is_empty() {
        let dir = Utf8TempDir::new().unwrap();
        let config = CaptainConfig::from_sources(dir.path(), None).unwrap();
        assert!(config.test_suites.is_empty());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = Utf8TempDir::new().unwrap();
        let err = CaptainConfig::from_sources(dir.path(), Some(Utf8Path::new("captain.toml")))
            .unwrap_err();
        assert_eq!(err.config_file(), &dir.path().join("captain.toml"));
    }

    #[test]
    fn invalid_max_tests_is_an_error() {
        let dir = Utf8TempDir::new().unwrap();
        write_config(
            dir.path(),
            indoc! {r#"
                [test-suites.rspec.retries]
                max-tests = "lots"
            "#},
        );
        CaptainConfig::from_sources(dir.path(), None).unwrap_err();
    }
}

// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by captain.

use crate::helpers::plural;
use camino::Utf8PathBuf;
use captain_metadata::Framework;
use config::ConfigError;
use std::{borrow::Cow, fmt, path::PathBuf};
use thiserror::Error;

/// Broad classification of a captain error, used to decide how it's reported and which exit code
/// it maps to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The configuration is invalid. Nothing was executed.
    Configuration,

    /// The invocation is invalid. Nothing was executed.
    Input,

    /// Captain reached a state it shouldn't be in. This is a bug.
    Internal,

    /// An operating system operation failed.
    System,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration error"),
            Self::Input => write!(f, "input error"),
            Self::Internal => write!(f, "internal error"),
            Self::System => write!(f, "system error"),
        }
    }
}

/// An error that occurred while reading captain's config.
#[derive(Debug, Error)]
#[error("failed to parse captain config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    err: ConfigError,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, err: ConfigError) -> Self {
        Self {
            config_file: config_file.into(),
            err,
        }
    }

    /// Returns the config file that failed to parse.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }
}

/// An error that occurs while parsing a
/// [`MaxTestsToRetry`](crate::retry::MaxTestsToRetry) value.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for max-tests-to-retry: {input}\n({message})")]
pub struct MaxTestsToRetryParseError {
    input: String,
    message: Cow<'static, str>,
}

impl MaxTestsToRetryParseError {
    pub(crate) fn new(input: impl Into<String>, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            input: input.into(),
            message: message.into(),
        }
    }
}

/// An error that occurred while expanding file globs.
#[derive(Debug, Error)]
pub enum FileGlobError {
    /// A pattern failed to compile.
    #[error("invalid glob pattern `{pattern}`")]
    InvalidPattern {
        /// The pattern.
        pattern: String,

        /// The underlying error.
        #[source]
        err: globset::Error,
    },

    /// Walking a directory failed.
    #[error("failed to walk directory while expanding `{pattern}`")]
    Walk {
        /// The pattern being expanded.
        pattern: String,

        /// The underlying error.
        #[source]
        err: walkdir::Error,
    },

    /// A matched path is not valid UTF-8.
    #[error("path `{}` is not valid UTF-8", .path.display())]
    NonUtf8Path {
        /// The offending path.
        path: PathBuf,
    },
}

impl FileGlobError {
    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPattern { .. } => ErrorKind::Configuration,
            Self::Walk { .. } | Self::NonUtf8Path { .. } => ErrorKind::System,
        }
    }
}

/// An error that occurred while computing a partition.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// The total number of partitions was zero.
    #[error("total partitions must be greater than 0")]
    InvalidTotal,

    /// The partition index was out of range.
    #[error("partition index {index} must be less than the total number of partitions ({total})")]
    IndexOutOfRange {
        /// The requested index.
        index: usize,

        /// The total number of partitions.
        total: usize,
    },

    /// No files matched the provided globs.
    #[error("no test files matched the provided globs: {}", .globs.join(", "))]
    NoFiles {
        /// The globs that were expanded.
        globs: Vec<String>,
    },

    /// Expanding the globs failed.
    #[error("failed to expand test file globs")]
    Glob(#[from] FileGlobError),
}

impl PartitionError {
    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTotal | Self::IndexOutOfRange { .. } | Self::NoFiles { .. } => {
                ErrorKind::Configuration
            }
            Self::Glob(err) => err.kind(),
        }
    }
}

/// An error that occurred while computing the composite identifier for a test.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum IdentityError {
    /// Strict identity was requested, but the test has no metadata at all.
    #[error("test `{test}` has no metadata, so identity component `{component}` can't be found")]
    MissingMeta {
        /// The test name.
        test: String,

        /// The component being looked up.
        component: String,
    },

    /// Strict identity was requested, but the metadata doesn't contain a component.
    #[error("test `{test}` is missing identity component `{component}`")]
    MissingComponent {
        /// The test name.
        test: String,

        /// The missing component.
        component: String,
    },
}

impl IdentityError {
    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// An error that occurred while setting up or using intermediate artifact storage.
#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    /// The configured path exists but isn't a directory.
    #[error("intermediate artifacts path `{path}` exists and is not a directory")]
    NotADirectory {
        /// The configured path.
        path: Utf8PathBuf,
    },

    /// Creating a directory failed.
    #[error("failed to create directory `{path}`")]
    CreateDir {
        /// The directory.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Creating the ephemeral directory failed.
    #[error("failed to create temporary directory for intermediate artifacts")]
    TempDir(#[source] std::io::Error),

    /// Moving an artifact failed, including the copy fallback.
    #[error("failed to move `{from}` to `{to}`")]
    Move {
        /// The artifact.
        from: Utf8PathBuf,

        /// The destination.
        to: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },
}

impl ArtifactStoreError {
    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotADirectory { .. } => ErrorKind::Configuration,
            Self::CreateDir { .. } | Self::TempDir(_) | Self::Move { .. } => ErrorKind::System,
        }
    }
}

/// An error that occurred while compiling a command template.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TemplateError {
    /// A `{{` was never closed.
    #[error("unclosed `{{{{` at byte {position} in template `{template}`")]
    Unclosed {
        /// The template.
        template: String,

        /// The byte offset of the opening braces.
        position: usize,
    },

    /// A placeholder contained something other than a keyword.
    #[error("invalid keyword `{keyword}` in template `{template}`")]
    InvalidKeyword {
        /// The template.
        template: String,

        /// The contents of the placeholder.
        keyword: String,
    },

    /// The template has keywords other than the ones expected.
    #[error(
        "template `{template}` must use exactly the keywords {}",
        .expected.iter().map(|k| format!("{{{{ {k} }}}}")).collect::<Vec<_>>().join(", ")
    )]
    UnexpectedKeywords {
        /// The template.
        template: String,

        /// The keywords that were expected.
        expected: Vec<&'static str>,
    },
}

impl TemplateError {
    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// An error that occurred while substituting tests into a retry command.
#[derive(Debug, Error)]
pub enum SubstitutionError {
    /// No substitution validates against the retry template.
    #[error(
        "the retry command template doesn't match the generic substitution, and no \
         substitution for {framework} accepts it either"
    )]
    NoSubstitution {
        /// The framework in use.
        framework: Framework,
    },

    /// Writing the tests to retry to a file failed.
    #[error("failed to write tests to retry to `{path}`")]
    WriteFile {
        /// The file being written.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Creating the temporary directory for substitution files failed.
    #[error("failed to create temporary directory for retry files")]
    TempDir(#[source] std::io::Error),

    /// Serializing the tests to retry failed.
    #[error("failed to serialize tests to retry")]
    Serialize(#[source] serde_json::Error),
}

impl SubstitutionError {
    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSubstitution { .. } | Self::Serialize(_) => ErrorKind::Internal,
            Self::WriteFile { .. } | Self::TempDir(_) => ErrorKind::System,
        }
    }
}

/// An error that occurred while executing a command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command is empty.
    #[error("no command was provided")]
    Empty,

    /// The command line couldn't be split into arguments.
    #[error("failed to parse command `{command}`")]
    Parse {
        /// The command line.
        command: String,

        /// The underlying error.
        #[source]
        err: shell_words::ParseError,
    },

    /// Spawning the command failed.
    #[error("failed to spawn `{command}`")]
    Spawn {
        /// The command line.
        command: String,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Waiting for the command failed.
    #[error("failed to wait for `{command}`")]
    Wait {
        /// The command line.
        command: String,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },
}

impl CommandError {
    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Empty => ErrorKind::Input,
            Self::Parse { .. } => ErrorKind::Configuration,
            Self::Spawn { .. } | Self::Wait { .. } => ErrorKind::System,
        }
    }
}

/// An error returned by a [`Backend`](crate::backend::Backend) or
/// [`TimingCatalog`](crate::backend::TimingCatalog).
#[derive(Debug, Error)]
pub enum BackendError {
    /// Reading a file failed.
    #[error("failed to read `{path}`")]
    Read {
        /// The file.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// A file couldn't be parsed.
    #[error("failed to parse `{path}`")]
    Parse {
        /// The file.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: serde_json::Error,
    },
}

impl BackendError {
    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::System
    }
}

/// An error that occurred while parsing test results.
#[derive(Debug, Error)]
pub enum ResultParseError {
    /// Reading a result file failed.
    #[error("failed to read test results from `{path}`")]
    Read {
        /// The file.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// A result file couldn't be parsed.
    #[error("failed to parse test results from `{path}`")]
    Parse {
        /// The file.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: serde_json::Error,
    },
}

impl ResultParseError {
    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::System
    }
}

/// An error that prevented retries from starting.
#[derive(Debug, Error)]
pub enum RetrySetupError {
    /// Retries were requested while running under an external parallel test harness.
    #[error(
        "retries are not supported when the suite runs under an external parallel test \
         harness, which applies its own retries and exit codes"
    )]
    ExternalHarness,

    /// Retries were requested but no retry command was configured.
    #[error("retries were requested, but no retry command was provided")]
    MissingRetryCommand,

    /// The retry command template is invalid.
    #[error("invalid retry command template")]
    Template(#[from] TemplateError),

    /// No substitution could be selected.
    #[error("failed to select a retry substitution")]
    Substitution(#[from] SubstitutionError),

    /// Setting up intermediate artifact storage failed.
    #[error("failed to set up intermediate artifact storage")]
    Artifacts(#[from] ArtifactStoreError),
}

impl RetrySetupError {
    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ExternalHarness => ErrorKind::Input,
            Self::MissingRetryCommand => ErrorKind::Configuration,
            Self::Template(err) => err.kind(),
            Self::Substitution(err) => err.kind(),
            Self::Artifacts(err) => err.kind(),
        }
    }
}

/// An error that stopped the retry loop partway through.
///
/// Results gathered before the error are kept.
#[derive(Debug, Error)]
#[error("retry round {round} failed")]
pub struct RetryRoundError {
    round: usize,
    #[source]
    kind: RetryRoundErrorKind,
}

impl RetryRoundError {
    pub(crate) fn new(round: usize, kind: impl Into<RetryRoundErrorKind>) -> Self {
        Self {
            round,
            kind: kind.into(),
        }
    }

    /// Returns the round that failed, counting up from 1.
    pub fn round(&self) -> usize {
        self.round
    }

    /// Returns the underlying error.
    pub fn error_kind(&self) -> &RetryRoundErrorKind {
        &self.kind
    }
}

/// The reason a retry round failed.
#[derive(Debug, Error)]
pub enum RetryRoundErrorKind {
    /// Building the substitutions failed.
    #[error("failed to substitute tests into the retry command")]
    Substitution(#[from] SubstitutionError),

    /// Executing a command failed.
    #[error("failed to execute command")]
    Command(#[from] CommandError),

    /// A pre- or post-retry command exited unsuccessfully.
    #[error("{hook} command `{command}` failed{}", exit_code_str(.exit_code.as_ref()))]
    HookFailed {
        /// Either `pre-retry` or `post-retry`.
        hook: &'static str,

        /// The command line.
        command: String,

        /// The exit code, if any.
        exit_code: Option<i32>,
    },

    /// None of the failed tests carry enough information to be passed to the retry command.
    #[error(
        "none of the {count} failed {} can be identified for retrying",
        plural::tests_str(*.count)
    )]
    NoRetryableTests {
        /// The number of failed tests that were up for retrying.
        count: usize,
    },

    /// Expanding result globs failed.
    #[error("failed to find retry results")]
    Glob(#[from] FileGlobError),

    /// The retry command produced no result files.
    #[error("the retry command produced no test results matching {}", .globs.join(", "))]
    NoResults {
        /// The result globs.
        globs: Vec<String>,
    },

    /// Parsing retry results failed.
    #[error("failed to parse retry results")]
    Parse(#[from] ResultParseError),
}

fn exit_code_str(exit_code: Option<&i32>) -> String {
    exit_code.map_or_else(
        || " (terminated by signal)".to_owned(),
        |code| format!(" with exit code {code}"),
    )
}

/// An error that occurred while running a suite.
#[derive(Debug, Error)]
pub enum RunSuiteError {
    /// No command was provided.
    #[error("no command was provided, and the suite has no partition command")]
    NoCommand,

    /// The retry configuration is invalid.
    #[error("invalid retry configuration")]
    RetrySetup(#[from] RetrySetupError),

    /// The partition command template is invalid.
    #[error("invalid partition command template")]
    PartitionTemplate(#[source] TemplateError),

    /// Computing the partition failed.
    #[error("failed to compute partition")]
    Partition(#[from] PartitionError),

    /// The test command couldn't be run.
    #[error("failed to run the test command")]
    Command(#[from] CommandError),

    /// Expanding result globs failed.
    #[error("failed to find test results")]
    Glob(#[from] FileGlobError),

    /// Parsing the results of the test command failed.
    #[error("failed to parse test results")]
    Parse(#[from] ResultParseError),

    /// Creating the async runtime failed.
    #[error("failed to create the async runtime")]
    RuntimeCreate(#[source] std::io::Error),

    /// Writing the final results failed.
    #[error("failed to write test results to `{path}`")]
    WriteResults {
        /// The destination.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },
}

impl RunSuiteError {
    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoCommand => ErrorKind::Input,
            Self::RetrySetup(err) => err.kind(),
            Self::PartitionTemplate(err) => err.kind(),
            Self::Partition(err) => err.kind(),
            Self::Command(err) => err.kind(),
            Self::Glob(err) => err.kind(),
            Self::Parse(err) => err.kind(),
            Self::RuntimeCreate(_) | Self::WriteResults { .. } => ErrorKind::System,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_error_display() {
        let err = TemplateError::UnexpectedKeywords {
            template: "rspec {{ test }}".to_owned(),
            expected: vec!["tests"],
        };
        assert_eq!(
            err.to_string(),
            "template `rspec {{ test }}` must use exactly the keywords {{ tests }}"
        );

        let err = TemplateError::Unclosed {
            template: "rspec {{ tests".to_owned(),
            position: 6,
        };
        assert_eq!(
            err.to_string(),
            "unclosed `{{` at byte 6 in template `rspec {{ tests`"
        );
    }

    #[test]
    fn retry_round_error_display() {
        let err = RetryRoundErrorKind::HookFailed {
            hook: "pre-retry",
            command: "make reset".to_owned(),
            exit_code: Some(2),
        };
        assert_eq!(
            err.to_string(),
            "pre-retry command `make reset` failed with exit code 2"
        );

        let err = RetryRoundErrorKind::NoRetryableTests { count: 1 };
        assert_eq!(
            err.to_string(),
            "none of the 1 failed test can be identified for retrying"
        );
    }
}

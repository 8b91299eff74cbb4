// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use captain_metadata::CaptainExitCode;
use captain_runner::errors::{
    CommandError, ConfigParseError, ErrorKind, PartitionError, RunSuiteError,
};
use owo_colors::OwoColorize;
use std::{error::Error, path::PathBuf};
use thiserror::Error;
use tracing::error;

// Note that the #[error()] strings are mostly placeholder messages -- the expected way to print out
// errors is with the display_to_stderr method, which colorizes errors.

/// An error that stopped captain from completing an invocation.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("could not determine the current directory")]
    CurrentDirFailed {
        #[source]
        err: std::io::Error,
    },
    #[error("current directory is not valid UTF-8")]
    CurrentDirInvalidUtf8 { path: PathBuf },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("command parse error")]
    CommandParseError {
        arg_name: &'static str,
        #[source]
        err: CommandError,
    },
    #[error("missing partition settings")]
    MissingPartitionSettings {
        suite_id: String,
        setting: &'static str,
    },
    #[error("partition error")]
    PartitionError {
        #[from]
        err: PartitionError,
    },
    #[error("failed to write partition")]
    WritePartitionError {
        #[source]
        err: std::io::Error,
    },
    #[error("run suite error")]
    RunSuiteError {
        #[from]
        err: RunSuiteError,
    },
}

impl ExpectedError {
    pub(crate) fn command_parse_error(arg_name: &'static str, err: CommandError) -> Self {
        Self::CommandParseError { arg_name, err }
    }

    pub(crate) fn missing_partition_settings(
        suite_id: impl Into<String>,
        setting: &'static str,
    ) -> Self {
        Self::MissingPartitionSettings {
            suite_id: suite_id.into(),
            setting,
        }
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CurrentDirFailed { .. }
            | Self::CurrentDirInvalidUtf8 { .. }
            | Self::WritePartitionError { .. } => ErrorKind::System,
            Self::ConfigParseError { .. } => ErrorKind::Configuration,
            Self::MissingPartitionSettings { .. } => ErrorKind::Input,
            Self::CommandParseError { err, .. } => err.kind(),
            Self::PartitionError { err } => err.kind(),
            Self::RunSuiteError { err } => err.kind(),
        }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Configuration => CaptainExitCode::SETUP_ERROR,
            ErrorKind::Input => CaptainExitCode::INPUT_ERROR,
            ErrorKind::Internal => CaptainExitCode::INTERNAL_ERROR,
            ErrorKind::System => CaptainExitCode::SYSTEM_ERROR,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::CurrentDirFailed { err } => {
                error!("could not determine the current directory");
                Some(err as &dyn Error)
            }
            Self::CurrentDirInvalidUtf8 { path } => {
                error!(
                    "current directory `{}` is not valid UTF-8",
                    path.display().style(styles.bold)
                );
                None
            }
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse captain config at `{}`",
                    err.config_file().style(styles.bold)
                );
                err.source()
            }
            Self::CommandParseError { arg_name, err } => {
                error!("failed to parse {}", arg_name.style(styles.bold));
                Some(err as &dyn Error)
            }
            Self::MissingPartitionSettings { suite_id, setting } => {
                error!(
                    "partitioning suite `{}` requires {}, but it was not passed in or set in \
                     the config file",
                    suite_id.style(styles.bold),
                    setting.style(styles.bold),
                );
                None
            }
            Self::PartitionError { err } => {
                error!("{err}");
                err.source()
            }
            Self::WritePartitionError { err } => {
                error!("failed to write partition to stdout");
                Some(err as &dyn Error)
            }
            Self::RunSuiteError { err } => {
                error!("{err}");
                err.source()
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use captain_runner::errors::RetrySetupError;
    use test_case::test_case;

    #[test_case(
        ExpectedError::missing_partition_settings("rspec", "--partition-command"),
        CaptainExitCode::INPUT_ERROR;
        "missing partition settings"
    )]
    #[test_case(
        ExpectedError::RunSuiteError { err: RunSuiteError::NoCommand },
        CaptainExitCode::INPUT_ERROR;
        "no command"
    )]
    #[test_case(
        ExpectedError::RunSuiteError {
            err: RunSuiteError::RetrySetup(RetrySetupError::MissingRetryCommand),
        },
        CaptainExitCode::SETUP_ERROR;
        "missing retry command"
    )]
    #[test_case(
        ExpectedError::PartitionError { err: PartitionError::InvalidTotal },
        CaptainExitCode::SETUP_ERROR;
        "invalid total"
    )]
    #[test_case(
        ExpectedError::command_parse_error("--retry-command", CommandError::Empty),
        CaptainExitCode::INPUT_ERROR;
        "empty command"
    )]
    #[test_case(
        ExpectedError::WritePartitionError { err: std::io::Error::other("closed") },
        CaptainExitCode::SYSTEM_ERROR;
        "write partition"
    )]
    fn process_exit_code(error: ExpectedError, expected: i32) {
        assert_eq!(error.process_exit_code(), expected);
    }
}

// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running suite commands as subprocesses.

use crate::errors::CommandError;
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use tokio::runtime::Handle;
use tracing::debug;

/// A command to run, split into arguments, plus extra environment variables.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SuiteCommand {
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl SuiteCommand {
    /// Splits a command line into arguments the way a POSIX shell would.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let args = shell_words::split(line).map_err(|err| CommandError::Parse {
            command: line.to_owned(),
            err,
        })?;
        Self::from_args(args)
    }

    /// Creates a command from already-split arguments.
    pub fn from_args(args: impl IntoIterator<Item = impl Into<String>>) -> Result<Self, CommandError> {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        if args.is_empty() {
            return Err(CommandError::Empty);
        }
        Ok(Self {
            args,
            env: Vec::new(),
        })
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Returns the program to run.
    pub fn program(&self) -> &str {
        &self.args[0]
    }

    /// Returns the arguments, not including the program.
    pub fn args(&self) -> &[String] {
        &self.args[1..]
    }

    /// Returns the extra environment variables.
    pub fn envs(&self) -> &[(String, String)] {
        &self.env
    }
}

impl fmt::Display for SuiteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_words::join(&self.args))
    }
}

/// How a command exited.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommandExit {
    /// The exit code, or `None` if the process was terminated by a signal.
    pub code: Option<i32>,
}

impl CommandExit {
    /// Returns true if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs [`SuiteCommand`]s to completion.
///
/// Commands run one at a time, with inherited stdio.
pub trait CommandExecutor {
    /// Runs `command` and waits for it to exit.
    fn run(&mut self, command: &SuiteCommand) -> Result<CommandExit, CommandError>;
}

/// Runs commands as child processes on a tokio runtime.
#[derive(Clone, Debug)]
pub struct ProcessExecutor {
    handle: Handle,
    cwd: Utf8PathBuf,
}

impl ProcessExecutor {
    /// Creates a new executor that spawns processes on `handle`, in `cwd`.
    pub fn new(handle: Handle, cwd: impl Into<Utf8PathBuf>) -> Self {
        Self {
            handle,
            cwd: cwd.into(),
        }
    }

    /// Returns the directory commands run in.
    pub fn cwd(&self) -> &Utf8Path {
        &self.cwd
    }
}

impl CommandExecutor for ProcessExecutor {
    fn run(&mut self, command: &SuiteCommand) -> Result<CommandExit, CommandError> {
        let mut cmd = std::process::Command::new(command.program());
        cmd.args(command.args()).current_dir(&self.cwd);
        for (key, value) in command.envs() {
            cmd.env(key, value);
        }

        debug!("running `{command}`");
        let mut cmd = tokio::process::Command::from(cmd);
        self.handle.block_on(async {
            let mut child = cmd.spawn().map_err(|err| CommandError::Spawn {
                command: command.to_string(),
                err,
            })?;
            let status = child.wait().await.map_err(|err| CommandError::Wait {
                command: command.to_string(),
                err,
            })?;
            debug!("`{command}` exited with {status}");
            Ok(CommandExit {
                code: status.code(),
            })
        })
    }
}

// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError,
    helpers::current_dir,
    output::{OutputContext, OutputOpts, OutputWriter, StderrStyles},
};
use camino::{Utf8Path, Utf8PathBuf};
use captain_metadata::CaptainExitCode;
use captain_runner::{
    backend::LocalBackend,
    command::SuiteCommand,
    config::{CaptainConfig, PartitionSettings, SuiteConfig},
    parser::JsonResultParser,
    partition::{PartitionConfig, Partitioner},
    plural,
    retry::{MaxTestsToRetry, RetryConfig},
    suite::{PartitionRunConfig, RunReport, RunSuiteConfig, SuiteRunner, external_harness_detected},
};
use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use owo_colors::OwoColorize;
use std::{error::Error, io::Write, sync::Arc};
use tracing::{info, warn};

/// Partition, retry, and quarantine tests in CI.
///
/// Suites are configured in `.captain/config.toml`. Command-line flags override the config file.
#[derive(Debug, Parser)]
#[command(version, name = "captain", max_term_width = 100)]
pub struct CaptainApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(flatten)]
    config_opts: ConfigOpts,

    #[clap(subcommand)]
    command: Command,
}

impl CaptainApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the exit code captain should exit with.
    pub fn exec(
        self,
        output: OutputContext,
        output_writer: &mut OutputWriter,
    ) -> Result<i32, ExpectedError> {
        let working_dir = current_dir()?;
        self.exec_in(&working_dir, output, output_writer)
    }

    fn exec_in(
        self,
        working_dir: &Utf8Path,
        output: OutputContext,
        output_writer: &mut OutputWriter,
    ) -> Result<i32, ExpectedError> {
        let config = self.config_opts.make_config(working_dir)?;
        match self.command {
            Command::Partition(opts) => opts.exec(working_dir, &config, output_writer),
            Command::Run(opts) => opts.exec(working_dir, &config, output),
        }
    }
}

#[derive(Debug, Args)]
struct ConfigOpts {
    /// Config file [default: .captain/config.toml]
    #[arg(long, global = true, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,
}

impl ConfigOpts {
    fn make_config(&self, working_dir: &Utf8Path) -> Result<CaptainConfig, ExpectedError> {
        CaptainConfig::from_sources(working_dir, self.config_file.as_deref())
            .map_err(ExpectedError::from)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print this worker's share of a suite's test files
    ///
    /// Files are balanced across partitions by their historical durations, read from
    /// `.captain/<suite-id>/timings.json`. Files without timings are dealt out round-robin.
    Partition(PartitionOpts),

    /// Run a test suite, retrying failures and quarantining known flaky tests
    ///
    /// The test command is passed after `--`, or read from the suite's config.
    Run(RunOpts),
}

#[derive(Debug, Args)]
struct PartitionOpts {
    /// Globs matching the suite's test files [default: the suite's partition globs]
    #[arg(value_name = "GLOBS")]
    globs: Vec<String>,

    /// The suite to partition
    #[arg(long, value_name = "ID")]
    suite_id: String,

    /// The partition to print, counting up from 0
    #[arg(long, value_name = "N")]
    index: usize,

    /// The total number of partitions
    #[arg(long, value_name = "N")]
    total: usize,

    /// The string to join files with [default: a space]
    #[arg(long, value_name = "STR")]
    delimiter: Option<String>,

    /// Ignore timings and deal files out round-robin
    #[arg(long)]
    round_robin: bool,

    /// A literal prefix to strip from each file
    #[arg(long, value_name = "PREFIX")]
    trim_prefix: Option<String>,
}

impl PartitionOpts {
    fn exec(
        self,
        working_dir: &Utf8Path,
        config: &CaptainConfig,
        output_writer: &mut OutputWriter,
    ) -> Result<i32, ExpectedError> {
        let settings = config
            .suite(&self.suite_id)
            .and_then(|suite| suite.partition.clone())
            .unwrap_or_default();
        let globs = if self.globs.is_empty() {
            settings.globs.clone()
        } else {
            self.globs
        };
        if globs.is_empty() {
            return Err(ExpectedError::missing_partition_settings(
                self.suite_id,
                "test file globs",
            ));
        }

        let partition_config = partition_config(
            self.suite_id,
            globs,
            self.index,
            self.total,
            self.delimiter,
            self.round_robin,
            self.trim_prefix,
            &settings,
        );

        let backend = LocalBackend::new(working_dir.join(LocalBackend::DEFAULT_ROOT));
        let partition = Partitioner::new(&backend, working_dir).partition(&partition_config)?;

        let mut writer = output_writer.stdout_writer();
        partition
            .write_to(&mut writer)
            .and_then(|()| writer.flush())
            .map_err(|err| ExpectedError::WritePartitionError { err })?;
        Ok(CaptainExitCode::OK)
    }
}

/// Builds a partition config from flags, falling back to the suite's partition settings.
#[allow(clippy::too_many_arguments)]
fn partition_config(
    suite_id: String,
    file_globs: Vec<String>,
    index: usize,
    total_partitions: usize,
    delimiter: Option<String>,
    round_robin: bool,
    trim_prefix: Option<String>,
    settings: &PartitionSettings,
) -> PartitionConfig {
    PartitionConfig {
        suite_id,
        file_globs,
        total_partitions,
        index,
        delimiter: delimiter
            .or_else(|| settings.delimiter.clone())
            .unwrap_or_else(|| PartitionConfig::DEFAULT_DELIMITER.to_owned()),
        round_robin: round_robin || settings.round_robin,
        trim_prefix: trim_prefix
            .or_else(|| settings.trim_prefix.clone())
            .filter(|prefix| !prefix.is_empty()),
    }
}

#[derive(Debug, Args)]
struct RunOpts {
    /// The suite to run
    #[arg(long, value_name = "ID")]
    suite_id: String,

    /// Globs matching the result files the test command writes [default: the suite's results]
    #[arg(long = "results", value_name = "GLOB")]
    result_globs: Vec<String>,

    /// Write the final results, with retries and quarantines applied, to this file as JSON
    #[arg(long, value_name = "PATH")]
    write_results: Option<Utf8PathBuf>,

    #[clap(flatten)]
    retry_opts: RetryOpts,

    #[clap(flatten)]
    partition_opts: RunPartitionOpts,

    /// The command that runs the suite [default: the suite's command]
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl RunOpts {
    fn exec(
        self,
        working_dir: &Utf8Path,
        config: &CaptainConfig,
        output: OutputContext,
    ) -> Result<i32, ExpectedError> {
        let suite_config = config.suite(&self.suite_id).cloned().unwrap_or_default();
        let run_config = self.to_run_config(&suite_config)?;

        let backend = Arc::new(LocalBackend::new(
            working_dir.join(LocalBackend::DEFAULT_ROOT),
        ));
        let runner = SuiteRunner::new(backend, working_dir)?;
        let mut executor = runner.process_executor();
        let parser = JsonResultParser::new(working_dir);
        let report = runner.run(&run_config, &mut executor, &parser)?;

        display_report(&report, output.verbose, &output.stderr_styles());
        Ok(report.exit_code)
    }

    fn to_run_config(self, suite_config: &SuiteConfig) -> Result<RunSuiteConfig, ExpectedError> {
        let command = if !self.command.is_empty() {
            Some(
                SuiteCommand::from_args(self.command)
                    .map_err(|err| ExpectedError::command_parse_error("the test command", err))?,
            )
        } else {
            suite_config
                .command
                .as_deref()
                .map(SuiteCommand::parse)
                .transpose()
                .map_err(|err| ExpectedError::command_parse_error("the suite's `command`", err))?
        };

        let result_globs = if self.result_globs.is_empty() {
            suite_config.results.clone()
        } else {
            self.result_globs
        };

        let partition = self
            .partition_opts
            .to_partition_run_config(&self.suite_id, suite_config)?;

        Ok(RunSuiteConfig {
            suite_id: self.suite_id,
            command,
            result_globs,
            retry: self
                .retry_opts
                .apply(suite_config.retries.to_retry_config()),
            partition,
            external_harness_active: external_harness_detected(),
            write_results: self.write_results,
        })
    }
}

#[derive(Debug, Default, Args)]
#[command(next_help_heading = "RETRY OPTIONS")]
struct RetryOpts {
    /// Retry failed tests this many times
    #[arg(long, value_name = "N")]
    retries: Option<usize>,

    /// Retry failed tests known to be flaky this many times [default: --retries]
    #[arg(long, value_name = "N")]
    flaky_retries: Option<usize>,

    /// The command to retry tests with, e.g. `bundle exec rspec {{ tests }}`
    #[arg(long, value_name = "TEMPLATE")]
    retry_command: Option<String>,

    /// Don't retry if more than this many tests failed: a count, or a percentage like `10%`
    #[arg(long, value_name = "N|PCT%")]
    max_tests_to_retry: Option<MaxTestsToRetry>,

    /// Stop retrying once a test has used up its retries and is still failing
    #[arg(long)]
    fail_retries_fast: bool,

    /// A command to run before every retry (may be repeated)
    #[arg(long, value_name = "COMMAND")]
    pre_retry_command: Vec<String>,

    /// A command to run after every retry (may be repeated)
    #[arg(long, value_name = "COMMAND")]
    post_retry_command: Vec<String>,

    /// Keep the result files of every attempt in this directory [default: a temporary directory]
    #[arg(long, value_name = "PATH")]
    intermediate_artifacts_path: Option<Utf8PathBuf>,
}

impl RetryOpts {
    /// Overrides `config` with any flags that were passed in.
    fn apply(self, mut config: RetryConfig) -> RetryConfig {
        if self.retries.is_some() {
            config.retries = self.retries;
        }
        if self.flaky_retries.is_some() {
            config.flaky_retries = self.flaky_retries;
        }
        if self.retry_command.is_some() {
            config.retry_command_template = self.retry_command;
        }
        if let Some(max_tests_to_retry) = self.max_tests_to_retry {
            config.max_tests_to_retry = max_tests_to_retry;
        }
        config.fail_retries_fast |= self.fail_retries_fast;
        if !self.pre_retry_command.is_empty() {
            config.pre_retry_commands = self.pre_retry_command;
        }
        if !self.post_retry_command.is_empty() {
            config.post_retry_commands = self.post_retry_command;
        }
        if self.intermediate_artifacts_path.is_some() {
            config.intermediate_artifacts_path = self.intermediate_artifacts_path;
        }
        config
    }
}

#[derive(Debug, Default, Args)]
#[command(next_help_heading = "PARTITION OPTIONS")]
struct RunPartitionOpts {
    /// Run only this partition of the suite's test files, counting up from 0
    #[arg(long, value_name = "N", requires = "partition_total")]
    partition_index: Option<usize>,

    /// The total number of partitions
    #[arg(long, value_name = "N", requires = "partition_index")]
    partition_total: Option<usize>,

    /// The command to run a partition with, e.g. `bundle exec rspec {{ testFiles }}`
    #[arg(long, value_name = "TEMPLATE")]
    partition_command: Option<String>,

    /// Globs matching the suite's test files (may be repeated)
    #[arg(long = "partition-glob", value_name = "GLOB")]
    partition_globs: Vec<String>,

    /// The string to join files with in the partition command [default: a space]
    #[arg(long, value_name = "STR")]
    partition_delimiter: Option<String>,

    /// Ignore timings and deal files out round-robin
    #[arg(long)]
    partition_round_robin: bool,

    /// A literal prefix to strip from each file
    #[arg(long, value_name = "PREFIX")]
    partition_trim_prefix: Option<String>,
}

impl RunPartitionOpts {
    fn to_partition_run_config(
        self,
        suite_id: &str,
        suite_config: &SuiteConfig,
    ) -> Result<Option<PartitionRunConfig>, ExpectedError> {
        let (Some(index), Some(total)) = (self.partition_index, self.partition_total) else {
            return Ok(None);
        };
        let settings = suite_config.partition.clone().unwrap_or_default();

        let command_template = self
            .partition_command
            .or_else(|| settings.command.clone())
            .ok_or_else(|| {
                ExpectedError::missing_partition_settings(suite_id, "a partition command")
            })?;
        let globs = if self.partition_globs.is_empty() {
            settings.globs.clone()
        } else {
            self.partition_globs
        };
        if globs.is_empty() {
            return Err(ExpectedError::missing_partition_settings(
                suite_id,
                "test file globs",
            ));
        }

        Ok(Some(PartitionRunConfig {
            command_template,
            partition: partition_config(
                suite_id.to_owned(),
                globs,
                index,
                total,
                self.partition_delimiter,
                self.partition_round_robin,
                self.partition_trim_prefix,
                &settings,
            ),
        }))
    }
}

fn display_report(report: &RunReport, verbose: bool, styles: &StderrStyles) {
    if let Some(err) = &report.retry_error {
        warn!("retries stopped early: {err}");
        let mut next_error = err.source();
        while let Some(err) = next_error {
            warn!("  caused by: {err}");
            next_error = err.source();
        }
    }

    let Some(results) = &report.results else {
        return;
    };

    let summary = results.summary();
    info!(
        "{} {} run: {} passed, {} failed, {} quarantined, {} retried",
        summary.tests.style(styles.bold),
        plural::tests_str(summary.tests),
        summary.successful.style(styles.bold),
        report.actionable_failures.len().style(styles.bold),
        report.quarantined.len().style(styles.bold),
        summary.retries.style(styles.bold),
    );
    if summary.other_errors > 0 {
        warn!(
            "{} {} reported outside of any test",
            summary.other_errors.style(styles.warning),
            if summary.other_errors == 1 {
                "error was"
            } else {
                "errors were"
            },
        );
    }

    if verbose && !report.quarantined.is_empty() {
        info!(
            "quarantined: {}",
            report
                .quarantined
                .iter()
                .map(|test| test.name.style(styles.bold))
                .join(", ")
        );
    }
    if !report.actionable_failures.is_empty() {
        info!(
            "failed: {}",
            report
                .actionable_failures
                .iter()
                .map(|test| test.name.style(styles.bold))
                .join(", ")
        );
    }
}

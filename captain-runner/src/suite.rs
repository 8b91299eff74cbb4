// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running a test suite end to end.
//!
//! The main structure in this module is [`SuiteRunner`]. A run executes the suite's command
//! (optionally on just this worker's partition of the test files), parses its results, retries
//! failures, and finally quarantines failures that the backend knows about.

use crate::{
    backend::{Backend, RunConfiguration},
    command::{CommandExecutor, CommandExit, ProcessExecutor, SuiteCommand},
    errors::{RetryRoundError, RetrySetupError, RunSuiteError},
    file_glob::expand_globs,
    helpers::{absolutize, plural},
    parser::ResultParser,
    partition::{PartitionConfig, Partitioner},
    retry::{CompiledTemplate, RetryConfig, RetryOrchestrator},
};
use camino::{Utf8Path, Utf8PathBuf};
use captain_metadata::{CaptainExitCode, Test, TestResults};
use itertools::Itertools;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// The keyword in partition command templates that's replaced with this partition's files.
pub const TEST_FILES_KEYWORD: &str = "testFiles";

/// Set by ABQ when a suite runs under it.
pub const ABQ_STATE_FILE_ENV: &str = "ABQ_STATE_FILE";

/// Set by ABQ when it controls the exit code of a suite.
pub const ABQ_SET_EXIT_CODE_ENV: &str = "ABQ_SET_EXIT_CODE";

/// Returns true if the environment indicates that the suite runs under ABQ, an external parallel
/// test harness.
pub fn external_harness_detected() -> bool {
    std::env::var_os(ABQ_STATE_FILE_ENV).is_some() || std::env::var_os(ABQ_SET_EXIT_CODE_ENV).is_some()
}

/// Configuration for a single suite run.
#[derive(Clone, Debug, Default)]
pub struct RunSuiteConfig {
    /// The suite ID, used to look up timings and quarantined and flaky tests.
    pub suite_id: String,

    /// The command that runs the suite. Unused in partition mode.
    pub command: Option<SuiteCommand>,

    /// Globs matching the result files the command writes.
    pub result_globs: Vec<String>,

    /// Retry settings.
    pub retry: RetryConfig,

    /// If set, run only this worker's partition of the test files.
    pub partition: Option<PartitionRunConfig>,

    /// True if the suite runs under an external parallel test harness.
    pub external_harness_active: bool,

    /// Write the final results as JSON to this path.
    pub write_results: Option<Utf8PathBuf>,
}

/// Settings for partition mode.
#[derive(Clone, Debug)]
pub struct PartitionRunConfig {
    /// The command to run, with a `{{ testFiles }}` placeholder.
    pub command_template: String,

    /// Which partition to run.
    pub partition: PartitionConfig,
}

/// The outcome of a suite run.
#[derive(Debug)]
pub struct RunReport {
    /// The final results, or `None` if nothing ran or no results were found.
    pub results: Option<TestResults>,

    /// True if retries were attempted.
    pub did_retry: bool,

    /// Failed tests that were quarantined.
    pub quarantined: Vec<Test>,

    /// Failed tests that weren't quarantined.
    pub actionable_failures: Vec<Test>,

    /// How the suite command exited, or `None` if it wasn't run.
    pub command_exit: Option<CommandExit>,

    /// The error that stopped retries early, if any.
    pub retry_error: Option<RetryRoundError>,

    /// The exit code captain should exit with.
    pub exit_code: i32,
}

impl RunReport {
    fn skipped() -> Self {
        Self {
            results: None,
            did_retry: false,
            quarantined: Vec::new(),
            actionable_failures: Vec::new(),
            command_exit: None,
            retry_error: None,
            exit_code: CaptainExitCode::OK,
        }
    }
}

/// The failed tests of a run, split by whether they were quarantined.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuarantineDisposition {
    /// Tests that were quarantined.
    pub quarantined: Vec<Test>,

    /// Tests that still fail the run.
    pub actionable: Vec<Test>,
}

/// Quarantines every failed test in `results` that the backend has quarantined and that could be
/// failing intermittently.
pub fn apply_quarantines(
    results: &mut TestResults,
    run_configuration: &RunConfiguration,
) -> QuarantineDisposition {
    let mut disposition = QuarantineDisposition::default();
    for test in results.tests.iter_mut().filter(|test| test.implies_failure()) {
        if test.attempt.status.potentially_flaky() && run_configuration.is_quarantined(test) {
            test.quarantine();
            disposition.quarantined.push(test.clone());
        } else {
            disposition.actionable.push(test.clone());
        }
    }
    disposition
}

/// Computes the exit code for a run whose command exited with `original`.
///
/// Only errors outside of tests reported by the original attempt, `original_other_errors`, affect
/// the exit code. Those reported by retries are kept in the results but otherwise ignored.
fn exit_code(
    original: Option<i32>,
    original_other_errors: bool,
    actionable_failures: usize,
) -> i32 {
    let failed_code = match original {
        Some(code) if code != 0 => code,
        _ => CaptainExitCode::TEST_RUN_FAILED,
    };
    if original_other_errors {
        // Errors outside of tests can't be quarantined.
        failed_code
    } else if actionable_failures == 0 {
        CaptainExitCode::OK
    } else {
        failed_code
    }
}

/// Runs test suites.
pub struct SuiteRunner {
    backend: Arc<dyn Backend + Send + Sync>,
    runtime: Runtime,
    working_dir: Utf8PathBuf,
}

impl fmt::Debug for SuiteRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteRunner")
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}

impl SuiteRunner {
    /// Creates a new runner. Commands run in, and paths are relative to, `working_dir`.
    pub fn new(
        backend: Arc<dyn Backend + Send + Sync>,
        working_dir: impl Into<Utf8PathBuf>,
    ) -> Result<Self, RunSuiteError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("captain-runner-worker")
            .build()
            .map_err(RunSuiteError::RuntimeCreate)?;
        Ok(Self {
            backend,
            runtime,
            working_dir: working_dir.into(),
        })
    }

    /// Returns the working directory.
    pub fn working_dir(&self) -> &Utf8Path {
        &self.working_dir
    }

    /// Returns an executor that runs commands as child processes on this runner's runtime.
    pub fn process_executor(&self) -> ProcessExecutor {
        ProcessExecutor::new(self.runtime.handle().clone(), self.working_dir.clone())
    }

    /// Runs a suite.
    pub fn run(
        &self,
        config: &RunSuiteConfig,
        executor: &mut dyn CommandExecutor,
        parser: &dyn ResultParser,
    ) -> Result<RunReport, RunSuiteError> {
        let partition_template = match &config.partition {
            Some(partition) => {
                let template = CompiledTemplate::compile(&partition.command_template)
                    .and_then(|template| {
                        template.validate(&[TEST_FILES_KEYWORD])?;
                        Ok(template)
                    })
                    .map_err(RunSuiteError::PartitionTemplate)?;
                Some((template, &partition.partition))
            }
            None if config.command.is_none() => return Err(RunSuiteError::NoCommand),
            None => None,
        };
        config.retry.validate()?;
        if config.retry.is_enabled() && config.external_harness_active {
            return Err(RetrySetupError::ExternalHarness.into());
        }

        let fetch = {
            let backend = self.backend.clone();
            let suite_id = config.suite_id.clone();
            self.runtime
                .spawn_blocking(move || backend.get_run_configuration(&suite_id))
        };

        let command = match partition_template {
            Some((template, partition_config)) => {
                let partitioner = Partitioner::new(&*self.backend, &self.working_dir);
                let partition = partitioner.partition(partition_config)?;
                if partition.is_empty() {
                    info!(
                        "no test files were assigned to partition {} of {} ({} {} in use), \
                         skipping the test command",
                        partition_config.index + 1,
                        partition_config.total_partitions,
                        partition.utilized_partitions(),
                        plural::partitions_str(partition.utilized_partitions()),
                    );
                    return Ok(RunReport::skipped());
                }

                let files = partition
                    .files()
                    .iter()
                    .map(|file| shell_words::quote(file))
                    .join(&partition_config.delimiter);
                let values = BTreeMap::from([(TEST_FILES_KEYWORD.to_owned(), files)]);
                SuiteCommand::parse(&template.substitute(&values))?
            }
            None => config.command.clone().ok_or(RunSuiteError::NoCommand)?,
        };

        info!("running `{command}`");
        let command_exit = executor.run(&command)?;
        debug!("test command exited with {:?}", command_exit.code);

        let mut files = expand_globs(&self.working_dir, &config.result_globs)?;
        if let Some(store) = &config.retry.intermediate_artifacts_path {
            let store = absolutize(&self.working_dir, store);
            files.retain(|file| !absolutize(&self.working_dir, file).starts_with(&store));
        }
        if files.is_empty() {
            warn!(
                "no test results were found matching {}, so the exit code of the test command \
                 is used",
                config.result_globs.join(", "),
            );
            return Ok(RunReport {
                command_exit: Some(command_exit),
                exit_code: command_exit.code.unwrap_or(CaptainExitCode::TEST_RUN_FAILED),
                ..RunReport::skipped()
            });
        }
        let results = parser.parse(&files)?;
        let original_other_errors = results.has_other_errors();

        let run_configuration = match self.runtime.block_on(fetch) {
            Ok(Ok(run_configuration)) => run_configuration,
            Ok(Err(err)) => {
                warn!(
                    "failed to fetch quarantined and flaky tests, continuing without them: {err}"
                );
                RunConfiguration::default()
            }
            Err(err) => {
                warn!("fetching quarantined and flaky tests did not complete: {err}");
                RunConfiguration::default()
            }
        };

        let outcome = {
            let mut orchestrator = RetryOrchestrator::new(
                &config.retry,
                &run_configuration,
                executor,
                parser,
                &self.working_dir,
                config.result_globs.clone(),
            );
            orchestrator.set_external_harness_active(config.external_harness_active);
            orchestrator.run(results, &files)?
        };

        let mut results = outcome.results;
        let disposition = apply_quarantines(&mut results, &run_configuration);
        if !disposition.quarantined.is_empty() {
            info!(
                "quarantined {} failed {}",
                disposition.quarantined.len(),
                plural::tests_str(disposition.quarantined.len()),
            );
        }
        let exit_code = exit_code(
            command_exit.code,
            original_other_errors,
            disposition.actionable.len(),
        );

        if let Some(path) = &config.write_results {
            let path = self.working_dir.join(path);
            write_results(&path, &results)
                .map_err(|err| RunSuiteError::WriteResults { path, err })?;
        }

        Ok(RunReport {
            results: Some(results),
            did_retry: outcome.did_retry,
            quarantined: disposition.quarantined,
            actionable_failures: disposition.actionable,
            command_exit: Some(command_exit),
            retry_error: outcome.error,
            exit_code,
        })
    }
}

fn write_results(path: &Utf8Path, results: &TestResults) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_vec_pretty(results)?;
    std::fs::write(path, contents)
}

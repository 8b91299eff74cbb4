// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{CompiledTemplate, RetryBudgets, RetryConfig, Substitution, SubstitutionValues};
use crate::{
    artifacts::IntermediateArtifacts,
    backend::RunConfiguration,
    command::{CommandExecutor, SuiteCommand},
    errors::{RetryRoundError, RetryRoundErrorKind, RetrySetupError},
    file_glob::expand_globs,
    helpers::plural,
    parser::ResultParser,
};
use camino::Utf8PathBuf;
use captain_metadata::{Test, TestResults};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Set to the retry round, counting up from 1, for every retry and pre/post-retry command.
pub const RETRY_ATTEMPT_NUMBER_ENV: &str = "CAPTAIN_RETRY_ATTEMPT_NUMBER";

/// Set to a UUID that's unique to the retry round.
pub const RETRY_INVOCATION_ID_ENV: &str = "CAPTAIN_RETRY_INVOCATION_ID";

/// Set to `command-<n>`, where `n` counts the retry command invocations in the round from 1.
pub const RETRY_COMMAND_ID_ENV: &str = "CAPTAIN_RETRY_COMMAND_ID";

/// The result of [`RetryOrchestrator::run`].
#[derive(Debug)]
pub struct RetryOutcome {
    /// The original results, with every retry merged in.
    pub results: TestResults,

    /// True if the retry loop was entered, even if it stopped before running anything.
    pub did_retry: bool,

    /// The number of rounds that ran retry commands.
    pub rounds: usize,

    /// The error that stopped the loop early, if any. `results` holds everything gathered
    /// before it.
    pub error: Option<RetryRoundError>,
}

impl RetryOutcome {
    fn not_retried(results: TestResults) -> Self {
        Self {
            results,
            did_retry: false,
            rounds: 0,
            error: None,
        }
    }
}

/// Reruns failed tests until they pass or their retry budget runs out.
///
/// Tests known to be flaky and all other tests have separate budgets. Each round retries every
/// test that's still failing and has budget left, through the configured retry command. The
/// results of each retry are merged into the running results, so a retried test keeps every
/// earlier attempt.
pub struct RetryOrchestrator<'a> {
    config: &'a RetryConfig,
    run_configuration: &'a RunConfiguration,
    executor: &'a mut dyn CommandExecutor,
    parser: &'a dyn ResultParser,
    working_dir: Utf8PathBuf,
    result_globs: Vec<String>,
    external_harness_active: bool,
}

impl fmt::Debug for RetryOrchestrator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOrchestrator")
            .field("config", &self.config)
            .field("run_configuration", &self.run_configuration)
            .field("working_dir", &self.working_dir)
            .field("result_globs", &self.result_globs)
            .field("external_harness_active", &self.external_harness_active)
            .finish_non_exhaustive()
    }
}

impl<'a> RetryOrchestrator<'a> {
    /// Creates a new orchestrator.
    ///
    /// `result_globs` are expanded against `working_dir` after every retry command to find the
    /// files it wrote.
    pub fn new(
        config: &'a RetryConfig,
        run_configuration: &'a RunConfiguration,
        executor: &'a mut dyn CommandExecutor,
        parser: &'a dyn ResultParser,
        working_dir: impl Into<Utf8PathBuf>,
        result_globs: Vec<String>,
    ) -> Self {
        Self {
            config,
            run_configuration,
            executor,
            parser,
            working_dir: working_dir.into(),
            result_globs,
            external_harness_active: false,
        }
    }

    /// Records whether the suite ran under an external parallel test harness, which is
    /// incompatible with retries.
    pub fn set_external_harness_active(&mut self, active: bool) -> &mut Self {
        self.external_harness_active = active;
        self
    }

    /// Retries failures in `original`, whose result files are `original_files`.
    ///
    /// Errors only if retries couldn't be set up. An error partway through the loop is returned
    /// in [`RetryOutcome::error`] alongside the results gathered so far.
    pub fn run(
        &mut self,
        original: TestResults,
        original_files: &[Utf8PathBuf],
    ) -> Result<RetryOutcome, RetrySetupError> {
        if !self.config.is_enabled() {
            return Ok(RetryOutcome::not_retried(original));
        }
        let budgets = self.config.budgets();
        debug!(
            "retry budgets: {} for tests, {} for flaky tests",
            budgets.retries, budgets.flaky_retries
        );

        if self.external_harness_active {
            return Err(RetrySetupError::ExternalHarness);
        }
        let template = self
            .config
            .validate()?
            .ok_or(RetrySetupError::MissingRetryCommand)?;

        // An ephemeral directory is removed when `artifacts` is dropped, including on the error
        // paths below.
        let mut artifacts = IntermediateArtifacts::new(
            self.config.intermediate_artifacts_path.as_deref(),
            &self.working_dir,
        )?;
        let template = CompiledTemplate::compile(template)?;
        let mut substitution = Substitution::select(&template, &original.framework)?;

        let original_files: Vec<_> = original_files
            .iter()
            .filter(|file| !artifacts.contains(file))
            .cloned()
            .collect();
        if let Err(err) = artifacts.move_results(&original_files) {
            warn!("failed to store results of the original attempt: {err}");
            artifacts.discard(&original_files);
        }

        let mut results = original;
        let mut rounds = 0;
        let error = self.retry_loop(
            budgets,
            &template,
            &mut substitution,
            &mut artifacts,
            &mut results,
            &mut rounds,
        );
        if let Some(error) = &error {
            warn!("stopped retrying: {error}");
        }

        substitution.clean_up();
        if artifacts.is_ephemeral() {
            artifacts.delete();
        }

        Ok(RetryOutcome {
            results,
            did_retry: true,
            rounds,
            error,
        })
    }

    fn retry_loop(
        &mut self,
        budgets: RetryBudgets,
        template: &CompiledTemplate,
        substitution: &mut Substitution,
        artifacts: &mut IntermediateArtifacts,
        results: &mut TestResults,
        rounds: &mut usize,
    ) -> Option<RetryRoundError> {
        let max_rounds = budgets.max_rounds();
        for round in 1..=max_rounds {
            let invocations = {
                let (flaky, non_flaky): (Vec<&Test>, Vec<&Test>) = results
                    .failed_tests()
                    .partition(|test| self.run_configuration.is_flaky(test));
                let non_flaky_exhausted = budgets.non_flaky_exhausted(round);
                let flaky_exhausted = budgets.flaky_exhausted(round);

                let mut to_retry = Vec::new();
                if !non_flaky_exhausted {
                    to_retry.extend(non_flaky.iter().copied());
                }
                if !flaky_exhausted {
                    to_retry.extend(flaky.iter().copied());
                }

                if to_retry.is_empty() {
                    info!("no failed tests left to retry");
                    return None;
                }
                if self
                    .config
                    .max_tests_to_retry
                    .is_exceeded(to_retry.len(), results.tests.len())
                {
                    info!(
                        "not retrying: {} failed {} exceeds the limit of {}",
                        to_retry.len(),
                        plural::tests_str(to_retry.len()),
                        self.config.max_tests_to_retry,
                    );
                    return None;
                }
                if non_flaky_exhausted && flaky_exhausted {
                    return None;
                }
                if self.config.fail_retries_fast
                    && ((non_flaky_exhausted && !non_flaky.is_empty())
                        || (flaky_exhausted && !flaky.is_empty()))
                {
                    info!("not retrying: tests that have used all their retries are still failing");
                    return None;
                }

                info!(
                    "retrying {} failed {} (round {round} of {max_rounds})",
                    to_retry.len(),
                    plural::tests_str(to_retry.len()),
                );
                match substitution.substitutions(&results.framework, &to_retry) {
                    Ok(invocations) if invocations.is_empty() => {
                        return Some(RetryRoundError::new(
                            round,
                            RetryRoundErrorKind::NoRetryableTests {
                                count: to_retry.len(),
                            },
                        ));
                    }
                    Ok(invocations) => invocations,
                    Err(err) => return Some(RetryRoundError::new(round, err)),
                }
            };

            *rounds = round;
            if let Err(kind) = self.run_round(round, template, &invocations, artifacts, results) {
                return Some(RetryRoundError::new(round, kind));
            }
        }
        None
    }

    fn run_round(
        &mut self,
        round: usize,
        template: &CompiledTemplate,
        invocations: &[SubstitutionValues],
        artifacts: &mut IntermediateArtifacts,
        results: &mut TestResults,
    ) -> Result<(), RetryRoundErrorKind> {
        let config = self.config;
        artifacts.set_retry(round);
        let invocation_id = Uuid::new_v4().to_string();

        for (index, values) in invocations.iter().enumerate() {
            let command_number = index + 1;
            artifacts.set_command(command_number);
            let env = RetryEnv {
                round,
                invocation_id: &invocation_id,
                command_id: format!("command-{command_number}"),
            };

            for hook in &config.pre_retry_commands {
                self.run_hook("pre-retry", hook, &env)?;
            }

            let command = env.apply(SuiteCommand::parse(&template.substitute(values))?);
            let exit = self.executor.run(&command)?;
            debug!("retry command exited with {:?}", exit.code);

            for hook in &config.post_retry_commands {
                self.run_hook("post-retry", hook, &env)?;
            }

            let mut files = expand_globs(&self.working_dir, &self.result_globs)?;
            files.retain(|file| !artifacts.contains(file));
            if files.is_empty() {
                return Err(RetryRoundErrorKind::NoResults {
                    globs: self.result_globs.clone(),
                });
            }
            let retried = self.parser.parse(&files)?;
            *results = std::mem::take(results).merge(retried);

            if let Err(err) = artifacts.move_results(&files) {
                warn!("failed to store results of retry {round}: {err}");
                artifacts.discard(&files);
            }
        }

        Ok(())
    }

    fn run_hook(
        &mut self,
        hook: &'static str,
        line: &str,
        env: &RetryEnv<'_>,
    ) -> Result<(), RetryRoundErrorKind> {
        let command = env.apply(SuiteCommand::parse(line)?);
        let exit = self.executor.run(&command)?;
        if exit.success() {
            Ok(())
        } else {
            Err(RetryRoundErrorKind::HookFailed {
                hook,
                command: line.to_owned(),
                exit_code: exit.code,
            })
        }
    }
}

struct RetryEnv<'a> {
    round: usize,
    invocation_id: &'a str,
    command_id: String,
}

impl RetryEnv<'_> {
    fn apply(&self, command: SuiteCommand) -> SuiteCommand {
        command
            .env(RETRY_ATTEMPT_NUMBER_ENV, self.round.to_string())
            .env(RETRY_INVOCATION_ID_ENV, self.invocation_id)
            .env(RETRY_COMMAND_ID_ENV, self.command_id.as_str())
    }
}

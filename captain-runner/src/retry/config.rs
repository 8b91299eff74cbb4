// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::{MaxTestsToRetryParseError, RetrySetupError};
use camino::Utf8PathBuf;
use serde::{Deserialize, de::Unexpected};
use std::{fmt, str::FromStr};

/// Configuration for retrying failed tests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RetryConfig {
    /// How many times to retry tests that aren't known to be flaky. `None` means unset.
    pub retries: Option<usize>,

    /// How many times to retry tests known to be flaky. `None` means unset, in which case this
    /// follows `retries`.
    pub flaky_retries: Option<usize>,

    /// The command to run for retries, with placeholders for the tests to retry.
    pub retry_command_template: Option<String>,

    /// Stop retrying if more than this many tests would be retried.
    pub max_tests_to_retry: MaxTestsToRetry,

    /// Stop retrying as soon as a test has exhausted its retries and is still failing.
    pub fail_retries_fast: bool,

    /// Commands to run before every retry command.
    pub pre_retry_commands: Vec<String>,

    /// Commands to run after every retry command.
    pub post_retry_commands: Vec<String>,

    /// Where to keep the result files of every attempt. A temporary directory if unset.
    pub intermediate_artifacts_path: Option<Utf8PathBuf>,
}

impl RetryConfig {
    /// Returns true if either retry budget is positive.
    pub fn is_enabled(&self) -> bool {
        self.retries.unwrap_or(0) > 0 || self.flaky_retries.unwrap_or(0) > 0
    }

    /// Returns the effective retry budgets.
    ///
    /// A positive `retries` with `flaky_retries` unset gives flaky tests the same budget. The
    /// reverse doesn't hold.
    pub fn budgets(&self) -> RetryBudgets {
        let retries = self.retries.unwrap_or(0);
        let flaky_retries = match self.flaky_retries {
            Some(flaky_retries) => flaky_retries,
            None if retries > 0 => retries,
            None => 0,
        };
        RetryBudgets {
            retries,
            flaky_retries,
        }
    }

    /// Returns the retry command template, if retries are enabled.
    ///
    /// Errors if retries are enabled but no template was configured.
    pub fn validate(&self) -> Result<Option<&str>, RetrySetupError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        match self.retry_command_template.as_deref().map(str::trim) {
            Some(template) if !template.is_empty() => Ok(Some(template)),
            _ => Err(RetrySetupError::MissingRetryCommand),
        }
    }
}

/// Effective retry budgets, after normalization.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryBudgets {
    /// Retries for tests not known to be flaky.
    pub retries: usize,

    /// Retries for tests known to be flaky.
    pub flaky_retries: usize,
}

impl RetryBudgets {
    /// Returns the number of rounds the retry loop may run for.
    pub fn max_rounds(&self) -> usize {
        self.retries.max(self.flaky_retries)
    }

    /// Returns true if non-flaky tests have no retries left in `round`.
    pub fn non_flaky_exhausted(&self, round: usize) -> bool {
        round > self.retries
    }

    /// Returns true if flaky tests have no retries left in `round`.
    pub fn flaky_exhausted(&self, round: usize) -> bool {
        round > self.flaky_retries
    }
}

/// An upper bound on how many tests a retry round may retry.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum MaxTestsToRetry {
    /// No limit.
    #[default]
    Unlimited,

    /// At most this many tests.
    Count(usize),

    /// At most this percentage of all tests.
    Percentage(f64),
}

impl MaxTestsToRetry {
    /// Returns true if retrying `remaining` out of `total` tests goes over the limit.
    pub fn is_exceeded(&self, remaining: usize, total: usize) -> bool {
        match self {
            Self::Unlimited => false,
            Self::Count(count) => remaining > *count,
            Self::Percentage(percentage) => (remaining as f64) * 100.0 > percentage * (total as f64),
        }
    }
}

impl FromStr for MaxTestsToRetry {
    type Err = MaxTestsToRetryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::Unlimited);
        }

        if let Some(percentage) = s.strip_suffix('%') {
            return match percentage.trim().parse::<f64>() {
                Ok(p) if p.is_finite() && p >= 0.0 => Ok(Self::Percentage(p)),
                Ok(_) => Err(MaxTestsToRetryParseError::new(
                    s,
                    "percentage must be a non-negative number",
                )),
                Err(e) => Err(MaxTestsToRetryParseError::new(
                    s,
                    format!("{e} parsing '{percentage}'"),
                )),
            };
        }

        s.parse::<usize>()
            .map(Self::Count)
            .map_err(|e| MaxTestsToRetryParseError::new(s, format!("{e} parsing '{s}'")))
    }
}

impl fmt::Display for MaxTestsToRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => write!(f, "unlimited"),
            Self::Count(count) => write!(f, "{count}"),
            Self::Percentage(percentage) => write!(f, "{percentage}%"),
        }
    }
}

impl<'de> Deserialize<'de> for MaxTestsToRetry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = MaxTestsToRetry;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a number of tests (10) or a percentage (\"10%\")")
            }

            // Note that TOML uses i64, not u64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                usize::try_from(v)
                    .map(MaxTestsToRetry::Count)
                    .map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                usize::try_from(v)
                    .map(MaxTestsToRetry::Count)
                    .map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(V)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Some(5), None, 5, 5 ; "flaky follows retries")]
    #[test_case(Some(2), Some(4), 2, 4 ; "both set")]
    #[test_case(None, Some(3), 0, 3 ; "flaky only")]
    #[test_case(Some(3), Some(0), 3, 0 ; "flaky explicitly disabled")]
    #[test_case(None, None, 0, 0 ; "neither set")]
    fn budget_normalization(
        retries: Option<usize>,
        flaky_retries: Option<usize>,
        expected_retries: usize,
        expected_flaky: usize,
    ) {
        let config = RetryConfig {
            retries,
            flaky_retries,
            ..Default::default()
        };
        assert_eq!(
            config.budgets(),
            RetryBudgets {
                retries: expected_retries,
                flaky_retries: expected_flaky,
            }
        );
    }

    #[test]
    fn exhaustion_is_strictly_past_the_budget() {
        let budgets = RetryBudgets {
            retries: 2,
            flaky_retries: 4,
        };
        assert_eq!(budgets.max_rounds(), 4);
        assert!(!budgets.non_flaky_exhausted(2));
        assert!(budgets.non_flaky_exhausted(3));
        assert!(!budgets.flaky_exhausted(4));
    }

    #[test]
    fn validate_requires_template() {
        let mut config = RetryConfig {
            retries: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RetrySetupError::MissingRetryCommand)
        ));

        config.retry_command_template = Some("  ".to_owned());
        assert!(config.validate().is_err());

        config.retry_command_template = Some("rspec {{ tests }}".to_owned());
        assert_eq!(config.validate().unwrap(), Some("rspec {{ tests }}"));

        config.retries = Some(0);
        assert_eq!(config.validate().unwrap(), None);
    }

    #[test_case("", MaxTestsToRetry::Unlimited ; "empty")]
    #[test_case("10", MaxTestsToRetry::Count(10) ; "count")]
    #[test_case("0", MaxTestsToRetry::Count(0) ; "zero")]
    #[test_case("50%", MaxTestsToRetry::Percentage(50.0) ; "percentage")]
    #[test_case("12.5 %", MaxTestsToRetry::Percentage(12.5) ; "fractional percentage")]
    fn parse_valid(input: &str, expected: MaxTestsToRetry) {
        assert_eq!(input.parse::<MaxTestsToRetry>().unwrap(), expected);
    }

    #[test_case("-1" ; "negative")]
    #[test_case("-5%" ; "negative percentage")]
    #[test_case("ten" ; "word")]
    #[test_case("10%%" ; "double percent")]
    fn parse_invalid(input: &str) {
        input
            .parse::<MaxTestsToRetry>()
            .expect_err("input should be rejected");
    }

    #[test]
    fn thresholds() {
        let half = MaxTestsToRetry::Percentage(50.0);
        assert!(half.is_exceeded(3, 3));
        assert!(!half.is_exceeded(1, 3));
        assert!(!MaxTestsToRetry::Percentage(200.0).is_exceeded(3, 3));

        assert!(MaxTestsToRetry::Count(2).is_exceeded(3, 10));
        assert!(!MaxTestsToRetry::Count(3).is_exceeded(3, 10));
        assert!(!MaxTestsToRetry::Unlimited.is_exceeded(usize::MAX, 1));
    }

    #[test]
    fn deserialize_from_number_or_string() {
        let count: MaxTestsToRetry = serde_json::from_str("7").unwrap();
        assert_eq!(count, MaxTestsToRetry::Count(7));
        let percentage: MaxTestsToRetry = serde_json::from_str("\"25%\"").unwrap();
        assert_eq!(percentage, MaxTestsToRetry::Percentage(25.0));
        serde_json::from_str::<MaxTestsToRetry>("-3").expect_err("negative count");
    }
}

// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Log and stdout output for the `captain` binary.

use clap::{Args, ValueEnum};
use owo_colors::{OwoColorize, Style, style};
use std::{
    fmt,
    io::{BufWriter, Write},
    sync::Once,
};
use tracing::{Event, Level, Subscriber, level_filters::LevelFilter};
use tracing_subscriber::{
    Layer,
    filter::Targets,
    fmt::{FmtContext, FormatEvent, FormatFields, format},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Events with this target are printed without an `error:`/`warning:` heading.
pub(crate) const NO_HEADING_TARGET: &str = "captain::no_heading";

/// The environment variable used to filter log output.
pub(crate) const LOG_ENV: &str = "CAPTAIN_LOG";

#[derive(Copy, Clone, Debug, Args)]
#[must_use]
pub(crate) struct OutputOpts {
    /// Verbose output
    #[arg(long, short, global = true, env = "CAPTAIN_VERBOSE")]
    pub(crate) verbose: bool,

    /// Produce color output: auto, always, never
    #[arg(
        long,
        value_enum,
        default_value_t,
        hide_possible_values = true,
        global = true,
        value_name = "WHEN",
        env = "CAPTAIN_COLOR"
    )]
    pub(crate) color: Color,
}

impl OutputOpts {
    /// Installs the logger and returns the resulting output settings.
    pub(crate) fn init(self) -> OutputContext {
        init_logger(self.verbose, self.color.colorize_stderr());
        OutputContext {
            verbose: self.verbose,
            color: self.color,
        }
    }
}

/// Output settings for a captain invocation.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub struct OutputContext {
    pub(crate) verbose: bool,
    pub(crate) color: Color,
}

impl OutputContext {
    /// Returns the styles for messages written to stderr.
    pub fn stderr_styles(&self) -> StderrStyles {
        if self.color.colorize_stderr() {
            StderrStyles {
                bold: style().bold(),
                warning: style().yellow(),
            }
        } else {
            StderrStyles::default()
        }
    }
}

/// When to produce color output.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
#[must_use]
pub enum Color {
    #[default]
    Auto,
    Always,
    Never,
}

impl Color {
    fn colorize_stderr(self) -> bool {
        match self {
            Color::Auto => supports_color::on_cached(supports_color::Stream::Stderr).is_some(),
            Color::Always => true,
            Color::Never => false,
        }
    }
}

/// Styles for messages captain prints to stderr itself.
#[derive(Debug, Default)]
pub struct StderrStyles {
    pub(crate) bold: Style,
    pub(crate) warning: Style,
}

static INIT_LOGGER: Once = Once::new();

fn init_logger(verbose: bool, colorize: bool) {
    INIT_LOGGER.call_once(|| {
        let default_level = if verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let value = std::env::var_os(LOG_ENV).map(|value| value.to_string_lossy().into_owned());
        let (targets, invalid) = match parse_targets(value.as_deref(), default_level) {
            Ok(targets) => (targets, None),
            Err(message) => (Targets::new().with_default(default_level), Some(message)),
        };

        let layer = tracing_subscriber::fmt::layer()
            .event_format(HeadingFormatter { colorize })
            .with_writer(std::io::stderr)
            .with_filter(targets);
        tracing_subscriber::registry().with(layer).init();

        if let Some(message) = invalid {
            tracing::warn!("{message}, using the default filter");
        }
    });
}

/// Parses the value of `CAPTAIN_LOG`. An empty or absent value uses `default_level` for
/// everything.
fn parse_targets(value: Option<&str>, default_level: LevelFilter) -> Result<Targets, String> {
    match value {
        None | Some("") => Ok(Targets::new().with_default(default_level)),
        Some(value) => value
            .parse()
            .map_err(|err| format!("invalid {LOG_ENV} value `{value}`: {err}")),
    }
}

/// Prints each event as `<level>: <message>`.
struct HeadingFormatter {
    colorize: bool,
}

fn level_heading(level: Level) -> (&'static str, Style) {
    match level {
        Level::ERROR => ("error", style().red().bold()),
        Level::WARN => ("warning", style().yellow().bold()),
        Level::INFO => ("info", style().bold()),
        Level::DEBUG => ("debug", style().bold()),
        Level::TRACE => ("trace", style().dimmed()),
    }
}

impl<S, N> FormatEvent<S, N> for HeadingFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        if metadata.target() != NO_HEADING_TARGET {
            let (heading, heading_style) = level_heading(*metadata.level());
            if self.colorize {
                write!(writer, "{}: ", heading.style(heading_style))?;
            } else {
                write!(writer, "{heading}: ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Where stdout output goes. Tests capture it instead.
#[derive(Default)]
pub enum OutputWriter {
    /// Write to the process's stdout.
    #[default]
    Normal,
    /// Capture output.
    #[cfg(test)]
    Test {
        /// Captured stdout.
        stdout: Vec<u8>,
    },
}

impl OutputWriter {
    pub(crate) fn stdout_writer(&mut self) -> Box<dyn Write + '_> {
        match self {
            Self::Normal => Box::new(BufWriter::new(std::io::stdout())),
            #[cfg(test)]
            Self::Test { stdout } => Box::new(stdout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_targets_default() {
        let targets = parse_targets(None, LevelFilter::INFO).unwrap();
        assert!(targets.would_enable("captain_runner::retry", &Level::INFO));
        assert!(!targets.would_enable("captain_runner::retry", &Level::DEBUG));

        let targets = parse_targets(Some(""), LevelFilter::DEBUG).unwrap();
        assert!(targets.would_enable("captain_runner::partition", &Level::DEBUG));
    }

    #[test]
    fn parse_targets_from_env_value() {
        let targets = parse_targets(Some("captain_runner::partition=trace"), LevelFilter::INFO)
            .unwrap();
        assert!(targets.would_enable("captain_runner::partition", &Level::TRACE));
        assert!(!targets.would_enable("captain_runner::retry", &Level::INFO));
    }

    #[test]
    fn parse_targets_invalid() {
        let message = parse_targets(Some("captain=loud"), LevelFilter::INFO).unwrap_err();
        assert!(message.starts_with("invalid CAPTAIN_LOG value `captain=loud`"));
    }

    #[test]
    fn stderr_styles_follow_color() {
        let never = OutputContext {
            verbose: false,
            color: Color::Never,
        };
        assert_eq!(format!("{}", "x".style(never.stderr_styles().bold)), "x");

        let always = OutputContext {
            verbose: false,
            color: Color::Always,
        };
        assert_ne!(format!("{}", "x".style(always.stderr_styles().bold)), "x");
    }
}

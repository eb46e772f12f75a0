//! CLI config for logging.

use thiserror::Error;
use tracing_subscriber::{EnvFilter, filter::ParseError, fmt::writer::BoxMakeWriter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] ParseError),

    #[error("failed to install the global subscriber: {0}")]
    Install(Box<dyn std::error::Error + Send + Sync>),
}

/// Where log lines are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogDestination {
    #[default]
    Stdout,
    Stderr,
}

/// Format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, single line.
    #[default]
    Full,
    /// Human-readable, multi line.
    Pretty,
    /// One JSON object per line.
    Json,
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,rowbatch_write::bucket=info` specifies debug logging for all modules
    /// except for the bucket workers, which only log at info level.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter.
    /// Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug'
    ///
    /// -vvv 'trace'
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub log_verbose_count: u8,

    /// Logs: destination
    #[clap(
        long = "log-destination",
        env = "LOG_DESTINATION",
        default_value_t = LogDestination::default(),
        value_enum,
        action
    )]
    pub log_destination: LogDestination,

    /// Logs: message format
    #[clap(
        long = "log-format",
        env = "LOG_FORMAT",
        default_value_t = LogFormat::default(),
        value_enum,
        action
    )]
    pub log_format: LogFormat,
}

impl LoggingConfig {
    /// The filter directive in effect, falling back to `default_filter` when neither
    /// `--log-filter` nor `-v` is given.
    pub fn filter_directive<'a>(&'a self, default_filter: &'a str) -> &'a str {
        match self.log_verbose_count {
            0 => self.log_filter.as_deref().unwrap_or(default_filter),
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    pub fn env_filter(&self, default_filter: &str) -> Result<EnvFilter, LoggingError> {
        Ok(EnvFilter::try_new(self.filter_directive(default_filter))?)
    }

    /// Install a global `fmt` subscriber configured by these options.
    pub fn install_global_subscriber(&self, default_filter: &str) -> Result<(), LoggingError> {
        let writer = match self.log_destination {
            LogDestination::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogDestination::Stderr => BoxMakeWriter::new(std::io::stderr),
        };
        let builder = tracing_subscriber::fmt()
            .with_env_filter(self.env_filter(default_filter)?)
            .with_writer(writer);

        match self.log_format {
            LogFormat::Full => builder.try_init(),
            LogFormat::Pretty => builder.pretty().try_init(),
            LogFormat::Json => builder.json().try_init(),
        }
        .map_err(LoggingError::Install)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tracing_subscriber::filter::LevelFilter;

    use super::*;

    fn parse(args: &[&str]) -> LoggingConfig {
        LoggingConfig::try_parse_from(std::iter::once("rowbatch").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_filter_precedence() {
        assert_eq!(parse(&[]).filter_directive("warn"), "warn");
        assert_eq!(
            parse(&["--log-filter", "rowbatch_write=debug"]).filter_directive("warn"),
            "rowbatch_write=debug"
        );
        assert_eq!(
            parse(&["--log-filter", "error", "-vv"]).filter_directive("warn"),
            "debug"
        );
        assert_eq!(parse(&["-v"]).filter_directive("warn"), "info");
        assert_eq!(parse(&["-vvvv"]).filter_directive("warn"), "trace");
    }

    #[test]
    fn test_format_and_destination() {
        let config = parse(&["--log-format", "json", "--log-destination", "stderr"]);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_destination, LogDestination::Stderr);

        assert!(LoggingConfig::try_parse_from(["rowbatch", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn test_env_filter() {
        let filter = parse(&["--log-filter", "info,rowbatch_write=trace"])
            .env_filter("warn")
            .unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }
}

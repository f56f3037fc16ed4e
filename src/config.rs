//! CLI surface and environment-driven configuration.
//!
//! Flags are parsed with `onlyargs`/`onlyargs_derive` (the teacher's choice
//! over `clap`); environment variables are read directly the way the teacher
//! reads `TERM_COLOR`/`BITCOIN_NETWORK` in `main.rs`.

use std::path::PathBuf;

use onlyargs_derive::OnlyArgs;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Json,
    Text,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unrecognized --output-format {0:?}, expected csv, json, or text")]
    UnknownOutputFormat(String),

    #[error("--from-year ({from}) is after --to-year ({to})")]
    InvertedYearRange { from: i32, to: i32 },

    #[error("no input source given: pass --input-ledger or --input-trades")]
    NoInputs,
}

impl OutputFormat {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(ConfigError::UnknownOutputFormat(other.to_owned())),
        }
    }
}

#[derive(Debug, OnlyArgs)]
#[footer = "Additional environment variables:"]
#[footer = "  - TAX_YEAR overrides --tax-year"]
#[footer = "  - OUTPUT_FORMAT overrides --output-format (csv|json|text)"]
#[footer = "  - RUST_LOG sets the tracing log level, e.g. RUST_LOG=debug"]
#[footer = "  - TERM_COLOR accepts \"always\" to override automatic terminal sensing"]
pub struct Args {
    /// Read a Kraken-style ledger CSV export from a file.
    #[long]
    pub input_ledger: Vec<PathBuf>,

    /// Read a Kraken-style trades CSV export from a file.
    #[long]
    pub input_trades: Vec<PathBuf>,

    /// Restrict the run to a single tax year (mutually informative with
    /// --from-year/--to-year; if given alone it sets both bounds).
    #[long]
    pub tax_year: Option<i32>,

    /// Earliest tax year to include.
    #[long]
    pub from_year: Option<i32>,

    /// Latest tax year to include.
    #[long]
    pub to_year: Option<i32>,

    /// Output format: csv, json, or text.
    #[long]
    #[default("text")]
    pub output_format: String,

    /// Directory to write the report to; if unset, the report is printed to
    /// stdout.
    #[long]
    pub output_dir: Option<PathBuf>,

    /// Path to a RON-encoded price oracle day-bucket cache file.
    #[long]
    pub price_cache: Option<PathBuf>,
}

/// Resolved, validated configuration derived from [`Args`] plus environment
/// variables. This is the struct the rest of the binary actually consumes.
pub struct Config {
    pub input_ledgers: Vec<PathBuf>,
    pub input_trades: Vec<PathBuf>,
    pub from_year: i32,
    pub to_year: i32,
    pub output_format: OutputFormat,
    pub output_dir: Option<PathBuf>,
    pub price_cache: Option<PathBuf>,
}

impl Config {
    pub fn resolve(args: Args) -> Result<Self, ConfigError> {
        if args.input_ledger.is_empty() && args.input_trades.is_empty() {
            return Err(ConfigError::NoInputs);
        }

        let (from_year, to_year) = match (args.tax_year, args.from_year, args.to_year) {
            (Some(year), _, _) => (year, year),
            (None, Some(from), Some(to)) => (from, to),
            (None, Some(from), None) => (from, from),
            (None, None, Some(to)) => (to, to),
            (None, None, None) => {
                let current = current_year();
                (current - 10, current)
            }
        };

        if from_year > to_year {
            return Err(ConfigError::InvertedYearRange {
                from: from_year,
                to: to_year,
            });
        }

        let output_format = match std::env::var("OUTPUT_FORMAT") {
            Ok(raw) => OutputFormat::parse(&raw)?,
            Err(_) => OutputFormat::parse(&args.output_format)?,
        };

        Ok(Self {
            input_ledgers: args.input_ledger,
            input_trades: args.input_trades,
            from_year,
            to_year,
            output_format,
            output_dir: args.output_dir,
            price_cache: args.price_cache,
        })
    }

    /// Inclusive Unix-second bounds for the configured tax year range.
    pub fn time_range(&self) -> (i64, i64) {
        (year_start(self.from_year), year_end(self.to_year))
    }
}

fn current_year() -> i32 {
    use chrono::{Datelike, Utc};
    Utc::now().year()
}

fn year_start(year: i32) -> i64 {
    use chrono::{NaiveDate, TimeZone, Utc};
    Utc.from_utc_datetime(&NaiveDate::from_ymd_opt(year, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap())
        .timestamp()
}

fn year_end(year: i32) -> i64 {
    use chrono::{NaiveDate, TimeZone, Utc};
    Utc.from_utc_datetime(
        &NaiveDate::from_ymd_opt(year, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 59)
            .unwrap(),
    )
    .timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            input_ledger: vec![PathBuf::from("ledger.csv")],
            input_trades: vec![],
            tax_year: None,
            from_year: None,
            to_year: None,
            output_format: "text".to_owned(),
            output_dir: None,
            price_cache: None,
        }
    }

    #[test]
    fn tax_year_sets_both_bounds() {
        let mut args = base_args();
        args.tax_year = Some(2023);
        let config = Config::resolve(args).unwrap();
        assert_eq!(config.from_year, 2023);
        assert_eq!(config.to_year, 2023);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut args = base_args();
        args.from_year = Some(2024);
        args.to_year = Some(2023);
        assert!(matches!(
            Config::resolve(args),
            Err(ConfigError::InvertedYearRange { .. })
        ));
    }

    #[test]
    fn no_inputs_is_rejected() {
        let mut args = base_args();
        args.input_ledger.clear();
        assert!(matches!(Config::resolve(args), Err(ConfigError::NoInputs)));
    }

    #[test]
    fn unknown_output_format_is_rejected() {
        let mut args = base_args();
        args.output_format = "xml".to_owned();
        assert!(matches!(
            Config::resolve(args),
            Err(ConfigError::UnknownOutputFormat(_))
        ));
    }
}

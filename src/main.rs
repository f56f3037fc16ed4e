#![forbid(unsafe_code)]

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use directories::ProjectDirs;
use error_iter::ErrorIter as _;
use is_terminal::IsTerminal as _;
use steuerklar::aggregator::Aggregator;
use steuerklar::config::{Config, OutputFormat};
use steuerklar::engine::Engine;
use steuerklar::errors::Error;
use steuerklar::event_source::{CsvLedgerEventSource, CsvTradeEventSource, EventSource, EventSourceError, RawEvent};
use steuerklar::oracle::PriceOracle;
use steuerklar::reporter::{CsvReporter, JsonReporter, ReportInput, Reporter, TextReporter};
use tracing::debug;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

fn main() -> ExitCode {
    // Uses the `RUST_LOG` environment var for configuration, e.g.
    // `RUST_LOG=debug cargo run`. Useful for seeing which input row produced a
    // given diagnostic.
    //
    // See: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/struct.EnvFilter.html#directives
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let term_color = env::var("TERM_COLOR")
        .map(|color| color == "always")
        .unwrap_or_else(|_| std::io::stdout().is_terminal());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(term_color))
        .with(env_filter)
        .init();

    match run(onlyargs::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            for source in err.sources().skip(1) {
                eprintln!("  Caused by: {source}");
            }

            match err {
                Error::Cli(_) | Error::Config(_) => ExitCode::from(1),
                _ => ExitCode::from(2),
            }
        }
    }
}

/// Merges raw events from every configured ledger/trade CSV file into one
/// time-ordered stream. Each underlying [`EventSource`] is queried for the
/// full configured range in parallel; rows are concatenated rather than
/// interleaved since the engine itself sorts by `(ts, ref_id)` before
/// processing.
struct CombinedEventSource {
    sources: Vec<Box<dyn EventSource + Send + Sync>>,
}

impl EventSource for CombinedEventSource {
    fn fetch(&self, start_ts: i64, end_ts: i64) -> Result<Vec<RawEvent>, EventSourceError> {
        use rayon::prelude::*;

        let fetched: Result<Vec<Vec<RawEvent>>, EventSourceError> = self
            .sources
            .par_iter()
            .map(|source| source.fetch(start_ts, end_ts))
            .collect();

        Ok(fetched?.into_iter().flatten().collect())
    }
}

fn run(args: Result<steuerklar::config::Args, onlyargs::CliError>) -> Result<ExitCode, Error> {
    let args = args?;
    let config = Config::resolve(args)?;

    let project_dir = ProjectDirs::from("design.steuerklar", "steuerklar", "steuerklar");
    if let Some(project_dir) = &project_dir {
        std::fs::create_dir_all(project_dir.cache_dir())?;
    }

    let mut sources: Vec<Box<dyn EventSource + Send + Sync>> = Vec::new();
    for path in &config.input_ledgers {
        sources.push(Box::new(CsvLedgerEventSource::new(path)));
    }
    for path in &config.input_trades {
        sources.push(Box::new(CsvTradeEventSource::new(path)));
    }
    let event_source = CombinedEventSource { sources };

    let now_fn: Arc<dyn Fn() -> i64 + Send + Sync> = Arc::new(|| chrono::Utc::now().timestamp());

    let providers: Vec<Box<dyn steuerklar::oracle::PriceProvider + Send + Sync>> = Vec::new();
    let oracle = match &config.price_cache {
        Some(path) if path.exists() => PriceOracle::load(providers, Arc::clone(&now_fn), path)?,
        _ => PriceOracle::new(providers, Arc::clone(&now_fn)),
    };

    let engine = Engine::new(&oracle, Arc::clone(&now_fn));
    let (start_ts, end_ts) = config.time_range();

    debug!(start_ts, end_ts, "running engine");
    let output = engine.run(&event_source, start_ts, end_ts)?;

    if let Some(path) = &config.price_cache {
        let _ = oracle.save(path);
    }

    let summaries = Aggregator::aggregate(&output.disposal_records, &output.reward_income);
    let diagnostics: Vec<_> = output.diagnostics.sorted().into_iter().cloned().collect();
    let has_errors = output.diagnostics.has_errors();

    let report_input = ReportInput {
        disposals: &output.disposal_records,
        summaries: &summaries,
        diagnostics: &diagnostics,
    };

    let reporter: Box<dyn Reporter> = match config.output_format {
        OutputFormat::Csv => Box::new(CsvReporter),
        OutputFormat::Json => Box::new(JsonReporter),
        OutputFormat::Text => Box::new(TextReporter),
    };
    let rendered = reporter.render(&report_input)?;

    match &config.output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let extension = match config.output_format {
                OutputFormat::Csv => "csv",
                OutputFormat::Json => "json",
                OutputFormat::Text => "txt",
            };
            let path = dir.join(format!("steuerklar-report.{extension}"));
            std::fs::write(&path, &rendered)?;
            println!("Report written to {}", path.display());
        }
        None => println!("{rendered}"),
    }

    Ok(ExitCode::from(if has_errors { 2 } else { 0 }))
}

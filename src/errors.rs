//! Crate-level `Error` aggregating every module's `thiserror` enum.
//!
//! Mirrors the teacher's `main.rs` top-level `Error` enum: each module scopes
//! its own error type (`MoneyError`, `PriceError`, `LotBookError`,
//! `EventSourceError`, `EngineError`, `ReportError`, `ConfigError`), and this
//! enum aggregates them with `#[from]` so `main` can print one causal chain
//! via `error_iter::ErrorIter::sources()`.

use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::event_source::EventSourceError;
use crate::money::MoneyError;
use crate::oracle::{OracleLoadError, PriceError};
use crate::reporter::ReportError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("argument parsing error")]
    Cli(#[from] onlyargs::CliError),

    #[error("configuration error")]
    Config(#[from] ConfigError),

    #[error("failed to read events")]
    EventSource(#[from] EventSourceError),

    #[error("price oracle error")]
    Price(#[from] PriceError),

    #[error("failed to load price oracle data")]
    OracleLoad(#[from] OracleLoadError),

    #[error("engine error")]
    Engine(#[from] EngineError),

    #[error("monetary arithmetic error")]
    Money(#[from] MoneyError),

    #[error("failed to render report")]
    Report(#[from] ReportError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

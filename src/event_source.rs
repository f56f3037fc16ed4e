//! Raw event ingestion boundary.
//!
//! `EventSource` is the abstract collaborator the engine pulls from; this crate
//! does not implement exchange connectivity (HTTP signing, pagination, retry).
//! What it does implement is a concrete CSV-file adapter reading Kraken-style
//! ledger/trade exports, grounded on `imports/kraken.rs`'s row shapes in the
//! teacher repository, so the engine is runnable end to end against real export
//! files without any network dependency.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

/// A loosely-typed raw event record: exchange-specific string keys to string
/// values. The `Normalizer` is the sole place these get parsed into typed values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawEvent {
    fields: BTreeMap<String, String>,
}

impl RawEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, EventSourceError> {
        self.get(key)
            .ok_or_else(|| EventSourceError::MissingField(key.to_owned()))
    }
}

#[derive(Debug, Error)]
pub enum EventSourceError {
    #[error("required field {0:?} missing from raw event")]
    MissingField(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse CSV row in {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// Yields normalized raw events in a caller-specified time range. Implementations
/// may ignore the range and filter after the fact; `start_ts`/`end_ts` are
/// inclusive Unix-second bounds.
pub trait EventSource {
    fn fetch(&self, start_ts: i64, end_ts: i64) -> Result<Vec<RawEvent>, EventSourceError>;
}

/// Reads a Kraken-style ledgers CSV export (columns: `refid`, `time`, `type`,
/// `subtype`, `aclass`, `asset`, `amount`, `fee`, `balance`) as raw events.
pub struct CsvLedgerEventSource {
    path: std::path::PathBuf,
}

impl CsvLedgerEventSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
        }
    }
}

impl EventSource for CsvLedgerEventSource {
    fn fetch(&self, start_ts: i64, end_ts: i64) -> Result<Vec<RawEvent>, EventSourceError> {
        let path_str = self.path.display().to_string();

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)
            .map_err(|source| EventSourceError::Csv {
                path: path_str.clone(),
                source,
            })?;

        let headers = reader
            .headers()
            .map_err(|source| EventSourceError::Csv {
                path: path_str.clone(),
                source,
            })?
            .clone();

        let mut events = Vec::new();

        for result in reader.records() {
            let record = result.map_err(|source| EventSourceError::Csv {
                path: path_str.clone(),
                source,
            })?;

            let mut event = RawEvent::new();
            for (header, value) in headers.iter().zip(record.iter()) {
                event = event.with_field(header, value);
            }

            if let Some(ts) = event.get("time").and_then(|t| t.parse::<f64>().ok()) {
                let ts = ts as i64;
                if ts < start_ts || ts > end_ts {
                    continue;
                }
            }

            events.push(event);
        }

        debug!(path = %path_str, count = events.len(), "read ledger CSV export");

        Ok(events)
    }
}

/// Reads a Kraken-style trades CSV export (columns: `ordertxid`, `pair`, `time`,
/// `type`, `ordertype`, `price`, `cost`, `fee`, `vol`, `margin`, `misc`).
pub struct CsvTradeEventSource {
    path: std::path::PathBuf,
}

impl CsvTradeEventSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
        }
    }
}

impl EventSource for CsvTradeEventSource {
    fn fetch(&self, start_ts: i64, end_ts: i64) -> Result<Vec<RawEvent>, EventSourceError> {
        let path_str = self.path.display().to_string();

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)
            .map_err(|source| EventSourceError::Csv {
                path: path_str.clone(),
                source,
            })?;

        let headers = reader
            .headers()
            .map_err(|source| EventSourceError::Csv {
                path: path_str.clone(),
                source,
            })?
            .clone();

        let mut events = Vec::new();

        for result in reader.records() {
            let record = result.map_err(|source| EventSourceError::Csv {
                path: path_str.clone(),
                source,
            })?;

            let mut event = RawEvent::new();
            for (header, value) in headers.iter().zip(record.iter()) {
                event = event.with_field(header, value);
            }

            if let Some(ts) = event.get("time").and_then(|t| t.parse::<f64>().ok()) {
                let ts = ts as i64;
                if ts < start_ts || ts > end_ts {
                    continue;
                }
            }

            events.push(event);
        }

        debug!(path = %path_str, count = events.len(), "read trades CSV export");

        Ok(events)
    }
}

/// An in-memory `EventSource` for tests: events are supplied directly rather
/// than parsed from a file. Mirrors the teacher's pattern of instantiating
/// fresh, process-independent state for unit tests (see `util::year_ext`'s
/// blanket `FIFO` tests).
#[derive(Default)]
pub struct InMemoryEventSource {
    events: Vec<RawEvent>,
}

impl InMemoryEventSource {
    pub fn new(events: Vec<RawEvent>) -> Self {
        Self { events }
    }
}

impl EventSource for InMemoryEventSource {
    fn fetch(&self, start_ts: i64, end_ts: i64) -> Result<Vec<RawEvent>, EventSourceError> {
        Ok(self
            .events
            .iter()
            .filter(|event| {
                event
                    .get("time")
                    .and_then(|t| t.parse::<f64>().ok())
                    .map(|ts| (start_ts as f64..=end_ts as f64).contains(&ts))
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}

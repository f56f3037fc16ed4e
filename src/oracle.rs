//! Historical EUR pricing with a day-bucketed cache in front of an ordered
//! provider chain.
//!
//! This module implements the cache and the provider *contract*; it does not
//! implement a live market-data HTTP client (see SPEC_FULL.md §10). The
//! in-process memoization layer reuses [`fett::Fett`], the teacher's concurrent
//! memoizing map, exactly as it memoizes blockchain client responses in
//! `client/esplora.rs`. Persistence of computed prices to disk is grounded on
//! `model/exchange_rate.rs`'s `ExchangeRates` RON-file format.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use fett::Fett;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::asset::AssetId;
use crate::money::Money;

pub const SECONDS_PER_DAY: i64 = 86_400;
pub const DEFAULT_CACHE_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PriceError {
    #[error("no provider returned a price for {asset} at {ts}")]
    NotFound { asset: String, ts: i64 },

    #[error("provider {provider} timed out querying {asset} at {ts}")]
    Timeout {
        provider: String,
        asset: String,
        ts: i64,
    },
}

/// A single, ordered price source. Implementations declare a temporal support
/// window; the oracle consults a provider only when the requested timestamp
/// falls inside it.
pub trait PriceProvider {
    fn name(&self) -> &str;

    /// `true` if this provider is willing to answer for `ts`.
    fn supports(&self, ts: i64) -> bool;

    /// Returns `None` on a miss (unknown asset, out of range, etc). This trait
    /// does not model network timeouts directly; an HTTP-backed implementation
    /// should catch its own timeout and return `None`, letting the oracle
    /// report `PriceError::NotFound` (per §5, the engine treats timeouts as
    /// `NotFound` uniformly).
    fn price_eur(&self, asset: &AssetId, ts: i64) -> Option<Money>;
}

/// A provider backed by a fixed day-bucketed table, loaded once at
/// construction. Used both as a historical-price file adapter and in tests.
pub struct TableProvider {
    name: String,
    table: BTreeMap<(AssetId, i64), Money>,
    window: Option<(i64, i64)>,
}

impl TableProvider {
    pub fn new(name: impl Into<String>, table: BTreeMap<(AssetId, i64), Money>) -> Self {
        Self {
            name: name.into(),
            table,
            window: None,
        }
    }

    pub fn with_window(mut self, start_ts: i64, end_ts: i64) -> Self {
        self.window = Some((start_ts, end_ts));
        self
    }

    /// Loads a RON-encoded day-bucket table, the same persistence format the
    /// teacher's `ExchangeRates::load` reads for `*-btcusd.ron` files.
    pub fn load_ron(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, OracleLoadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| OracleLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let entries: Vec<PriceTableEntry> =
            ron::from_str(&contents).map_err(|source| OracleLoadError::Ron {
                path: path.display().to_string(),
                source,
            })?;

        let table = entries
            .into_iter()
            .map(|entry| ((entry.asset, entry.day_bucket), entry.eur_price))
            .collect();

        Ok(Self::new(name, table))
    }
}

impl PriceProvider for TableProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, ts: i64) -> bool {
        match self.window {
            Some((start, end)) => (start..=end).contains(&ts),
            None => true,
        }
    }

    fn price_eur(&self, asset: &AssetId, ts: i64) -> Option<Money> {
        let bucket = day_bucket(ts);
        self.table.get(&(asset.clone(), bucket)).copied()
    }
}

/// A provider returning one fixed price for one asset regardless of time.
/// Useful for stablecoin 1:1 fallbacks in tests (see Open Question 2 in
/// SPEC_FULL.md: production use prefers [`TableProvider`]'s market price).
pub struct StaticProvider {
    name: String,
    asset: AssetId,
    price: Money,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>, asset: AssetId, price: Money) -> Self {
        Self {
            name: name.into(),
            asset,
            price,
        }
    }
}

impl PriceProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, _ts: i64) -> bool {
        true
    }

    fn price_eur(&self, asset: &AssetId, _ts: i64) -> Option<Money> {
        (*asset == self.asset).then_some(self.price)
    }
}

#[derive(Debug, Error)]
pub enum OracleLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse RON cache {path}: {source}")]
    Ron {
        path: String,
        #[source]
        source: ron::de::SpannedError,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PriceTableEntry {
    asset: AssetId,
    day_bucket: i64,
    eur_price: Money,
}

/// A day-bucket cache entry as persisted to disk: `{asset, day_bucket,
/// eur_price, fetched_at}`, per SPEC_FULL.md §6.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub asset: AssetId,
    pub day_bucket: i64,
    pub eur_price: Option<Money>,
    pub fetched_at: i64,
}

type CacheKey = (AssetId, i64);
type CreateFn = Box<dyn Fn(&CacheKey) -> Option<Money> + Send + Sync>;

/// Composes an ordered provider chain behind a day-bucketed cache.
///
/// The in-process memoization is [`fett::Fett`] — a single value-constructor
/// closure over `(asset, day_bucket)` that walks the provider chain on a miss.
/// A separate append-only log records every computed entry (hit or miss) so it
/// can be persisted; `Fett`'s "insert-once" design has no API for snapshotting
/// without consuming it, so the log is kept alongside rather than read back out
/// of the `Fett` itself (see DESIGN.md).
pub struct PriceOracle {
    cache: Fett<CacheKey, Option<Money>, CreateFn>,
    log: Arc<Mutex<Vec<CacheEntry>>>,
    now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl PriceOracle {
    pub fn new(providers: Vec<Box<dyn PriceProvider + Send + Sync>>, now_fn: Arc<dyn Fn() -> i64 + Send + Sync>) -> Self {
        let providers = Arc::new(providers);
        let log: Arc<Mutex<Vec<CacheEntry>>> = Arc::new(Mutex::new(Vec::new()));

        let create = make_create_fn(Arc::clone(&providers), Arc::clone(&log), Arc::clone(&now_fn));

        Self {
            cache: Fett::new(create),
            log,
            now_fn,
        }
    }

    /// Preloads the cache from a persisted RON log (see [`CacheEntry`]),
    /// falling back to the provider chain for anything not present.
    pub fn load(
        providers: Vec<Box<dyn PriceProvider + Send + Sync>>,
        now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
        path: impl AsRef<Path>,
    ) -> Result<Self, OracleLoadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| OracleLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let entries: Vec<CacheEntry> = ron::from_str(&contents).map_err(|source| OracleLoadError::Ron {
            path: path.display().to_string(),
            source,
        })?;

        let providers = Arc::new(providers);
        let log: Arc<Mutex<Vec<CacheEntry>>> = Arc::new(Mutex::new(entries.clone()));
        let create = make_create_fn(Arc::clone(&providers), Arc::clone(&log), Arc::clone(&now_fn));

        let pairs: Vec<(CacheKey, Option<Money>)> = entries
            .into_iter()
            .map(|entry| ((entry.asset, entry.day_bucket), entry.eur_price))
            .collect();

        debug!(path = %path.display(), count = pairs.len(), "preloaded price oracle cache");

        Ok(Self {
            cache: Fett::from((create, pairs)),
            log,
            now_fn,
        })
    }

    /// Persists every entry computed so far (hits and misses alike) to a RON
    /// file at `path`, in the `{asset, day_bucket, eur_price, fetched_at}`
    /// shape described in SPEC_FULL.md §6.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), OracleLoadError> {
        let path = path.as_ref();
        let snapshot = self.log.lock().clone();

        let serialized = ron::ser::to_string_pretty(&snapshot, ron::ser::PrettyConfig::default())
            .expect("CacheEntry serialization cannot fail");

        std::fs::write(path, serialized).map_err(|source| OracleLoadError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Returns the EUR value of one unit of `asset` at `ts`.
    pub fn price_eur(&self, asset: &AssetId, ts: i64) -> Result<Money, PriceError> {
        if asset.canonical() == "EUR" {
            return Ok(Money::one());
        }

        let bucket = day_bucket(ts);
        let key = (asset.clone(), bucket);

        // Today's bucket has a TTL; past-day buckets are treated as immutable
        // history and never refreshed (per SPEC_FULL.md §4.3).
        if bucket == day_bucket((self.now_fn)()) {
            self.maybe_refresh_stale(&key);
        }

        match self.cache.get(key) {
            Some(price) => Ok(price),
            None => Err(PriceError::NotFound {
                asset: asset.canonical().to_owned(),
                ts,
            }),
        }
    }

    fn maybe_refresh_stale(&self, key: &CacheKey) {
        let now = (self.now_fn)();
        let is_stale = self
            .log
            .lock()
            .iter()
            .rev()
            .find(|entry| &entry.asset == &key.0 && entry.day_bucket == key.1)
            .map(|entry| now - entry.fetched_at > DEFAULT_CACHE_TTL_SECS)
            .unwrap_or(false);

        if is_stale {
            warn!(asset = %key.0, day_bucket = key.1, "today's cached price is stale, refreshing");
            self.cache.remove(key);
        }
    }
}

fn make_create_fn(
    providers: Arc<Vec<Box<dyn PriceProvider + Send + Sync>>>,
    log: Arc<Mutex<Vec<CacheEntry>>>,
    now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
) -> CreateFn {
    Box::new(move |(asset, bucket): &CacheKey| {
        let ts = *bucket * SECONDS_PER_DAY;

        let price = providers
            .iter()
            .filter(|provider| provider.supports(ts))
            .find_map(|provider| {
                let price = provider.price_eur(asset, ts);
                if price.is_some() {
                    debug!(provider = provider.name(), %asset, ts, "price resolved");
                }
                price
            });

        log.lock().push(CacheEntry {
            asset: asset.clone(),
            day_bucket: *bucket,
            eur_price: price,
            fetched_at: (now_fn)(),
        });

        price
    })
}

pub fn day_bucket(ts: i64) -> i64 {
    ts.div_euclid(SECONDS_PER_DAY)
}

//! Orchestrates time-ordered processing of normalized transactions against
//! the [`LotBook`], producing one [`DisposalRecord`] per disposal.
//!
//! Grounded on `imports/kraken.rs::read_ledgers`, which sorts parsed rows into
//! a `BTreeMap<NaiveDateTime, Vec<LedgerRow>>` before flattening into
//! processing order; this generalizes that to a `(ts, ref_id)` composite key
//! stable sort over a `Vec<Transaction>`, and on `model/events.rs`'s
//! long/short holding-period split -- except the comparison here is strictly
//! day-based (`(ts - acquired_at) / 86400 > 365`) per §23 EStG, not the
//! teacher's `Months::new(12)` calendar shortcut (US-rules-specific).

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::asset::AssetId;
use crate::constants::{HOLDING_PERIOD_DAYS, RECOVERY_EPOCH_TS};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::event_source::{EventSource, EventSourceError};
use crate::lotbook::{HoldingLot, LotBook, LotBookError, MatchedLot as BookMatchedLot};
use crate::money::Money;
use crate::normalizer::{Normalizer, RewardSubtype, Transaction, TxKind};
use crate::oracle::{PriceError, PriceOracle};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to fetch events: {0}")]
    EventSource(#[from] EventSourceError),
}

/// One matched piece of a [`DisposalRecord`], carrying the holding period
/// computed against this disposal's timestamp (the underlying
/// [`crate::lotbook::HoldingLot`] has no notion of "disposed as of when").
#[derive(Clone, Debug, Serialize)]
pub struct MatchedLot {
    pub lot_ref: String,
    pub acquired_at: i64,
    pub units_consumed: Money,
    pub unit_cost_eur: Money,
    pub cost_basis_eur: Money,
    pub holding_days: i64,
}

impl MatchedLot {
    fn from_book(book: BookMatchedLot, disposal_ts: i64) -> Self {
        let holding_days = (disposal_ts - book.acquired_at).div_euclid(86_400);

        Self {
            lot_ref: book.acquisition_ref_id,
            acquired_at: book.acquired_at,
            units_consumed: book.quantity,
            unit_cost_eur: book.unit_cost_eur,
            cost_basis_eur: book.cost_basis_eur,
            holding_days,
        }
    }
}

/// A fully valued, classified disposal: the engine's principal output.
#[derive(Clone, Debug, Serialize)]
pub struct DisposalRecord {
    pub ref_id: String,
    pub ts: i64,
    pub asset: AssetId,
    pub units_disposed: Money,
    pub unit_sale_price_eur: Money,
    pub gross_proceeds_eur: Money,
    pub fee_eur: Money,
    pub total_cost_basis_eur: Money,
    pub net_gain_loss_eur: Money,
    pub matched_lots: Vec<MatchedLot>,
    pub weighted_avg_holding_days: i64,
    pub fully_long_term: bool,
    pub partially_short_term: bool,
    pub tax_year: i32,
    /// `false` for a `Withdrawal`: an inventory reduction with no proof of a
    /// change in beneficial ownership realizes neither a gain nor a
    /// deductible loss (`original_source` classifies `WITHDRAWAL` as
    /// `NON_TAXABLE`). The [`crate::aggregator::Aggregator`] excludes
    /// non-taxable records from every gain/loss bucket.
    pub taxable: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// EUR value of a `Reward` acquisition, handed to the [`crate::aggregator::Aggregator`]
/// as other-income for its tax year. Not a disposal: rewards never leave the
/// book, they only enter it at a cost basis that also happens to be taxable
/// income on receipt.
#[derive(Clone, Debug, Serialize)]
pub struct RewardIncome {
    pub ref_id: String,
    pub ts: i64,
    pub tax_year: i32,
    pub asset: AssetId,
    pub eur_value: Money,
}

/// Everything the [`Engine`] produced from one run, handed to the
/// [`crate::aggregator::Aggregator`] and [`crate::reporter`] writers.
pub struct EngineOutput {
    pub disposal_records: Vec<DisposalRecord>,
    pub reward_income: Vec<RewardIncome>,
    pub diagnostics: Diagnostics,
    pub lot_book: LotBook,
}

/// Drives ingestion, normalization, FIFO matching, and disposal valuation.
///
/// Single-threaded and purely sequential over the sorted event stream (§5):
/// FIFO lot matching is inherently order-dependent.
pub struct Engine<'a> {
    oracle: &'a PriceOracle,
    now_fn: std::sync::Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl<'a> Engine<'a> {
    pub fn new(oracle: &'a PriceOracle, now_fn: std::sync::Arc<dyn Fn() -> i64 + Send + Sync>) -> Self {
        Self { oracle, now_fn }
    }

    /// Fetches, normalizes, sorts, and processes every event in
    /// `[start_ts, end_ts]` from `event_source`, returning the full set of
    /// disposal records, reward income, diagnostics, and the final lot book.
    pub fn run(
        &self,
        event_source: &dyn EventSource,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<EngineOutput, EngineError> {
        let raw_events = event_source.fetch(start_ts, end_ts)?;
        debug!(count = raw_events.len(), "fetched raw events");

        let normalizer = Normalizer::new(std::sync::Arc::clone(&self.now_fn));
        let (transactions, mut diagnostics) = normalizer.normalize_batch(raw_events);

        let transactions = dedup_and_sort(transactions);
        debug!(count = transactions.len(), "transactions after dedup/sort");

        let mut lot_book = LotBook::new();
        let mut reward_income = Vec::new();
        let mut disposal_records = Vec::new();

        // Pass A: every acquisition, in chronological order, populates the book.
        // A crypto-crypto trade is simultaneously an acquisition of the received
        // asset and a disposal of the given one (§4.5): `is_acquisition()` only
        // covers the latter half of that, so it's included here unconditionally.
        for tx in transactions
            .iter()
            .filter(|tx| tx.is_acquisition() || matches!(tx.kind, TxKind::CryptoCryptoTrade { .. }))
        {
            self.process_acquisition(tx, &mut lot_book, &mut reward_income, &mut diagnostics);
        }

        // Pass B: every disposal, in chronological order, consumes the book.
        for tx in transactions.iter().filter(|tx| tx.is_disposal()) {
            let record = self.process_disposal(tx, &mut lot_book, event_source, &mut diagnostics);
            disposal_records.push(record);
        }

        Ok(EngineOutput {
            disposal_records,
            reward_income,
            diagnostics,
            lot_book,
        })
    }

    fn process_acquisition(
        &self,
        tx: &Transaction,
        lot_book: &mut LotBook,
        reward_income: &mut Vec<RewardIncome>,
        diagnostics: &mut Diagnostics,
    ) {
        let unit_cost_eur = match &tx.kind {
            TxKind::Buy => self.fiat_quoted_unit_price(tx, diagnostics),
            TxKind::Deposit => self.oracle_unit_price(&tx.asset, tx.ts, &tx.ref_id, diagnostics),
            TxKind::Reward(_) => self.oracle_unit_price(&tx.asset, tx.ts, &tx.ref_id, diagnostics),
            TxKind::CryptoCryptoTrade { .. } => {
                self.crypto_crypto_acquisition_cost(tx, diagnostics)
            }
            _ => Money::zero(),
        };

        let quantity = match &tx.kind {
            TxKind::CryptoCryptoTrade { received_amount, .. } => received_amount.abs(),
            _ => tx.amount.abs(),
        };

        let asset = match &tx.kind {
            TxKind::CryptoCryptoTrade { received_asset, .. } => received_asset.clone(),
            _ => tx.asset.clone(),
        };

        if quantity.is_zero() {
            return;
        }

        lot_book.push_acquisition(
            &asset,
            HoldingLot::new(tx.ts, tx.ref_id.clone(), quantity, unit_cost_eur),
        );

        if let TxKind::Reward(subtype) = &tx.kind {
            if *subtype == RewardSubtype::Airdrop || *subtype == RewardSubtype::Fork {
                diagnostics.push(Diagnostic::warn(
                    DiagnosticKind::AmbiguousClassification,
                    &tx.ref_id,
                    tx.ts,
                    "airdrop/fork treated as a zero-proof-of-law acquisition at market value; legal treatment is ambiguous",
                ));
            }

            let eur_value = quantity.mul_rate(unit_cost_eur.as_rate()).unwrap_or_else(|_| Money::zero());
            reward_income.push(RewardIncome {
                ref_id: tx.ref_id.clone(),
                ts: tx.ts,
                tax_year: year_of(tx.ts),
                asset,
                eur_value,
            });
        }
    }

    fn process_disposal(
        &self,
        tx: &Transaction,
        lot_book: &mut LotBook,
        event_source: &dyn EventSource,
        diagnostics: &mut Diagnostics,
    ) -> DisposalRecord {
        let mut record_diagnostics = Vec::new();

        let (asset, quantity) = match &tx.kind {
            TxKind::CryptoCryptoTrade { .. } => (tx.asset.clone(), tx.amount.abs()),
            _ => (tx.asset.clone(), tx.amount.abs()),
        };

        let unit_sale_price_eur = if matches!(tx.kind, TxKind::Withdrawal) {
            record_diagnostics.push(Diagnostic::warn(
                DiagnosticKind::UnmappedAsset,
                &tx.ref_id,
                tx.ts,
                "withdrawal recorded as an inventory reduction at zero proceeds; no proof of beneficial ownership change",
            ));
            Money::zero()
        } else {
            self.disposal_unit_price(tx, &mut record_diagnostics)
        };

        let gross_proceeds_eur = if matches!(tx.kind, TxKind::Withdrawal) {
            Money::zero()
        } else {
            quantity.mul_rate(unit_sale_price_eur.as_rate()).unwrap_or_else(|_| Money::zero())
        };

        let fee_eur = self.fee_in_eur(tx, &mut record_diagnostics);

        let (matched, shortfall) = self.match_with_recovery(
            &asset,
            tx.ts,
            quantity,
            lot_book,
            event_source,
            &tx.ref_id,
            &mut record_diagnostics,
        );

        let total_cost_basis_eur = matched
            .iter()
            .fold(Money::zero(), |acc, m| acc.add(m.cost_basis_eur).unwrap_or(acc));

        // A withdrawal is NON_TAXABLE (see `original_source`'s `tax_rules.py`):
        // the lots are consumed for inventory purposes, but no gain or loss
        // is realized, so the record never reports a deductible loss purely
        // because proceeds are recorded as zero.
        let taxable = !matches!(tx.kind, TxKind::Withdrawal);
        let net_gain_loss_eur = if taxable {
            gross_proceeds_eur
                .sub(total_cost_basis_eur)
                .and_then(|g| g.sub(fee_eur))
                .unwrap_or_else(|_| Money::zero())
        } else {
            Money::zero()
        };

        let (fully_long_term, partially_short_term, weighted_avg_holding_days) =
            classify_holding_period(&matched);

        if !shortfall.is_zero() {
            record_diagnostics.push(Diagnostic::error(
                DiagnosticKind::ShortfallOnDisposal,
                &tx.ref_id,
                tx.ts,
                format!(
                    "disposal of {quantity} {asset} could not be fully matched to held lots; shortfall of {shortfall} units recorded at zero cost basis",
                ),
            ));
        }

        diagnostics.extend(record_diagnostics.clone());

        DisposalRecord {
            ref_id: tx.ref_id.clone(),
            ts: tx.ts,
            asset,
            units_disposed: quantity,
            unit_sale_price_eur,
            gross_proceeds_eur,
            fee_eur,
            total_cost_basis_eur,
            net_gain_loss_eur,
            matched_lots: matched,
            weighted_avg_holding_days,
            fully_long_term,
            partially_short_term,
            tax_year: year_of(tx.ts),
            taxable,
            diagnostics: record_diagnostics,
        }
    }

    /// Consumes as much of `quantity` as the book currently holds; on a
    /// shortfall, performs the single recovery pass from §4.5 step 5 (re-fetch
    /// the asset's full history up to `ts` and retry once) before giving up.
    #[allow(clippy::too_many_arguments)]
    fn match_with_recovery(
        &self,
        asset: &AssetId,
        ts: i64,
        quantity: Money,
        lot_book: &mut LotBook,
        event_source: &dyn EventSource,
        ref_id: &str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> (Vec<MatchedLot>, Money) {
        match lot_book.match_disposal(asset, ts, quantity) {
            Ok(matched) => (
                matched.into_iter().map(|m| MatchedLot::from_book(m, ts)).collect(),
                Money::zero(),
            ),
            Err(LotBookError::Shortfall { available, .. }) => {
                let mut matched = if available.is_positive() {
                    lot_book
                        .match_disposal(asset, ts, available)
                        .map(|m| m.into_iter().map(|m| MatchedLot::from_book(m, ts)).collect())
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };

                let remaining = quantity.sub(available).unwrap_or(quantity);

                if !remaining.is_zero() {
                    self.recover_missing_acquisitions(asset, ts, event_source, lot_book, diagnostics);

                    match lot_book.match_disposal(asset, ts, remaining) {
                        Ok(recovered) => {
                            matched.extend(recovered.into_iter().map(|m| MatchedLot::from_book(m, ts)));
                            (matched, Money::zero())
                        }
                        Err(LotBookError::Shortfall {
                            available: still_available,
                            ..
                        }) => {
                            if still_available.is_positive() {
                                if let Ok(recovered) = lot_book.match_disposal(asset, ts, still_available) {
                                    matched.extend(
                                        recovered.into_iter().map(|m| MatchedLot::from_book(m, ts)),
                                    );
                                }
                            }
                            let final_shortfall = remaining.sub(still_available).unwrap_or(remaining);
                            diagnostics.push(Diagnostic::warn(
                                DiagnosticKind::MissingLots,
                                ref_id,
                                ts,
                                format!("recovery pass did not locate enough prior acquisitions for {asset}"),
                            ));
                            (matched, final_shortfall)
                        }
                    }
                } else {
                    (matched, Money::zero())
                }
            }
        }
    }

    fn recover_missing_acquisitions(
        &self,
        asset: &AssetId,
        ts: i64,
        event_source: &dyn EventSource,
        lot_book: &mut LotBook,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let raw_events = match event_source.fetch(RECOVERY_EPOCH_TS, ts) {
            Ok(events) => events,
            Err(err) => {
                warn!(%err, "recovery pass failed to re-fetch events");
                return;
            }
        };

        let normalizer = Normalizer::new(std::sync::Arc::clone(&self.now_fn));
        let (transactions, recovery_diagnostics) = normalizer.normalize_batch(raw_events);
        diagnostics.extend(recovery_diagnostics.iter().cloned());

        let mut reward_income = Vec::new();
        for tx in transactions.iter().filter(|tx| acquired_asset(tx).as_ref() == Some(asset)) {
            self.process_acquisition(tx, lot_book, &mut reward_income, &mut Diagnostics::new());
        }
    }

    fn fiat_quoted_unit_price(&self, tx: &Transaction, diagnostics: &mut Diagnostics) -> Money {
        if let Some(price) = tx.unit_price {
            return price;
        }

        if let Some(quote_amount) = tx.quote_amount {
            if !tx.amount.is_zero() {
                if let Ok(rate) = quote_amount.abs().div_units(tx.amount.abs()) {
                    return rate_to_money(rate);
                }
            }
        }

        self.oracle_unit_price(&tx.asset, tx.ts, &tx.ref_id, diagnostics)
    }

    fn crypto_crypto_acquisition_cost(&self, tx: &Transaction, diagnostics: &mut Diagnostics) -> Money {
        let received_amount = match &tx.kind {
            TxKind::CryptoCryptoTrade { received_amount, .. } => received_amount.abs(),
            _ => return Money::zero(),
        };

        if received_amount.is_zero() {
            return Money::zero();
        }

        let disposed_price = self.oracle_unit_price(&tx.asset, tx.ts, &tx.ref_id, diagnostics);
        let disposed_value_eur = tx
            .amount
            .abs()
            .mul_rate(disposed_price.as_rate())
            .unwrap_or_else(|_| Money::zero());

        disposed_value_eur
            .div_units(received_amount)
            .map(rate_to_money)
            .unwrap_or_else(|_| Money::zero())
    }

    fn disposal_unit_price(&self, tx: &Transaction, diagnostics: &mut Vec<Diagnostic>) -> Money {
        if let Some(price) = tx.unit_price {
            return price;
        }

        // `quote_amount` on a `CryptoCryptoTrade` is the *received* crypto
        // quantity (see `normalizer.rs::pair_legs`), not a EUR amount -- the
        // disposed leg must be valued through the oracle like any other
        // disposal, never divided against the acquired leg's unit count.
        if !matches!(tx.kind, TxKind::CryptoCryptoTrade { .. }) {
            if let Some(quote_amount) = tx.quote_amount {
                if !tx.amount.is_zero() {
                    if let Ok(rate) = quote_amount.abs().div_units(tx.amount.abs()) {
                        return rate_to_money(rate);
                    }
                }
            }
        }

        match self.oracle.price_eur(&tx.asset, tx.ts) {
            Ok(price) => price,
            Err(PriceError::NotFound { .. } | PriceError::Timeout { .. }) => {
                diagnostics.push(Diagnostic::error(
                    DiagnosticKind::MissingPrice,
                    &tx.ref_id,
                    tx.ts,
                    format!("no EUR price available for {} at {}", tx.asset, tx.ts),
                ));
                Money::zero()
            }
        }
    }

    fn oracle_unit_price(&self, asset: &AssetId, ts: i64, ref_id: &str, diagnostics: &mut Diagnostics) -> Money {
        match self.oracle.price_eur(asset, ts) {
            Ok(price) => price,
            Err(_) => {
                diagnostics.push(Diagnostic::warn(
                    DiagnosticKind::MissingPrice,
                    ref_id,
                    ts,
                    format!("no EUR price available for {asset} at {ts}; recorded as zero-cost acquisition"),
                ));
                Money::zero()
            }
        }
    }

    fn fee_in_eur(&self, tx: &Transaction, diagnostics: &mut Vec<Diagnostic>) -> Money {
        if tx.fee_amount.is_zero() {
            return Money::zero();
        }

        if tx.fee_asset.canonical() == "EUR" {
            return tx.fee_amount;
        }

        match self.oracle.price_eur(&tx.fee_asset, tx.ts) {
            Ok(price) => tx.fee_amount.mul_rate(price.as_rate()).unwrap_or_else(|_| Money::zero()),
            Err(_) => {
                diagnostics.push(Diagnostic::warn(
                    DiagnosticKind::MissingPrice,
                    &tx.ref_id,
                    tx.ts,
                    format!("no EUR price for fee asset {}; fee recorded as zero", tx.fee_asset),
                ));
                Money::zero()
            }
        }
    }
}

/// The asset an acquisition-like transaction adds to the book: the received
/// leg for a crypto-crypto trade, or `tx.asset` for any other acquisition.
/// `None` for transactions that acquire nothing.
fn acquired_asset(tx: &Transaction) -> Option<AssetId> {
    match &tx.kind {
        TxKind::CryptoCryptoTrade { received_asset, .. } => Some(received_asset.clone()),
        _ if tx.is_acquisition() => Some(tx.asset.clone()),
        _ => None,
    }
}

fn rate_to_money(rate: crate::money::Rate) -> Money {
    Money::from_decimal(rate.to_decimal())
}

/// Deduplicates by `ref_id` (the most recently observed row wins), then
/// stable-sorts by `(ts, ref_id)` so ties are lexicographically ordered --
/// the composite key that makes the whole pipeline deterministic.
fn dedup_and_sort(transactions: Vec<Transaction>) -> Vec<Transaction> {
    let mut by_ref: HashMap<String, Transaction> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for tx in transactions {
        if !by_ref.contains_key(&tx.ref_id) {
            order.push(tx.ref_id.clone());
        }
        by_ref.insert(tx.ref_id.clone(), tx);
    }

    let mut deduped: Vec<Transaction> = order.into_iter().filter_map(|r| by_ref.remove(&r)).collect();
    deduped.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.ref_id.cmp(&b.ref_id)));
    deduped
}

fn classify_holding_period(matched: &[MatchedLot]) -> (bool, bool, i64) {
    if matched.is_empty() {
        return (true, false, 0);
    }

    let fully_long_term = matched.iter().all(|m| m.holding_days > HOLDING_PERIOD_DAYS);
    let partially_short_term = matched.iter().any(|m| m.holding_days <= HOLDING_PERIOD_DAYS);

    let total_units = matched
        .iter()
        .fold(Money::zero(), |acc, m| acc.add(m.units_consumed).unwrap_or(acc));

    let weighted_avg_holding_days = if total_units.is_zero() {
        0
    } else {
        let weighted_sum: rust_decimal::Decimal = matched
            .iter()
            .map(|m| rust_decimal::Decimal::from(m.holding_days) * m.units_consumed.to_decimal())
            .sum();
        (weighted_sum / total_units.to_decimal())
            .round()
            .try_into()
            .unwrap_or(0)
    };

    (fully_long_term, partially_short_term, weighted_avg_holding_days)
}

fn year_of(ts: i64) -> i32 {
    DateTime::<Utc>::from_timestamp(ts, 0).map(|dt| dt.year()).unwrap_or(1970)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_source::{InMemoryEventSource, RawEvent};

    fn eur(s: &str) -> Money {
        Money::parse(s).unwrap()
    }

    fn oracle() -> PriceOracle {
        PriceOracle::new(vec![], std::sync::Arc::new(|| 1_800_000_000))
    }

    fn event(fields: &[(&str, &str)]) -> RawEvent {
        fields.iter().fold(RawEvent::new(), |e, (k, v)| e.with_field(*k, *v))
    }

    fn ts(date: &str) -> i64 {
        chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp()
    }

    #[test]
    fn scenario_a_simple_short_term_gain() {
        let events = vec![
            event(&[
                ("ref_id", "B1"),
                ("time", &ts("2023-01-10").to_string()),
                ("type", "buy"),
                ("pair", "XBT/EUR"),
                ("amount", "1"),
                ("price", "20000"),
            ]),
            event(&[
                ("ref_id", "S1"),
                ("time", &ts("2023-06-10").to_string()),
                ("type", "sell"),
                ("pair", "XBT/EUR"),
                ("amount", "-1"),
                ("price", "21000"),
                ("fee", "10"),
            ]),
        ];

        let source = InMemoryEventSource::new(events);
        let oracle = oracle();
        let engine = Engine::new(&oracle, std::sync::Arc::new(|| 1_800_000_000));
        let output = engine.run(&source, 0, 1_900_000_000).unwrap();

        assert_eq!(output.disposal_records.len(), 1);
        let record = &output.disposal_records[0];
        assert_eq!(record.total_cost_basis_eur, eur("20000"));
        assert_eq!(record.gross_proceeds_eur, eur("21000"));
        assert_eq!(record.fee_eur, eur("10"));
        assert_eq!(record.net_gain_loss_eur, eur("990"));
        assert_eq!(record.matched_lots[0].holding_days, 151);
        assert!(!record.fully_long_term);
        assert!(record.partially_short_term);
    }

    #[test]
    fn scenario_b_long_term_tax_free() {
        let events = vec![
            event(&[
                ("ref_id", "B1"),
                ("time", &ts("2021-03-01").to_string()),
                ("type", "buy"),
                ("pair", "ETH/EUR"),
                ("amount", "1"),
                ("price", "1500"),
            ]),
            event(&[
                ("ref_id", "S1"),
                ("time", &ts("2023-03-02").to_string()),
                ("type", "sell"),
                ("pair", "ETH/EUR"),
                ("amount", "-1"),
                ("price", "2500"),
            ]),
        ];

        let source = InMemoryEventSource::new(events);
        let oracle = oracle();
        let engine = Engine::new(&oracle, std::sync::Arc::new(|| 1_800_000_000));
        let output = engine.run(&source, 0, 1_900_000_000).unwrap();

        let record = &output.disposal_records[0];
        assert_eq!(record.net_gain_loss_eur, eur("1000"));
        assert_eq!(record.matched_lots[0].holding_days, 731);
        assert!(record.fully_long_term);
    }

    #[test]
    fn scenario_c_partial_lots_fifo_across_two_buys() {
        let events = vec![
            event(&[
                ("ref_id", "B1"),
                ("time", &ts("2023-01-01").to_string()),
                ("type", "buy"),
                ("pair", "XBT/EUR"),
                ("amount", "0.5"),
                ("price", "10000"),
            ]),
            event(&[
                ("ref_id", "B2"),
                ("time", &ts("2023-02-01").to_string()),
                ("type", "buy"),
                ("pair", "XBT/EUR"),
                ("amount", "0.5"),
                ("price", "20000"),
            ]),
            event(&[
                ("ref_id", "S1"),
                ("time", &ts("2023-03-01").to_string()),
                ("type", "sell"),
                ("pair", "XBT/EUR"),
                ("amount", "-0.75"),
                ("price", "30000"),
            ]),
        ];

        let source = InMemoryEventSource::new(events);
        let oracle = oracle();
        let engine = Engine::new(&oracle, std::sync::Arc::new(|| 1_800_000_000));
        let output = engine.run(&source, 0, 1_900_000_000).unwrap();

        let record = &output.disposal_records[0];
        assert_eq!(record.matched_lots.len(), 2);
        assert_eq!(record.matched_lots[0].units_consumed, eur("0.5"));
        assert_eq!(record.matched_lots[1].units_consumed, eur("0.25"));
        assert_eq!(record.total_cost_basis_eur, eur("10000"));
        assert_eq!(record.gross_proceeds_eur, eur("22500"));
        assert_eq!(record.net_gain_loss_eur, eur("12500"));

        let remaining = output.lot_book.holdings(&AssetId::btc());
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].quantity, eur("0.25"));
    }

    #[test]
    fn scenario_f_shortfall_on_disposal() {
        let events = vec![event(&[
            ("ref_id", "S1"),
            ("time", &ts("2023-05-01").to_string()),
            ("type", "sell"),
            ("pair", "XBT/EUR"),
            ("amount", "-1"),
            ("price", "25000"),
        ])];

        let source = InMemoryEventSource::new(events);
        let oracle = oracle();
        let engine = Engine::new(&oracle, std::sync::Arc::new(|| 1_800_000_000));
        let output = engine.run(&source, 0, 1_900_000_000).unwrap();

        let record = &output.disposal_records[0];
        assert!(record.total_cost_basis_eur.is_zero());
        assert!(output.diagnostics.has_errors());
        assert!(record
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::ShortfallOnDisposal));
    }

    #[test]
    fn withdrawal_consumes_lots_but_realizes_no_gain_or_loss() {
        let events = vec![
            event(&[
                ("ref_id", "B1"),
                ("time", &ts("2023-01-10").to_string()),
                ("type", "buy"),
                ("pair", "XBT/EUR"),
                ("amount", "1"),
                ("price", "20000"),
            ]),
            event(&[
                ("ref_id", "W1"),
                ("time", &ts("2023-06-10").to_string()),
                ("type", "withdrawal"),
                ("asset", "BTC"),
                ("amount", "-1"),
            ]),
        ];

        let source = InMemoryEventSource::new(events);
        let oracle = oracle();
        let engine = Engine::new(&oracle, std::sync::Arc::new(|| 1_800_000_000));
        let output = engine.run(&source, 0, 1_900_000_000).unwrap();

        let record = output
            .disposal_records
            .iter()
            .find(|d| d.ref_id == "W1")
            .expect("withdrawal recorded");
        assert!(!record.taxable);
        assert!(record.net_gain_loss_eur.is_zero());
        assert_eq!(record.total_cost_basis_eur, eur("20000"));
        assert!(output.lot_book.holdings(&AssetId::new("BTC")).is_empty());

        let summaries = crate::aggregator::Aggregator::aggregate(&output.disposal_records, &output.reward_income);
        assert!(summaries.is_empty() || summaries[0].net_private_sales.is_zero());
    }

    #[test]
    fn crypto_crypto_trade_acquires_the_received_asset() {
        let events = vec![
            event(&[
                ("ref_id", "T1"),
                ("time", &ts("2023-02-01").to_string()),
                ("type", "trade"),
                ("asset", "ETH"),
                ("amount", "-1"),
            ]),
            event(&[
                ("ref_id", "T1"),
                ("time", &ts("2023-02-01").to_string()),
                ("type", "trade"),
                ("asset", "BTC"),
                ("amount", "0.1"),
            ]),
        ];

        let source = InMemoryEventSource::new(events);
        let oracle = oracle();
        let engine = Engine::new(&oracle, std::sync::Arc::new(|| 1_800_000_000));
        let output = engine.run(&source, 0, 1_900_000_000).unwrap();

        // The received leg (BTC) must land in the lot book even though the
        // paired transaction's own `is_acquisition()` reports false for a
        // crypto-crypto trade (it only ever reflects the disposed leg).
        let holdings = output.lot_book.holdings(&AssetId::new("BTC"));
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].quantity, eur("0.1"));
    }

    #[test]
    fn crypto_crypto_disposal_is_valued_through_the_oracle_not_the_received_leg() {
        // Dispose 1 ETH, receive 0.1 BTC. The received BTC quantity must never
        // be read as a EUR amount: the disposal leg is priced at ETH's own
        // oracle rate, independent of however much BTC came back.
        let events = vec![
            event(&[
                ("ref_id", "B1"),
                ("time", &ts("2023-01-01").to_string()),
                ("type", "buy"),
                ("pair", "ETH/EUR"),
                ("amount", "1"),
                ("price", "1000"),
            ]),
            event(&[
                ("ref_id", "T1"),
                ("time", &ts("2023-02-01").to_string()),
                ("type", "trade"),
                ("asset", "ETH"),
                ("amount", "-1"),
            ]),
            event(&[
                ("ref_id", "T1"),
                ("time", &ts("2023-02-01").to_string()),
                ("type", "trade"),
                ("asset", "BTC"),
                ("amount", "0.1"),
            ]),
        ];

        let source = InMemoryEventSource::new(events);
        let oracle = PriceOracle::new(
            vec![Box::new(crate::oracle::StaticProvider::new(
                "eth-price",
                AssetId::new("ETH"),
                eur("1800"),
            ))],
            std::sync::Arc::new(|| 1_800_000_000),
        );
        let engine = Engine::new(&oracle, std::sync::Arc::new(|| 1_800_000_000));
        let output = engine.run(&source, 0, 1_900_000_000).unwrap();

        let disposal = output
            .disposal_records
            .iter()
            .find(|d| d.asset == AssetId::new("ETH"))
            .expect("ETH disposal leg recorded");

        assert_eq!(disposal.unit_sale_price_eur, eur("1800"));
        assert_eq!(disposal.gross_proceeds_eur, eur("1800"));
        assert_eq!(disposal.total_cost_basis_eur, eur("1000"));
        assert_eq!(disposal.net_gain_loss_eur, eur("800"));
    }

    #[test]
    #[tracing_test::traced_test]
    fn run_emits_debug_trace_of_pipeline_stages() {
        let events = vec![
            event(&[
                ("ref_id", "B1"),
                ("time", &ts("2023-01-10").to_string()),
                ("type", "buy"),
                ("pair", "XBT/EUR"),
                ("amount", "1"),
                ("price", "20000"),
            ]),
            event(&[
                ("ref_id", "S1"),
                ("time", &ts("2023-06-10").to_string()),
                ("type", "sell"),
                ("pair", "XBT/EUR"),
                ("amount", "-1"),
                ("price", "21000"),
            ]),
        ];

        let source = InMemoryEventSource::new(events);
        let oracle = oracle();
        let engine = Engine::new(&oracle, std::sync::Arc::new(|| 1_800_000_000));
        engine.run(&source, 0, 1_900_000_000).unwrap();

        assert!(logs_contain("fetched raw events"));
        assert!(logs_contain("transactions after dedup/sort"));
    }
}

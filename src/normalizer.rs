//! Raw event -> typed [`Transaction`] classification.
//!
//! The normalizer is the sole boundary where exchange-specific loose maps
//! become strongly-typed values; everything downstream pattern-matches on
//! [`TxKind`]. Grounded on `imports/kraken.rs`'s row parsing and
//! `model/ledgers/parsed.rs`'s refid-based leg pairing (`FIFO<LedgerRow>::parse`
//! / `snarf_matching_trade_row`), generalized from Kraken's fixed nine-currency
//! model to an open-ended [`AssetId`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::asset::AssetId;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::event_source::RawEvent;
use crate::money::Money;

/// Two raw rows are considered legs of the same logical event if their
/// timestamps fall within this many seconds of each other.
pub const PAIRING_WINDOW_SECS: i64 = 120;

/// Clock skew tolerance before a timestamp is clamped and flagged.
pub const FUTURE_TIMESTAMP_TOLERANCE_SECS: i64 = 60;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RewardSubtype {
    Staking,
    Lending,
    Mining,
    Airdrop,
    Fork,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TxKind {
    Buy,
    Sell,
    CryptoCryptoTrade {
        received_asset: AssetId,
        received_amount: Money,
    },
    Deposit,
    Withdrawal,
    Reward(RewardSubtype),
    InternalTransfer,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub ref_id: String,
    pub ts: i64,
    pub kind: TxKind,
    pub asset: AssetId,
    pub amount: Money,
    pub quote_asset: Option<AssetId>,
    pub quote_amount: Option<Money>,
    pub unit_price: Option<Money>,
    pub fee_amount: Money,
    pub fee_asset: AssetId,
    pub source_year: i32,
    pub notes: String,
}

impl Transaction {
    pub fn is_acquisition(&self) -> bool {
        matches!(
            self.kind,
            TxKind::Buy | TxKind::Reward(_) | TxKind::Deposit
        ) || (matches!(self.kind, TxKind::CryptoCryptoTrade { .. }) && self.amount.is_positive())
    }

    pub fn is_disposal(&self) -> bool {
        matches!(self.kind, TxKind::Sell | TxKind::Withdrawal)
            || (matches!(self.kind, TxKind::CryptoCryptoTrade { .. }) && self.amount.is_negative())
    }
}

/// An intermediate, partially-typed row: fields extracted from a [`RawEvent`]
/// but not yet classified into a [`TxKind`].
struct ParsedRow {
    ref_id: String,
    ts: i64,
    raw_type: String,
    subtype: Option<String>,
    asset: AssetId,
    amount: Money,
    fee: Money,
    fee_asset: Option<AssetId>,
    price: Option<Money>,
    pair: Option<String>,
}

pub struct Normalizer {
    now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl Normalizer {
    pub fn new(now_fn: Arc<dyn Fn() -> i64 + Send + Sync>) -> Self {
        Self { now_fn }
    }

    /// Normalizes a full batch of raw events at once (rather than one at a
    /// time), since rule 4 (pairing crypto-crypto legs) needs to see both rows
    /// of a trade together.
    pub fn normalize_batch(&self, raw_events: Vec<RawEvent>) -> (Vec<Transaction>, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        let mut rows = Vec::new();

        for raw in raw_events {
            match self.parse_row(&raw) {
                Ok(row) => rows.push(row),
                Err(diagnostic) => diagnostics.push(diagnostic),
            }
        }

        let mut order: Vec<String> = Vec::new();
        let mut groups: std::collections::HashMap<String, Vec<ParsedRow>> =
            std::collections::HashMap::new();

        for row in rows {
            if !groups.contains_key(&row.ref_id) {
                order.push(row.ref_id.clone());
            }
            groups.entry(row.ref_id.clone()).or_default().push(row);
        }

        let mut transactions = Vec::new();

        for ref_id in order {
            let mut group = groups.remove(&ref_id).unwrap_or_default();

            if group.len() == 2 && group.iter().all(|r| r.pair.is_none()) && legs_are_pairable(&group[0], &group[1]) {
                let b = group.pop().unwrap();
                let a = group.pop().unwrap();
                let tx = self.pair_legs(a, b);
                transactions.push(self.apply_future_timestamp_guard(tx, &mut diagnostics));
                continue;
            }

            for row in group {
                if let Some(tx) = self.classify_single(row, &mut diagnostics) {
                    transactions.push(self.apply_future_timestamp_guard(tx, &mut diagnostics));
                }
            }
        }

        (transactions, diagnostics)
    }

    fn parse_row(&self, raw: &RawEvent) -> Result<ParsedRow, Diagnostic> {
        let ref_id = raw
            .get("ref_id")
            .or_else(|| raw.get("refid"))
            .ok_or_else(|| {
                Diagnostic::warn(
                    DiagnosticKind::AmbiguousClassification,
                    "unknown",
                    0,
                    "raw event missing ref_id/refid",
                )
            })?
            .to_owned();

        let ts = raw
            .get("time")
            .and_then(|t| t.parse::<f64>().ok())
            .map(|t| t as i64)
            .ok_or_else(|| {
                Diagnostic::warn(
                    DiagnosticKind::AmbiguousClassification,
                    &ref_id,
                    0,
                    "raw event missing or unparsable time",
                )
            })?;

        let raw_type = raw
            .get("type")
            .ok_or_else(|| {
                Diagnostic::warn(
                    DiagnosticKind::AmbiguousClassification,
                    &ref_id,
                    ts,
                    "raw event missing type",
                )
            })?
            .to_lowercase();

        let asset = raw.get("asset").map(AssetId::new).unwrap_or_else(|| AssetId::new("UNKNOWN"));

        let amount = raw
            .get("amount")
            .and_then(|a| Money::parse(a).ok())
            .unwrap_or_else(Money::zero);

        let fee = raw
            .get("fee")
            .and_then(|f| Money::parse(f).ok())
            .unwrap_or_else(Money::zero);

        let price = raw.get("price").and_then(|p| Money::parse(p).ok());

        Ok(ParsedRow {
            ref_id,
            ts,
            raw_type,
            subtype: raw.get("subtype").map(str::to_lowercase),
            asset,
            amount,
            fee,
            fee_asset: None,
            price,
            pair: raw.get("pair").map(str::to_owned),
        })
    }

    /// Rule 4: combine two rows sharing a ref_id, already confirmed pairable
    /// by [`legs_are_pairable`], into one `CryptoCryptoTrade`.
    fn pair_legs(&self, a: ParsedRow, b: ParsedRow) -> Transaction {
        let (disposed, acquired) = if a.amount.is_negative() { (a, b) } else { (b, a) };

        Transaction {
            ref_id: disposed.ref_id.clone(),
            ts: disposed.ts,
            kind: TxKind::CryptoCryptoTrade {
                received_asset: acquired.asset.clone(),
                received_amount: acquired.amount,
            },
            asset: disposed.asset.clone(),
            amount: disposed.amount,
            quote_asset: Some(acquired.asset),
            quote_amount: Some(acquired.amount),
            unit_price: None,
            fee_amount: disposed.fee,
            fee_asset: disposed.fee_asset.unwrap_or(disposed.asset),
            source_year: year_of(disposed.ts),
            notes: String::new(),
        }
    }

    fn classify_single(&self, row: ParsedRow, diagnostics: &mut Diagnostics) -> Option<Transaction> {
        // Rule 2: split a `BASE/QUOTE` or historical concatenated pair field.
        if let Some(pair) = &row.pair {
            if let Some((base, quote)) = split_pair(pair) {
                let kind = match row.raw_type.as_str() {
                    "buy" => TxKind::Buy,
                    "sell" => TxKind::Sell,
                    _ if row.amount.is_positive() => TxKind::Buy,
                    _ => TxKind::Sell,
                };

                return Some(Transaction {
                    ref_id: row.ref_id.clone(),
                    ts: row.ts,
                    kind,
                    asset: base,
                    amount: row.amount,
                    quote_asset: Some(quote),
                    quote_amount: None,
                    unit_price: row.price,
                    fee_amount: row.fee,
                    fee_asset: row.fee_asset.unwrap_or_else(|| row.asset.clone()),
                    source_year: year_of(row.ts),
                    notes: String::new(),
                });
            } else {
                diagnostics.push(Diagnostic::warn(
                    DiagnosticKind::UnmappedAsset,
                    &row.ref_id,
                    row.ts,
                    format!("could not split pair {pair:?}"),
                ));
            }
        }

        // Rule 1: fiat deposit/withdrawal/spend with no nearby crypto activity
        // is a non-taxable internal transfer.
        if row.asset.is_fiat()
            && matches!(row.raw_type.as_str(), "deposit" | "withdrawal" | "spend")
        {
            return Some(self.simple_transaction(row, TxKind::InternalTransfer));
        }

        // Rule 5: reward subtyping.
        if matches!(row.raw_type.as_str(), "staking" | "reward" | "payment" | "bonus") {
            let subtype = infer_reward_subtype(&row);
            if subtype == RewardSubtype::Unknown {
                diagnostics.push(Diagnostic::warn(
                    DiagnosticKind::AmbiguousClassification,
                    &row.ref_id,
                    row.ts,
                    format!("unrecognized reward subtype for raw type {:?}", row.raw_type),
                ));
            }
            return Some(self.simple_transaction(row, TxKind::Reward(subtype)));
        }

        match row.raw_type.as_str() {
            "deposit" => Some(self.simple_transaction(row, TxKind::Deposit)),
            "withdrawal" => Some(self.simple_transaction(row, TxKind::Withdrawal)),
            "transfer" => Some(self.simple_transaction(row, TxKind::InternalTransfer)),
            "spend" => Some(self.simple_transaction(row, TxKind::Sell)),
            "trade" | "buy" | "sell" => {
                let kind = if row.raw_type == "sell" || row.amount.is_negative() {
                    TxKind::Sell
                } else {
                    TxKind::Buy
                };
                Some(self.simple_transaction(row, kind))
            }
            _ => {
                diagnostics.push(Diagnostic::warn(
                    DiagnosticKind::AmbiguousClassification,
                    &row.ref_id,
                    row.ts,
                    format!("unrecognized raw type {:?}", row.raw_type),
                ));
                Some(self.simple_transaction(row, TxKind::Unknown))
            }
        }
    }

    fn simple_transaction(&self, row: ParsedRow, kind: TxKind) -> Transaction {
        Transaction {
            ref_id: row.ref_id,
            ts: row.ts,
            kind,
            asset: row.asset.clone(),
            amount: row.amount,
            quote_asset: None,
            quote_amount: None,
            unit_price: row.price,
            fee_amount: row.fee,
            fee_asset: row.fee_asset.unwrap_or(row.asset),
            source_year: year_of(row.ts),
            notes: String::new(),
        }
    }

    /// Rule 6: clamp timestamps more than a minute in the future and flag it.
    fn apply_future_timestamp_guard(&self, mut tx: Transaction, diagnostics: &mut Diagnostics) -> Transaction {
        let now = (self.now_fn)();

        if tx.ts > now + FUTURE_TIMESTAMP_TOLERANCE_SECS {
            diagnostics.push(Diagnostic::warn(
                DiagnosticKind::FutureTimestamp,
                &tx.ref_id,
                tx.ts,
                format!("timestamp {} is in the future, clamped to {now}", tx.ts),
            ));
            tx.ts = now;
        }

        tx
    }
}

fn infer_reward_subtype(row: &ParsedRow) -> RewardSubtype {
    let haystack = format!(
        "{} {}",
        row.raw_type,
        row.subtype.as_deref().unwrap_or_default()
    );

    if haystack.contains("stak") {
        RewardSubtype::Staking
    } else if haystack.contains("lend") {
        RewardSubtype::Lending
    } else if haystack.contains("min") {
        RewardSubtype::Mining
    } else if haystack.contains("airdrop") {
        RewardSubtype::Airdrop
    } else if haystack.contains("fork") {
        RewardSubtype::Fork
    } else {
        RewardSubtype::Unknown
    }
}

/// Splits a `pair` field of the form `BASE/QUOTE` or the historical
/// concatenated Kraken form `BASEQUOTE` (e.g. `XXBTZEUR`) into canonical
/// `(base, quote)` asset ids.
///
/// Grounded on `model/pairs.rs`'s literal `Pair` enum (`as_kraken`/`get_base`/
/// `get_quote`), generalized from an exhaustive hardcoded enum into a splitting
/// function over the same alias table `AssetId` already knows about.
fn split_pair(pair: &str) -> Option<(AssetId, AssetId)> {
    if let Some((base, quote)) = pair.split_once('/') {
        return Some((AssetId::new(base), AssetId::new(quote)));
    }

    // Concatenated historical form: try every known quote suffix, longest
    // first so 4-letter codes (ZUSDT) aren't shadowed by 3-letter ones.
    const QUOTE_CANDIDATES: &[&str] = &[
        "ZEUR", "ZUSD", "ZGBP", "ZJPY", "ZCAD", "ZAUD", "ZCHF", "EUR", "USD", "GBP", "JPY", "CAD",
        "AUD", "CHF", "USDT", "USDC", "XXBT", "XBT", "BTC",
    ];

    let upper = pair.to_uppercase();

    for quote in QUOTE_CANDIDATES {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return Some((AssetId::new(base), AssetId::new(quote)));
            }
        }
    }

    None
}

fn year_of(ts: i64) -> i32 {
    use chrono::{DateTime, Datelike, Utc};

    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.year())
        .unwrap_or(1970)
}

/// Eligibility check for rule 4: timestamps close together, both legs
/// non-fiat, and opposing signs (one disposal, one acquisition).
fn legs_are_pairable(a: &ParsedRow, b: &ParsedRow) -> bool {
    (a.ts - b.ts).abs() <= PAIRING_WINDOW_SECS
        && !a.asset.is_fiat()
        && !b.asset.is_fiat()
        && a.amount.is_negative() != b.amount.is_negative()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> Arc<dyn Fn() -> i64 + Send + Sync> {
        Arc::new(|| 1_700_000_000)
    }

    fn event(fields: &[(&str, &str)]) -> RawEvent {
        fields
            .iter()
            .fold(RawEvent::new(), |event, (k, v)| event.with_field(*k, *v))
    }

    #[test]
    fn simple_buy_via_pair_field() {
        let normalizer = Normalizer::new(fixed_now());
        let raw = event(&[
            ("ref_id", "B1"),
            ("time", "1673308800"),
            ("type", "buy"),
            ("pair", "XBT/EUR"),
            ("amount", "1"),
            ("price", "20000"),
        ]);

        let (txs, diagnostics) = normalizer.normalize_batch(vec![raw]);
        assert!(diagnostics.is_empty());
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, TxKind::Buy);
        assert_eq!(txs[0].asset, AssetId::btc());
        assert_eq!(txs[0].quote_asset, Some(AssetId::eur()));
    }

    #[test]
    fn historical_concatenated_pair_splits() {
        assert_eq!(
            split_pair("XXBTZEUR"),
            Some((AssetId::new("XXBT"), AssetId::new("ZEUR")))
        );
    }

    #[test]
    fn crypto_crypto_legs_pair_by_refid() {
        let normalizer = Normalizer::new(fixed_now());
        let sell_leg = event(&[
            ("ref_id", "T1"),
            ("time", "1673308800"),
            ("type", "trade"),
            ("asset", "ETH"),
            ("amount", "-1"),
        ]);
        let buy_leg = event(&[
            ("ref_id", "T1"),
            ("time", "1673308805"),
            ("type", "trade"),
            ("asset", "BTC"),
            ("amount", "0.05"),
        ]);

        let (txs, _diagnostics) = normalizer.normalize_batch(vec![sell_leg, buy_leg]);
        assert_eq!(txs.len(), 1);
        assert!(matches!(txs[0].kind, TxKind::CryptoCryptoTrade { .. }));
        assert_eq!(txs[0].asset, AssetId::new("ETH"));
    }

    #[test]
    fn reward_subtype_inferred_from_type() {
        let normalizer = Normalizer::new(fixed_now());
        let raw = event(&[
            ("ref_id", "R1"),
            ("time", "1673308800"),
            ("type", "staking"),
            ("asset", "ETH"),
            ("amount", "0.01"),
        ]);

        let (txs, _diagnostics) = normalizer.normalize_batch(vec![raw]);
        assert_eq!(txs[0].kind, TxKind::Reward(RewardSubtype::Staking));
    }

    #[test]
    fn unrecognized_type_is_unknown_with_warning() {
        let normalizer = Normalizer::new(fixed_now());
        let raw = event(&[
            ("ref_id", "X1"),
            ("time", "1673308800"),
            ("type", "frobnicate"),
            ("asset", "BTC"),
            ("amount", "1"),
        ]);

        let (txs, diagnostics) = normalizer.normalize_batch(vec![raw]);
        assert_eq!(txs[0].kind, TxKind::Unknown);
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::AmbiguousClassification));
    }

    #[test]
    fn future_timestamp_is_clamped() {
        let normalizer = Normalizer::new(fixed_now());
        let raw = event(&[
            ("ref_id", "F1"),
            ("time", "1800000000"),
            ("type", "deposit"),
            ("asset", "BTC"),
            ("amount", "1"),
        ]);

        let (txs, diagnostics) = normalizer.normalize_batch(vec![raw]);
        assert_eq!(txs[0].ts, 1_700_000_000);
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::FutureTimestamp));
    }

    #[test]
    fn missing_required_field_is_skipped() {
        let normalizer = Normalizer::new(fixed_now());
        let raw = event(&[("time", "1673308800"), ("type", "buy")]);

        let (txs, diagnostics) = normalizer.normalize_batch(vec![raw]);
        assert!(txs.is_empty());
        assert_eq!(diagnostics.len(), 1);
    }
}

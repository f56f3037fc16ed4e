//! FIFO cost-basis tracking, one queue of holding lots per asset.
//!
//! Grounded on `basis/poolasset.rs`'s `PoolAsset` (a per-asset FIFO of
//! acquisition lots consumed oldest-first on disposal, splitting the lot that
//! straddles the disposed quantity) and its `splittable_take_while` /
//! `PoolAssetSplit` helpers, which this module's `util::HasSplit` descends
//! from directly. The teacher tracked BTC-denominated basis only; this
//! generalizes the queue to an arbitrary `AssetId` and EUR-denominated cost.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::asset::AssetId;
use crate::money::Money;
use crate::util::fifo::FIFO;
use crate::util::HasSplit;

/// Quantities at or below this are treated as fully consumed dust rather than
/// leaving a near-zero lot behind to accumulate rounding noise indefinitely.
fn dust_epsilon() -> Money {
    Money::parse("0.000000000001").expect("valid epsilon literal")
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum LotBookError {
    #[error("insufficient lots for {asset}: requested {requested}, available {available} as of {ts}")]
    Shortfall {
        asset: AssetId,
        ts: i64,
        requested: Money,
        available: Money,
    },
}

/// A single acquisition, still (partially) unconsumed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HoldingLot {
    pub acquired_at: i64,
    pub acquisition_ref_id: String,
    pub quantity: Money,
    pub unit_cost_eur: Money,
}

impl HoldingLot {
    pub fn new(
        acquired_at: i64,
        acquisition_ref_id: impl Into<String>,
        quantity: Money,
        unit_cost_eur: Money,
    ) -> Self {
        Self {
            acquired_at,
            acquisition_ref_id: acquisition_ref_id.into(),
            quantity,
            unit_cost_eur,
        }
    }

    fn cost_basis_eur(&self) -> Money {
        self.quantity
            .mul_rate(self.unit_cost_eur.as_rate())
            .unwrap_or_else(|_| Money::zero())
    }

    fn is_dust(&self) -> bool {
        self.quantity.abs() <= dust_epsilon()
    }
}

/// The portion of a [`HoldingLot`] consumed by one disposal, with the EUR
/// cost basis attributable to that portion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchedLot {
    pub acquired_at: i64,
    pub acquisition_ref_id: String,
    pub quantity: Money,
    pub unit_cost_eur: Money,
    pub cost_basis_eur: Money,
}

/// Per-asset FIFO queues of holding lots.
#[derive(Default)]
pub struct LotBook {
    lots: HashMap<AssetId, FIFO<HoldingLot>>,
    /// Every `(acquired_at, acquisition_ref_id)` ever pushed for an asset,
    /// retained even after the lot is fully consumed and drops out of
    /// `lots`. Without this, the engine's recovery pass (which re-fetches
    /// and re-pushes an asset's whole acquisition history) would resurrect
    /// lots already disposed of as phantom holdings.
    ever_pushed: HashMap<AssetId, HashSet<(i64, String)>>,
}

impl LotBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an acquisition lot. Idempotent on identical
    /// `(acquired_at, acquisition_ref_id)` pairs ever pushed for the asset —
    /// including ones already fully consumed and removed from the queue —
    /// so re-ingesting the same export twice, or a recovery-pass re-fetch,
    /// never double-counts holdings.
    pub fn push_acquisition(&mut self, asset: &AssetId, lot: HoldingLot) {
        let seen = self.ever_pushed.entry(asset.clone()).or_default();
        let key = (lot.acquired_at, lot.acquisition_ref_id.clone());

        if !seen.insert(key) {
            return;
        }

        let queue = self.lots.entry(asset.clone()).or_default();
        queue.append_back(lot);
    }

    /// Consumes `quantity` units of `asset` oldest-first as of `ts`, skipping
    /// (but not discarding) lots acquired after `ts`. Returns the matched
    /// pieces in FIFO order, or a [`LotBookError::Shortfall`] if the asset's
    /// available holdings as of `ts` are insufficient — in that case no lots
    /// are mutated.
    pub fn match_disposal(
        &mut self,
        asset: &AssetId,
        ts: i64,
        quantity: Money,
    ) -> Result<Vec<MatchedLot>, LotBookError> {
        let available = self.available_as_of(asset, ts);

        if available.to_decimal() < quantity.to_decimal() {
            return Err(LotBookError::Shortfall {
                asset: asset.clone(),
                ts,
                requested: quantity,
                available,
            });
        }

        let queue = self.lots.entry(asset.clone()).or_default();
        let mut remaining = quantity;
        let mut matched = Vec::new();
        let mut held_back = Vec::new();

        while remaining.is_positive() {
            let Some(front) = queue.pop_front() else {
                break;
            };

            if front.acquired_at > ts {
                held_back.push(front);
                continue;
            }

            if front.quantity.to_decimal() <= remaining.to_decimal() {
                remaining = remaining.sub(front.quantity).unwrap_or_else(|_| Money::zero());
                matched.push(MatchedLot {
                    acquired_at: front.acquired_at,
                    acquisition_ref_id: front.acquisition_ref_id,
                    quantity: front.quantity,
                    unit_cost_eur: front.unit_cost_eur,
                    cost_basis_eur: front.cost_basis_eur(),
                });
            } else {
                let split = split_lot(front, remaining);
                matched.push(MatchedLot {
                    acquired_at: split.take.acquired_at,
                    acquisition_ref_id: split.take.acquisition_ref_id.clone(),
                    quantity: split.take.quantity,
                    unit_cost_eur: split.take.unit_cost_eur,
                    cost_basis_eur: split.take.cost_basis_eur(),
                });

                if !split.leave.is_dust() {
                    queue.push_front(split.leave);
                }

                remaining = Money::zero();
            }
        }

        for lot in held_back.into_iter().rev() {
            queue.push_front(lot);
        }

        Ok(matched)
    }

    /// Snapshot of remaining holdings for an asset, oldest lot first.
    pub fn holdings(&self, asset: &AssetId) -> Vec<&HoldingLot> {
        self.lots
            .get(asset)
            .map(|queue| queue.iter().collect())
            .unwrap_or_default()
    }

    /// Total quantity acquired no later than `ts` (lots acquired after `ts`
    /// are not yet usable for a disposal at `ts`).
    fn available_as_of(&self, asset: &AssetId, ts: i64) -> Money {
        let Some(queue) = self.lots.get(asset) else {
            return Money::zero();
        };

        queue
            .iter()
            .filter(|lot| lot.acquired_at <= ts)
            .fold(Money::zero(), |acc, lot| acc.add(lot.quantity).unwrap_or(acc))
    }
}

/// Splits a lot into the piece consumed by this disposal (`take`) and the
/// piece left in the book (`leave`), apportioning cost basis by quantity.
fn split_lot(lot: HoldingLot, take_quantity: Money) -> HasSplit<HoldingLot> {
    let leave_quantity = lot.quantity.sub(take_quantity).unwrap_or_else(|_| Money::zero());

    HasSplit {
        take: HoldingLot {
            acquired_at: lot.acquired_at,
            acquisition_ref_id: lot.acquisition_ref_id.clone(),
            quantity: take_quantity,
            unit_cost_eur: lot.unit_cost_eur,
        },
        leave: HoldingLot {
            acquired_at: lot.acquired_at,
            acquisition_ref_id: lot.acquisition_ref_id,
            quantity: leave_quantity,
            unit_cost_eur: lot.unit_cost_eur,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eur(s: &str) -> Money {
        Money::parse(s).unwrap()
    }

    fn btc() -> AssetId {
        AssetId::new("BTC")
    }

    #[test]
    fn fifo_order_is_respected() {
        let mut book = LotBook::new();
        book.push_acquisition(&btc(), HoldingLot::new(100, "A1", eur("1"), eur("10000")));
        book.push_acquisition(&btc(), HoldingLot::new(200, "A2", eur("1"), eur("20000")));

        let matched = book.match_disposal(&btc(), 300, eur("1")).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].acquisition_ref_id, "A1");
    }

    #[test]
    fn partial_lot_is_split_and_remainder_kept() {
        let mut book = LotBook::new();
        book.push_acquisition(&btc(), HoldingLot::new(100, "A1", eur("1"), eur("10000")));

        let matched = book.match_disposal(&btc(), 300, eur("0.4")).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].quantity, eur("0.4"));

        let remaining = book.holdings(&btc());
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].quantity, eur("0.6"));
    }

    #[test]
    fn disposal_spans_multiple_lots() {
        let mut book = LotBook::new();
        book.push_acquisition(&btc(), HoldingLot::new(100, "A1", eur("0.5"), eur("5000")));
        book.push_acquisition(&btc(), HoldingLot::new(200, "A2", eur("0.5"), eur("6000")));

        let matched = book.match_disposal(&btc(), 300, eur("0.8")).unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].acquisition_ref_id, "A1");
        assert_eq!(matched[0].quantity, eur("0.5"));
        assert_eq!(matched[1].acquisition_ref_id, "A2");
        assert_eq!(matched[1].quantity, eur("0.3"));
    }

    #[test]
    fn shortfall_does_not_mutate_book() {
        let mut book = LotBook::new();
        book.push_acquisition(&btc(), HoldingLot::new(100, "A1", eur("0.1"), eur("1000")));

        let err = book.match_disposal(&btc(), 300, eur("1")).unwrap_err();
        assert!(matches!(err, LotBookError::Shortfall { .. }));
        assert_eq!(book.holdings(&btc())[0].quantity, eur("0.1"));
    }

    #[test]
    fn lots_acquired_after_disposal_are_skipped_not_consumed() {
        let mut book = LotBook::new();
        book.push_acquisition(&btc(), HoldingLot::new(500, "future", eur("1"), eur("30000")));
        book.push_acquisition(&btc(), HoldingLot::new(100, "past", eur("1"), eur("10000")));

        let matched = book.match_disposal(&btc(), 300, eur("1")).unwrap();
        assert_eq!(matched[0].acquisition_ref_id, "past");
        assert_eq!(book.holdings(&btc())[0].acquisition_ref_id, "future");
    }

    #[test]
    fn push_acquisition_is_idempotent_on_identical_ref() {
        let mut book = LotBook::new();
        let lot = HoldingLot::new(100, "A1", eur("1"), eur("10000"));
        book.push_acquisition(&btc(), lot.clone());
        book.push_acquisition(&btc(), lot);

        assert_eq!(book.holdings(&btc()).len(), 1);
    }

    #[test]
    fn push_acquisition_does_not_resurrect_a_fully_consumed_lot() {
        let mut book = LotBook::new();
        book.push_acquisition(&btc(), HoldingLot::new(100, "A1", eur("1"), eur("10000")));
        book.match_disposal(&btc(), 300, eur("1")).unwrap();
        assert!(book.holdings(&btc()).is_empty());

        // A recovery pass re-fetching the same history must not re-add the
        // already-disposed-of lot as a phantom holding.
        book.push_acquisition(&btc(), HoldingLot::new(100, "A1", eur("1"), eur("10000")));
        assert!(book.holdings(&btc()).is_empty());
    }
}

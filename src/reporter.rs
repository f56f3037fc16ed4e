//! Renders the engine's structured output to CSV, a human-readable FIFO
//! proof, or JSON.
//!
//! The CSV and text writers build output by hand with `writeln!`, grounded on
//! `model/gains.rs`'s manual `Display` impl for `CapGainsWorksheet` (the row
//! shape mixes scalars with a nested list of matched lots per record, which
//! doesn't fit the `csv` crate's one-row-one-struct writer).

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::aggregator::YearSummary;
use crate::diagnostics::Diagnostic;
use crate::engine::DisposalRecord;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize report to JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to format report: {0}")]
    Fmt(#[from] std::fmt::Error),
}

/// Everything a [`Reporter`] needs to render one run's output.
pub struct ReportInput<'a> {
    pub disposals: &'a [DisposalRecord],
    pub summaries: &'a [YearSummary],
    pub diagnostics: &'a [Diagnostic],
}

pub trait Reporter {
    fn render(&self, input: &ReportInput<'_>) -> Result<String, ReportError>;
}

/// `line#; kind; tax_category; ts_iso; asset; units; acquired_iso;
/// unit_cost_eur; disposed_iso; unit_sale_eur; cost_basis_eur; proceeds_eur;
/// fee_eur; gain_loss_eur; avg_holding_days; long_term_bool; taxable_bool;
/// reason; fifo_detail; notes` -- one row per [`DisposalRecord`], a summary
/// block after a blank row. Decimal separator `.`, field separator `;`.
pub struct CsvReporter;

impl Reporter for CsvReporter {
    fn render(&self, input: &ReportInput<'_>) -> Result<String, ReportError> {
        let mut out = String::new();

        writeln!(
            out,
            "line#;kind;tax_category;ts_iso;asset;units;acquired_iso;unit_cost_eur;disposed_iso;unit_sale_eur;cost_basis_eur;proceeds_eur;fee_eur;gain_loss_eur;avg_holding_days;long_term_bool;taxable_bool;reason;fifo_detail;notes"
        )?;

        for (line_no, record) in input.disposals.iter().enumerate() {
            let tax_category = if !record.taxable {
                "non-taxable-withdrawal"
            } else if record.fully_long_term {
                "long-term-exempt"
            } else {
                "private-sale-23-estg"
            };

            let fifo_detail = record
                .matched_lots
                .iter()
                .map(|m| {
                    format!(
                        "{}@{}({}d)",
                        m.units_consumed,
                        m.unit_cost_eur,
                        m.holding_days
                    )
                })
                .collect::<Vec<_>>()
                .join("|");

            let reason = if record.diagnostics.is_empty() {
                String::new()
            } else {
                record
                    .diagnostics
                    .iter()
                    .map(|d| d.kind.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            };

            let acquired_iso = record
                .matched_lots
                .first()
                .map(|m| iso(m.acquired_at))
                .unwrap_or_default();

            writeln!(
                out,
                "{line_no};disposal;{tax_category};{ts_iso};{asset};{units};{acquired_iso};{unit_cost_eur};{disposed_iso};{unit_sale_eur};{cost_basis_eur};{proceeds_eur};{fee_eur};{gain_loss_eur};{avg_days};{long_term};{taxable};{reason};{fifo_detail};",
                ts_iso = iso(record.ts),
                asset = record.asset,
                units = record.units_disposed.format_fixed(18),
                unit_cost_eur = record
                    .matched_lots
                    .first()
                    .map(|m| m.unit_cost_eur.format_fixed(2))
                    .unwrap_or_else(|| "0.00".to_owned()),
                disposed_iso = iso(record.ts),
                unit_sale_eur = record.unit_sale_price_eur.format_fixed(2),
                cost_basis_eur = record.total_cost_basis_eur.format_fixed(2),
                proceeds_eur = record.gross_proceeds_eur.format_fixed(2),
                fee_eur = record.fee_eur.format_fixed(2),
                gain_loss_eur = record.net_gain_loss_eur.format_fixed(2),
                avg_days = record.weighted_avg_holding_days,
                long_term = record.fully_long_term,
                taxable = record.taxable && !record.fully_long_term,
            )?;
        }

        writeln!(out)?;
        writeln!(out, "tax_year;short_term_gains;short_term_losses;long_term_gains;other_income;net_private_sales;private_sales_threshold;other_income_threshold;private_sales_taxable;other_income_taxable")?;

        for summary in input.summaries {
            writeln!(
                out,
                "{};{};{};{};{};{};{};{};{};{}",
                summary.tax_year,
                summary.short_term_gains.format_fixed(2),
                summary.short_term_losses.format_fixed(2),
                summary.long_term_gains.format_fixed(2),
                summary.other_income.format_fixed(2),
                summary.net_private_sales.format_fixed(2),
                summary.private_sales_threshold.format_fixed(2),
                summary.other_income_threshold.format_fixed(2),
                summary.private_sales_taxable,
                summary.other_income_taxable,
            )?;
        }

        Ok(out)
    }
}

/// Per disposal: a header line with date/asset/units, one bullet per matched
/// lot, a footer with totals and taxable classification. UTF-8 text, no ANSI
/// color codes (color gating is a CLI concern, see `main.rs`).
pub struct TextReporter;

impl Reporter for TextReporter {
    fn render(&self, input: &ReportInput<'_>) -> Result<String, ReportError> {
        let mut out = String::new();

        if !input.diagnostics.is_empty() {
            writeln!(out, "Diagnostics")?;
            writeln!(out, "===========")?;
            for diagnostic in input.diagnostics {
                writeln!(out, "{diagnostic}")?;
            }
            writeln!(out)?;
        }

        for record in input.disposals {
            writeln!(
                out,
                "{} disposed {} {} ({})",
                iso(record.ts),
                record.units_disposed.format_fixed(8),
                record.asset,
                record.ref_id,
            )?;

            for lot in &record.matched_lots {
                writeln!(
                    out,
                    "  - {} @ {} EUR (acquired {}, held {} days)",
                    lot.units_consumed.format_fixed(8),
                    lot.unit_cost_eur.format_fixed(2),
                    iso(lot.acquired_at),
                    lot.holding_days,
                )?;
            }

            writeln!(
                out,
                "  proceeds {} EUR, cost basis {} EUR, fee {} EUR, gain/loss {} EUR, {}",
                record.gross_proceeds_eur.format_fixed(2),
                record.total_cost_basis_eur.format_fixed(2),
                record.fee_eur.format_fixed(2),
                record.net_gain_loss_eur.format_fixed(2),
                if !record.taxable {
                    "non-taxable withdrawal"
                } else if record.fully_long_term {
                    "long-term (tax-free)"
                } else {
                    "short-term (§23 EStG private sale)"
                },
            )?;
            writeln!(out)?;
        }

        writeln!(out, "Year Summaries")?;
        writeln!(out, "==============")?;
        for summary in input.summaries {
            writeln!(
                out,
                "{}: net private sales {} EUR (threshold {} EUR, {}), long-term gains {} EUR, other income {} EUR (threshold {} EUR, {})",
                summary.tax_year,
                summary.net_private_sales.format_fixed(2),
                summary.private_sales_threshold.format_fixed(2),
                if summary.private_sales_taxable { "taxable" } else { "exempt" },
                summary.long_term_gains.format_fixed(2),
                summary.other_income.format_fixed(2),
                summary.other_income_threshold.format_fixed(2),
                if summary.other_income_taxable { "taxable" } else { "exempt" },
            )?;
        }

        Ok(out)
    }
}

/// Mirrors the data model of §3 as `#[derive(Serialize)]` structs, the way
/// the teacher derives `Serialize`/`Deserialize` on its checkpoint types.
#[derive(Serialize)]
struct JsonReport<'a> {
    disposals: &'a [DisposalRecord],
    summaries: &'a [YearSummary],
    diagnostics: &'a [Diagnostic],
}

pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn render(&self, input: &ReportInput<'_>) -> Result<String, ReportError> {
        let report = JsonReport {
            disposals: input.disposals,
            summaries: input.summaries,
            diagnostics: input.diagnostics,
        };

        Ok(serde_json::to_string_pretty(&report)?)
    }
}

fn iso(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

//! Structured warnings and errors surfaced alongside the engine's output.
//!
//! No diagnostic ever aborts a run. They accumulate in a flat, sortable channel
//! that the report writers place ahead of totals, per the "problems first"
//! design note.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let glyph = match self {
            Severity::Info => "ℹ",
            Severity::Warn => "⚠",
            Severity::Error => "✗",
        };
        write!(f, "{glyph}")
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    MissingPrice,
    MissingLots,
    ShortfallOnDisposal,
    FutureTimestamp,
    AmbiguousClassification,
    UnmappedAsset,
    PartialPriceRecovery,
    ThresholdCrossed,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticKind::MissingPrice => "MissingPrice",
            DiagnosticKind::MissingLots => "MissingLots",
            DiagnosticKind::ShortfallOnDisposal => "ShortfallOnDisposal",
            DiagnosticKind::FutureTimestamp => "FutureTimestamp",
            DiagnosticKind::AmbiguousClassification => "AmbiguousClassification",
            DiagnosticKind::UnmappedAsset => "UnmappedAsset",
            DiagnosticKind::PartialPriceRecovery => "PartialPriceRecovery",
            DiagnosticKind::ThresholdCrossed => "ThresholdCrossed",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub ref_id: String,
    pub ts: i64,
    pub message: String,
}

impl Diagnostic {
    pub fn new(
        kind: DiagnosticKind,
        severity: Severity,
        ref_id: impl Into<String>,
        ts: i64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            ref_id: ref_id.into(),
            ts,
            message: message.into(),
        }
    }

    pub fn info(kind: DiagnosticKind, ref_id: impl Into<String>, ts: i64, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Info, ref_id, ts, message)
    }

    pub fn warn(kind: DiagnosticKind, ref_id: impl Into<String>, ts: i64, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Warn, ref_id, ts, message)
    }

    pub fn error(kind: DiagnosticKind, ref_id: impl Into<String>, ts: i64, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Error, ref_id, ts, message)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}) ref={}: {}",
            self.severity, self.kind, self.ts, self.ref_id, self.message
        )
    }
}

/// A flat, append-only collector of diagnostics, presentable in a stable
/// severity-then-timestamp order.
///
/// Grounded on the teacher's `basis::CheckList` two-bucket (resolved/errors)
/// partition and its ✅/❌ `Display` summary; generalized here into one ordered
/// list since diagnostics carry their own severity rather than being binary.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = Diagnostic>) {
        self.entries.extend(other);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    /// `true` if any diagnostic at `Severity::Error` was recorded. The engine's
    /// run-level exit status is derived from this.
    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Error)
    }

    /// Returns entries ordered by severity (errors first), then by timestamp.
    pub fn sorted(&self) -> Vec<&Diagnostic> {
        let mut sorted: Vec<&Diagnostic> = self.entries.iter().collect();
        sorted.sort_by(|a, b| {
            // Error first, so invert the natural Info < Warn < Error ordering.
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.ts.cmp(&b.ts))
                .then_with(|| a.ref_id.cmp(&b.ref_id))
        });
        sorted
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return writeln!(f, "✅ no diagnostics");
        }

        for diagnostic in self.sorted() {
            writeln!(f, "{diagnostic}")?;
        }

        Ok(())
    }
}

impl PartialEq for Diagnostics {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

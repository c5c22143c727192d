// src/pipeline/labels.rs
//! Line-item label helpers shared by the validator and the schema normalizer.

use crate::pipeline::model::{ExtractedRecord, StatementType};
use once_cell::sync::Lazy;
use regex::Regex;

static NON_IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9_]+").expect("Failed to compile NON_IDENT_RE"));

/// Converts a label to snake_case: lowercase, runs of anything outside
/// `[a-z0-9_]` become `_`, leading/trailing `_` trimmed.
pub fn clean_column_name(label: &str) -> String {
    let lower = label.trim().to_lowercase();
    NON_IDENT_RE
        .replace_all(&lower, "_")
        .trim_matches('_')
        .to_string()
}

/// Key used to look raw labels up in a schema map.
pub fn label_key(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Figures the validation rules depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFigure {
    Revenue,
    NetIncome,
    TotalAssets,
    TotalLiabilities,
    TotalEquity,
    EndingCash,
}

impl KeyFigure {
    /// Canonical snake_case label for this figure.
    pub fn canonical(self) -> &'static str {
        match self {
            KeyFigure::Revenue => "sales",
            KeyFigure::NetIncome => "net_income",
            KeyFigure::TotalAssets => "total_assets",
            KeyFigure::TotalLiabilities => "total_liabilities",
            KeyFigure::TotalEquity => "total_equity",
            KeyFigure::EndingCash => "cash_and_cash_equivalents_at_the_end_of_the_year",
        }
    }

    /// Known raw spellings, in lookup priority order (lowercase).
    pub fn synonyms(self) -> &'static [&'static str] {
        match self {
            KeyFigure::Revenue => &[
                "sales",
                "net sales",
                "revenue",
                "revenues",
                "net revenue",
                "net revenues",
                "total revenue",
                "total revenues",
                "turnover",
            ],
            KeyFigure::NetIncome => &[
                "net income",
                "net profit",
                "net profit for the year",
                "profit for the year",
                "net earnings",
                "net income for the year",
            ],
            KeyFigure::TotalAssets => &["total assets", "total asset"],
            KeyFigure::TotalLiabilities => &["total liabilities"],
            KeyFigure::TotalEquity => &[
                "total equity",
                "total shareholders' equity",
                "total shareholders equity",
                "total stockholders' equity",
            ],
            KeyFigure::EndingCash => &[
                "cash and cash equivalents at the end of the year",
                "cash and cash equivalents at end of year",
                "cash and cash equivalents at december 31",
                "cash and cash equivalents as at december 31",
                "cash and cash equivalents at 31 december",
                "cash and cash equivalents",
            ],
        }
    }

    /// Figures that belong to a statement type.
    pub fn for_statement(statement: StatementType) -> &'static [KeyFigure] {
        match statement {
            StatementType::IncomeStatement => &[KeyFigure::Revenue, KeyFigure::NetIncome],
            StatementType::BalanceSheet => &[
                KeyFigure::TotalAssets,
                KeyFigure::TotalLiabilities,
                KeyFigure::TotalEquity,
            ],
            StatementType::CashFlowStatement => &[KeyFigure::EndingCash],
        }
    }

    /// Finds this figure in a raw record. Synonyms are tried in priority
    /// order; the first non-zero value wins, otherwise the first value found
    /// (which may be zero).
    pub fn lookup(self, record: &ExtractedRecord) -> Option<f64> {
        let mut first_found = None;
        for synonym in self.synonyms() {
            let hit = record
                .line_items
                .iter()
                .find(|(label, _)| label_key(label) == *synonym)
                .map(|(_, value)| *value);
            match hit {
                Some(v) if v != 0.0 => return Some(v),
                Some(v) if first_found.is_none() => first_found = Some(v),
                _ => {}
            }
        }
        first_found
    }
}

/// Raw (lowercase) -> canonical mappings the schema generator may not
/// override. Only the canonical spelling itself and its spaced form are
/// pinned; the wider synonym lists serve `KeyFigure::lookup` alone, since
/// e.g. "cash and cash equivalents" and the year-end balance can both appear
/// as distinct rows of one statement.
pub fn pinned_mappings(statement: StatementType) -> Vec<(String, &'static str)> {
    let mut pinned = Vec::new();
    for figure in KeyFigure::for_statement(statement) {
        let canonical = figure.canonical();
        pinned.push((canonical.replace('_', " "), canonical));
        if canonical.contains('_') {
            pinned.push((canonical.to_string(), canonical));
        }
    }
    pinned
}

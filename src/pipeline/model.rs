// src/pipeline/model.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The three consolidated statements pulled from every annual report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementType {
    IncomeStatement,
    BalanceSheet,
    CashFlowStatement,
}

impl StatementType {
    pub const ALL: [StatementType; 3] = [
        StatementType::IncomeStatement,
        StatementType::BalanceSheet,
        StatementType::CashFlowStatement,
    ];

    /// Human-readable title, also used in LLM prompts.
    pub fn title(self) -> &'static str {
        match self {
            StatementType::IncomeStatement => "Income Statement",
            StatementType::BalanceSheet => "Balance Sheet",
            StatementType::CashFlowStatement => "Cash Flow Statement",
        }
    }

    /// Key used in `schema_map.json`.
    pub fn key(self) -> &'static str {
        match self {
            StatementType::IncomeStatement => "income_statement",
            StatementType::BalanceSheet => "balance_sheet",
            StatementType::CashFlowStatement => "cash_flow_statement",
        }
    }

    /// Directory holding the per-year extraction files.
    pub fn subdir(self) -> &'static str {
        match self {
            StatementType::IncomeStatement => "income_statements",
            StatementType::BalanceSheet => "balance_sheets",
            StatementType::CashFlowStatement => "cash_flow_statements",
        }
    }

    /// Name of the unified CSV written for this statement.
    pub fn unified_file_name(self) -> &'static str {
        match self {
            StatementType::IncomeStatement => "unified_income_statement.csv",
            StatementType::BalanceSheet => "unified_balance_sheet_statement.csv",
            StatementType::CashFlowStatement => "unified_cash_flow_statement.csv",
        }
    }
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Validation status stored on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    #[default]
    Pending,
    Valid,
    Failed,
}

/// One annual report file and the year it was published.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceReport {
    pub file_name: String,
    pub published_year: u32,
}

impl SourceReport {
    pub fn new(ticker: &str, published_year: u32) -> Self {
        Self {
            file_name: report_file_name(ticker, published_year),
            published_year,
        }
    }
}

/// `<TICKER>_<year>_annual_report.pdf`
pub fn report_file_name(ticker: &str, year: u32) -> String {
    format!("{}_{}_annual_report.pdf", ticker.to_uppercase(), year)
}

/// Sorts reports most recently published first. Ties are broken by file name
/// so the order is reproducible.
pub fn order_by_recency(reports: &mut [SourceReport]) {
    reports.sort_by(|a, b| {
        b.published_year
            .cmp(&a.published_year)
            .then_with(|| a.file_name.cmp(&b.file_name))
    });
}

/// One statement for one fiscal year, as extracted from one report file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub statement_type: StatementType,
    /// The year the figures describe, not the report's publication year.
    pub fiscal_year: u32,
    pub source_file: String,
    /// Raw label as printed in the report -> value.
    pub line_items: BTreeMap<String, f64>,
    #[serde(default)]
    pub status: RecordStatus,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractedRecord {
    pub fn new(
        statement_type: StatementType,
        fiscal_year: u32,
        source_file: impl Into<String>,
        line_items: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            statement_type,
            fiscal_year,
            source_file: source_file.into(),
            line_items,
            status: RecordStatus::Pending,
            extracted_at: Utc::now(),
        }
    }

    pub fn unit_key(&self) -> UnitKey {
        UnitKey {
            source_file: self.source_file.clone(),
            statement_type: self.statement_type,
            fiscal_year: self.fiscal_year,
        }
    }
}

/// A (source file, statement type, fiscal year) triple; the granularity of
/// validation, retry and terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub source_file: String,
    pub statement_type: StatementType,
    pub fiscal_year: u32,
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} from {}", self.statement_type, self.fiscal_year, self.source_file)
    }
}

/// Persisted in place of the per-year JSON once a unit has exhausted its
/// retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureMarker {
    pub unit: UnitKey,
    pub attempts: u32,
    pub reason: String,
    pub marked_at: DateTime<Utc>,
    pub last_record: Option<ExtractedRecord>,
}

/// One row of a unified statement table.
#[derive(Debug, Clone, PartialEq)]
pub struct GoldenRow {
    pub fiscal_year: u32,
    /// Lineage: the report every value in this row came from.
    pub source_file: String,
    /// Canonical label -> value.
    pub values: BTreeMap<String, f64>,
}

/// The consolidated table for one statement type of one company.
/// Exactly one row per fiscal year, ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct GoldenRecordTable {
    pub statement_type: StatementType,
    /// Union of canonical labels across rows, sorted.
    pub columns: Vec<String>,
    pub rows: Vec<GoldenRow>,
}

impl GoldenRecordTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[cfg(test)]
    pub fn row(&self, fiscal_year: u32) -> Option<&GoldenRow> {
        self.rows.iter().find(|r| r.fiscal_year == fiscal_year)
    }
}

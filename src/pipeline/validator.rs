// src/pipeline/validator.rs
use crate::pipeline::labels::KeyFigure;
use crate::pipeline::model::{ExtractedRecord, RecordStatus, StatementType};

/// Outcome of validating one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub passed: bool,
    pub reason: String,
}

impl Verdict {
    fn pass(reason: impl Into<String>) -> Self {
        Self { passed: true, reason: reason.into() }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self { passed: false, reason: reason.into() }
    }
}

/// Statement-specific sanity rules applied to one fiscal year's record.
#[derive(Debug, Clone)]
pub struct Validator {
    /// Absolute slack allowed in `assets = liabilities + equity`.
    tolerance: f64,
}

impl Validator {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// Checks the record and stores the result in its `status`.
    pub fn validate(&self, record: &mut ExtractedRecord) -> Verdict {
        let verdict = self.check(record);
        record.status = if verdict.passed { RecordStatus::Valid } else { RecordStatus::Failed };

        if verdict.passed {
            tracing::debug!("PASS: {} {} ({}): {}", record.statement_type, record.fiscal_year, record.source_file, verdict.reason);
        } else {
            tracing::warn!("FAIL: {} {} ({}): {}", record.statement_type, record.fiscal_year, record.source_file, verdict.reason);
        }
        verdict
    }

    /// Pure form of [`Validator::validate`].
    pub fn check(&self, record: &ExtractedRecord) -> Verdict {
        match record.statement_type {
            StatementType::IncomeStatement => Self::check_income(record),
            StatementType::BalanceSheet => self.check_balance(record),
            StatementType::CashFlowStatement => Self::check_cash_flow(record),
        }
    }

    fn check_income(record: &ExtractedRecord) -> Verdict {
        let sales = match KeyFigure::Revenue.lookup(record) {
            Some(v) if v > 0.0 => v,
            Some(v) => return Verdict::fail(format!("Net sales/revenue is not positive ({})", v)),
            None => return Verdict::fail("Missing net sales/revenue"),
        };
        match KeyFigure::NetIncome.lookup(record) {
            Some(net_income) => Verdict::pass(format!("Has sales ({:.0}) and net income ({:.0})", sales, net_income)),
            None => Verdict::fail("Missing net income"),
        }
    }

    fn check_balance(&self, record: &ExtractedRecord) -> Verdict {
        let (Some(assets), Some(liabilities), Some(equity)) = (
            KeyFigure::TotalAssets.lookup(record),
            KeyFigure::TotalLiabilities.lookup(record),
            KeyFigure::TotalEquity.lookup(record),
        ) else {
            let missing: Vec<&str> = [KeyFigure::TotalAssets, KeyFigure::TotalLiabilities, KeyFigure::TotalEquity]
                .into_iter()
                .filter(|f| f.lookup(record).is_none())
                .map(|f| f.canonical())
                .collect();
            return Verdict::fail(format!("Missing {}", missing.join(", ")));
        };

        let diff = (assets - (liabilities + equity)).abs();
        // Inclusive at the boundary.
        if diff <= self.tolerance {
            Verdict::pass(format!("Balance sheet balances (assets {:.0}, diff {:.1})", assets, diff))
        } else {
            Verdict::fail(format!(
                "Assets != Liabilities + Equity ({} vs {} + {}, diff {:.1} > tolerance {})",
                assets, liabilities, equity, diff, self.tolerance
            ))
        }
    }

    fn check_cash_flow(record: &ExtractedRecord) -> Verdict {
        match KeyFigure::EndingCash.lookup(record) {
            Some(v) if v > 0.0 => Verdict::pass(format!("Has ending cash balance ({:.0})", v)),
            Some(v) => Verdict::fail(format!("Ending cash balance is not positive ({})", v)),
            None => Verdict::fail("Missing ending cash balance"),
        }
    }
}

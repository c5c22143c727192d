// src/pipeline/retry.rs
use crate::extractors::StatementExtractor;
use crate::pipeline::model::{ExtractedRecord, SourceReport, StatementType, UnitKey};
use crate::pipeline::validator::Validator;
use std::collections::{BTreeMap, BTreeSet};

/// Lifecycle of one (source file, statement type, fiscal year) unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitState {
    Pending,
    Valid,
    /// Failed validation or extraction; eligible for retry while budget remains.
    Failed { reason: String },
    /// Retries exhausted, or flagged by a previous run.
    TerminalFailed { reason: String },
}

#[derive(Debug, Clone)]
pub struct Unit {
    pub key: UnitKey,
    pub state: UnitState,
    /// Extraction attempts spent on this unit, the original one included.
    pub attempts: u32,
    /// Most recent record produced for this unit.
    pub record: Option<ExtractedRecord>,
    /// Terminal before this run started (a `.FAILED` marker was on disk).
    pub flagged: bool,
}

impl Unit {
    fn new(key: UnitKey, attempts: u32) -> Self {
        Self { key, state: UnitState::Pending, attempts, record: None, flagged: false }
    }

    pub fn is_valid(&self) -> bool {
        self.state == UnitState::Valid
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self.state, UnitState::TerminalFailed { .. })
    }

    fn apply_verdict(&mut self, record: ExtractedRecord, validator: &Validator) {
        let mut record = record;
        let verdict = validator.validate(&mut record);
        self.state = if verdict.passed {
            UnitState::Valid
        } else {
            UnitState::Failed { reason: verdict.reason }
        };
        self.record = Some(record);
    }
}

/// Everything one (report, statement) pair produced.
#[derive(Debug, Clone)]
pub struct PairOutcome {
    pub report: SourceReport,
    pub statement: StatementType,
    pub units: Vec<Unit>,
    /// Set when no record could be extracted for the pair at all.
    pub extraction_error: Option<String>,
}

impl PairOutcome {
    pub fn valid_records(&self) -> impl Iterator<Item = &ExtractedRecord> {
        self.units
            .iter()
            .filter(|u| u.is_valid())
            .filter_map(|u| u.record.as_ref())
    }
}

/// Drives extraction, validation and bounded re-extraction for the units of
/// one (report, statement) pair.
pub struct RetryController<'a, E> {
    extractor: &'a E,
    validator: &'a Validator,
    max_retries: u32,
}

impl<'a, E: StatementExtractor> RetryController<'a, E> {
    pub fn new(extractor: &'a E, validator: &'a Validator, max_retries: u32) -> Self {
        Self { extractor, validator, max_retries }
    }

    fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// `cached` are records persisted by an earlier run; when they (or
    /// `flagged` or `reopened` years) are present the initial extraction call
    /// is skipped. `reopened` years had their failure marker cleared and are
    /// re-extracted with a fresh budget.
    pub async fn run(
        &self,
        report: &SourceReport,
        statement: StatementType,
        cached: Vec<ExtractedRecord>,
        flagged: &BTreeSet<u32>,
        reopened: &BTreeSet<u32>,
    ) -> PairOutcome {
        let mut outcome = PairOutcome {
            report: report.clone(),
            statement,
            units: Vec::new(),
            extraction_error: None,
        };

        let mut units: BTreeMap<u32, Unit> = BTreeMap::new();
        for &year in flagged {
            let key = unit_key(report, statement, year);
            tracing::warn!("{} is flagged as failed by a previous run, skipping", key);
            let mut unit = Unit::new(key, self.max_attempts());
            unit.flagged = true;
            unit.state = UnitState::TerminalFailed { reason: "flagged by a previous run".to_string() };
            units.insert(year, unit);
        }
        for &year in reopened.difference(flagged) {
            let mut unit = Unit::new(unit_key(report, statement, year), 0);
            unit.state = UnitState::Failed { reason: "failure marker cleared for retry".to_string() };
            units.insert(year, unit);
        }

        let (records, initial_attempts) = if cached.is_empty() && flagged.is_empty() && reopened.is_empty() {
            match self.initial_extraction(report, statement).await {
                Ok(found) => found,
                Err(reason) => {
                    tracing::error!("{} from {}: no data after {} attempts: {}", statement, report.file_name, self.max_attempts(), reason);
                    outcome.extraction_error = Some(reason);
                    return outcome;
                }
            }
        } else {
            tracing::debug!("{} from {}: using {} cached records", statement, report.file_name, cached.len());
            (cached, 1)
        };

        for record in records {
            let taken = units.get(&record.fiscal_year).is_some_and(|u| u.attempts > 0 || u.flagged);
            if !belongs_to(&record, report, statement) || taken {
                tracing::debug!("Ignoring record {} (foreign, duplicate or flagged)", record.unit_key());
                continue;
            }
            let mut unit = Unit::new(record.unit_key(), initial_attempts);
            unit.apply_verdict(record, self.validator);
            units.insert(unit.key.fiscal_year, unit);
        }

        self.retry_failed(report, statement, &mut units).await;

        outcome.units = units.into_values().collect();
        outcome
    }

    /// First extraction of the pair. Returns the records and the attempts
    /// spent getting them.
    async fn initial_extraction(
        &self,
        report: &SourceReport,
        statement: StatementType,
    ) -> Result<(Vec<ExtractedRecord>, u32), String> {
        let mut last_reason = String::new();
        for attempt in 1..=self.max_attempts() {
            match self.extractor.extract(report, statement, None).await {
                Ok(records) if !records.is_empty() => return Ok((records, attempt)),
                Ok(_) => last_reason = "extraction returned no records".to_string(),
                Err(e) => last_reason = e.to_string(),
            }
            tracing::warn!(
                "Failed to extract {} from {} on attempt {}/{}: {}",
                statement, report.file_name, attempt, self.max_attempts(), last_reason
            );
        }
        Err(last_reason)
    }

    /// Re-extracts the years whose unit is FAILED until each is VALID or has
    /// used its whole budget.
    async fn retry_failed(&self, report: &SourceReport, statement: StatementType, units: &mut BTreeMap<u32, Unit>) {
        loop {
            let mut window = BTreeSet::new();
            for unit in units.values_mut() {
                let UnitState::Failed { reason } = &unit.state else { continue };
                if unit.attempts >= self.max_attempts() {
                    let reason = reason.clone();
                    tracing::error!("{}: giving up after {} attempts ({})", unit.key, unit.attempts, reason);
                    unit.state = UnitState::TerminalFailed { reason };
                } else {
                    window.insert(unit.key.fiscal_year);
                }
            }
            if window.is_empty() {
                return;
            }

            tracing::info!("Re-extracting {} from {} for years {:?}", statement, report.file_name, window);
            let mut fresh: BTreeMap<u32, ExtractedRecord> = BTreeMap::new();
            match self.extractor.extract(report, statement, Some(&window)).await {
                Ok(records) => {
                    for record in records {
                        if belongs_to(&record, report, statement) && window.contains(&record.fiscal_year) {
                            fresh.entry(record.fiscal_year).or_insert(record);
                        }
                    }
                }
                Err(e) => tracing::warn!("Re-extraction of {} from {} failed: {}", statement, report.file_name, e),
            }

            for year in &window {
                let Some(unit) = units.get_mut(year) else { continue };
                unit.attempts += 1;
                match fresh.remove(year) {
                    Some(record) => unit.apply_verdict(record, self.validator),
                    None => {
                        unit.state = UnitState::Failed {
                            reason: format!("attempt {} returned no data for {}", unit.attempts, year),
                        };
                    }
                }
                if unit.is_valid() {
                    tracing::info!("{}: valid after {} attempts", unit.key, unit.attempts);
                }
            }
        }
    }
}

fn unit_key(report: &SourceReport, statement: StatementType, fiscal_year: u32) -> UnitKey {
    UnitKey {
        source_file: report.file_name.clone(),
        statement_type: statement,
        fiscal_year,
    }
}

fn belongs_to(record: &ExtractedRecord, report: &SourceReport, statement: StatementType) -> bool {
    record.statement_type == statement && record.source_file == report.file_name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::RecordStatus;
    use crate::utils::error::ExtractError;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    type Response = Result<Vec<ExtractedRecord>, ExtractError>;

    struct ScriptedExtractor {
        responses: RefCell<VecDeque<Response>>,
        windows: RefCell<Vec<Option<BTreeSet<u32>>>>,
    }

    impl ScriptedExtractor {
        fn new(responses: Vec<Response>) -> Self {
            Self { responses: RefCell::new(responses.into()), windows: RefCell::new(Vec::new()) }
        }

        fn calls(&self) -> usize {
            self.windows.borrow().len()
        }
    }

    impl StatementExtractor for ScriptedExtractor {
        async fn extract(
            &self,
            _report: &SourceReport,
            _statement: StatementType,
            window: Option<&BTreeSet<u32>>,
        ) -> Result<Vec<ExtractedRecord>, ExtractError> {
            self.windows.borrow_mut().push(window.cloned());
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(ExtractError::NoData("script exhausted".to_string())))
        }
    }

    fn report() -> SourceReport {
        SourceReport::new("TST", 2024)
    }

    fn cash(year: u32, ending_cash: f64) -> ExtractedRecord {
        ExtractedRecord::new(
            StatementType::CashFlowStatement,
            year,
            report().file_name,
            BTreeMap::from([("Cash and cash equivalents".to_string(), ending_cash)]),
        )
    }

    #[tokio::test]
    async fn test_unit_failing_every_attempt_ends_terminal() {
        let extractor = ScriptedExtractor::new(vec![
            Ok(vec![cash(2024, -1.0)]),
            Ok(vec![cash(2024, 0.0)]),
            Ok(vec![cash(2024, -3.0)]),
            Ok(vec![cash(2024, 50.0)]), // never requested
        ]);
        let validator = Validator::new(2.0);
        let controller = RetryController::new(&extractor, &validator, 2);
        let outcome = controller
            .run(&report(), StatementType::CashFlowStatement, Vec::new(), &BTreeSet::new(), &BTreeSet::new())
            .await;

        assert_eq!(extractor.calls(), 3);
        assert_eq!(outcome.units.len(), 1);
        let unit = &outcome.units[0];
        assert!(unit.is_terminal_failure());
        assert_eq!(unit.attempts, 3);
        assert_eq!(unit.record.as_ref().unwrap().status, RecordStatus::Failed);
        assert_eq!(outcome.valid_records().count(), 0);
    }

    #[tokio::test]
    async fn test_unit_valid_on_last_allowed_attempt() {
        let extractor = ScriptedExtractor::new(vec![
            Ok(vec![cash(2024, -1.0)]),
            Err(ExtractError::NoData("empty completion".to_string())),
            Ok(vec![cash(2024, 12.0)]),
        ]);
        let validator = Validator::new(2.0);
        let controller = RetryController::new(&extractor, &validator, 2);
        let outcome = controller
            .run(&report(), StatementType::CashFlowStatement, Vec::new(), &BTreeSet::new(), &BTreeSet::new())
            .await;

        let unit = &outcome.units[0];
        assert!(unit.is_valid());
        assert_eq!(unit.attempts, 3);
        let valid: Vec<_> = outcome.valid_records().collect();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].status, RecordStatus::Valid);
        assert_eq!(valid[0].line_items["Cash and cash equivalents"], 12.0);
    }

    #[tokio::test]
    async fn test_only_failed_years_are_re_requested() {
        let extractor = ScriptedExtractor::new(vec![
            Ok(vec![cash(2024, 10.0), cash(2023, -4.0)]),
            Ok(vec![cash(2024, 999.0), cash(2023, 8.0)]),
        ]);
        let validator = Validator::new(2.0);
        let controller = RetryController::new(&extractor, &validator, 2);
        let outcome = controller
            .run(&report(), StatementType::CashFlowStatement, Vec::new(), &BTreeSet::new(), &BTreeSet::new())
            .await;

        let windows = extractor.windows.borrow();
        assert_eq!(windows[0], None);
        assert_eq!(windows[1], Some(BTreeSet::from([2023])));

        let by_year: BTreeMap<u32, &Unit> = outcome.units.iter().map(|u| (u.key.fiscal_year, u)).collect();
        assert!(by_year[&2023].is_valid());
        assert_eq!(by_year[&2023].attempts, 2);
        // The VALID 2024 record is not replaced by the retry response.
        assert_eq!(by_year[&2024].attempts, 1);
        assert_eq!(by_year[&2024].record.as_ref().unwrap().line_items["Cash and cash equivalents"], 10.0);
    }

    #[tokio::test]
    async fn test_pair_with_no_data_contributes_nothing() {
        let extractor = ScriptedExtractor::new(vec![Ok(vec![]), Ok(vec![])]);
        let validator = Validator::new(2.0);
        let controller = RetryController::new(&extractor, &validator, 1);
        let outcome = controller
            .run(&report(), StatementType::CashFlowStatement, Vec::new(), &BTreeSet::new(), &BTreeSet::new())
            .await;
        assert_eq!(extractor.calls(), 2);
        assert!(outcome.units.is_empty());
        assert!(outcome.extraction_error.is_some());
    }

    #[tokio::test]
    async fn test_cached_records_and_flagged_years_skip_initial_call() {
        let extractor = ScriptedExtractor::new(vec![]);
        let validator = Validator::new(2.0);
        let controller = RetryController::new(&extractor, &validator, 2);
        let outcome = controller
            .run(
                &report(),
                StatementType::CashFlowStatement,
                vec![cash(2024, 10.0), cash(2022, 3.0)],
                &BTreeSet::from([2022, 2023]),
                &BTreeSet::new(),
            )
            .await;

        assert_eq!(extractor.calls(), 0);
        assert_eq!(outcome.units.len(), 3);
        let flagged: Vec<u32> = outcome
            .units
            .iter()
            .filter(|u| u.flagged && u.is_terminal_failure())
            .map(|u| u.key.fiscal_year)
            .collect();
        assert_eq!(flagged, vec![2022, 2023]);
        assert_eq!(outcome.valid_records().count(), 1);
    }

    #[tokio::test]
    async fn test_reopened_year_re_extracted_beside_cached_records() {
        let extractor = ScriptedExtractor::new(vec![
            Ok(vec![cash(2023, -2.0)]),
            Ok(vec![cash(2023, 7.0)]),
        ]);
        let validator = Validator::new(2.0);
        let controller = RetryController::new(&extractor, &validator, 1);
        let outcome = controller
            .run(
                &report(),
                StatementType::CashFlowStatement,
                vec![cash(2024, 10.0)],
                &BTreeSet::new(),
                &BTreeSet::from([2023]),
            )
            .await;

        // Only the reopened year is requested, and it gets the whole budget.
        let windows = extractor.windows.borrow();
        assert_eq!(windows.len(), 2);
        assert!(windows.iter().all(|w| w.as_ref() == Some(&BTreeSet::from([2023]))));

        let by_year: BTreeMap<u32, &Unit> = outcome.units.iter().map(|u| (u.key.fiscal_year, u)).collect();
        assert!(by_year[&2024].is_valid());
        assert!(by_year[&2023].is_valid());
        assert_eq!(by_year[&2023].attempts, 2);
        assert!(!by_year[&2023].flagged);
    }

    #[test]
    fn test_foreign_records_are_ignored() {
        let extractor = ScriptedExtractor::new(vec![Ok(vec![
            cash(2024, 10.0),
            ExtractedRecord::new(StatementType::CashFlowStatement, 2023, "OTHER_2024_annual_report.pdf", BTreeMap::new()),
        ])]);
        let validator = Validator::new(2.0);
        let controller = RetryController::new(&extractor, &validator, 0);
        let outcome = tokio_test::block_on(controller.run(
            &report(),
            StatementType::CashFlowStatement,
            Vec::new(),
            &BTreeSet::new(),
            &BTreeSet::new(),
        ));
        assert_eq!(outcome.units.len(), 1);
        assert_eq!(outcome.units[0].key.fiscal_year, 2024);
    }
}

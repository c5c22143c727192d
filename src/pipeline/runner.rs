// src/pipeline/runner.rs
use crate::config::{Company, PipelineConfig};
use crate::extractors::StatementExtractor;
use crate::ir::client;
use crate::pipeline::consolidator::{ConsolidationConflict, Consolidator};
use crate::pipeline::model::{ExtractedRecord, FailureMarker, SourceReport, StatementType};
use crate::pipeline::retry::{PairOutcome, RetryController, UnitState};
use crate::pipeline::schema::{SchemaConflict, SchemaGenerator, SchemaMap, SchemaNormalizer};
use crate::pipeline::validator::Validator;
use crate::storage::CompanyStore;
use crate::utils::AppError;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};

/// Fiscal years whose failure marker was cleared, per (report file, statement).
type Reopened = BTreeMap<(String, StatementType), BTreeSet<u32>>;

/// What one company's run produced.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: usize,
    pub valid_units: usize,
    pub terminal_failures: usize,
    /// (report, statement) pairs that yielded no records at all.
    pub failed_pairs: usize,
    pub schema_conflicts: Vec<SchemaConflict>,
    pub consolidation_conflicts: Vec<ConsolidationConflict>,
    pub rows_written: BTreeMap<StatementType, usize>,
}

/// Finds and downloads the company's annual reports, then lists the ones on
/// disk that match the year filter. Scrape and download failures are logged;
/// whatever is already on disk is still used.
pub async fn acquire_reports(
    company: &Company,
    store: &CompanyStore,
    config: &PipelineConfig,
) -> Result<Vec<SourceReport>, AppError> {
    if config.skip_download {
        tracing::info!("Skipping download, using reports already in {}", store.reports_dir().display());
    } else {
        match client::find_annual_report_links(&company.investor_relations_url, &config.year_filter).await {
            Ok(links) => {
                for (year, url) in links {
                    let report = SourceReport::new(store.ticker(), year);
                    if let Err(e) = client::download_report(&url, &store.report_path(&report)).await {
                        tracing::error!("Failed to download {} report: {}", year, e);
                    }
                }
            }
            Err(e) => tracing::warn!("Could not scrape {}: {}", company.investor_relations_url, e),
        }
    }

    Ok(store.list_reports(&config.year_filter)?)
}

/// Extraction, validation with retry, normalization and consolidation for
/// one company.
pub struct CompanyRunner<'a, E, G> {
    config: &'a PipelineConfig,
    extractor: &'a E,
    generator: &'a G,
    store: &'a CompanyStore,
}

impl<'a, E: StatementExtractor, G: SchemaGenerator> CompanyRunner<'a, E, G> {
    pub fn new(config: &'a PipelineConfig, extractor: &'a E, generator: &'a G, store: &'a CompanyStore) -> Self {
        Self { config, extractor, generator, store }
    }

    pub async fn run(&self, reports: &[SourceReport]) -> Result<RunSummary, AppError> {
        let mut summary = RunSummary { reports: reports.len(), ..Default::default() };

        let reopened = if self.config.retry_failed {
            self.reopen_failed_units(reports)?
        } else {
            BTreeMap::new()
        };

        let valid = self.extract_and_validate(reports, &reopened, &mut summary).await?;
        let schema_map = self.normalize(&valid, &mut summary).await?;

        tracing::info!("Consolidating golden records for {}", self.store.ticker());
        for statement in StatementType::ALL {
            let records = valid.get(&statement).map(Vec::as_slice).unwrap_or_default();
            if records.is_empty() {
                tracing::warn!("No valid {} data for {}. Skipping file creation.", statement, self.store.ticker());
                self.discard_stale_table(statement)?;
                continue;
            }

            let schema = schema_map.statement(statement).cloned().unwrap_or_default();
            let consolidation = Consolidator::new(&schema).consolidate(statement, records, reports);
            summary.consolidation_conflicts.extend(consolidation.conflicts);

            if consolidation.table.is_empty() {
                tracing::warn!("Every {} year was dropped for {}. Skipping file creation.", statement, self.store.ticker());
                self.discard_stale_table(statement)?;
                continue;
            }
            self.store.write_unified_table(&consolidation.table)?;
            summary.rows_written.insert(statement, consolidation.table.rows.len());
        }

        Ok(summary)
    }

    /// Records which fiscal years carry a failure marker, then deletes every
    /// marker. The returned years are re-extracted even when their pair
    /// still has cached VALID records.
    fn reopen_failed_units(&self, reports: &[SourceReport]) -> Result<Reopened, AppError> {
        let mut reopened = Reopened::new();
        for report in reports {
            for statement in StatementType::ALL {
                let years = self.store.flagged_years(report, statement)?;
                if !years.is_empty() {
                    reopened.insert((report.file_name.clone(), statement), years);
                }
            }
        }
        let cleared = self.store.clear_failure_markers()?;
        tracing::info!("Retrying {} previously failed units ({} markers cleared)", reopened.values().map(BTreeSet::len).sum::<usize>(), cleared);
        Ok(reopened)
    }

    /// A table left by an earlier run would no longer match this run's summary.
    fn discard_stale_table(&self, statement: StatementType) -> Result<(), AppError> {
        if self.store.remove_unified_table(statement)? {
            tracing::warn!("Removed stale unified {} table for {}", statement, self.store.ticker());
        }
        Ok(())
    }

    async fn extract_and_validate(
        &self,
        reports: &[SourceReport],
        reopened: &Reopened,
        summary: &mut RunSummary,
    ) -> Result<BTreeMap<StatementType, Vec<ExtractedRecord>>, AppError> {
        let no_years = BTreeSet::new();
        let validator = Validator::new(self.config.tolerance);
        let controller = RetryController::new(self.extractor, &validator, self.config.max_retries);
        let mut valid: BTreeMap<StatementType, Vec<ExtractedRecord>> = BTreeMap::new();

        for report in reports {
            tracing::info!("--- Processing {} (published {}) ---", report.file_name, report.published_year);
            for statement in StatementType::ALL {
                let cached = self.store.load_records(report, statement)?;
                let flagged = self.store.flagged_years(report, statement)?;
                let retry_years = reopened.get(&(report.file_name.clone(), statement)).unwrap_or(&no_years);
                let outcome = controller.run(report, statement, cached, &flagged, retry_years).await;

                if outcome.extraction_error.is_some() {
                    summary.failed_pairs += 1;
                }
                self.persist(&outcome, summary);
                valid.entry(statement).or_default().extend(outcome.valid_records().cloned());
            }
        }
        Ok(valid)
    }

    /// Writes VALID records and terminal-failure markers. Write failures are
    /// logged and do not stop the run.
    fn persist(&self, outcome: &PairOutcome, summary: &mut RunSummary) {
        summary.terminal_failures += outcome.units.iter().filter(|u| u.is_terminal_failure()).count();
        for unit in &outcome.units {
            match &unit.state {
                UnitState::Valid => {
                    summary.valid_units += 1;
                    if let Some(record) = &unit.record {
                        if let Err(e) = self.store.save_record(record) {
                            tracing::error!("Failed to save {}: {}", unit.key, e);
                        }
                    }
                }
                UnitState::TerminalFailed { reason } => {
                    if unit.flagged {
                        continue;
                    }
                    let marker = FailureMarker {
                        unit: unit.key.clone(),
                        attempts: unit.attempts,
                        reason: reason.clone(),
                        marked_at: Utc::now(),
                        last_record: unit.record.clone(),
                    };
                    if let Err(e) = self.store.save_failure_marker(&marker) {
                        tracing::error!("Failed to mark {} as failed: {}", unit.key, e);
                    }
                }
                UnitState::Pending | UnitState::Failed { .. } => {
                    tracing::warn!("{} left in non-terminal state {:?}", unit.key, unit.state);
                }
            }
        }
    }

    async fn normalize(
        &self,
        valid: &BTreeMap<StatementType, Vec<ExtractedRecord>>,
        summary: &mut RunSummary,
    ) -> Result<SchemaMap, AppError> {
        let mut schema_map = match self.store.load_schema_map() {
            Ok(map) => map.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Cached schema map unreadable ({}); building a new one", e);
                SchemaMap::default()
            }
        };

        let normalizer = SchemaNormalizer::new(self.generator);
        for (statement, records) in valid {
            let raw_labels: BTreeSet<String> = records
                .iter()
                .flat_map(|r| r.line_items.keys().cloned())
                .collect();
            if raw_labels.is_empty() {
                continue;
            }
            let normalization = normalizer
                .normalize(*statement, &raw_labels, schema_map.statement(*statement))
                .await;
            summary.schema_conflicts.extend(normalization.conflicts);
            if normalization.schema.is_empty() {
                tracing::warn!("{}: schema is empty after normalization", statement);
            } else {
                tracing::info!("{}: {} raw labels mapped", statement, normalization.schema.len());
            }
            schema_map.set_statement(*statement, normalization.schema);
        }

        self.store.save_schema_map(&schema_map)?;
        Ok(schema_map)
    }
}

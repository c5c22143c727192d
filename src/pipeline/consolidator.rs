// src/pipeline/consolidator.rs
use crate::pipeline::model::{
    order_by_recency, ExtractedRecord, GoldenRecordTable, GoldenRow, RecordStatus, SourceReport, StatementType,
};
use crate::pipeline::schema::StatementSchema;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Two raw labels of one record translated to the same canonical label.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{statement} {fiscal_year} ({source_file}): '{first_label}' and '{second_label}' both map to '{canonical}'; year skipped")]
pub struct ConsolidationConflict {
    pub statement: StatementType,
    pub fiscal_year: u32,
    pub source_file: String,
    pub canonical: String,
    pub first_label: String,
    pub second_label: String,
}

#[derive(Debug, Clone)]
pub struct Consolidation {
    pub table: GoldenRecordTable,
    pub conflicts: Vec<ConsolidationConflict>,
}

/// Merges per-year records from several reports into one table, taking each
/// fiscal year whole from the most recently published report that has it.
pub struct Consolidator<'a> {
    schema: &'a StatementSchema,
}

impl<'a> Consolidator<'a> {
    pub fn new(schema: &'a StatementSchema) -> Self {
        Self { schema }
    }

    /// Only VALID records of `statement` are considered; records whose
    /// source file is not in `reports` are ignored.
    pub fn consolidate(
        &self,
        statement: StatementType,
        records: &[ExtractedRecord],
        reports: &[SourceReport],
    ) -> Consolidation {
        let mut by_recency = reports.to_vec();
        order_by_recency(&mut by_recency);

        // Years claimed by a more recent report, including ones later dropped
        // for a label conflict: an older report never fills them in.
        let mut claimed: BTreeSet<u32> = BTreeSet::new();
        let mut rows: BTreeMap<u32, GoldenRow> = BTreeMap::new();
        let mut conflicts = Vec::new();

        for report in &by_recency {
            let mut candidates: Vec<&ExtractedRecord> = records
                .iter()
                .filter(|r| {
                    r.statement_type == statement
                        && r.status == RecordStatus::Valid
                        && r.source_file == report.file_name
                })
                .collect();
            candidates.sort_by_key(|r| r.fiscal_year);

            for record in candidates {
                if !claimed.insert(record.fiscal_year) {
                    tracing::debug!(
                        "{} {}: already taken from a more recent report, discarding {}",
                        statement, record.fiscal_year, record.source_file
                    );
                    continue;
                }

                match self.translate(record) {
                    Ok(values) => {
                        rows.insert(
                            record.fiscal_year,
                            GoldenRow {
                                fiscal_year: record.fiscal_year,
                                source_file: record.source_file.clone(),
                                values,
                            },
                        );
                    }
                    Err(conflict) => {
                        tracing::error!("{}", conflict);
                        conflicts.push(conflict);
                    }
                }
            }
        }

        let columns: BTreeSet<String> = rows.values().flat_map(|r| r.values.keys().cloned()).collect();
        Consolidation {
            table: GoldenRecordTable {
                statement_type: statement,
                columns: columns.into_iter().collect(),
                rows: rows.into_values().collect(),
            },
            conflicts,
        }
    }

    /// Maps every raw label of one record to its canonical label. Any
    /// collision rejects the whole record.
    fn translate(&self, record: &ExtractedRecord) -> Result<BTreeMap<String, f64>, ConsolidationConflict> {
        let mut values = BTreeMap::new();
        let mut origin: BTreeMap<String, &str> = BTreeMap::new();

        for (raw, value) in &record.line_items {
            if self.schema.get(raw).is_none() {
                tracing::info!("{}: '{}' not in schema map, added as its own column", record.statement_type, raw);
            }
            let canonical = self.schema.canonical_for(raw);
            if canonical.is_empty() {
                tracing::warn!("{} {}: label '{}' has no usable column name, skipped", record.statement_type, record.fiscal_year, raw);
                continue;
            }
            if let Some(first) = origin.get(&canonical) {
                return Err(ConsolidationConflict {
                    statement: record.statement_type,
                    fiscal_year: record.fiscal_year,
                    source_file: record.source_file.clone(),
                    canonical,
                    first_label: first.to_string(),
                    second_label: raw.clone(),
                });
            }
            origin.insert(canonical.clone(), raw.as_str());
            values.insert(canonical, *value);
        }
        Ok(values)
    }
}

// src/pipeline/schema.rs
use crate::pipeline::labels::{clean_column_name, label_key, pinned_mappings, KeyFigure};
use crate::pipeline::model::StatementType;
use crate::utils::error::LlmError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Most labels sent to the generator in one call.
const GENERATION_BATCH_SIZE: usize = 150;

/// Raw label key (lowercase, trimmed) -> canonical snake_case label for one
/// statement type. Being a map, each raw label has exactly one canonical label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatementSchema {
    map: BTreeMap<String, String>,
}

impl StatementSchema {
    pub fn get(&self, raw_label: &str) -> Option<&str> {
        self.map.get(&label_key(raw_label)).map(String::as_str)
    }

    /// Canonical label for a raw label, falling back to its snake_case form
    /// when the label was never mapped.
    pub fn canonical_for(&self, raw_label: &str) -> String {
        self.get(raw_label)
            .map(str::to_string)
            .unwrap_or_else(|| clean_column_name(raw_label))
    }

    pub fn insert(&mut self, raw_label: &str, canonical: &str) {
        self.map.insert(label_key(raw_label), canonical.to_string());
    }

    pub fn contains(&self, raw_label: &str) -> bool {
        self.map.contains_key(&label_key(raw_label))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for StatementSchema {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut schema = StatementSchema::default();
        for (raw, canonical) in iter {
            schema.insert(raw.as_ref(), canonical.as_ref());
        }
        schema
    }
}

/// Per-company schema map, persisted as `schema_map.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaMap {
    statements: BTreeMap<StatementType, StatementSchema>,
}

impl SchemaMap {
    pub fn statement(&self, statement: StatementType) -> Option<&StatementSchema> {
        self.statements.get(&statement)
    }

    pub fn set_statement(&mut self, statement: StatementType, schema: StatementSchema) {
        self.statements.insert(statement, schema);
    }
}

/// Accounting terminology passed to the generation call to steer grouping.
#[derive(Debug, Clone)]
pub struct TerminologyHints {
    /// Canonical labels the generator should map onto when it recognises them.
    pub targets: Vec<&'static str>,
    pub notes: Vec<&'static str>,
}

impl TerminologyHints {
    pub fn for_statement(statement: StatementType) -> Self {
        let targets = KeyFigure::for_statement(statement)
            .iter()
            .map(|f| f.canonical())
            .collect();
        Self {
            targets,
            notes: vec![
                "\"Revenues\", \"Revenue\", \"Sales\" and \"Net sales\" are synonyms.",
                "\"Net sales\" and \"Net sales, net of returns\" are not the same item unless context confirms it.",
                "Subtotals and totals are distinct items from their components.",
                "Ending cash maps to the ending cash target only when the label refers to the closing balance.",
                "Do not force unrelated items together; create a new snake_case name instead.",
            ],
        }
    }
}

/// External call that groups raw labels under canonical names.
/// Returns canonical name -> raw label variations.
#[allow(async_fn_in_trait)]
pub trait SchemaGenerator {
    async fn generate(
        &self,
        statement: StatementType,
        labels: &[String],
        hints: &TerminologyHints,
    ) -> Result<BTreeMap<String, Vec<String>>, LlmError>;
}

/// A raw label the generator placed under more than one canonical label.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{statement}: raw label '{label}' maps to several canonical labels ({})", candidates.join(", "))]
pub struct SchemaConflict {
    pub statement: StatementType,
    pub label: String,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Normalization {
    pub schema: StatementSchema,
    pub conflicts: Vec<SchemaConflict>,
}

pub struct SchemaNormalizer<'a, G> {
    generator: &'a G,
}

impl<'a, G: SchemaGenerator> SchemaNormalizer<'a, G> {
    pub fn new(generator: &'a G) -> Self {
        Self { generator }
    }

    /// Builds the schema for one statement type from every raw label observed
    /// for it. Labels already present in `cached` are not sent again.
    pub async fn normalize(
        &self,
        statement: StatementType,
        raw_labels: &BTreeSet<String>,
        cached: Option<&StatementSchema>,
    ) -> Normalization {
        let mut schema = cached.cloned().unwrap_or_default();
        let pinned: BTreeMap<String, &str> = pinned_mappings(statement)
            .into_iter()
            .map(|(raw, canonical)| (label_key(&raw), canonical))
            .collect();
        for (raw, canonical) in &pinned {
            schema.insert(raw, canonical);
        }

        // Keyed by label_key so two spellings differing only in case are sent once.
        let pending: BTreeMap<String, String> = raw_labels
            .iter()
            .filter(|label| !schema.contains(label))
            .map(|label| (label_key(label), label.clone()))
            .collect();

        if pending.is_empty() {
            tracing::debug!("{}: all {} raw labels already mapped", statement, raw_labels.len());
            return Normalization { schema, conflicts: Vec::new() };
        }

        tracing::info!("{}: generating canonical names for {} new raw labels", statement, pending.len());
        let hints = TerminologyHints::for_statement(statement);
        let labels: Vec<String> = pending.values().cloned().collect();

        let Some(candidates) = self.generate_candidates(statement, &labels, &hints, &pending, &pinned).await else {
            tracing::warn!("{}: schema generation failed; using pinned mappings and snake_case fallbacks", statement);
            return Normalization { schema, conflicts: Vec::new() };
        };

        let mut conflicted: Vec<String> = Vec::new();
        for (key, label) in &pending {
            match candidates.get(key) {
                Some(set) if set.len() == 1 => {
                    if let Some(canonical) = set.iter().next() {
                        schema.insert(key, canonical);
                    }
                }
                Some(_) => conflicted.push(label.clone()),
                None => {
                    let fallback = clean_column_name(label);
                    if !fallback.is_empty() {
                        tracing::debug!("{}: '{}' not grouped by generator, using '{}'", statement, label, fallback);
                        schema.insert(key, &fallback);
                    }
                }
            }
        }

        let conflicts = self
            .resolve_conflicts(statement, conflicted, &hints, &candidates, &pinned, &mut schema)
            .await;

        tracing::info!("{}: schema maps {} raw labels ({} conflicts dropped)", statement, schema.len(), conflicts.len());
        Normalization { schema, conflicts }
    }

    /// Re-submits conflicted labels once on their own; whatever is still
    /// ambiguous afterwards is left out of the schema and reported.
    async fn resolve_conflicts(
        &self,
        statement: StatementType,
        conflicted: Vec<String>,
        hints: &TerminologyHints,
        first_pass: &BTreeMap<String, BTreeSet<String>>,
        pinned: &BTreeMap<String, &str>,
        schema: &mut StatementSchema,
    ) -> Vec<SchemaConflict> {
        if conflicted.is_empty() {
            return Vec::new();
        }

        tracing::warn!("{}: {} raw labels were mapped ambiguously, re-submitting", statement, conflicted.len());
        let scope: BTreeMap<String, String> = conflicted.iter().map(|l| (label_key(l), l.clone())).collect();
        let second_pass = self
            .generate_candidates(statement, &conflicted, hints, &scope, pinned)
            .await
            .unwrap_or_default();

        let mut conflicts = Vec::new();
        for label in conflicted {
            let key = label_key(&label);
            match second_pass.get(&key) {
                Some(set) if set.len() == 1 => {
                    if let Some(canonical) = set.iter().next() {
                        schema.insert(&key, canonical);
                    }
                }
                other => {
                    let candidates = other.or_else(|| first_pass.get(&key)).cloned().unwrap_or_default();
                    let conflict = SchemaConflict {
                        statement,
                        label,
                        candidates: candidates.into_iter().collect(),
                    };
                    tracing::error!("{}", conflict);
                    conflicts.push(conflict);
                }
            }
        }
        conflicts
    }

    /// Calls the generator in batches and inverts its output into
    /// raw key -> set of canonical candidates, restricted to `scope`.
    /// Returns `None` only if every batch failed.
    async fn generate_candidates(
        &self,
        statement: StatementType,
        labels: &[String],
        hints: &TerminologyHints,
        scope: &BTreeMap<String, String>,
        pinned: &BTreeMap<String, &str>,
    ) -> Option<BTreeMap<String, BTreeSet<String>>> {
        let mut candidates: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut any_ok = false;

        for batch in labels.chunks(GENERATION_BATCH_SIZE) {
            let groups = match self.generator.generate(statement, batch, hints).await {
                Ok(groups) => groups,
                Err(e) => {
                    tracing::warn!("{}: schema generation call failed: {}", statement, e);
                    continue;
                }
            };
            any_ok = true;

            for (canonical, variations) in groups {
                let canonical = clean_column_name(&canonical);
                if canonical.is_empty() {
                    continue;
                }
                for variation in variations {
                    let key = label_key(&variation);
                    // Pinned mappings are never overridden.
                    if pinned.contains_key(&key) || !scope.contains_key(&key) {
                        continue;
                    }
                    candidates.entry(key).or_default().insert(canonical.clone());
                }
            }
        }

        any_ok.then_some(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Replays canned responses, one per call.
    struct ScriptedGenerator {
        responses: RefCell<Vec<Result<BTreeMap<String, Vec<String>>, LlmError>>>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<Result<BTreeMap<String, Vec<String>>, LlmError>>) -> Self {
            Self { responses: RefCell::new(responses), calls: RefCell::new(Vec::new()) }
        }
    }

    impl SchemaGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            _statement: StatementType,
            labels: &[String],
            _hints: &TerminologyHints,
        ) -> Result<BTreeMap<String, Vec<String>>, LlmError> {
            self.calls.borrow_mut().push(labels.to_vec());
            let mut responses = self.responses.borrow_mut();
            if responses.is_empty() {
                return Ok(BTreeMap::new());
            }
            responses.remove(0)
        }
    }

    fn groups(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(c, vs)| (c.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    fn labels(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_pinned_labels_are_not_sent_or_overridden() {
        let generator = ScriptedGenerator::new(vec![Ok(groups(&[
            ("turnover_total", &["Sales"]),
            ("Cost of Sales", &["Cost of goods sold", "Cost of sales"]),
        ]))]);
        let normalizer = SchemaNormalizer::new(&generator);
        let result = normalizer
            .normalize(
                StatementType::IncomeStatement,
                &labels(&["Sales", "Cost of goods sold", "Cost of sales"]),
                None,
            )
            .await;

        assert_eq!(generator.calls.borrow().len(), 1);
        assert!(!generator.calls.borrow()[0].contains(&"Sales".to_string()));
        assert_eq!(result.schema.get("Sales"), Some("sales"));
        assert_eq!(result.schema.get("cost of goods sold"), Some("cost_of_sales"));
        assert_eq!(result.schema.get("Cost of sales"), Some("cost_of_sales"));
        assert!(result.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_ambiguous_label_resubmitted_then_dropped() {
        let generator = ScriptedGenerator::new(vec![
            Ok(groups(&[
                ("other_income", &["Other items", "Interest income"]),
                ("other_expenses", &["Other items"]),
            ])),
            Ok(groups(&[("a", &["Other items"]), ("b", &["Other items"])])),
        ]);
        let normalizer = SchemaNormalizer::new(&generator);
        let result = normalizer
            .normalize(StatementType::IncomeStatement, &labels(&["Other items", "Interest income"]), None)
            .await;

        assert_eq!(generator.calls.borrow().len(), 2);
        assert_eq!(generator.calls.borrow()[1], vec!["Other items".to_string()]);
        assert_eq!(result.schema.get("Interest income"), Some("other_income"));
        assert_eq!(result.schema.get("Other items"), None);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].label, "Other items");
        assert_eq!(result.conflicts[0].candidates, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_conflict_resolved_on_resubmission() {
        let generator = ScriptedGenerator::new(vec![
            Ok(groups(&[("x", &["Finance costs"]), ("y", &["Finance costs"])])),
            Ok(groups(&[("financial_expenses", &["Finance costs"])])),
        ]);
        let normalizer = SchemaNormalizer::new(&generator);
        let result = normalizer
            .normalize(StatementType::IncomeStatement, &labels(&["Finance costs"]), None)
            .await;
        assert!(result.conflicts.is_empty());
        assert_eq!(result.schema.get("finance costs"), Some("financial_expenses"));
    }

    #[tokio::test]
    async fn test_cached_labels_skip_generation() {
        let generator = ScriptedGenerator::new(vec![]);
        let cached: StatementSchema = [("gross profit", "gross_profit")].into_iter().collect();
        let normalizer = SchemaNormalizer::new(&generator);
        let result = normalizer
            .normalize(StatementType::IncomeStatement, &labels(&["Gross profit", "Net income"]), Some(&cached))
            .await;
        assert!(generator.calls.borrow().is_empty());
        assert_eq!(result.schema.get("Gross profit"), Some("gross_profit"));
        assert_eq!(result.schema.get("Net income"), Some("net_income"));
    }

    #[tokio::test]
    async fn test_generation_failure_degrades_to_fallback() {
        let generator = ScriptedGenerator::new(vec![Err(LlmError::Empty("length".to_string()))]);
        let normalizer = SchemaNormalizer::new(&generator);
        let result = normalizer
            .normalize(StatementType::BalanceSheet, &labels(&["Goodwill", "Total assets"]), None)
            .await;
        assert!(result.conflicts.is_empty());
        assert_eq!(result.schema.get("Goodwill"), None);
        assert_eq!(result.schema.canonical_for("Goodwill"), "goodwill");
        assert_eq!(result.schema.get("Total assets"), Some("total_assets"));
    }

    #[tokio::test]
    async fn test_distinct_cash_rows_keep_distinct_columns() {
        let generator = ScriptedGenerator::new(vec![]);
        let normalizer = SchemaNormalizer::new(&generator);
        let result = normalizer
            .normalize(
                StatementType::CashFlowStatement,
                &labels(&[
                    "Cash and cash equivalents",
                    "Cash and cash equivalents at the end of the year",
                    "Cash and cash equivalents at the beginning of the year",
                ]),
                None,
            )
            .await;

        assert!(result.conflicts.is_empty());
        assert_eq!(result.schema.get("Cash and cash equivalents"), Some("cash_and_cash_equivalents"));
        assert_eq!(
            result.schema.get("Cash and cash equivalents at the end of the year"),
            Some("cash_and_cash_equivalents_at_the_end_of_the_year")
        );
        assert_eq!(
            result.schema.get("Cash and cash equivalents at the beginning of the year"),
            Some("cash_and_cash_equivalents_at_the_beginning_of_the_year")
        );
    }

    #[test]
    fn test_schema_map_json_layout() {
        let mut map = SchemaMap::default();
        map.set_statement(
            StatementType::CashFlowStatement,
            [("Cash and cash equivalents", "cash_and_cash_equivalents_at_the_end_of_the_year")]
                .into_iter()
                .collect(),
        );
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(
            json["cash_flow_statement"]["cash and cash equivalents"],
            "cash_and_cash_equivalents_at_the_end_of_the_year"
        );
    }
}

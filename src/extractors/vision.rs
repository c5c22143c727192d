// src/extractors/vision.rs
use crate::extractors::parse::records_from_response;
use crate::extractors::pdf::{self, CandidatePage};
use crate::extractors::StatementExtractor;
use crate::llm::models::{ChatMessage, ContentPart};
use crate::llm::OpenAiClient;
use crate::pipeline::model::{ExtractedRecord, SourceReport, StatementType};
use crate::utils::error::ExtractError;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

const MAX_CANDIDATES: usize = 30;
const LOCATE_MAX_TOKENS: u32 = 150;
const EXTRACT_MAX_TOKENS: u32 = 4096;

/// 1-based page of each consolidated statement in one report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatementPages {
    pub income: Option<usize>,
    pub balance: Option<usize>,
    pub cash_flow: Option<usize>,
    pub page_count: usize,
}

impl StatementPages {
    pub fn get(&self, statement: StatementType) -> Option<usize> {
        match statement {
            StatementType::IncomeStatement => self.income,
            StatementType::BalanceSheet => self.balance,
            StatementType::CashFlowStatement => self.cash_flow,
        }
    }

    fn is_complete(&self) -> bool {
        self.income.is_some() && self.balance.is_some() && self.cash_flow.is_some()
    }

    /// Reads `{"income_statement": 12, "balance_sheet": 14, "cash_flow_statement": null}`.
    /// Pages outside the document are treated as not found.
    pub fn from_response(value: &serde_json::Value, page_count: usize) -> Self {
        let page = |key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_u64())
                .map(|p| p as usize)
                .filter(|p| (1..=page_count).contains(p))
        };
        Self {
            income: page("income_statement"),
            balance: page("balance_sheet"),
            cash_flow: page("cash_flow_statement"),
            page_count,
        }
    }
}

fn locate_prompt(candidates: &[CandidatePage]) -> String {
    let mut prompt = format!(
        r#"Below are excerpts from {} pages of an annual report. Each mentions financial statement keywords.

Identify which pages contain the actual CONSOLIDATED financial statements with full data tables.

Requirements:
- Look for "Consolidated Income Statement" (or "Statement of Operations")
- Look for "Consolidated Balance Sheet" (or "Statement of Financial Position")
- Look for "Consolidated Cash Flow Statement" (or "Statement of Cash Flows")
- Ignore Table of Contents pages, summaries, or references to statements
- Choose pages with actual multi-year data tables, not just mentions

Return a JSON object with exactly 3 keys:
{{
  "income_statement": <page_number>,
  "balance_sheet": <page_number>,
  "cash_flow_statement": <page_number>
}}

If you cannot find a statement, use null for that key.

Pages to analyze:"#,
        candidates.len()
    );
    for candidate in candidates.iter().take(MAX_CANDIDATES) {
        prompt.push_str(&format!("\n\n--- Page {} ---\n{}", candidate.page, candidate.snippet));
    }
    prompt
}

fn extract_prompt(statement: StatementType, window: Option<&BTreeSet<u32>>) -> String {
    let scope = match window {
        Some(years) => format!(
            "\n- Only extract the columns for these fiscal years: {}.",
            years.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
        ),
        None => String::new(),
    };
    let title = statement.title();

    format!(
        r#"You are a precise data extraction tool. Extract the **{title}** from the provided images of an annual report.

Step 1: Locate the main table for the {title}. It may carry an alternative title such as "Statement of Operations", "Statement of Financial Position" or "Statement of Cash Flows".
Step 2: The columns of the table are the years (e.g. "2024", "2023"); the rows are the line items.
Step 3: For every line item, extract the numerical value for each year.{scope}
Step 4: Return a single JSON object whose top-level keys are the years as strings and whose values map each line item to its number.

Formatting rules:
- Numbers only: no currency symbols, thousands separators or letters.
- Negative numbers use a minus sign (e.g. -44522), not parentheses.
- Use the exact line item names as they appear in the image.

Example:
{{
  "2024": {{ "Net sales": 290403, "Cost of goods sold": -44522 }},
  "2023": {{ "Net sales": 232261, "Cost of goods sold": -35765 }}
}}"#
    )
}

/// Extraction collaborator backed by poppler rendering and a vision model.
pub struct PdfVisionExtractor<'a> {
    llm: &'a OpenAiClient,
    reports_dir: PathBuf,
    /// Located pages per report file; only complete locations are kept.
    located: Mutex<HashMap<String, StatementPages>>,
}

impl<'a> PdfVisionExtractor<'a> {
    pub fn new(llm: &'a OpenAiClient, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            llm,
            reports_dir: reports_dir.into(),
            located: Mutex::new(HashMap::new()),
        }
    }

    fn cached_pages(&self, file_name: &str) -> Option<StatementPages> {
        self.located.lock().ok().and_then(|m| m.get(file_name).copied())
    }

    async fn statement_pages(&self, report: &SourceReport) -> Result<StatementPages, ExtractError> {
        if let Some(pages) = self.cached_pages(&report.file_name) {
            return Ok(pages);
        }

        let path = self.reports_dir.join(&report.file_name);
        let texts = pdf::page_texts(&path).await?;
        let candidates = pdf::candidate_pages(&texts);
        tracing::debug!("Found {} candidate pages mentioning financial statements", candidates.len());
        if candidates.is_empty() {
            return Ok(StatementPages { page_count: texts.len(), ..Default::default() });
        }

        let value = self
            .llm
            .complete_json(ChatMessage::user_text(locate_prompt(&candidates)), LOCATE_MAX_TOKENS)
            .await?;
        let pages = StatementPages::from_response(&value, texts.len());
        tracing::info!(
            "Located statements in {}: income {:?}, balance {:?}, cash flow {:?}",
            report.file_name, pages.income, pages.balance, pages.cash_flow
        );

        if pages.is_complete() {
            if let Ok(mut located) = self.located.lock() {
                located.insert(report.file_name.clone(), pages);
            }
        }
        Ok(pages)
    }
}

impl StatementExtractor for PdfVisionExtractor<'_> {
    async fn extract(
        &self,
        report: &SourceReport,
        statement: StatementType,
        window: Option<&BTreeSet<u32>>,
    ) -> Result<Vec<ExtractedRecord>, ExtractError> {
        let pages = self.statement_pages(report).await?;
        let page = pages
            .get(statement)
            .ok_or_else(|| ExtractError::NoStatementPages(statement.title().to_string()))?;

        let (first, last) = pdf::page_window(page, pages.page_count);
        tracing::debug!("Extracting {} from pages {} to {} of {}", statement, first, last, report.file_name);
        let images = pdf::render_pages_base64(&self.reports_dir.join(&report.file_name), first, last).await?;

        let mut parts = vec![ContentPart::text(extract_prompt(statement, window))];
        parts.extend(images.iter().map(|img| ContentPart::jpeg_base64(img)));

        let value = self.llm.complete_json(ChatMessage::user(parts), EXTRACT_MAX_TOKENS).await?;
        let records = records_from_response(&value, statement, &report.file_name, window);
        if records.is_empty() {
            return Err(ExtractError::NoData(format!("{} response had no usable years", statement)));
        }

        tracing::info!("Extracted {} {} years from {}", records.len(), statement, report.file_name);
        Ok(records)
    }
}

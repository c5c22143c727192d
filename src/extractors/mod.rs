// src/extractors/mod.rs
pub mod parse;
pub mod pdf;
pub mod vision;

use crate::pipeline::model::{ExtractedRecord, SourceReport, StatementType};
use crate::utils::error::ExtractError;
use std::collections::BTreeSet;

/// Produces per-year records for one statement of one report. May be called
/// again for the same pair with a narrower `window` of fiscal years.
#[allow(async_fn_in_trait)]
pub trait StatementExtractor {
    async fn extract(
        &self,
        report: &SourceReport,
        statement: StatementType,
        window: Option<&BTreeSet<u32>>,
    ) -> Result<Vec<ExtractedRecord>, ExtractError>;
}

// Re-export key extraction types for convenience
pub use vision::PdfVisionExtractor;

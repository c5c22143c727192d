// src/config.rs
use crate::utils::AppError;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_YEAR_PATTERN: &str = r"\b(201[5-9]|202[0-4])\b";

/// One company to process.
#[derive(Debug, Clone, Deserialize)]
pub struct Company {
    pub name: String,
    pub ticker: String,
    pub investor_relations_url: String,
}

/// Reads a JSON array of companies.
pub fn load_companies(path: &Path) -> Result<Vec<Company>, AppError> {
    let text = std::fs::read_to_string(path)?;
    let companies: Vec<Company> = serde_json::from_str(&text)
        .map_err(|e| AppError::Config(format!("Invalid companies file {}: {}", path.display(), e)))?;
    if companies.is_empty() {
        return Err(AppError::Config(format!("No companies listed in {}", path.display())));
    }
    Ok(companies)
}

/// Validated knobs consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Extra extraction attempts per failed unit.
    pub max_retries: u32,
    /// Balance-sheet equation slack.
    pub tolerance: f64,
    /// Which publication years are eligible.
    pub year_filter: Regex,
    pub skip_download: bool,
    pub retry_failed: bool,
}

impl PipelineConfig {
    pub fn new(
        max_retries: u32,
        tolerance: f64,
        year_pattern: &str,
        skip_download: bool,
        retry_failed: bool,
    ) -> Result<Self, AppError> {
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(AppError::Config(format!("Tolerance must be a non-negative number, got {}", tolerance)));
        }
        let year_filter = Regex::new(year_pattern)
            .map_err(|e| AppError::Config(format!("Invalid year pattern '{}': {}", year_pattern, e)))?;
        Ok(Self { max_retries, tolerance, year_filter, skip_download, retry_failed })
    }
}

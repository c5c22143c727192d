// src/utils/error.rs
use thiserror::Error;

// Define specific error types for different parts of the application
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error), // Automatically convert reqwest errors

    #[error("HTTP error: {0}")]
    Http(reqwest::StatusCode), // e.g., 404 Not Found, 403 Forbidden

    #[error("Invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("I/O error while saving report: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("LLM API returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("LLM API returned an empty response (finish reason: {0})")]
    Empty(String),

    #[error("Could not parse LLM response as JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The extraction collaborator returned no usable data for a unit.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("PDF tool '{tool}' failed: {message}")]
    PdfTool { tool: &'static str, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Could not locate the {0} pages in the report")]
    NoStatementPages(String),

    #[error("No usable data returned: {0}")]
    NoData(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error), // Automatically convert IO errors

    #[error("Report acquisition failed: {0}")]
    Scrape(#[from] ScrapeError),

    #[error("LLM client setup failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

// src/extractors/pdf.rs
//! Thin wrappers over poppler's `pdftotext` and `pdftoppm`.

use crate::utils::error::ExtractError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::Path;
use tempfile::TempDir;
use tokio::process::Command;

const RENDER_DPI: u32 = 100;
const SNIPPET_CHARS: usize = 1500;
const STATEMENT_KEYWORDS: &[&str] = &[
    "income statement",
    "balance sheet",
    "cash flow",
    "financial position",
    "statement of operations",
];

/// A page that mentions a financial statement, with the start of its text.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePage {
    /// 1-based page number.
    pub page: usize,
    pub snippet: String,
}

/// Text of every page, in order. `pdftotext` separates pages with form feeds.
pub async fn page_texts(pdf_path: &Path) -> Result<Vec<String>, ExtractError> {
    let output = Command::new("pdftotext")
        .arg("-layout")
        .arg(pdf_path)
        .arg("-")
        .output()
        .await?;

    if !output.status.success() {
        return Err(ExtractError::PdfTool {
            tool: "pdftotext",
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let mut pages: Vec<String> = text.split('\u{c}').map(str::to_string).collect();
    // Trailing form feed leaves an empty last segment.
    if pages.last().is_some_and(|p| p.trim().is_empty()) {
        pages.pop();
    }
    tracing::debug!("Read text of {} pages from {}", pages.len(), pdf_path.display());
    Ok(pages)
}

/// Pages whose text mentions one of the statement keywords.
pub fn candidate_pages(pages: &[String]) -> Vec<CandidatePage> {
    pages
        .iter()
        .enumerate()
        .filter(|(_, text)| {
            let lower = text.to_lowercase();
            STATEMENT_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .map(|(idx, text)| CandidatePage {
            page: idx + 1,
            snippet: text.chars().take(SNIPPET_CHARS).collect(),
        })
        .collect()
}

/// The identified page plus one on each side, clamped to the document.
/// 1-based and inclusive.
pub fn page_window(page: usize, page_count: usize) -> (usize, usize) {
    let first = page.saturating_sub(1).max(1);
    let last = (page + 1).min(page_count.max(1));
    (first.min(last), last)
}

/// Renders pages `first..=last` (1-based) to JPEG and returns them base64
/// encoded, in page order.
pub async fn render_pages_base64(pdf_path: &Path, first: usize, last: usize) -> Result<Vec<String>, ExtractError> {
    let scratch = TempDir::new()?;
    let prefix = scratch.path().join("page");

    let output = Command::new("pdftoppm")
        .arg("-jpeg")
        .arg("-r")
        .arg(RENDER_DPI.to_string())
        .arg("-f")
        .arg(first.to_string())
        .arg("-l")
        .arg(last.to_string())
        .arg(pdf_path)
        .arg(&prefix)
        .output()
        .await?;

    if !output.status.success() {
        return Err(ExtractError::PdfTool {
            tool: "pdftoppm",
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    // pdftoppm zero-pads page numbers to the document's width, so name order is page order.
    let mut files: Vec<_> = std::fs::read_dir(scratch.path())?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "jpg"))
        .collect();
    files.sort();

    let mut images = Vec::with_capacity(files.len());
    for file in files {
        let bytes = tokio::fs::read(&file).await?;
        images.push(BASE64.encode(bytes));
    }

    if images.is_empty() {
        return Err(ExtractError::PdfTool {
            tool: "pdftoppm",
            message: format!("no pages rendered for {}-{}", first, last),
        });
    }
    tracing::debug!("Rendered pages {}-{} of {}", first, last, pdf_path.display());
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_window_clamps() {
        assert_eq!(page_window(1, 10), (1, 2));
        assert_eq!(page_window(5, 10), (4, 6));
        assert_eq!(page_window(10, 10), (9, 10));
        assert_eq!(page_window(1, 1), (1, 1));
    }

    #[test]
    fn test_candidate_pages() {
        let pages = vec![
            "Contents\nLetter from the chair".to_string(),
            "Consolidated Balance Sheet\nTotal assets 100".to_string(),
            "Notes".to_string(),
            "CASH FLOW STATEMENT\n".to_string(),
        ];
        let candidates = candidate_pages(&pages);
        let numbers: Vec<usize> = candidates.iter().map(|c| c.page).collect();
        assert_eq!(numbers, vec![2, 4]);
        assert!(candidates[0].snippet.starts_with("Consolidated Balance Sheet"));
    }
}

// src/ir/client.rs
use crate::ir::links::parse_report_links;
use crate::utils::error::ScrapeError;
use regex::Regex;
use reqwest::{header, Url};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

// Investor-relations sites tend to block obvious bots.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const PAGE_TIMEOUT_SECS: u64 = 10;
// Whole-download budget; annual reports can run to tens of megabytes.
const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
// Be polite between requests to the same site.
const REQUEST_DELAY_MS: u64 = 150;

/// Creates a reqwest client configured for investor-relations sites.
fn build_ir_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(BROWSER_USER_AGENT)
        .connect_timeout(Duration::from_secs(PAGE_TIMEOUT_SECS))
        .build()
}

/// Scrapes an investor-relations page for annual-report PDFs.
/// Returns publication year -> PDF URL for years matching `year_re`.
pub async fn find_annual_report_links(page_url: &str, year_re: &Regex) -> Result<BTreeMap<u32, Url>, ScrapeError> {
    let url = Url::parse(page_url).map_err(|_| ScrapeError::InvalidUrl(page_url.to_string()))?;
    let client = build_ir_client()?;

    tracing::info!("Scraping investor relations page: {}", url);
    let response = client
        .get(url.clone())
        .header(header::ACCEPT, "text/html,application/xhtml+xml,*/*")
        .timeout(Duration::from_secs(PAGE_TIMEOUT_SECS))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        tracing::error!("HTTP error status: {} for URL: {}", status, url);
        return Err(ScrapeError::Http(status));
    }

    // Resolve relative links against the final URL after redirects.
    let final_url = response.url().clone();
    let body = response.text().await?;
    tracing::debug!("Downloaded {} bytes from {}", body.len(), final_url);

    let links = parse_report_links(&body, &final_url, year_re);
    tracing::info!("Found {} annual report links", links.len());
    Ok(links)
}

/// Downloads a report PDF to `save_path`, streaming the body to disk.
/// Does nothing if the file already exists.
pub async fn download_report(url: &Url, save_path: &Path) -> Result<(), ScrapeError> {
    if save_path.exists() {
        tracing::debug!("File '{}' already exists. Skipping download.", save_path.display());
        return Ok(());
    }

    let client = build_ir_client()?;
    tokio::time::sleep(Duration::from_millis(REQUEST_DELAY_MS)).await;

    tracing::info!("Downloading report from: {}", url);
    let response = client
        .get(url.clone())
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        tracing::error!("HTTP error status: {} for URL: {}", status, url);
        return Err(ScrapeError::Http(status));
    }

    // Partial downloads never land at save_path.
    let partial_path = save_path.with_extension("part");
    let streamed = stream_to_file(response, &partial_path).await;
    let written = finish_partial(streamed, &partial_path, save_path).await?;

    tracing::info!("Saved {} bytes to {}", written, save_path.display());
    Ok(())
}

async fn stream_to_file(mut response: reqwest::Response, path: &Path) -> Result<usize, ScrapeError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0usize;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len();
    }
    file.flush().await?;
    Ok(written)
}

/// Moves a completed partial file into place, or deletes it when the
/// download failed midway.
async fn finish_partial(
    streamed: Result<usize, ScrapeError>,
    partial_path: &Path,
    save_path: &Path,
) -> Result<usize, ScrapeError> {
    match streamed {
        Ok(written) => {
            tokio::fs::rename(partial_path, save_path).await?;
            Ok(written)
        }
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(partial_path).await {
                tracing::debug!("Could not remove {}: {}", partial_path.display(), rm);
            }
            tracing::error!("Download to {} failed: {}", save_path.display(), e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("TST_2024_annual_report.part");
        let target = dir.path().join("TST_2024_annual_report.pdf");
        std::fs::write(&partial, b"%PDF-1.7 trunc").unwrap();

        let broken = Err(ScrapeError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection reset")));
        assert!(finish_partial(broken, &partial, &target).await.is_err());
        assert!(!partial.exists());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_completed_download_moved_into_place() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("TST_2024_annual_report.part");
        let target = dir.path().join("TST_2024_annual_report.pdf");
        std::fs::write(&partial, b"%PDF-1.7").unwrap();

        assert_eq!(finish_partial(Ok(8), &partial, &target).await.unwrap(), 8);
        assert!(!partial.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"%PDF-1.7");
    }
}

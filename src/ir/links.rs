// src/ir/links.rs
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use std::collections::BTreeMap;

static LINK_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("Failed to compile LINK_SELECTOR"));

/// Link text or href must contain one of these.
const REPORT_KEYWORDS: &[&str] = &["annual report", "annual-report", "annual_report", "geschäftsbericht", "jahresbericht"];

/// Interim reports that also mention the annual-report keywords.
const EXCLUDE_KEYWORDS: &[&str] = &["half", "halbjahr", "semi-annual", "quarterly", "q1", "q2", "q3", "q4"];

/// Anything that looks like a file download.
fn is_download(href: &str) -> bool {
    href.contains(".pdf") || href.contains("/download/") || href.contains("/amfile/")
}

/// Pulls annual-report PDF links out of an investor-relations page.
///
/// Returns publication year -> absolute URL. The year is the first capture
/// group of `year_re` found in the link text, else in the href. When several
/// links carry the same year the first one in document order wins.
pub fn parse_report_links(html: &str, page_url: &Url, year_re: &Regex) -> BTreeMap<u32, Url> {
    let document = Html::parse_document(html);
    let mut links = BTreeMap::new();

    for element in document.select(&LINK_SELECTOR) {
        let Some(href) = element.value().attr("href") else { continue };
        let href_lower = href.to_lowercase();
        let text = element.text().collect::<String>().trim().to_lowercase();

        if !is_download(&href_lower) {
            continue;
        }
        let has_keyword = REPORT_KEYWORDS.iter().any(|k| text.contains(k) || href_lower.contains(k));
        let has_exclude = EXCLUDE_KEYWORDS.iter().any(|k| text.contains(k) || href_lower.contains(k));
        if !has_keyword || has_exclude {
            continue;
        }

        let year = capture_year(year_re, &text).or_else(|| capture_year(year_re, href));
        let Some(year) = year else {
            tracing::trace!("Report link without a matching year: {}", href);
            continue;
        };
        if links.contains_key(&year) {
            continue;
        }

        match page_url.join(href) {
            Ok(url) => {
                tracing::debug!("Found {}: {}", year, url);
                links.insert(year, url);
            }
            Err(e) => tracing::warn!("Skipping unresolvable link '{}': {}", href, e),
        }
    }

    links
}

fn capture_year(year_re: &Regex, haystack: &str) -> Option<u32> {
    let caps = year_re.captures(haystack)?;
    caps.get(1)
        .or_else(|| caps.get(0))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <ul>
          <li><a href="/media/annual-report-2024.pdf">Annual Report 2024</a></li>
          <li><a href="https://cdn.example.com/reports/AR_2023.pdf">Annual report 2023 (PDF)</a></li>
          <li><a href="/media/half-year-report-2024.pdf">Half-year report 2024</a></li>
          <li><a href="/amfile/9931">Geschäftsbericht 2022</a></li>
          <li><a href="/media/annual-report-2024-summary.pdf">Annual Report 2024 summary</a></li>
          <li><a href="/media/annual-report-2011.pdf">Annual Report 2011</a></li>
          <li><a href="/investors/annual-report">Annual Report overview</a></li>
          <li><a href="/download/q3-annual-report-update-2021.pdf">Q3 update</a></li>
        </ul>
        </body></html>
    "#;

    #[test]
    fn test_parse_report_links() {
        let page = Url::parse("https://www.example.com/investors/publications").unwrap();
        let year_re = Regex::new(r"\b(201[5-9]|202[0-4])\b").unwrap();
        let links = parse_report_links(PAGE, &page, &year_re);

        let years: Vec<u32> = links.keys().copied().collect();
        assert_eq!(years, vec![2022, 2023, 2024]);
        assert_eq!(links[&2024].as_str(), "https://www.example.com/media/annual-report-2024.pdf");
        assert_eq!(links[&2023].as_str(), "https://cdn.example.com/reports/AR_2023.pdf");
        assert_eq!(links[&2022].as_str(), "https://www.example.com/amfile/9931");
    }

    #[test]
    fn test_year_from_href_when_text_has_none() {
        let page = Url::parse("https://ir.example.org/").unwrap();
        let year_re = Regex::new(r"\b(20\d{2})\b").unwrap();
        let html = r#"<a href="files/ar-2020.pdf">Download the annual report</a>"#;
        let links = parse_report_links(html, &page, &year_re);
        assert_eq!(links[&2020].as_str(), "https://ir.example.org/files/ar-2020.pdf");
    }
}

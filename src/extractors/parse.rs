// src/extractors/parse.rs
use crate::pipeline::model::{ExtractedRecord, StatementType};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

static YEAR_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b((?:19|20)\d{2})\b").expect("Failed to compile YEAR_KEY_RE"));

/// Parses an amount the model returned as a string: thousands separators
/// (`,`, `'`, spaces), parenthesised negatives and the unicode minus sign.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let (negative, inner) = match trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };
    let cleaned: String = inner
        .chars()
        .filter(|c| !matches!(c, ',' | '\'' | ' ' | '\u{a0}'))
        .map(|c| if c == '\u{2212}' { '-' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    let value = cleaned.parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some(if negative { -value } else { value })
}

fn parse_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => parse_amount(s),
        _ => None,
    }
}

/// Turns a vision response shaped like
/// `{"2024": {"Net sales": 290403, ...}, "2023": {...}}` into one record per
/// fiscal year. Keys without a year, non-numeric values and empty years are
/// dropped; with a `window` only those fiscal years are kept.
pub fn records_from_response(
    value: &serde_json::Value,
    statement: StatementType,
    source_file: &str,
    window: Option<&BTreeSet<u32>>,
) -> Vec<ExtractedRecord> {
    let Some(years) = value.as_object() else {
        tracing::warn!("{} response from {} is not a JSON object", statement, source_file);
        return Vec::new();
    };

    let mut records: BTreeMap<u32, ExtractedRecord> = BTreeMap::new();
    for (year_key, items) in years {
        let Some(year) = YEAR_KEY_RE
            .captures(year_key)
            .and_then(|caps| caps[1].parse::<u32>().ok())
        else {
            tracing::debug!("Ignoring non-year key '{}' in {} response", year_key, statement);
            continue;
        };
        if window.is_some_and(|w| !w.contains(&year)) || records.contains_key(&year) {
            continue;
        }
        let Some(items) = items.as_object() else {
            tracing::warn!("Corrupt data for {} {} in {}. Skipping.", statement, year, source_file);
            continue;
        };

        let line_items: BTreeMap<String, f64> = items
            .iter()
            .filter_map(|(label, v)| {
                let label = label.trim();
                match parse_value(v) {
                    Some(value) if !label.is_empty() => Some((label.to_string(), value)),
                    _ => None,
                }
            })
            .collect();

        if line_items.is_empty() {
            tracing::warn!("No numeric line items for {} {} in {}", statement, year, source_file);
            continue;
        }
        records.insert(year, ExtractedRecord::new(statement, year, source_file, line_items));
    }

    records.into_values().collect()
}

// src/llm/schema.rs
use crate::llm::client::OpenAiClient;
use crate::llm::models::ChatMessage;
use crate::pipeline::model::StatementType;
use crate::pipeline::schema::{SchemaGenerator, TerminologyHints};
use crate::utils::error::LlmError;
use std::collections::BTreeMap;

const SCHEMA_MAX_TOKENS: u32 = 4096;

fn schema_prompt(statement: StatementType, labels: &[String], hints: &TerminologyHints) -> String {
    let targets = hints
        .targets
        .iter()
        .map(|t| format!("- {}", t))
        .collect::<Vec<_>>()
        .join("\n");
    let notes = hints
        .notes
        .iter()
        .map(|n| format!("- {}", n))
        .collect::<Vec<_>>()
        .join("\n");
    let items = serde_json::to_string_pretty(labels).unwrap_or_else(|_| labels.join("\n"));

    format!(
        r#"Normalize the line items of a {statement} by grouping variations that name the same item. Return snake_case canonical names.

If an item clearly matches one of these canonical names, map it there:
{targets}

Terminology rules:
{notes}

Every item must appear under exactly one canonical name.

Return JSON: {{"canonical_name": ["Variation 1", "variation 2"]}}

Items to normalize:
{items}
"#
    )
}

/// Accepts `{"canonical": ["a", "b"]}` and tolerates a bare string in place
/// of the list. Other shapes are ignored.
pub fn parse_schema_groups(value: &serde_json::Value) -> BTreeMap<String, Vec<String>> {
    let mut groups = BTreeMap::new();
    let Some(object) = value.as_object() else {
        return groups;
    };
    for (canonical, variations) in object {
        let list: Vec<String> = match variations {
            serde_json::Value::Array(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
            serde_json::Value::String(single) => vec![single.clone()],
            _ => continue,
        };
        if !list.is_empty() {
            groups.insert(canonical.clone(), list);
        }
    }
    groups
}

impl SchemaGenerator for OpenAiClient {
    async fn generate(
        &self,
        statement: StatementType,
        labels: &[String],
        hints: &TerminologyHints,
    ) -> Result<BTreeMap<String, Vec<String>>, LlmError> {
        tracing::debug!("Sending {} {} labels to schema generation", labels.len(), statement);
        let prompt = schema_prompt(statement, labels, hints);
        let value = self.complete_json(ChatMessage::user_text(prompt), SCHEMA_MAX_TOKENS).await?;
        let groups = parse_schema_groups(&value);
        tracing::debug!("Schema generation returned {} canonical groups", groups.len());
        Ok(groups)
    }
}

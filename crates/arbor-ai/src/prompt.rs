//! Prompt construction and response parsing for enrichment

use std::collections::BTreeMap;

use serde_json::Value;

use crate::bridge::AnalysisSummary;

/// Numeric metrics of every analyzer outcome, keyed `analyzer_field` or
/// `analyzer_group_field` for one level of nesting.
pub fn extract_key_metrics(outcomes: &BTreeMap<String, Value>) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();
    for (analyzer, outcome) in outcomes {
        let Some(fields) = outcome.as_object() else {
            continue;
        };
        if fields.contains_key("error") {
            continue;
        }
        for (key, value) in fields {
            match value {
                Value::Number(n) => {
                    if let Some(n) = n.as_f64() {
                        metrics.insert(format!("{}_{}", analyzer, key), n);
                    }
                }
                Value::Object(group) => {
                    for (inner, value) in group {
                        if let Some(n) = value.as_f64() {
                            metrics.insert(format!("{}_{}_{}", analyzer, key, inner), n);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    metrics
}

/// Generate the prompt sent to a text-generation backend.
pub fn enrichment_prompt(summaries: &[AnalysisSummary]) -> String {
    let summary: Vec<Value> = summaries
        .iter()
        .map(|s| {
            serde_json::json!({
                "task": s.task_id,
                "operation": s.operation,
                "key_metrics": extract_key_metrics(&s.outcomes),
            })
        })
        .collect();
    let rendered = serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "[]".to_string());

    format!(
        r#"Analyze these code changes and provide insights:
{}

Please provide:
1. Key architectural impacts
2. Potential issues or risks
3. Optimization recommendations
4. Best practice suggestions"#,
        rendered
    )
}

/// Split a free-form response into insights and recommendations.
///
/// A line mentioning "insight" or "impact" opens the insights section, one
/// mentioning "recommend" or "suggest" opens the recommendations section.
/// Other non-empty lines belong to the open section; lines before any section are ignored.
pub fn parse_response(response: &str) -> (Vec<String>, Vec<String>) {
    #[derive(Clone, Copy)]
    enum Section {
        Insights,
        Recommendations,
    }

    let mut insights = Vec::new();
    let mut recommendations = Vec::new();
    let mut section = None;

    for line in response.lines() {
        let lower = line.to_lowercase();
        if lower.contains("insight") || lower.contains("impact") {
            section = Some(Section::Insights);
        } else if lower.contains("recommend") || lower.contains("suggest") {
            section = Some(Section::Recommendations);
        } else {
            let item = strip_marker(line);
            if item.is_empty() {
                continue;
            }
            match section {
                Some(Section::Insights) => insights.push(item.to_string()),
                Some(Section::Recommendations) => recommendations.push(item.to_string()),
                None => {}
            }
        }
    }

    (insights, recommendations)
}

/// Drop list markers such as `-`, `*` or `2.`.
fn strip_marker(line: &str) -> &str {
    let trimmed = line.trim();
    let without_bullet = trimmed.trim_start_matches(['-', '*', '•']).trim_start();
    let digits = without_bullet.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        if let Some(rest) = without_bullet[digits..].strip_prefix(['.', ')']) {
            return rest.trim();
        }
    }
    without_bullet.trim()
}

//! Turns backend payloads into readable text, keyed by external tool name.
//! Unknown tools and unexpected shapes fall back to pretty-printed JSON.

use serde_json::{Map, Value};
use std::fmt::Write;

pub const ROW_CAP: usize = 20;
pub const NO_RESULTS: &str = "No results found.";

pub fn format_result(tool: &str, result: &Value) -> String {
    let rendered = match tool {
        "quarri_generate_sql" | "quarri_explain_sql" => render_sql(result),
        "quarri_execute_sql" | "quarri_search_values" => render_rows(result),
        "quarri_get_schema" => render_schema(result),
        "quarri_query_agent" | "quarri_analyze" | "quarri_get_statistics" => render_analysis(result),
        _ => None,
    };
    rendered.unwrap_or_else(|| pretty_json(result))
}

pub fn pretty_json(v: &Value) -> String {
    let trimmed = match v {
        Value::Object(m) if m.contains_key("success") => Value::Object(
            m.iter()
                .filter(|(k, _)| k.as_str() != "success")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    };
    serde_json::to_string_pretty(&trimmed).unwrap_or_else(|_| v.to_string())
}

fn str_field<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

fn render_sql(v: &Value) -> Option<String> {
    let sql = str_field(v, &["sql", "generated_sql", "query"]);
    let explanation = str_field(v, &["explanation", "description"]);
    if sql.is_none() && explanation.is_none() {
        return None;
    }
    let mut out = String::new();
    if let Some(sql) = sql {
        let _ = write!(out, "```sql\n{}\n```", sql.trim());
    }
    if let Some(text) = explanation {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(text.trim());
    }
    Some(out)
}

/// Finds a row set either at the top level or under `data`.
fn rows_of(v: &Value) -> Option<(&Vec<Value>, Option<&Vec<Value>>)> {
    if let Some(rows) = v.as_array() {
        return Some((rows, None));
    }
    let columns = v.get("columns").and_then(Value::as_array);
    for key in ["rows", "data", "results", "values"] {
        match v.get(key) {
            Some(Value::Array(rows)) => return Some((rows, columns)),
            Some(inner) if inner.is_object() => {
                if let Some((rows, inner_cols)) = rows_of(inner) {
                    return Some((rows, inner_cols.or(columns)));
                }
            }
            _ => {}
        }
    }
    None
}

fn render_rows(v: &Value) -> Option<String> {
    let (rows, columns) = rows_of(v)?;
    Some(render_table(rows, columns))
}

pub fn render_table(rows: &[Value], columns: Option<&Vec<Value>>) -> String {
    if rows.is_empty() {
        return NO_RESULTS.to_string();
    }

    let columns: Vec<String> = match columns {
        Some(cols) if !cols.is_empty() => cols
            .iter()
            .map(|c| match c {
                Value::String(s) => s.clone(),
                other => str_field(other, &["name", "column_name"])
                    .map(String::from)
                    .unwrap_or_else(|| other.to_string()),
            })
            .collect(),
        _ => match &rows[0] {
            Value::Object(m) => m.keys().cloned().collect(),
            Value::Array(a) => (1..=a.len()).map(|i| format!("col{i}")).collect(),
            _ => vec!["value".to_string()],
        },
    };

    let mut out = String::new();
    let _ = writeln!(out, "| {} |", columns.iter().map(|c| escape_cell(c)).collect::<Vec<_>>().join(" | "));
    let _ = writeln!(out, "|{}", " --- |".repeat(columns.len()));

    for row in rows.iter().take(ROW_CAP) {
        let cells: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, name)| match row {
                Value::Object(m) => cell(m.get(name)),
                Value::Array(a) => cell(a.get(i)),
                scalar if i == 0 => cell(Some(scalar)),
                _ => String::new(),
            })
            .collect();
        let _ = writeln!(out, "| {} |", cells.join(" | "));
    }

    if rows.len() > ROW_CAP {
        let _ = write!(out, "\n... and {} more rows ({} total)", rows.len() - ROW_CAP, rows.len());
    }
    out.trim_end().to_string()
}

fn cell(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => "NULL".to_string(),
        Some(Value::String(s)) => escape_cell(s),
        Some(other) => escape_cell(&other.to_string()),
    }
}

fn escape_cell(s: &str) -> String {
    s.replace('|', "\\|").replace(['\n', '\r'], " ")
}

fn render_schema(v: &Value) -> Option<String> {
    let schema = v.get("schema").or_else(|| v.get("tables"))?;
    let mut out = String::new();

    match schema {
        Value::Object(tables) => {
            for (table, columns) in tables {
                push_table(&mut out, table, columns);
            }
        }
        Value::Array(tables) => {
            for t in tables {
                match t {
                    Value::String(name) => push_table(&mut out, name, &Value::Null),
                    other => {
                        let name = str_field(other, &["table_name", "name", "table"]).unwrap_or("?");
                        push_table(&mut out, name, other.get("columns").unwrap_or(&Value::Null));
                    }
                }
            }
        }
        _ => return None,
    }

    if out.is_empty() {
        return Some("No tables found.".to_string());
    }
    Some(out.trim_end().to_string())
}

fn push_table(out: &mut String, table: &str, columns: &Value) {
    let _ = writeln!(out, "- **{table}**");
    match columns {
        Value::Array(cols) => {
            for c in cols {
                match c {
                    Value::String(name) => {
                        let _ = writeln!(out, "  - {name}");
                    }
                    other => {
                        let name = str_field(other, &["column_name", "name"]).unwrap_or("?");
                        match str_field(other, &["data_type", "type"]) {
                            Some(ty) => {
                                let _ = writeln!(out, "  - {name} ({ty})");
                            }
                            None => {
                                let _ = writeln!(out, "  - {name}");
                            }
                        }
                    }
                }
            }
        }
        Value::Object(cols) => {
            for (name, ty) in cols {
                let ty = ty.as_str().map(String::from).unwrap_or_else(|| ty.to_string());
                let _ = writeln!(out, "  - {name} ({ty})");
            }
        }
        _ => {}
    }
}

fn render_analysis(v: &Value) -> Option<String> {
    let mut sections: Vec<String> = Vec::new();

    if let Some(answer) = str_field(v, &["answer", "summary"]) {
        sections.push(format!("## Summary\n\n{}", answer.trim()));
    }
    if let Some(sql) = str_field(v, &["sql", "generated_sql"]) {
        sections.push(format!("## SQL\n\n```sql\n{}\n```", sql.trim()));
    }
    if let Some(data) = v.get("data").or_else(|| v.get("rows")).filter(|d| !d.is_null()) {
        let body = match rows_of(data) {
            Some((rows, cols)) => render_table(rows, cols.or_else(|| v.get("columns").and_then(Value::as_array))),
            None => pretty_json(data),
        };
        sections.push(format!("## Results\n\n{body}"));
    }
    if let Some(stats) = v.get("statistics").or_else(|| v.get("stats")).filter(|s| !s.is_null()) {
        sections.push(format!("## Statistics\n\n{}", render_statistics(stats)));
    }
    if let Some(insights) = v.get("insights").filter(|i| !i.is_null()) {
        sections.push(format!("## Insights\n\n{}", render_insights(insights)));
    }
    if let Some(chart) = render_chart(v) {
        sections.push(format!("## Chart\n\n{chart}"));
    }

    if sections.is_empty() {
        return None;
    }
    Some(sections.join("\n\n"))
}

fn render_statistics(stats: &Value) -> String {
    let Value::Object(m) = stats else {
        return pretty_json(stats);
    };
    let mut out = String::new();
    for (key, val) in m {
        match val {
            Value::Object(inner) => {
                let _ = writeln!(out, "- **{key}**: {}", inline_pairs(inner));
            }
            other => {
                let _ = writeln!(out, "- **{key}**: {}", scalar(other));
            }
        }
    }
    out.trim_end().to_string()
}

fn inline_pairs(m: &Map<String, Value>) -> String {
    m.iter().map(|(k, v)| format!("{k}={}", scalar(v))).collect::<Vec<_>>().join(", ")
}

fn scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => format!("{}", (f * 10_000.0).round() / 10_000.0),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Plain text, a numbered list of `{title, content}` entries, or raw JSON.
pub fn render_insights(insights: &Value) -> String {
    match insights {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let text = match item {
                    Value::String(s) => s.clone(),
                    other => {
                        let title = str_field(other, &["title", "headline"]);
                        let content = str_field(other, &["content", "description", "text"]);
                        match (title, content) {
                            (Some(t), Some(c)) => format!("**{t}**: {c}"),
                            (Some(t), None) => format!("**{t}**"),
                            (None, Some(c)) => c.to_string(),
                            (None, None) => other.to_string(),
                        }
                    }
                };
                format!("{}. {text}", i + 1)
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => format!("```json\n{}\n```", pretty_json(other)),
    }
}

fn render_chart(v: &Value) -> Option<String> {
    if let Some(url) = str_field(v, &["chart_url"]) {
        return Some(format!("View chart: {url}"));
    }
    match v.get("chart")? {
        Value::Null => None,
        Value::String(s) => Some(format!("View chart: {s}")),
        other => match str_field(other, &["url", "chart_url"]) {
            Some(url) => Some(format!("View chart: {url}")),
            None => {
                let kind = str_field(other, &["chart_type", "type"]).unwrap_or("chart");
                Some(format!("A {kind} specification was generated."))
            }
        },
    }
}

//! Query-expression evaluation and table shaping
//!
//! A deliberately small jq-like dialect, enough for the `parse` expressions
//! and result transforms the command engine needs:
//!
//! - `.` - identity
//! - `.field.sub` - object field paths (missing fields yield null)
//! - `.[]` - iterate an array
//! - `.[N]` - index an array
//! - `expr | expr` - pipe stages
//!
//! The `jq` style takes the first produced value; the `pq` style collects
//! all of them. `tabulate`/`render_table` shape entity lists into plain-text
//! tables for terminal output.

use crate::errors::{LimarError, Result};
use indexmap::IndexSet;
use serde_json::Value;

/// Evaluate an expression and return the first produced value (jq style)
pub fn query_first(expr: &str, input: &Value) -> Result<Value> {
    let mut values = eval(expr, input)?;
    Ok(if values.is_empty() {
        Value::Null
    } else {
        values.swap_remove(0)
    })
}

/// Evaluate an expression and return every produced value (pq style)
pub fn query_all(expr: &str, input: &Value) -> Result<Value> {
    Ok(Value::Array(eval(expr, input)?))
}

fn eval(expr: &str, input: &Value) -> Result<Vec<Value>> {
    let mut values = vec![input.clone()];

    for stage in expr.split('|') {
        let stage = stage.trim();
        let mut next = Vec::new();
        for value in &values {
            next.extend(eval_stage(stage, value)?);
        }
        values = next;
    }

    Ok(values)
}

fn eval_stage(stage: &str, input: &Value) -> Result<Vec<Value>> {
    if stage == "." {
        return Ok(vec![input.clone()]);
    }

    let rest = stage.strip_prefix('.').ok_or_else(|| {
        LimarError::command_run(format!("Unsupported query expression '{stage}'"))
    })?;

    let mut values = vec![input.clone()];
    for segment in parse_segments(rest)? {
        let mut next = Vec::new();
        for value in values {
            match &segment {
                Segment::Field(name) => {
                    next.push(value.get(name.as_str()).cloned().unwrap_or(Value::Null));
                }
                Segment::Index(index) => {
                    next.push(value.get(*index).cloned().unwrap_or(Value::Null));
                }
                Segment::Iterate => match value {
                    Value::Array(items) => next.extend(items),
                    other => {
                        return Err(LimarError::command_run(format!(
                            "Cannot iterate over non-array value '{other}'"
                        )))
                    }
                },
            }
        }
        values = next;
    }

    Ok(values)
}

enum Segment {
    Field(String),
    Index(usize),
    Iterate,
}

fn parse_segments(mut rest: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("[]") {
            segments.push(Segment::Iterate);
            rest = after.strip_prefix('.').unwrap_or(after);
        } else if let Some(after) = rest.strip_prefix('[') {
            let (index, after) = after.split_once(']').ok_or_else(|| {
                LimarError::command_run(format!("Unclosed index in query expression '{rest}'"))
            })?;
            let index: usize = index.trim().parse().map_err(|_| {
                LimarError::command_run(format!("Invalid array index '{index}'"))
            })?;
            segments.push(Segment::Index(index));
            rest = after.strip_prefix('.').unwrap_or(after);
        } else {
            let end = rest
                .find(['.', '['])
                .unwrap_or(rest.len());
            if end == 0 {
                return Err(LimarError::command_run(format!(
                    "Unsupported query expression segment '{rest}'"
                )));
            }
            segments.push(Segment::Field(rest[..end].to_string()));
            let after = &rest[end..];
            rest = after.strip_prefix('.').unwrap_or(after);
        }
    }

    Ok(segments)
}

// Tables
// --------------------

/// Shape a list of entity objects into a table with a header row
///
/// Columns are the union of keys in first-occurrence order; missing cells
/// are empty.
pub fn tabulate(entities: &[Value]) -> Value {
    let mut columns: IndexSet<String> = IndexSet::new();
    for entity in entities {
        if let Value::Object(map) = entity {
            columns.extend(map.keys().cloned());
        }
    }

    let mut rows: Vec<Value> = Vec::with_capacity(entities.len() + 1);
    rows.push(Value::Array(
        columns.iter().cloned().map(Value::String).collect(),
    ));
    for entity in entities {
        let row: Vec<Value> = columns
            .iter()
            .map(|column| {
                entity
                    .get(column)
                    .map(|value| Value::String(cell_text(value)))
                    .unwrap_or_else(|| Value::String(String::new()))
            })
            .collect();
        rows.push(Value::Array(row));
    }

    Value::Array(rows)
}

/// Render a table (array of string-array rows) as aligned plain text
pub fn render_table(table: &Value, has_headers: bool) -> Result<String> {
    let rows: Vec<Vec<String>> = table
        .as_array()
        .ok_or_else(|| LimarError::internal("render_table expects an array of rows"))?
        .iter()
        .map(|row| {
            row.as_array()
                .map(|cells| cells.iter().map(cell_text).collect())
                .ok_or_else(|| LimarError::internal("render_table expects array rows"))
        })
        .collect::<Result<_>>()?;

    let column_count = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0usize; column_count];
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    for (row_index, row) in rows.iter().enumerate() {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:width$}", cell, width = widths[i]))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');

        if has_headers && row_index == 0 && rows.len() > 1 {
            let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
            out.push_str(rule.join("  ").trim_end());
            out.push('\n');
        }
    }

    Ok(out)
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

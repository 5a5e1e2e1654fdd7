// src/summarizer/parse.rs
// Response parsing and validation — spec §4.6.5.
//
// Deliberately stricter than a general-purpose "hardened JSON" parser: a
// batch response either parses cleanly after fence-stripping or it doesn't,
// and a failure here falls back to per-milestone calls rather than trying
// increasingly permissive recovery strategies that could silently accept a
// malformed batch.

use crate::milestone::MilestoneType;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub milestone_type: MilestoneType,
    pub outcome: String,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub architecture_relevant: bool,
    pub merged_from: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    InvalidJson(String),
    NotAnObjectOrArray,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidJson(msg) => write!(f, "invalid JSON: {msg}"),
            ParseError::NotAnObjectOrArray => write!(f, "response is neither a JSON object nor array"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Strip a leading fenced-code marker (``` or ```json) and a trailing fence
/// if present, then trim whitespace.
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_leading = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```JSON"))
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed)
        .trim_start();
    without_leading.strip_suffix("```").unwrap_or(without_leading).trim()
}

/// Parse a batch response expecting a JSON array of summaries. A single
/// JSON object is also accepted (treated as a one-element array) since a
/// model may ignore the array framing for a batch of size 1.
pub fn parse_batch_response(raw: &str) -> Result<Vec<ParsedSummary>, ParseError> {
    let stripped = strip_fence(raw);
    let value: Value = serde_json::from_str(stripped).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    match value {
        Value::Array(items) => Ok(items.iter().map(coerce_summary).collect()),
        Value::Object(_) => Ok(vec![coerce_summary(&value)]),
        _ => Err(ParseError::NotAnObjectOrArray),
    }
}

/// Parse a single-milestone response expecting exactly one JSON object.
pub fn parse_single_response(raw: &str) -> Result<ParsedSummary, ParseError> {
    let stripped = strip_fence(raw);
    let value: Value = serde_json::from_str(stripped).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    if !value.is_object() {
        return Err(ParseError::NotAnObjectOrArray);
    }
    Ok(coerce_summary(&value))
}

fn coerce_summary(value: &Value) -> ParsedSummary {
    let id = value.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
    ParsedSummary {
        id,
        title: coerce_string(value.get("title")),
        description: coerce_string(value.get("description")),
        milestone_type: coerce_type(value.get("type")),
        outcome: coerce_string(value.get("outcome")),
        facts: coerce_string_array(value.get("facts")),
        concepts: coerce_string_array(value.get("concepts")),
        architecture_relevant: matches!(value.get("architectureRelevant"), Some(Value::Bool(true))),
        merged_from: coerce_string_array(value.get("mergedFrom")),
    }
}

fn coerce_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn coerce_string_array(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn coerce_type(value: Option<&Value>) -> MilestoneType {
    value
        .and_then(Value::as_str)
        .and_then(|s| s.to_lowercase().parse::<MilestoneType>().ok())
        .unwrap_or_default()
}

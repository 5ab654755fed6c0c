//! Repair of truncated or noisy plan arrays.
//!
//! Only text that starts with `[` is handled here. The text is filtered to a
//! conservative character set, split into top-level objects by a quote-aware
//! scanner, the unterminated tail object (if any) is closed up, and the
//! pieces are reassembled into an array.

use std::sync::LazyLock;

use parley_core::plan::{DEFAULT_OBJECTIVES, DEFAULT_STRATEGY};
use parley_core::Plan;
use regex::Regex;
use serde_json::Value;

use super::{fenced_body, parse_json_plan, ParseStage, RepairStage};

static OBJECTIVES_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""objectives"\s*:\s*\["#).expect("objectives regex"));
static STRATEGY_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""strategy"\s*:"#).expect("strategy regex"));
static TRAILING_COMMA_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*\}").expect("trailing comma regex"));
static TRAILING_COMMA_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*\]").expect("trailing comma regex"));
static MISSING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\}\s*\{").expect("missing comma regex"));

/// Structural repair stage for array-shaped planner output.
pub struct StructuralRepair;

impl RepairStage for StructuralRepair {
    fn stage(&self) -> ParseStage {
        ParseStage::StructuralRepair
    }

    fn attempt(&self, raw: &str) -> Option<Plan> {
        let text = fenced_body(raw).unwrap_or_else(|| raw.trim());
        if !text.starts_with('[') {
            return None;
        }

        let cleaned = filter_allowed(text);
        let split = split_objects(&cleaned);

        let mut objects: Vec<String> = split.complete.iter().map(|o| cleanup(o)).collect();
        if let Some(tail) = split.tail {
            objects.push(cleanup(&repair_tail(tail)));
        }
        if objects.is_empty() {
            return None;
        }

        let assembled = cleanup(&format!("[{}]", objects.join(",")));
        // Reassembly can fail on a later element; the first one alone is
        // still the plan. Later elements never stand in for it.
        parse_json_plan(&assembled)
            .or_else(|| objects.first().and_then(|first| parse_json_plan(first)))
            .map(with_default_objectives)
    }
}

/// A tail cut inside its first objective closes as `[]`.
fn with_default_objectives(mut plan: Plan) -> Plan {
    if plan.objectives.is_empty() {
        plan.objectives = DEFAULT_OBJECTIVES.iter().map(ToString::to_string).collect();
    }
    plan
}

fn is_allowed(c: char) -> bool {
    matches!(
        c,
        ' '..='~'
            | '\u{4E00}'..='\u{9FFF}'
            | '\u{3400}'..='\u{4DBF}'
            | '\u{3000}'..='\u{303F}'
            | '\u{FF00}'..='\u{FFEF}'
    )
}

/// Drop characters outside printable ASCII and the CJK blocks. Line breaks
/// and tabs become spaces so adjacent tokens stay separated.
pub(crate) fn filter_allowed(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c {
            '\n' | '\r' | '\t' => Some(' '),
            c if is_allowed(c) => Some(c),
            _ => None,
        })
        .collect()
}

/// Top-level objects found by [`split_objects`].
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SplitObjects<'a> {
    pub complete: Vec<&'a str>,
    /// The object whose braces never balanced before end of input.
    pub tail: Option<&'a str>,
}

/// Split array text into top-level `{...}` substrings.
///
/// Quotes are only tracked inside objects so stray prose between objects
/// cannot desynchronize the scan.
pub(crate) fn split_objects(text: &str) -> SplitObjects<'_> {
    let mut complete = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escape_next = false;
    let mut start = None;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_quotes {
            match c {
                '\\' => escape_next = true,
                '"' => in_quotes = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_quotes = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        complete.push(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }

    let tail = if depth > 0 { start.map(|s| &text[s..]) } else { None };
    SplitObjects { complete, tail }
}

enum ArrayScan {
    /// Byte offset of the matching `]`.
    Closed(usize),
    /// Unterminated; byte offset just past the last complete string element.
    Open { last_complete: Option<usize> },
}

/// Scan an array starting at its `[`.
fn scan_array(text: &str) -> ArrayScan {
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escape_next = false;
    let mut last_complete = None;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_quotes {
            match c {
                '\\' => escape_next = true,
                '"' => {
                    in_quotes = false;
                    if depth == 1 {
                        last_complete = Some(i + 1);
                    }
                }
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return ArrayScan::Closed(i);
                }
            }
            _ => {}
        }
    }
    ArrayScan::Open { last_complete }
}

/// Close up the unterminated tail object.
///
/// An open `objectives` array is cut back to its last complete element and
/// closed. A missing `strategy` is inserted right after the objectives
/// array. Remaining open strings and containers are then closed.
pub(crate) fn repair_tail(tail: &str) -> String {
    let mut repaired = tail.to_string();

    if let Some(open) = OBJECTIVES_OPEN.find(&repaired).map(|m| m.end() - 1) {
        let close = match scan_array(&repaired[open..]) {
            ArrayScan::Closed(offset) => open + offset,
            ArrayScan::Open { last_complete } => {
                repaired.truncate(open + last_complete.unwrap_or(1));
                repaired.push(']');
                repaired.len() - 1
            }
        };
        if !STRATEGY_KEY.is_match(&repaired) {
            let strategy = Value::String(DEFAULT_STRATEGY.to_string());
            repaired.insert_str(close + 1, &format!(",\"strategy\":{strategy}"));
        }
    }

    close_open_structures(&repaired)
}

/// Close a dangling string, drop a dangling key, and append one closer per
/// unmatched `{` or `[`.
fn close_open_structures(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_quotes = false;
    let mut escape_next = false;
    let mut quote_start = 0;
    let mut quote_is_key = false;
    let mut last_significant = None;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_quotes {
            match c {
                '\\' => escape_next = true,
                '"' => {
                    in_quotes = false;
                    last_significant = Some('"');
                }
                _ => {}
            }
            continue;
        }
        match c {
            '"' => {
                in_quotes = true;
                quote_start = i;
                quote_is_key = stack.last() == Some(&'{')
                    && matches!(last_significant, Some('{') | Some(','));
            }
            '{' | '[' => stack.push(c),
            '}' | ']' => {
                let _ = stack.pop();
            }
            _ => {}
        }
        if !c.is_whitespace() {
            last_significant = Some(c);
        }
    }

    let mut out = text.to_string();
    if in_quotes {
        if quote_is_key {
            out.truncate(quote_start);
        } else {
            if escape_next {
                let _ = out.pop();
            }
            out.push('"');
        }
    }

    loop {
        out.truncate(out.trim_end().len());
        if out.ends_with(',') {
            let _ = out.pop();
        } else if out.ends_with(':') {
            let _ = out.pop();
            out.truncate(out.trim_end().len());
            if out.ends_with('"') {
                let key_start = out[..out.len() - 1].rfind('"').unwrap_or(0);
                out.truncate(key_start);
            }
        } else {
            break;
        }
    }

    for opener in stack.iter().rev() {
        out.push(if *opener == '{' { '}' } else { ']' });
    }
    out
}

/// Remove trailing commas and insert missing commas between objects.
fn cleanup(text: &str) -> String {
    let text = TRAILING_COMMA_OBJECT.replace_all(text, "}");
    let text = TRAILING_COMMA_ARRAY.replace_all(&text, "]");
    MISSING_COMMA.replace_all(&text, "},{").into_owned()
}

use std::sync::LazyLock;

use parley_core::plan::{DEFAULT_OBJECTIVES, DEFAULT_STRATEGY};
use parley_core::{InteractionKind, Plan};
use regex::Regex;

use super::{ParseStage, RepairStage};

static INTERACTION_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""interactionType"\s*:\s*"([^"]*)""#).expect("interactionType regex")
});
static CONTENT_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""contentId"\s*:\s*(?:"([^"]*)"|(-?\d+))"#).expect("contentId regex")
});
static OBJECTIVES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""objectives"\s*:\s*\[([^\]]*)"#).expect("objectives regex")
});
static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("quoted string regex"));

/// Last-resort stage: pulls each field out of the raw text independently.
/// Always returns a plan; anything not found gets a default.
pub struct FieldExtraction;

impl RepairStage for FieldExtraction {
    fn stage(&self) -> ParseStage {
        ParseStage::FieldExtraction
    }

    fn attempt(&self, raw: &str) -> Option<Plan> {
        let kind = INTERACTION_TYPE
            .captures(raw)
            .and_then(|caps| caps.get(1))
            .map(|m| InteractionKind::parse_lenient(m.as_str()))
            .unwrap_or_default();

        let content_reference = CONTENT_ID.captures(raw).and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str().to_string())
        });

        let mut objectives = extract_objectives(raw);
        if objectives.is_empty() {
            objectives = DEFAULT_OBJECTIVES.iter().map(ToString::to_string).collect();
        }

        Some(Plan::new(kind, content_reference, objectives, DEFAULT_STRATEGY))
    }
}

/// Complete quoted strings inside the `objectives` array, which may be
/// unterminated.
fn extract_objectives(raw: &str) -> Vec<String> {
    let Some(body) = OBJECTIVES.captures(raw).and_then(|caps| caps.get(1)) else {
        return Vec::new();
    };
    QUOTED
        .captures_iter(body.as_str())
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().replace("\\\"", "\"").trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

//! Recovers a [`Plan`] from free-form planner output.
//!
//! The planner is asked for JSON but regularly returns text that is
//! truncated, wrapped in prose or code fences, or otherwise broken. The
//! parser runs an ordered chain of [`RepairStage`]s, each more invasive than
//! the last, and stops at the first stage that yields a plan:
//!
//! 1. [`ParseStage::Direct`]: the whole text as JSON.
//! 2. [`ParseStage::Normalized`]: whitespace runs collapsed, then JSON.
//! 3. [`ParseStage::Fenced`]: the body of a Markdown code fence as JSON.
//! 4. [`ParseStage::StructuralRepair`]: array text split into objects, the
//!    truncated tail object closed up, then reassembled.
//! 5. [`ParseStage::FieldExtraction`]: per-field regex extraction. Always
//!    succeeds.
//!
//! [`ParseStage::Fallback`] is reported only when every stage declined.
//!
//! When the recovered value is an array, only its first element becomes the
//! plan.

mod extract;
mod structural;

use std::fmt;
use std::sync::LazyLock;

use parley_core::Plan;
use regex::Regex;
use serde_json::Value;

pub use extract::FieldExtraction;
pub use structural::StructuralRepair;

/// Which stage of the chain produced a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParseStage {
    Direct,
    Normalized,
    Fenced,
    StructuralRepair,
    FieldExtraction,
    Fallback,
}

impl ParseStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Normalized => "normalized",
            Self::Fenced => "fenced",
            Self::StructuralRepair => "structural_repair",
            Self::FieldExtraction => "field_extraction",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ParseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recovered plan and the stage that recovered it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseOutcome {
    pub plan: Plan,
    pub stage: ParseStage,
}

/// One attempt in the repair chain. Implementations are pure.
pub trait RepairStage: Send + Sync {
    fn stage(&self) -> ParseStage;

    /// Return a plan, or `None` to hand the text to the next stage.
    fn attempt(&self, raw: &str) -> Option<Plan>;
}

/// Parses the whole text as JSON.
pub struct DirectParse;

impl RepairStage for DirectParse {
    fn stage(&self) -> ParseStage {
        ParseStage::Direct
    }

    fn attempt(&self, raw: &str) -> Option<Plan> {
        parse_json_plan(raw)
    }
}

/// Collapses whitespace runs (including newlines inside string literals and
/// non-ASCII spaces) before parsing.
pub struct WhitespaceNormalize;

impl RepairStage for WhitespaceNormalize {
    fn stage(&self) -> ParseStage {
        ParseStage::Normalized
    }

    fn attempt(&self, raw: &str) -> Option<Plan> {
        let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized == raw {
            return None;
        }
        parse_json_plan(&normalized)
    }
}

/// Parses the body of the first Markdown code fence, closed or not.
pub struct FencedBlock;

impl RepairStage for FencedBlock {
    fn stage(&self) -> ParseStage {
        ParseStage::Fenced
    }

    fn attempt(&self, raw: &str) -> Option<Plan> {
        parse_json_plan(fenced_body(raw)?)
    }
}

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)(?:```|\z)").expect("fence regex")
});

/// The text inside the first code fence, trimmed.
pub(crate) fn fenced_body(raw: &str) -> Option<&str> {
    FENCE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|body| !body.is_empty())
}

pub(crate) fn parse_json_plan(text: &str) -> Option<Plan> {
    let value: Value = serde_json::from_str(text).ok()?;
    Plan::from_json(&value)
}

/// Ordered chain of [`RepairStage`]s.
pub struct PlanParser {
    stages: Vec<Box<dyn RepairStage>>,
}

impl PlanParser {
    pub fn new(stages: Vec<Box<dyn RepairStage>>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> impl Iterator<Item = ParseStage> + '_ {
        self.stages.iter().map(|s| s.stage())
    }

    /// Recover a plan from `raw`. Never fails.
    pub fn parse(&self, raw: &str) -> ParseOutcome {
        self.stages
            .iter()
            .find_map(|stage| {
                stage.attempt(raw).map(|plan| ParseOutcome {
                    plan,
                    stage: stage.stage(),
                })
            })
            .unwrap_or_else(|| ParseOutcome {
                plan: Plan::fallback(),
                stage: ParseStage::Fallback,
            })
    }
}

impl Default for PlanParser {
    fn default() -> Self {
        Self::new(vec![
            Box::new(DirectParse),
            Box::new(WhitespaceNormalize),
            Box::new(FencedBlock),
            Box::new(StructuralRepair),
            Box::new(FieldExtraction),
        ])
    }
}

static DEFAULT_PARSER: LazyLock<PlanParser> = LazyLock::new(PlanParser::default);

/// Parse with the default stage chain.
pub fn parse_plan(raw: &str) -> ParseOutcome {
    DEFAULT_PARSER.parse(raw)
}

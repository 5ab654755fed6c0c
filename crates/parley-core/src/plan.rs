//! The structured output of the planning stage.
//!
//! A [`Plan`] always carries a valid [`InteractionKind`] and a non-empty
//! strategy. Constructors normalize their input so that no code path can
//! produce a plan that breaks either rule.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Strategy used whenever the planner did not supply a usable one.
pub const DEFAULT_STRATEGY: &str =
    "Respond warmly, keep sentences short, and follow the child's lead.";

/// Objectives used by the hard-coded fallback plan.
pub const DEFAULT_OBJECTIVES: [&str; 2] = [
    "Keep the conversation going",
    "Encourage the child to express themselves",
];

/// What kind of interaction the execution stage should run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    #[default]
    Chat,
    Song,
    Story,
    Game,
    Lesson,
}

impl InteractionKind {
    pub const ALL: [InteractionKind; 5] = [
        Self::Chat,
        Self::Song,
        Self::Story,
        Self::Game,
        Self::Lesson,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Song => "song",
            Self::Story => "story",
            Self::Game => "game",
            Self::Lesson => "lesson",
        }
    }

    /// Parse a kind, mapping anything unrecognized to [`InteractionKind::Chat`].
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or_default()
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known interaction kind.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown interaction kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for InteractionKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Plan for a single turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "interactionType")]
    pub interaction_kind: InteractionKind,
    #[serde(rename = "contentId", default, skip_serializing_if = "Option::is_none")]
    pub content_reference: Option<String>,
    #[serde(default)]
    pub objectives: Vec<String>,
    pub strategy: String,
}

impl Plan {
    /// Build a plan, substituting the default strategy when `strategy` is blank.
    pub fn new(
        interaction_kind: InteractionKind,
        content_reference: Option<String>,
        objectives: Vec<String>,
        strategy: impl Into<String>,
    ) -> Self {
        let strategy = strategy.into();
        let strategy = if strategy.trim().is_empty() {
            DEFAULT_STRATEGY.to_string()
        } else {
            strategy.trim().to_string()
        };
        Self {
            interaction_kind,
            content_reference: content_reference.filter(|c| !c.trim().is_empty()),
            objectives,
            strategy,
        }
    }

    /// The plan used when nothing usable could be recovered.
    pub fn fallback() -> Self {
        Self::new(
            InteractionKind::Chat,
            None,
            DEFAULT_OBJECTIVES.iter().map(ToString::to_string).collect(),
            DEFAULT_STRATEGY,
        )
    }

    /// Interpret a parsed JSON value as a plan.
    ///
    /// Arrays yield the plan described by their first element; later
    /// elements are ignored. Returns `None` when the value is not
    /// plan-shaped (not an object, or an array whose first element is not
    /// an object).
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Object(_) => Self::from_object(value),
            Value::Array(items) => items.first().and_then(Self::from_object),
            _ => None,
        }
    }

    fn from_object(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;

        let kind = obj
            .get("interactionType")
            .and_then(Value::as_str)
            .map(InteractionKind::parse_lenient)
            .unwrap_or_default();

        let content_reference = match obj.get("contentId") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let objectives = match obj.get("objectives") {
            Some(Value::Array(items)) => items.iter().filter_map(objective_text).collect(),
            Some(other) => objective_text(other).into_iter().collect(),
            None => Vec::new(),
        };

        let strategy = obj
            .get("strategy")
            .and_then(Value::as_str)
            .unwrap_or_default();

        Some(Self::new(kind, content_reference, objectives, strategy))
    }

    /// Whether the plan satisfies the invariants every consumer relies on.
    pub fn is_valid(&self) -> bool {
        !self.strategy.trim().is_empty()
    }
}

fn objective_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("Story".parse::<InteractionKind>().unwrap(), InteractionKind::Story);
        assert_eq!(" GAME ".parse::<InteractionKind>().unwrap(), InteractionKind::Game);
    }

    #[test]
    fn unknown_kind_defaults_to_chat() {
        assert_eq!(InteractionKind::parse_lenient("dance"), InteractionKind::Chat);
        assert_eq!(InteractionKind::parse_lenient(""), InteractionKind::Chat);
    }

    #[test]
    fn fallback_is_valid() {
        let plan = Plan::fallback();
        assert!(plan.is_valid());
        assert_eq!(plan.interaction_kind, InteractionKind::Chat);
        assert_eq!(plan.objectives.len(), 2);
    }

    #[test]
    fn blank_strategy_is_replaced() {
        let plan = Plan::new(InteractionKind::Song, None, vec![], "   ");
        assert_eq!(plan.strategy, DEFAULT_STRATEGY);
    }

    #[test]
    fn from_json_reads_all_fields() {
        let value = json!({
            "interactionType": "lesson",
            "contentId": "colors-01",
            "objectives": ["name three colors", "  "],
            "strategy": "Use a guessing game"
        });
        let plan = Plan::from_json(&value).unwrap();
        assert_eq!(plan.interaction_kind, InteractionKind::Lesson);
        assert_eq!(plan.content_reference.as_deref(), Some("colors-01"));
        assert_eq!(plan.objectives, vec!["name three colors"]);
        assert_eq!(plan.strategy, "Use a guessing game");
    }

    #[test]
    fn from_json_uses_first_array_element() {
        let value = json!([
            {"interactionType": "song", "strategy": "sing"},
            {"interactionType": "game", "strategy": "play"}
        ]);
        let plan = Plan::from_json(&value).unwrap();
        assert_eq!(plan.interaction_kind, InteractionKind::Song);
    }

    #[test]
    fn from_json_rejects_scalars() {
        assert!(Plan::from_json(&json!(42)).is_none());
        assert!(Plan::from_json(&json!("plan")).is_none());
        assert!(Plan::from_json(&json!([])).is_none());
        assert!(Plan::from_json(&json!([1, 2])).is_none());
    }

    #[test]
    fn numeric_content_id_is_stringified() {
        let plan = Plan::from_json(&json!({"contentId": 17, "strategy": "s"})).unwrap();
        assert_eq!(plan.content_reference.as_deref(), Some("17"));
    }

    #[test]
    fn serializes_with_wire_names() {
        let json = serde_json::to_value(Plan::fallback()).unwrap();
        assert_eq!(json["interactionType"], "chat");
        assert!(json.get("contentId").is_none());
    }
}

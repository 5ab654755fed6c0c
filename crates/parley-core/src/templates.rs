//! Prompt templates passed to the generation collaborators.
//!
//! Templates are plain configuration values. [`TemplateStore`] is the one
//! shared, mutable holder: many readers take a snapshot per turn, and a
//! single writer replaces fields through [`TemplateStore::update`].

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

const DEFAULT_PLANNER_TEMPLATE: &str = "\
You are planning the next turn of a friendly conversation with a young child.
Child profile: {{profile}}
Recent conversation:
{{history}}

Reply with ONLY a JSON array of plan objects for the next turns. Each object has:
\"interactionType\" (one of chat, song, story, game, lesson), optional \"contentId\",
\"objectives\" (array of short strings) and \"strategy\" (one sentence).";

const DEFAULT_EXECUTOR_TEMPLATE: &str = "\
You are a patient, playful companion talking with a young child.
Interaction: {{interaction}}
Objectives: {{objectives}}
Strategy: {{strategy}}

The child said: {{input}}
Reply in two or three short sentences.";

/// Templates for both generation stages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplates {
    pub planner: String,
    pub executor: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            planner: DEFAULT_PLANNER_TEMPLATE.to_string(),
            executor: DEFAULT_EXECUTOR_TEMPLATE.to_string(),
        }
    }
}

/// Partial replacement of the stored templates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateUpdate {
    #[serde(default)]
    pub planner: Option<String>,
    #[serde(default)]
    pub executor: Option<String>,
}

impl TemplateUpdate {
    pub fn is_empty(&self) -> bool {
        self.planner.is_none() && self.executor.is_none()
    }
}

/// Shared holder for the active templates.
pub struct TemplateStore {
    templates: RwLock<PromptTemplates>,
    revision: AtomicU64,
}

impl TemplateStore {
    pub fn new(templates: PromptTemplates) -> Self {
        Self {
            templates: RwLock::new(templates),
            revision: AtomicU64::new(0),
        }
    }

    /// Copy of the current templates. Taken once per turn so a concurrent
    /// update never changes templates mid-turn.
    pub fn snapshot(&self) -> PromptTemplates {
        self.templates.read().clone()
    }

    /// Apply an update and return the new revision.
    pub fn update(&self, update: TemplateUpdate) -> u64 {
        let mut templates = self.templates.write();
        if let Some(planner) = update.planner {
            templates.planner = planner;
        }
        if let Some(executor) = update.executor {
            templates.executor = executor;
        }
        self.revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new(PromptTemplates::default())
    }
}

/// Replace `{{name}}` placeholders. Unknown placeholders are left as-is.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_replaces_only_given_fields() {
        let store = TemplateStore::default();
        let before = store.snapshot();
        let rev = store.update(TemplateUpdate {
            planner: Some("plan {{history}}".into()),
            executor: None,
        });
        assert_eq!(rev, 1);
        let after = store.snapshot();
        assert_eq!(after.planner, "plan {{history}}");
        assert_eq!(after.executor, before.executor);
    }

    #[test]
    fn revision_increments() {
        let store = TemplateStore::default();
        assert_eq!(store.revision(), 0);
        let _ = store.update(TemplateUpdate::default());
        let _ = store.update(TemplateUpdate::default());
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn snapshot_is_isolated_from_later_updates() {
        let store = TemplateStore::default();
        let snap = store.snapshot();
        let _ = store.update(TemplateUpdate {
            planner: Some("new".into()),
            executor: Some("new".into()),
        });
        assert_eq!(snap, PromptTemplates::default());
    }

    #[test]
    fn render_substitutes_known_placeholders() {
        let out = render("hi {{name}}, {{missing}}", &[("name", "Ana")]);
        assert_eq!(out, "hi Ana, {{missing}}");
    }

    #[test]
    fn empty_update_detected() {
        assert!(TemplateUpdate::default().is_empty());
        assert!(!TemplateUpdate {
            planner: Some(String::new()),
            executor: None
        }
        .is_empty());
    }
}

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::messages::Message;
use crate::plan::Plan;

/// Default number of messages retained per session.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Conversation state bound to a subject.
///
/// History is bounded: pushing past `history_limit` silently evicts the
/// oldest entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub subject_id: String,
    #[serde(default)]
    pub profile: serde_json::Map<String, serde_json::Value>,
    history: VecDeque<Message>,
    history_limit: usize,
    #[serde(default)]
    pub last_plan: Option<Plan>,
}

impl SessionContext {
    pub fn new(subject_id: impl Into<String>, history_limit: usize) -> Self {
        Self {
            subject_id: subject_id.into(),
            profile: serde_json::Map::new(),
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            last_plan: None,
        }
    }

    /// Append a message, evicting the oldest entries beyond the limit.
    pub fn push(&mut self, message: Message) {
        self.history.push_back(message);
        while self.history.len() > self.history_limit {
            let _ = self.history.pop_front();
        }
    }

    /// The most recent `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Message> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn history(&self) -> impl Iterator<Item = &Message> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.history.back()
    }

    /// Shallow-merge profile hints over the stored profile.
    pub fn merge_profile(&mut self, hints: &serde_json::Map<String, serde_json::Value>) {
        for (key, value) in hints {
            if !value.is_null() {
                let _ = self.profile.insert(key.clone(), value.clone());
            }
        }
    }
}

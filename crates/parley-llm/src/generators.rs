//! [`Planner`] and [`Executor`] implementations backed by [`AnthropicClient`].

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::messages::format_history;
use parley_core::templates::render;
use parley_core::{ExecuteRequest, Executor, GenerationError, OnFragment, PlanRequest, Planner};
use tracing::debug;

use crate::client::{AnthropicClient, CompletionRequest};

/// Render the planner prompt: `{{profile}}` and `{{history}}`.
pub fn planner_prompt(request: &PlanRequest<'_>) -> String {
    let profile = serde_json::Value::Object(request.session.profile.clone()).to_string();
    let history = format_history(request.history);
    render(
        request.template,
        &[("profile", profile.as_str()), ("history", history.as_str())],
    )
}

/// Render the executor prompt: `{{interaction}}`, `{{objectives}}`,
/// `{{strategy}}`, and `{{input}}`.
pub fn executor_prompt(request: &ExecuteRequest<'_>) -> String {
    let objectives = request.plan.objectives.join("; ");
    render(
        request.template,
        &[
            ("interaction", request.plan.interaction_kind.as_str()),
            ("objectives", objectives.as_str()),
            ("strategy", request.plan.strategy.as_str()),
            ("input", request.input.text.as_str()),
        ],
    )
}

/// Collects one full completion as raw plan text.
pub struct LlmPlanner {
    client: Arc<AnthropicClient>,
    model: String,
}

impl LlmPlanner {
    pub fn new(client: Arc<AnthropicClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn generate(&self, request: PlanRequest<'_>) -> Result<String, GenerationError> {
        let completion = CompletionRequest {
            model: self.model.clone(),
            system: None,
            prompt: planner_prompt(&request),
        };
        let text = self.client.complete(&completion, &|_: &str| {}).await?;
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        debug!(chars = text.len(), "planner completion received");
        Ok(text)
    }
}

/// Streams each text delta to the fragment callback.
pub struct LlmExecutor {
    client: Arc<AnthropicClient>,
    model: String,
}

impl LlmExecutor {
    pub fn new(client: Arc<AnthropicClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Executor for LlmExecutor {
    async fn generate(
        &self,
        request: ExecuteRequest<'_>,
        on_fragment: &OnFragment<'_>,
    ) -> Result<String, GenerationError> {
        let completion = CompletionRequest {
            model: self.model.clone(),
            system: Some(executor_prompt(&request)),
            prompt: request.input.text.clone(),
        };
        // The reply is the concatenated fragments.
        let _ = self.client.complete(&completion, on_fragment).await?;
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{InteractionKind, Message, Plan, SessionContext, TemplateStore};

    #[test]
    fn planner_prompt_fills_profile_and_history() {
        let mut session = SessionContext::new("kid", 10);
        let mut hints = serde_json::Map::new();
        let _ = hints.insert("age".into(), serde_json::json!(5));
        session.merge_profile(&hints);
        let history = vec![Message::user("hi"), Message::agent("hello!")];
        let prompt = planner_prompt(&PlanRequest {
            session: &session,
            history: &history,
            template: "P={{profile}} H={{history}}",
        });
        assert_eq!(prompt, "P={\"age\":5} H=user: hi\nagent: hello!");
    }

    #[test]
    fn executor_prompt_fills_plan_fields() {
        let session = SessionContext::new("kid", 10);
        let plan = Plan::new(
            InteractionKind::Story,
            None,
            vec!["listen".into(), "retell".into()],
            "Go slow",
        );
        let input = Message::user("tell me a story");
        let prompt = executor_prompt(&ExecuteRequest {
            session: &session,
            plan: &plan,
            input: &input,
            template: "{{interaction}}|{{objectives}}|{{strategy}}|{{input}}",
        });
        assert_eq!(prompt, "story|listen; retell|Go slow|tell me a story");
    }

    #[test]
    fn default_templates_have_no_leftover_placeholders() {
        let templates = TemplateStore::default().snapshot();
        let session = SessionContext::new("kid", 10);
        let plan = Plan::fallback();
        let input = Message::user("hi");
        let planned = planner_prompt(&PlanRequest {
            session: &session,
            history: &[],
            template: &templates.planner,
        });
        let executed = executor_prompt(&ExecuteRequest {
            session: &session,
            plan: &plan,
            input: &input,
            template: &templates.executor,
        });
        assert!(!planned.contains("{{"));
        assert!(!executed.contains("{{"));
    }
}

//! Two-stage turn pipeline: planner, plan repair, streaming executor.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_core::{
    ExecuteRequest, Executor, GenerationError, InteractionKind, Message, Plan, PlanRequest,
    Planner, SessionContext, SessionStore, TemplateStore,
};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::plan_parser::{ParseOutcome, ParseStage, PlanParser};

const PROCESSING_MESSAGE: &str = "Planning the next reply";
const MIN_PROCESSING_INTERVAL: Duration = Duration::from_millis(10);

/// Pipeline tuning.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Messages handed to the planner, most recent last.
    pub planner_window: usize,
    /// Period between repeated `processing` events while planning.
    pub processing_interval: Duration,
    /// Planner calls slower than this count as failures.
    pub planner_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            planner_window: 6,
            processing_interval: Duration::from_secs(5),
            planner_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Events produced while a turn runs. Every turn ends with exactly one
/// [`TurnEvent::Final`] or [`TurnEvent::Error`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnEvent {
    Processing { message: String },
    Fragment { content: String },
    Final { content: String, interaction_kind: InteractionKind },
    Error { message: String },
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final { .. } | Self::Error { .. })
    }
}

/// Receives turn events. Must not block; delivery is best-effort.
pub trait TurnSink: Send + Sync {
    fn emit(&self, event: TurnEvent);
}

impl<F> TurnSink for F
where
    F: Fn(TurnEvent) + Send + Sync,
{
    fn emit(&self, event: TurnEvent) {
        self(event)
    }
}

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    Completed {
        reply: Message,
        plan: Plan,
        stage: ParseStage,
    },
    Failed(GenerationError),
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Runs turns against injected planner/executor collaborators.
pub struct TurnPipeline {
    planner: Arc<dyn Planner>,
    executor: Arc<dyn Executor>,
    store: Arc<dyn SessionStore>,
    templates: Arc<TemplateStore>,
    parser: PlanParser,
    config: PipelineConfig,
}

impl TurnPipeline {
    pub fn new(
        planner: Arc<dyn Planner>,
        executor: Arc<dyn Executor>,
        store: Arc<dyn SessionStore>,
        templates: Arc<TemplateStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            planner,
            executor,
            store,
            templates,
            parser: PlanParser::default(),
            config,
        }
    }

    pub fn with_parser(mut self, parser: PlanParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Run one turn to completion.
    ///
    /// Planner failures fall back to [`Plan::fallback`] and never surface.
    /// Executor failures emit a single [`TurnEvent::Error`], leave history
    /// without a reply, and keep the previous cached plan.
    #[instrument(skip_all, fields(subject_id = %session.subject_id))]
    pub async fn run_turn(
        &self,
        session: &mut SessionContext,
        input: Message,
        sink: &dyn TurnSink,
    ) -> TurnOutcome {
        let templates = self.templates.snapshot();

        session.push(input.clone());
        self.persist(&session.subject_id, input.clone()).await;

        let ParseOutcome { plan, stage } = match self.plan(session, &templates.planner, sink).await {
            Ok(raw) => self.parser.parse(&raw),
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "planner failed, using fallback plan");
                ParseOutcome {
                    plan: Plan::fallback(),
                    stage: ParseStage::Fallback,
                }
            }
        };
        debug!(%stage, interaction = %plan.interaction_kind, "plan ready");

        let fragments = Mutex::new(String::new());
        let on_fragment = |fragment: &str| {
            fragments.lock().push_str(fragment);
            sink.emit(TurnEvent::Fragment {
                content: fragment.to_string(),
            });
        };
        let request = ExecuteRequest {
            session: &*session,
            plan: &plan,
            input: &input,
            template: &templates.executor,
        };
        let result = self.executor.generate(request, &on_fragment).await;

        match result {
            Ok(payload) => {
                let content = if payload.is_empty() {
                    fragments.into_inner()
                } else {
                    payload
                };
                let reply = Message::agent(content.clone()).with_metadata(
                    "interactionType",
                    serde_json::Value::String(plan.interaction_kind.as_str().to_string()),
                );
                session.push(reply.clone());
                session.last_plan = Some(plan.clone());
                self.persist(&session.subject_id, reply.clone()).await;

                info!(%stage, chars = content.len(), "turn completed");
                sink.emit(TurnEvent::Final {
                    content,
                    interaction_kind: plan.interaction_kind,
                });
                TurnOutcome::Completed { reply, plan, stage }
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "executor failed");
                sink.emit(TurnEvent::Error {
                    message: format!("Could not generate a reply: {e}"),
                });
                TurnOutcome::Failed(e)
            }
        }
    }

    /// Call the planner, emitting `processing` up front and then on every
    /// interval tick until it returns.
    async fn plan(
        &self,
        session: &SessionContext,
        template: &str,
        sink: &dyn TurnSink,
    ) -> Result<String, GenerationError> {
        let window = session.recent(self.config.planner_window);
        let request = PlanRequest {
            session,
            history: &window,
            template,
        };

        let call = async {
            match self.config.planner_timeout {
                Some(limit) => tokio::time::timeout(limit, self.planner.generate(request))
                    .await
                    .unwrap_or(Err(GenerationError::Timeout(limit))),
                None => self.planner.generate(request).await,
            }
        };
        tokio::pin!(call);

        let period = self.config.processing_interval.max(MIN_PROCESSING_INTERVAL);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        sink.emit(processing());
        loop {
            tokio::select! {
                biased;
                result = &mut call => return result,
                _ = ticker.tick() => sink.emit(processing()),
            }
        }
    }

    async fn persist(&self, subject_id: &str, message: Message) {
        if let Err(e) = self.store.append(subject_id, message).await {
            warn!(subject_id, error = %e, "failed to persist message");
        }
    }
}

fn processing() -> TurnEvent {
    TurnEvent::Processing {
        message: PROCESSING_MESSAGE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedExecutor, ScriptedPlanner};
    use parley_core::messages::Role;
    use parley_core::store::InMemorySessionStore;
    use parley_core::StoreError;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<TurnEvent>>);

    impl TurnSink for RecordingSink {
        fn emit(&self, event: TurnEvent) {
            self.0.lock().push(event);
        }
    }

    impl RecordingSink {
        fn events(&self) -> Vec<TurnEvent> {
            self.0.lock().clone()
        }
    }

    fn pipeline(planner: ScriptedPlanner, executor: ScriptedExecutor) -> TurnPipeline {
        TurnPipeline::new(
            Arc::new(planner),
            Arc::new(executor),
            Arc::new(InMemorySessionStore::new(20)),
            Arc::new(TemplateStore::default()),
            PipelineConfig::default(),
        )
    }

    #[tokio::test]
    async fn streams_fragments_then_final() {
        let p = pipeline(
            ScriptedPlanner::always(r#"{"interactionType":"song","strategy":"Sing"}"#),
            ScriptedExecutor::fragments(&["La ", "la ", "la"]),
        );
        let mut session = SessionContext::new("kid", 20);
        let sink = RecordingSink::default();

        let outcome = p.run_turn(&mut session, Message::user("sing!"), &sink).await;

        assert!(outcome.is_completed());
        let events = sink.events();
        assert!(matches!(events[0], TurnEvent::Processing { .. }));
        let fragments: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Fragment { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(fragments, vec!["La ", "la ", "la"]);
        assert_eq!(
            events.last(),
            Some(&TurnEvent::Final {
                content: "La la la".into(),
                interaction_kind: InteractionKind::Song,
            })
        );
        assert_eq!(session.history_len(), 2);
        assert_eq!(session.last_message().map(|m| m.role), Some(Role::Agent));
        assert_eq!(
            session.last_plan.as_ref().map(|p| p.interaction_kind),
            Some(InteractionKind::Song)
        );
    }

    #[tokio::test]
    async fn executor_payload_overrides_fragments() {
        let p = pipeline(
            ScriptedPlanner::always("{}"),
            ScriptedExecutor::fragments(&["draft"]).with_payload("final text"),
        );
        let mut session = SessionContext::new("kid", 20);
        let sink = RecordingSink::default();
        let _ = p.run_turn(&mut session, Message::user("hi"), &sink).await;
        assert_eq!(session.last_message().unwrap().text, "final text");
    }

    #[tokio::test]
    async fn planner_failure_still_reaches_executor() {
        let executor = ScriptedExecutor::fragments(&["Hello"]);
        let calls = executor.call_counter();
        let p = pipeline(ScriptedPlanner::failing(), executor);
        let mut session = SessionContext::new("kid", 20);
        let sink = RecordingSink::default();

        let outcome = p.run_turn(&mut session, Message::user("hi"), &sink).await;

        match outcome {
            TurnOutcome::Completed { plan, stage, .. } => {
                assert_eq!(stage, ParseStage::Fallback);
                assert_eq!(plan, Plan::fallback());
            }
            TurnOutcome::Failed(e) => panic!("unexpected failure: {e}"),
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let events = sink.events();
        assert!(!events.iter().any(|e| matches!(e, TurnEvent::Error { .. })));
        assert!(matches!(events.last(), Some(TurnEvent::Final { .. })));
    }

    #[tokio::test]
    async fn executor_failure_emits_one_error_and_records_no_reply() {
        let p = pipeline(
            ScriptedPlanner::always(r#"{"interactionType":"game","strategy":"Play"}"#),
            ScriptedExecutor::fragments(&["partial"]).failing_with(GenerationError::NetworkError(
                "connection reset".into(),
            )),
        );
        let mut session = SessionContext::new("kid", 20);
        session.last_plan = Some(Plan::fallback());
        let sink = RecordingSink::default();

        let outcome = p.run_turn(&mut session, Message::user("hi"), &sink).await;

        assert!(matches!(outcome, TurnOutcome::Failed(GenerationError::NetworkError(_))));
        let events = sink.events();
        let errors = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::Error { .. }))
            .count();
        assert_eq!(errors, 1);
        assert!(!events.iter().any(|e| matches!(e, TurnEvent::Final { .. })));
        assert_eq!(session.history_len(), 1);
        assert_eq!(session.last_message().unwrap().role, Role::User);
        assert_eq!(session.last_plan, Some(Plan::fallback()));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_planner_gets_repeated_processing() {
        let p = TurnPipeline::new(
            Arc::new(ScriptedPlanner::always("{}").with_delay(Duration::from_millis(2_500))),
            Arc::new(ScriptedExecutor::fragments(&["ok"])),
            Arc::new(InMemorySessionStore::new(20)),
            Arc::new(TemplateStore::default()),
            PipelineConfig {
                processing_interval: Duration::from_secs(1),
                ..PipelineConfig::default()
            },
        );
        let mut session = SessionContext::new("kid", 20);
        let sink = RecordingSink::default();
        let _ = p.run_turn(&mut session, Message::user("hi"), &sink).await;

        let processing = sink
            .events()
            .iter()
            .filter(|e| matches!(e, TurnEvent::Processing { .. }))
            .count();
        assert_eq!(processing, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn planner_timeout_uses_fallback() {
        let p = TurnPipeline::new(
            Arc::new(
                ScriptedPlanner::always(r#"{"interactionType":"song","strategy":"s"}"#)
                    .with_delay(Duration::from_secs(60)),
            ),
            Arc::new(ScriptedExecutor::fragments(&["ok"])),
            Arc::new(InMemorySessionStore::new(20)),
            Arc::new(TemplateStore::default()),
            PipelineConfig {
                planner_timeout: Some(Duration::from_secs(2)),
                ..PipelineConfig::default()
            },
        );
        let mut session = SessionContext::new("kid", 20);
        let sink = RecordingSink::default();
        let outcome = p.run_turn(&mut session, Message::user("hi"), &sink).await;
        match outcome {
            TurnOutcome::Completed { stage, .. } => assert_eq!(stage, ParseStage::Fallback),
            TurnOutcome::Failed(e) => panic!("unexpected failure: {e}"),
        }
    }

    #[tokio::test]
    async fn planner_sees_bounded_window_and_template() {
        let planner = ScriptedPlanner::always("{}");
        let seen = planner.requests();
        let templates = Arc::new(TemplateStore::default());
        let _ = templates.update(parley_core::TemplateUpdate {
            planner: Some("custom planner".into()),
            executor: None,
        });
        let p = TurnPipeline::new(
            Arc::new(planner),
            Arc::new(ScriptedExecutor::fragments(&["ok"])),
            Arc::new(InMemorySessionStore::new(20)),
            templates,
            PipelineConfig {
                planner_window: 3,
                ..PipelineConfig::default()
            },
        );
        let mut session = SessionContext::new("kid", 20);
        for i in 0..5 {
            session.push(Message::user(format!("old {i}")));
        }
        let sink = RecordingSink::default();
        let _ = p.run_turn(&mut session, Message::user("newest"), &sink).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].template, "custom planner");
        assert_eq!(seen[0].history, vec!["old 3", "old 4", "newest"]);
    }

    struct BrokenStore;

    #[async_trait::async_trait]
    impl SessionStore for BrokenStore {
        async fn load(&self, _subject_id: &str) -> Result<SessionContext, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn append(&self, _subject_id: &str, _message: Message) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn store_failures_do_not_abort_turn() {
        let p = TurnPipeline::new(
            Arc::new(ScriptedPlanner::always("{}")),
            Arc::new(ScriptedExecutor::fragments(&["ok"])),
            Arc::new(BrokenStore),
            Arc::new(TemplateStore::default()),
            PipelineConfig::default(),
        );
        let mut session = SessionContext::new("kid", 20);
        let sink = RecordingSink::default();
        let outcome = p.run_turn(&mut session, Message::user("hi"), &sink).await;
        assert!(outcome.is_completed());
        assert_eq!(session.history_len(), 2);
    }
}

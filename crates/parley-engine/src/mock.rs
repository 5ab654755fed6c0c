//! Scripted collaborators for deterministic tests and local runs without a
//! model backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{ExecuteRequest, Executor, GenerationError, OnFragment, PlanRequest, Planner};

/// Shared, ordered log of collaborator activity.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// What the planner was asked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedPlanRequest {
    pub subject_id: String,
    pub template: String,
    pub history: Vec<String>,
}

/// Planner that replays scripted results in order, then repeats the last.
pub struct ScriptedPlanner {
    script: Mutex<VecDeque<Result<String, GenerationError>>>,
    last: Mutex<Result<String, GenerationError>>,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<RecordedPlanRequest>>>,
    journal: Option<Journal>,
}

impl ScriptedPlanner {
    pub fn new(script: Vec<Result<String, GenerationError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Err(GenerationError::Other("no scripted plan".into()))),
            delay: None,
            requests: Arc::new(Mutex::new(Vec::new())),
            journal: None,
        }
    }

    /// Always return `text`.
    pub fn always(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(text.into())])
    }

    /// Always fail.
    pub fn failing() -> Self {
        Self::new(vec![Err(GenerationError::ServerError {
            status: 503,
            body: "planner unavailable".into(),
        })])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Record `planner:<latest input>` in `journal` when each call starts.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn requests(&self) -> Arc<Mutex<Vec<RecordedPlanRequest>>> {
        Arc::clone(&self.requests)
    }

    fn next_result(&self) -> Result<String, GenerationError> {
        let mut last = self.last.lock();
        if let Some(next) = self.script.lock().pop_front() {
            *last = next;
        }
        last.clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn generate(&self, request: PlanRequest<'_>) -> Result<String, GenerationError> {
        let history: Vec<String> = request.history.iter().map(|m| m.text.clone()).collect();
        if let Some(journal) = &self.journal {
            let latest = history.last().cloned().unwrap_or_default();
            journal.lock().push(format!("planner:{latest}"));
        }
        self.requests.lock().push(RecordedPlanRequest {
            subject_id: request.session.subject_id.clone(),
            template: request.template.to_string(),
            history,
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_result()
    }
}

/// Executor that streams a fixed list of fragments.
pub struct ScriptedExecutor {
    fragments: Vec<String>,
    payload: String,
    failure: Option<GenerationError>,
    fragment_delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    /// Stream `fragments` and return an empty payload, so the reply is
    /// their concatenation.
    pub fn fragments(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(ToString::to_string).collect(),
            payload: String::new(),
            failure: None,
            fragment_delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Echo the input back as a single fragment.
    pub fn echo() -> EchoExecutor {
        EchoExecutor
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Stream the fragments, then fail with `error`.
    pub fn failing_with(mut self, error: GenerationError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = Some(delay);
        self
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn generate(
        &self,
        _request: ExecuteRequest<'_>,
        on_fragment: &OnFragment<'_>,
    ) -> Result<String, GenerationError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        for fragment in &self.fragments {
            if let Some(delay) = self.fragment_delay {
                tokio::time::sleep(delay).await;
            }
            on_fragment(fragment);
        }
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(self.payload.clone()),
        }
    }
}

/// Executor that replies with `<interaction>: <input>` in one fragment.
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn generate(
        &self,
        request: ExecuteRequest<'_>,
        on_fragment: &OnFragment<'_>,
    ) -> Result<String, GenerationError> {
        let reply = format!("{}: {}", request.plan.interaction_kind, request.input.text);
        on_fragment(&reply);
        Ok(String::new())
    }
}

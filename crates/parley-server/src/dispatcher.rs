//! Protocol dispatch.
//!
//! `ping`, `update_templates`, and `stats` are answered inline by the reader
//! so they never wait on a turn. `initialize` and `user_input` go through a
//! per-connection worker that runs them one at a time in arrival order.
//!
//! Nothing the worker emits is dropped while the connection is open. Its
//! frames go through an unbounded queue to a forwarder that waits for room
//! in the writer's bounded queue, so a slow reader delays a turn instead of
//! losing its fragments or terminal frame.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use parley_core::ids::ConnectionId;
use parley_core::protocol::decode_client_frame;
use parley_core::{
    ClientFrame, DecodeError, Message, ProtocolError, ServerFrame, SessionContext, SessionStore,
    StoreError, TemplateUpdate,
};
use parley_engine::{TurnEvent, TurnOutcome, TurnPipeline, TurnSink};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::registry::SessionRegistry;
use crate::websocket::connection::{Connection, ConnectionState, OutboundText};

/// Session contexts shared across connections, keyed by subject id.
pub struct SessionCache {
    sessions: DashMap<String, Arc<tokio::sync::Mutex<SessionContext>>>,
    store: Arc<dyn SessionStore>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
        }
    }

    /// Cached context for `subject_id`, loading it through the store on
    /// first use.
    pub async fn get_or_load(
        &self,
        subject_id: &str,
    ) -> Result<Arc<tokio::sync::Mutex<SessionContext>>, StoreError> {
        if let Some(existing) = self.sessions.get(subject_id) {
            return Ok(Arc::clone(existing.value()));
        }
        let loaded = self.store.load(subject_id).await?;
        // A concurrent load may have won; keep whichever landed first.
        let entry = self
            .sessions
            .entry(subject_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(loaded)));
        Ok(Arc::clone(entry.value()))
    }

    pub fn get(&self, subject_id: &str) -> Option<Arc<tokio::sync::Mutex<SessionContext>>> {
        self.sessions.get(subject_id).map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Server-wide dispatch state.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    pipeline: Arc<TurnPipeline>,
    sessions: SessionCache,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>, pipeline: Arc<TurnPipeline>) -> Self {
        let sessions = SessionCache::new(Arc::clone(pipeline.store()));
        Self {
            registry,
            pipeline,
            sessions,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub fn pipeline(&self) -> &Arc<TurnPipeline> {
        &self.pipeline
    }

    /// Start dispatching for a registered connection.
    pub fn attach(self: &Arc<Self>, connection: Arc<Connection>) -> ConnectionDispatch {
        let (turns_tx, turns_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ConnectionState::default()));
        let cancel = CancellationToken::new();
        let _forwarder = tokio::spawn(forward_turn_output(Arc::clone(&connection), out_rx));
        let sink = ConnectionSink {
            connection_id: connection.id.clone(),
            out: out_tx,
        };
        let worker = tokio::spawn(run_turn_worker(
            Arc::clone(self),
            sink,
            Arc::clone(&state),
            turns_rx,
            cancel.clone(),
        ));
        ConnectionDispatch {
            dispatcher: Arc::clone(self),
            connection,
            state,
            turns: turns_tx,
            worker,
            cancel,
        }
    }

    fn stats(&self) -> ServerFrame {
        ServerFrame::Stats {
            connection_count: self.registry.count(),
            session_count: self.sessions.len(),
        }
    }

    fn update_templates(&self, update: TemplateUpdate) -> ServerFrame {
        if update.is_empty() {
            return ServerFrame::error(ProtocolError::EmptyTemplateUpdate.to_string());
        }
        let revision = self.pipeline.templates().update(update);
        info!(revision, "prompt templates updated");
        ServerFrame::TemplatesUpdated { revision }
    }
}

/// Work the turn worker runs in order.
#[derive(Debug)]
enum TurnJob {
    Initialize {
        subject_id: String,
        profile: Option<Map<String, Value>>,
    },
    UserInput {
        subject_id: String,
        text: String,
    },
}

/// Dispatch handle owned by one connection's reader.
pub struct ConnectionDispatch {
    dispatcher: Arc<Dispatcher>,
    connection: Arc<Connection>,
    state: Arc<Mutex<ConnectionState>>,
    turns: mpsc::UnboundedSender<TurnJob>,
    worker: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ConnectionDispatch {
    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    /// Handle one inbound text frame.
    pub fn handle_text(&self, text: &str) {
        let frame = match decode_client_frame(text) {
            Ok(frame) => frame,
            Err(DecodeError::Malformed(reason)) => {
                warn!(connection_id = %self.connection.id, %reason, "dropping malformed frame");
                return;
            }
            Err(DecodeError::Protocol(e)) => {
                debug!(connection_id = %self.connection.id, error = %e, "protocol error");
                let _ = self.connection.send_frame(&ServerFrame::error(e.to_string()));
                return;
            }
        };
        self.handle_frame(frame);
    }

    pub fn handle_frame(&self, frame: ClientFrame) {
        if self.state.lock().is_closed() {
            return;
        }
        let reply = match frame {
            ClientFrame::Ping => Some(ServerFrame::Pong),
            ClientFrame::Stats => Some(self.dispatcher.stats()),
            ClientFrame::UpdateTemplates { planner, executor } => Some(
                self.dispatcher
                    .update_templates(TemplateUpdate { planner, executor }),
            ),
            ClientFrame::Initialize {
                subject_id,
                profile,
            } => {
                self.enqueue(TurnJob::Initialize {
                    subject_id,
                    profile,
                });
                None
            }
            ClientFrame::UserInput { subject_id, text } => {
                self.enqueue(TurnJob::UserInput { subject_id, text });
                None
            }
        };
        if let Some(reply) = reply {
            let _ = self.connection.send_frame(&reply);
        }
    }

    /// Queue a job behind any turn in flight. Never rejects while the
    /// worker is running.
    fn enqueue(&self, job: TurnJob) {
        if let Err(e) = self.turns.send(job) {
            debug!(connection_id = %self.connection.id, job = ?e.0, "turn worker stopped");
        }
    }

    /// Mark the connection closed and stop the worker once any in-flight
    /// turn has finished.
    pub fn close(self) -> JoinHandle<()> {
        self.state.lock().close();
        self.cancel.cancel();
        self.worker
    }
}

/// Ordered output of one connection's turn worker.
struct ConnectionSink {
    connection_id: ConnectionId,
    out: mpsc::UnboundedSender<OutboundText>,
}

impl ConnectionSink {
    fn send_frame(&self, frame: &ServerFrame) {
        match frame.to_json() {
            // Fails only after the forwarder saw the writer go away.
            Ok(json) => {
                let _ = self.out.send(Arc::new(json));
            }
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "failed to serialize frame");
            }
        }
    }
}

impl TurnSink for ConnectionSink {
    fn emit(&self, event: TurnEvent) {
        self.send_frame(&frame_for_event(event));
    }
}

/// Move worker output into the writer's queue in order, waiting for room.
async fn forward_turn_output(
    connection: Arc<Connection>,
    mut out: mpsc::UnboundedReceiver<OutboundText>,
) {
    while let Some(text) = out.recv().await {
        if !connection.deliver(text).await {
            // Frames for a connection that is gone are dropped silently.
            break;
        }
    }
}

/// Wire frame for a pipeline event.
pub fn frame_for_event(event: TurnEvent) -> ServerFrame {
    match event {
        TurnEvent::Processing { message } => ServerFrame::Processing { message },
        TurnEvent::Fragment { content } => ServerFrame::chunk(content),
        TurnEvent::Final {
            content,
            interaction_kind,
        } => ServerFrame::final_response(content, interaction_kind),
        TurnEvent::Error { message } => ServerFrame::error(message),
    }
}

#[instrument(skip_all, fields(connection_id = %sink.connection_id))]
async fn run_turn_worker(
    dispatcher: Arc<Dispatcher>,
    sink: ConnectionSink,
    state: Arc<Mutex<ConnectionState>>,
    mut jobs: mpsc::UnboundedReceiver<TurnJob>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        match job {
            TurnJob::Initialize {
                subject_id,
                profile,
            } => initialize(&dispatcher, &sink, &state, subject_id, profile).await,
            TurnJob::UserInput { subject_id, text } => {
                user_input(&dispatcher, &sink, &state, subject_id, text).await;
            }
        }
    }
    debug!("turn worker stopped");
}

async fn initialize(
    dispatcher: &Dispatcher,
    sink: &ConnectionSink,
    state: &Mutex<ConnectionState>,
    subject_id: String,
    profile: Option<Map<String, Value>>,
) {
    let begun = state.lock().begin_initialize(&subject_id);
    let previous = match begun {
        Ok(previous) => previous,
        Err(e) => {
            sink.send_frame(&ServerFrame::error(e.to_string()));
            return;
        }
    };
    let session = match dispatcher.sessions.get_or_load(&subject_id).await {
        Ok(session) => session,
        Err(e) => {
            warn!(subject_id, error = %e, "failed to load session");
            state.lock().abort_initialize(previous);
            sink.send_frame(&ServerFrame::error(format!(
                "could not load session for {subject_id}: {e}"
            )));
            return;
        }
    };
    let profile = {
        let mut session = session.lock().await;
        if let Some(hints) = &profile {
            session.merge_profile(hints);
        }
        session.profile.clone()
    };
    state.lock().finish_initialize();
    info!(subject_id, "session initialized");
    sink.send_frame(&ServerFrame::Initialized {
        subject_id,
        profile,
    });
}

async fn user_input(
    dispatcher: &Dispatcher,
    sink: &ConnectionSink,
    state: &Mutex<ConnectionState>,
    subject_id: String,
    text: String,
) {
    let checked = state.lock().check_turn(&subject_id);
    if let Err(e) = checked {
        debug!(subject_id, error = %e, "user_input rejected");
        sink.send_frame(&ServerFrame::error(e.to_string()));
        return;
    }
    let session = match dispatcher.sessions.get_or_load(&subject_id).await {
        Ok(session) => session,
        Err(e) => {
            warn!(subject_id, error = %e, "failed to load session");
            sink.send_frame(&ServerFrame::error(format!(
                "could not load session for {subject_id}: {e}"
            )));
            return;
        }
    };
    let mut session = session.lock().await;
    let outcome = dispatcher
        .pipeline
        .run_turn(&mut session, Message::user(text), sink)
        .await;
    match outcome {
        TurnOutcome::Completed { stage, plan, .. } => debug!(
            subject_id,
            stage = %stage,
            interaction = %plan.interaction_kind,
            "turn completed"
        ),
        TurnOutcome::Failed(e) => debug!(subject_id, error = %e, "turn failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parley_core::store::InMemorySessionStore;
    use parley_core::{Executor, GenerationError, InteractionKind, TemplateStore};
    use parley_engine::mock::{ScriptedExecutor, ScriptedPlanner};
    use parley_engine::PipelineConfig;
    use serde_json::json;
    use tokio::time::timeout;

    use crate::websocket::connection::OutboundText;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const STORY_PLAN: &str =
        r#"{"interactionType":"story","objectives":["listen"],"strategy":"Go slow"}"#;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        dispatch: ConnectionDispatch,
        rx: mpsc::Receiver<OutboundText>,
    }

    impl Harness {
        fn new(planner: ScriptedPlanner, executor: impl Executor + 'static) -> Self {
            Self::with_outbound_capacity(planner, executor, 64)
        }

        fn with_outbound_capacity(
            planner: ScriptedPlanner,
            executor: impl Executor + 'static,
            capacity: usize,
        ) -> Self {
            let store = Arc::new(InMemorySessionStore::new(10));
            let pipeline = TurnPipeline::new(
                Arc::new(planner),
                Arc::new(executor),
                store,
                Arc::new(TemplateStore::default()),
                PipelineConfig::default(),
            );
            let registry = Arc::new(SessionRegistry::new());
            let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::new(pipeline)));
            let (tx, rx) = mpsc::channel(capacity);
            let id = registry.register(tx);
            let connection = registry.lookup(&id).unwrap();
            let dispatch = dispatcher.attach(connection);
            Self {
                dispatcher,
                dispatch,
                rx,
            }
        }

        async fn next(&mut self) -> Value {
            let text = timeout(TIMEOUT, self.rx.recv()).await.unwrap().unwrap();
            serde_json::from_str(&text).unwrap()
        }

        /// Next frame that is not `processing`.
        async fn next_reply(&mut self) -> Value {
            loop {
                let frame = self.next().await;
                if frame["type"] != "processing" {
                    return frame;
                }
            }
        }

        async fn initialize(&mut self, subject: &str) {
            self.dispatch.handle_text(
                &json!({"type":"initialize","subjectId":subject,"profile":{"age":5}}).to_string(),
            );
            let frame = self.next().await;
            assert_eq!(frame["type"], "initialized");
        }
    }

    fn harness() -> Harness {
        Harness::new(
            ScriptedPlanner::always(STORY_PLAN),
            ScriptedExecutor::fragments(&["Once ", "upon"]),
        )
    }

    #[tokio::test]
    async fn ping_is_answered_in_any_state() {
        let mut h = harness();
        h.dispatch.handle_text(r#"{"type":"ping"}"#);
        assert_eq!(h.next().await, json!({"type":"pong"}));
    }

    #[tokio::test]
    async fn initialize_binds_session_and_echoes_profile() {
        let mut h = harness();
        h.dispatch
            .handle_text(r#"{"type":"initialize","subjectId":"kid","profile":{"age":5}}"#);
        let frame = h.next().await;
        assert_eq!(
            frame,
            json!({"type":"initialized","subjectId":"kid","profile":{"age":5}})
        );
        assert_eq!(
            h.dispatch.state(),
            ConnectionState::Ready {
                subject_id: "kid".into()
            }
        );
        assert_eq!(h.dispatcher.sessions().len(), 1);
    }

    #[tokio::test]
    async fn user_input_streams_then_finishes() {
        let mut h = harness();
        h.initialize("kid").await;
        h.dispatch
            .handle_text(r#"{"type":"user_input","subjectId":"kid","text":"story please"}"#);

        assert_eq!(h.next().await["type"], "processing");
        assert_eq!(
            h.next_reply().await,
            json!({"type":"stream_chunk","content":"Once ","isFinal":false})
        );
        assert_eq!(h.next_reply().await["content"], "upon");
        assert_eq!(
            h.next_reply().await,
            json!({"type":"final_response","content":"Once upon","isFinal":true,"interactionType":"story"})
        );

        let session = h.dispatcher.sessions().get("kid").unwrap();
        let session = session.lock().await;
        assert_eq!(session.history_len(), 2);
        assert_eq!(
            session.last_plan.as_ref().unwrap().interaction_kind,
            InteractionKind::Story
        );
    }

    #[tokio::test]
    async fn user_input_before_initialize_is_an_error() {
        let mut h = harness();
        h.dispatch
            .handle_text(r#"{"type":"user_input","subjectId":"kid","text":"hi"}"#);
        let frame = h.next().await;
        assert_eq!(frame["type"], "error");
        assert_eq!(h.dispatch.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn user_input_for_another_subject_is_an_error() {
        let mut h = harness();
        h.initialize("kid").await;
        h.dispatch
            .handle_text(r#"{"type":"user_input","subjectId":"other","text":"hi"}"#);
        let frame = h.next().await;
        assert_eq!(frame["type"], "error");
        assert!(frame["message"].as_str().unwrap().contains("other"));
    }

    #[tokio::test]
    async fn unknown_and_incomplete_frames_get_errors() {
        let mut h = harness();
        h.dispatch.handle_text(r#"{"type":"dance"}"#);
        let frame = h.next().await;
        assert_eq!(frame["type"], "error");
        assert!(frame["message"].as_str().unwrap().contains("dance"));

        h.dispatch.handle_text(r#"{"type":"initialize"}"#);
        assert_eq!(h.next().await["type"], "error");
        assert_eq!(h.dispatch.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn malformed_frames_get_no_reply() {
        let mut h = harness();
        h.dispatch.handle_text("not json");
        h.dispatch.handle_text("[1]");
        h.dispatch.handle_text(r#"{"no":"type"}"#);
        h.dispatch.handle_text(r#"{"type":"ping"}"#);
        // The first reply is the pong; nothing was queued before it.
        assert_eq!(h.next().await["type"], "pong");
    }

    #[tokio::test]
    async fn turns_run_in_arrival_order() {
        let mut h = Harness::new(
            ScriptedPlanner::always(STORY_PLAN).with_delay(Duration::from_millis(20)),
            ScriptedExecutor::echo(),
        );
        h.initialize("kid").await;
        for text in ["first", "second"] {
            h.dispatch.handle_text(
                &json!({"type":"user_input","subjectId":"kid","text":text}).to_string(),
            );
        }
        let mut finals = Vec::new();
        while finals.len() < 2 {
            let frame = h.next_reply().await;
            if frame["type"] == "final_response" {
                finals.push(frame["content"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(finals, vec!["story: first", "story: second"]);
    }

    #[tokio::test]
    async fn slow_reader_still_gets_every_fragment_and_the_final() {
        let words: Vec<String> = (0..100).map(|i| format!("w{i} ")).collect();
        let refs: Vec<&str> = words.iter().map(String::as_str).collect();
        let mut h = Harness::with_outbound_capacity(
            ScriptedPlanner::always(STORY_PLAN),
            ScriptedExecutor::fragments(&refs),
            4,
        );
        h.initialize("kid").await;
        h.dispatch
            .handle_text(r#"{"type":"user_input","subjectId":"kid","text":"go"}"#);

        // Let the turn finish while nobody reads the outbound queue.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut chunks = Vec::new();
        let final_frame = loop {
            let frame = h.next_reply().await;
            match frame["type"].as_str() {
                Some("stream_chunk") => chunks.push(frame["content"].as_str().unwrap().to_string()),
                _ => break frame,
            }
        };
        assert_eq!(chunks, words);
        assert_eq!(final_frame["type"], "final_response");
        assert_eq!(final_frame["content"], words.concat());
        assert_eq!(h.dispatch.connection.dropped_frames(), 0);
    }

    #[tokio::test]
    async fn many_pending_turns_are_queued_not_rejected() {
        let mut h = Harness::new(
            ScriptedPlanner::always(STORY_PLAN).with_delay(Duration::from_millis(5)),
            ScriptedExecutor::echo(),
        );
        h.initialize("kid").await;
        let texts: Vec<String> = (0..50).map(|i| format!("turn {i}")).collect();
        for text in &texts {
            h.dispatch.handle_text(
                &json!({"type":"user_input","subjectId":"kid","text":text}).to_string(),
            );
        }

        let mut finals = Vec::new();
        while finals.len() < texts.len() {
            let frame = h.next_reply().await;
            assert_ne!(frame["type"], "error", "{frame}");
            if frame["type"] == "final_response" {
                finals.push(frame["content"].as_str().unwrap().to_string());
            }
        }
        let expected: Vec<String> = texts.iter().map(|t| format!("story: {t}")).collect();
        assert_eq!(finals, expected);
    }

    #[tokio::test]
    async fn stats_and_template_updates_are_inline() {
        let mut h = harness();
        h.dispatch.handle_text(r#"{"type":"stats"}"#);
        assert_eq!(
            h.next().await,
            json!({"type":"stats","connectionCount":1,"sessionCount":0})
        );

        h.dispatch
            .handle_text(r#"{"type":"update_templates","planner":"P {{history}}"}"#);
        assert_eq!(
            h.next().await,
            json!({"type":"templates_updated","revision":1})
        );
        assert_eq!(
            h.dispatcher.pipeline().templates().snapshot().planner,
            "P {{history}}"
        );

        h.dispatch.handle_text(r#"{"type":"update_templates"}"#);
        assert_eq!(h.next().await["type"], "error");
    }

    #[tokio::test]
    async fn close_stops_worker() {
        let h = harness();
        let state = Arc::clone(&h.dispatch.state);
        let worker = h.dispatch.close();
        timeout(TIMEOUT, worker).await.unwrap().unwrap();
        assert!(state.lock().is_closed());
    }

    #[tokio::test]
    async fn executor_failure_sends_one_error() {
        let mut h = Harness::new(
            ScriptedPlanner::always(STORY_PLAN),
            ScriptedExecutor::fragments(&["partial"])
                .failing_with(GenerationError::Timeout(Duration::from_secs(1))),
        );
        h.initialize("kid").await;
        h.dispatch
            .handle_text(r#"{"type":"user_input","subjectId":"kid","text":"hi"}"#);
        assert_eq!(h.next_reply().await["type"], "stream_chunk");
        let terminal = h.next_reply().await;
        assert_eq!(terminal["type"], "error");
        h.dispatch.handle_text(r#"{"type":"ping"}"#);
        assert_eq!(h.next_reply().await["type"], "pong");
    }
}

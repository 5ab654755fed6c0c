//! Interfaces to the services the turn pipeline depends on but does not own.

use async_trait::async_trait;

use crate::errors::{GenerationError, StoreError};
use crate::messages::Message;
use crate::plan::Plan;
use crate::session::SessionContext;

/// Input to the planning stage.
#[derive(Clone, Copy, Debug)]
pub struct PlanRequest<'a> {
    pub session: &'a SessionContext,
    /// Bounded window of recent history, oldest first. Includes the input.
    pub history: &'a [Message],
    pub template: &'a str,
}

/// Input to the execution stage.
#[derive(Clone, Copy, Debug)]
pub struct ExecuteRequest<'a> {
    pub session: &'a SessionContext,
    pub plan: &'a Plan,
    pub input: &'a Message,
    pub template: &'a str,
}

/// Fragment callback handed to [`Executor::generate`]. Accepts a `&str` of
/// any lifetime, so implementations may pass borrowed locals.
pub type OnFragment<'a> = dyn for<'f> Fn(&'f str) + Send + Sync + 'a;

/// Produces raw plan text for a turn. The text is expected to describe a
/// plan (or list of plans) as JSON, but callers must not rely on that.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn generate(&self, request: PlanRequest<'_>) -> Result<String, GenerationError>;
}

/// Produces the reply text for a turn, streaming fragments as they arrive.
///
/// The returned string is the final payload. Implementations may return an
/// empty string to signal that the concatenated fragments are the reply.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn generate(
        &self,
        request: ExecuteRequest<'_>,
        on_fragment: &OnFragment<'_>,
    ) -> Result<String, GenerationError>;
}

/// External persistence for session contexts.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the context for `subject_id`, creating an empty one if unknown.
    async fn load(&self, subject_id: &str) -> Result<SessionContext, StoreError>;

    async fn append(&self, subject_id: &str, message: Message) -> Result<(), StoreError>;
}

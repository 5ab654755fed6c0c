//! # parley-core
//!
//! Shared domain types for the parley turn server: connection ids, messages,
//! plans, session contexts, prompt templates, wire frames, and the
//! collaborator traits the turn pipeline is built against.

#![deny(unsafe_code)]

pub mod collaborators;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod plan;
pub mod protocol;
pub mod session;
pub mod store;
pub mod templates;

pub use collaborators::{ExecuteRequest, Executor, OnFragment, PlanRequest, Planner, SessionStore};
pub use errors::{GenerationError, StoreError};
pub use messages::{Message, Role};
pub use plan::{InteractionKind, Plan};
pub use protocol::{ClientFrame, DecodeError, ProtocolError, ServerFrame};
pub use session::SessionContext;
pub use templates::{PromptTemplates, TemplateStore, TemplateUpdate};

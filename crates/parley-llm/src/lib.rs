//! # parley-llm
//!
//! Generation collaborators backed by the Anthropic Messages API: a
//! streaming SSE client plus [`LlmPlanner`] and [`LlmExecutor`].

#![deny(unsafe_code)]

pub mod client;
pub mod errors;
pub mod generators;
pub mod sse;

pub use client::{AnthropicClient, ClientConfig, CompletionRequest, TextStream};
pub use errors::LlmError;
pub use generators::{executor_prompt, planner_prompt, LlmExecutor, LlmPlanner};

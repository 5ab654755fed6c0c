//! # parley-engine
//!
//! Turn processing: the [`plan_parser`] that turns unreliable planner output
//! into a [`parley_core::Plan`], and the [`pipeline`] that runs
//! planner → parser → streaming executor for one turn at a time.

#![deny(unsafe_code)]

pub mod mock;
pub mod pipeline;
pub mod plan_parser;

pub use pipeline::{PipelineConfig, TurnEvent, TurnOutcome, TurnPipeline, TurnSink};
pub use plan_parser::{parse_plan, ParseOutcome, ParseStage, PlanParser, RepairStage};

//! # trackbench-core
//!
//! Orchestration for the trackbench harness.
//!
//! This crate provides:
//! - Harness configuration loading (`config`)
//! - Test-case suite definitions (`cases`)
//! - The conversation pipeline state machine (`pipeline`)
//! - Session tracking, reporting, and run-over-run comparison (`tracker`)
//! - The sequential suite runner (`suite`)

mod cases;
mod config;
mod pipeline;
mod suite;
mod tracker;

pub use cases::{CaseError, CaseSuite, SuiteMetadata, TestCase};
pub use config::{
    ChatSection, ConfigError, HarnessConfig, PipelineSection, RubricCriterion, TrackingSection,
    WorkerSection,
};
pub use pipeline::{ConversationPipeline, PipelineSettings, StageError};
pub use suite::{run_suite, SuiteOptions};
pub use tracker::{
    AttentionEntry, CaseDelta, Report, SessionComparison, SessionTracker, TrackerError,
};

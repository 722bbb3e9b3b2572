//! Decision core for Gapwise.
//!
//! This crate turns a technician's query into a routed, scored, traced
//! answer and keeps the knowledge store improving:
//! - [`classifier`]: vendor/equipment/identifier extraction
//! - [`coverage`]: retrieval reduced to `NONE | THIN | STRONG`
//! - [`orchestrator`]: route selection and dispatch (`A`–`D`)
//! - [`confidence`]: five-dimension scoring and escalation
//! - [`gaps`] and [`filler`]: gap detection and research-driven filling
//! - [`feedback`], [`trace`], [`reload`]: the loops that run beside a query

pub mod classifier;
pub mod completion;
pub mod confidence;
pub mod coverage;
pub mod feedback;
pub mod filler;
pub mod gaps;
pub mod orchestrator;
pub mod reload;
pub mod specialists;
pub mod system;
pub mod trace;

pub use classifier::Classifier;
pub use completion::OpenRouterClient;
pub use coverage::CoverageEvaluator;
pub use feedback::{FeedbackLoop, FeedbackOutcome};
pub use filler::{GapFillDispatcher, GapFiller};
pub use orchestrator::{Orchestrator, select_route};
pub use reload::ConfigHandle;
pub use specialists::{CompletionSpecialist, ExtractiveSpecialist, SpecialistTable};
pub use system::System;
pub use trace::BackgroundQueue;

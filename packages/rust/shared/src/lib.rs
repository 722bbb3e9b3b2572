//! Shared types, error model, configuration, and collaborator traits for Gapwise.
//!
//! This crate is the foundation depended on by all other Gapwise crates.
//! It provides:
//! - [`GapwiseError`], the unified error type
//! - Domain types ([`Query`], [`Intent`], [`KnowledgeUnit`], [`CoverageResult`], [`Response`])
//! - Gap and research types ([`KnowledgeGap`], [`ResearchTask`], [`ProposedUnit`])
//! - Configuration ([`AppConfig`], config loading)
//! - Collaborator traits ([`Retriever`], [`Specialist`], [`CompletionProvider`], ...)

pub mod config;
pub mod error;
pub mod gap;
pub mod text;
pub mod traits;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CompletionConfig, ConfidenceConfig, ConfidenceWeights, CoverageConfig, GapsConfig,
    OverflowPolicy, ReloadConfig, ResearchConfig, RoutingConfig, StoreConfig, TraceConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{GapwiseError, Result};
pub use gap::{
    CostTier, FilledGap, Finding, GapEntities, GapPriority, GapType, InsertOutcome, KnowledgeGap,
    ProposalStatus, ProposedUnit, ResearchJob, ResearchResult, ResearchSource, ResearchTask,
    SourceKind,
};
pub use text::{STOP_WORDS, is_stop_word};
pub use traits::{
    Completion, CompletionProvider, CompletionRequest, ExampleRetriever, KnowledgeWriter,
    ManualHit, ManualSearch, ResearchBackend, Retriever, SearchFilters, Specialist,
    SpecialistAnswer, TraceSink,
};
pub use types::{
    Clarification, ClarificationField, ConfidenceAssessment, CoverageLevel, CoverageResult,
    DimensionScores, EquipmentType, EscalationReason, FeedbackPolarity, FeedbackSignal,
    FeedbackStats, Intent, IntentCategory, KnowledgeUnit, PastCase, Query, QueryId, QuerySource,
    Response, Route, RoutingDecision, ScoredAtom, SpecialistId, TraceRecord, ValidationStatus,
    Vendor, content_hash,
};

//! Collaborator contracts consumed by the decision core.
//!
//! Each trait is object-safe (`async_trait`) so the core holds
//! `Arc<dyn Trait>` and tests substitute in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::gap::{CostTier, InsertOutcome, KnowledgeGap, ProposedUnit, ResearchJob, ResearchResult, ResearchTask};
use crate::types::{
    EquipmentType, FeedbackPolarity, FeedbackStats, Intent, KnowledgeUnit, PastCase, Query,
    ScoredAtom, SpecialistId, TraceRecord, Vendor,
};

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// Tag filters applied by a [`Retriever`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Restrict to this vendor; `generic` atoms always pass.
    pub vendor: Option<Vendor>,
    pub equipment: Option<EquipmentType>,
}

impl SearchFilters {
    /// Filters from a classified intent; unknown tags become "no filter".
    pub fn from_intent(intent: &Intent) -> Self {
        Self {
            vendor: intent.vendor.is_known().then_some(intent.vendor),
            equipment: intent.equipment.is_known().then_some(intent.equipment),
        }
    }
}

/// Scored knowledge retrieval.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return up to `limit` atoms matching `text`, in any order.
    async fn search(&self, text: &str, filters: &SearchFilters, limit: usize)
    -> Result<Vec<ScoredAtom>>;
}

/// Similar resolved past cases.
#[async_trait]
pub trait ExampleRetriever: Send + Sync {
    async fn similar_cases(&self, query: &Query, limit: usize) -> Result<Vec<PastCase>>;
}

// ---------------------------------------------------------------------------
// Specialists & completion
// ---------------------------------------------------------------------------

/// Answer produced by a specialist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecialistAnswer {
    pub text: String,
    /// Citation labels; each should name an atom the answer used.
    pub citations: Vec<String>,
    /// Provider-reported token usage, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

/// A vendor/equipment domain responder.
#[async_trait]
pub trait Specialist: Send + Sync {
    fn id(&self) -> SpecialistId;

    async fn answer(
        &self,
        query: &Query,
        intent: &Intent,
        atoms: &[ScoredAtom],
        examples: &[PastCase],
    ) -> Result<SpecialistAnswer>;
}

/// A chat-completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub prompt: String,
    /// Overrides the provider's default model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            model: None,
            max_tokens: 1_024,
            temperature: 0.2,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// SHA-256 over the prompt and every generation parameter.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.system.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.prompt.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.model.as_deref().unwrap_or_default().as_bytes());
        hasher.update(self.max_tokens.to_le_bytes());
        hasher.update(self.temperature.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A completion result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub model: String,
    /// Prompt + completion tokens when the provider reports usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    /// Served from the response cache.
    #[serde(default)]
    pub cached: bool,
}

/// Text completion provider.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest, timeout: Duration) -> Result<Completion>;
}

// ---------------------------------------------------------------------------
// Research & manuals
// ---------------------------------------------------------------------------

/// A research backend with a price tier and reliability estimate.
#[async_trait]
pub trait ResearchBackend: Send + Sync {
    fn name(&self) -> &str;

    fn cost_tier(&self) -> CostTier;

    /// Historical reliability, 0.0–1.0; scales finding confidence.
    fn reliability(&self) -> f64;

    async fn execute(&self, task: &ResearchTask) -> Result<ResearchResult>;
}

/// A hit from the equipment manual index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualHit {
    pub title: String,
    pub url: String,
    pub excerpt: String,
}

/// Optional manual search used by Route C.
#[async_trait]
pub trait ManualSearch: Send + Sync {
    async fn search(&self, intent: &Intent, query: &Query) -> Result<Vec<ManualHit>>;
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Write side of the knowledge store.
#[async_trait]
pub trait KnowledgeWriter: Send + Sync {
    /// Insert an atom; an existing content hash yields [`InsertOutcome::Duplicate`].
    async fn insert_atom(&self, atom: &KnowledgeUnit) -> Result<InsertOutcome>;

    async fn get_atom(&self, id: &str) -> Result<Option<KnowledgeUnit>>;

    /// Store a proposal for human review.
    async fn store_proposal(&self, proposal: &ProposedUnit) -> Result<()>;

    /// Append a detected gap to the audit log.
    async fn record_gap(&self, gap: &KnowledgeGap) -> Result<()>;

    /// Insert or update a research job row.
    async fn record_research_job(&self, job: &ResearchJob) -> Result<()>;

    /// Apply one feedback event. `newly_flagged` is true for exactly one
    /// event per atom once `min_samples` is reached with a success rate
    /// below `success_floor`.
    async fn record_feedback(
        &self,
        atom_id: &str,
        polarity: FeedbackPolarity,
        min_samples: u32,
        success_floor: f64,
    ) -> Result<FeedbackStats>;

    /// Clear the low-satisfaction flag so the atom can be flagged again.
    async fn reset_feedback_flag(&self, atom_id: &str) -> Result<()>;
}

/// Append-only trace persistence.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn append(&self, record: &TraceRecord) -> Result<()>;
}

//! Knowledge gaps, research tasks/results, and proposed knowledge units.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GapwiseError;
use crate::types::{CoverageLevel, EquipmentType, KnowledgeUnit, Vendor};

// ---------------------------------------------------------------------------
// Gap
// ---------------------------------------------------------------------------

/// Why the knowledge store could not answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GapType {
    NoMatch,
    UnknownManufacturer,
    MissingIdentifier,
    UnknownModel,
    LowSatisfaction,
}

impl GapType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoMatch => "NO_MATCH",
            Self::UnknownManufacturer => "UNKNOWN_MANUFACTURER",
            Self::MissingIdentifier => "MISSING_IDENTIFIER",
            Self::UnknownModel => "UNKNOWN_MODEL",
            Self::LowSatisfaction => "LOW_SATISFACTION",
        }
    }
}

impl fmt::Display for GapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GapType {
    type Err = GapwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NO_MATCH" => Ok(Self::NoMatch),
            "UNKNOWN_MANUFACTURER" => Ok(Self::UnknownManufacturer),
            "MISSING_IDENTIFIER" => Ok(Self::MissingIdentifier),
            "UNKNOWN_MODEL" => Ok(Self::UnknownModel),
            "LOW_SATISFACTION" => Ok(Self::LowSatisfaction),
            other => Err(GapwiseError::parse(format!("unknown gap type '{other}'"))),
        }
    }
}

/// Research priority. Ordered `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GapPriority {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl GapPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for GapPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GapPriority {
    type Err = GapwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(GapwiseError::parse(format!("unknown priority '{other}'"))),
        }
    }
}

/// Kind of place research should look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ManufacturerSite,
    ManualsAggregator,
    ServiceBulletins,
    SafetyStandards,
    CommunityForum,
}

/// One research source in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchSource {
    pub kind: SourceKind,
    /// Site domain when the source is a single site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Identifiers extracted for a gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapEntities {
    pub vendor: Vendor,
    /// Manufacturer named in the query but not in the vendor set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrecognized_manufacturer: Option<String>,
    pub equipment: EquipmentType,
    #[serde(default)]
    pub model_numbers: Vec<String>,
    #[serde(default)]
    pub fault_codes: Vec<String>,
    /// Atom that triggered a `LOW_SATISFACTION` gap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atom_id: Option<String>,
}

impl GapEntities {
    /// Manufacturer label for search terms: recognized vendor, else the raw name.
    pub fn manufacturer(&self) -> Option<String> {
        if self.vendor.is_known() {
            Some(self.vendor.display_name().to_string())
        } else {
            self.unrecognized_manufacturer.clone()
        }
    }
}

/// A detected deficiency in the knowledge store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGap {
    pub id: String,
    pub query_text: String,
    pub gap_type: GapType,
    pub entities: GapEntities,
    pub priority: GapPriority,
    /// Deduplicated search terms; never empty.
    pub search_terms: Vec<String>,
    pub sources: Vec<ResearchSource>,
    pub coverage_level: CoverageLevel,
    pub detected_at: DateTime<Utc>,
}

impl KnowledgeGap {
    pub fn new_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Whether this gap should be sent for filling (not just audited).
    pub fn needs_fill(&self) -> bool {
        self.coverage_level < CoverageLevel::Strong || self.gap_type == GapType::LowSatisfaction
    }
}

// ---------------------------------------------------------------------------
// Research
// ---------------------------------------------------------------------------

/// Relative price of a research backend. Ordered cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Free,
    Cheap,
    Premium,
}

/// A unit of research work derived from one gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchTask {
    pub id: String,
    pub gap_id: String,
    pub gap_type: GapType,
    pub objective: String,
    /// Sub-queries to run; shape depends on the gap type.
    pub queries: Vec<String>,
    pub entities: GapEntities,
    pub priority: GapPriority,
    pub sources: Vec<ResearchSource>,
    pub timeout_secs: u64,
}

impl ResearchTask {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One extracted piece of knowledge from a research backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Backend-reported confidence, 0.0–1.0.
    pub confidence: f64,
}

/// Output of a research backend for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    pub task_id: String,
    pub summary: String,
    pub findings: Vec<Finding>,
    pub citations: Vec<String>,
    pub cost_usd: f64,
    /// Name of the backend that served the task.
    pub backend: String,
    pub elapsed_ms: u64,
}

// ---------------------------------------------------------------------------
// Proposals
// ---------------------------------------------------------------------------

/// Review state of a research-produced candidate atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Inserted,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Inserted => "inserted",
        }
    }
}

impl FromStr for ProposalStatus {
    type Err = GapwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "inserted" => Ok(Self::Inserted),
            other => Err(GapwiseError::parse(format!("unknown proposal status '{other}'"))),
        }
    }
}

/// A candidate knowledge unit produced by research.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedUnit {
    pub id: String,
    pub gap_id: String,
    pub task_id: String,
    pub unit: KnowledgeUnit,
    /// Finding confidence × backend reliability.
    pub confidence: f64,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

/// Result of an atom insert under optimistic concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    /// An atom with the same content hash already exists.
    Duplicate,
}

/// Summary of one gap fill.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilledGap {
    pub gap_id: String,
    pub task_id: String,
    pub backend: String,
    /// Ids of atoms inserted into the store.
    pub inserted: Vec<String>,
    pub duplicates: usize,
    /// `(proposal id, error)` for inserts that failed.
    pub failed: Vec<(String, String)>,
    /// Ids of proposals held for human approval.
    pub pending: Vec<String>,
    /// Findings dropped as empty or too short.
    pub dropped: usize,
    pub cost_usd: f64,
}

/// Bookkeeping row for one research execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchJob {
    pub task_id: String,
    pub gap_id: String,
    pub priority: GapPriority,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    pub succeeded: bool,
    pub findings: usize,
    pub inserted: usize,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

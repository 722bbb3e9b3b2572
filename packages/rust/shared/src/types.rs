//! Core domain types: queries, intents, knowledge units, coverage, routing,
//! confidence assessments, responses, and trace records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::GapwiseError;

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for query identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(pub Uuid);

impl QueryId {
    /// Generate a new time-sortable query identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// How the query text reached the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    #[default]
    Text,
    /// Transcribed speech; transcription noise makes regex extraction less reliable.
    Voice,
    /// Text accompanied by an OCR/vision-extracted nameplate or screen.
    Image,
}

/// A technician's question. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: QueryId,
    /// Raw question text.
    pub text: String,
    /// Text extracted from an attached image (nameplate, HMI screen).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_text: Option<String>,
    #[serde(default)]
    pub source: QuerySource,
    pub channel_id: String,
    pub user_id: String,
    pub received_at: DateTime<Utc>,
}

impl Query {
    /// Create a plain-text query on the default channel.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: QueryId::new(),
            text: text.into(),
            image_text: None,
            source: QuerySource::Text,
            channel_id: "default".into(),
            user_id: "anonymous".into(),
            received_at: Utc::now(),
        }
    }

    /// Attach image-derived text; marks the query as image-sourced.
    pub fn with_image_text(mut self, image_text: impl Into<String>) -> Self {
        self.image_text = Some(image_text.into());
        self.source = QuerySource::Image;
        self
    }

    pub fn with_source(mut self, source: QuerySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = channel_id.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Query text followed by any image-derived text.
    pub fn full_text(&self) -> String {
        match &self.image_text {
            Some(extra) if !extra.trim().is_empty() => format!("{}\n{}", self.text, extra),
            _ => self.text.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Vendor / equipment / intent
// ---------------------------------------------------------------------------

/// Equipment manufacturer. The closed set mirrors the specialist table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    Siemens,
    Rockwell,
    Abb,
    Schneider,
    Mitsubishi,
    Omron,
    Fanuc,
    Yaskawa,
    Danfoss,
    /// Vendor-neutral knowledge (applies to any manufacturer).
    Generic,
    /// Not identified.
    Unknown,
}

impl Vendor {
    /// Every concrete manufacturer, in classifier match order.
    pub const KNOWN: [Vendor; 9] = [
        Vendor::Siemens,
        Vendor::Rockwell,
        Vendor::Abb,
        Vendor::Schneider,
        Vendor::Mitsubishi,
        Vendor::Omron,
        Vendor::Fanuc,
        Vendor::Yaskawa,
        Vendor::Danfoss,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Siemens => "siemens",
            Self::Rockwell => "rockwell",
            Self::Abb => "abb",
            Self::Schneider => "schneider",
            Self::Mitsubishi => "mitsubishi",
            Self::Omron => "omron",
            Self::Fanuc => "fanuc",
            Self::Yaskawa => "yaskawa",
            Self::Danfoss => "danfoss",
            Self::Generic => "generic",
            Self::Unknown => "unknown",
        }
    }

    /// Human-facing manufacturer name used in search terms.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Siemens => "Siemens",
            Self::Rockwell => "Allen-Bradley",
            Self::Abb => "ABB",
            Self::Schneider => "Schneider Electric",
            Self::Mitsubishi => "Mitsubishi",
            Self::Omron => "Omron",
            Self::Fanuc => "FANUC",
            Self::Yaskawa => "Yaskawa",
            Self::Danfoss => "Danfoss",
            Self::Generic => "generic",
            Self::Unknown => "unknown",
        }
    }

    /// Manufacturer documentation domain, for site-restricted searches.
    pub fn domain(&self) -> Option<&'static str> {
        match self {
            Self::Siemens => Some("support.industry.siemens.com"),
            Self::Rockwell => Some("literature.rockwellautomation.com"),
            Self::Abb => Some("library.abb.com"),
            Self::Schneider => Some("se.com"),
            Self::Mitsubishi => Some("mitsubishielectric.com"),
            Self::Omron => Some("industrial.omron.com"),
            Self::Fanuc => Some("fanucamerica.com"),
            Self::Yaskawa => Some("yaskawa.com"),
            Self::Danfoss => Some("danfoss.com"),
            Self::Generic | Self::Unknown => None,
        }
    }

    /// Whether this is a concrete manufacturer.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Generic | Self::Unknown)
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = GapwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "siemens" => Ok(Self::Siemens),
            "rockwell" => Ok(Self::Rockwell),
            "abb" => Ok(Self::Abb),
            "schneider" => Ok(Self::Schneider),
            "mitsubishi" => Ok(Self::Mitsubishi),
            "omron" => Ok(Self::Omron),
            "fanuc" => Ok(Self::Fanuc),
            "yaskawa" => Ok(Self::Yaskawa),
            "danfoss" => Ok(Self::Danfoss),
            "generic" => Ok(Self::Generic),
            "unknown" => Ok(Self::Unknown),
            other => Err(GapwiseError::parse(format!("unknown vendor '{other}'"))),
        }
    }
}

/// Coarse equipment class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentType {
    Plc,
    Drive,
    Hmi,
    Robot,
    Servo,
    Motor,
    Sensor,
    Conveyor,
    Compressor,
    Pump,
    Unknown,
}

impl EquipmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plc => "plc",
            Self::Drive => "drive",
            Self::Hmi => "hmi",
            Self::Robot => "robot",
            Self::Servo => "servo",
            Self::Motor => "motor",
            Self::Sensor => "sensor",
            Self::Conveyor => "conveyor",
            Self::Compressor => "compressor",
            Self::Pump => "pump",
            Self::Unknown => "unknown",
        }
    }

    /// Search-friendly label ("PLC", "VFD drive").
    pub fn search_label(&self) -> &'static str {
        match self {
            Self::Plc => "PLC",
            Self::Drive => "VFD drive",
            Self::Hmi => "HMI",
            Self::Robot => "robot",
            Self::Servo => "servo drive",
            Self::Motor => "motor",
            Self::Sensor => "sensor",
            Self::Conveyor => "conveyor",
            Self::Compressor => "compressor",
            Self::Pump => "pump",
            Self::Unknown => "equipment",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for EquipmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EquipmentType {
    type Err = GapwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plc" => Ok(Self::Plc),
            "drive" => Ok(Self::Drive),
            "hmi" => Ok(Self::Hmi),
            "robot" => Ok(Self::Robot),
            "servo" => Ok(Self::Servo),
            "motor" => Ok(Self::Motor),
            "sensor" => Ok(Self::Sensor),
            "conveyor" => Ok(Self::Conveyor),
            "compressor" => Ok(Self::Compressor),
            "pump" => Ok(Self::Pump),
            "unknown" => Ok(Self::Unknown),
            other => Err(GapwiseError::parse(format!("unknown equipment type '{other}'"))),
        }
    }
}

/// Coarse intent category of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    Troubleshooting,
    Procedure,
    Specification,
    Safety,
    #[default]
    General,
}

impl IntentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Troubleshooting => "troubleshooting",
            Self::Procedure => "procedure",
            Self::Specification => "specification",
            Self::Safety => "safety",
            Self::General => "general",
        }
    }
}

impl fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentCategory {
    type Err = GapwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "troubleshooting" => Ok(Self::Troubleshooting),
            "procedure" => Ok(Self::Procedure),
            "specification" => Ok(Self::Specification),
            "safety" => Ok(Self::Safety),
            "general" => Ok(Self::General),
            other => Err(GapwiseError::parse(format!("unknown intent category '{other}'"))),
        }
    }
}

/// Classifier output. Consumed read-only downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub vendor: Vendor,
    pub equipment: EquipmentType,
    /// Fault/alarm codes in order of appearance.
    pub fault_codes: Vec<String>,
    /// Model or part numbers in order of appearance.
    pub model_numbers: Vec<String>,
    pub category: IntentCategory,
    /// Classification confidence, 0.0–1.0.
    pub confidence: f64,
    /// Validation notes (e.g. vendor/part-number mismatch).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Intent {
    /// Low-confidence intent returned for ambiguous input.
    pub fn unknown() -> Self {
        Self {
            vendor: Vendor::Unknown,
            equipment: EquipmentType::Unknown,
            fault_codes: Vec::new(),
            model_numbers: Vec::new(),
            category: IntentCategory::General,
            confidence: 0.0,
            notes: Vec::new(),
        }
    }

    /// An intent is clear when something concrete about the equipment is known.
    pub fn is_clear(&self) -> bool {
        self.vendor.is_known()
            || self.equipment.is_known()
            || !self.fault_codes.is_empty()
            || !self.model_numbers.is_empty()
    }

    /// Most specific identifier: first model number, else first fault code.
    pub fn primary_identifier(&self) -> Option<&str> {
        self.model_numbers
            .first()
            .or_else(|| self.fault_codes.first())
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Knowledge units
// ---------------------------------------------------------------------------

/// Review state of a knowledge unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Validated,
    Unverified,
    Pending,
    Deprecated,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validated => "validated",
            Self::Unverified => "unverified",
            Self::Pending => "pending",
            Self::Deprecated => "deprecated",
        }
    }
}

impl FromStr for ValidationStatus {
    type Err = GapwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validated" => Ok(Self::Validated),
            "unverified" => Ok(Self::Unverified),
            "pending" => Ok(Self::Pending),
            "deprecated" => Ok(Self::Deprecated),
            other => Err(GapwiseError::parse(format!("unknown validation status '{other}'"))),
        }
    }
}

/// A titled, citable piece of domain knowledge ("atom").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeUnit {
    pub id: String,
    pub title: String,
    pub content: String,
    pub vendor: Vendor,
    pub equipment: EquipmentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub validation: ValidationStatus,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
    /// SHA-256 of the normalized title + content; the store deduplicates on it.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeUnit {
    /// Create a new unverified unit with a fresh id and computed content hash.
    pub fn new(
        title: impl Into<String>,
        content: impl Into<String>,
        vendor: Vendor,
        equipment: EquipmentType,
    ) -> Self {
        let title = title.into();
        let content = content.into();
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            content_hash: content_hash(&title, &content),
            title,
            content,
            vendor,
            equipment,
            source_url: None,
            validation: ValidationStatus::Unverified,
            success_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_source(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_validation(mut self, status: ValidationStatus) -> Self {
        self.validation = status;
        self
    }

    /// Success rate over all feedback, or `None` with no feedback yet.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success_count + self.failure_count;
        (total > 0).then(|| f64::from(self.success_count) / f64::from(total))
    }

    /// Citation label used in answers: `[title](source)` or the bare title.
    pub fn citation(&self) -> String {
        match &self.source_url {
            Some(url) => format!("{} <{url}>", self.title),
            None => self.title.clone(),
        }
    }
}

/// Compute the dedup hash for a knowledge unit.
pub fn content_hash(title: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(content.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A knowledge unit with its relevance score for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredAtom {
    pub atom: KnowledgeUnit,
    pub score: f64,
}

// ---------------------------------------------------------------------------
// Coverage & routing
// ---------------------------------------------------------------------------

/// Qualitative sufficiency of retrieved knowledge for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoverageLevel {
    None,
    Thin,
    Strong,
}

impl CoverageLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Thin => "THIN",
            Self::Strong => "STRONG",
        }
    }
}

impl fmt::Display for CoverageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coverage evaluation for one query. Recomputed per query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageResult {
    pub level: CoverageLevel,
    /// Retrieved atoms, best first.
    pub atoms: Vec<ScoredAtom>,
    /// Best match score; `None` when nothing was retrieved.
    pub best_score: Option<f64>,
    /// False when retrieval was skipped (unclear intent).
    pub evaluated: bool,
}

impl CoverageResult {
    /// Placeholder for queries routed without retrieval.
    pub fn not_evaluated() -> Self {
        Self {
            level: CoverageLevel::None,
            atoms: Vec::new(),
            best_score: None,
            evaluated: false,
        }
    }
}

/// Orchestration strategy, selected once per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Route {
    #[serde(rename = "A_STRONG")]
    AStrong,
    #[serde(rename = "B_THIN")]
    BThin,
    #[serde(rename = "C_NONE")]
    CNone,
    #[serde(rename = "D_UNCLEAR")]
    DUnclear,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AStrong => "A_STRONG",
            Self::BThin => "B_THIN",
            Self::CNone => "C_NONE",
            Self::DUnclear => "D_UNCLEAR",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Route {
    type Err = GapwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A_STRONG" => Ok(Self::AStrong),
            "B_THIN" => Ok(Self::BThin),
            "C_NONE" => Ok(Self::CNone),
            "D_UNCLEAR" => Ok(Self::DUnclear),
            other => Err(GapwiseError::parse(format!("unknown route '{other}'"))),
        }
    }
}

/// Key of the specialist dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialistId {
    Siemens,
    Rockwell,
    Abb,
    Schneider,
    Fanuc,
    Generic,
}

impl SpecialistId {
    pub const ALL: [SpecialistId; 6] = [
        SpecialistId::Siemens,
        SpecialistId::Rockwell,
        SpecialistId::Abb,
        SpecialistId::Schneider,
        SpecialistId::Fanuc,
        SpecialistId::Generic,
    ];

    /// Select the specialist for a classified intent.
    pub fn for_intent(intent: &Intent) -> Self {
        match intent.vendor {
            Vendor::Siemens => Self::Siemens,
            Vendor::Rockwell => Self::Rockwell,
            Vendor::Abb => Self::Abb,
            Vendor::Schneider => Self::Schneider,
            Vendor::Fanuc => Self::Fanuc,
            _ => Self::Generic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Siemens => "siemens",
            Self::Rockwell => "rockwell",
            Self::Abb => "abb",
            Self::Schneider => "schneider",
            Self::Fanuc => "fanuc",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for SpecialistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The orchestrator's one-time routing decision for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub route: Route,
    pub specialist: SpecialistId,
    pub coverage: CoverageResult,
    pub intent: Intent,
}

// ---------------------------------------------------------------------------
// Confidence
// ---------------------------------------------------------------------------

/// Per-dimension answer quality scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub relevance: f64,
    pub completeness: f64,
    pub accuracy: f64,
    pub safety: f64,
    pub clarity: f64,
}

/// Machine-readable reason an answer was escalated to a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationReason {
    LowOverall,
    SafetyFloor,
    LowAccuracy,
    DangerousProcedure,
}

impl EscalationReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::LowOverall => "LOW_OVERALL",
            Self::SafetyFloor => "SAFETY_FLOOR",
            Self::LowAccuracy => "LOW_ACCURACY",
            Self::DangerousProcedure => "DANGEROUS_PROCEDURE",
        }
    }
}

/// Quality assessment of one produced answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAssessment {
    pub scores: DimensionScores,
    /// Weighted (convex) combination of the dimension scores.
    pub overall: f64,
    pub escalate: bool,
    pub reasons: Vec<EscalationReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Response & trace
// ---------------------------------------------------------------------------

/// Information the technician is asked to supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationField {
    EquipmentModel,
    FaultCode,
    Symptom,
}

/// Structured clarification request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub prompt: String,
    pub missing: Vec<ClarificationField>,
}

/// Terminal artifact returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub query_id: QueryId,
    pub text: String,
    pub citations: Vec<String>,
    pub route: Route,
    pub specialist: SpecialistId,
    /// Absent for clarification-only responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceAssessment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Clarification>,
    /// Caveats attached to the answer ("coverage is limited", "unverified").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qualifiers: Vec<String>,
    pub research_triggered: bool,
    /// The selected route's primary path failed and a fallback answered.
    pub degraded: bool,
    /// Id of the knowledge gap queued for enrichment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_id: Option<String>,
    /// Ids of the atoms the answer was grounded on.
    #[serde(default)]
    pub atom_ids: Vec<String>,
    pub latency_ms: u64,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

impl Response {
    pub fn escalated(&self) -> bool {
        self.confidence.as_ref().is_some_and(|c| c.escalate)
    }
}

/// Longest answer prefix kept on a trace for similar-case lookup.
const TRACE_EXCERPT_CHARS: usize = 280;

/// Append-only trace of a completed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub query_id: QueryId,
    pub query_text: String,
    pub answer_excerpt: String,
    pub route: Route,
    pub specialist: SpecialistId,
    pub atom_count: usize,
    pub atom_ids: Vec<String>,
    pub latency_ms: u64,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub research_triggered: bool,
    pub escalated: bool,
    pub recorded_at: DateTime<Utc>,
}

impl TraceRecord {
    pub fn new(query: &Query, response: &Response) -> Self {
        Self {
            query_id: response.query_id,
            query_text: query.text.clone(),
            answer_excerpt: response.text.chars().take(TRACE_EXCERPT_CHARS).collect(),
            route: response.route,
            specialist: response.specialist,
            atom_count: response.atom_ids.len(),
            atom_ids: response.atom_ids.clone(),
            latency_ms: response.latency_ms,
            tokens_used: response.tokens_used,
            cost_usd: response.cost_usd,
            research_triggered: response.research_triggered,
            escalated: response.escalated(),
            recorded_at: Utc::now(),
        }
    }
}

/// A previously answered query, offered to specialists as context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PastCase {
    pub query_text: String,
    pub answer_excerpt: String,
    pub route: Route,
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackPolarity {
    Positive,
    Negative,
}

impl FromStr for FeedbackPolarity {
    type Err = GapwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "positive" | "pos" | "+" | "up" => Ok(Self::Positive),
            "negative" | "neg" | "-" | "down" => Ok(Self::Negative),
            other => Err(GapwiseError::parse(format!(
                "feedback must be 'positive' or 'negative', got '{other}'"
            ))),
        }
    }
}

/// External quality signal on one knowledge unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackSignal {
    pub atom_id: String,
    pub polarity: FeedbackPolarity,
}

/// Counters after applying one feedback event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub atom_id: String,
    pub success_count: u32,
    pub failure_count: u32,
    /// True only for the event that first set the low-satisfaction flag.
    pub newly_flagged: bool,
}

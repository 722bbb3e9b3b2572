//! Vendor specialists and the enum-keyed dispatch table.
//!
//! The table is built once at startup and always holds a generic entry, so
//! lookup for any [`SpecialistId`] yields a specialist.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use gapwise_shared::{
    CompletionConfig, CompletionProvider, CompletionRequest, GapwiseError, Intent, PastCase,
    Query, Result, ScoredAtom, Specialist, SpecialistAnswer, SpecialistId,
};

/// Atoms included in a specialist prompt or extractive answer.
const MAX_CONTEXT_ATOMS: usize = 5;

/// Citation markers the completion specialist is asked to emit: `[atom:<id>]`.
static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[atom:([A-Za-z0-9-]+)\]").expect("valid regex"));

// ---------------------------------------------------------------------------
// Dispatch table
// ---------------------------------------------------------------------------

/// `SpecialistId` → specialist, with a mandatory generic fallback.
#[derive(Clone)]
pub struct SpecialistTable {
    entries: HashMap<SpecialistId, Arc<dyn Specialist>>,
    generic: Arc<dyn Specialist>,
}

impl SpecialistTable {
    pub fn new(generic: Arc<dyn Specialist>) -> Self {
        Self {
            entries: HashMap::new(),
            generic,
        }
    }

    /// Register a specialist under its own id. A generic specialist replaces the fallback.
    pub fn register(mut self, specialist: Arc<dyn Specialist>) -> Self {
        match specialist.id() {
            SpecialistId::Generic => self.generic = specialist,
            id => {
                self.entries.insert(id, specialist);
            }
        }
        self
    }

    /// Completion-backed specialists for every id.
    pub fn completion(provider: Arc<dyn CompletionProvider>, config: &CompletionConfig) -> Self {
        let mut table = Self::new(Arc::new(CompletionSpecialist::new(
            SpecialistId::Generic,
            provider.clone(),
            config,
        )));
        for id in SpecialistId::ALL.into_iter().filter(|id| *id != SpecialistId::Generic) {
            table = table.register(Arc::new(CompletionSpecialist::new(id, provider.clone(), config)));
        }
        table
    }

    /// Extractive specialists for every id (no completion provider needed).
    pub fn extractive() -> Self {
        let mut table = Self::new(Arc::new(ExtractiveSpecialist::new(SpecialistId::Generic)));
        for id in SpecialistId::ALL.into_iter().filter(|id| *id != SpecialistId::Generic) {
            table = table.register(Arc::new(ExtractiveSpecialist::new(id)));
        }
        table
    }

    /// The specialist for `id`, falling back to the generic entry.
    pub fn get(&self, id: SpecialistId) -> Arc<dyn Specialist> {
        self.entries.get(&id).cloned().unwrap_or_else(|| self.generic.clone())
    }
}

// ---------------------------------------------------------------------------
// Completion specialist
// ---------------------------------------------------------------------------

fn persona(id: SpecialistId) -> &'static str {
    match id {
        SpecialistId::Siemens => "a Siemens automation field engineer (SIMATIC S7, TIA Portal, SINAMICS drives)",
        SpecialistId::Rockwell => "an Allen-Bradley controls engineer (ControlLogix, CompactLogix, PowerFlex, PanelView)",
        SpecialistId::Abb => "an ABB drives and robotics service engineer (ACS drives, IRB robots)",
        SpecialistId::Schneider => "a Schneider Electric service engineer (Modicon PLCs, Altivar drives)",
        SpecialistId::Fanuc => "a FANUC robot and CNC service technician",
        SpecialistId::Generic => "an experienced industrial maintenance technician",
    }
}

/// Answers through a completion model, grounded on retrieved atoms.
pub struct CompletionSpecialist {
    id: SpecialistId,
    provider: Arc<dyn CompletionProvider>,
    max_tokens: u32,
    call_timeout: Duration,
}

impl CompletionSpecialist {
    pub fn new(id: SpecialistId, provider: Arc<dyn CompletionProvider>, config: &CompletionConfig) -> Self {
        Self {
            id,
            provider,
            max_tokens: config.max_tokens,
            call_timeout: config.timeout(),
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are {}. Answer the technician's question using only the numbered knowledge \
             units provided. Structure fault answers as cause, diagnostic checks, and resolution \
             steps; use numbered steps for procedures. Cite every unit you use as [atom:<id>]. \
             Always include lockout/tagout before work on energised equipment and never suggest \
             bypassing interlocks, guards, or emergency stops.",
            persona(self.id)
        )
    }

    fn prompt(query: &Query, intent: &Intent, atoms: &[ScoredAtom], examples: &[PastCase]) -> String {
        let mut prompt = String::new();
        if intent.vendor.is_known() || intent.equipment.is_known() {
            prompt.push_str(&format!(
                "Equipment: {} {}\n",
                intent.vendor.display_name(),
                intent.equipment.search_label()
            ));
        }
        if !intent.model_numbers.is_empty() {
            prompt.push_str(&format!("Models: {}\n", intent.model_numbers.join(", ")));
        }
        if !intent.fault_codes.is_empty() {
            prompt.push_str(&format!("Fault codes: {}\n", intent.fault_codes.join(", ")));
        }

        prompt.push_str("\nKnowledge units:\n");
        for (i, scored) in atoms.iter().take(MAX_CONTEXT_ATOMS).enumerate() {
            let atom = &scored.atom;
            prompt.push_str(&format!(
                "{}. [atom:{}] {}\n{}\n\n",
                i + 1,
                atom.id,
                atom.title,
                atom.content.trim()
            ));
        }

        if !examples.is_empty() {
            prompt.push_str("Similar resolved cases:\n");
            for case in examples {
                prompt.push_str(&format!("- Q: {}\n  A: {}\n", case.query_text, case.answer_excerpt));
            }
            prompt.push('\n');
        }

        prompt.push_str(&format!("Question: {}", query.full_text()));
        prompt
    }
}

/// Atom ids cited as `[atom:<id>]`, in order, deduplicated.
pub fn parse_citations(text: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for caps in CITATION_RE.captures_iter(text) {
        let id = caps[1].to_string();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

#[async_trait]
impl Specialist for CompletionSpecialist {
    fn id(&self) -> SpecialistId {
        self.id
    }

    async fn answer(
        &self,
        query: &Query,
        intent: &Intent,
        atoms: &[ScoredAtom],
        examples: &[PastCase],
    ) -> Result<SpecialistAnswer> {
        let request = CompletionRequest::new(Self::prompt(query, intent, atoms, examples))
            .with_system(self.system_prompt())
            .with_max_tokens(self.max_tokens);
        let completion = self
            .provider
            .complete(&request, self.call_timeout)
            .await
            .map_err(|e| GapwiseError::Specialist(format!("{}: {e}", self.id)))?;

        let citations = parse_citations(&completion.text);
        debug!(specialist = %self.id, citations = citations.len(), cached = completion.cached, "specialist answered");
        Ok(SpecialistAnswer {
            text: completion.text,
            citations,
            tokens_used: completion.tokens_used,
        })
    }
}

// ---------------------------------------------------------------------------
// Extractive specialist
// ---------------------------------------------------------------------------

/// Answers by quoting the best-scoring atoms verbatim.
pub struct ExtractiveSpecialist {
    id: SpecialistId,
}

impl ExtractiveSpecialist {
    pub fn new(id: SpecialistId) -> Self {
        Self { id }
    }
}

#[async_trait]
impl Specialist for ExtractiveSpecialist {
    fn id(&self) -> SpecialistId {
        self.id
    }

    async fn answer(
        &self,
        _query: &Query,
        _intent: &Intent,
        atoms: &[ScoredAtom],
        _examples: &[PastCase],
    ) -> Result<SpecialistAnswer> {
        if atoms.is_empty() {
            return Err(GapwiseError::Specialist(format!(
                "{}: no knowledge units to answer from",
                self.id
            )));
        }

        let mut text = String::new();
        let mut citations = Vec::new();
        for scored in atoms.iter().take(MAX_CONTEXT_ATOMS) {
            let atom = &scored.atom;
            text.push_str(&format!("{}\n{}\n\n", atom.title, atom.content.trim()));
            citations.push(atom.id.clone());
        }
        Ok(SpecialistAnswer {
            text: text.trim_end().to_string(),
            citations,
            tokens_used: Some(0),
        })
    }
}

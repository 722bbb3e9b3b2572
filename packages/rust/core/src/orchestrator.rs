//! Top-level query state machine.
//!
//! classify → evaluate coverage → select a route once → dispatch → score →
//! trace. Routes B and C fan out into independent branches joined under a
//! bound; a branch that fails or times out degrades the answer but never
//! aborts the join. Gap fills are spawned and outlive the request.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use gapwise_shared::{
    AppConfig, Clarification, ClarificationField, CompletionProvider, CompletionRequest,
    CoverageLevel, CoverageResult, ExampleRetriever, GapwiseError, Intent, KnowledgeGap,
    ManualHit, ManualSearch, PastCase, Query, Response, Result, Retriever, Route,
    RoutingDecision, ScoredAtom, SpecialistId, TraceRecord,
};

use crate::classifier::Classifier;
use crate::confidence;
use crate::coverage::CoverageEvaluator;
use crate::filler::GapFillDispatcher;
use crate::gaps;
use crate::reload::ConfigHandle;
use crate::specialists::SpecialistTable;
use crate::trace::BackgroundQueue;

pub const LIMITED_COVERAGE: &str = "coverage is limited";
pub const UNVERIFIED: &str = "unverified: not grounded in the knowledge base";

const CLARIFICATION_PROMPT: &str = "I need a bit more detail to help. Which make and model is \
    the equipment, is a fault or alarm code shown, and what exactly is it doing?";

const APOLOGY: &str = "Sorry, I couldn't put together an answer right now. Please try again in \
    a few minutes.";

const FALLBACK_SYSTEM_PROMPT: &str = "You are an experienced industrial maintenance technician. \
    The knowledge base has little or nothing on this question, so answer from general \
    experience and say clearly what should be verified against the equipment manual. Give \
    numbered steps where possible. Always include lockout/tagout before work on energised \
    equipment and never suggest bypassing interlocks, guards, or emergency stops.";

/// Atoms passed as context to the fallback completion.
const FALLBACK_CONTEXT_ATOMS: usize = 3;

/// Manual hits appended to a Route C answer.
const MAX_MANUAL_HITS: usize = 3;

/// Route from coverage level and intent clarity. Unclear intent always wins.
pub fn select_route(level: CoverageLevel, intent_clear: bool) -> Route {
    if !intent_clear {
        return Route::DUnclear;
    }
    match level {
        CoverageLevel::Strong => Route::AStrong,
        CoverageLevel::Thin => Route::BThin,
        CoverageLevel::None => Route::CNone,
    }
}

/// Rough token count for text without provider usage figures.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Answer under construction.
#[derive(Debug, Default)]
struct Draft {
    text: String,
    citations: Vec<String>,
    atoms: Vec<ScoredAtom>,
    tokens: Option<u64>,
    degraded: bool,
    qualifiers: Vec<String>,
    clarification: Option<Clarification>,
    /// Manual hits listed after the answer; not part of the scored text.
    references: Vec<ManualHit>,
}

/// The decision core's entry point.
#[derive(Clone)]
pub struct Orchestrator {
    config: ConfigHandle,
    classifier: Classifier,
    coverage: CoverageEvaluator,
    specialists: SpecialistTable,
    examples: Option<Arc<dyn ExampleRetriever>>,
    fallback: Option<Arc<dyn CompletionProvider>>,
    manuals: Option<Arc<dyn ManualSearch>>,
    dispatcher: Option<GapFillDispatcher>,
    audit: Option<Arc<BackgroundQueue<KnowledgeGap>>>,
    traces: Option<Arc<BackgroundQueue<TraceRecord>>>,
}

impl Orchestrator {
    pub fn new(config: ConfigHandle, retriever: Arc<dyn Retriever>, specialists: SpecialistTable) -> Self {
        Self {
            config,
            classifier: Classifier::new(),
            coverage: CoverageEvaluator::new(retriever),
            specialists,
            examples: None,
            fallback: None,
            manuals: None,
            dispatcher: None,
            audit: None,
            traces: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_examples(mut self, examples: Arc<dyn ExampleRetriever>) -> Self {
        self.examples = Some(examples);
        self
    }

    /// Completion provider used for Route C and for specialist failures.
    pub fn with_fallback(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    pub fn with_manuals(mut self, manuals: Arc<dyn ManualSearch>) -> Self {
        self.manuals = Some(manuals);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: GapFillDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_audit(mut self, audit: Arc<BackgroundQueue<KnowledgeGap>>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_traces(mut self, traces: Arc<BackgroundQueue<TraceRecord>>) -> Self {
        self.traces = Some(traces);
        self
    }

    /// Classify, evaluate coverage, and pick the route.
    pub async fn decide(&self, query: &Query, config: &AppConfig) -> RoutingDecision {
        let intent = self.classifier.classify(query, &config.routing).await;
        let specialist = SpecialistId::for_intent(&intent);

        if !intent.is_clear() {
            return RoutingDecision {
                route: Route::DUnclear,
                specialist,
                coverage: CoverageResult::not_evaluated(),
                intent,
            };
        }

        let coverage = self.coverage.evaluate(&intent, query, &config.coverage).await;
        RoutingDecision {
            route: select_route(coverage.level, true),
            specialist,
            coverage,
            intent,
        }
    }

    /// Answer one query. Never fails: the worst case is an apology with a
    /// clarification prompt.
    #[instrument(skip_all, fields(query_id = %query.id, source = ?query.source))]
    pub async fn answer(&self, query: &Query) -> Response {
        let started = Instant::now();
        let config = self.config.snapshot();

        let decision = self.decide(query, &config).await;
        info!(
            route = %decision.route,
            specialist = %decision.specialist,
            coverage = %decision.coverage.level,
            atoms = decision.coverage.atoms.len(),
            "route selected"
        );

        let (draft, gap_id) = match decision.route {
            Route::AStrong => self.route_strong(query, &decision, &config).await,
            Route::BThin => self.route_thin(query, &decision, &config).await,
            Route::CNone => self.route_none(query, &decision, &config).await,
            Route::DUnclear => (clarify(&decision.intent, CLARIFICATION_PROMPT), None),
        };

        let response = self.finish(query, &decision, draft, gap_id, &config, started);
        if let Some(traces) = &self.traces {
            traces.push(TraceRecord::new(query, &response));
        }
        response
    }

    // -----------------------------------------------------------------------
    // Routes
    // -----------------------------------------------------------------------

    async fn route_strong(
        &self,
        query: &Query,
        decision: &RoutingDecision,
        config: &AppConfig,
    ) -> (Draft, Option<String>) {
        let gap_id = if config.gaps.always_log {
            self.handle_gap(query, decision, config).await
        } else {
            None
        };

        let examples = self.fetch_examples(query, config).await;
        let draft = match self.specialist_answer(query, decision, &examples).await {
            Ok(draft) => draft,
            Err(e) => {
                warn!(specialist = %decision.specialist, error = %e, "specialist failed, using fallback");
                self.degraded_fallback(query, decision, config).await
            }
        };
        (draft, gap_id)
    }

    async fn route_thin(
        &self,
        query: &Query,
        decision: &RoutingDecision,
        config: &AppConfig,
    ) -> (Draft, Option<String>) {
        let fanout = config.routing.fanout_timeout();
        let (answer, gap_id) = tokio::join!(
            tokio::time::timeout(fanout, self.specialist_answer(query, decision, &[])),
            self.handle_gap(query, decision, config),
        );

        let mut draft = match answer {
            Ok(Ok(draft)) => draft,
            Ok(Err(e)) => {
                warn!(specialist = %decision.specialist, error = %e, "specialist failed, using fallback");
                self.degraded_fallback(query, decision, config).await
            }
            Err(_) => {
                warn!(timeout_ms = config.routing.fanout_timeout_ms, "specialist timed out, using fallback");
                self.degraded_fallback(query, decision, config).await
            }
        };

        match &gap_id {
            Some(id) => draft
                .qualifiers
                .push(format!("{LIMITED_COVERAGE}; enrichment queued (gap {id})")),
            None => draft.qualifiers.push(LIMITED_COVERAGE.to_string()),
        }
        (draft, gap_id)
    }

    async fn route_none(
        &self,
        query: &Query,
        decision: &RoutingDecision,
        config: &AppConfig,
    ) -> (Draft, Option<String>) {
        let fanout = config.routing.fanout_timeout();
        let (completion, gap_id, manuals) = tokio::join!(
            tokio::time::timeout(fanout, self.fallback_completion(query, &decision.intent, &[], config)),
            self.handle_gap(query, decision, config),
            tokio::time::timeout(fanout, self.manual_hits(query, &decision.intent)),
        );

        let completion = completion
            .unwrap_or_else(|_| Err(GapwiseError::timeout("fallback completion", fanout)));
        let manuals = manuals.unwrap_or_else(|_| {
            warn!(timeout_ms = config.routing.fanout_timeout_ms, "manual search timed out");
            Vec::new()
        });

        let mut draft = match completion {
            Ok(draft) => draft,
            Err(e) if !manuals.is_empty() => {
                warn!(error = %e, "fallback completion failed, answering from manuals");
                Draft {
                    text: "I couldn't generate a full answer, but these manuals look relevant.".into(),
                    degraded: true,
                    ..Draft::default()
                }
            }
            Err(e) => {
                warn!(error = %e, "fallback completion failed");
                return (apology(&decision.intent), gap_id);
            }
        };

        draft.references = manuals.into_iter().take(MAX_MANUAL_HITS).collect();
        draft.qualifiers.push(UNVERIFIED.to_string());
        (draft, gap_id)
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    async fn specialist_answer(
        &self,
        query: &Query,
        decision: &RoutingDecision,
        examples: &[PastCase],
    ) -> Result<Draft> {
        let specialist = self.specialists.get(decision.specialist);
        let atoms = &decision.coverage.atoms;
        let answer = specialist.answer(query, &decision.intent, atoms, examples).await?;
        debug!(
            specialist = %specialist.id(),
            citations = answer.citations.len(),
            "specialist answered"
        );
        Ok(Draft {
            text: answer.text,
            citations: answer.citations,
            atoms: atoms.clone(),
            tokens: answer.tokens_used,
            ..Draft::default()
        })
    }

    async fn fallback_completion(
        &self,
        query: &Query,
        intent: &Intent,
        atoms: &[ScoredAtom],
        config: &AppConfig,
    ) -> Result<Draft> {
        let Some(provider) = &self.fallback else {
            return Err(GapwiseError::Completion(
                "no fallback completion provider configured".into(),
            ));
        };

        let mut prompt = String::new();
        if intent.vendor.is_known() || intent.equipment.is_known() {
            prompt.push_str(&format!(
                "Equipment: {} {}\n",
                intent.vendor.display_name(),
                intent.equipment.search_label()
            ));
        }
        if !intent.fault_codes.is_empty() {
            prompt.push_str(&format!("Fault codes: {}\n", intent.fault_codes.join(", ")));
        }
        let context: Vec<&ScoredAtom> = atoms.iter().take(FALLBACK_CONTEXT_ATOMS).collect();
        if !context.is_empty() {
            prompt.push_str("\nPossibly related notes:\n");
            for scored in &context {
                prompt.push_str(&format!("- {}: {}\n", scored.atom.title, scored.atom.content.trim()));
            }
        }
        prompt.push_str(&format!("\nQuestion: {}", query.full_text()));

        let request = CompletionRequest::new(prompt)
            .with_system(FALLBACK_SYSTEM_PROMPT)
            .with_max_tokens(config.completion.max_tokens);
        let completion = provider.complete(&request, config.completion.timeout()).await?;
        debug!(cached = completion.cached, tokens = ?completion.tokens_used, "fallback completion");

        Ok(Draft {
            text: completion.text,
            atoms: context.into_iter().cloned().collect(),
            tokens: completion.tokens_used,
            ..Draft::default()
        })
    }

    /// Fallback after a specialist failure on Routes A and B.
    async fn degraded_fallback(&self, query: &Query, decision: &RoutingDecision, config: &AppConfig) -> Draft {
        match self
            .fallback_completion(query, &decision.intent, &decision.coverage.atoms, config)
            .await
        {
            Ok(mut draft) => {
                draft.degraded = true;
                draft
            }
            Err(e) => {
                warn!(error = %e, "fallback completion failed");
                apology(&decision.intent)
            }
        }
    }

    async fn fetch_examples(&self, query: &Query, config: &AppConfig) -> Vec<PastCase> {
        let Some(examples) = &self.examples else {
            return Vec::new();
        };
        let limit = config.routing.examples_limit;
        match tokio::time::timeout(config.routing.examples_timeout(), examples.similar_cases(query, limit)).await {
            Ok(Ok(cases)) => cases,
            Ok(Err(e)) => {
                warn!(error = %e, "example retrieval failed");
                Vec::new()
            }
            Err(_) => {
                warn!(timeout_ms = config.routing.examples_timeout_ms, "example retrieval timed out");
                Vec::new()
            }
        }
    }

    async fn manual_hits(&self, query: &Query, intent: &Intent) -> Vec<ManualHit> {
        let Some(manuals) = &self.manuals else {
            return Vec::new();
        };
        match manuals.search(intent, query).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "manual search failed");
                Vec::new()
            }
        }
    }

    /// Detect, audit, and (below `STRONG`) dispatch a gap. Returns the id of
    /// a gap queued for filling.
    async fn handle_gap(&self, query: &Query, decision: &RoutingDecision, config: &AppConfig) -> Option<String> {
        let gap = gaps::detect(query, &decision.intent, &decision.coverage, &config.gaps)?;
        debug!(gap_id = %gap.id, gap_type = %gap.gap_type, priority = %gap.priority, "gap detected");

        if let Some(audit) = &self.audit {
            audit.push(gap.clone());
        }
        if !gap.needs_fill() {
            return None;
        }
        let dispatcher = self.dispatcher.as_ref()?;
        let id = gap.id.clone();
        info!(gap_id = %id, gap_type = %gap.gap_type, priority = %gap.priority, "gap queued for research");
        // Detached: the fill continues after this request completes.
        drop(dispatcher.dispatch(gap, &config.research));
        Some(id)
    }

    // -----------------------------------------------------------------------
    // Synthesis
    // -----------------------------------------------------------------------

    fn finish(
        &self,
        query: &Query,
        decision: &RoutingDecision,
        mut draft: Draft,
        gap_id: Option<String>,
        config: &AppConfig,
        started: Instant,
    ) -> Response {
        let confidence = if draft.clarification.is_some() {
            None
        } else {
            let assessment = confidence::score(
                query,
                &decision.intent,
                &draft.text,
                &draft.atoms,
                &draft.citations,
                &config.confidence,
            );
            if assessment.escalate {
                let codes: Vec<&str> = assessment.reasons.iter().map(|r| r.code()).collect();
                warn!(reasons = ?codes, overall = assessment.overall, "answer escalated");
                draft
                    .qualifiers
                    .push(format!("flagged for human review ({})", codes.join(", ")));
            }
            Some(assessment)
        };

        let mut citations: Vec<String> = draft
            .citations
            .iter()
            .map(|c| {
                draft
                    .atoms
                    .iter()
                    .find(|s| s.atom.id == *c)
                    .map(|s| s.atom.citation())
                    .unwrap_or_else(|| c.clone())
            })
            .collect();
        if !draft.references.is_empty() {
            draft.text.push_str("\n\nRelated manuals:");
            for hit in &draft.references {
                draft.text.push_str(&format!("\n- {} <{}>", hit.title, hit.url));
                citations.push(hit.url.clone());
            }
        }
        let tokens_used = draft.tokens.unwrap_or_else(|| estimate_tokens(&draft.text));

        let response = Response {
            query_id: query.id,
            text: draft.text,
            citations,
            route: decision.route,
            specialist: decision.specialist,
            confidence,
            clarification: draft.clarification,
            qualifiers: draft.qualifiers,
            research_triggered: gap_id.is_some(),
            degraded: draft.degraded,
            gap_id,
            atom_ids: draft.atoms.iter().map(|s| s.atom.id.clone()).collect(),
            latency_ms: started.elapsed().as_millis() as u64,
            tokens_used,
            cost_usd: tokens_used as f64 / 1_000.0 * config.completion.cost_per_1k_tokens,
        };
        info!(
            route = %response.route,
            latency_ms = response.latency_ms,
            tokens = response.tokens_used,
            escalated = response.escalated(),
            degraded = response.degraded,
            research = response.research_triggered,
            "query answered"
        );
        response
    }
}

fn clarify(intent: &Intent, prompt: &str) -> Draft {
    let mut missing = Vec::new();
    if intent.model_numbers.is_empty() {
        missing.push(ClarificationField::EquipmentModel);
    }
    if intent.fault_codes.is_empty() {
        missing.push(ClarificationField::FaultCode);
    }
    missing.push(ClarificationField::Symptom);

    Draft {
        text: prompt.to_string(),
        clarification: Some(Clarification {
            prompt: prompt.to_string(),
            missing,
        }),
        ..Draft::default()
    }
}

fn apology(intent: &Intent) -> Draft {
    let mut draft = clarify(intent, &format!("{APOLOGY} {CLARIFICATION_PROMPT}"));
    draft.degraded = true;
    draft
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use gapwise_research::ResearchRouter;
    use gapwise_shared::{
        Completion, CostTier, EquipmentType, EscalationReason, KnowledgeUnit, OverflowPolicy,
        ResearchBackend, ResearchResult, ResearchTask, SearchFilters, Specialist, SpecialistAnswer,
        TraceConfig, TraceSink, Vendor,
    };

    use crate::filler::GapFiller;
    use crate::trace::trace_queue;

    struct FixedRetriever {
        scores: Vec<f64>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn search(&self, _text: &str, _filters: &SearchFilters, _limit: usize) -> Result<Vec<ScoredAtom>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .scores
                .iter()
                .enumerate()
                .map(|(i, score)| ScoredAtom {
                    atom: KnowledgeUnit::new(
                        format!("Drive note {i}"),
                        "Check the supply voltage and the DC link fuse.",
                        Vendor::Siemens,
                        EquipmentType::Drive,
                    ),
                    score: *score,
                })
                .collect())
        }
    }

    struct FailingSpecialist;

    #[async_trait]
    impl Specialist for FailingSpecialist {
        fn id(&self) -> SpecialistId {
            SpecialistId::Siemens
        }

        async fn answer(
            &self,
            _query: &Query,
            _intent: &Intent,
            _atoms: &[ScoredAtom],
            _examples: &[PastCase],
        ) -> Result<SpecialistAnswer> {
            Err(GapwiseError::Specialist("model overloaded".into()))
        }
    }

    struct CannedCompletion {
        reply: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionProvider for CannedCompletion {
        async fn complete(&self, request: &CompletionRequest, timeout: Duration) -> Result<Completion> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            match &self.reply {
                Some(text) => Ok(Completion {
                    text: text.clone(),
                    model: "test".into(),
                    tokens_used: None,
                    cached: false,
                }),
                None => Err(GapwiseError::timeout("completion", timeout)),
            }
        }
    }

    struct SlowExamples;

    #[async_trait]
    impl ExampleRetriever for SlowExamples {
        async fn similar_cases(&self, _query: &Query, _limit: usize) -> Result<Vec<PastCase>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    fn orchestrator(scores: &[f64], specialists: SpecialistTable) -> (Orchestrator, Arc<FixedRetriever>) {
        let retriever = Arc::new(FixedRetriever {
            scores: scores.to_vec(),
            calls: AtomicUsize::new(0),
        });
        let orchestrator = Orchestrator::new(ConfigHandle::new(AppConfig::default()), retriever.clone(), specialists);
        (orchestrator, retriever)
    }

    fn canned(reply: Option<&str>) -> Arc<CannedCompletion> {
        Arc::new(CannedCompletion {
            reply: reply.map(str::to_string),
            prompts: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn route_is_pure_in_level_and_clarity() {
        assert_eq!(select_route(CoverageLevel::Strong, true), Route::AStrong);
        assert_eq!(select_route(CoverageLevel::Thin, true), Route::BThin);
        assert_eq!(select_route(CoverageLevel::None, true), Route::CNone);
        for level in [CoverageLevel::Strong, CoverageLevel::Thin, CoverageLevel::None] {
            assert_eq!(select_route(level, false), Route::DUnclear);
        }
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn unclear_query_skips_retrieval() {
        let (orchestrator, retriever) = orchestrator(&[0.9, 0.9, 0.9], SpecialistTable::extractive());
        let response = orchestrator.answer(&Query::new("it's broken, help")).await;

        assert_eq!(response.route, Route::DUnclear);
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
        let clarification = response.clarification.expect("clarification");
        assert_eq!(
            clarification.missing,
            vec![
                ClarificationField::EquipmentModel,
                ClarificationField::FaultCode,
                ClarificationField::Symptom
            ]
        );
        assert!(response.confidence.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn strong_coverage_answers_with_atoms() {
        let (orchestrator, _) = orchestrator(&[0.8, 0.6, 0.5], SpecialistTable::extractive());
        let orchestrator = orchestrator.with_examples(Arc::new(SlowExamples));
        let response = orchestrator.answer(&Query::new("SINAMICS G120 fault F0003")).await;

        assert_eq!(response.route, Route::AStrong);
        assert_eq!(response.specialist, SpecialistId::Siemens);
        assert_eq!(response.atom_ids.len(), 3);
        assert_eq!(response.citations[0], "Drive note 0");
        assert!(!response.degraded);
        assert!(!response.research_triggered);
        assert!(response.confidence.is_some());
    }

    #[tokio::test]
    async fn specialist_failure_degrades_to_fallback() {
        let table = SpecialistTable::extractive().register(Arc::new(FailingSpecialist));
        let provider = canned(Some("1. Check the supply voltage.\n2. Replace the DC link fuse."));
        let (orchestrator, _) = orchestrator(&[0.8, 0.6, 0.5], table);
        let orchestrator = orchestrator.with_fallback(provider.clone());

        let response = orchestrator.answer(&Query::new("SINAMICS G120 fault F0003")).await;
        assert_eq!(response.route, Route::AStrong);
        assert!(response.degraded);
        assert!(response.text.contains("DC link fuse"));
        assert!(provider.prompts.lock().unwrap()[0].contains("Possibly related notes"));
    }

    #[tokio::test]
    async fn thin_coverage_is_qualified() {
        let (orchestrator, _) = orchestrator(&[0.4], SpecialistTable::extractive());
        let response = orchestrator.answer(&Query::new("SINAMICS G120 fault F0003")).await;

        assert_eq!(response.route, Route::BThin);
        assert_eq!(response.qualifiers[0], LIMITED_COVERAGE);
        assert!(response.gap_id.is_none());
    }

    #[tokio::test]
    async fn no_coverage_uses_fallback_and_flags_unverified() {
        let provider = canned(Some("Check the widget supply fuse, then reset the controller."));
        let (orchestrator, _) = orchestrator(&[], SpecialistTable::extractive());
        let orchestrator = orchestrator.with_fallback(provider);

        let response = orchestrator.answer(&Query::new("XYZ-brand widget error 42")).await;
        assert_eq!(response.route, Route::CNone);
        assert!(response.qualifiers.contains(&UNVERIFIED.to_string()));
        assert!(!response.degraded);
        assert_eq!(response.tokens_used, estimate_tokens(&response.text));
    }

    #[tokio::test]
    async fn total_failure_apologises_with_clarification() {
        let (orchestrator, _) = orchestrator(&[], SpecialistTable::extractive());
        let orchestrator = orchestrator.with_fallback(canned(None));

        let response = orchestrator.answer(&Query::new("XYZ-brand widget error 42")).await;
        assert_eq!(response.route, Route::CNone);
        assert!(response.degraded);
        assert!(response.text.starts_with("Sorry"));
        let clarification = response.clarification.expect("clarification");
        assert_eq!(
            clarification.missing,
            vec![ClarificationField::EquipmentModel, ClarificationField::Symptom]
        );
    }

    struct HangingSpecialist;

    #[async_trait]
    impl Specialist for HangingSpecialist {
        fn id(&self) -> SpecialistId {
            SpecialistId::Siemens
        }

        async fn answer(
            &self,
            _query: &Query,
            _intent: &Intent,
            _atoms: &[ScoredAtom],
            _examples: &[PastCase],
        ) -> Result<SpecialistAnswer> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Err(GapwiseError::Specialist("unreachable".into()))
        }
    }

    struct FixedManuals(Vec<ManualHit>);

    #[async_trait]
    impl ManualSearch for FixedManuals {
        async fn search(&self, _intent: &Intent, _query: &Query) -> Result<Vec<ManualHit>> {
            Ok(self.0.clone())
        }
    }

    fn manuals() -> Arc<FixedManuals> {
        Arc::new(FixedManuals(
            (1..=4)
                .map(|i| ManualHit {
                    title: format!("Widget controller manual part {i}"),
                    url: format!("https://manuals.example.com/widget/{i}"),
                    excerpt: "Reset procedure and fuse ratings.".into(),
                })
                .collect(),
        ))
    }

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<TraceRecord>>,
    }

    #[async_trait]
    impl TraceSink for RecordingSink {
        async fn append(&self, record: &TraceRecord) -> Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResearchBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        fn cost_tier(&self) -> CostTier {
            CostTier::Free
        }

        fn reliability(&self) -> f64 {
            0.5
        }

        async fn execute(&self, _task: &ResearchTask) -> Result<ResearchResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GapwiseError::Research("offline".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn thin_specialist_timeout_degrades_to_fallback() {
        let table = SpecialistTable::extractive().register(Arc::new(HangingSpecialist));
        let provider = canned(Some("1. Check the supply voltage.\n2. Replace the DC link fuse."));
        let (orchestrator, _) = orchestrator(&[0.4], table);
        let orchestrator = orchestrator.with_fallback(provider.clone());

        let response = orchestrator.answer(&Query::new("SINAMICS G120 fault F0003")).await;
        assert_eq!(response.route, Route::BThin);
        assert!(response.degraded);
        assert!(response.text.contains("DC link fuse"));
        assert_eq!(response.qualifiers[0], LIMITED_COVERAGE);
        assert_eq!(provider.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_coverage_lists_manual_hits_without_accuracy_penalty() {
        let provider = canned(Some("Check the widget supply fuse, then reset the controller."));
        let (orchestrator, _) = orchestrator(&[], SpecialistTable::extractive());
        let orchestrator = orchestrator.with_fallback(provider).with_manuals(manuals());

        let response = orchestrator.answer(&Query::new("XYZ-brand widget error 42")).await;
        assert_eq!(response.route, Route::CNone);
        assert!(!response.degraded);
        assert!(response.text.contains("Related manuals:"));
        assert_eq!(response.citations.len(), MAX_MANUAL_HITS);
        assert_eq!(response.citations[0], "https://manuals.example.com/widget/1");

        let confidence = response.confidence.expect("scored");
        assert!((confidence.scores.accuracy - 1.0).abs() < 1e-9);
        assert!(!confidence.reasons.contains(&EscalationReason::LowAccuracy));
    }

    #[tokio::test]
    async fn no_coverage_answers_from_manuals_when_fallback_fails() {
        let (orchestrator, _) = orchestrator(&[], SpecialistTable::extractive());
        let orchestrator = orchestrator.with_fallback(canned(None)).with_manuals(manuals());

        let response = orchestrator.answer(&Query::new("XYZ-brand widget error 42")).await;
        assert_eq!(response.route, Route::CNone);
        assert!(response.degraded);
        assert!(response.clarification.is_none());
        assert!(response.text.contains("https://manuals.example.com/widget/1"));
        assert!(response.qualifiers.contains(&UNVERIFIED.to_string()));
    }

    #[tokio::test]
    async fn always_log_audits_strong_gap_without_filling() {
        let path = std::env::temp_dir().join(format!("gw_orch_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(gapwise_storage::Storage::open(&path).await.expect("open test db"));
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
        });
        let mut config = AppConfig::default();
        config.gaps.always_log = true;

        let backends: Vec<Arc<dyn ResearchBackend>> = vec![backend.clone()];
        let router = ResearchRouter::new(backends, &config.research);
        let dispatcher = GapFillDispatcher::new(GapFiller::new(Arc::new(router), storage), 2);
        let audit = Arc::new(BackgroundQueue::new("audit", 8, OverflowPolicy::DropOldest));
        let retriever = Arc::new(FixedRetriever {
            scores: vec![0.8, 0.6, 0.5],
            calls: AtomicUsize::new(0),
        });
        let orchestrator = Orchestrator::new(ConfigHandle::new(config), retriever, SpecialistTable::extractive())
            .with_dispatcher(dispatcher.clone())
            .with_audit(audit.clone());

        let response = orchestrator.answer(&Query::new("SINAMICS G120 fault F0003")).await;
        assert_eq!(response.route, Route::AStrong);
        assert_eq!(audit.len(), 1);
        assert!(!response.research_triggered);
        assert!(response.gap_id.is_none());
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn trace_records_the_final_response() {
        let sink = Arc::new(RecordingSink::default());
        let traces = Arc::new(trace_queue(sink.clone(), &TraceConfig::default()));
        let (orchestrator, _) = orchestrator(&[0.4], SpecialistTable::extractive());
        let orchestrator = orchestrator.with_traces(traces.clone());

        let query = Query::new("SINAMICS G120 fault F0003");
        let response = orchestrator.answer(&query).await;
        traces.shutdown().await;

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.query_id, response.query_id);
        assert_eq!(record.route, Route::BThin);
        assert_eq!(record.atom_ids, response.atom_ids);
        assert_eq!(record.tokens_used, response.tokens_used);
        assert_eq!(record.latency_ms, response.latency_ms);
        assert_eq!(record.escalated, response.escalated());
    }
}

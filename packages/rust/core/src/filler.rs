//! Gap filling: gap → research task → backends → candidate knowledge units.
//!
//! [`GapFiller::fill`] runs one gap to completion and reports what happened.
//! [`GapFillDispatcher`] spawns fills off the request path, bounded by a
//! semaphore, so a slow backend never holds up an answer.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use gapwise_research::ResearchRouter;
use gapwise_shared::{
    EquipmentType, FilledGap, GapType, GapwiseError, InsertOutcome, KnowledgeGap,
    KnowledgeUnit, KnowledgeWriter, ProposalStatus, ProposedUnit, ResearchConfig, ResearchJob,
    ResearchTask, Result, ValidationStatus, Vendor,
};

// ---------------------------------------------------------------------------
// Task building
// ---------------------------------------------------------------------------

/// Queries for generic gaps (`NO_MATCH`, `LOW_SATISFACTION`).
const GENERIC_QUERY_COUNT: usize = 3;

/// The noun phrase research queries are built around.
fn subject(gap: &KnowledgeGap) -> String {
    let entities = &gap.entities;
    let mut parts: Vec<String> = Vec::new();
    if let Some(manufacturer) = entities.manufacturer() {
        parts.push(manufacturer);
    }
    if let Some(model) = entities.model_numbers.first() {
        parts.push(model.clone());
    } else if entities.equipment != EquipmentType::Unknown {
        parts.push(entities.equipment.search_label().to_string());
    }
    if parts.is_empty() {
        gap.query_text.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        parts.join(" ")
    }
}

fn queries_for(gap: &KnowledgeGap) -> (String, Vec<String>) {
    let subject = subject(gap);
    let entities = &gap.entities;

    match gap.gap_type {
        GapType::UnknownManufacturer => {
            let maker = entities.manufacturer().unwrap_or_else(|| subject.clone());
            let equipment = entities.equipment.search_label();
            (
                format!("Identify manufacturer {maker} and collect its {equipment} documentation"),
                vec![
                    format!("{maker} official documentation"),
                    format!("{maker} {equipment} manual"),
                    format!("{maker} fault codes list"),
                    format!("{maker} {equipment} troubleshooting"),
                ],
            )
        }
        GapType::MissingIdentifier => {
            let code = entities
                .fault_codes
                .first()
                .map(|c| format!("{subject} {c}"))
                .unwrap_or_else(|| format!("{subject} fault"));
            (
                format!("Explain common faults on {subject} and how to resolve them"),
                vec![
                    format!("{code} meaning"),
                    format!("{code} common causes"),
                    format!("{code} resolution steps"),
                    format!("{subject} related fault codes"),
                ],
            )
        }
        GapType::UnknownModel => {
            let model = entities
                .model_numbers
                .first()
                .cloned()
                .unwrap_or_else(|| subject.clone());
            let maker = entities.manufacturer().unwrap_or_default();
            let label = format!("{maker} {model}").trim().to_string();
            (
                format!("Collect reference material for model {label}"),
                vec![
                    format!("{label} specifications"),
                    format!("{label} manual"),
                    format!("{label} fault codes"),
                    format!("{label} programming"),
                ],
            )
        }
        GapType::NoMatch | GapType::LowSatisfaction => {
            let mut queries: Vec<String> = gap
                .search_terms
                .iter()
                .take(GENERIC_QUERY_COUNT)
                .cloned()
                .collect();
            for extra in [subject.clone(), format!("{subject} troubleshooting")] {
                if queries.len() >= GENERIC_QUERY_COUNT {
                    break;
                }
                if !queries.contains(&extra) {
                    queries.push(extra);
                }
            }
            let objective = if gap.gap_type == GapType::LowSatisfaction {
                format!("Find a better-supported answer for: {}", gap.query_text.trim())
            } else {
                format!("Answer the technician question: {}", gap.query_text.trim())
            };
            (objective, queries)
        }
    }
}

/// Build the research task for `gap`.
pub fn build_task(gap: &KnowledgeGap, config: &ResearchConfig) -> ResearchTask {
    let (objective, queries) = queries_for(gap);
    ResearchTask {
        id: Uuid::now_v7().to_string(),
        gap_id: gap.id.clone(),
        gap_type: gap.gap_type,
        objective,
        queries,
        entities: gap.entities.clone(),
        priority: gap.priority,
        sources: gap.sources.clone(),
        timeout_secs: config.task_timeout_secs,
    }
}

// ---------------------------------------------------------------------------
// Filler
// ---------------------------------------------------------------------------

/// Runs gaps through research and stores the results.
#[derive(Clone)]
pub struct GapFiller {
    router: Arc<ResearchRouter>,
    writer: Arc<dyn KnowledgeWriter>,
}

impl GapFiller {
    pub fn new(router: Arc<ResearchRouter>, writer: Arc<dyn KnowledgeWriter>) -> Self {
        Self { router, writer }
    }

    /// Research `gap` and insert or propose the findings.
    ///
    /// Research failure is returned as an error after the job row records it.
    #[instrument(skip_all, fields(gap_id = %gap.id, gap_type = %gap.gap_type, priority = %gap.priority))]
    pub async fn fill(&self, gap: &KnowledgeGap, config: &ResearchConfig) -> Result<FilledGap> {
        let task = build_task(gap, config);
        let mut job = ResearchJob {
            task_id: task.id.clone(),
            gap_id: gap.id.clone(),
            priority: gap.priority,
            started_at: Utc::now(),
            finished_at: None,
            backend: None,
            succeeded: false,
            findings: 0,
            inserted: 0,
            cost_usd: 0.0,
            error: None,
        };
        self.record_job(&job).await;

        let routed = match self.router.execute(&task).await {
            Ok(routed) => routed,
            Err(e) => {
                error!(error = %e, "gap research failed");
                job.finished_at = Some(Utc::now());
                job.error = Some(e.to_string());
                self.record_job(&job).await;
                return Err(e);
            }
        };

        let result = routed.result;
        let mut filled = FilledGap {
            gap_id: gap.id.clone(),
            task_id: task.id.clone(),
            backend: result.backend.clone(),
            cost_usd: result.cost_usd,
            ..FilledGap::default()
        };

        let vendor = match gap.entities.vendor {
            Vendor::Unknown => Vendor::Generic,
            v => v,
        };
        let status = if config.require_approval {
            ValidationStatus::Pending
        } else {
            ValidationStatus::Unverified
        };

        let mut proposals = Vec::new();
        for finding in &result.findings {
            let title = finding.title.trim();
            let content = finding.content.trim();
            if title.is_empty() || content.chars().count() < config.min_finding_chars {
                debug!(title, chars = content.chars().count(), "dropping short finding");
                filled.dropped += 1;
                continue;
            }
            let mut unit = KnowledgeUnit::new(title, content, vendor, gap.entities.equipment)
                .with_validation(status);
            if let Some(url) = &finding.source_url {
                unit = unit.with_source(url.clone());
            }
            proposals.push(ProposedUnit {
                id: Uuid::now_v7().to_string(),
                gap_id: gap.id.clone(),
                task_id: task.id.clone(),
                unit,
                confidence: (finding.confidence * routed.reliability).clamp(0.0, 1.0),
                status: ProposalStatus::Pending,
                created_at: Utc::now(),
            });
        }

        if config.require_approval {
            for proposal in &proposals {
                match self.writer.store_proposal(proposal).await {
                    Ok(()) => filled.pending.push(proposal.id.clone()),
                    Err(e) => {
                        warn!(proposal_id = %proposal.id, error = %e, "failed to store proposal");
                        filled.failed.push((proposal.id.clone(), e.to_string()));
                    }
                }
            }
        } else {
            for proposal in &proposals {
                match self.writer.insert_atom(&proposal.unit).await {
                    Ok(InsertOutcome::Inserted) => filled.inserted.push(proposal.unit.id.clone()),
                    Ok(InsertOutcome::Duplicate) => {
                        debug!(atom_id = %proposal.unit.id, "finding already in the store");
                        filled.duplicates += 1;
                    }
                    Err(e) => {
                        warn!(proposal_id = %proposal.id, error = %e, "atom insert failed, skipping");
                        filled.failed.push((proposal.id.clone(), e.to_string()));
                    }
                }
            }
        }

        job.finished_at = Some(Utc::now());
        job.backend = Some(result.backend.clone());
        job.succeeded = true;
        job.findings = result.findings.len();
        job.inserted = filled.inserted.len();
        job.cost_usd = result.cost_usd;
        self.record_job(&job).await;

        info!(
            backend = %filled.backend,
            attempts = routed.attempts,
            inserted = filled.inserted.len(),
            pending = filled.pending.len(),
            duplicates = filled.duplicates,
            dropped = filled.dropped,
            failed = filled.failed.len(),
            cost_usd = filled.cost_usd,
            "gap filled"
        );
        Ok(filled)
    }

    async fn record_job(&self, job: &ResearchJob) {
        if let Err(e) = self.writer.record_research_job(job).await {
            warn!(task_id = %job.task_id, error = %e, "failed to record research job");
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Spawns gap fills on the runtime, at most `max_concurrent` at a time.
#[derive(Clone)]
pub struct GapFillDispatcher {
    filler: GapFiller,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl GapFillDispatcher {
    pub fn new(filler: GapFiller, max_concurrent: usize) -> Self {
        Self {
            filler,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Fills queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until every dispatched fill has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Queue `gap` for filling. Returns immediately; the fill outlives the caller.
    pub fn dispatch(&self, gap: KnowledgeGap, config: &ResearchConfig) -> tokio::task::JoinHandle<Option<FilledGap>> {
        let filler = self.filler.clone();
        let permits = self.permits.clone();
        let config = config.clone();
        let budget = Duration::from_secs(config.task_timeout_secs);
        let in_flight = self.in_flight.clone();
        let idle = self.idle.clone();
        in_flight.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => match tokio::time::timeout(budget, filler.fill(&gap, &config)).await {
                    Ok(Ok(filled)) => Some(filled),
                    Ok(Err(e)) => {
                        warn!(gap_id = %gap.id, error = %e, "gap fill failed");
                        None
                    }
                    Err(_) => {
                        let e = GapwiseError::timeout("gap fill", budget);
                        warn!(gap_id = %gap.id, error = %e, "gap fill timed out");
                        None
                    }
                },
                Err(_) => {
                    warn!(gap_id = %gap.id, "gap fill semaphore closed");
                    None
                }
            };
            if in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                idle.notify_waiters();
            }
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use gapwise_shared::{
        CostTier, CoverageConfig, FeedbackPolarity, FeedbackStats, Finding, GapsConfig,
        ResearchBackend, ResearchResult,
    };

    use crate::coverage::classify_coverage;
    use crate::{classifier, gaps};

    #[derive(Default)]
    struct MemoryWriter {
        atoms: Mutex<Vec<KnowledgeUnit>>,
        proposals: Mutex<Vec<ProposedUnit>>,
        jobs: Mutex<Vec<ResearchJob>>,
        fail_titles: Vec<String>,
    }

    #[async_trait]
    impl KnowledgeWriter for MemoryWriter {
        async fn insert_atom(&self, atom: &KnowledgeUnit) -> Result<InsertOutcome> {
            if self.fail_titles.contains(&atom.title) {
                return Err(GapwiseError::Storage("constraint failed".into()));
            }
            let mut atoms = self.atoms.lock().unwrap();
            if atoms.iter().any(|a| a.content_hash == atom.content_hash) {
                return Ok(InsertOutcome::Duplicate);
            }
            atoms.push(atom.clone());
            Ok(InsertOutcome::Inserted)
        }

        async fn get_atom(&self, id: &str) -> Result<Option<KnowledgeUnit>> {
            Ok(self.atoms.lock().unwrap().iter().find(|a| a.id == id).cloned())
        }

        async fn store_proposal(&self, proposal: &ProposedUnit) -> Result<()> {
            self.proposals.lock().unwrap().push(proposal.clone());
            Ok(())
        }

        async fn record_gap(&self, _gap: &KnowledgeGap) -> Result<()> {
            Ok(())
        }

        async fn record_research_job(&self, job: &ResearchJob) -> Result<()> {
            self.jobs.lock().unwrap().push(job.clone());
            Ok(())
        }

        async fn record_feedback(
            &self,
            atom_id: &str,
            _polarity: FeedbackPolarity,
            _min_samples: u32,
            _success_floor: f64,
        ) -> Result<FeedbackStats> {
            Err(GapwiseError::Storage(format!("no atom {atom_id}")))
        }

        async fn reset_feedback_flag(&self, _atom_id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct StaticBackend {
        findings: Vec<Finding>,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ResearchBackend for StaticBackend {
        fn name(&self) -> &str {
            "static"
        }

        fn cost_tier(&self) -> CostTier {
            CostTier::Free
        }

        fn reliability(&self) -> f64 {
            0.5
        }

        async fn execute(&self, task: &ResearchTask) -> Result<ResearchResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GapwiseError::Research("offline".into()));
            }
            Ok(ResearchResult {
                task_id: task.id.clone(),
                summary: "found".into(),
                findings: self.findings.clone(),
                citations: Vec::new(),
                cost_usd: 0.01,
                backend: "static".into(),
                elapsed_ms: 5,
            })
        }
    }

    fn finding(title: &str, content: &str, confidence: f64) -> Finding {
        Finding {
            title: title.into(),
            content: content.into(),
            source_url: Some("https://example.com/doc".into()),
            confidence,
        }
    }

    fn gap_for(text: &str) -> KnowledgeGap {
        let intent = classifier::extract(text);
        let coverage = classify_coverage(Vec::new(), &CoverageConfig::default());
        gaps::detect(&gapwise_shared::Query::new(text), &intent, &coverage, &GapsConfig::default())
            .expect("gap below STRONG")
    }

    fn research_config(require_approval: bool) -> ResearchConfig {
        ResearchConfig {
            require_approval,
            max_retries: 1,
            base_backoff_ms: 1,
            ..ResearchConfig::default()
        }
    }

    fn filler_with(backend: StaticBackend, writer: Arc<MemoryWriter>) -> (GapFiller, Arc<StaticBackend>) {
        let backend = Arc::new(backend);
        let router = ResearchRouter::new(vec![backend.clone()], &research_config(false));
        (GapFiller::new(Arc::new(router), writer), backend)
    }

    const LONG: &str = "Undervoltage on the DC link: check the supply phases and the pre-charge circuit.";

    #[test]
    fn task_shape_follows_gap_type() {
        let config = ResearchConfig::default();

        let unknown_maker = build_task(&gap_for("XYZ-brand widget error 42"), &config);
        assert_eq!(unknown_maker.gap_type, GapType::UnknownManufacturer);
        assert_eq!(unknown_maker.queries.len(), 4);
        assert_eq!(unknown_maker.queries[0], "XYZ official documentation");

        let missing = build_task(&gap_for("conveyor keeps tripping, how to troubleshoot"), &config);
        assert_eq!(missing.gap_type, GapType::MissingIdentifier);
        assert_eq!(missing.queries.len(), 4);
        assert!(missing.queries[0].ends_with("meaning"));

        let model = build_task(&gap_for("Siemens S7-1200 fault F0003"), &config);
        assert_eq!(model.gap_type, GapType::UnknownModel);
        assert_eq!(model.queries.len(), 4);
        assert_eq!(model.queries[0], "Siemens S7-1200 specifications");
        assert_eq!(model.timeout_secs, config.task_timeout_secs);

        let generic = build_task(&gap_for("pump seal replacement interval"), &config);
        assert_eq!(generic.gap_type, GapType::NoMatch);
        assert_eq!(generic.queries.len(), 3);
    }

    #[tokio::test]
    async fn pending_proposals_when_approval_required() {
        let writer = Arc::new(MemoryWriter::default());
        let (filler, _) = filler_with(
            StaticBackend {
                findings: vec![finding("F0003 Undervoltage", LONG, 0.8), finding("tiny", "too short", 0.9)],
                calls: AtomicUsize::new(0),
                fail: false,
            },
            writer.clone(),
        );

        let filled = filler
            .fill(&gap_for("Siemens S7-1200 fault F0003"), &research_config(true))
            .await
            .unwrap();
        assert_eq!(filled.pending.len(), 1);
        assert_eq!(filled.dropped, 1);
        assert!(filled.inserted.is_empty());

        let proposals = writer.proposals.lock().unwrap();
        assert!((proposals[0].confidence - 0.4).abs() < 1e-9);
        assert_eq!(proposals[0].unit.validation, ValidationStatus::Pending);
        assert_eq!(proposals[0].unit.vendor, Vendor::Siemens);
        assert!(writer.atoms.lock().unwrap().is_empty());

        let jobs = writer.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[1].succeeded);
        assert_eq!(jobs[1].backend.as_deref(), Some("static"));
    }

    #[tokio::test]
    async fn direct_insert_tracks_duplicates_and_failures() {
        let writer = Arc::new(MemoryWriter {
            fail_titles: vec!["Broken row".into()],
            ..MemoryWriter::default()
        });
        let (filler, _) = filler_with(
            StaticBackend {
                findings: vec![
                    finding("F0003 Undervoltage", LONG, 0.8),
                    finding("F0003 undervoltage", LONG, 0.7),
                    finding("Broken row", LONG, 0.6),
                ],
                calls: AtomicUsize::new(0),
                fail: false,
            },
            writer.clone(),
        );

        let filled = filler
            .fill(&gap_for("Siemens S7-1200 fault F0003"), &research_config(false))
            .await
            .unwrap();
        assert_eq!(filled.inserted.len(), 1);
        assert_eq!(filled.duplicates, 1);
        assert_eq!(filled.failed.len(), 1);
        assert_eq!(writer.atoms.lock().unwrap()[0].validation, ValidationStatus::Unverified);
    }

    #[tokio::test]
    async fn research_failure_is_recorded_and_returned() {
        let writer = Arc::new(MemoryWriter::default());
        let (filler, _) = filler_with(
            StaticBackend {
                findings: Vec::new(),
                calls: AtomicUsize::new(0),
                fail: true,
            },
            writer.clone(),
        );

        let err = filler
            .fill(&gap_for("XYZ-brand widget error 42"), &research_config(true))
            .await
            .unwrap_err();
        assert!(matches!(err, GapwiseError::Research(_)));

        let jobs = writer.jobs.lock().unwrap();
        assert!(!jobs[1].succeeded);
        assert!(jobs[1].error.as_deref().unwrap().contains("offline"));
    }

    #[tokio::test]
    async fn dispatcher_swallows_failures() {
        let writer = Arc::new(MemoryWriter::default());
        let (filler, backend) = filler_with(
            StaticBackend {
                findings: Vec::new(),
                calls: AtomicUsize::new(0),
                fail: true,
            },
            writer,
        );
        let dispatcher = GapFillDispatcher::new(filler, 1);

        let first = dispatcher.dispatch(gap_for("XYZ-brand widget error 42"), &research_config(true));
        let second = dispatcher.dispatch(gap_for("pump seal replacement interval"), &research_config(true));
        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(first.await.unwrap(), None);
        assert_eq!(second.await.unwrap(), None);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }
}

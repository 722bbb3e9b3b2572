//! Technician feedback on knowledge units.
//!
//! Counters live in the store. When an atom's success rate first drops below
//! the floor, a `LOW_SATISFACTION` gap is raised for it and sent for filling.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use gapwise_shared::{
    AppConfig, FeedbackSignal, FeedbackStats, FilledGap, KnowledgeGap, KnowledgeWriter, Result,
};

use crate::filler::GapFillDispatcher;
use crate::gaps;
use crate::trace::BackgroundQueue;

/// What one feedback event caused.
#[derive(Debug)]
pub struct FeedbackOutcome {
    pub stats: FeedbackStats,
    /// Gap raised by this event, if it crossed the threshold.
    pub gap: Option<KnowledgeGap>,
    /// The spawned fill for `gap`.
    pub fill: Option<JoinHandle<Option<FilledGap>>>,
}

#[derive(Clone)]
pub struct FeedbackLoop {
    writer: Arc<dyn KnowledgeWriter>,
    dispatcher: GapFillDispatcher,
    audit: Option<Arc<BackgroundQueue<KnowledgeGap>>>,
}

impl FeedbackLoop {
    pub fn new(writer: Arc<dyn KnowledgeWriter>, dispatcher: GapFillDispatcher) -> Self {
        Self {
            writer,
            dispatcher,
            audit: None,
        }
    }

    /// Also append raised gaps to the audit log.
    pub fn with_audit(mut self, audit: Arc<BackgroundQueue<KnowledgeGap>>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Apply one feedback event. Unknown atoms are an error; gap dispatch
    /// problems are logged only.
    #[instrument(skip_all, fields(atom_id = %signal.atom_id, polarity = ?signal.polarity))]
    pub async fn record(&self, signal: &FeedbackSignal, config: &AppConfig) -> Result<FeedbackOutcome> {
        let stats = self
            .writer
            .record_feedback(
                &signal.atom_id,
                signal.polarity,
                config.gaps.feedback_min_samples,
                config.gaps.feedback_success_floor,
            )
            .await?;

        if !stats.newly_flagged {
            return Ok(FeedbackOutcome {
                stats,
                gap: None,
                fill: None,
            });
        }

        let atom = match self.writer.get_atom(&signal.atom_id).await {
            Ok(Some(atom)) => atom,
            Ok(None) => {
                warn!("flagged atom vanished before gap creation");
                return Ok(FeedbackOutcome {
                    stats,
                    gap: None,
                    fill: None,
                });
            }
            Err(e) => {
                warn!(error = %e, "could not load flagged atom");
                return Ok(FeedbackOutcome {
                    stats,
                    gap: None,
                    fill: None,
                });
            }
        };

        let gap = gaps::from_feedback(&atom);
        info!(
            gap_id = %gap.id,
            successes = stats.success_count,
            failures = stats.failure_count,
            "atom flagged for low satisfaction"
        );
        if let Some(audit) = &self.audit {
            audit.push(gap.clone());
        }
        let fill = self.dispatcher.dispatch(gap.clone(), &config.research);

        Ok(FeedbackOutcome {
            stats,
            gap: Some(gap),
            fill: Some(fill),
        })
    }

    /// Clear the atom's flag so it can raise a gap again.
    pub async fn reset(&self, atom_id: &str) -> Result<()> {
        self.writer.reset_feedback_flag(atom_id).await?;
        info!(atom_id, "feedback flag reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use gapwise_research::ResearchRouter;
    use gapwise_shared::{
        EquipmentType, FeedbackPolarity, GapType, GapwiseError, InsertOutcome, KnowledgeUnit,
        ProposedUnit, ResearchConfig, ResearchJob, Vendor,
    };

    use crate::filler::GapFiller;

    /// Counts feedback in memory with the same flag-once rule as the store.
    struct CountingWriter {
        atom: KnowledgeUnit,
        state: Mutex<(u32, u32, bool)>,
        jobs: Mutex<Vec<ResearchJob>>,
    }

    #[async_trait]
    impl KnowledgeWriter for CountingWriter {
        async fn insert_atom(&self, _atom: &KnowledgeUnit) -> Result<InsertOutcome> {
            Ok(InsertOutcome::Inserted)
        }

        async fn get_atom(&self, id: &str) -> Result<Option<KnowledgeUnit>> {
            Ok((id == self.atom.id).then(|| self.atom.clone()))
        }

        async fn store_proposal(&self, _proposal: &ProposedUnit) -> Result<()> {
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
            polarity: FeedbackPolarity,
            min_samples: u32,
            success_floor: f64,
        ) -> Result<FeedbackStats> {
            if atom_id != self.atom.id {
                return Err(GapwiseError::Storage(format!("atom not found: {atom_id}")));
            }
            let mut state = self.state.lock().unwrap();
            match polarity {
                FeedbackPolarity::Positive => state.0 += 1,
                FeedbackPolarity::Negative => state.1 += 1,
            }
            let total = state.0 + state.1;
            let rate = f64::from(state.0) / f64::from(total);
            let newly_flagged = !state.2 && total >= min_samples && rate < success_floor;
            if newly_flagged {
                state.2 = true;
            }
            Ok(FeedbackStats {
                atom_id: atom_id.to_string(),
                success_count: state.0,
                failure_count: state.1,
                newly_flagged,
            })
        }

        async fn reset_feedback_flag(&self, _atom_id: &str) -> Result<()> {
            self.state.lock().unwrap().2 = false;
            Ok(())
        }
    }

    fn feedback_loop() -> (FeedbackLoop, Arc<CountingWriter>) {
        let writer = Arc::new(CountingWriter {
            atom: KnowledgeUnit::new(
                "ACS880 overcurrent",
                "Reduce acceleration ramp.",
                Vendor::Abb,
                EquipmentType::Drive,
            ),
            state: Mutex::new((0, 0, false)),
            jobs: Mutex::new(Vec::new()),
        });
        let router = ResearchRouter::new(Vec::new(), &ResearchConfig::default());
        let filler = GapFiller::new(Arc::new(router), writer.clone());
        let dispatcher = GapFillDispatcher::new(filler, 1);
        (FeedbackLoop::new(writer.clone(), dispatcher), writer)
    }

    fn negative(atom_id: &str) -> FeedbackSignal {
        FeedbackSignal {
            atom_id: atom_id.to_string(),
            polarity: FeedbackPolarity::Negative,
        }
    }

    #[tokio::test]
    async fn third_negative_raises_exactly_one_gap() {
        let (feedback, writer) = feedback_loop();
        let config = AppConfig::default();
        let id = writer.atom.id.clone();

        let mut gaps = Vec::new();
        for _ in 0..4 {
            let outcome = feedback.record(&negative(&id), &config).await.unwrap();
            if let Some(fill) = outcome.fill {
                // No backends: the fill fails and is swallowed.
                assert_eq!(fill.await.unwrap(), None);
            }
            gaps.extend(outcome.gap);
        }
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].gap_type, GapType::LowSatisfaction);
        assert_eq!(gaps[0].entities.atom_id.as_deref(), Some(id.as_str()));

        // The failed research run is still on record.
        let jobs = writer.jobs.lock().unwrap().clone();
        assert!(jobs.iter().any(|j| j.gap_id == gaps[0].id && !j.succeeded));

        feedback.reset(&id).await.unwrap();
        let outcome = feedback.record(&negative(&id), &config).await.unwrap();
        assert!(outcome.gap.is_some());
    }

    #[tokio::test]
    async fn unknown_atom_is_an_error() {
        let (feedback, _) = feedback_loop();
        let err = feedback
            .record(&negative("missing"), &AppConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("atom not found"));
    }
}

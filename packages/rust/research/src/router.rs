//! Priority-aware backend selection with retry, backoff, and fallback.
//!
//! A task is offered to backends in an order derived from its priority:
//! routine gaps try free sources first, critical gaps go straight to the
//! premium backend. Each backend gets `max_retries` attempts with exponential
//! backoff, every attempt bounded by the task timeout, before the router falls
//! through to the next backend.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use gapwise_shared::{
    CostTier, GapPriority, GapwiseError, ResearchBackend, ResearchConfig, ResearchResult,
    ResearchTask, Result,
};

/// A successful research run and the backend that served it.
#[derive(Debug, Clone)]
pub struct RoutedResearch {
    pub result: ResearchResult,
    /// Reliability of the serving backend, used to scale finding confidence.
    pub reliability: f64,
    /// Total attempts across all backends, including the successful one.
    pub attempts: u32,
}

/// Routes research tasks across registered backends.
pub struct ResearchRouter {
    backends: Vec<Arc<dyn ResearchBackend>>,
    max_retries: u32,
    base_backoff: Duration,
}

impl ResearchRouter {
    pub fn new(backends: Vec<Arc<dyn ResearchBackend>>, config: &ResearchConfig) -> Self {
        Self {
            backends,
            max_retries: config.max_retries.max(1),
            base_backoff: config.base_backoff(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Backends in the order they are tried for a task of `priority`.
    pub fn order_for(&self, priority: GapPriority) -> Vec<Arc<dyn ResearchBackend>> {
        let preferred: &[CostTier] = match priority {
            GapPriority::Low | GapPriority::Medium => &[CostTier::Free, CostTier::Cheap],
            GapPriority::High => &[CostTier::Cheap],
            GapPriority::Critical => &[CostTier::Premium],
        };
        let rank = |backend: &Arc<dyn ResearchBackend>| {
            let tier = backend.cost_tier();
            let preference = preferred
                .iter()
                .position(|t| *t == tier)
                .unwrap_or(preferred.len());
            (preference, tier)
        };

        let mut ordered = self.backends.clone();
        ordered.sort_by(|a, b| {
            rank(a).cmp(&rank(b)).then_with(|| {
                b.reliability()
                    .partial_cmp(&a.reliability())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });
        ordered
    }

    /// Run `task` on the first backend that succeeds.
    #[instrument(skip_all, fields(task_id = %task.id, priority = %task.priority))]
    pub async fn execute(&self, task: &ResearchTask) -> Result<RoutedResearch> {
        let mut attempts = 0u32;
        let mut failures: Vec<String> = Vec::new();

        for backend in self.order_for(task.priority) {
            for attempt in 0..self.max_retries {
                if attempt > 0 {
                    let delay = self.base_backoff * 2u32.saturating_pow(attempt - 1);
                    debug!(
                        backend = backend.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying research backend"
                    );
                    tokio::time::sleep(delay).await;
                }
                attempts += 1;

                let outcome = match tokio::time::timeout(task.timeout(), backend.execute(task)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(GapwiseError::timeout(
                        format!("research on {}", backend.name()),
                        task.timeout(),
                    )),
                };
                match outcome {
                    Ok(result) => {
                        info!(
                            backend = backend.name(),
                            attempts,
                            findings = result.findings.len(),
                            "research task served"
                        );
                        return Ok(RoutedResearch {
                            result,
                            reliability: backend.reliability(),
                            attempts,
                        });
                    }
                    Err(e) => {
                        warn!(backend = backend.name(), attempt, error = %e, "research attempt failed");
                        if attempt + 1 == self.max_retries {
                            failures.push(format!("{}: {e}", backend.name()));
                        }
                    }
                }
            }
        }

        if failures.is_empty() {
            failures.push("no research backends configured".to_string());
        }
        error!(attempts, "research exhausted every backend");
        Err(GapwiseError::Research(format!(
            "all backends failed ({})",
            failures.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use gapwise_shared::{EquipmentType, GapEntities, GapType, Vendor};

    struct FakeBackend {
        name: &'static str,
        tier: CostTier,
        reliability: f64,
        /// Attempts that fail before the backend starts succeeding.
        failures_before_success: u32,
        calls: AtomicU32,
        hang: bool,
    }

    impl FakeBackend {
        fn new(name: &'static str, tier: CostTier, reliability: f64) -> Self {
            Self {
                name,
                tier,
                reliability,
                failures_before_success: 0,
                calls: AtomicU32::new(0),
                hang: false,
            }
        }

        fn failing(mut self, failures: u32) -> Self {
            self.failures_before_success = failures;
            self
        }

        fn hanging(mut self) -> Self {
            self.hang = true;
            self
        }
    }

    #[async_trait]
    impl ResearchBackend for FakeBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn cost_tier(&self) -> CostTier {
            self.tier
        }

        fn reliability(&self) -> f64 {
            self.reliability
        }

        async fn execute(&self, task: &ResearchTask) -> Result<ResearchResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if call < self.failures_before_success {
                return Err(GapwiseError::Network(format!("{} unavailable", self.name)));
            }
            Ok(ResearchResult {
                task_id: task.id.clone(),
                summary: format!("served by {}", self.name),
                findings: Vec::new(),
                citations: Vec::new(),
                cost_usd: 0.0,
                backend: self.name.to_string(),
                elapsed_ms: 0,
            })
        }
    }

    fn task(priority: GapPriority) -> ResearchTask {
        ResearchTask {
            id: "task-1".into(),
            gap_id: "gap-1".into(),
            gap_type: GapType::NoMatch,
            objective: "Find documentation".into(),
            queries: vec!["conveyor belt slip".into()],
            entities: GapEntities {
                vendor: Vendor::Unknown,
                unrecognized_manufacturer: None,
                equipment: EquipmentType::Conveyor,
                model_numbers: Vec::new(),
                fault_codes: Vec::new(),
                atom_id: None,
            },
            priority,
            sources: Vec::new(),
            timeout_secs: 10,
        }
    }

    fn router(backends: Vec<Arc<dyn ResearchBackend>>) -> ResearchRouter {
        let config = ResearchConfig {
            max_retries: 3,
            base_backoff_ms: 500,
            ..ResearchConfig::default()
        };
        ResearchRouter::new(backends, &config)
    }

    fn names(order: &[Arc<dyn ResearchBackend>]) -> Vec<&str> {
        order.iter().map(|b| b.name()).collect()
    }

    #[test]
    fn order_follows_priority() {
        let router = router(vec![
            Arc::new(FakeBackend::new("premium", CostTier::Premium, 0.9)),
            Arc::new(FakeBackend::new("cheap", CostTier::Cheap, 0.7)),
            Arc::new(FakeBackend::new("free-good", CostTier::Free, 0.6)),
            Arc::new(FakeBackend::new("free-poor", CostTier::Free, 0.3)),
        ]);

        assert_eq!(
            names(&router.order_for(GapPriority::Low)),
            vec!["free-good", "free-poor", "cheap", "premium"]
        );
        assert_eq!(
            names(&router.order_for(GapPriority::High)),
            vec!["cheap", "free-good", "free-poor", "premium"]
        );
        assert_eq!(
            names(&router.order_for(GapPriority::Critical)),
            vec!["premium", "free-good", "free-poor", "cheap"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff() {
        let backend = Arc::new(FakeBackend::new("flaky", CostTier::Free, 0.6).failing(2));
        let router = router(vec![backend.clone()]);

        let start = tokio::time::Instant::now();
        let routed = router.execute(&task(GapPriority::Low)).await.expect("third attempt succeeds");

        assert_eq!(routed.attempts, 3);
        assert_eq!(routed.result.backend, "flaky");
        assert!((routed.reliability - 0.6).abs() < 1e-9);
        // 500ms before the second attempt, 1000ms before the third.
        assert_eq!(start.elapsed(), Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_through_to_next_backend() {
        let broken = Arc::new(FakeBackend::new("broken", CostTier::Free, 0.6).failing(u32::MAX));
        let fallback = Arc::new(FakeBackend::new("fallback", CostTier::Premium, 0.9));
        let router = router(vec![broken.clone(), fallback.clone()]);

        let routed = router.execute(&task(GapPriority::Medium)).await.expect("fallback serves");
        assert_eq!(routed.result.backend, "fallback");
        assert_eq!(broken.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
        assert_eq!(routed.attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded_by_task_timeout() {
        let stuck = Arc::new(FakeBackend::new("stuck", CostTier::Free, 0.6).hanging());
        let router = router(vec![stuck.clone()]);

        let err = router.execute(&task(GapPriority::Low)).await.unwrap_err();
        assert!(err.to_string().contains("all backends failed"));
        assert!(err.to_string().contains("timed out"));
        assert_eq!(stuck.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_backends_is_an_error() {
        let router = router(Vec::new());
        let err = router.execute(&task(GapPriority::Low)).await.unwrap_err();
        assert!(err.to_string().contains("no research backends"));
    }
}

//! Wiring: build the full decision core from an [`AppConfig`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use gapwise_research::{CompletionResearchBackend, ResearchRouter, WebDocsBackend};
use gapwise_shared::{
    AppConfig, CompletionProvider, GapwiseError, KnowledgeGap, ResearchBackend, Result,
    TraceRecord, validate_api_key,
};
use gapwise_storage::Storage;

use crate::classifier::Classifier;
use crate::completion::OpenRouterClient;
use crate::feedback::FeedbackLoop;
use crate::filler::{GapFillDispatcher, GapFiller};
use crate::orchestrator::Orchestrator;
use crate::reload::ConfigHandle;
use crate::specialists::SpecialistTable;
use crate::trace::{BackgroundQueue, gap_audit_queue, trace_queue};

/// A running decision core and its background workers.
pub struct System {
    pub config: ConfigHandle,
    pub storage: Arc<Storage>,
    pub orchestrator: Orchestrator,
    pub feedback: FeedbackLoop,
    pub completion: Option<Arc<OpenRouterClient>>,
    pub dispatcher: GapFillDispatcher,
    traces: Arc<BackgroundQueue<TraceRecord>>,
    audit: Arc<BackgroundQueue<KnowledgeGap>>,
    watcher: Option<JoinHandle<()>>,
}

impl System {
    /// Open the store and assemble every component.
    ///
    /// Without a completion API key the system still runs: specialists answer
    /// extractively, Route C has no fallback completion, and research uses
    /// the web backend only.
    pub async fn start(config: AppConfig, config_path: Option<PathBuf>) -> Result<Self> {
        config.validate()?;
        let handle = ConfigHandle::new(config.clone());

        let store_path = config.store.resolved_path()?;
        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GapwiseError::io(parent, e))?;
        }
        let storage = Arc::new(Storage::open(&store_path).await?);

        let completion = match validate_api_key(&config) {
            Ok(key) => Some(Arc::new(OpenRouterClient::new(key, &config.completion)?)),
            Err(e) => {
                warn!(error = %e, "no completion provider, running extractive-only");
                None
            }
        };
        let provider: Option<Arc<dyn CompletionProvider>> =
            completion.clone().map(|c| c as Arc<dyn CompletionProvider>);

        let mut backends: Vec<Arc<dyn ResearchBackend>> = vec![Arc::new(WebDocsBackend::new(&config.research)?)];
        if let Some(provider) = &provider {
            backends.push(Arc::new(
                CompletionResearchBackend::new(
                    provider.clone(),
                    config.completion.research_model.clone(),
                    config.completion.cost_per_1k_tokens,
                )
                .with_call_timeout(Duration::from_secs(config.research.task_timeout_secs)),
            ));
        }
        let router = Arc::new(ResearchRouter::new(backends, &config.research));
        let filler = GapFiller::new(router, storage.clone());
        let dispatcher = GapFillDispatcher::new(filler, config.research.max_concurrent);

        let traces = Arc::new(trace_queue(storage.clone(), &config.trace));
        let audit = Arc::new(gap_audit_queue(
            storage.clone(),
            config.gaps.audit_queue_capacity,
            config.trace.overflow,
        ));

        let (specialists, classifier) = match &provider {
            Some(provider) => (
                SpecialistTable::completion(provider.clone(), &config.completion),
                Classifier::new().with_provider(provider.clone(), config.completion.timeout()),
            ),
            None => (SpecialistTable::extractive(), Classifier::new()),
        };

        let mut orchestrator = Orchestrator::new(handle.clone(), storage.clone(), specialists)
            .with_classifier(classifier)
            .with_examples(storage.clone())
            .with_dispatcher(dispatcher.clone())
            .with_audit(audit.clone())
            .with_traces(traces.clone());
        if let Some(provider) = &provider {
            orchestrator = orchestrator.with_fallback(provider.clone());
        }

        let feedback = FeedbackLoop::new(storage.clone(), dispatcher.clone()).with_audit(audit.clone());

        let watcher = match config_path {
            Some(path) if config.reload.enabled && path.exists() => {
                info!(path = %path.display(), interval_secs = config.reload.interval_secs, "watching config file");
                Some(handle.watch_file(path, Duration::from_secs(config.reload.interval_secs.max(1))))
            }
            _ => None,
        };

        Ok(Self {
            config: handle,
            storage,
            orchestrator,
            feedback,
            completion,
            dispatcher,
            traces,
            audit,
            watcher,
        })
    }

    /// Traces dropped by the bounded queue so far.
    pub fn dropped_traces(&self) -> u64 {
        self.traces.dropped()
    }

    /// Stop the config watcher and flush queued traces and gap records.
    pub async fn shutdown(self) {
        if let Some(watcher) = self.watcher {
            watcher.abort();
        }
        self.traces.shutdown().await;
        self.audit.shutdown().await;
    }
}

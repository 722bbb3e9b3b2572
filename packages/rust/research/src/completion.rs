//! Premium research backend that asks a completion model to research a task.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use gapwise_shared::{
    CompletionProvider, CompletionRequest, CostTier, Finding, GapwiseError, ResearchBackend,
    ResearchResult, ResearchTask, Result,
};

/// Backend name reported on results.
pub const COMPLETION_BACKEND_NAME: &str = "completion-research";

const RESEARCH_SYSTEM_PROMPT: &str = "You research industrial maintenance documentation. \
Answer only with a JSON object of the form \
{\"summary\": string, \"findings\": [{\"title\": string, \"content\": string, \
\"source_url\": string|null, \"confidence\": number}]}. \
Cite manufacturer documentation where possible. Never invent fault code meanings.";

/// Fallback confidence for findings the model returns without one.
const DEFAULT_FINDING_CONFIDENCE: f64 = 0.5;

/// Outermost `{...}` block in a model reply.
static JSON_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

#[derive(Debug, Deserialize)]
struct ResearchReply {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    findings: Vec<ReplyFinding>,
}

#[derive(Debug, Deserialize)]
struct ReplyFinding {
    title: String,
    content: String,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Research by prompting a completion model with the task objective and queries.
pub struct CompletionResearchBackend {
    provider: Arc<dyn CompletionProvider>,
    model: String,
    max_tokens: u32,
    cost_per_1k_tokens: f64,
    call_timeout: Duration,
}

impl CompletionResearchBackend {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        model: impl Into<String>,
        cost_per_1k_tokens: f64,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens: 2_048,
            cost_per_1k_tokens,
            call_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    fn prompt(task: &ResearchTask) -> String {
        let mut prompt = format!("Objective: {}\n", task.objective);
        if let Some(manufacturer) = task.entities.manufacturer() {
            prompt.push_str(&format!("Manufacturer: {manufacturer}\n"));
        }
        if task.entities.equipment.is_known() {
            prompt.push_str(&format!("Equipment: {}\n", task.entities.equipment.search_label()));
        }
        if !task.entities.model_numbers.is_empty() {
            prompt.push_str(&format!("Models: {}\n", task.entities.model_numbers.join(", ")));
        }
        if !task.entities.fault_codes.is_empty() {
            prompt.push_str(&format!("Fault codes: {}\n", task.entities.fault_codes.join(", ")));
        }
        let domains: Vec<&str> = task.sources.iter().filter_map(|s| s.domain.as_deref()).collect();
        if !domains.is_empty() {
            prompt.push_str(&format!("Preferred sources: {}\n", domains.join(", ")));
        }
        prompt.push_str("Research questions:\n");
        for (i, query) in task.queries.iter().enumerate() {
            prompt.push_str(&format!("{}. {query}\n", i + 1));
        }
        prompt
    }
}

/// Parse the first JSON object in a model reply.
fn parse_reply(text: &str) -> Result<ResearchReply> {
    let block = JSON_BLOCK_RE
        .find(text)
        .ok_or_else(|| GapwiseError::parse("research reply contains no JSON object"))?;
    serde_json::from_str(block.as_str())
        .map_err(|e| GapwiseError::parse(format!("research reply is not valid JSON: {e}")))
}

#[async_trait]
impl ResearchBackend for CompletionResearchBackend {
    fn name(&self) -> &str {
        COMPLETION_BACKEND_NAME
    }

    fn cost_tier(&self) -> CostTier {
        CostTier::Premium
    }

    fn reliability(&self) -> f64 {
        0.85
    }

    #[instrument(skip_all, fields(task_id = %task.id, model = %self.model))]
    async fn execute(&self, task: &ResearchTask) -> Result<ResearchResult> {
        let start = Instant::now();
        let request = CompletionRequest::new(Self::prompt(task))
            .with_system(RESEARCH_SYSTEM_PROMPT)
            .with_model(self.model.clone())
            .with_max_tokens(self.max_tokens);

        let completion = self.provider.complete(&request, self.call_timeout).await?;
        let reply = parse_reply(&completion.text)?;
        debug!(findings = reply.findings.len(), "research reply parsed");

        let findings: Vec<Finding> = reply
            .findings
            .into_iter()
            .map(|f| Finding {
                title: f.title.trim().to_string(),
                content: f.content.trim().to_string(),
                source_url: f.source_url.filter(|u| !u.trim().is_empty()),
                confidence: f.confidence.unwrap_or(DEFAULT_FINDING_CONFIDENCE).clamp(0.0, 1.0),
            })
            .collect();
        if findings.is_empty() {
            return Err(GapwiseError::Research(format!(
                "{COMPLETION_BACKEND_NAME}: no findings"
            )));
        }

        let tokens = completion
            .tokens_used
            .unwrap_or_else(|| ((request.prompt.len() + completion.text.len()) / 4) as u64);
        let cost_usd = tokens as f64 / 1000.0 * self.cost_per_1k_tokens;
        let citations = findings.iter().filter_map(|f| f.source_url.clone()).collect();
        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(findings = findings.len(), tokens, cost_usd, elapsed_ms, "completion research completed");

        Ok(ResearchResult {
            task_id: task.id.clone(),
            summary: reply.summary,
            findings,
            citations,
            cost_usd,
            backend: COMPLETION_BACKEND_NAME.to_string(),
            elapsed_ms,
        })
    }
}

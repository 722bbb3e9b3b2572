//! OpenRouter-compatible chat completion client with a TTL response cache.
//!
//! Requests are POSTed to `{base_url}/chat/completions` in the OpenAI wire
//! format. Successful replies are cached for `cache_ttl_secs`, keyed by the
//! SHA-256 of the prompt and every generation parameter, so identical
//! fallback prompts within the window are served without a network call.

use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use gapwise_shared::{
    Completion, CompletionConfig, CompletionProvider, CompletionRequest, GapwiseError, Result,
};

const REFERER: &str = "https://github.com/gapwise/gapwise";
const TITLE: &str = "Gapwise";

// OpenAI-compatible request/response bodies
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

/// Completion client for OpenRouter (or any OpenAI-compatible endpoint).
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    cache: Cache<String, Completion>,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, config: &CompletionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GapwiseError::Network(format!("failed to build HTTP client: {e}")))?;
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl())
            .build();

        Ok(Self {
            client,
            api_key: api_key.into().trim().to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            cache,
        })
    }

    /// Number of cached replies.
    pub fn cached_entries(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    async fn send(&self, request: &CompletionRequest, model: &str) -> Result<Completion> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        let body = ChatRequest {
            model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let res = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", REFERER)
            .header("X-Title", TITLE)
            .json(&body)
            .send()
            .await
            .map_err(|e| GapwiseError::Network(format!("completion request failed: {e}")))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(GapwiseError::Completion(format!("API error {status}: {body}")));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| GapwiseError::parse(format!("completion response parse failed: {e}")))?;

        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| GapwiseError::Completion("empty completion".into()))?;

        Ok(Completion {
            text,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            tokens_used: parsed.usage.map(|u| u.total_tokens),
            cached: false,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenRouterClient {
    #[instrument(skip_all, fields(model = request.model.as_deref().unwrap_or(&self.model)))]
    async fn complete(&self, request: &CompletionRequest, timeout: Duration) -> Result<Completion> {
        let key = request.cache_key();
        if let Some(hit) = self.cache.get(&key) {
            debug!("completion cache hit");
            return Ok(Completion {
                cached: true,
                ..hit
            });
        }

        let model = request.model.as_deref().unwrap_or(&self.model);
        let completion = match tokio::time::timeout(timeout, self.send(request, model)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "completion timed out");
                return Err(GapwiseError::timeout("completion", timeout));
            }
        };

        self.cache.insert(key, completion.clone());
        Ok(completion)
    }
}

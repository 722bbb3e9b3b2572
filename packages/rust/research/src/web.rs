//! Free-tier research backend: web search + documentation page extraction.

use std::collections::HashSet;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use url::Url;

use gapwise_shared::{
    CostTier, Finding, GapwiseError, ResearchBackend, ResearchConfig, ResearchResult,
    ResearchTask, Result,
};

use crate::extract::{self, Section};
use crate::fetch::Fetcher;

/// Backend name reported on results.
pub const WEB_BACKEND_NAME: &str = "web-docs";

/// Base confidence of a finding with one matched query term.
const BASE_CONFIDENCE: f64 = 0.35;
const PER_TERM_CONFIDENCE: f64 = 0.15;
const MAX_TERM_CONFIDENCE: f64 = 0.8;
/// Bonus for findings served from the manufacturer's own domain.
const MANUFACTURER_DOMAIN_BONUS: f64 = 0.1;

/// Searches the web for each task query, fetches the top result pages, and
/// keeps the best-matching section of each page as a finding.
pub struct WebDocsBackend {
    fetcher: Fetcher,
    search_url: String,
    max_pages: usize,
    min_chars: usize,
}

impl WebDocsBackend {
    pub fn new(config: &ResearchConfig) -> Result<Self> {
        Ok(Self {
            fetcher: Fetcher::new(&config.user_agent, config.max_pages.max(1))?,
            search_url: config.search_url.clone(),
            max_pages: config.max_pages,
            min_chars: config.min_finding_chars,
        })
    }

    /// Allow fetching localhost/private IPs (for integration tests).
    #[cfg(test)]
    fn allow_localhost(mut self) -> Self {
        self.fetcher = self.fetcher.allow_localhost();
        self
    }

    fn search_url_for(&self, query: &str) -> Result<Url> {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        let raw = self.search_url.replace("{query}", &encoded);
        Url::parse(&raw).map_err(|e| GapwiseError::config(format!("invalid search url {raw}: {e}")))
    }

    /// Pick the section of a page that best matches the query terms.
    fn best_section(&self, sections: Vec<Section>, terms: &[String]) -> Option<(Section, usize)> {
        sections
            .into_iter()
            .filter(|s| s.body.chars().count() >= self.min_chars)
            .map(|s| {
                let matched = extract::matched_terms(&s, terms);
                (s, matched)
            })
            .filter(|(_, matched)| *matched > 0)
            .max_by_key(|(_, matched)| *matched)
    }
}

#[async_trait]
impl ResearchBackend for WebDocsBackend {
    fn name(&self) -> &str {
        WEB_BACKEND_NAME
    }

    fn cost_tier(&self) -> CostTier {
        CostTier::Free
    }

    fn reliability(&self) -> f64 {
        0.6
    }

    #[instrument(skip_all, fields(task_id = %task.id, queries = task.queries.len()))]
    async fn execute(&self, task: &ResearchTask) -> Result<ResearchResult> {
        let start = Instant::now();
        let manufacturer_domains: Vec<&str> =
            task.sources.iter().filter_map(|s| s.domain.as_deref()).collect();

        let mut findings: Vec<Finding> = Vec::new();
        let mut seen_pages: HashSet<String> = HashSet::new();
        let mut failed_searches = 0usize;

        for query in &task.queries {
            let search_url = self.search_url_for(query)?;
            let results_page = match self.fetcher.fetch(&search_url).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(%query, error = %e, "search request failed");
                    failed_searches += 1;
                    continue;
                }
            };

            let links: Vec<Url> =
                crate::fetch::extract_result_links(&results_page.html, &search_url)
                    .into_iter()
                    .take(self.max_pages)
                    .collect();
            debug!(%query, results = links.len(), "search results");

            let (pages, errors) = self.fetcher.fetch_all(links).await;
            for (url, error) in errors {
                debug!(%url, %error, "result page skipped");
            }

            let terms = extract::query_terms(query);
            for page in pages {
                if !seen_pages.insert(page.content_hash.clone()) {
                    continue;
                }
                let extracted = match extract::extract_page(&page.html) {
                    Ok(extracted) => extracted,
                    Err(e) => {
                        debug!(url = %page.url, error = %e, "extraction failed");
                        continue;
                    }
                };
                let Some((section, matched)) =
                    self.best_section(extract::split_sections(&extracted.markdown), &terms)
                else {
                    continue;
                };

                let host = page.url.host_str().unwrap_or_default();
                let on_manufacturer_site = manufacturer_domains
                    .iter()
                    .any(|d| host == *d || host.ends_with(&format!(".{d}")));
                let mut confidence =
                    (BASE_CONFIDENCE + PER_TERM_CONFIDENCE * (matched.saturating_sub(1)) as f64)
                        .min(MAX_TERM_CONFIDENCE);
                if on_manufacturer_site {
                    confidence += MANUFACTURER_DOMAIN_BONUS;
                }

                let page_title = extracted.title.unwrap_or_else(|| host.to_string());
                let title = match section.heading {
                    Some(heading) if heading != page_title => format!("{page_title}: {heading}"),
                    _ => page_title,
                };
                findings.push(Finding {
                    title,
                    content: section.body,
                    source_url: Some(page.url.to_string()),
                    confidence,
                });
            }
        }

        if findings.is_empty() {
            let reason = if failed_searches == task.queries.len() {
                "all searches failed"
            } else {
                "no usable findings"
            };
            return Err(GapwiseError::Research(format!("{WEB_BACKEND_NAME}: {reason}")));
        }

        let citations = findings.iter().filter_map(|f| f.source_url.clone()).collect();
        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(findings = findings.len(), elapsed_ms, "web research completed");

        Ok(ResearchResult {
            task_id: task.id.clone(),
            summary: format!(
                "{} findings across {} queries for: {}",
                findings.len(),
                task.queries.len(),
                task.objective
            ),
            findings,
            citations,
            cost_usd: 0.0,
            backend: WEB_BACKEND_NAME.to_string(),
            elapsed_ms,
        })
    }
}

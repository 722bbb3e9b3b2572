//! Concurrent page fetcher with SSRF protection.
//!
//! Used by the web research backend to pull search result pages and the
//! documents they link to. Fetches run as spawned tasks bounded by a
//! semaphore; failures are collected per URL rather than aborting the batch.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use reqwest::Client;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use gapwise_shared::{GapwiseError, Result};

/// Per-request HTTP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum redirects followed per request.
const MAX_REDIRECTS: usize = 5;

static LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

/// A fetched HTML document.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: Url,
    pub html: String,
    pub content_hash: String,
}

/// HTTP fetcher shared by research backends.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    concurrency: usize,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl Fetcher {
    /// Create a fetcher with the given user agent and concurrency bound.
    pub fn new(user_agent: &str, concurrency: usize) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GapwiseError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            concurrency: concurrency.max(1),
            allow_localhost: false,
        })
    }

    /// Allow fetching localhost/private IPs (for integration tests).
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    /// Fetch one page. Blocked, non-2xx, and unreadable responses are errors.
    pub async fn fetch(&self, url: &Url) -> Result<FetchedPage> {
        if !self.allow_localhost && is_ssrf_target(url) {
            warn!(%url, "SSRF protection: blocked");
            return Err(GapwiseError::Network(format!("{url}: blocked target")));
        }
        fetch_page(&self.client, url).await
    }

    /// Fetch many pages concurrently. Returns successes in input order and
    /// `(url, error)` for every failure.
    pub async fn fetch_all(&self, urls: Vec<Url>) -> (Vec<FetchedPage>, Vec<(String, String)>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();
        let mut errors = Vec::new();

        for url in urls {
            if !self.allow_localhost && is_ssrf_target(&url) {
                warn!(%url, "SSRF protection: blocked");
                errors.push((url.to_string(), "blocked target".to_string()));
                continue;
            }

            let client = self.client.clone();
            let sem = semaphore.clone();
            handles.push((
                url.to_string(),
                tokio::spawn(async move {
                    let _permit = sem
                        .acquire()
                        .await
                        .map_err(|e| GapwiseError::Network(format!("semaphore closed: {e}")))?;
                    fetch_page(&client, &url).await
                }),
            ));
        }

        let mut pages = Vec::new();
        for (url, handle) in handles {
            match handle.await {
                Ok(Ok(page)) => pages.push(page),
                Ok(Err(e)) => errors.push((url, e.to_string())),
                Err(e) => errors.push((url, e.to_string())),
            }
        }
        (pages, errors)
    }
}

/// Fetch a single page body.
async fn fetch_page(client: &Client, url: &Url) -> Result<FetchedPage> {
    debug!(%url, "fetching page");

    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| GapwiseError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(GapwiseError::Network(format!("{url}: HTTP {status}")));
    }

    let html = response
        .text()
        .await
        .map_err(|e| GapwiseError::Network(format!("{url}: body read failed: {e}")))?;

    Ok(FetchedPage {
        url: url.clone(),
        content_hash: compute_hash(&html),
        html,
    })
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// Extract outbound result links from a search results page.
///
/// Links back to the search engine's own host are dropped; redirect links
/// carrying the target in a `uddg`/`url`/`q` parameter are unwrapped.
pub fn extract_result_links(html: &str, base_url: &Url) -> Vec<Url> {
    let doc = Html::parse_document(html);
    let own_host = base_url.host_str().unwrap_or_default().to_string();
    let mut links: Vec<Url> = Vec::new();

    for el in doc.select(&LINK_SELECTOR) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        // Skip anchors, javascript:, mailto:
        if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        let Ok(mut resolved) = base_url.join(href) else {
            continue;
        };

        if let Some(target) = unwrap_redirect(&resolved) {
            resolved = target;
        } else if resolved.host_str().unwrap_or_default() == own_host {
            continue;
        }
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }

        resolved.set_fragment(None);
        let normalized = normalize_url(&resolved);
        if !links.iter().any(|l| normalize_url(l) == normalized) {
            links.push(resolved);
        }
    }

    links
}

/// Unwrap search-engine redirect links (`/l/?uddg=<target>`).
fn unwrap_redirect(url: &Url) -> Option<Url> {
    url.query_pairs()
        .find(|(k, _)| k == "uddg" || k == "url" || k == "q")
        .and_then(|(_, v)| Url::parse(&v).ok())
        .filter(|target| target.scheme() == "http" || target.scheme() == "https")
}

/// Normalize a URL for deduplication (strip fragment and trailing slash).
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    // Remove trailing slash for consistency (except root path)
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    s
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    // Block non-HTTP schemes
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// Compute SHA-256 hash of content.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

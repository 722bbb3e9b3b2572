//! HTML → Markdown extraction for fetched research pages.
//!
//! Picks the main content container, strips navigation chrome, converts to
//! Markdown with `htmd`, and splits the result into heading-delimited
//! sections that can be scored against a research query.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

use gapwise_shared::{GapwiseError, Result};

/// Longest section body kept for a finding.
const MAX_SECTION_CHARS: usize = 1_500;

/// Tags `htmd` drops entirely.
const SKIP_TAGS: [&str; 7] = ["script", "style", "nav", "iframe", "noscript", "svg", "form"];

/// Content containers in priority order (manufacturer portals, then semantic HTML).
static CONTENT_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "[role=\"main\"]",
        "article",
        "main",
        ".content",
        "#content",
        "body",
    ]
    .iter()
    .map(|s| Selector::parse(s).expect("valid selector"))
    .collect()
});

static CHROME_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("nav, header, footer, aside, script, style, .sidebar, .breadcrumb, .cookie-banner")
        .expect("valid selector")
});

static H1_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1").expect("valid selector"));

static TITLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid selector"));

/// A page reduced to its readable content.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPage {
    pub title: Option<String>,
    pub markdown: String,
}

/// A heading-delimited slice of a page.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub heading: Option<String>,
    pub body: String,
}

/// Extract the readable content of an HTML document as Markdown.
pub fn extract_page(html: &str) -> Result<ExtractedPage> {
    let doc = Html::parse_document(html);

    let title = doc
        .select(&H1_SELECTOR)
        .next()
        .or_else(|| doc.select(&TITLE_SELECTOR).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let content_html = CONTENT_SELECTORS
        .iter()
        .find_map(|sel| doc.select(sel).next())
        .map(|el| el.inner_html())
        .unwrap_or_else(|| html.to_string());
    let content_html = strip_chrome(&content_html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();
    let raw = converter
        .convert(&content_html)
        .map_err(|e| GapwiseError::parse(format!("htmd conversion failed: {e}")))?;

    Ok(ExtractedPage {
        title,
        markdown: cleanup(&raw),
    })
}

/// Remove navigation/chrome elements from an HTML fragment.
fn strip_chrome(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let mut result = html.to_string();
    for el in doc.select(&CHROME_SELECTOR) {
        result = result.replace(&el.html(), "");
    }
    result
}

/// Strip leftover tags and collapse blank-line runs.
fn cleanup(md: &str) -> String {
    static TAG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").expect("valid regex"));
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let without_tags = TAG_RE.replace_all(md, "");
    let trimmed_lines: Vec<&str> = without_tags.lines().map(str::trim_end).collect();
    MULTI_BLANK_RE
        .replace_all(&trimmed_lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

/// Split Markdown into sections at each heading line.
pub fn split_sections(markdown: &str) -> Vec<Section> {
    static HEADING_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^#{1,6}\s+(.+)$").expect("valid regex"));

    let mut sections = Vec::new();
    let mut heading: Option<String> = None;
    let mut body = String::new();

    for line in markdown.lines() {
        if let Some(caps) = HEADING_RE.captures(line) {
            push_section(&mut sections, heading.take(), &body);
            body.clear();
            heading = Some(caps[1].trim().to_string());
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }
    push_section(&mut sections, heading, &body);
    sections
}

fn push_section(sections: &mut Vec<Section>, heading: Option<String>, body: &str) {
    let body = body.trim();
    if body.is_empty() {
        return;
    }
    let body = if body.chars().count() > MAX_SECTION_CHARS {
        let mut cut: String = body.chars().take(MAX_SECTION_CHARS).collect();
        cut.push('…');
        cut
    } else {
        body.to_string()
    };
    sections.push(Section { heading, body });
}

/// Number of distinct `terms` (case-insensitive) that occur in the section.
pub fn matched_terms(section: &Section, terms: &[String]) -> usize {
    let haystack = format!(
        "{} {}",
        section.heading.as_deref().unwrap_or_default(),
        section.body
    )
    .to_lowercase();
    terms
        .iter()
        .filter(|t| !t.is_empty() && haystack.contains(&t.to_lowercase()))
        .count()
}

/// Lowercased query words worth matching (drops short words and `site:` filters).
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in query.split_whitespace() {
        if word.starts_with("site:") {
            continue;
        }
        let word = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if word.len() >= 3 && !terms.contains(&word) {
            terms.push(word);
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>F0003 | Drive Faults</title></head><body>
        <nav><a href="/">Home</a> Products Support</nav>
        <main>
            <h1>SINAMICS fault F0003</h1>
            <p>Undervoltage detected on the DC link.</p>
            <h2>Cause</h2>
            <p>Mains supply failed or dropped below the permitted limit.</p>
            <h2>Remedy</h2>
            <ol><li>Check the supply voltage.</li><li>Check the pre-charge circuit.</li></ol>
        </main>
        <footer>Copyright Siemens</footer>
    </body></html>"#;

    #[test]
    fn extracts_title_and_strips_chrome() {
        let page = extract_page(PAGE).expect("extract");
        assert_eq!(page.title.as_deref(), Some("SINAMICS fault F0003"));
        assert!(page.markdown.contains("Undervoltage detected"));
        assert!(page.markdown.contains("pre-charge"));
        assert!(!page.markdown.contains("Copyright"));
        assert!(!page.markdown.contains("Products Support"));
    }

    #[test]
    fn falls_back_to_title_tag() {
        let page = extract_page("<html><head><title>Manual</title></head><body><p>x</p></body></html>")
            .expect("extract");
        assert_eq!(page.title.as_deref(), Some("Manual"));
    }

    #[test]
    fn splits_on_headings() {
        let md = "intro text\n\n# Title\nbody one\n\n## Cause\ncause text\n## Empty\n\n## Remedy\nfix it";
        let sections = split_sections(md);
        assert_eq!(sections.len(), 4);
        assert_eq!(sections[0].heading, None);
        assert_eq!(sections[2].heading.as_deref(), Some("Cause"));
        assert_eq!(sections[3].body, "fix it");
    }

    #[test]
    fn long_sections_are_truncated() {
        let md = format!("# Big\n{}", "a".repeat(MAX_SECTION_CHARS + 100));
        let sections = split_sections(&md);
        assert_eq!(sections[0].body.chars().count(), MAX_SECTION_CHARS + 1);
    }

    #[test]
    fn term_matching_ignores_case_and_site_filters() {
        let terms = query_terms("SINAMICS F0003 meaning site:siemens.com of");
        assert_eq!(terms, vec!["sinamics", "f0003", "meaning"]);

        let section = Section {
            heading: Some("Fault F0003".into()),
            body: "Sinamics drives report undervoltage.".into(),
        };
        assert_eq!(matched_terms(&section, &terms), 2);
    }
}

//! Vendor / intent classification.
//!
//! A regex pass recognises manufacturer names, model and part numbers, fault
//! codes, equipment keywords, and the coarse intent category. When that pass
//! is not confident, or the text came from OCR or speech, a completion model
//! is asked for the same fields as JSON and fills whatever the regex pass
//! missed. Classification never fails; the worst outcome is an unclear
//! intent, which routes to a clarification request.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use gapwise_shared::{
    CompletionProvider, CompletionRequest, EquipmentType, Intent, IntentCategory, Query,
    QuerySource, RoutingConfig, Vendor,
};

/// Confidence multiplier applied when a part number contradicts the named vendor.
const VENDOR_MISMATCH_PENALTY: f64 = 0.6;

// Weights of each recognised field in the regex-pass confidence.
const VENDOR_WEIGHT: f64 = 0.35;
const EQUIPMENT_WEIGHT: f64 = 0.2;
const IDENTIFIER_WEIGHT: f64 = 0.25;
const CATEGORY_WEIGHT: f64 = 0.1;

/// Deep-extracted fields count for less than regex matches.
const DEEP_FIELD_DISCOUNT: f64 = 0.8;

// ---------------------------------------------------------------------------
// Pattern tables
// ---------------------------------------------------------------------------

fn ci(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){pattern}")).expect("valid regex")
}

/// Manufacturer names, brands, and product-line aliases.
static VENDOR_PATTERNS: LazyLock<Vec<(Vendor, Regex)>> = LazyLock::new(|| {
    vec![
        (
            Vendor::Siemens,
            ci(r"\b(?:siemens|simatic|sinamics|sinumerik|micromaster|tia portal)\b"),
        ),
        (
            Vendor::Rockwell,
            ci(r"\b(?:rockwell|allen[- ]?bradley|controllogix|compactlogix|micrologix|guardlogix|powerflex|panelview|studio 5000|rslogix)\b"),
        ),
        (Vendor::Abb, ci(r"\babb\b")),
        (
            Vendor::Schneider,
            ci(r"\b(?:schneider|telemecanique|modicon|altivar|square d)\b"),
        ),
        (Vendor::Mitsubishi, ci(r"\b(?:mitsubishi|melsec|melservo)\b")),
        (Vendor::Omron, ci(r"\b(?:omron|sysmac)\b")),
        (Vendor::Fanuc, ci(r"\bfanuc\b")),
        (Vendor::Yaskawa, ci(r"\b(?:yaskawa|motoman)\b")),
        (Vendor::Danfoss, ci(r"\b(?:danfoss|vlt)\b")),
    ]
});

/// Model families and part-number schemes, with the vendor that owns them.
static MODEL_PATTERNS: LazyLock<Vec<(Vendor, EquipmentType, Regex)>> = LazyLock::new(|| {
    use EquipmentType::*;
    vec![
        // Siemens order numbers: 6ES7 214-1AG40-0XB0, 6SL3210-1KE21-3UF1
        (Vendor::Siemens, Unknown, ci(r"\b6[a-z]{2}\d\s?\d{3}-\d[a-z]{2}\d{2}-\d[a-z]{2}\d\b")),
        (Vendor::Siemens, Plc, ci(r"\bS7-?\d{3,4}\b")),
        (Vendor::Siemens, Drive, ci(r"\bsinamics\s?[gsv]\d{2,3}[a-z]?\b")),
        (Vendor::Siemens, Drive, ci(r"\bmicromaster\s?\d{3}\b")),
        // Rockwell catalog numbers: 1756-L73, 1769-L33ER, 2711P-T7C4D8, 2198-H008-ERS
        (Vendor::Rockwell, Plc, ci(r"\b(?:1756|1769|1766|1762|5069|2080)-[a-z]{1,3}\d[a-z0-9]*\b")),
        (Vendor::Rockwell, Hmi, ci(r"\b2711[a-z]?-[a-z0-9]{2,}\b")),
        (Vendor::Rockwell, Servo, ci(r"\b2198-[a-z0-9]{2,}(?:-[a-z0-9]+)?\b")),
        (Vendor::Rockwell, Drive, ci(r"\bpowerflex\s?\d{2,3}[a-z]?\b")),
        (Vendor::Rockwell, Plc, ci(r"\b(?:control|compact|micro|guard)logix\s?\d{3,4}\b")),
        (Vendor::Rockwell, Hmi, ci(r"\bpanelview\s?(?:plus\s?)?\d{3,4}\b")),
        (Vendor::Abb, Drive, ci(r"\bac[shq]\d{3,4}\b")),
        (Vendor::Abb, Robot, ci(r"\birb\s?\d{3,4}\b")),
        (Vendor::Schneider, Drive, ci(r"\b(?:atv|altivar\s?)\d{2,3}\b")),
        (Vendor::Schneider, Plc, ci(r"\bmodicon\s?m\d{3}\b")),
        (Vendor::Mitsubishi, Drive, ci(r"\bfr-[a-z]\d{3}\b")),
        (Vendor::Mitsubishi, Plc, ci(r"\bfx[35][a-z]{1,2}\b")),
        (Vendor::Omron, Plc, ci(r"\b(?:cj2[hm]|cp1[ehl]|nj\d{3}|nx1p\d?)\b")),
        (Vendor::Fanuc, Robot, ci(r"\br-(?:30i[ab]|j3ib)\b")),
        (Vendor::Yaskawa, Drive, ci(r"\b(?:ga\d{3}|[vaj]1000)\b")),
        (Vendor::Danfoss, Drive, ci(r"\bfc\s?\d{3}\b")),
    ]
});

/// Letter-prefixed codes: F0003, A5000, E12, L1.
static LETTER_FAULT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[FEAL]\d{1,4}\b").expect("valid regex"));

/// Word-prefixed codes: "error 42", "fault code 7", "alarm #2001".
static WORD_FAULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    ci(r"\b(error|fault|alarm|code)\s*(?:code\s*)?#?\s*(\d{1,5})\b")
});

/// Equipment keywords in precedence order ("servo drive" is a servo).
static EQUIPMENT_PATTERNS: LazyLock<Vec<(EquipmentType, Regex)>> = LazyLock::new(|| {
    use EquipmentType::*;
    vec![
        (Servo, ci(r"\bservos?\b")),
        (Robot, ci(r"\b(?:robots?|robotic|motoman|teach pendant)\b")),
        (Hmi, ci(r"\b(?:hmi|panelview|touch ?panel|operator panel)\b")),
        (Plc, ci(r"\b(?:plcs?|controllogix|compactlogix|micrologix|simatic|melsec|modicon|ladder logic|plc program)\b")),
        (Drive, ci(r"\b(?:drives?|vfds?|inverters?|variable frequency|powerflex|sinamics|micromaster|altivar)\b")),
        (Compressor, ci(r"\bcompressors?\b")),
        (Pump, ci(r"\bpumps?\b")),
        (Conveyor, ci(r"\b(?:conveyors?|belt)\b")),
        (Sensor, ci(r"\b(?:sensors?|encoders?|proximity|photo ?eyes?|limit switch)\b")),
        (Motor, ci(r"\bmotors?\b")),
    ]
});

static SAFETY_CATEGORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    ci(r"\b(?:lockout|tagout|loto|e-?stop|emergency stop|interlocks?|arc flash|ppe|safety|guards?|sil\s?\d?)\b")
});

static TROUBLESHOOTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    ci(r"\b(?:faults?|errors?|alarms?|trips?|tripped|tripping|broken|not working|won'?t|doesn'?t|fails?|failed|failure|troubleshoot\w*|problem|issue|stopped|overheat\w*)\b")
});

static PROCEDURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    ci(r"\b(?:how (?:do|to|can)|procedure|steps?|replace|install|configure|calibrate|set ?up|commission\w*|wire|wiring)\b")
});

static SPECIFICATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    ci(r"\b(?:specs?|specifications?|ratings?|rated|voltage|current|dimensions?|datasheet|torque|capacity|max(?:imum)?|weight)\b")
});

/// "XYZ-brand", "brand XYZ", "made by XYZ", "manufacturer: XYZ".
static BRAND_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| ci(r"\b([a-z0-9][a-z0-9&]*)[- ]brand\b"));
/// The name itself must be capitalised so "brand new" is not a brand.
static BRAND_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?i:brand|manufacturer|made by|manufactured by|make)\s*:?\s+([A-Z][A-Za-z0-9&-]*)")
        .expect("valid regex")
});

/// Words the brand patterns must not report as a manufacturer.
const NOT_A_BRAND: [&str; 10] = [
    "a", "an", "the", "this", "that", "my", "our", "unknown", "new", "some",
];

static JSON_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

// ---------------------------------------------------------------------------
// Regex pass
// ---------------------------------------------------------------------------

/// A model number with the vendor and equipment its pattern implies.
#[derive(Debug, Clone, PartialEq)]
struct ModelMatch {
    text: String,
    vendor: Vendor,
    equipment: EquipmentType,
    start: usize,
    end: usize,
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn find_models(text: &str) -> Vec<ModelMatch> {
    let mut found: Vec<ModelMatch> = Vec::new();
    for (vendor, equipment, re) in MODEL_PATTERNS.iter() {
        for m in re.find_iter(text) {
            let overlaps = found.iter().any(|f| m.start() < f.end && f.start < m.end());
            if !overlaps {
                found.push(ModelMatch {
                    text: collapse_whitespace(m.as_str()),
                    vendor: *vendor,
                    equipment: *equipment,
                    start: m.start(),
                    end: m.end(),
                });
            }
        }
    }
    found.sort_by_key(|m| m.start);
    found
}

fn find_fault_codes(text: &str, models: &[ModelMatch]) -> Vec<String> {
    // Blank out model spans so "1756-L73" does not yield an "L73" fault.
    let mut masked = text.to_string();
    for m in models {
        masked.replace_range(m.start..m.end, &" ".repeat(m.end - m.start));
    }

    let mut codes: Vec<(usize, String)> = Vec::new();
    for m in LETTER_FAULT_RE.find_iter(&masked) {
        codes.push((m.start(), m.as_str().to_string()));
    }
    for caps in WORD_FAULT_RE.captures_iter(&masked) {
        let start = caps.get(0).map_or(0, |m| m.start());
        let keyword = caps[1].to_lowercase();
        let mut label = String::with_capacity(keyword.len() + 6);
        let mut chars = keyword.chars();
        if let Some(first) = chars.next() {
            label.extend(first.to_uppercase());
            label.push_str(chars.as_str());
        }
        codes.push((start, format!("{label} {}", &caps[2])));
    }
    codes.sort_by_key(|(start, _)| *start);

    let mut out: Vec<String> = Vec::new();
    for (_, code) in codes {
        if !out.iter().any(|c| c.eq_ignore_ascii_case(&code)) {
            out.push(code);
        }
    }
    out
}

fn find_vendor(text: &str) -> Option<Vendor> {
    VENDOR_PATTERNS
        .iter()
        .filter_map(|(vendor, re)| re.find(text).map(|m| (m.start(), *vendor)))
        .min_by_key(|(start, _)| *start)
        .map(|(_, vendor)| vendor)
}

fn find_equipment(text: &str) -> Option<EquipmentType> {
    EQUIPMENT_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(equipment, _)| *equipment)
}

fn find_category(text: &str) -> IntentCategory {
    if SAFETY_CATEGORY_RE.is_match(text) {
        IntentCategory::Safety
    } else if TROUBLESHOOTING_RE.is_match(text) {
        IntentCategory::Troubleshooting
    } else if PROCEDURE_RE.is_match(text) {
        IntentCategory::Procedure
    } else if SPECIFICATION_RE.is_match(text) {
        IntentCategory::Specification
    } else {
        IntentCategory::General
    }
}

/// A manufacturer the query names explicitly but that is not a known vendor.
pub fn unrecognized_manufacturer(text: &str) -> Option<String> {
    let candidates = BRAND_SUFFIX_RE
        .captures_iter(text)
        .chain(BRAND_PREFIX_RE.captures_iter(text))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim_matches('-').to_string()));

    for name in candidates {
        let lower = name.to_lowercase();
        if name.is_empty() || NOT_A_BRAND.contains(&lower.as_str()) {
            continue;
        }
        if find_vendor(&name).is_some() {
            continue;
        }
        return Some(name);
    }
    None
}

fn regex_confidence(intent: &Intent) -> f64 {
    let mut confidence = 0.0;
    if intent.vendor.is_known() {
        confidence += VENDOR_WEIGHT;
    }
    if intent.equipment.is_known() {
        confidence += EQUIPMENT_WEIGHT;
    }
    if !intent.fault_codes.is_empty() || !intent.model_numbers.is_empty() {
        confidence += IDENTIFIER_WEIGHT;
    }
    if intent.category != IntentCategory::General {
        confidence += CATEGORY_WEIGHT;
    }
    f64::min(confidence, 1.0)
}

/// Regex-only classification of `text`.
pub fn extract(text: &str) -> Intent {
    let models = find_models(text);
    let fault_codes = find_fault_codes(text, &models);

    let named_vendor = find_vendor(text);
    let vendor = named_vendor
        .or_else(|| models.first().map(|m| m.vendor))
        .unwrap_or(Vendor::Unknown);

    let equipment = find_equipment(text)
        .or_else(|| models.iter().map(|m| m.equipment).find(|e| e.is_known()))
        .unwrap_or(EquipmentType::Unknown);

    let mut model_numbers: Vec<String> = Vec::new();
    for m in &models {
        if !model_numbers.iter().any(|n| n.eq_ignore_ascii_case(&m.text)) {
            model_numbers.push(m.text.clone());
        }
    }

    let mut intent = Intent {
        vendor,
        equipment,
        fault_codes,
        model_numbers,
        category: find_category(text),
        confidence: 0.0,
        notes: Vec::new(),
    };
    intent.confidence = regex_confidence(&intent);

    if let Some(claimed) = named_vendor {
        validate_vendor(&mut intent, claimed, &models);
    }
    intent
}

/// Penalise a part number that belongs to a different vendor than the one named.
fn validate_vendor(intent: &mut Intent, claimed: Vendor, models: &[ModelMatch]) {
    let mut penalised = false;
    for m in models.iter().filter(|m| m.vendor != claimed) {
        intent.notes.push(format!(
            "{} looks like a {} part number, not {}",
            m.text,
            m.vendor.display_name(),
            claimed.display_name()
        ));
        penalised = true;
    }
    if penalised {
        intent.confidence *= VENDOR_MISMATCH_PENALTY;
    }
}

// ---------------------------------------------------------------------------
// Deep extraction
// ---------------------------------------------------------------------------

const DEEP_SYSTEM_PROMPT: &str = "You extract equipment identifiers from industrial maintenance questions. \
Reply only with a JSON object: {\"vendor\": string|null, \"equipment\": string|null, \
\"fault_codes\": [string], \"model_numbers\": [string], \"category\": string|null}. \
vendor is one of siemens, rockwell, abb, schneider, mitsubishi, omron, fanuc, yaskawa, danfoss. \
equipment is one of plc, drive, hmi, robot, servo, motor, sensor, conveyor, compressor, pump. \
category is one of troubleshooting, procedure, specification, safety, general. Use null when unsure.";

#[derive(Debug, Default, Deserialize)]
struct DeepFields {
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    equipment: Option<String>,
    #[serde(default)]
    fault_codes: Vec<String>,
    #[serde(default)]
    model_numbers: Vec<String>,
    #[serde(default)]
    category: Option<String>,
}

fn parse_deep_fields(text: &str) -> Option<DeepFields> {
    let block = JSON_BLOCK_RE.find(text)?;
    serde_json::from_str(block.as_str()).ok()
}

/// Fill fields the regex pass left empty. Regex results always win.
fn merge(intent: &mut Intent, deep: DeepFields) {
    let mut gained = 0.0;

    if !intent.vendor.is_known() {
        if let Some(vendor) = deep
            .vendor
            .and_then(|v| v.trim().to_lowercase().parse::<Vendor>().ok())
            .filter(Vendor::is_known)
        {
            intent.vendor = vendor;
            gained += VENDOR_WEIGHT;
        }
    }
    if !intent.equipment.is_known() {
        if let Some(equipment) = deep
            .equipment
            .and_then(|e| e.trim().to_lowercase().parse::<EquipmentType>().ok())
            .filter(EquipmentType::is_known)
        {
            intent.equipment = equipment;
            gained += EQUIPMENT_WEIGHT;
        }
    }
    let had_identifier = !intent.fault_codes.is_empty() || !intent.model_numbers.is_empty();
    if intent.fault_codes.is_empty() {
        intent.fault_codes = clean_list(deep.fault_codes);
    }
    if intent.model_numbers.is_empty() {
        intent.model_numbers = clean_list(deep.model_numbers);
    }
    if !had_identifier && (!intent.fault_codes.is_empty() || !intent.model_numbers.is_empty()) {
        gained += IDENTIFIER_WEIGHT;
    }
    if intent.category == IntentCategory::General {
        if let Some(category) = deep
            .category
            .and_then(|c| c.trim().to_lowercase().parse::<IntentCategory>().ok())
            .filter(|c| *c != IntentCategory::General)
        {
            intent.category = category;
            gained += CATEGORY_WEIGHT;
        }
    }

    intent.confidence = f64::min(intent.confidence + gained * DEEP_FIELD_DISCOUNT, 1.0);
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let item = collapse_whitespace(&item);
        if !item.is_empty() && !out.iter().any(|o| o.eq_ignore_ascii_case(&item)) {
            out.push(item);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Layered intent classifier.
#[derive(Clone, Default)]
pub struct Classifier {
    provider: Option<Arc<dyn CompletionProvider>>,
    call_timeout: Duration,
}

impl Classifier {
    /// Regex-only classifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable deep extraction through `provider`.
    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>, call_timeout: Duration) -> Self {
        self.provider = Some(provider);
        self.call_timeout = call_timeout;
        self
    }

    /// Classify a query. Never fails.
    #[instrument(skip_all, fields(query_id = %query.id))]
    pub async fn classify(&self, query: &Query, config: &RoutingConfig) -> Intent {
        let text = query.full_text();
        let mut intent = extract(&text);
        debug!(
            vendor = %intent.vendor,
            equipment = %intent.equipment,
            faults = intent.fault_codes.len(),
            models = intent.model_numbers.len(),
            confidence = intent.confidence,
            "regex classification"
        );

        let wants_deep = intent.confidence < config.deep_extraction_threshold
            || query.image_text.is_some()
            || query.source == QuerySource::Voice;
        if !(config.deep_extraction && wants_deep) {
            return intent;
        }
        let Some(provider) = &self.provider else {
            return intent;
        };

        let request = CompletionRequest::new(text)
            .with_system(DEEP_SYSTEM_PROMPT)
            .with_max_tokens(256);
        match provider.complete(&request, self.call_timeout).await {
            Ok(completion) => match parse_deep_fields(&completion.text) {
                Some(deep) => {
                    merge(&mut intent, deep);
                    debug!(confidence = intent.confidence, "deep extraction merged");
                }
                None => warn!("deep extraction reply was not valid JSON"),
            },
            Err(e) => warn!(error = %e, "deep extraction failed"),
        }
        intent
    }
}

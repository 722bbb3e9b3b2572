//! Gap detection: turn a poorly-covered query into a prioritised research gap.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;

use gapwise_shared::{
    CoverageLevel, CoverageResult, GapEntities, GapPriority, GapType, GapsConfig, Intent,
    IntentCategory, KnowledgeGap, KnowledgeUnit, Query, ResearchSource, SourceKind,
};

use crate::classifier;

/// Upper bound on generated search terms.
pub const MAX_SEARCH_TERMS: usize = 10;

static SAFETY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:lockout|tagout|loto|e-?stop|emergency stop|sil\s?\d?|interlocks?|arc flash|guards?)\b",
    )
    .expect("valid regex")
});

static FAULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:faults?|errors?|alarms?|trip(?:ped|s)?)\b").expect("valid regex")
});

static TROUBLESHOOTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:troubleshoot\w*|not working|won'?t|doesn'?t|broken|fails?|failed|failure|stopped|problem|issue|overheat\w*)\b",
    )
    .expect("valid regex")
});

/// Detect a knowledge gap for a query.
///
/// Returns `None` when coverage is `STRONG`, unless always-log mode is on, in
/// which case every query produces a gap record for auditing. Only gaps with
/// [`KnowledgeGap::needs_fill`] are sent on for research.
pub fn detect(
    query: &Query,
    intent: &Intent,
    coverage: &CoverageResult,
    config: &GapsConfig,
) -> Option<KnowledgeGap> {
    if coverage.level == CoverageLevel::Strong && !config.always_log {
        return None;
    }

    let text = query.full_text();
    let unrecognized = if intent.vendor.is_known() {
        None
    } else {
        classifier::unrecognized_manufacturer(&text)
    };

    let gap_type = if unrecognized.is_some() {
        GapType::UnknownManufacturer
    } else if intent.vendor.is_known()
        && !intent.model_numbers.is_empty()
        && coverage.level == CoverageLevel::None
    {
        GapType::UnknownModel
    } else if is_troubleshooting(&text, intent)
        && intent.fault_codes.is_empty()
        && intent.model_numbers.is_empty()
    {
        GapType::MissingIdentifier
    } else {
        GapType::NoMatch
    };

    let entities = GapEntities {
        vendor: intent.vendor,
        unrecognized_manufacturer: unrecognized,
        equipment: intent.equipment,
        model_numbers: intent.model_numbers.clone(),
        fault_codes: intent.fault_codes.clone(),
        atom_id: None,
    };
    let priority = priority(&text, intent, coverage.level);
    let search_terms = search_terms(&entities, &text);
    let sources = sources(&entities, priority);

    Some(KnowledgeGap {
        id: KnowledgeGap::new_id(),
        query_text: query.text.clone(),
        gap_type,
        entities,
        priority,
        search_terms,
        sources,
        coverage_level: coverage.level,
        detected_at: Utc::now(),
    })
}

/// A `LOW_SATISFACTION` gap for an atom that technicians keep rejecting.
pub fn from_feedback(atom: &KnowledgeUnit) -> KnowledgeGap {
    let text = format!("{}\n{}", atom.title, atom.content);
    let priority = if SAFETY_RE.is_match(&text) {
        GapPriority::Critical
    } else {
        GapPriority::Medium
    };
    let entities = GapEntities {
        vendor: atom.vendor,
        unrecognized_manufacturer: None,
        equipment: atom.equipment,
        model_numbers: Vec::new(),
        fault_codes: Vec::new(),
        atom_id: Some(atom.id.clone()),
    };

    let mut terms = TermList::default();
    let prefix = entities.manufacturer().unwrap_or_default();
    terms.push(format!("{prefix} {}", atom.title));
    terms.push(format!("{} troubleshooting", atom.title));
    if atom.vendor.is_known() || atom.equipment.is_known() {
        terms.push(format!("{prefix} {} manual", atom.equipment.search_label()));
    }
    if let Some(domain) = atom.vendor.domain() {
        terms.push(format!("site:{domain} {}", atom.title));
    }

    KnowledgeGap {
        id: KnowledgeGap::new_id(),
        query_text: atom.title.clone(),
        gap_type: GapType::LowSatisfaction,
        sources: sources(&entities, priority),
        entities,
        priority,
        search_terms: terms.finish(&atom.title),
        coverage_level: CoverageLevel::Thin,
        detected_at: Utc::now(),
    }
}

fn is_troubleshooting(text: &str, intent: &Intent) -> bool {
    intent.category == IntentCategory::Troubleshooting
        || FAULT_RE.is_match(text)
        || TROUBLESHOOTING_RE.is_match(text)
}

/// Priority rules, first match wins.
fn priority(text: &str, intent: &Intent, level: CoverageLevel) -> GapPriority {
    if SAFETY_RE.is_match(text) || intent.category == IntentCategory::Safety {
        GapPriority::Critical
    } else if (FAULT_RE.is_match(text) || !intent.fault_codes.is_empty())
        && level < CoverageLevel::Strong
    {
        GapPriority::High
    } else if is_troubleshooting(text, intent) {
        GapPriority::Medium
    } else {
        GapPriority::Low
    }
}

/// Deduplicating, bounded search term collector.
#[derive(Default)]
struct TermList(Vec<String>);

impl TermList {
    fn push(&mut self, term: String) {
        let term = term.split_whitespace().collect::<Vec<_>>().join(" ");
        if term.is_empty() || self.0.len() >= MAX_SEARCH_TERMS {
            return;
        }
        if !self.0.iter().any(|t| t.eq_ignore_ascii_case(&term)) {
            self.0.push(term);
        }
    }

    /// The collected terms, or the normalised `fallback` text when empty.
    fn finish(self, fallback: &str) -> Vec<String> {
        if !self.0.is_empty() {
            return self.0;
        }
        let normalized = fallback
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '-'))
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if normalized.is_empty() {
            vec!["industrial equipment troubleshooting".to_string()]
        } else {
            vec![normalized]
        }
    }
}

fn search_terms(entities: &GapEntities, text: &str) -> Vec<String> {
    let mut terms = TermList::default();
    let prefix = entities.manufacturer().unwrap_or_default();
    let equipment = entities.equipment.search_label();
    let identifier = entities
        .model_numbers
        .first()
        .or_else(|| entities.fault_codes.first());

    if let Some(id) = identifier {
        terms.push(format!("{prefix} {id} manual"));
        terms.push(format!("{prefix} {id} troubleshooting"));
    }
    if !prefix.is_empty() {
        terms.push(format!("{prefix} {equipment} manual"));
        terms.push(format!("{prefix} {equipment} service bulletin"));
    }
    if let Some(model) = entities.model_numbers.first() {
        for fault in entities.fault_codes.iter().take(2) {
            terms.push(format!("{prefix} {model} {fault}"));
        }
    }
    for fault in entities.fault_codes.iter().take(2) {
        terms.push(format!("{prefix} {fault} meaning"));
    }
    if let Some(domain) = entities.vendor.domain() {
        if let Some(id) = identifier {
            terms.push(format!("site:{domain} {id}"));
        }
        if let Some(fault) = entities.fault_codes.first() {
            terms.push(format!("site:{domain} {fault}"));
        }
        if identifier.is_none() {
            terms.push(format!("site:{domain} {equipment}"));
        }
    }
    if identifier.is_none() && prefix.is_empty() && entities.equipment.is_known() {
        terms.push(format!("{equipment} troubleshooting guide"));
    }

    terms.finish(text)
}

/// Research sources in priority order.
fn sources(entities: &GapEntities, priority: GapPriority) -> Vec<ResearchSource> {
    let mut sources = vec![
        ResearchSource {
            kind: SourceKind::ManufacturerSite,
            domain: entities.vendor.domain().map(str::to_string),
        },
        ResearchSource {
            kind: SourceKind::ManualsAggregator,
            domain: None,
        },
    ];
    if priority >= GapPriority::High {
        sources.push(ResearchSource {
            kind: SourceKind::ServiceBulletins,
            domain: None,
        });
        sources.push(ResearchSource {
            kind: SourceKind::SafetyStandards,
            domain: None,
        });
    }
    sources.push(ResearchSource {
        kind: SourceKind::CommunityForum,
        domain: None,
    });
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use gapwise_shared::{EquipmentType, Vendor};

    fn detect_for(text: &str, level: CoverageLevel) -> Option<KnowledgeGap> {
        let query = Query::new(text);
        let intent = classifier::extract(text);
        let coverage = CoverageResult {
            level,
            atoms: Vec::new(),
            best_score: None,
            evaluated: true,
        };
        detect(&query, &intent, &coverage, &GapsConfig::default())
    }

    #[test]
    fn strong_coverage_has_no_gap() {
        assert!(detect_for("Siemens S7-1200 fault F0003", CoverageLevel::Strong).is_none());
    }

    #[test]
    fn always_log_records_strong_coverage() {
        let query = Query::new("Siemens S7-1200 fault F0003");
        let intent = classifier::extract(&query.text);
        let coverage = CoverageResult {
            level: CoverageLevel::Strong,
            atoms: Vec::new(),
            best_score: Some(0.8),
            evaluated: true,
        };
        let config = GapsConfig {
            always_log: true,
            ..GapsConfig::default()
        };
        let gap = detect(&query, &intent, &coverage, &config).expect("audit gap");
        assert!(!gap.needs_fill());
    }

    #[test]
    fn unknown_manufacturer_with_error_is_high() {
        let gap = detect_for("XYZ-brand widget error 42", CoverageLevel::None).expect("gap");
        assert_eq!(gap.gap_type, GapType::UnknownManufacturer);
        assert_eq!(gap.entities.unrecognized_manufacturer.as_deref(), Some("XYZ"));
        assert!(gap.priority >= GapPriority::High);
        assert!(gap.search_terms.contains(&"XYZ Error 42 manual".to_string()));
        assert_eq!(gap.sources[0].kind, SourceKind::ManufacturerSite);
        assert_eq!(gap.sources[0].domain, None);
        assert!(gap.needs_fill());
    }

    #[test]
    fn known_vendor_model_without_coverage_is_unknown_model() {
        let gap = detect_for("Rockwell PowerFlex 525 fault F012", CoverageLevel::None).expect("gap");
        assert_eq!(gap.gap_type, GapType::UnknownModel);
        assert_eq!(gap.priority, GapPriority::High);
        assert_eq!(
            gap.search_terms,
            vec![
                "Allen-Bradley PowerFlex 525 manual",
                "Allen-Bradley PowerFlex 525 troubleshooting",
                "Allen-Bradley VFD drive manual",
                "Allen-Bradley VFD drive service bulletin",
                "Allen-Bradley PowerFlex 525 F012",
                "Allen-Bradley F012 meaning",
                "site:literature.rockwellautomation.com PowerFlex 525",
                "site:literature.rockwellautomation.com F012",
            ]
        );
        let kinds: Vec<SourceKind> = gap.sources.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SourceKind::ManufacturerSite,
                SourceKind::ManualsAggregator,
                SourceKind::ServiceBulletins,
                SourceKind::SafetyStandards,
                SourceKind::CommunityForum,
            ]
        );
        assert_eq!(
            gap.sources[0].domain.as_deref(),
            Some("literature.rockwellautomation.com")
        );
    }

    #[test]
    fn thin_coverage_with_model_is_no_match() {
        let gap = detect_for("Rockwell PowerFlex 525 parameter list", CoverageLevel::Thin).expect("gap");
        assert_eq!(gap.gap_type, GapType::NoMatch);
        assert_eq!(gap.priority, GapPriority::Low);
        let kinds: Vec<SourceKind> = gap.sources.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![SourceKind::ManufacturerSite, SourceKind::ManualsAggregator, SourceKind::CommunityForum]
        );
    }

    #[test]
    fn troubleshooting_without_identifier_is_missing_identifier() {
        let gap = detect_for("conveyor belt keeps stopping, won't restart", CoverageLevel::None).expect("gap");
        assert_eq!(gap.gap_type, GapType::MissingIdentifier);
        assert_eq!(gap.priority, GapPriority::Medium);
        assert_eq!(gap.search_terms, vec!["conveyor troubleshooting guide"]);
    }

    #[test]
    fn safety_language_is_critical() {
        let gap = detect_for("lockout procedure for the ABB ACS880", CoverageLevel::Thin).expect("gap");
        assert_eq!(gap.priority, GapPriority::Critical);
    }

    #[test]
    fn nothing_extractable_uses_query_text() {
        let gap = detect_for("What's the torque?", CoverageLevel::None).expect("gap");
        assert_eq!(gap.search_terms, vec!["what's the torque"]);
        assert_eq!(gap.priority, GapPriority::Low);
    }

    #[test]
    fn search_terms_are_bounded_and_unique() {
        let gap = detect_for(
            "Siemens S7-1200 6ES7 214-1AG40-0XB0 fault F0003 F0004 alarm A5000",
            CoverageLevel::None,
        )
        .expect("gap");
        assert!(gap.search_terms.len() <= MAX_SEARCH_TERMS);
        let mut lowered: Vec<String> = gap.search_terms.iter().map(|t| t.to_lowercase()).collect();
        lowered.sort();
        lowered.dedup();
        assert_eq!(lowered.len(), gap.search_terms.len());
    }

    #[test]
    fn feedback_gap_targets_atom() {
        let atom = KnowledgeUnit::new(
            "PowerFlex 525 F012 reset",
            "Cycle power and clear the fault.",
            Vendor::Rockwell,
            EquipmentType::Drive,
        );
        let gap = from_feedback(&atom);
        assert_eq!(gap.gap_type, GapType::LowSatisfaction);
        assert_eq!(gap.entities.atom_id.as_deref(), Some(atom.id.as_str()));
        assert_eq!(gap.priority, GapPriority::Medium);
        assert_eq!(gap.search_terms[0], "Allen-Bradley PowerFlex 525 F012 reset");
        assert!(gap.needs_fill());
    }
}

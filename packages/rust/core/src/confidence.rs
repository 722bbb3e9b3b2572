//! Answer confidence scoring across five quality dimensions.
//!
//! Every dimension is a heuristic in `[0, 1]`; the overall score is their
//! weighted sum. Escalation is decided from the overall score and three
//! independent floors, so a fluent answer with a dangerous instruction is
//! escalated no matter how well it scores elsewhere.

use std::sync::LazyLock;

use regex::Regex;

use gapwise_shared::{
    ConfidenceAssessment, ConfidenceConfig, ConfidenceWeights, DimensionScores, EscalationReason,
    Intent, IntentCategory, Query, ScoredAtom, is_stop_word,
};

/// Score used for relevance when the query has no content terms.
const NEUTRAL_RELEVANCE: f64 = 0.5;
/// Accuracy penalty per citation that matches no used atom.
const UNRESOLVED_CITATION_PENALTY: f64 = 0.15;
/// Accuracy penalty per numeric or part-number claim absent from every source.
const UNSUPPORTED_CLAIM_PENALTY: f64 = 0.1;
const MAX_ACCURACY_PENALTY: f64 = 0.5;
const BASE_CLARITY: f64 = 0.7;

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

static CAUSE_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?i)\b(?:caus\w*|because|due to|reason|indicates|means)\b"));
static DIAGNOSTIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:check\w*|measur\w*|verif\w*|inspect\w*|test\w*|diagnos\w*|monitor\w*|read out)\b")
});
static RESOLUTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:replac\w*|reset\w*|fix\w*|resolv\w*|repair\w*|adjust\w*|tighten\w*|clear\w*|restart\w*|remed\w*|solution|correct\w*)\b")
});
static STEPS_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?im)(?:^\s*(?:\d+[.)]|[-*])\s+\S|\bstep\s*\d|\bfirst\b.*\bthen\b)"));
static PREREQ_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:tools?|need|requires?|required|prerequisites?|before|multimeter|wrench|screwdriver|software|cable|lockout|ppe)\b")
});
static VERIFY_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:verify|confirm|ensure|check that|test\w*|make sure)\b")
});
static NEXT_STEP_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:next|then|recommend\w*|should|refer to|see the|consult|follow|check|verify)\b")
});

static CLAIM_UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b\d+(?:\.\d+)?\s?(?:vac|vdc|kw|hp|hz|rpm|nm|ma|bar|psi|ms|v|a)\b|\b\d+(?:\.\d+)?\s?%")
});
static CLAIM_PART_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"\b[A-Z0-9]{2,}(?:-[A-Z0-9]+)+\b|\b[FEAL]\d{1,4}\b"));

static SAFETY_TOPIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:lockout|tagout|loto|e-?stops?|emergency stops?|interlocks?|arc flash|guards?|sil\s?\d?|safety|high voltage|energi[sz]ed)\b")
});
static SAFE_PRACTICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:lockout|tagout|lock out|tag out|loto|ppe|personal protective|isolat\w*|de-?energi[sz]\w*)\b")
});
static BYPASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:bypass\w*|defeat\w*|disabl\w*|overrid\w*|jumper\w*|short(?:ing)? out)\b[^.!?\n]{0,40}\b(?:interlocks?|e-?stops?|emergency stops?|guards?|light curtains?|safety (?:relays?|circuits?|switch\w*))\b")
});
static LIVE_WORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:work(?:ing)? on|touch\w*|open\w*|servic\w*|repair\w*|replac\w*)\b[^.!?\n]{0,40}\b(?:while (?:it is |it's )?(?:still )?(?:live|energi[sz]ed|running|powered)|live|energi[sz]ed)\b|\bwithout (?:lockout|locking (?:it )?out|de-?energi[sz]\w*|isolat\w*)")
});
static NEGATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:never|do not|don't|must not|mustn't|should not|shouldn't|not)\b")
});

static VAGUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:might|possibly|maybe|perhaps|check everything|it depends|not sure|could be anything)\b")
});
static CONTACT_SUPPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?i)\bcontact (?:support|the manufacturer|your vendor)\b"));
static NUMBERED_STEPS_RE: LazyLock<Regex> = LazyLock::new(|| re(r"(?m)^\s*\d+[.)]\s+\S"));
static IMPERATIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?m)(?:^|[.!?]\s+|^\s*\d+[.)]\s+)(?:Check|Verify|Replace|Reset|Measure|Inspect|Turn|Set|Disconnect|Remove|Install|Confirm|Open|Close|Press|Navigate|Ensure|Lock|Apply|Clear|Tighten|Cycle|Wait)\b")
});

/// Weighted sum of dimension scores.
pub fn overall(scores: &DimensionScores, weights: &ConfidenceWeights) -> f64 {
    weights.accuracy * scores.accuracy
        + weights.relevance * scores.relevance
        + weights.completeness * scores.completeness
        + weights.safety * scores.safety
        + weights.clarity * scores.clarity
}

/// Score one answer.
///
/// `citations` are the labels the specialist attached; each should name one
/// of `used_atoms` by id, title, or citation label.
pub fn score(
    query: &Query,
    intent: &Intent,
    response_text: &str,
    used_atoms: &[ScoredAtom],
    citations: &[String],
    config: &ConfidenceConfig,
) -> ConfidenceAssessment {
    let query_text = query.full_text();
    let mut warnings = Vec::new();

    let dangerous = is_dangerous(&query_text, false) || is_dangerous(response_text, true);
    if dangerous {
        warnings.push("dangerous procedure language detected".to_string());
    }

    let scores = DimensionScores {
        relevance: relevance(&query_text, intent, response_text),
        completeness: completeness(intent, response_text),
        accuracy: accuracy(&query_text, response_text, used_atoms, citations, &mut warnings),
        safety: safety(&query_text, intent, response_text, dangerous),
        clarity: clarity(response_text, &mut warnings),
    };
    let overall = overall(&scores, &config.weights);

    let mut reasons = Vec::new();
    if overall < config.escalation_threshold {
        reasons.push(EscalationReason::LowOverall);
    }
    if scores.safety < config.safety_floor {
        reasons.push(EscalationReason::SafetyFloor);
    }
    if scores.accuracy < config.accuracy_floor {
        reasons.push(EscalationReason::LowAccuracy);
    }
    if dangerous {
        reasons.push(EscalationReason::DangerousProcedure);
    }

    ConfidenceAssessment {
        scores,
        overall,
        escalate: !reasons.is_empty(),
        reasons,
        warnings,
    }
}

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

fn content_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '\'')) {
        let word = word.trim_matches(|c: char| c == '-' || c == '\'').to_lowercase();
        if word.len() < 2 || is_stop_word(&word) {
            continue;
        }
        if !terms.contains(&word) {
            terms.push(word);
        }
    }
    terms
}

/// Share of the query's content terms the answer mentions; fault codes count double.
fn relevance(query_text: &str, intent: &Intent, response: &str) -> f64 {
    let response = response.to_lowercase();
    let faults: Vec<String> = intent.fault_codes.iter().map(|f| f.to_lowercase()).collect();

    let mut total = 0.0;
    let mut matched = 0.0;
    for term in content_terms(query_text) {
        if faults.iter().any(|f| f.split_whitespace().any(|part| part == term)) {
            continue;
        }
        total += 1.0;
        if response.contains(&term) {
            matched += 1.0;
        }
    }
    for fault in &faults {
        total += 2.0;
        if response.contains(fault.as_str()) {
            matched += 2.0;
        }
    }

    if total == 0.0 {
        NEUTRAL_RELEVANCE
    } else {
        matched / total
    }
}

/// Share of the expected answer parts that are present.
fn completeness(intent: &Intent, response: &str) -> f64 {
    if response.trim().is_empty() {
        return 0.0;
    }
    let checks: Vec<bool> = if intent.category == IntentCategory::Troubleshooting
        || !intent.fault_codes.is_empty()
    {
        vec![
            CAUSE_RE.is_match(response),
            DIAGNOSTIC_RE.is_match(response),
            RESOLUTION_RE.is_match(response),
        ]
    } else if intent.category == IntentCategory::Procedure {
        vec![
            STEPS_RE.is_match(response),
            PREREQ_RE.is_match(response),
            VERIFY_RE.is_match(response),
        ]
    } else {
        vec![
            response.split_whitespace().count() >= 5,
            NEXT_STEP_RE.is_match(response),
        ]
    };
    checks.iter().filter(|present| **present).count() as f64 / checks.len() as f64
}

fn normalize_claim(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_lowercase()
}

/// 1.0 minus penalties for unresolved citations and unsupported claims.
fn accuracy(
    query_text: &str,
    response: &str,
    used_atoms: &[ScoredAtom],
    citations: &[String],
    warnings: &mut Vec<String>,
) -> f64 {
    let mut penalty = 0.0;

    for citation in citations {
        let label = citation.trim();
        let resolves = used_atoms.iter().any(|s| {
            let atom = &s.atom;
            label == atom.id
                || label.eq_ignore_ascii_case(atom.title.trim())
                || label == atom.citation()
                || atom.source_url.as_deref() == Some(label)
        });
        if !resolves {
            warnings.push(format!("citation '{label}' does not match a retrieved atom"));
            penalty += UNRESOLVED_CITATION_PENALTY;
        }
    }

    let mut sources = normalize_claim(query_text);
    for s in used_atoms {
        sources.push_str(&normalize_claim(&s.atom.title));
        sources.push_str(&normalize_claim(&s.atom.content));
    }
    let mut checked: Vec<String> = Vec::new();
    for m in CLAIM_UNIT_RE.find_iter(response).chain(CLAIM_PART_RE.find_iter(response)) {
        let claim = normalize_claim(m.as_str());
        if checked.contains(&claim) {
            continue;
        }
        if !sources.contains(&claim) {
            warnings.push(format!("claim '{}' is not supported by any retrieved atom", m.as_str()));
            penalty += UNSUPPORTED_CLAIM_PENALTY;
        }
        checked.push(claim);
    }

    1.0 - f64::min(penalty, MAX_ACCURACY_PENALTY)
}

/// Dangerous-procedure language. In answers, negated mentions ("never bypass
/// the interlock") are warnings, not instructions, and do not count.
pub fn is_dangerous(text: &str, skip_negated: bool) -> bool {
    BYPASS_RE
        .find_iter(text)
        .chain(LIVE_WORK_RE.find_iter(text))
        .any(|m| !(skip_negated && is_negated(text, m.start())))
}

fn is_negated(text: &str, start: usize) -> bool {
    let before = &text[..start];
    let sentence_start = before
        .rfind(|c: char| matches!(c, '.' | '!' | '?' | '\n'))
        .map_or(0, |i| i + 1);
    NEGATION_RE.is_match(&before[sentence_start..])
}

fn safety(query_text: &str, intent: &Intent, response: &str, dangerous: bool) -> f64 {
    if dangerous {
        return 0.0;
    }
    let relevant = intent.category == IntentCategory::Safety
        || SAFETY_TOPIC_RE.is_match(query_text)
        || SAFETY_TOPIC_RE.is_match(response);
    if !relevant {
        return 1.0;
    }
    if SAFE_PRACTICE_RE.is_match(response) {
        1.0
    } else {
        0.5
    }
}

fn clarity(response: &str, warnings: &mut Vec<String>) -> f64 {
    if response.trim().is_empty() {
        return 0.0;
    }
    let mut clarity = BASE_CLARITY;

    let vague = VAGUE_RE.find_iter(response).count();
    if vague > 0 {
        warnings.push(format!("{vague} vague phrase(s) in answer"));
        clarity -= 0.1 * vague as f64;
    }
    let has_steps = NUMBERED_STEPS_RE.is_match(response);
    if CONTACT_SUPPORT_RE.is_match(response) && !has_steps {
        clarity -= 0.2;
    }
    if has_steps {
        clarity += 0.2;
    }
    if IMPERATIVE_RE.is_match(response) {
        clarity += 0.1;
    }
    clarity.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gapwise_shared::{EquipmentType, KnowledgeUnit, Vendor};

    fn atom() -> ScoredAtom {
        ScoredAtom {
            atom: KnowledgeUnit::new(
                "S7-1200 F0003 undervoltage",
                "F0003 indicates undervoltage on the DC link. The supply dropped below 380 V. \
                 Check the mains supply voltage and reset the fault after restoring supply.",
                Vendor::Siemens,
                EquipmentType::Plc,
            ),
            score: 0.8,
        }
    }

    const GOOD_ANSWER: &str = "F0003 on the Siemens S7-1200 means DC link undervoltage.\n\
        Cause: the supply dropped below 380 V.\n\
        1. Check the mains supply voltage.\n\
        2. Reset the fault after restoring supply.";

    fn score_text(query: &str, answer: &str, atoms: &[ScoredAtom], citations: &[String]) -> ConfidenceAssessment {
        let query = Query::new(query);
        let intent = crate::classifier::extract(&query.text);
        score(&query, &intent, answer, atoms, citations, &ConfidenceConfig::default())
    }

    #[test]
    fn grounded_answer_is_not_escalated() {
        let atoms = vec![atom()];
        let citations = vec![atoms[0].atom.id.clone()];
        let assessment = score_text("Siemens S7-1200 fault F0003", GOOD_ANSWER, &atoms, &citations);

        assert_eq!(assessment.scores.relevance, 1.0);
        assert_eq!(assessment.scores.completeness, 1.0);
        assert_eq!(assessment.scores.accuracy, 1.0);
        assert_eq!(assessment.scores.safety, 1.0);
        assert!((assessment.scores.clarity - 1.0).abs() < 1e-9);
        assert!(!assessment.escalate, "reasons: {:?}", assessment.reasons);
    }

    #[test]
    fn unresolved_citations_and_claims_cost_accuracy() {
        let atoms = vec![atom()];
        let answer = format!("{GOOD_ANSWER}\nThe DC link is rated 560 V; replace module 6SL3040-1MA01-0AA0.");
        let citations = vec!["made-up-source".to_string()];
        let assessment = score_text("Siemens S7-1200 fault F0003", &answer, &atoms, &citations);

        // 0.15 for the citation, 0.1 for each unsupported claim.
        assert!((assessment.scores.accuracy - 0.65).abs() < 1e-9);
        assert_eq!(assessment.warnings.len(), 3);
    }

    #[test]
    fn accuracy_penalty_is_capped() {
        let citations: Vec<String> = (0..10).map(|i| format!("ghost-{i}")).collect();
        let assessment = score_text("Siemens S7-1200 fault F0003", GOOD_ANSWER, &[], &citations);
        assert!((assessment.scores.accuracy - 0.5).abs() < 1e-9);
        assert!(assessment.reasons.contains(&EscalationReason::LowAccuracy));
    }

    #[test]
    fn dangerous_query_always_escalates() {
        let answer = "1. Turn off the drive.\n2. Check the motor wiring.";
        let assessment = score_text("bypass the e-stop to test the motor", answer, &[], &[]);
        assert_eq!(assessment.scores.safety, 0.0);
        assert!(assessment.escalate);
        assert!(assessment.reasons.contains(&EscalationReason::DangerousProcedure));
        assert!(assessment.reasons.contains(&EscalationReason::SafetyFloor));
    }

    #[test]
    fn dangerous_answer_escalates_but_warnings_do_not() {
        let dangerous = "You can jumper out the guard interlock to keep the line running.";
        let assessment = score_text("conveyor guard switch keeps tripping", dangerous, &[], &[]);
        assert!(assessment.reasons.contains(&EscalationReason::DangerousProcedure));

        let warning = "Never bypass the guard interlock. Apply lockout/tagout, then inspect the switch.";
        assert!(!is_dangerous(warning, true));
        let assessment = score_text("conveyor guard switch keeps tripping", warning, &[], &[]);
        assert_eq!(assessment.scores.safety, 1.0);
    }

    #[test]
    fn working_live_is_dangerous() {
        assert!(is_dangerous("Can I replace the fuse while it's still energized?", false));
        assert!(is_dangerous("open the panel without lockout", false));
        assert!(!is_dangerous("Open the panel after lockout is applied.", false));
    }

    #[test]
    fn safety_topic_without_loto_scores_half() {
        let assessment = score_text("how do I reset the e-stop circuit", "Press the reset button.", &[], &[]);
        assert_eq!(assessment.scores.safety, 0.5);
        assert!(!assessment.reasons.contains(&EscalationReason::SafetyFloor));
    }

    #[test]
    fn vague_answers_lose_clarity() {
        let mut warnings = Vec::new();
        let vague = clarity("It might possibly be the drive. Contact support.", &mut warnings);
        assert!((vague - 0.3).abs() < 1e-9);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn empty_query_terms_are_neutral() {
        let intent = Intent::unknown();
        assert_eq!(relevance("the it is", &intent, "anything"), NEUTRAL_RELEVANCE);
    }

    #[test]
    fn weights_sum_to_one_and_overall_is_monotone() {
        let weights = ConfidenceWeights::default();
        assert!((weights.sum() - 1.0).abs() < 1e-6);

        let base = DimensionScores {
            relevance: 0.5,
            completeness: 0.5,
            accuracy: 0.5,
            safety: 0.5,
            clarity: 0.5,
        };
        let base_overall = overall(&base, &weights);
        assert!((base_overall - 0.5).abs() < 1e-9);

        let bumps: [fn(&mut DimensionScores); 5] = [
            |s| s.relevance += 0.1,
            |s| s.completeness += 0.1,
            |s| s.accuracy += 0.1,
            |s| s.safety += 0.1,
            |s| s.clarity += 0.1,
        ];
        for bump in bumps {
            let mut raised = base;
            bump(&mut raised);
            assert!(overall(&raised, &weights) > base_overall);
        }
    }
}

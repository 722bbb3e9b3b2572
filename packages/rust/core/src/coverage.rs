//! Coverage evaluation: how well the knowledge store covers a query.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use gapwise_shared::{
    CoverageConfig, CoverageLevel, CoverageResult, Intent, Query, Retriever, ScoredAtom,
    SearchFilters,
};

/// Reduce a scored atom list to a coverage level.
///
/// Atoms with a NaN score are discarded and the rest sorted by descending
/// score. `STRONG` needs `strong_min_atoms` atoms at or above
/// `relevance_floor`; one or more qualifying atoms, or a best score in
/// `[0, floor)`, is `THIN`; no scored atoms or a negative best score is `NONE`.
pub fn classify_coverage(mut atoms: Vec<ScoredAtom>, config: &CoverageConfig) -> CoverageResult {
    let before = atoms.len();
    atoms.retain(|a| !a.score.is_nan());
    if atoms.len() < before {
        warn!(discarded = before - atoms.len(), "retriever returned NaN scores");
    }
    atoms.sort_by(|a, b| b.score.total_cmp(&a.score));

    let best_score = atoms.first().map(|a| a.score);
    let qualifying = atoms
        .iter()
        .filter(|a| a.score >= config.relevance_floor)
        .count();

    let level = match best_score {
        None => CoverageLevel::None,
        Some(best) if best < 0.0 => CoverageLevel::None,
        Some(_) if qualifying >= config.strong_min_atoms => CoverageLevel::Strong,
        Some(_) => CoverageLevel::Thin,
    };

    CoverageResult {
        level,
        atoms,
        best_score,
        evaluated: true,
    }
}

/// Queries the retriever and classifies the result.
#[derive(Clone)]
pub struct CoverageEvaluator {
    retriever: Arc<dyn Retriever>,
}

impl CoverageEvaluator {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self { retriever }
    }

    /// Evaluate coverage for a classified query. Retrieval failures yield `NONE`.
    #[instrument(skip_all, fields(query_id = %query.id, vendor = %intent.vendor))]
    pub async fn evaluate(&self, intent: &Intent, query: &Query, config: &CoverageConfig) -> CoverageResult {
        let filters = SearchFilters::from_intent(intent);
        let atoms = match self
            .retriever
            .search(&query.full_text(), &filters, config.top_k)
            .await
        {
            Ok(atoms) => atoms,
            Err(e) => {
                warn!(error = %e, "retrieval failed, treating coverage as NONE");
                Vec::new()
            }
        };

        let result = classify_coverage(atoms, config);
        debug!(
            level = %result.level,
            atoms = result.atoms.len(),
            best_score = ?result.best_score,
            "coverage evaluated"
        );
        result
    }
}

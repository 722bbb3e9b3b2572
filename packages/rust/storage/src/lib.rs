//! libSQL knowledge store (local file mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding knowledge units
//! with FTS5 retrieval, feedback counters, research proposals, the gap audit
//! log, response traces, and research job history. It implements the
//! [`Retriever`], [`ExampleRetriever`], [`KnowledgeWriter`], and [`TraceSink`]
//! collaborator traits.
//!
//! **Access rules:**
//! - CLI / orchestrator: read-write via [`Storage::open`]
//! - Reporting tools: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gapwise_shared::{
    CoverageLevel, ExampleRetriever, FeedbackPolarity, FeedbackStats, GapwiseError, InsertOutcome,
    KnowledgeGap, KnowledgeUnit, KnowledgeWriter, PastCase, ProposalStatus, ProposedUnit, Query,
    ResearchJob, Result, Retriever, ScoredAtom, SearchFilters, TraceRecord, TraceSink,
    ValidationStatus, is_stop_word,
};
use libsql::{Connection, Database, params};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn db_err(e: libsql::Error) -> GapwiseError {
    GapwiseError::Storage(e.to_string())
}

fn json_err(e: serde_json::Error) -> GapwiseError {
    GapwiseError::Storage(format!("invalid stored json: {e}"))
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GapwiseError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path).build().await.map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path).build().await.map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    GapwiseError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(GapwiseError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Atom operations
    // -----------------------------------------------------------------------

    /// Insert an atom. A content-hash collision is reported as a duplicate.
    pub async fn insert_atom(&self, atom: &KnowledgeUnit) -> Result<InsertOutcome> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "INSERT INTO atoms (id, title, content, vendor, equipment, source_url, validation,
                                    success_count, failure_count, content_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(content_hash) DO NOTHING",
                params![
                    atom.id.as_str(),
                    atom.title.as_str(),
                    atom.content.as_str(),
                    atom.vendor.as_str(),
                    atom.equipment.as_str(),
                    atom.source_url.as_deref(),
                    atom.validation.as_str(),
                    i64::from(atom.success_count),
                    i64::from(atom.failure_count),
                    atom.content_hash.as_str(),
                    atom.created_at.to_rfc3339(),
                    atom.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;

        if affected == 0 {
            tracing::debug!(atom_id = %atom.id, hash = %atom.content_hash, "duplicate atom skipped");
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    /// Get an atom by id.
    pub async fn get_atom(&self, id: &str) -> Result<Option<KnowledgeUnit>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ATOM_COLUMNS} FROM atoms WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_atom(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List atoms, newest first.
    pub async fn list_atoms(&self, limit: u32) -> Result<Vec<KnowledgeUnit>> {
        let rows = self
            .conn
            .query(
                &format!("SELECT {ATOM_COLUMNS} FROM atoms ORDER BY created_at DESC LIMIT ?1"),
                params![limit],
            )
            .await
            .map_err(db_err)?;

        collect_rows(rows, row_to_atom).await
    }

    /// Number of stored atoms.
    pub async fn count_atoms(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM atoms", params![])
            .await
            .map_err(db_err)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(db_err)? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Full-text search over atoms with vendor/equipment filters.
    ///
    /// BM25 ranks (lower is better, usually negative) are mapped to a score
    /// in `[0, 1)` via `r / (1 + r)` with `r = -bm25`. Deprecated atoms are
    /// never returned.
    pub async fn search_atoms(
        &self,
        text: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredAtom>> {
        let Some(fts_query) = build_fts_query(text) else {
            return Ok(Vec::new());
        };

        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ATOM_COLUMNS_PREFIXED}, bm25(atoms_fts) AS bm25_rank
                     FROM atoms_fts fts
                     JOIN atoms a ON a.rowid = fts.rowid
                     WHERE atoms_fts MATCH ?1
                       AND a.validation != 'deprecated'
                       AND (?2 IS NULL OR a.vendor = ?2 OR a.vendor = 'generic')
                       AND (?3 IS NULL OR a.equipment = ?3 OR a.equipment = 'unknown')
                     ORDER BY bm25_rank
                     LIMIT ?4"
                ),
                params![
                    fts_query.as_str(),
                    filters.vendor.map(|v| v.as_str()),
                    filters.equipment.map(|e| e.as_str()),
                    limit as i64,
                ],
            )
            .await
            .map_err(db_err)?;

        collect_rows(rows, |row| {
            let atom = row_to_atom(row)?;
            let rank: f64 = row.get(ATOM_COLUMN_COUNT).map_err(db_err)?;
            let relevance = -rank;
            let score = if relevance >= 0.0 {
                relevance / (1.0 + relevance)
            } else {
                relevance
            };
            Ok(ScoredAtom { atom, score })
        })
        .await
    }

    /// Mark an atom deprecated so retrieval skips it.
    pub async fn deprecate_atom(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "UPDATE atoms SET validation = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    ValidationStatus::Deprecated.as_str(),
                    Utc::now().to_rfc3339(),
                    id
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------------

    /// Increment an atom's success or failure counter and, when the
    /// threshold is crossed, set the low-satisfaction flag.
    ///
    /// The flag is set with a conditional `UPDATE ... WHERE flagged = 0`, so
    /// exactly one event observes `newly_flagged = true` until the flag is
    /// reset.
    pub async fn record_feedback(
        &self,
        atom_id: &str,
        polarity: FeedbackPolarity,
        min_samples: u32,
        success_floor: f64,
    ) -> Result<FeedbackStats> {
        self.check_writable()?;
        let column = match polarity {
            FeedbackPolarity::Positive => "success_count",
            FeedbackPolarity::Negative => "failure_count",
        };
        let affected = self
            .conn
            .execute(
                &format!(
                    "UPDATE atoms SET {column} = {column} + 1, updated_at = ?1 WHERE id = ?2"
                ),
                params![Utc::now().to_rfc3339(), atom_id],
            )
            .await
            .map_err(db_err)?;
        if affected == 0 {
            return Err(GapwiseError::validation(format!("unknown atom '{atom_id}'")));
        }

        let flagged = self
            .conn
            .execute(
                "UPDATE atoms SET low_satisfaction_flagged = 1
                 WHERE id = ?1
                   AND low_satisfaction_flagged = 0
                   AND success_count + failure_count >= ?2
                   AND CAST(success_count AS REAL) / (success_count + failure_count) < ?3",
                params![atom_id, i64::from(min_samples), success_floor],
            )
            .await
            .map_err(db_err)?;

        let mut rows = self
            .conn
            .query(
                "SELECT success_count, failure_count FROM atoms WHERE id = ?1",
                params![atom_id],
            )
            .await
            .map_err(db_err)?;
        let (success_count, failure_count) = match rows.next().await {
            Ok(Some(row)) => (
                row.get::<u32>(0).map_err(db_err)?,
                row.get::<u32>(1).map_err(db_err)?,
            ),
            Ok(None) => return Err(GapwiseError::validation(format!("unknown atom '{atom_id}'"))),
            Err(e) => return Err(db_err(e)),
        };

        Ok(FeedbackStats {
            atom_id: atom_id.to_string(),
            success_count,
            failure_count,
            newly_flagged: flagged > 0,
        })
    }

    /// Clear the low-satisfaction flag.
    pub async fn reset_feedback_flag(&self, atom_id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE atoms SET low_satisfaction_flagged = 0 WHERE id = ?1",
                params![atom_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Proposal operations
    // -----------------------------------------------------------------------

    /// Insert or replace a proposal.
    pub async fn store_proposal(&self, proposal: &ProposedUnit) -> Result<()> {
        self.check_writable()?;
        let atom_json = serde_json::to_string(&proposal.unit).map_err(json_err)?;
        self.conn
            .execute(
                "INSERT INTO proposals (id, gap_id, task_id, atom_json, confidence, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   atom_json = excluded.atom_json,
                   confidence = excluded.confidence,
                   status = excluded.status",
                params![
                    proposal.id.as_str(),
                    proposal.gap_id.as_str(),
                    proposal.task_id.as_str(),
                    atom_json,
                    proposal.confidence,
                    proposal.status.as_str(),
                    proposal.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get a proposal by id.
    pub async fn get_proposal(&self, id: &str) -> Result<Option<ProposedUnit>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, gap_id, task_id, atom_json, confidence, status, created_at
                 FROM proposals WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_proposal(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List proposals, optionally restricted to one status, oldest first.
    pub async fn list_proposals(&self, status: Option<ProposalStatus>) -> Result<Vec<ProposedUnit>> {
        let rows = self
            .conn
            .query(
                "SELECT id, gap_id, task_id, atom_json, confidence, status, created_at
                 FROM proposals WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at",
                params![status.map(|s| s.as_str())],
            )
            .await
            .map_err(db_err)?;

        collect_rows(rows, row_to_proposal).await
    }

    /// Approve a pending proposal: insert its atom as validated and mark the
    /// proposal inserted. Returns the insert outcome.
    pub async fn approve_proposal(&self, id: &str) -> Result<InsertOutcome> {
        self.check_writable()?;
        let proposal = self
            .get_proposal(id)
            .await?
            .ok_or_else(|| GapwiseError::validation(format!("unknown proposal '{id}'")))?;
        if proposal.status != ProposalStatus::Pending {
            return Err(GapwiseError::validation(format!(
                "proposal '{id}' is {}, not pending",
                proposal.status.as_str()
            )));
        }

        let atom = proposal.unit.with_validation(ValidationStatus::Validated);
        let outcome = self.insert_atom(&atom).await?;
        self.set_proposal_status(id, ProposalStatus::Inserted).await?;
        tracing::info!(proposal_id = id, atom_id = %atom.id, ?outcome, "proposal approved");
        Ok(outcome)
    }

    /// Reject a pending proposal.
    pub async fn reject_proposal(&self, id: &str) -> Result<()> {
        let affected = self.set_proposal_status(id, ProposalStatus::Rejected).await?;
        if affected == 0 {
            return Err(GapwiseError::validation(format!("unknown proposal '{id}'")));
        }
        Ok(())
    }

    async fn set_proposal_status(&self, id: &str, status: ProposalStatus) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE proposals SET status = ?1, decided_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id],
            )
            .await
            .map_err(db_err)
    }

    // -----------------------------------------------------------------------
    // Gap audit log
    // -----------------------------------------------------------------------

    /// Append a detected gap.
    pub async fn record_gap(&self, gap: &KnowledgeGap) -> Result<()> {
        self.check_writable()?;
        let entities = serde_json::to_string(&gap.entities).map_err(json_err)?;
        let terms = serde_json::to_string(&gap.search_terms).map_err(json_err)?;
        let sources = serde_json::to_string(&gap.sources).map_err(json_err)?;
        self.conn
            .execute(
                "INSERT INTO gaps (id, query_text, gap_type, priority, coverage_level,
                                   entities_json, search_terms_json, sources_json, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    gap.id.as_str(),
                    gap.query_text.as_str(),
                    gap.gap_type.as_str(),
                    gap.priority.as_str(),
                    gap.coverage_level.as_str(),
                    entities,
                    terms,
                    sources,
                    gap.detected_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Most recent gaps, newest first.
    pub async fn list_gaps(&self, limit: u32) -> Result<Vec<KnowledgeGap>> {
        let rows = self
            .conn
            .query(
                "SELECT id, query_text, gap_type, priority, coverage_level,
                        entities_json, search_terms_json, sources_json, detected_at
                 FROM gaps ORDER BY detected_at DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(db_err)?;

        collect_rows(rows, row_to_gap).await
    }

    // -----------------------------------------------------------------------
    // Research jobs
    // -----------------------------------------------------------------------

    /// Insert a research job or update it with completion data.
    pub async fn record_research_job(&self, job: &ResearchJob) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO research_jobs (task_id, gap_id, priority, started_at, finished_at, backend,
                                            succeeded, findings, inserted, cost_usd, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(task_id) DO UPDATE SET
                   finished_at = excluded.finished_at,
                   backend = excluded.backend,
                   succeeded = excluded.succeeded,
                   findings = excluded.findings,
                   inserted = excluded.inserted,
                   cost_usd = excluded.cost_usd,
                   error = excluded.error",
                params![
                    job.task_id.as_str(),
                    job.gap_id.as_str(),
                    job.priority.as_str(),
                    job.started_at.to_rfc3339(),
                    job.finished_at.map(|t| t.to_rfc3339()),
                    job.backend.as_deref(),
                    i64::from(job.succeeded),
                    job.findings as i64,
                    job.inserted as i64,
                    job.cost_usd,
                    job.error.as_deref(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get a research job by task id.
    pub async fn get_research_job(&self, task_id: &str) -> Result<Option<ResearchJob>> {
        let mut rows = self
            .conn
            .query(
                "SELECT task_id, gap_id, priority, started_at, finished_at, backend,
                        succeeded, findings, inserted, cost_usd, error
                 FROM research_jobs WHERE task_id = ?1",
                params![task_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(ResearchJob {
                task_id: row.get::<String>(0).map_err(db_err)?,
                gap_id: row.get::<String>(1).map_err(db_err)?,
                priority: row.get::<String>(2).map_err(db_err)?.parse()?,
                started_at: parse_timestamp(&row.get::<String>(3).map_err(db_err)?)?,
                finished_at: match row.get::<String>(4).ok() {
                    Some(s) => Some(parse_timestamp(&s)?),
                    None => None,
                },
                backend: row.get::<String>(5).ok(),
                succeeded: row.get::<i64>(6).map_err(db_err)? != 0,
                findings: row.get::<i64>(7).map_err(db_err)? as usize,
                inserted: row.get::<i64>(8).map_err(db_err)? as usize,
                cost_usd: row.get::<f64>(9).map_err(db_err)?,
                error: row.get::<String>(10).ok(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Traces
    // -----------------------------------------------------------------------

    /// Append a response trace.
    pub async fn append_trace(&self, record: &TraceRecord) -> Result<()> {
        self.check_writable()?;
        let atom_ids = serde_json::to_string(&record.atom_ids).map_err(json_err)?;
        self.conn
            .execute(
                "INSERT INTO traces (query_id, query_text, answer_excerpt, route, specialist,
                                     atom_count, atom_ids_json, latency_ms, tokens_used, cost_usd,
                                     research_triggered, escalated, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.query_id.to_string(),
                    record.query_text.as_str(),
                    record.answer_excerpt.as_str(),
                    record.route.as_str(),
                    record.specialist.as_str(),
                    record.atom_count as i64,
                    atom_ids,
                    record.latency_ms as i64,
                    record.tokens_used as i64,
                    record.cost_usd,
                    i64::from(record.research_triggered),
                    i64::from(record.escalated),
                    record.recorded_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Number of stored traces.
    pub async fn count_traces(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM traces", params![])
            .await
            .map_err(db_err)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(db_err)? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Past non-escalated, answered queries similar to `text`.
    pub async fn similar_cases(&self, text: &str, limit: usize) -> Result<Vec<PastCase>> {
        let Some(fts_query) = build_fts_query(text) else {
            return Ok(Vec::new());
        };

        let rows = self
            .conn
            .query(
                "SELECT t.query_text, t.answer_excerpt, t.route
                 FROM traces_fts fts
                 JOIN traces t ON t.id = fts.rowid
                 WHERE traces_fts MATCH ?1
                   AND t.escalated = 0
                   AND t.route != 'D_UNCLEAR'
                 ORDER BY rank
                 LIMIT ?2",
                params![fts_query.as_str(), limit as i64],
            )
            .await
            .map_err(db_err)?;

        collect_rows(rows, |row| {
            Ok(PastCase {
                query_text: row.get::<String>(0).map_err(db_err)?,
                answer_excerpt: row.get::<String>(1).map_err(db_err)?,
                route: row.get::<String>(2).map_err(db_err)?.parse()?,
            })
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Collaborator trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl Retriever for Storage {
    async fn search(
        &self,
        text: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredAtom>> {
        self.search_atoms(text, filters, limit).await
    }
}

#[async_trait]
impl ExampleRetriever for Storage {
    async fn similar_cases(&self, query: &Query, limit: usize) -> Result<Vec<PastCase>> {
        Storage::similar_cases(self, &query.text, limit).await
    }
}

#[async_trait]
impl KnowledgeWriter for Storage {
    async fn insert_atom(&self, atom: &KnowledgeUnit) -> Result<InsertOutcome> {
        Storage::insert_atom(self, atom).await
    }

    async fn get_atom(&self, id: &str) -> Result<Option<KnowledgeUnit>> {
        Storage::get_atom(self, id).await
    }

    async fn store_proposal(&self, proposal: &ProposedUnit) -> Result<()> {
        Storage::store_proposal(self, proposal).await
    }

    async fn record_gap(&self, gap: &KnowledgeGap) -> Result<()> {
        Storage::record_gap(self, gap).await
    }

    async fn record_research_job(&self, job: &ResearchJob) -> Result<()> {
        Storage::record_research_job(self, job).await
    }

    async fn record_feedback(
        &self,
        atom_id: &str,
        polarity: FeedbackPolarity,
        min_samples: u32,
        success_floor: f64,
    ) -> Result<FeedbackStats> {
        Storage::record_feedback(self, atom_id, polarity, min_samples, success_floor).await
    }

    async fn reset_feedback_flag(&self, atom_id: &str) -> Result<()> {
        Storage::reset_feedback_flag(self, atom_id).await
    }
}

#[async_trait]
impl TraceSink for Storage {
    async fn append(&self, record: &TraceRecord) -> Result<()> {
        self.append_trace(record).await
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const ATOM_COLUMNS: &str = "id, title, content, vendor, equipment, source_url, validation, \
                            success_count, failure_count, content_hash, created_at, updated_at";

const ATOM_COLUMNS_PREFIXED: &str = "a.id, a.title, a.content, a.vendor, a.equipment, \
                                     a.source_url, a.validation, a.success_count, \
                                     a.failure_count, a.content_hash, a.created_at, a.updated_at";

const ATOM_COLUMN_COUNT: i32 = 12;

/// Build an FTS5 MATCH expression: quoted alphanumeric tokens joined by OR.
/// Stop words are left out so a shared "to" or "the" never makes an atom match.
/// Returns `None` when the text has no searchable tokens.
fn build_fts_query(text: &str) -> Option<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
    {
        let token = token.to_lowercase();
        if is_stop_word(&token) {
            continue;
        }
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// Map every row, stopping at the first row or mapping error.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    mut map: impl FnMut(&libsql::Row) -> Result<T>,
) -> Result<Vec<T>> {
    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        results.push(map(&row)?);
    }
    Ok(results)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GapwiseError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row (in `ATOM_COLUMNS` order) to a [`KnowledgeUnit`].
fn row_to_atom(row: &libsql::Row) -> Result<KnowledgeUnit> {
    Ok(KnowledgeUnit {
        id: row.get::<String>(0).map_err(db_err)?,
        title: row.get::<String>(1).map_err(db_err)?,
        content: row.get::<String>(2).map_err(db_err)?,
        vendor: row.get::<String>(3).map_err(db_err)?.parse()?,
        equipment: row.get::<String>(4).map_err(db_err)?.parse()?,
        source_url: row.get::<String>(5).ok(),
        validation: row.get::<String>(6).map_err(db_err)?.parse()?,
        success_count: row.get::<u32>(7).map_err(db_err)?,
        failure_count: row.get::<u32>(8).map_err(db_err)?,
        content_hash: row.get::<String>(9).map_err(db_err)?,
        created_at: parse_timestamp(&row.get::<String>(10).map_err(db_err)?)?,
        updated_at: parse_timestamp(&row.get::<String>(11).map_err(db_err)?)?,
    })
}

fn row_to_proposal(row: &libsql::Row) -> Result<ProposedUnit> {
    let atom_json: String = row.get(3).map_err(db_err)?;
    Ok(ProposedUnit {
        id: row.get::<String>(0).map_err(db_err)?,
        gap_id: row.get::<String>(1).map_err(db_err)?,
        task_id: row.get::<String>(2).map_err(db_err)?,
        unit: serde_json::from_str(&atom_json).map_err(json_err)?,
        confidence: row.get::<f64>(4).map_err(db_err)?,
        status: row.get::<String>(5).map_err(db_err)?.parse()?,
        created_at: parse_timestamp(&row.get::<String>(6).map_err(db_err)?)?,
    })
}

fn row_to_gap(row: &libsql::Row) -> Result<KnowledgeGap> {
    let coverage_level = match row.get::<String>(4).map_err(db_err)?.as_str() {
        "STRONG" => CoverageLevel::Strong,
        "THIN" => CoverageLevel::Thin,
        _ => CoverageLevel::None,
    };
    Ok(KnowledgeGap {
        id: row.get::<String>(0).map_err(db_err)?,
        query_text: row.get::<String>(1).map_err(db_err)?,
        gap_type: row.get::<String>(2).map_err(db_err)?.parse()?,
        priority: row.get::<String>(3).map_err(db_err)?.parse()?,
        coverage_level,
        entities: serde_json::from_str(&row.get::<String>(5).map_err(db_err)?).map_err(json_err)?,
        search_terms: serde_json::from_str(&row.get::<String>(6).map_err(db_err)?)
            .map_err(json_err)?,
        sources: serde_json::from_str(&row.get::<String>(7).map_err(db_err)?).map_err(json_err)?,
        detected_at: parse_timestamp(&row.get::<String>(8).map_err(db_err)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gapwise_shared::{
        EquipmentType, GapEntities, GapPriority, GapType, QueryId, ResearchSource, Route,
        SourceKind, SpecialistId, Vendor,
    };
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("gw_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn atom(title: &str, content: &str, vendor: Vendor) -> KnowledgeUnit {
        KnowledgeUnit::new(title, content, vendor, EquipmentType::Drive)
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("gw_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn atom_insert_and_duplicate() {
        let storage = test_storage().await;
        let a = atom("F0003 undervoltage", "DC link voltage dropped below threshold.", Vendor::Siemens)
            .with_source("https://support.industry.siemens.com/f0003");

        assert_eq!(storage.insert_atom(&a).await.unwrap(), InsertOutcome::Inserted);

        // Same content under a new id collides on the content hash
        let again = atom("F0003 undervoltage", "DC link voltage dropped below threshold.", Vendor::Siemens);
        assert_eq!(storage.insert_atom(&again).await.unwrap(), InsertOutcome::Duplicate);
        assert_eq!(storage.count_atoms().await.unwrap(), 1);

        let found = storage.get_atom(&a.id).await.unwrap().expect("atom exists");
        assert_eq!(found.title, a.title);
        assert_eq!(found.vendor, Vendor::Siemens);
        assert_eq!(found.source_url.as_deref(), Some("https://support.industry.siemens.com/f0003"));
        assert!(storage.get_atom(&again.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_ranks_and_filters_by_vendor() {
        let storage = test_storage().await;
        for (title, content, vendor) in [
            ("F0003 undervoltage", "Siemens drive fault F0003: check supply voltage.", Vendor::Siemens),
            ("F0003 on PowerFlex", "Unrelated vendor text mentioning F0003.", Vendor::Rockwell),
            ("Undervoltage basics", "Generic guidance on undervoltage trips.", Vendor::Generic),
            ("Conveyor belt tracking", "Adjust the idler rollers.", Vendor::Siemens),
            ("Servo tuning", "Lower the position loop gain.", Vendor::Siemens),
            ("HMI backlight", "Replace the backlight inverter.", Vendor::Generic),
        ] {
            storage.insert_atom(&atom(title, content, vendor)).await.unwrap();
        }

        let filters = SearchFilters {
            vendor: Some(Vendor::Siemens),
            equipment: None,
        };
        let results = storage.search_atoms("F0003 undervoltage", &filters, 10).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.atom.vendor != Vendor::Rockwell));
        assert_eq!(results[0].atom.title, "F0003 undervoltage");
        assert!(results.iter().all(|r| r.score < 1.0));

        let unfiltered = storage
            .search_atoms("F0003", &SearchFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(unfiltered.len(), 2);
    }

    #[tokio::test]
    async fn search_skips_deprecated_and_empty_queries() {
        let storage = test_storage().await;
        let a = atom("Encoder alarm", "Replace the encoder cable.", Vendor::Fanuc);
        storage.insert_atom(&a).await.unwrap();
        assert!(storage.deprecate_atom(&a.id).await.unwrap());

        let results = storage
            .search_atoms("encoder", &SearchFilters::default(), 10)
            .await
            .unwrap();
        assert!(results.is_empty());

        let results = storage.search_atoms("?? !", &SearchFilters::default(), 10).await.unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn fts_query_quotes_tokens() {
        assert_eq!(
            build_fts_query("S7-1200 fault \"F0003\"").as_deref(),
            Some("\"s7\" OR \"1200\" OR \"fault\" OR \"f0003\"")
        );
        assert_eq!(build_fts_query("a ! ?"), None);
        assert_eq!(
            build_fts_query("how do I wire the PLC to the network").as_deref(),
            Some("\"wire\" OR \"plc\" OR \"network\"")
        );
        assert_eq!(build_fts_query("what is it for"), None);
    }

    #[tokio::test]
    async fn row_errors_are_reported_not_truncated() {
        let storage = test_storage().await;
        // abs() of i64::MIN fails while stepping, after the statement prepared.
        let result = match storage
            .conn
            .query("SELECT abs(-9223372036854775807 - 1)", params![])
            .await
        {
            Ok(rows) => collect_rows(rows, |row| row.get::<i64>(0).map_err(db_err)).await,
            Err(e) => Err(db_err(e)),
        };
        assert!(matches!(result, Err(GapwiseError::Storage(_))));
    }

    #[tokio::test]
    async fn unrelated_atoms_do_not_match_on_stop_words() {
        let storage = test_storage().await;
        for (title, content) in [
            ("Belt tension", "Adjust the belt to the specified deflection."),
            ("Fan balance", "Add weights to the fan hub until vibration drops."),
            ("Compressor oil", "Top up the oil to the sight glass mark."),
            ("Bearing grease", "Grease bearings every 500 hours."),
            ("Pump seal", "Replace a leaking mechanical seal."),
            ("Valve stroke", "Stroke the valve and note travel time."),
            ("Gearbox breather", "Clean the breather cap."),
            ("Chain slack", "Measure slack at mid span."),
            ("Filter change", "Swap the air filter element."),
            ("Coupling alignment", "Align the coupling with a dial indicator."),
        ] {
            let unit = KnowledgeUnit::new(title, content, Vendor::Generic, EquipmentType::Unknown);
            storage.insert_atom(&unit).await.unwrap();
        }

        let filters = SearchFilters {
            vendor: Some(Vendor::Siemens),
            equipment: Some(EquipmentType::Plc),
        };
        let results = storage
            .search_atoms("how do I wire the Siemens S7-1200 to the network", &filters, 10)
            .await
            .unwrap();
        let titles: Vec<&str> = results.iter().map(|r| r.atom.title.as_str()).collect();
        assert!(titles.is_empty(), "unexpected matches: {titles:?}");
    }

    #[tokio::test]
    async fn feedback_flags_exactly_once_until_reset() {
        let storage = test_storage().await;
        let a = atom("Reset procedure", "Power cycle the drive.", Vendor::Abb);
        storage.insert_atom(&a).await.unwrap();

        let mut flags = Vec::new();
        for _ in 0..4 {
            let stats = storage
                .record_feedback(&a.id, FeedbackPolarity::Negative, 3, 0.30)
                .await
                .unwrap();
            flags.push(stats.newly_flagged);
        }
        assert_eq!(flags, vec![false, false, true, false]);

        storage.reset_feedback_flag(&a.id).await.unwrap();
        let stats = storage
            .record_feedback(&a.id, FeedbackPolarity::Negative, 3, 0.30)
            .await
            .unwrap();
        assert!(stats.newly_flagged);
        assert_eq!(stats.failure_count, 5);
        assert_eq!(stats.success_count, 0);
    }

    #[tokio::test]
    async fn feedback_on_unknown_atom_errors() {
        let storage = test_storage().await;
        let result = storage
            .record_feedback("missing", FeedbackPolarity::Positive, 3, 0.3)
            .await;
        assert!(result.unwrap_err().to_string().contains("unknown atom"));
    }

    #[tokio::test]
    async fn proposal_lifecycle() {
        let storage = test_storage().await;
        let proposal = ProposedUnit {
            id: Uuid::now_v7().to_string(),
            gap_id: "gap-1".into(),
            task_id: "task-1".into(),
            unit: atom("ACS880 F0003", "Check the DC bus.", Vendor::Abb),
            confidence: 0.72,
            status: ProposalStatus::Pending,
            created_at: Utc::now(),
        };
        storage.store_proposal(&proposal).await.unwrap();

        let pending = storage.list_proposals(Some(ProposalStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].unit.title, "ACS880 F0003");

        let outcome = storage.approve_proposal(&proposal.id).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
        let stored = storage.get_atom(&proposal.unit.id).await.unwrap().unwrap();
        assert_eq!(stored.validation, ValidationStatus::Validated);

        // Approving twice is rejected
        assert!(storage.approve_proposal(&proposal.id).await.is_err());
        assert!(storage.list_proposals(Some(ProposalStatus::Pending)).await.unwrap().is_empty());
        assert!(storage.reject_proposal("nope").await.is_err());
    }

    #[tokio::test]
    async fn gap_audit_roundtrip() {
        let storage = test_storage().await;
        let gap = KnowledgeGap {
            id: KnowledgeGap::new_id(),
            query_text: "XYZ-brand widget error 42".into(),
            gap_type: GapType::UnknownManufacturer,
            entities: GapEntities {
                vendor: Vendor::Unknown,
                unrecognized_manufacturer: Some("XYZ".into()),
                equipment: EquipmentType::Unknown,
                model_numbers: Vec::new(),
                fault_codes: vec!["42".into()],
                atom_id: None,
            },
            priority: GapPriority::High,
            search_terms: vec!["XYZ error 42".into()],
            sources: vec![ResearchSource {
                kind: SourceKind::ManualsAggregator,
                domain: None,
            }],
            coverage_level: CoverageLevel::None,
            detected_at: Utc::now(),
        };
        storage.record_gap(&gap).await.unwrap();
        // Re-recording the same gap is a no-op
        storage.record_gap(&gap).await.unwrap();

        let gaps = storage.list_gaps(10).await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0], gap);
    }

    #[tokio::test]
    async fn research_job_upsert() {
        let storage = test_storage().await;
        let mut job = ResearchJob {
            task_id: "task-9".into(),
            gap_id: "gap-9".into(),
            priority: GapPriority::Critical,
            started_at: Utc::now(),
            finished_at: None,
            backend: None,
            succeeded: false,
            findings: 0,
            inserted: 0,
            cost_usd: 0.0,
            error: None,
        };
        storage.record_research_job(&job).await.unwrap();

        job.finished_at = Some(Utc::now());
        job.backend = Some("web-docs".into());
        job.succeeded = true;
        job.findings = 4;
        job.inserted = 3;
        storage.record_research_job(&job).await.unwrap();

        let stored = storage.get_research_job("task-9").await.unwrap().unwrap();
        assert!(stored.succeeded);
        assert_eq!(stored.findings, 4);
        assert_eq!(stored.backend.as_deref(), Some("web-docs"));
        assert_eq!(stored.priority, GapPriority::Critical);
    }

    fn trace(text: &str, route: Route, escalated: bool) -> TraceRecord {
        TraceRecord {
            query_id: QueryId::new(),
            query_text: text.into(),
            answer_excerpt: "Check the DC link.".into(),
            route,
            specialist: SpecialistId::Siemens,
            atom_count: 1,
            atom_ids: vec!["a1".into()],
            latency_ms: 120,
            tokens_used: 300,
            cost_usd: 0.0006,
            research_triggered: false,
            escalated,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn traces_feed_similar_cases() {
        let storage = test_storage().await;
        storage.append_trace(&trace("S7-1200 fault F0003", Route::AStrong, false)).await.unwrap();
        storage.append_trace(&trace("F0003 again please", Route::AStrong, true)).await.unwrap();
        storage.append_trace(&trace("F0003 help", Route::DUnclear, false)).await.unwrap();
        assert_eq!(storage.count_traces().await.unwrap(), 3);

        let cases = Storage::similar_cases(&storage, "what does F0003 mean", 5).await.unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].query_text, "S7-1200 fault F0003");
        assert_eq!(cases[0].route, Route::AStrong);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("gw_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.insert_atom(&atom("t", "c", Vendor::Generic)).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.insert_atom(&atom("t2", "c2", Vendor::Generic)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}

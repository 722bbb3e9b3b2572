//! SQL migration definitions for the Gapwise knowledge store.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: atoms, proposals, gaps, traces, research_jobs, FTS5",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Knowledge units. content_hash is the optimistic-concurrency key:
-- concurrent writers of the same unit collide here instead of duplicating.
CREATE TABLE IF NOT EXISTS atoms (
    id            TEXT PRIMARY KEY,
    title         TEXT NOT NULL,
    content       TEXT NOT NULL,
    vendor        TEXT NOT NULL,
    equipment     TEXT NOT NULL,
    source_url    TEXT,
    validation    TEXT NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    content_hash  TEXT NOT NULL UNIQUE,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_atoms_vendor ON atoms(vendor);

-- Research-produced candidate atoms awaiting review
CREATE TABLE IF NOT EXISTS proposals (
    id         TEXT PRIMARY KEY,
    gap_id     TEXT NOT NULL,
    task_id    TEXT NOT NULL,
    atom_json  TEXT NOT NULL,
    confidence REAL NOT NULL,
    status     TEXT NOT NULL,
    created_at TEXT NOT NULL,
    decided_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status);

-- Gap audit log
CREATE TABLE IF NOT EXISTS gaps (
    id                TEXT PRIMARY KEY,
    query_text        TEXT NOT NULL,
    gap_type          TEXT NOT NULL,
    priority          TEXT NOT NULL,
    coverage_level    TEXT NOT NULL,
    entities_json     TEXT NOT NULL,
    search_terms_json TEXT NOT NULL,
    sources_json      TEXT NOT NULL,
    detected_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_gaps_detected ON gaps(detected_at);

-- Append-only response traces
CREATE TABLE IF NOT EXISTS traces (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    query_id           TEXT NOT NULL,
    query_text         TEXT NOT NULL,
    answer_excerpt     TEXT NOT NULL,
    route              TEXT NOT NULL,
    specialist         TEXT NOT NULL,
    atom_count         INTEGER NOT NULL,
    atom_ids_json      TEXT NOT NULL,
    latency_ms         INTEGER NOT NULL,
    tokens_used        INTEGER NOT NULL,
    cost_usd           REAL NOT NULL,
    research_triggered INTEGER NOT NULL,
    escalated          INTEGER NOT NULL,
    recorded_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_traces_query_id ON traces(query_id);

-- Research job history
CREATE TABLE IF NOT EXISTS research_jobs (
    task_id     TEXT PRIMARY KEY,
    gap_id      TEXT NOT NULL,
    priority    TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    backend     TEXT,
    succeeded   INTEGER NOT NULL DEFAULT 0,
    findings    INTEGER NOT NULL DEFAULT 0,
    inserted    INTEGER NOT NULL DEFAULT 0,
    cost_usd    REAL NOT NULL DEFAULT 0,
    error       TEXT
);

CREATE INDEX IF NOT EXISTS idx_research_jobs_gap ON research_jobs(gap_id);

-- Full-text search on atoms
CREATE VIRTUAL TABLE IF NOT EXISTS atoms_fts USING fts5(
    title,
    content,
    content=atoms,
    content_rowid=rowid
);

-- Triggers to keep FTS in sync with atoms (counter updates do not reindex)
CREATE TRIGGER IF NOT EXISTS atoms_fts_insert AFTER INSERT ON atoms BEGIN
    INSERT INTO atoms_fts(rowid, title, content)
    VALUES (new.rowid, new.title, new.content);
END;

CREATE TRIGGER IF NOT EXISTS atoms_fts_delete AFTER DELETE ON atoms BEGIN
    INSERT INTO atoms_fts(atoms_fts, rowid, title, content)
    VALUES ('delete', old.rowid, old.title, old.content);
END;

CREATE TRIGGER IF NOT EXISTS atoms_fts_update AFTER UPDATE OF title, content ON atoms BEGIN
    INSERT INTO atoms_fts(atoms_fts, rowid, title, content)
    VALUES ('delete', old.rowid, old.title, old.content);
    INSERT INTO atoms_fts(rowid, title, content)
    VALUES (new.rowid, new.title, new.content);
END;

-- Full-text search on past queries (similar-case lookup)
CREATE VIRTUAL TABLE IF NOT EXISTS traces_fts USING fts5(
    query_text,
    content=traces,
    content_rowid=id
);

CREATE TRIGGER IF NOT EXISTS traces_fts_insert AFTER INSERT ON traces BEGIN
    INSERT INTO traces_fts(rowid, query_text) VALUES (new.id, new.query_text);
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Feedback low-satisfaction flag on atoms",
            sql: r#"
ALTER TABLE atoms ADD COLUMN low_satisfaction_flagged INTEGER NOT NULL DEFAULT 0;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}

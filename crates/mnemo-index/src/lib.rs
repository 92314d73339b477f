//! Rebuildable SQLite + FTS5 search/ranking index.
//!
//! The chain is the sole source of truth; everything in `memories` is
//! derivable from `chain.jsonl` + `content/` via [`IndexHandle::rebuild_from_chain`].
//! A single `rusqlite::Connection` wrapped in a `Mutex` backs the handle,
//! matching the single-writer assumption rather than introducing a
//! connection pool.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use mnemo_core::time::Timestamp;
use rusqlite::{params, Connection, OptionalExtension};
use std::{
    collections::HashSet,
    path::Path,
    sync::Mutex,
};
use thiserror::Error;

/// Errors produced by the index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Underlying SQLite failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored value could not be parsed back into a typed field
    /// (`type`/`tier`/`decay_tier`/`source`/timestamp).
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    /// `importance` outside `[0, 1]` was supplied to [`IndexHandle::update_importance`].
    #[error("importance {0} is outside [0, 1]")]
    ImportanceOutOfRange(f64),
}

/// Decay tier assigned by maintenance passes based on access recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayTier {
    /// Recently accessed.
    Hot,
    /// Moderately recent.
    Warm,
    /// Stale.
    Cold,
    /// Garbage-collected; excluded from retrieval.
    Archived,
}

impl DecayTier {
    /// Render as the string stored in the `decay_tier` column.
    pub fn as_str(self) -> &'static str {
        match self {
            DecayTier::Hot => "hot",
            DecayTier::Warm => "warm",
            DecayTier::Cold => "cold",
            DecayTier::Archived => "archived",
        }
    }

    /// Parse a stored `decay_tier` value. Unknown values default to `Hot`,
    /// per §4.5's "unknown tier defaults to hot".
    pub fn parse(s: &str) -> Self {
        match s {
            "warm" => DecayTier::Warm,
            "cold" => DecayTier::Cold,
            "archived" => DecayTier::Archived,
            _ => DecayTier::Hot,
        }
    }
}

/// Provenance of an index row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Captured automatically (e.g. by a hook).
    Auto,
    /// Added directly by a user/caller.
    Manual,
    /// Produced by a curation pass.
    Curation,
}

impl Source {
    /// Render as the string stored in the `source` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Auto => "auto",
            Source::Manual => "manual",
            Source::Curation => "curation",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "auto" => Source::Auto,
            "curation" => Source::Curation,
            _ => Source::Manual,
        }
    }
}

/// One row of the `memories` table.
#[derive(Debug, Clone)]
pub struct Memory {
    /// Chain sequence number; also the primary key.
    pub seq: u64,
    /// Full text content.
    pub content: String,
    /// Optional extractive summary.
    pub summary: Option<String>,
    /// Entry type string (`"memory"`, `"identity"`, `"decision"`, `"redaction"`).
    pub entry_type: String,
    /// Persistence tier string (`"committed"`, `"relationship"`, `"ephemeral"`).
    pub tier: String,
    /// Importance in `[0, 1]`.
    pub importance: f64,
    /// Number of times retrieved and admitted.
    pub access_count: u64,
    /// Last time this row was admitted into a retrieval result.
    pub last_accessed: Option<Timestamp>,
    /// Creation time, from the chain entry's `ts`.
    pub created_at: Timestamp,
    /// Current decay tier.
    pub decay_tier: DecayTier,
    /// Provenance.
    pub source: Source,
}

/// A new row to insert via [`IndexHandle::insert`].
pub struct NewMemory {
    /// Chain sequence number.
    pub seq: u64,
    /// Full text content.
    pub content: String,
    /// Optional extractive summary.
    pub summary: Option<String>,
    /// Entry type string.
    pub entry_type: String,
    /// Persistence tier string.
    pub tier: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// Initial importance; defaults to 0.5 when omitted via [`NewMemory::default_for`].
    pub importance: f64,
    /// Provenance; defaults to [`Source::Manual`] via [`NewMemory::default_for`].
    pub source: Source,
}

impl NewMemory {
    /// Construct a row with the defaults used by rebuild: `importance=0.5`,
    /// `source=manual`.
    pub fn default_for(
        seq: u64,
        content: String,
        entry_type: String,
        tier: String,
        created_at: Timestamp,
    ) -> Self {
        Self { seq, content, summary: None, entry_type, tier, created_at, importance: 0.5, source: Source::Manual }
    }
}

/// A chain entry's projection as seen by [`IndexHandle::rebuild_from_chain`],
/// deliberately decoupled from `mnemo-chain::ChainEntry` so this crate does
/// not depend on the chain crate.
pub struct RebuildEntry {
    /// Chain sequence number.
    pub seq: u64,
    /// Entry type string.
    pub entry_type: String,
    /// Persistence tier string.
    pub tier: String,
    /// Tagged content digest to resolve via the [`ContentLoader`].
    pub content_hash: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// `target_seq` extracted from a `redaction` entry's metadata, if any.
    pub redaction_target: Option<u64>,
}

/// Narrow capability resolving a content digest to its bytes. Injected at
/// the call site rather than held as a singleton.
pub trait ContentLoader {
    /// Return the blob for `content_hash`, or `None` if absent.
    fn load(&self, content_hash: &str) -> Option<Vec<u8>>;
}

/// Outcome of [`IndexHandle::rebuild_from_chain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildResult {
    /// Number of entries written to `memories`.
    pub indexed: u64,
    /// Number of entries skipped (redacted, or blob absent from the CAS).
    pub skipped: u64,
}

/// Outcome of [`IndexHandle::update_decay_tiers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecayUpdateResult {
    /// Rows moved to `hot`.
    pub hot: u64,
    /// Rows moved to `warm`.
    pub warm: u64,
    /// Rows moved to `cold`.
    pub cold: u64,
    /// Rows promoted from `cold` back to `warm` by the frequency-resist rule.
    pub frequency_resisted: u64,
}

/// Thresholds for [`IndexHandle::update_decay_tiers`], defaults per §6.
#[derive(Debug, Clone, Copy)]
pub struct DecayThresholds {
    /// Rows accessed within this many days become `hot`.
    pub hot_days: u32,
    /// Rows accessed within this many days (beyond `hot_days`) become `warm`.
    pub warm_days: u32,
    /// Cold rows with `access_count` at or above this are promoted to `warm`.
    pub frequency_resist_threshold: u64,
}

impl Default for DecayThresholds {
    fn default() -> Self {
        Self { hot_days: 7, warm_days: 30, frequency_resist_threshold: 10 }
    }
}

/// A handle to an open index database.
pub struct IndexHandle {
    conn: Mutex<Connection>,
}

const CURRENT_MEMORIES_COLUMNS: &[&str] = &[
    "seq", "content", "summary", "type", "tier", "importance", "access_count", "last_accessed",
    "created_at", "decay_tier", "source",
];

impl IndexHandle {
    /// Open (creating and migrating as needed) the index database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::ensure_schema(&conn)?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory index database, primarily for tests.
    pub fn open_in_memory() -> Result<Self, IndexError> {
        let conn = Connection::open_in_memory()?;
        Self::ensure_schema(&conn)?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn ensure_schema(conn: &Connection) -> Result<(), IndexError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memories (
                seq INTEGER PRIMARY KEY,
                content TEXT NOT NULL,
                summary TEXT,
                type TEXT NOT NULL,
                tier TEXT NOT NULL,
                importance REAL NOT NULL DEFAULT 0.5,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance DESC);
            CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);
            CREATE INDEX IF NOT EXISTS idx_memories_source ON memories(source);

            CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
                content, summary, content='memories', content_rowid='seq'
            );

            CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
                INSERT INTO memories_fts(rowid, content, summary) VALUES (new.seq, new.content, new.summary);
            END;
            CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
                INSERT INTO memories_fts(memories_fts, rowid, content, summary)
                    VALUES ('delete', old.seq, old.content, old.summary);
            END;
            CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
                INSERT INTO memories_fts(memories_fts, rowid, content, summary)
                    VALUES ('delete', old.seq, old.content, old.summary);
                INSERT INTO memories_fts(rowid, content, summary) VALUES (new.seq, new.content, new.summary);
            END;

            CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Add the `decay_tier`/`source` columns (backfilling `'hot'`/`'manual'`)
    /// when opening a database created before they existed, and the
    /// `idx_memories_decay_last_accessed` composite index unconditionally.
    fn migrate(conn: &Connection) -> Result<(), IndexError> {
        let mut existing = HashSet::new();
        {
            let mut stmt = conn.prepare("PRAGMA table_info(memories)")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(1)?;
                existing.insert(name);
            }
        }
        if !existing.contains("decay_tier") {
            conn.execute("ALTER TABLE memories ADD COLUMN decay_tier TEXT NOT NULL DEFAULT 'hot'", [])?;
        }
        if !existing.contains("source") {
            conn.execute("ALTER TABLE memories ADD COLUMN source TEXT NOT NULL DEFAULT 'manual'", [])?;
        }
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memories_decay_last_accessed ON memories(decay_tier, last_accessed)",
            [],
        )?;
        let _ = CURRENT_MEMORIES_COLUMNS;
        Ok(())
    }

    fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
        let created_at_s: String = row.get("created_at")?;
        let last_accessed_s: Option<String> = row.get("last_accessed")?;
        let decay_tier_s: String = row.get("decay_tier")?;
        let source_s: String = row.get("source")?;
        Ok(Memory {
            seq: row.get::<_, i64>("seq")? as u64,
            content: row.get("content")?,
            summary: row.get("summary")?,
            entry_type: row.get("type")?,
            tier: row.get("tier")?,
            importance: row.get("importance")?,
            access_count: row.get::<_, i64>("access_count")? as u64,
            last_accessed: last_accessed_s
                .map(|s| Timestamp::from_rfc3339_millis(&s).unwrap_or(Timestamp::from_millis(0))),
            created_at: Timestamp::from_rfc3339_millis(&created_at_s).unwrap_or(Timestamp::from_millis(0)),
            decay_tier: DecayTier::parse(&decay_tier_s),
            source: Source::parse(&source_s),
        })
    }

    /// Insert a new row.
    pub fn insert(&self, row: NewMemory) -> Result<(), IndexError> {
        let conn = self.conn.lock().expect("index connection poisoned");
        conn.execute(
            "INSERT INTO memories
                (seq, content, summary, type, tier, importance, access_count, last_accessed, created_at, decay_tier, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL, ?7, 'hot', ?8)",
            params![
                row.seq as i64,
                row.content,
                row.summary,
                row.entry_type,
                row.tier,
                row.importance,
                row.created_at.to_rfc3339_millis(),
                row.source.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a row by `seq`.
    pub fn get(&self, seq: u64) -> Result<Option<Memory>, IndexError> {
        let conn = self.conn.lock().expect("index connection poisoned");
        conn.query_row("SELECT * FROM memories WHERE seq = ?1", params![seq as i64], Self::row_to_memory)
            .optional()
            .map_err(Into::into)
    }

    /// Increment `access_count` and set `last_accessed = now`.
    pub fn update_access(&self, seq: u64, now: Timestamp) -> Result<(), IndexError> {
        let conn = self.conn.lock().expect("index connection poisoned");
        conn.execute(
            "UPDATE memories SET access_count = access_count + 1, last_accessed = ?2 WHERE seq = ?1",
            params![seq as i64, now.to_rfc3339_millis()],
        )?;
        Ok(())
    }

    /// Set `importance`, clamped to `[0, 1]`.
    pub fn update_importance(&self, seq: u64, importance: f64) -> Result<(), IndexError> {
        if !(0.0..=1.0).contains(&importance) {
            return Err(IndexError::ImportanceOutOfRange(importance));
        }
        let conn = self.conn.lock().expect("index connection poisoned");
        conn.execute("UPDATE memories SET importance = ?2 WHERE seq = ?1", params![seq as i64, importance])?;
        Ok(())
    }

    /// Replace a row's extractive summary.
    pub fn update_summary(&self, seq: u64, summary: Option<&str>) -> Result<(), IndexError> {
        let conn = self.conn.lock().expect("index connection poisoned");
        conn.execute("UPDATE memories SET summary = ?2 WHERE seq = ?1", params![seq as i64, summary])?;
        Ok(())
    }

    /// Remove a row (used by GC tests and ad-hoc corrections; ordinary GC
    /// marks rows `archived` rather than deleting them).
    pub fn delete(&self, seq: u64) -> Result<(), IndexError> {
        let conn = self.conn.lock().expect("index connection poisoned");
        conn.execute("DELETE FROM memories WHERE seq = ?1", params![seq as i64])?;
        Ok(())
    }

    /// Rebuild the entire index from the chain: clear `memories`, then
    /// reinsert every non-redaction, non-redacted entry whose content is
    /// still resolvable via `loader`.
    pub fn rebuild_from_chain(
        &self,
        entries: &[RebuildEntry],
        loader: &dyn ContentLoader,
        now: Timestamp,
    ) -> Result<RebuildResult, IndexError> {
        let mut target_seqs = HashSet::new();
        for e in entries {
            if let Some(target) = e.redaction_target {
                target_seqs.insert(target);
            }
        }

        let mut conn = self.conn.lock().expect("index connection poisoned");
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM memories", [])?;

        let mut indexed = 0u64;
        let mut skipped = 0u64;
        for e in entries {
            if e.entry_type == "redaction" || target_seqs.contains(&e.seq) {
                if e.entry_type != "redaction" {
                    skipped += 1;
                }
                continue;
            }
            match loader.load(&e.content_hash) {
                None => skipped += 1,
                Some(bytes) => {
                    let content = String::from_utf8_lossy(&bytes).into_owned();
                    tx.execute(
                        "INSERT INTO memories
                            (seq, content, summary, type, tier, importance, access_count, last_accessed, created_at, decay_tier, source)
                         VALUES (?1, ?2, NULL, ?3, ?4, 0.5, 0, NULL, ?5, 'hot', 'manual')",
                        params![e.seq as i64, content, e.entry_type, e.tier, e.created_at.to_rfc3339_millis()],
                    )?;
                    indexed += 1;
                }
            }
        }

        tx.execute(
            "INSERT INTO index_meta (key, value) VALUES ('last_rebuild_at', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![now.to_rfc3339_millis()],
        )?;
        tx.execute(
            "INSERT INTO index_meta (key, value) VALUES ('indexed_count', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![indexed.to_string()],
        )?;
        tx.commit()?;

        Ok(RebuildResult { indexed, skipped })
    }

    /// Run an FTS5 query for `"t1"* OR "t2"* OR ...`, returning `(seq, raw_rank)`
    /// pairs ordered by rank (lower/more negative is better in SQLite FTS5's
    /// `bm25()`), capped at `limit`.
    pub fn search_fts(&self, tokens: &[String], limit: usize) -> Result<Vec<(u64, f64)>, IndexError> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let match_expr = tokens
            .iter()
            .map(|t| format!("\"{}\"*", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");
        let conn = self.conn.lock().expect("index connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT rowid, bm25(memories_fts) AS rank FROM memories_fts
             WHERE memories_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![match_expr, limit as i64], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, f64>(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// All rows with `created_at >= since`, most recent first, capped at `limit`.
    pub fn recent_since(&self, since: Timestamp, limit: usize) -> Result<Vec<Memory>, IndexError> {
        let conn = self.conn.lock().expect("index connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT * FROM memories WHERE created_at >= ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339_millis(), limit as i64], Self::row_to_memory)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// All rows with `importance >= min_importance`, capped at `limit`.
    pub fn high_importance(&self, min_importance: f64, limit: usize) -> Result<Vec<Memory>, IndexError> {
        let conn = self.conn.lock().expect("index connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT * FROM memories WHERE importance >= ?1 ORDER BY importance DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![min_importance, limit as i64], Self::row_to_memory)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Fetch rows by `seq`, in the order requested, skipping any that no
    /// longer exist.
    pub fn get_many(&self, seqs: &[u64]) -> Result<Vec<Memory>, IndexError> {
        let mut out = Vec::with_capacity(seqs.len());
        for &seq in seqs {
            if let Some(m) = self.get(seq)? {
                out.push(m);
            }
        }
        Ok(out)
    }

    /// The maximum `access_count` across all rows, or 0 if the index is empty.
    pub fn max_access_count(&self) -> Result<u64, IndexError> {
        let conn = self.conn.lock().expect("index connection poisoned");
        let max: Option<i64> = conn.query_row("SELECT MAX(access_count) FROM memories", [], |r| r.get(0))?;
        Ok(max.unwrap_or(0) as u64)
    }

    /// All non-archived, non-protected-tier rows eligible for garbage
    /// collection per §4.7 (older than `max_age_days`, or already `cold`).
    pub fn gc_candidates(
        &self,
        protected_tiers: &[String],
        max_age_days: u32,
        now: Timestamp,
    ) -> Result<Vec<Memory>, IndexError> {
        let cutoff = Timestamp::from_millis(now.as_millis() - max_age_days as i64 * 86_400_000);
        let conn = self.conn.lock().expect("index connection poisoned");
        let placeholders = protected_tiers.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT * FROM memories WHERE decay_tier != 'archived' AND tier NOT IN ({}) \
             AND (created_at < ? OR decay_tier = 'cold')",
            if placeholders.is_empty() { "''".to_string() } else { placeholders }
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut query_params: Vec<&dyn rusqlite::ToSql> =
            protected_tiers.iter().map(|t| t as &dyn rusqlite::ToSql).collect();
        let cutoff_str = cutoff.to_rfc3339_millis();
        query_params.push(&cutoff_str);
        let rows = stmt.query_map(query_params.as_slice(), Self::row_to_memory)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Mark a row `archived` (used by GC).
    pub fn archive(&self, seq: u64) -> Result<(), IndexError> {
        let conn = self.conn.lock().expect("index connection poisoned");
        conn.execute("UPDATE memories SET decay_tier = 'archived' WHERE seq = ?1", params![seq as i64])?;
        Ok(())
    }

    /// Move an `archived` row back to `cold` (used by `restore`).
    pub fn restore(&self, seq: u64) -> Result<(), IndexError> {
        let conn = self.conn.lock().expect("index connection poisoned");
        conn.execute(
            "UPDATE memories SET decay_tier = 'cold' WHERE seq = ?1 AND decay_tier = 'archived'",
            params![seq as i64],
        )?;
        Ok(())
    }

    /// Apply the decay-tier transition rules of §4.7 in a single transaction.
    pub fn update_decay_tiers(&self, thresholds: DecayThresholds, now: Timestamp) -> Result<DecayUpdateResult, IndexError> {
        let hot_cutoff = Timestamp::from_millis(now.as_millis() - thresholds.hot_days as i64 * 86_400_000);
        let warm_cutoff = Timestamp::from_millis(now.as_millis() - thresholds.warm_days as i64 * 86_400_000);

        let mut conn = self.conn.lock().expect("index connection poisoned");
        let tx = conn.transaction()?;

        let hot = tx.execute(
            "UPDATE memories SET decay_tier = 'hot'
             WHERE decay_tier != 'archived' AND last_accessed IS NOT NULL AND last_accessed >= ?1",
            params![hot_cutoff.to_rfc3339_millis()],
        )? as u64;

        let warm = tx.execute(
            "UPDATE memories SET decay_tier = 'warm'
             WHERE decay_tier != 'archived' AND last_accessed IS NOT NULL
               AND last_accessed < ?1 AND last_accessed >= ?2",
            params![hot_cutoff.to_rfc3339_millis(), warm_cutoff.to_rfc3339_millis()],
        )? as u64;

        let cold = tx.execute(
            "UPDATE memories SET decay_tier = 'cold'
             WHERE decay_tier != 'archived'
               AND (last_accessed IS NULL OR last_accessed < ?1)",
            params![warm_cutoff.to_rfc3339_millis()],
        )? as u64;

        let frequency_resisted = tx.execute(
            "UPDATE memories SET decay_tier = 'warm'
             WHERE decay_tier = 'cold' AND access_count >= ?1",
            params![thresholds.frequency_resist_threshold as i64],
        )? as u64;

        tx.commit()?;
        Ok(DecayUpdateResult { hot, warm, cold, frequency_resisted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapLoader(std::collections::HashMap<String, Vec<u8>>);
    impl ContentLoader for MapLoader {
        fn load(&self, content_hash: &str) -> Option<Vec<u8>> {
            self.0.get(content_hash).cloned()
        }
    }

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let idx = IndexHandle::open_in_memory().unwrap();
        idx.insert(NewMemory::default_for(
            1,
            "hello world".to_string(),
            "memory".to_string(),
            "relationship".to_string(),
            ts(1000),
        ))
        .unwrap();
        let row = idx.get(1).unwrap().unwrap();
        assert_eq!(row.content, "hello world");
        assert_eq!(row.importance, 0.5);
        assert_eq!(row.decay_tier, DecayTier::Hot);
    }

    #[test]
    fn update_access_increments_and_sets_last_accessed() {
        let idx = IndexHandle::open_in_memory().unwrap();
        idx.insert(NewMemory::default_for(1, "x".into(), "memory".into(), "ephemeral".into(), ts(0))).unwrap();
        idx.update_access(1, ts(5000)).unwrap();
        idx.update_access(1, ts(6000)).unwrap();
        let row = idx.get(1).unwrap().unwrap();
        assert_eq!(row.access_count, 2);
        assert_eq!(row.last_accessed.unwrap().as_millis(), 6000);
    }

    #[test]
    fn update_importance_rejects_out_of_range() {
        let idx = IndexHandle::open_in_memory().unwrap();
        idx.insert(NewMemory::default_for(1, "x".into(), "memory".into(), "ephemeral".into(), ts(0))).unwrap();
        assert!(matches!(idx.update_importance(1, 1.5), Err(IndexError::ImportanceOutOfRange(_))));
        idx.update_importance(1, 0.9).unwrap();
        assert_eq!(idx.get(1).unwrap().unwrap().importance, 0.9);
    }

    #[test]
    fn fts_search_finds_matching_rows() {
        let idx = IndexHandle::open_in_memory().unwrap();
        idx.insert(NewMemory::default_for(1, "dark mode interface".into(), "memory".into(), "relationship".into(), ts(0))).unwrap();
        idx.insert(NewMemory::default_for(2, "coffee in the morning".into(), "memory".into(), "relationship".into(), ts(0))).unwrap();
        let hits = idx.search_fts(&["dark".to_string()], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
    }

    #[test]
    fn rebuild_skips_redacted_and_missing_content() {
        let idx = IndexHandle::open_in_memory().unwrap();
        let mut blobs = std::collections::HashMap::new();
        blobs.insert("sha256:aaa".to_string(), b"kept content".to_vec());
        let loader = MapLoader(blobs);

        let entries = vec![
            RebuildEntry { seq: 0, entry_type: "identity".into(), tier: "committed".into(), content_hash: "sha256:aaa".into(), created_at: ts(0), redaction_target: None },
            RebuildEntry { seq: 1, entry_type: "memory".into(), tier: "ephemeral".into(), content_hash: "sha256:bbb".into(), created_at: ts(1), redaction_target: None },
            RebuildEntry { seq: 2, entry_type: "memory".into(), tier: "ephemeral".into(), content_hash: "sha256:ccc".into(), created_at: ts(2), redaction_target: None },
            RebuildEntry { seq: 3, entry_type: "redaction".into(), tier: "ephemeral".into(), content_hash: "sha256:ddd".into(), created_at: ts(3), redaction_target: Some(2) },
        ];

        let result = idx.rebuild_from_chain(&entries, &loader, ts(100)).unwrap();
        assert_eq!(result.indexed, 1);
        assert_eq!(result.skipped, 2);
        assert!(idx.get(0).unwrap().is_some());
        assert!(idx.get(1).unwrap().is_none());
        assert!(idx.get(2).unwrap().is_none());
        assert!(idx.get(3).unwrap().is_none());
    }

    #[test]
    fn rebuild_is_deterministic_modulo_access_fields() {
        let idx = IndexHandle::open_in_memory().unwrap();
        let mut blobs = std::collections::HashMap::new();
        blobs.insert("sha256:aaa".to_string(), b"content".to_vec());
        let loader = MapLoader(blobs);
        let entries = vec![RebuildEntry {
            seq: 0,
            entry_type: "memory".into(),
            tier: "ephemeral".into(),
            content_hash: "sha256:aaa".into(),
            created_at: ts(0),
            redaction_target: None,
        }];
        idx.rebuild_from_chain(&entries, &loader, ts(10)).unwrap();
        idx.update_access(0, ts(20)).unwrap();
        idx.rebuild_from_chain(&entries, &loader, ts(30)).unwrap();
        let row = idx.get(0).unwrap().unwrap();
        assert_eq!(row.access_count, 0);
        assert!(row.last_accessed.is_none());
        assert_eq!(row.content, "content");
    }

    #[test]
    fn decay_tiers_transition() {
        let idx = IndexHandle::open_in_memory().unwrap();
        idx.insert(NewMemory::default_for(1, "recent".into(), "memory".into(), "ephemeral".into(), ts(0))).unwrap();
        idx.insert(NewMemory::default_for(2, "old but popular".into(), "memory".into(), "ephemeral".into(), ts(0))).unwrap();
        idx.insert(NewMemory::default_for(3, "old and quiet".into(), "memory".into(), "ephemeral".into(), ts(0))).unwrap();

        let now = ts(100 * 86_400_000);
        idx.update_access(1, Timestamp::from_millis(now.as_millis() - 1 * 86_400_000)).unwrap();
        idx.update_access(2, Timestamp::from_millis(now.as_millis() - 60 * 86_400_000)).unwrap();
        for _ in 0..9 {
            idx.update_access(2, Timestamp::from_millis(now.as_millis() - 60 * 86_400_000)).unwrap();
        }
        idx.update_access(3, Timestamp::from_millis(now.as_millis() - 60 * 86_400_000)).unwrap();

        let result = idx.update_decay_tiers(DecayThresholds::default(), now).unwrap();
        assert_eq!(idx.get(1).unwrap().unwrap().decay_tier, DecayTier::Hot);
        assert_eq!(idx.get(2).unwrap().unwrap().decay_tier, DecayTier::Warm);
        assert_eq!(idx.get(3).unwrap().unwrap().decay_tier, DecayTier::Cold);
        assert_eq!(result.frequency_resisted, 1);
    }

    #[test]
    fn gc_candidates_exclude_protected_and_archived() {
        let idx = IndexHandle::open_in_memory().unwrap();
        idx.insert(NewMemory::default_for(1, "x".into(), "memory".into(), "committed".into(), ts(0))).unwrap();
        idx.insert(NewMemory::default_for(2, "y".into(), "memory".into(), "ephemeral".into(), ts(0))).unwrap();
        idx.archive(2).unwrap();
        idx.insert(NewMemory::default_for(3, "z".into(), "memory".into(), "ephemeral".into(), ts(0))).unwrap();

        let now = ts(100 * 86_400_000);
        let candidates = idx.gc_candidates(&["committed".to_string()], 30, now).unwrap();
        let seqs: HashSet<u64> = candidates.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, HashSet::from([3]));
    }

    #[test]
    fn restore_moves_archived_back_to_cold() {
        let idx = IndexHandle::open_in_memory().unwrap();
        idx.insert(NewMemory::default_for(1, "x".into(), "memory".into(), "ephemeral".into(), ts(0))).unwrap();
        idx.archive(1).unwrap();
        idx.restore(1).unwrap();
        assert_eq!(idx.get(1).unwrap().unwrap().decay_tier, DecayTier::Cold);
    }
}

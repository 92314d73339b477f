//! The external interface layer (§4.9): binds the chain, CAS, index,
//! retrieval, compression and maintenance crates behind the public API of
//! §6, with one unified [`Error`] taxonomy (§7).
//!
//! [`MemoryEngine`] owns one chain directory end to end: it is the single
//! entry point a caller (CLI, hook integration, MCP server — all external
//! collaborators per §1) needs to depend on. Everything below is a thin,
//! `#[tracing::instrument]`-annotated binding over the lower crates; no
//! chain/index/scoring logic lives here.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use mnemo_chain::{
    ChainEntry, ChainExport, Config, EntryType, ImportResult, KeyMode, PasswordProvider, Tier,
    VerificationError, VerificationReport,
};
pub use mnemo_index::{DecayThresholds, DecayUpdateResult, Memory};
pub use mnemo_maintenance::{DuplicateCheck, DuplicateSource, GcConfig, GcResult};
pub use mnemo_retrieval::{format_for_prompt, RetrievalFilters, RetrieveOptions, ScoredMemory};
pub use mnemo_telemetry::{Event, EventType, MetricsSink};

use mnemo_core::time::Timestamp;
use mnemo_index::{ContentLoader, IndexHandle, NewMemory, RebuildEntry};
use thiserror::Error;

/// The engine's unified error taxonomy (§7). Each variant is `#[from]`-composed
/// from the originating crate's own error type, the way every teacher crate
/// composes its `thiserror` enum from its dependencies' errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A chain-log failure (I/O, malformed entry, crypto, validation, config
    /// mismatch, missing password/env key).
    #[error("chain: {0}")]
    Chain(#[from] mnemo_chain::ChainError),
    /// A content-store failure (I/O, oversize blob).
    #[error("content store: {0}")]
    Cas(#[from] mnemo_cas::Error),
    /// An index failure (SQLite, corrupt row, out-of-range importance).
    #[error("index: {0}")]
    Index(#[from] mnemo_index::IndexError),
    /// A maintenance-pass failure.
    #[error("maintenance: {0}")]
    Maintenance(#[from] mnemo_maintenance::MaintenanceError),
    /// Caller input failed validation (bad type/tier string, redaction
    /// target not found, CLI flag misuse). Fatal to the operation, not to
    /// the chain.
    #[error("validation: {0}")]
    Validation(String),
    /// A blob's recomputed digest does not match the digest it was
    /// requested under. Distinct from a missing blob (which is `Ok(None)`).
    #[error("content integrity: digest {0} does not match stored bytes")]
    ContentIntegrity(String),
}

/// Options accepted by [`MemoryEngine::init`], mirroring §6's `init_chain`.
pub struct InitOptions<'a> {
    /// Agent name recorded in `config.json` and used for the genesis blob.
    pub agent_name: String,
    /// How the private signing key should be stored.
    pub key_mode: KeyMode,
    /// Password to encrypt the key under; required when `key_mode == Encrypted`.
    pub password: Option<&'a str>,
    /// Override the genesis identity blob content (default: `"I am <agent_name>"`).
    pub identity_content: Option<String>,
}

/// One memory to add via [`MemoryEngine::add_entry`], mirroring §6's
/// `add_entry(dir, {type, tier, content, metadata?})`.
pub struct AddEntryInput {
    /// Entry type.
    pub kind: EntryType,
    /// Persistence tier.
    pub tier: Tier,
    /// Raw text content, stored in the CAS and projected into the index.
    pub content: String,
    /// Optional metadata (depth-bounded JSON).
    pub metadata: Option<serde_json::Value>,
    /// Provenance recorded in the index row. Defaults to `manual`; hook
    /// integrations that auto-capture memories should pass `auto`.
    pub source: mnemo_index::Source,
}

impl AddEntryInput {
    /// A plain, manually-sourced memory entry with no metadata.
    pub fn memory(tier: Tier, content: impl Into<String>) -> Self {
        Self {
            kind: EntryType::Memory,
            tier,
            content: content.into(),
            metadata: None,
            source: mnemo_index::Source::Manual,
        }
    }
}

/// Options accepted by [`MemoryEngine::verify`].
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    /// Also recompute and compare each non-redacted entry's content blob.
    pub check_content: bool,
}

struct ChainContentLoader<'a> {
    cas: &'a mnemo_cas::ContentStore,
}

impl ContentLoader for ChainContentLoader<'_> {
    fn load(&self, content_hash: &str) -> Option<Vec<u8>> {
        self.cas.get(content_hash).ok().flatten()
    }
}

fn redaction_target(entry: &ChainEntry) -> Option<u64> {
    if entry.kind != EntryType::Redaction {
        return None;
    }
    entry.metadata.as_ref()?.get("target_seq")?.as_u64()
}

/// A handle to one chain directory, bound to its own index database. Owns
/// no background threads or timers; every operation is synchronous, per §5.
pub struct MemoryEngine {
    dir: PathBuf,
    chain: mnemo_chain::ChainStore,
    cas: mnemo_cas::ContentStore,
    config: Config,
    index: IndexHandle,
}

impl MemoryEngine {
    /// Initialize a fresh chain directory (genesis entry + config + keys)
    /// and open its (empty, then rebuilt) index. Mirrors §6's `init_chain`.
    #[tracing::instrument(skip(opts), fields(agent = %opts.agent_name))]
    pub fn init(dir: impl AsRef<Path>, opts: InitOptions<'_>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        let (chain, config) = mnemo_chain::ChainStore::init(
            &dir,
            mnemo_chain::InitOptions {
                agent_name: opts.agent_name,
                key_mode: opts.key_mode,
                password: opts.password,
                identity_content: opts.identity_content,
            },
        )?;
        let cas = mnemo_cas::ContentStore::open(&dir)?;
        let index = IndexHandle::open(dir.join("memory.db"))?;
        let engine = Self { dir, chain, cas, config, index };
        engine.rebuild_index()?;
        mnemo_telemetry::record(Event::now(EventType::ChainInit, None, HashMap::new()));
        Ok(engine)
    }

    /// Open an existing chain directory and its index database (created,
    /// empty, on first open — callers should [`MemoryEngine::rebuild_index`]
    /// once after opening a chain whose `memory.db` predates the data, or
    /// rely on [`MemoryEngine::init`] having already done so).
    #[tracing::instrument(skip_all)]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        let (chain, config) = mnemo_chain::ChainStore::open(&dir)?;
        let cas = mnemo_cas::ContentStore::open(&dir)?;
        let index = IndexHandle::open(dir.join("memory.db"))?;
        Ok(Self { dir, chain, cas, config, index })
    }

    /// The chain's persisted configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The chain directory this engine is bound to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a new entry: store content in the CAS, sign and append to the
    /// chain, then insert the corresponding row into the index. Mirrors §6's
    /// `add_entry` data flow in §2: skeleton → CAS → sign → append → index.
    #[tracing::instrument(skip(self, input, password_provider), fields(tier = ?input.tier))]
    pub fn add_entry(
        &self,
        input: AddEntryInput,
        password_provider: Option<&dyn PasswordProvider>,
    ) -> Result<ChainEntry, Error> {
        let start = std::time::Instant::now();
        let entry = self.chain.add_entry(
            &self.config,
            mnemo_chain::EntryInput {
                kind: input.kind,
                tier: input.tier,
                content: input.content.clone().into_bytes(),
                metadata: input.metadata,
            },
            password_provider,
        )?;

        if entry.kind != EntryType::Redaction {
            let row = NewMemory {
                seq: entry.seq,
                content: input.content,
                summary: None,
                entry_type: entry.kind.as_ref().to_string(),
                tier: entry.tier.as_ref().to_string(),
                created_at: entry.ts,
                importance: 0.5,
                source: input.source,
            };
            self.index.insert(row)?;
        }

        let mut data = HashMap::new();
        data.insert("seq".to_string(), entry.seq.to_string());
        mnemo_telemetry::record(Event::now(
            EventType::EntryAdd,
            Some(start.elapsed().as_millis() as u64),
            data,
        ));
        Ok(entry)
    }

    /// Read the full chain in order. Mirrors §6's `read_chain`.
    pub fn read_chain(&self) -> Result<Vec<ChainEntry>, Error> {
        Ok(self.chain.read_chain()?)
    }

    /// Verify the chain's integrity per §4.3. Mirrors §6's `verify_chain`.
    #[tracing::instrument(skip(self))]
    pub fn verify(&self, opts: VerifyOptions) -> Result<VerificationReport, Error> {
        let start = std::time::Instant::now();
        let report = self.chain.verify_chain(&self.config, opts.check_content)?;
        let mut data = HashMap::new();
        data.insert("valid".to_string(), report.valid.to_string());
        data.insert("entries_checked".to_string(), report.entries_checked.to_string());
        mnemo_telemetry::record(Event::now(
            EventType::ChainVerify,
            Some(start.elapsed().as_millis() as u64),
            data,
        ));
        Ok(report)
    }

    /// Read a content blob by its tagged digest, recomputing the digest to
    /// detect tampering. Mirrors §4.2's `get_verified`.
    pub fn get_content_verified(&self, content_hash: &str) -> Result<Option<Vec<u8>>, Error> {
        match self.cas.get_verified(content_hash) {
            Ok(v) => Ok(v),
            Err(mnemo_cas::Error::Tampered(digest)) => Err(Error::ContentIntegrity(digest)),
            Err(e) => Err(e.into()),
        }
    }

    /// Emit a `redaction` entry targeting `target_seq`, then delete that
    /// entry's blob from the CAS and drop its index row. Mirrors §6's
    /// `redact(dir, target_seq, reason)`; the blob delete is the "MAY
    /// subsequently delete" step of §4.3 performed eagerly, since the engine
    /// already knows the target's `content_hash`.
    #[tracing::instrument(skip(self, password_provider))]
    pub fn redact(
        &self,
        target_seq: u64,
        reason: &str,
        password_provider: Option<&dyn PasswordProvider>,
    ) -> Result<ChainEntry, Error> {
        let entries = self.chain.read_chain()?;
        let target = entries
            .iter()
            .find(|e| e.seq == target_seq)
            .ok_or_else(|| Error::Validation(format!("no entry with seq {target_seq}")))?;
        let target_content_hash = target.content_hash.clone();

        let redaction = self.chain.redact(&self.config, target_seq, reason, password_provider)?;
        self.cas.delete(&target_content_hash)?;
        self.index.delete(target_seq)?;
        Ok(redaction)
    }

    /// Export the chain (and optionally its blobs) as a single self-describing
    /// record. Mirrors §6's `export`.
    pub fn export(&self, include_blobs: bool) -> Result<ChainExport, Error> {
        Ok(self.chain.export(&self.config, include_blobs)?)
    }

    /// Import a [`ChainExport`] into a fresh directory, returning a ready
    /// [`MemoryEngine`] over it with the index already rebuilt. Mirrors §6's
    /// `import(export, dir, options)`.
    pub fn import(
        export: &ChainExport,
        dir: impl AsRef<Path>,
        verify: bool,
    ) -> Result<(Self, ImportResult), Error> {
        let result = mnemo_chain::import(export, dir.as_ref(), verify)?;
        let engine = Self::open(dir)?;
        engine.rebuild_index()?;
        Ok((engine, result))
    }

    /// Rebuild the index from the chain and CAS from scratch. Mirrors §6's
    /// `rebuild_index`; the chain is the sole source of truth, so this is
    /// always safe to call and always produces the same projection for an
    /// unchanged chain (§8 invariant 4, modulo `access_count`/`last_accessed`).
    #[tracing::instrument(skip(self))]
    pub fn rebuild_index(&self) -> Result<mnemo_index::RebuildResult, Error> {
        let start = std::time::Instant::now();
        let entries = self.chain.read_chain()?;
        let rebuild_entries: Vec<RebuildEntry> = entries
            .iter()
            .map(|e| RebuildEntry {
                seq: e.seq,
                entry_type: e.kind.as_ref().to_string(),
                tier: e.tier.as_ref().to_string(),
                content_hash: e.content_hash.clone(),
                created_at: e.ts,
                redaction_target: redaction_target(e),
            })
            .collect();
        let loader = ChainContentLoader { cas: &self.cas };
        let result = self.index.rebuild_from_chain(&rebuild_entries, &loader, Timestamp::now())?;
        let mut data = HashMap::new();
        data.insert("indexed".to_string(), result.indexed.to_string());
        data.insert("skipped".to_string(), result.skipped.to_string());
        mnemo_telemetry::record(Event::now(
            EventType::IndexRebuild,
            Some(start.elapsed().as_millis() as u64),
            data,
        ));
        Ok(result)
    }

    /// Keyword-seeded hybrid retrieval. Mirrors §6's `retrieve(index, query, options)`.
    #[tracing::instrument(skip(self, options))]
    pub fn retrieve(&self, query: &str, options: &RetrieveOptions) -> Result<Vec<ScoredMemory>, Error> {
        let start = std::time::Instant::now();
        let results = mnemo_retrieval::retrieve(&self.index, query, options, Timestamp::now())?;
        let mut data = HashMap::new();
        data.insert("query".to_string(), query.to_string());
        data.insert("results".to_string(), results.len().to_string());
        mnemo_telemetry::record(Event::now(
            EventType::RetrievalQuery,
            Some(start.elapsed().as_millis() as u64),
            data,
        ));
        Ok(results)
    }

    /// Query-free context retrieval. Mirrors §6's `retrieve_context(index, options)`.
    pub fn retrieve_context(&self, options: &RetrieveOptions) -> Result<Vec<ScoredMemory>, Error> {
        Ok(mnemo_retrieval::retrieve_context(&self.index, options, Timestamp::now())?)
    }

    /// Run garbage collection over the index only; never touches the chain
    /// or the CAS (§8 invariant 7). Mirrors §6's `run_gc(index, config)`.
    pub fn run_gc(&self, config: &GcConfig) -> Result<GcResult, Error> {
        Ok(mnemo_maintenance::run_gc(&self.index, config, Timestamp::now())?)
    }

    /// Update decay tiers across the index. Mirrors §6's
    /// `update_decay_tiers(index, thresholds)`.
    pub fn update_decay_tiers(&self, thresholds: DecayThresholds) -> Result<DecayUpdateResult, Error> {
        Ok(mnemo_maintenance::update_decay_tiers(&self.index, thresholds, Timestamp::now())?)
    }

    /// Restore a previously archived row back to `cold`.
    pub fn restore(&self, seq: u64) -> Result<(), Error> {
        Ok(mnemo_maintenance::restore(&self.index, seq)?)
    }

    /// Check whether `text` duplicates an existing memory, per §4.7's fixed
    /// lookup order (daily capture file, FTS index candidate, curated file).
    pub fn check_duplicate(
        &self,
        text: &str,
        daily_capture_path: Option<&Path>,
        curated_path: Option<&Path>,
    ) -> Result<DuplicateCheck, Error> {
        Ok(mnemo_maintenance::check_duplicate(text, daily_capture_path, &self.index, curated_path)?)
    }

    /// Generate an extractive summary of `seq`'s content (§4.6), capped at
    /// `max_chars`, persist it via [`mnemo_index::IndexHandle::update_summary`],
    /// and return it. Mirrors the index's `update_summary` operation (§4.4),
    /// with the compression itself delegated to `mnemo-compress`.
    pub fn summarize(&self, seq: u64, max_chars: usize) -> Result<String, Error> {
        let memory = self
            .index
            .get(seq)?
            .ok_or_else(|| Error::Validation(format!("no memory row for seq {seq}")))?;
        let summary = mnemo_compress::summarize(&memory.content, max_chars, true);
        self.index.update_summary(seq, Some(&summary))?;
        Ok(summary)
    }
}

/// Install a process-wide metrics sink, or `None` to disable collection.
/// Mirrors §6's `set_metrics_sink(collector|null)`.
pub fn set_metrics_sink(sink: Option<std::sync::Arc<dyn MetricsSink>>) {
    match sink {
        Some(s) => mnemo_telemetry::set_sink(s),
        None => mnemo_telemetry::clear_sink(),
    }
}

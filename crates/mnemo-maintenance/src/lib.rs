//! Deduplication, decay-tier updates, garbage collection and the
//! verification entry point that ties the chain and index together.
//!
//! GC and decay tiering are index-only passes; neither ever touches the
//! chain or the CAS, per §4.7.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use mnemo_chain::{ChainStore, Config as ChainConfig};
use mnemo_core::time::Timestamp;
use mnemo_index::IndexHandle;
use std::{
    collections::HashSet,
    fs,
    path::Path,
};
use thiserror::Error;

/// Errors produced by maintenance operations.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    /// Failure reading a scratchpad file (daily capture / curated long-term).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Underlying index failure.
    #[error("index: {0}")]
    Index(#[from] mnemo_index::IndexError),
    /// Underlying chain failure.
    #[error("chain: {0}")]
    Chain(#[from] mnemo_chain::ChainError),
}

/// Which scratchpad or index lookup flagged a candidate as a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateSource {
    /// Matched an entry already present in today's daily capture file.
    DailyCapture,
    /// Matched the top FTS candidate in the index.
    Index,
    /// Matched an entry in the curated long-term file.
    CuratedFile,
}

/// Result of [`check_duplicate`].
#[derive(Debug, Clone)]
pub struct DuplicateCheck {
    /// Whether a duplicate was found.
    pub is_duplicate: bool,
    /// Which source matched, if any.
    pub matched_source: Option<DuplicateSource>,
}

/// Lowercase, strip punctuation, and collapse whitespace so near-identical
/// text compares equal regardless of formatting.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if c.is_whitespace() {
            out.push(' ');
        }
        // other punctuation is dropped entirely
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn scratchpad_duplicate(candidate_norm: &str, path: &Path) -> Result<bool, MaintenanceError> {
    if !path.exists() {
        return Ok(false);
    }
    let contents = fs::read_to_string(path)?;
    Ok(contents.lines().any(|line| normalize_text(line) == candidate_norm))
}

/// Check `candidate` against the automated-capture duplicate pipeline, in
/// the fixed order mandated by §4.7: today's daily capture file, then an
/// FTS lookup against the index, then the curated long-term file. Never
/// used for user-initiated commits.
pub fn check_duplicate(
    candidate: &str,
    daily_capture_path: Option<&Path>,
    index: &IndexHandle,
    curated_file_path: Option<&Path>,
) -> Result<DuplicateCheck, MaintenanceError> {
    let candidate_norm = normalize_text(candidate);

    if let Some(path) = daily_capture_path {
        if scratchpad_duplicate(&candidate_norm, path)? {
            return Ok(DuplicateCheck { is_duplicate: true, matched_source: Some(DuplicateSource::DailyCapture) });
        }
    }

    let tokens: Vec<String> = candidate
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 4)
        .take(5)
        .map(str::to_lowercase)
        .collect();
    if !tokens.is_empty() {
        let hits = index.search_fts(&tokens, 1)?;
        if let Some((seq, _)) = hits.first() {
            if let Some(top) = index.get(*seq)? {
                let top_norm = normalize_text(&top.content);
                if top_norm == candidate_norm || top_norm.contains(&candidate_norm) || candidate_norm.contains(&top_norm) {
                    return Ok(DuplicateCheck { is_duplicate: true, matched_source: Some(DuplicateSource::Index) });
                }
            }
        }
    }

    if let Some(path) = curated_file_path {
        if scratchpad_duplicate(&candidate_norm, path)? {
            return Ok(DuplicateCheck { is_duplicate: true, matched_source: Some(DuplicateSource::CuratedFile) });
        }
    }

    Ok(DuplicateCheck { is_duplicate: false, matched_source: None })
}

/// Jaccard similarity of the two texts' (normalized, deduplicated) word
/// sets, for batch comparison outside the fixed dedup pipeline.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let words_a = normalize_text(a);
    let words_b = normalize_text(b);
    let set_a: HashSet<&str> = words_a.split(' ').filter(|w| !w.is_empty()).collect();
    let set_b: HashSet<&str> = words_b.split(' ').filter(|w| !w.is_empty()).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Default Jaccard duplicate threshold per §4.7.
pub const DEFAULT_JACCARD_THRESHOLD: f64 = 0.8;

/// Whether `a` and `b` are duplicates under Jaccard similarity at `threshold`
/// (defaulting to [`DEFAULT_JACCARD_THRESHOLD`] when the caller has no
/// stronger opinion).
pub fn is_duplicate_by_jaccard(a: &str, b: &str, threshold: f64) -> bool {
    jaccard_similarity(a, b) >= threshold
}

/// Thresholds for [`update_decay_tiers`]; re-exported so callers configure
/// maintenance without depending on `mnemo-index` directly.
pub use mnemo_index::DecayThresholds;
/// Outcome of [`update_decay_tiers`].
pub use mnemo_index::DecayUpdateResult;

/// Apply the hot/warm/cold decay-tier transition rules in a single
/// transaction (delegates to the index, which owns the schema mutation).
pub fn update_decay_tiers(index: &IndexHandle, thresholds: DecayThresholds, now: Timestamp) -> Result<DecayUpdateResult, MaintenanceError> {
    Ok(index.update_decay_tiers(thresholds, now)?)
}

/// Configuration for [`run_gc`], defaults per §4.7.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Tiers exempt from garbage collection.
    pub protected_tiers: Vec<String>,
    /// Candidates older than this (by `created_at`) are eligible regardless of decay tier.
    pub max_age_days: u32,
    /// Candidates scoring below this are archived.
    pub gc_threshold: f64,
    /// When true, counts candidates that would be archived without mutating anything.
    pub dry_run: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            protected_tiers: vec!["committed".to_string()],
            max_age_days: 30,
            gc_threshold: 0.2,
            dry_run: false,
        }
    }
}

/// Outcome of [`run_gc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcResult {
    /// Number of candidates scored.
    pub scanned: u64,
    /// Number of rows actually marked `archived`.
    pub archived: u64,
    /// Number of rows that would have been archived under `dry_run`.
    pub would_archive: u64,
}

fn gc_tier_boost(tier: &str) -> f64 {
    match tier {
        "committed" => 1.5,
        "relationship" => 1.0,
        "ephemeral" => 0.8,
        _ => 1.0,
    }
}

/// Score and (unless `dry_run`) archive low-value candidates. Index-only:
/// archiving never deletes the chain entry or its CAS blob.
pub fn run_gc(index: &IndexHandle, config: &GcConfig, now: Timestamp) -> Result<GcResult, MaintenanceError> {
    let candidates = index.gc_candidates(&config.protected_tiers, config.max_age_days, now)?;
    let max_access = index.max_access_count()?;

    let mut result = GcResult { scanned: candidates.len() as u64, ..GcResult::default() };
    for memory in &candidates {
        let recency = mnemo_retrieval::recency_score(memory.created_at, now);
        let access = mnemo_retrieval::access_norm(memory.access_count, max_access);
        let base = 0.3 * recency + 0.4 * access + 0.3 * memory.importance;
        let score = base * gc_tier_boost(&memory.tier);
        if score < config.gc_threshold {
            if config.dry_run {
                result.would_archive += 1;
            } else {
                index.archive(memory.seq)?;
                result.archived += 1;
            }
        }
    }
    Ok(result)
}

/// Move a previously archived row back to `cold`.
pub fn restore(index: &IndexHandle, seq: u64) -> Result<(), MaintenanceError> {
    Ok(index.restore(seq)?)
}

/// The maintenance entry point into full-chain verification (§4.3),
/// optionally re-checking each entry's content blob against its declared
/// hash.
pub fn verify(chain: &ChainStore, config: &ChainConfig, check_content: bool) -> Result<mnemo_chain::VerificationReport, mnemo_chain::ChainError> {
    chain.verify_chain(config, check_content)
}

/// Outcome of [`run_hourly_maintenance`].
#[derive(Debug, Clone, Copy)]
pub struct HourlyMaintenanceResult {
    /// Result of the decay-tier pass.
    pub decay: DecayUpdateResult,
}

/// The lightweight pass meant to run on an hourly cadence (§2): just the
/// decay-tier transition, which is cheap and keeps `hot`/`warm`/`cold`
/// current for retrieval scoring. Never touches the chain or CAS.
pub fn run_hourly_maintenance(
    index: &IndexHandle,
    thresholds: DecayThresholds,
    now: Timestamp,
) -> Result<HourlyMaintenanceResult, MaintenanceError> {
    let decay = update_decay_tiers(index, thresholds, now)?;
    Ok(HourlyMaintenanceResult { decay })
}

/// Outcome of [`run_weekly_maintenance`].
#[derive(Debug, Clone, Copy)]
pub struct WeeklyMaintenanceResult {
    /// Result of the decay-tier pass that precedes GC.
    pub decay: DecayUpdateResult,
    /// Result of the GC pass.
    pub gc: GcResult,
}

/// The heavier pass meant to run on a weekly cadence (§2): refresh decay
/// tiers first (so GC scores reflect current tiers), then run GC. Both
/// sub-passes are index-only.
pub fn run_weekly_maintenance(
    index: &IndexHandle,
    thresholds: DecayThresholds,
    gc_config: &GcConfig,
    now: Timestamp,
) -> Result<WeeklyMaintenanceResult, MaintenanceError> {
    let decay = update_decay_tiers(index, thresholds, now)?;
    let gc = run_gc(index, gc_config, now)?;
    Ok(WeeklyMaintenanceResult { decay, gc })
}

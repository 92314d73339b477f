//! Hybrid retrieval scoring, token budgeting and prompt formatting.
//!
//! Every scoring/estimation function here is pure; the only I/O is the
//! handful of [`mnemo_index::IndexHandle`] queries `retrieve`/
//! `retrieve_context` issue to assemble their candidate universe. This
//! crate deliberately depends on `mnemo-index` alone, not `mnemo-cas` or
//! `mnemo-chain`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use mnemo_core::time::Timestamp;
use mnemo_index::{DecayTier, IndexHandle, IndexError, Memory};
use std::{cell::Cell, collections::HashMap};

const SECONDS_PER_DAY: f64 = 86_400.0;
const RECENCY_HALF_LIFE_DAYS: f64 = 7.0;
const FOURTEEN_DAYS_MS: i64 = 14 * 86_400_000;
const CONTEXT_IMPORTANCE_SEED_THRESHOLD: f64 = 0.6;
const FTS_CANDIDATE_CAP: usize = 200;
const RECENT_CANDIDATE_CAP: usize = 200;

const HYBRID_WEIGHT_FTS: f64 = 0.40;
const HYBRID_WEIGHT_RECENCY: f64 = 0.30;
const HYBRID_WEIGHT_IMPORTANCE: f64 = 0.20;
const HYBRID_WEIGHT_ACCESS: f64 = 0.10;

const CONTEXT_WEIGHT_RECENCY: f64 = 0.5;
const CONTEXT_WEIGHT_IMPORTANCE: f64 = 0.35;
const CONTEXT_WEIGHT_ACCESS: f64 = 0.15;

/// Estimate the token cost of `text` with a fast, tokenizer-free heuristic.
/// Returns 0 for empty input, otherwise at least 1.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let mut ascii = 0u64;
    let mut non_ascii = 0u64;
    let mut punctuation = 0u64;
    for c in text.chars() {
        if c.is_ascii() {
            ascii += 1;
            if c.is_ascii_punctuation() {
                punctuation += 1;
            }
        } else {
            non_ascii += 1;
        }
    }
    let word_count = text.split_whitespace().count() as f64;

    let base = if is_code_like(text) {
        ascii as f64 / 3.0 + non_ascii as f64 / 1.5
    } else {
        ascii as f64 / 4.0 + non_ascii as f64 / 1.5
    };
    let mut estimate = base.max(0.8 * word_count);
    estimate += 0.3 * punctuation as f64;
    let rounded = estimate.ceil() as u64;
    rounded.max(1)
}

const CODE_KEYWORDS: &[&str] = &[
    "fn ", "def ", "class ", "function ", "const ", "let ", "import ", "return ", "struct ",
    "impl ", "pub ", "public ", "private ", "var ",
];

/// Heuristically detect source-code-like text: a fenced code block, a
/// mixture of brace/bracket/arrow punctuation, or a recognized keyword at
/// the start of a line.
fn is_code_like(text: &str) -> bool {
    if text.contains("```") {
        return true;
    }
    let brace_like = text
        .chars()
        .filter(|c| matches!(c, '{' | '}' | '[' | ']' | ';'))
        .count();
    let has_arrow = text.contains("=>") || text.contains("->");
    if brace_like >= 4 && has_arrow {
        return true;
    }
    for line in text.lines() {
        let trimmed = line.trim_start();
        if CODE_KEYWORDS.iter().any(|kw| trimmed.starts_with(kw)) {
            return true;
        }
    }
    false
}

fn is_zero_width(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200D}' | '\u{FEFF}' | '\u{2060}')
}

fn is_combining_mark(c: char) -> bool {
    matches!(c, '\u{0300}'..='\u{036F}' | '\u{1AB0}'..='\u{1AFF}' | '\u{20D0}'..='\u{20FF}')
}

/// Strip zero-width characters, combining marks and control characters,
/// then keep only letters, numbers, apostrophes and hyphens; split on
/// whitespace and drop empty tokens.
pub fn sanitize_query(query: &str) -> Vec<String> {
    let mut cleaned = String::with_capacity(query.len());
    for c in query.chars() {
        if is_zero_width(c) || is_combining_mark(c) || c.is_control() {
            continue;
        }
        if c.is_alphanumeric() || c == '\'' || c == '-' {
            cleaned.push(c);
        } else {
            cleaned.push(' ');
        }
    }
    cleaned.split_whitespace().map(|s| s.to_string()).filter(|s| !s.is_empty()).collect()
}

/// Exponential recency decay with a seven-day half-life.
pub fn recency_score(created_at: Timestamp, now: Timestamp) -> f64 {
    let age_days = (now.as_millis() - created_at.as_millis()).max(0) as f64 / 1000.0 / SECONDS_PER_DAY;
    (-age_days * std::f64::consts::LN_2 / RECENCY_HALF_LIFE_DAYS).exp()
}

/// Normalize raw FTS ranks (lower is a better match) to `[0, 1]` where 1 is
/// best. A single-result set is treated as the degenerate best match.
fn normalize_fts_ranks(raw: &HashMap<u64, f64>) -> HashMap<u64, f64> {
    if raw.is_empty() {
        return HashMap::new();
    }
    if raw.len() == 1 {
        return raw.keys().map(|&seq| (seq, 1.0)).collect();
    }
    let min = raw.values().cloned().fold(f64::INFINITY, f64::min);
    let max = raw.values().cloned().fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < f64::EPSILON {
        return raw.keys().map(|&seq| (seq, 1.0)).collect();
    }
    raw.iter().map(|(&seq, &rank)| (seq, (max - rank) / (max - min))).collect()
}

/// `access / max(1, max_access_in_universe)`.
pub fn access_norm(access_count: u64, max_access: u64) -> f64 {
    access_count as f64 / (max_access.max(1) as f64)
}

/// Decay-tier multiplier applied to the base hybrid/context score.
pub fn decay_weight(tier: DecayTier) -> f64 {
    match tier {
        DecayTier::Hot => 1.0,
        DecayTier::Warm => 0.7,
        DecayTier::Cold => 0.4,
        DecayTier::Archived => 0.0,
    }
}

/// Caller-supplied filters applied after scoring, per §4.5.
#[derive(Debug, Clone, Default)]
pub struct RetrievalFilters {
    /// If set, only these entry-type strings are retained.
    pub types: Option<Vec<String>>,
    /// If set, only these tier strings are retained.
    pub tiers: Option<Vec<String>>,
    /// If set, rows below this importance are dropped.
    pub min_importance: Option<f64>,
}

impl RetrievalFilters {
    fn admits(&self, memory: &Memory) -> bool {
        if let Some(types) = &self.types {
            if !types.iter().any(|t| t == &memory.entry_type) {
                return false;
            }
        }
        if let Some(tiers) = &self.tiers {
            if !tiers.iter().any(|t| t == &memory.tier) {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if memory.importance < min {
                return false;
            }
        }
        true
    }
}

/// Options shared by `retrieve` and `retrieve_context`.
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    /// Filters applied after scoring.
    pub filters: RetrievalFilters,
    /// Number of leading, post-filter results to skip.
    pub offset: usize,
    /// Maximum number of results to consider for paging (before token budgeting).
    pub max_results: usize,
    /// Token budget for the packed result; packing stops at first non-admission.
    pub max_tokens: u64,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self { filters: RetrievalFilters::default(), offset: 0, max_results: 20, max_tokens: 2000 }
    }
}

/// A memory with its computed retrieval score.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    /// The underlying row.
    pub memory: Memory,
    /// Final score after decay-tier weighting.
    pub score: f64,
}

/// Call-local token budget: a single-threaded, single-call ledger. Nothing
/// here is shared across threads, so a `Cell` suffices in place of an
/// atomic counter.
struct TokenBudget {
    max_tokens: u64,
    used: Cell<u64>,
}

impl TokenBudget {
    fn new(max_tokens: u64) -> Self {
        Self { max_tokens, used: Cell::new(0) }
    }

    /// Admit `tokens` if doing so would not exceed the budget; returns
    /// whether admission happened.
    fn try_admit(&self, tokens: u64) -> bool {
        let used = self.used.get();
        if used + tokens <= self.max_tokens {
            self.used.set(used + tokens);
            true
        } else {
            false
        }
    }
}

fn text_for_budget(memory: &Memory) -> &str {
    memory.summary.as_deref().unwrap_or(memory.content.as_str())
}

/// Apply filters, page, then greedily pack into `max_tokens`, stopping at
/// the first memory that would not fit (never skipping ahead to a smaller
/// one), and finally bump `access_count`/`last_accessed` on every admitted
/// row.
fn finish(
    index: &IndexHandle,
    mut candidates: Vec<ScoredMemory>,
    options: &RetrieveOptions,
    now: Timestamp,
) -> Result<Vec<ScoredMemory>, IndexError> {
    candidates.retain(|c| options.filters.admits(&c.memory));
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let paged: Vec<ScoredMemory> = candidates
        .into_iter()
        .skip(options.offset)
        .take(options.max_results)
        .collect();

    let budget = TokenBudget::new(options.max_tokens);
    let mut admitted = Vec::with_capacity(paged.len());
    for scored in paged {
        let tokens = estimate_tokens(text_for_budget(&scored.memory));
        if !budget.try_admit(tokens) {
            break;
        }
        admitted.push(scored);
    }

    for scored in &admitted {
        index.update_access(scored.memory.seq, now)?;
    }
    Ok(admitted)
}

fn base_hybrid_score(fts_norm: f64, recency: f64, importance: f64, access: f64) -> f64 {
    HYBRID_WEIGHT_FTS * fts_norm
        + HYBRID_WEIGHT_RECENCY * recency
        + HYBRID_WEIGHT_IMPORTANCE * importance
        + HYBRID_WEIGHT_ACCESS * access
}

fn base_context_score(recency: f64, importance: f64, access: f64) -> f64 {
    CONTEXT_WEIGHT_RECENCY * recency + CONTEXT_WEIGHT_IMPORTANCE * importance + CONTEXT_WEIGHT_ACCESS * access
}

/// Keyword-seeded hybrid retrieval: FTS matches unioned with the last two
/// weeks of entries, scored per §4.5's hybrid weights, filtered, paged,
/// token-budgeted, and access-counted.
pub fn retrieve(
    index: &IndexHandle,
    query: &str,
    options: &RetrieveOptions,
    now: Timestamp,
) -> Result<Vec<ScoredMemory>, IndexError> {
    let tokens = sanitize_query(query);
    let raw_ranks: HashMap<u64, f64> = if tokens.is_empty() {
        HashMap::new()
    } else {
        index.search_fts(&tokens, FTS_CANDIDATE_CAP)?.into_iter().collect()
    };
    let fts_norm = normalize_fts_ranks(&raw_ranks);

    let since = Timestamp::from_millis(now.as_millis() - FOURTEEN_DAYS_MS);
    let recent = index.recent_since(since, RECENT_CANDIDATE_CAP)?;

    let mut universe: HashMap<u64, Memory> = HashMap::new();
    for m in recent {
        universe.insert(m.seq, m);
    }
    for &seq in raw_ranks.keys() {
        if !universe.contains_key(&seq) {
            if let Some(m) = index.get(seq)? {
                universe.insert(seq, m);
            }
        }
    }

    let max_access = index.max_access_count()?;
    let candidates: Vec<ScoredMemory> = universe
        .into_values()
        .map(|memory| {
            let fts = fts_norm.get(&memory.seq).copied().unwrap_or(0.0);
            let recency = recency_score(memory.created_at, now);
            let access = access_norm(memory.access_count, max_access);
            let base = base_hybrid_score(fts, recency, memory.importance, access);
            let score = base * decay_weight(memory.decay_tier);
            ScoredMemory { memory, score }
        })
        .collect();

    finish(index, candidates, options, now)
}

/// Query-free context retrieval: seeds from the last two weeks plus any
/// memory with `importance >= 0.6`, scored per §4.5's context weights.
pub fn retrieve_context(
    index: &IndexHandle,
    options: &RetrieveOptions,
    now: Timestamp,
) -> Result<Vec<ScoredMemory>, IndexError> {
    let since = Timestamp::from_millis(now.as_millis() - FOURTEEN_DAYS_MS);
    let recent = index.recent_since(since, RECENT_CANDIDATE_CAP)?;
    let important = index.high_importance(CONTEXT_IMPORTANCE_SEED_THRESHOLD, RECENT_CANDIDATE_CAP)?;

    let mut universe: HashMap<u64, Memory> = HashMap::new();
    for m in recent.into_iter().chain(important.into_iter()) {
        universe.insert(m.seq, m);
    }

    let max_access = index.max_access_count()?;
    let candidates: Vec<ScoredMemory> = universe
        .into_values()
        .map(|memory| {
            let recency = recency_score(memory.created_at, now);
            let access = access_norm(memory.access_count, max_access);
            let base = base_context_score(recency, memory.importance, access);
            let score = base * decay_weight(memory.decay_tier);
            ScoredMemory { memory, score }
        })
        .collect();

    finish(index, candidates, options, now)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Render a ranked result list as a Markdown bullet list suitable for
/// prompt injection, or an empty string if `memories` is empty.
pub fn format_for_prompt(memories: &[ScoredMemory]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Relevant memories\n");
    for scored in memories {
        let label = capitalize(&scored.memory.entry_type);
        let text = scored.memory.summary.as_deref().unwrap_or(scored.memory.content.as_str());
        out.push_str(&format!("- [{}] {}\n", label, text));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_index::NewMemory;

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn empty_text_estimates_zero_tokens() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn plain_prose_is_at_least_one_token() {
        assert!(estimate_tokens("hi") >= 1);
    }

    #[test]
    fn code_like_text_uses_denser_estimate() {
        let code = "```rust\nfn main() {\n    let x = 1;\n}\n```";
        let prose = "a".repeat(code.chars().filter(|c| c.is_ascii()).count());
        assert!(estimate_tokens(code) >= estimate_tokens(&prose) / 2);
    }

    #[test]
    fn sanitize_strips_symbols_and_splits_whitespace() {
        let tokens = sanitize_query("  hello,  world! don't-stop\u{200B} ");
        assert_eq!(tokens, vec!["hello".to_string(), "world".to_string(), "don't-stop".to_string()]);
    }

    #[test]
    fn sanitize_all_symbols_yields_empty() {
        assert!(sanitize_query("@#$%^&*()").is_empty());
    }

    #[test]
    fn recency_score_decays_with_age() {
        let now = ts(30 * 86_400_000);
        let fresh = recency_score(ts(29 * 86_400_000), now);
        let old = recency_score(ts(0), now);
        assert!(fresh > old);
        assert!((recency_score(now, now) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn decay_weight_matches_tiers() {
        assert_eq!(decay_weight(DecayTier::Hot), 1.0);
        assert_eq!(decay_weight(DecayTier::Warm), 0.7);
        assert_eq!(decay_weight(DecayTier::Cold), 0.4);
        assert_eq!(decay_weight(DecayTier::Archived), 0.0);
    }

    #[test]
    fn fts_normalization_degenerate_single_result() {
        let mut raw = HashMap::new();
        raw.insert(1u64, -3.2);
        assert_eq!(normalize_fts_ranks(&raw)[&1], 1.0);
    }

    #[test]
    fn retrieve_packs_until_budget_exhausted_then_stops() {
        let index = IndexHandle::open_in_memory().unwrap();
        for seq in 0..3u64 {
            index
                .insert(NewMemory::default_for(
                    seq,
                    "word ".repeat(50),
                    "memory".to_string(),
                    "ephemeral".to_string(),
                    ts(0),
                ))
                .unwrap();
        }
        let options = RetrieveOptions { max_tokens: 15, max_results: 10, ..RetrieveOptions::default() };
        let result = retrieve_context(&index, &options, ts(1)).unwrap();
        assert!(result.len() <= 1);
    }

    #[test]
    fn retrieve_bumps_access_count_on_admission() {
        let index = IndexHandle::open_in_memory().unwrap();
        index
            .insert(NewMemory::default_for(0, "hello world".to_string(), "memory".to_string(), "ephemeral".to_string(), ts(0)))
            .unwrap();
        let options = RetrieveOptions::default();
        let result = retrieve_context(&index, &options, ts(1000)).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(index.get(0).unwrap().unwrap().access_count, 1);
    }

    #[test]
    fn format_for_prompt_empty_list_is_empty_string() {
        assert_eq!(format_for_prompt(&[]), "");
    }

    #[test]
    fn filters_drop_non_matching_types() {
        let index = IndexHandle::open_in_memory().unwrap();
        index
            .insert(NewMemory::default_for(0, "a decision was made".to_string(), "decision".to_string(), "ephemeral".to_string(), ts(0)))
            .unwrap();
        index
            .insert(NewMemory::default_for(1, "a memory was kept".to_string(), "memory".to_string(), "ephemeral".to_string(), ts(0)))
            .unwrap();
        let options = RetrieveOptions {
            filters: RetrievalFilters { types: Some(vec!["decision".to_string()]), ..Default::default() },
            ..RetrieveOptions::default()
        };
        let result = retrieve_context(&index, &options, ts(1000)).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].memory.entry_type, "decision");
    }
}

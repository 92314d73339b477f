//! Extractive, model-free text summarization.
//!
//! Every function here is pure and allocation-only: no model calls, no I/O.
//! Sentence and entity boundaries are found with `regex` pattern matching
//! rather than a rule-transform engine.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s)]+").unwrap());
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\w.+-]+@[\w-]+\.[\w.-]+").unwrap());
static CAPITALIZED_PHRASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-zA-Z']*(?:\s+[A-Z][a-zA-Z']*)*\b").unwrap());

const SENTENCE_ABBREVIATIONS: &[&str] =
    &["mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e", "inc", "ltd"];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "that", "this", "with", "from", "was", "were", "are", "is", "be", "been",
    "has", "have", "had", "not", "but", "you", "your", "they", "their", "them", "his", "her",
    "she", "him", "its", "our", "ours", "who", "what", "when", "where", "why", "how", "all", "any",
    "can", "will", "would", "could", "should", "about", "into", "over", "than", "then", "there",
    "these", "those",
];

const SINGULAR_PRONOUNS: &[&str] = &["he", "she", "him", "her", "his", "hers"];

/// Split `text` into sentences on `.`, `!`, `?`, treating a small set of
/// common abbreviations (`Mr.`, `Dr.`, `vs.`, `etc.`, ...) as non-terminal.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;

    for i in 0..chars.len() {
        let (idx, c) = chars[i];
        if c != '.' && c != '!' && c != '?' {
            continue;
        }
        let next_is_boundary = chars.get(i + 1).map(|&(_, nc)| nc.is_whitespace()).unwrap_or(true);
        if !next_is_boundary {
            continue;
        }
        if c == '.' {
            let preceding_word = text[start..idx]
                .rsplit(char::is_whitespace)
                .next()
                .unwrap_or("")
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if SENTENCE_ABBREVIATIONS.contains(&preceding_word.as_str()) {
                continue;
            }
        }
        let end = idx + c.len_utf8();
        let sentence = text[start..end].trim().to_string();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = end;
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

/// Extract capitalized phrases, email addresses, and URLs, in order of
/// first appearance, deduplicated.
pub fn extract_entities(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for m in URL_RE.find_iter(text).chain(EMAIL_RE.find_iter(text)).chain(CAPITALIZED_PHRASE_RE.find_iter(text)) {
        let s = m.as_str().to_string();
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    out
}

/// Map each singular pronoun's byte offset in `text` to the nearest
/// preceding capitalized-phrase "name" in reading order, skipping phrases
/// that open a sentence (likely not personal names).
pub fn pronoun_referents(text: &str) -> Vec<(usize, String)> {
    let mut referents = Vec::new();
    let mut last_name: Option<String> = None;
    let mut cursor = 0usize;

    let mut boundaries: Vec<usize> = vec![0];
    for (idx, c) in text.char_indices() {
        if c == '.' || c == '!' || c == '?' {
            boundaries.push(idx + c.len_utf8());
        }
    }

    for m in CAPITALIZED_PHRASE_RE.find_iter(text) {
        while cursor < text.len() {
            if let Some((word_start, word)) = next_word(text, cursor) {
                if word_start >= m.start() {
                    break;
                }
                let lower = word.to_lowercase();
                if SINGULAR_PRONOUNS.contains(&lower.as_str()) {
                    if let Some(name) = &last_name {
                        referents.push((word_start, name.clone()));
                    }
                }
                cursor = word_start + word.len();
            } else {
                break;
            }
        }

        let is_multi_word = m.as_str().contains(' ');
        let at_sentence_start = boundaries.iter().any(|&b| {
            text[b..m.start()].chars().all(char::is_whitespace)
        });
        if is_multi_word || !at_sentence_start {
            last_name = Some(m.as_str().to_string());
        }
    }
    while let Some((word_start, word)) = next_word(text, cursor) {
        let lower = word.to_lowercase();
        if SINGULAR_PRONOUNS.contains(&lower.as_str()) {
            if let Some(name) = &last_name {
                referents.push((word_start, name.clone()));
            }
        }
        cursor = word_start + word.len();
    }
    referents
}

fn next_word(text: &str, from: usize) -> Option<(usize, &str)> {
    let rest = &text[from..];
    let word_start_rel = rest.find(|c: char| c.is_alphanumeric())?;
    let word_start = from + word_start_rel;
    let word_rel_end = rest[word_start_rel..].find(|c: char| !c.is_alphanumeric() && c != '\'').unwrap_or(rest.len() - word_start_rel);
    Some((word_start, &text[word_start..word_start + word_rel_end]))
}

fn top_keywords(text: &str, n: usize) -> HashSet<String> {
    let mut freq: HashMap<String, u32> = HashMap::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.len() < 3 {
            continue;
        }
        let lower = word.to_lowercase();
        if STOPWORDS.contains(&lower.as_str()) {
            continue;
        }
        *freq.entry(lower).or_insert(0) += 1;
    }
    let mut pairs: Vec<(String, u32)> = freq.into_iter().collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    pairs.into_iter().take(n).map(|(w, _)| w).collect()
}

fn score_sentence(sentence: &str, index: usize, total: usize, keywords: &HashSet<String>, preserve_entities: bool) -> f64 {
    let overlap = sentence
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .filter(|w| keywords.contains(&w.to_lowercase()))
        .count() as f64;
    let position_boost = if index == 0 || index + 1 == total { 1.0 } else { 0.0 };
    let entity_bonus = if preserve_entities { extract_entities(sentence).len() as f64 * 0.5 } else { 0.0 };
    overlap + position_boost + entity_bonus
}

/// Produce a shorter variant of `text` without invoking a model: split into
/// sentences, score by keyword overlap / position / optional entity
/// presence, greedily select under `max_chars`, restore original order, and
/// append an ellipsis if any sentence was dropped. Text already within
/// budget is returned unchanged.
pub fn summarize(text: &str, max_chars: usize, preserve_entities: bool) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return text.chars().take(max_chars).collect::<String>() + "...";
    }

    let keywords = top_keywords(text, 10);
    let mut scored: Vec<(usize, f64)> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| (i, score_sentence(s, i, sentences.len(), &keywords, preserve_entities)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));

    let mut selected = Vec::new();
    let mut total_chars = 0usize;
    let mut dropped_any = false;
    for (i, _) in scored {
        let len = sentences[i].chars().count();
        let with_separator = if selected.is_empty() { len } else { len + 1 };
        if total_chars + with_separator <= max_chars {
            selected.push(i);
            total_chars += with_separator;
        } else {
            dropped_any = true;
        }
    }

    selected.sort_unstable();
    let mut result = selected.iter().map(|&i| sentences[i].as_str()).collect::<Vec<_>>().join(" ");
    if dropped_any {
        result.push_str("...");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_returned_unchanged() {
        let text = "Short text.";
        assert_eq!(summarize(text, 100, false), text);
    }

    #[test]
    fn sentence_split_respects_abbreviations() {
        let sentences = split_sentences("Dr. Smith met Mr. Jones. They talked about taxes.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].starts_with("Dr. Smith met Mr. Jones."));
    }

    #[test]
    fn summary_preserves_original_sentence_order() {
        let text = "Alpha beta gamma delta. The weather was calm and mild today in the valley region. \
            Gamma delta alpha beta occurs again here for emphasis and repetition testing purposes. \
            Final remark about alpha and gamma wraps everything up at the end.";
        let summary = summarize(text, 60, false);
        assert!(summary.ends_with("...") || summary.chars().count() <= 60);
    }

    #[test]
    fn extract_entities_finds_names_emails_urls() {
        let text = "Alice Johnson emailed bob@example.com and shared https://example.com/doc";
        let entities = extract_entities(text);
        assert!(entities.iter().any(|e| e == "Alice Johnson"));
        assert!(entities.iter().any(|e| e == "bob@example.com"));
        assert!(entities.iter().any(|e| e.starts_with("https://")));
    }

    #[test]
    fn pronoun_referents_map_to_nearest_preceding_name() {
        let text = "Alice Johnson walked to the store. She bought milk.";
        let referents = pronoun_referents(text);
        assert!(referents.iter().any(|(_, name)| name == "Alice Johnson"));
    }

    #[test]
    fn empty_text_is_returned_unchanged() {
        assert_eq!(summarize("", 10, false), "");
    }
}

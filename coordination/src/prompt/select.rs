//! Similarity-ranked context selection under a token budget.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::{CacheError, LruCache};

type TermVector = HashMap<String, f64>;

/// Rough token count: `ceil(len / 4)`, at least 1.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4).max(1)
}

/// Picks the context chunks most similar to a prompt that fit in
/// `max_tokens`. Term vectors are memoized in a bounded LRU.
pub struct ContextSelector {
    vectors: Mutex<LruCache<String, Arc<TermVector>>>,
}

impl ContextSelector {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        let vectors = LruCache::new(capacity).ok_or(CacheError::ZeroCapacity {
            pool: "context_vectors",
        })?;
        Ok(Self {
            vectors: Mutex::new(vectors),
        })
    }

    /// Append the best-matching chunks to `prompt`.
    ///
    /// Chunks are ranked by cosine similarity and added greedily, skipping
    /// any that would overflow the budget. The prompt is returned unchanged
    /// when it alone exhausts `max_tokens` or no chunk fits.
    pub fn select<S: AsRef<str>>(&self, prompt: &str, chunks: &[S], max_tokens: usize) -> String {
        let prompt_tokens = estimate_tokens(prompt);
        if max_tokens <= prompt_tokens {
            return prompt.to_string();
        }

        let prompt_vector = self.vector(prompt);
        let mut ranked: Vec<(f64, &str)> = chunks
            .iter()
            .map(|chunk| {
                let chunk = chunk.as_ref();
                (similarity(&prompt_vector, &self.vector(chunk)), chunk)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut used = prompt_tokens;
        let mut selected = Vec::new();
        for (_, chunk) in ranked {
            let tokens = estimate_tokens(chunk);
            if used + tokens > max_tokens {
                continue;
            }
            used += tokens;
            selected.push(chunk);
        }

        if selected.is_empty() {
            return prompt.to_string();
        }
        format!("{prompt}\n\nContext:\n{}", selected.join("\n---\n"))
    }

    /// Precompute vectors for `key: value` pairs.
    pub fn warm<'a>(&self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (key, value) in pairs {
            self.vector(&format!("{key}: {value}"));
        }
    }

    pub fn cache_size(&self) -> usize {
        self.vectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn vector(&self, text: &str) -> Arc<TermVector> {
        let key = text.trim().to_string();
        let mut vectors = self.vectors.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(vector) = vectors.get(&key) {
            return Arc::clone(vector);
        }
        let vector = Arc::new(term_vector(&key));
        vectors.put(key, Arc::clone(&vector));
        vector
    }
}

// Unit-length bag-of-words vector.
fn term_vector(text: &str) -> TermVector {
    let mut counts: TermVector = HashMap::new();
    for token in text.to_lowercase().split_whitespace() {
        *counts.entry(token.to_string()).or_default() += 1.0;
    }
    let magnitude = counts.values().map(|c| c * c).sum::<f64>().sqrt();
    if magnitude > 0.0 {
        for value in counts.values_mut() {
            *value /= magnitude;
        }
    }
    counts
}

fn similarity(a: &TermVector, b: &TermVector) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(term, weight)| large.get(term).map(|other| weight * other))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_prefers_similar_chunks() {
        let selector = ContextSelector::new(16).unwrap();
        let chunks = [
            "weather report sunny skies",
            "icms tax rate for invoices",
            "football scores",
        ];
        let out = selector.select("icms tax on invoices", &chunks, 14);

        assert!(out.starts_with("icms tax on invoices\n\nContext:\n"));
        assert!(out.contains("icms tax rate for invoices"));
        assert!(!out.contains("weather"));
    }

    #[test]
    fn test_prompt_unchanged_when_budget_exhausted() {
        let selector = ContextSelector::new(4).unwrap();
        let prompt = "a fairly long prompt that uses the budget";
        assert_eq!(selector.select(prompt, &["chunk"], 3), prompt);
        assert_eq!(
            selector.select("short", &["this chunk is much too long to fit"], 3),
            "short"
        );
    }

    #[test]
    fn test_vectors_are_memoized_and_bounded() {
        let selector = ContextSelector::new(2).unwrap();
        selector.warm([("cfop", "5102"), ("ncm", "8471")]);
        assert_eq!(selector.cache_size(), 2);
        selector.warm([("cst", "00")]);
        assert_eq!(selector.cache_size(), 2);
        assert!(ContextSelector::new(0).is_err());
    }
}

//! BM25 keyword index.
//!
//! Pure Rust implementation of Okapi BM25 scoring over an in-memory corpus.
//! The index is built once (from documents or a directory) and is read-only
//! afterwards.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Result, TermpalError};

use super::{SearchIndex, Snippet};

/// BM25 tuning parameters.
const K1: f32 = 1.2;
const B: f32 = 0.75;

/// Scores are divided by `query_terms * MAX_BM25_SCORE_PER_TERM` and clamped
/// to `0.0..=1.0` so a fixed `min_score` threshold means the same thing for
/// every query length.
const MAX_BM25_SCORE_PER_TERM: f32 = 3.0;

/// File extensions picked up by [`Bm25Index::from_dir`].
const TEXT_EXTENSIONS: &[&str] = &["md", "txt", "rst", "org"];

struct Document {
    source: String,
    text: String,
    term_freqs: HashMap<String, u32>,
    length: u32,
}

/// In-memory BM25 index.
#[derive(Default)]
pub struct Bm25Index {
    docs: Vec<Document>,
    /// term -> number of documents containing it
    doc_freqs: HashMap<String, u32>,
}

/// Tokenize text into lowercase alphanumeric terms of at least two characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_string())
        .collect()
}

/// Split a document into paragraphs separated by blank lines.
fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                out.push(current.trim_end().to_string());
            }
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim_end().to_string());
    }
    out
}

impl Bm25Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one document.
    pub fn add_document(&mut self, source: impl Into<String>, text: impl Into<String>) {
        let text = text.into();
        let tokens = tokenize(&text);
        let mut term_freqs: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *term_freqs.entry(token.clone()).or_insert(0) += 1;
        }
        for term in term_freqs.keys() {
            *self.doc_freqs.entry(term.clone()).or_insert(0) += 1;
        }
        self.docs.push(Document {
            source: source.into(),
            text,
            term_freqs,
            length: tokens.len() as u32,
        });
    }

    /// Index every text file under `dir`, one document per paragraph.
    ///
    /// Sources look like `guide/setup.md#2` (paragraph 2 of that file).
    /// Unreadable files are skipped with a warning.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut index = Self::new();
        let mut files = Vec::new();
        for ext in TEXT_EXTENSIONS {
            let pattern = dir.join(format!("**/*.{}", ext));
            let paths = glob::glob(&pattern.to_string_lossy()).map_err(|e| {
                TermpalError::Config(format!("invalid docs dir pattern: {}", e))
            })?;
            files.extend(paths.flatten().filter(|p| p.is_file()));
        }
        files.sort();

        for file in files {
            let text = match std::fs::read_to_string(&file) {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "Skipping unreadable document");
                    continue;
                }
            };
            let rel = file
                .strip_prefix(dir)
                .unwrap_or(&file)
                .to_string_lossy()
                .to_string();
            for (n, para) in paragraphs(&text).into_iter().enumerate() {
                index.add_document(format!("{}#{}", rel, n + 1), para);
            }
        }
        debug!(documents = index.len(), dir = %dir.display(), "Built BM25 index");
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn avg_doc_length(&self) -> f32 {
        if self.docs.is_empty() {
            return 1.0;
        }
        let total: u32 = self.docs.iter().map(|d| d.length).sum();
        (total as f32 / self.docs.len() as f32).max(1.0)
    }

    fn score(&self, doc: &Document, query_terms: &[String], avg_dl: f32) -> f32 {
        if doc.length == 0 {
            return 0.0;
        }
        let n = self.docs.len().max(1) as f32;
        let doc_len = doc.length as f32;

        let mut score = 0.0f32;
        for term in query_terms {
            let tf = *doc.term_freqs.get(term).unwrap_or(&0) as f32;
            if tf == 0.0 {
                continue;
            }
            // IDF: log((N - df + 0.5) / (df + 0.5) + 1)
            let df = *self.doc_freqs.get(term).unwrap_or(&0) as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            let tf_norm = (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * doc_len / avg_dl));
            score += idf * tf_norm;
        }

        let max_possible = query_terms.len() as f32 * MAX_BM25_SCORE_PER_TERM;
        (score / max_possible).clamp(0.0, 1.0)
    }

    /// Top `k` documents for `query`, best first. Ties keep insertion order.
    pub fn top_k(&self, query: &str, k: usize) -> Vec<Snippet> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || k == 0 {
            return Vec::new();
        }
        let avg_dl = self.avg_doc_length();
        let mut scored: Vec<(usize, f32)> = self
            .docs
            .iter()
            .enumerate()
            .map(|(i, doc)| (i, self.score(doc, &query_terms, avg_dl)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(k)
            .map(|(i, score)| Snippet {
                source: self.docs[i].source.clone(),
                text: self.docs[i].text.clone(),
                score,
            })
            .collect()
    }
}

#[async_trait]
impl SearchIndex for Bm25Index {
    fn name(&self) -> &str {
        "bm25"
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<Snippet>> {
        Ok(self.top_k(query, k))
    }
}

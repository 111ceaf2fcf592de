//! Document retrieval over a directory of plain-text research notes.

use crate::error::{MarketContextError, Result};
use crate::utils::Period;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

const PAGE_BREAK: char = '\u{000C}';
const DOCUMENT_EXTENSIONS: [&str; 3] = ["txt", "md", "text"];
const MAX_THEMES: usize = 5;

const THEME_KEYWORDS: &[(&str, &[&str])] = &[
    ("market volatility", &["volatility", "volatile", "uncertainty", "fluctuation"]),
    ("economic resilience", &["resilience", "resilient", "stable", "recovery"]),
    ("sector rotation", &["rotation", "sector", "outperform", "underperform"]),
    ("geopolitical factors", &["geopolitical", "trade", "tariff", "sanctions"]),
    ("monetary policy", &["fed", "federal reserve", "interest rates", "monetary"]),
    ("inflation concerns", &["inflation", "cpi", "price", "deflation"]),
    ("technology growth", &["technology", "tech", "ai", "innovation"]),
    ("consumer spending", &["consumer", "spending", "retail", "consumption"]),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub source_id: String,
    /// 1-based page within the source document.
    pub page_number: u32,
    pub relevance_score: f32,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, period: &Period, top_k: usize) -> Result<Vec<RetrievedChunk>>;

    /// Whether any documents are loaded. Reported by the health endpoint.
    fn is_indexed(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
struct IndexedChunk {
    text: String,
    source_id: String,
    page_number: u32,
    terms: BTreeSet<String>,
}

/// In-memory index of paragraph chunks scored by query-term overlap.
///
/// Pages are separated by form feeds and chunks by blank lines.
#[derive(Debug, Clone, Default)]
pub struct KeywordIndex {
    chunks: Vec<IndexedChunk>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&mut self, source_id: &str, text: &str) -> usize {
        let before = self.chunks.len();
        for (page_idx, page) in text.split(PAGE_BREAK).enumerate() {
            for paragraph in split_paragraphs(page) {
                self.chunks.push(IndexedChunk {
                    terms: tokenize(&paragraph).collect(),
                    text: paragraph,
                    source_id: source_id.to_string(),
                    page_number: page_idx as u32 + 1,
                });
            }
        }
        self.chunks.len() - before
    }

    /// Indexes every `.txt`/`.md` file in `dir`, in file-name order.
    /// A missing directory yields an empty index.
    pub async fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut index = Self::new();

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Document directory {} does not exist, index is empty", dir.display());
                return Ok(index);
            }
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_document = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| DOCUMENT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if is_document && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
                MarketContextError::Retrieval(format!("failed to read {}: {}", path.display(), e))
            })?;
            let source_id = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let added = index.add_document(&source_id, &text);
            debug!("Indexed {}: {} chunks", source_id, added);
        }

        info!("Loaded {} chunks from {}", index.len(), dir.display());
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn search(&self, query: &str, top_k: usize) -> Vec<RetrievedChunk> {
        let query_terms: BTreeSet<String> = tokenize(query).collect();
        if query_terms.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(f32, &IndexedChunk)> = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let hits = query_terms.intersection(&chunk.terms).count();
                (hits > 0).then(|| (hits as f32 / query_terms.len() as f32, chunk))
            })
            .collect();

        // stable: ties keep document order
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        scored
            .into_iter()
            .take(top_k)
            .map(|(score, chunk)| RetrievedChunk {
                text: chunk.text.clone(),
                source_id: chunk.source_id.clone(),
                page_number: chunk.page_number,
                relevance_score: score,
            })
            .collect()
    }
}

pub fn retrieval_query(period: &Period) -> String {
    format!("market trends analysis {}", period)
}

#[async_trait]
impl Retriever for KeywordIndex {
    async fn retrieve(&self, period: &Period, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        let query = retrieval_query(period);
        let results = self.search(&query, top_k);
        debug!("Query '{}' matched {} chunks", query, results.len());
        Ok(results)
    }

    fn is_indexed(&self) -> bool {
        !self.is_empty()
    }
}

/// Up to five themes whose keywords appear in the retrieved text, in a fixed
/// order. Single-word keywords match whole words; phrases match as substrings.
pub fn extract_key_themes<S: AsRef<str>>(texts: &[S]) -> Vec<String> {
    let combined = texts
        .iter()
        .map(|t| t.as_ref().to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    let words: BTreeSet<String> = tokenize(&combined).collect();

    THEME_KEYWORDS
        .iter()
        .filter(|(_, keywords)| {
            keywords.iter().any(|keyword| {
                if keyword.contains(' ') {
                    combined.contains(keyword)
                } else {
                    words.contains(*keyword)
                }
            })
        })
        .map(|(theme, _)| theme.to_string())
        .take(MAX_THEMES)
        .collect()
}

fn split_paragraphs(page: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in page.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(line.trim());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }
    paragraphs
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

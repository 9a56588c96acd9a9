//! In-process vector store with hybrid retrieval.
//!
//! Chunks are keyed by namespace (one per run) and carry typed metadata.
//! Ranking combines a semantic score (cosine over L2-normalized
//! embeddings) and a keyword-overlap score as
//! `alpha * semantic + (1 - alpha) * keyword`, with ties broken by recency
//! of insertion. Chunks whose embedding could not be computed participate
//! in the keyword score only.
//!
//! Writes are serialized behind an internal lock; reads operate on cloned
//! snapshots and may run concurrently.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// What a chunk describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// Source contract: method source, signature, javadoc, preconditions.
    Contract,
    /// Ingested bug-report prose.
    BugReport,
}

/// Metadata stored with every chunk and returned with every hit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub kind: Option<ChunkKind>,
    /// Fully-qualified class the chunk belongs to, for contract chunks.
    pub target_class: Option<String>,
    /// Display form of the owning target id, for method-level chunks.
    pub target_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source_path: Option<PathBuf>,
    /// 1-based inclusive line range in `source_path`.
    pub line_range: Option<(u32, u32)>,
    pub javadoc: Option<String>,
    /// Checked preconditions (null checks, boundary checks).
    #[serde(default)]
    pub preconditions: Vec<String>,
    /// Error kinds the code raises.
    #[serde(default)]
    pub raised_errors: Vec<String>,
}

/// A stored chunk. `embedding == None` marks `embedding_missing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: String,
    pub namespace: String,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub metadata: ChunkMetadata,
    /// Insertion sequence number; larger is more recent.
    pub seq: u64,
}

/// Filter predicate for retrieval.
#[derive(Debug, Clone, Default)]
pub struct RetrievalFilters {
    pub kind: Option<ChunkKind>,
    pub target_class: Option<String>,
    /// Match chunks carrying at least one of these tags.
    pub tags_any: Vec<String>,
}

impl RetrievalFilters {
    fn matches(&self, chunk: &StoredChunk) -> bool {
        if let Some(kind) = self.kind
            && chunk.metadata.kind != Some(kind)
        {
            return false;
        }
        if let Some(class) = &self.target_class
            && chunk.metadata.target_class.as_deref() != Some(class.as_str())
        {
            return false;
        }
        if !self.tags_any.is_empty()
            && !self
                .tags_any
                .iter()
                .any(|t| chunk.metadata.tags.iter().any(|c| c == t))
        {
            return false;
        }
        true
    }
}

/// A retrieval hit.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub text: String,
    pub score: f64,
    pub metadata: ChunkMetadata,
}

#[derive(Default, Serialize, Deserialize)]
struct Inner {
    chunks: Vec<StoredChunk>,
    next_seq: u64,
}

/// The store itself. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct VectorStore {
    inner: Mutex<Inner>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a chunk and returns its id. Writes are serialized.
    pub fn insert(
        &self,
        namespace: &str,
        text: String,
        embedding: Option<Vec<f32>>,
        metadata: ChunkMetadata,
    ) -> String {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update(seq.to_le_bytes());
        hasher.update(text.as_bytes());
        let id = format!("{:x}", hasher.finalize());

        inner.chunks.push(StoredChunk {
            id: id.clone(),
            namespace: namespace.to_string(),
            text,
            embedding,
            metadata,
            seq,
        });
        id
    }

    /// Number of chunks in a namespace.
    pub fn count(&self, namespace: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.chunks.iter().filter(|c| c.namespace == namespace).count()
    }

    /// Top-`k` chunks ranked by `alpha * semantic + (1 - alpha) * keyword`.
    ///
    /// Zero hits return an empty list, never an error. Ties are broken by
    /// recency of insertion.
    pub fn retrieve(
        &self,
        namespace: &str,
        query_text: &str,
        query_embedding: Option<&[f32]>,
        filters: &RetrievalFilters,
        k: usize,
        alpha: f64,
    ) -> Vec<RetrievedChunk> {
        let candidates: Vec<StoredChunk> = {
            let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner
                .chunks
                .iter()
                .filter(|c| c.namespace == namespace && filters.matches(c))
                .cloned()
                .collect()
        };

        let query_tokens = tokenize(query_text);
        let mut scored: Vec<(f64, u64, StoredChunk)> = candidates
            .into_iter()
            .map(|chunk| {
                let semantic = match (query_embedding, &chunk.embedding) {
                    (Some(q), Some(c)) => cosine(q, c),
                    // embedding_missing chunks score on keywords alone
                    _ => 0.0,
                };
                let keyword = keyword_overlap(&query_tokens, &chunk.text);
                let score = alpha * semantic + (1.0 - alpha) * keyword;
                (score, chunk.seq, chunk)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });

        scored
            .into_iter()
            .take(k)
            .map(|(score, _, chunk)| RetrievedChunk {
                text: chunk.text,
                score,
                metadata: chunk.metadata,
            })
            .collect()
    }

    /// Deletes every chunk in `namespace`. Idempotent.
    pub fn clear_namespace(&self, namespace: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let before = inner.chunks.len();
        inner.chunks.retain(|c| c.namespace != namespace);
        debug!(
            namespace,
            removed = before - inner.chunks.len(),
            "cleared namespace"
        );
    }

    /// Persists the store as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let json = serde_json::to_string_pretty(&*inner)
            .map_err(|e| Error::SandboxIo(format!("serialize vector store: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Loads a store previously written by [`save`](Self::save). A missing
    /// file yields an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        let inner: Inner = serde_json::from_str(&content)
            .map_err(|e| Error::SandboxIo(format!("corrupt vector store: {e}")))?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }
}

/// Cosine similarity clamped to `[0, 1]`. Inputs are L2-normalized, so the
/// dot product is the cosine.
fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    f64::from(dot).max(0.0)
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fraction of query tokens present in the chunk text.
fn keyword_overlap(query_tokens: &[String], text: &str) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let chunk_tokens: std::collections::HashSet<String> = tokenize(text).into_iter().collect();
    let hits = query_tokens
        .iter()
        .filter(|t| chunk_tokens.contains(*t))
        .count();
    hits as f64 / query_tokens.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(kind: ChunkKind, class: Option<&str>, tags: &[&str]) -> ChunkMetadata {
        ChunkMetadata {
            kind: Some(kind),
            target_class: class.map(str::to_string),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn keyword_only_ranking_prefers_matching_text() {
        let store = VectorStore::new();
        store.insert(
            "run",
            "boundary check on quantity less than zero".into(),
            None,
            meta(ChunkKind::BugReport, None, &[]),
        );
        store.insert(
            "run",
            "unrelated race condition in scheduler".into(),
            None,
            meta(ChunkKind::BugReport, None, &[]),
        );

        let hits = store.retrieve(
            "run",
            "quantity boundary",
            None,
            &RetrievalFilters::default(),
            2,
            0.0,
        );
        assert_eq!(hits.len(), 2);
        assert!(hits[0].text.contains("boundary check"));
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn semantic_component_uses_embeddings() {
        let store = VectorStore::new();
        store.insert(
            "run",
            "a".into(),
            Some(vec![1.0, 0.0]),
            ChunkMetadata::default(),
        );
        store.insert(
            "run",
            "b".into(),
            Some(vec![0.0, 1.0]),
            ChunkMetadata::default(),
        );

        let hits = store.retrieve(
            "run",
            "zzz",
            Some(&[1.0, 0.0]),
            &RetrievalFilters::default(),
            1,
            1.0,
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "a");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn hybrid_blends_both_scores() {
        let store = VectorStore::new();
        // Strong semantic, no keyword match.
        store.insert(
            "run",
            "nothing in common".into(),
            Some(vec![1.0, 0.0]),
            ChunkMetadata::default(),
        );
        // No semantic signal, perfect keyword match.
        store.insert("run", "exact query words".into(), None, ChunkMetadata::default());

        // alpha 0.7: semantic-only chunk scores 0.7, keyword-only 0.3.
        let hits = store.retrieve(
            "run",
            "exact query words",
            Some(&[1.0, 0.0]),
            &RetrievalFilters::default(),
            2,
            0.7,
        );
        assert_eq!(hits[0].text, "nothing in common");
        assert!((hits[0].score - 0.7).abs() < 1e-6);
        assert!((hits[1].score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn ties_break_by_recency() {
        let store = VectorStore::new();
        store.insert(
            "run",
            "same text".into(),
            None,
            meta(ChunkKind::BugReport, None, &["older"]),
        );
        store.insert(
            "run",
            "same text".into(),
            None,
            meta(ChunkKind::BugReport, None, &["newer"]),
        );

        let hits = store.retrieve(
            "run",
            "same text",
            None,
            &RetrievalFilters::default(),
            2,
            0.0,
        );
        // Identical scores: the more recent insertion ranks first.
        assert_eq!(hits[0].metadata.tags, vec!["newer"]);
        assert_eq!(hits[1].metadata.tags, vec!["older"]);
    }

    #[test]
    fn filters_restrict_kind_class_and_tags() {
        let store = VectorStore::new();
        store.insert(
            "run",
            "contract for Calc".into(),
            None,
            meta(ChunkKind::Contract, Some("com.math.Calc"), &[]),
        );
        store.insert(
            "run",
            "boundary bug report".into(),
            None,
            meta(ChunkKind::BugReport, None, &["boundary", "validation"]),
        );

        let contracts = store.retrieve(
            "run",
            "calc",
            None,
            &RetrievalFilters {
                kind: Some(ChunkKind::Contract),
                target_class: Some("com.math.Calc".into()),
                tags_any: vec![],
            },
            10,
            0.0,
        );
        assert_eq!(contracts.len(), 1);
        assert!(contracts[0].text.contains("contract"));

        let tagged = store.retrieve(
            "run",
            "bug",
            None,
            &RetrievalFilters {
                kind: None,
                target_class: None,
                tags_any: vec!["boundary".into()],
            },
            10,
            0.0,
        );
        assert_eq!(tagged.len(), 1);
        assert!(tagged[0].text.contains("boundary"));

        let none = store.retrieve(
            "run",
            "bug",
            None,
            &RetrievalFilters {
                tags_any: vec!["overflow".into()],
                ..Default::default()
            },
            10,
            0.0,
        );
        assert!(none.is_empty());
    }

    #[test]
    fn clear_namespace_is_idempotent() {
        let store = VectorStore::new();
        store.insert("a", "x".into(), None, ChunkMetadata::default());
        store.insert("b", "y".into(), None, ChunkMetadata::default());

        store.clear_namespace("a");
        store.clear_namespace("a");
        assert_eq!(store.count("a"), 0);
        assert_eq!(store.count("b"), 1);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.json");

        let store = VectorStore::new();
        store.insert(
            "run",
            "persisted".into(),
            Some(vec![0.5, 0.5]),
            meta(ChunkKind::Contract, Some("com.x.Y"), &["tag"]),
        );
        store.save(&path).unwrap();

        let loaded = VectorStore::load(&path).unwrap();
        assert_eq!(loaded.count("run"), 1);
        let hits = loaded.retrieve(
            "run",
            "persisted",
            None,
            &RetrievalFilters::default(),
            1,
            0.0,
        );
        assert_eq!(hits[0].metadata.target_class.as_deref(), Some("com.x.Y"));
    }

    #[test]
    fn load_missing_file_gives_empty_store() {
        let store = VectorStore::load(Path::new("/nonexistent/covolve/chunks.json")).unwrap();
        assert_eq!(store.count("run"), 0);
    }
}

//! Knowledge base: retrieval-augmented context for generation prompts.
//!
//! Answers one question: what should the LLM see when generating tests or
//! mutants for a target? Source contracts and bug reports are chunked,
//! embedded, and stored in an in-process vector store with hybrid
//! (semantic + keyword) retrieval.
//!
//! With `knowledge.enabled = false` every retrieval returns an empty list
//! and nothing is indexed; prompts then omit their context section.
//!
//! Per-chunk indexing failures never abort the run: a chunk whose
//! embedding cannot be computed after retries is stored without one
//! (`embedding_missing`) and participates in keyword scoring only.

pub mod bugs;
pub mod chunk;
pub mod embed;
pub mod store;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::KnowledgeConfig;
use crate::error::{Result, with_backoff};
use crate::model::Target;

pub use bugs::BugReport;
pub use store::{ChunkKind, ChunkMetadata, RetrievalFilters, RetrievedChunk};

/// The retrieval layer of one run.
pub struct KnowledgeBase {
    enabled: bool,
    alpha: f64,
    token_budget: usize,
    namespace: String,
    embedder: Arc<dyn embed::EmbeddingProvider>,
    store: store::VectorStore,
    /// Chunks whose embedding could not be computed after retries.
    embedding_misses: AtomicUsize,
}

impl KnowledgeBase {
    /// Builds the knowledge base for a run. The namespace isolates this
    /// run's chunks; [`clear`](Self::clear) removes them.
    pub fn new(config: &KnowledgeConfig, namespace: impl Into<String>) -> Result<Self> {
        Ok(Self {
            enabled: config.enabled,
            alpha: config.alpha,
            token_budget: config.chunk_token_budget,
            namespace: namespace.into(),
            embedder: embed::create_embedding_provider(&config.embedding)?,
            store: store::VectorStore::new(),
            embedding_misses: AtomicUsize::new(0),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Indexes one target's source contract: a single method-granular
    /// chunk (bodies are never split, however long).
    pub async fn index_source(&self, target: &Target) {
        if !self.enabled {
            return;
        }
        let text = chunk::method_chunk(target);
        let embedding = self.embed_or_mark_missing(&text).await;

        let mut preconditions = target.facts.null_checks.clone();
        preconditions.extend(target.facts.boundary_checks.iter().cloned());

        self.store.insert(
            &self.namespace,
            text,
            embedding,
            ChunkMetadata {
                kind: Some(ChunkKind::Contract),
                target_class: Some(target.id.class_fqn.clone()),
                target_id: Some(target.id.to_string()),
                tags: Vec::new(),
                source_path: Some(target.source_file.clone()),
                line_range: Some((target.line_start, target.line_end)),
                javadoc: target.javadoc.clone(),
                preconditions,
                raised_errors: target.facts.exception_handling.clone(),
            },
        );
    }

    /// Indexes parsed bug reports, one prose chunk per heading-bounded
    /// window.
    pub async fn index_bug_reports(&self, reports: &[BugReport]) {
        if !self.enabled {
            return;
        }
        for report in reports {
            for section in &report.sections {
                let text = format!("{}\n{}", section.heading, section.body);
                for piece in chunk::prose_chunks(&text, self.token_budget) {
                    let embedding = self.embed_or_mark_missing(&piece).await;
                    self.store.insert(
                        &self.namespace,
                        piece,
                        embedding,
                        ChunkMetadata {
                            kind: Some(ChunkKind::BugReport),
                            tags: report.tags.clone(),
                            source_path: Some(report.path.clone()),
                            ..Default::default()
                        },
                    );
                }
            }
            debug!(report = %report.title, tags = ?report.tags, "bug report indexed");
        }
    }

    /// Top-`k` chunks for a query. Returns an empty list when the layer is
    /// disabled or nothing matches; never an error.
    pub async fn retrieve(
        &self,
        query: &str,
        filters: &RetrievalFilters,
        k: usize,
    ) -> Vec<RetrievedChunk> {
        if !self.enabled || k == 0 {
            return Vec::new();
        }
        // A query that cannot be embedded still retrieves by keyword.
        let query_embedding = self.embed_or_mark_missing(query).await;
        self.store.retrieve(
            &self.namespace,
            query,
            query_embedding.as_deref(),
            filters,
            k,
            self.alpha,
        )
    }

    /// Deletes this run's namespace. Idempotent.
    pub fn clear(&self) {
        self.store.clear_namespace(&self.namespace);
    }

    /// Writes the chunk store to disk for inspection and audit.
    pub fn persist(&self, path: &std::path::Path) -> Result<()> {
        self.store.save(path)
    }

    /// Chunks indexed so far.
    pub fn chunk_count(&self) -> usize {
        self.store.count(&self.namespace)
    }

    /// Chunks stored without an embedding.
    pub fn embedding_miss_count(&self) -> usize {
        self.embedding_misses.load(Ordering::Relaxed)
    }

    async fn embed_or_mark_missing(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = Arc::clone(&self.embedder);
        let result = with_backoff(Duration::from_millis(200), || {
            let embedder = Arc::clone(&embedder);
            let text = text.to_string();
            async move { embedder.embed(&text).await }
        })
        .await;

        match result {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                self.embedding_misses.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error_kind = e.kind(),
                    provider = self.embedder.name(),
                    "embedding unavailable, chunk limited to keyword scoring"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalyzerFacts, TargetId};
    use std::path::Path;

    fn config(enabled: bool) -> KnowledgeConfig {
        KnowledgeConfig {
            enabled,
            ..Default::default()
        }
    }

    fn sample_target() -> Target {
        Target {
            id: TargetId::new("com.shop.Inventory", "addStock", ["String", "int"]),
            source_file: "src/main/java/com/shop/Inventory.java".into(),
            line_start: 20,
            line_end: 28,
            signature: "public void addStock(String productId, int quantity)".into(),
            javadoc: Some("Adds stock; rejects negative quantities.".into()),
            source_text: "if (quantity < 0) throw new IllegalArgumentException();".into(),
            collaborators: vec!["StockRepository".into()],
            facts: AnalyzerFacts {
                null_checks: vec!["productId".into()],
                boundary_checks: vec!["quantity < 0".into()],
                exception_handling: vec!["IllegalArgumentException".into()],
                method_calls: vec![],
                cyclomatic_complexity: 2,
            },
        }
    }

    #[tokio::test]
    async fn disabled_layer_indexes_nothing_and_retrieves_nothing() {
        let kb = KnowledgeBase::new(&config(false), "run").unwrap();
        kb.index_source(&sample_target()).await;
        assert_eq!(kb.chunk_count(), 0);

        let hits = kb
            .retrieve("addStock quantity", &RetrievalFilters::default(), 5)
            .await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn contract_chunks_carry_facts_as_metadata() {
        let kb = KnowledgeBase::new(&config(true), "run").unwrap();
        kb.index_source(&sample_target()).await;
        assert_eq!(kb.chunk_count(), 1);

        let hits = kb
            .retrieve(
                "addStock quantity boundary",
                &RetrievalFilters {
                    kind: Some(ChunkKind::Contract),
                    target_class: Some("com.shop.Inventory".into()),
                    tags_any: vec![],
                },
                5,
            )
            .await;
        assert_eq!(hits.len(), 1);
        let meta = &hits[0].metadata;
        assert_eq!(meta.line_range, Some((20, 28)));
        assert!(meta.preconditions.iter().any(|p| p == "quantity < 0"));
        assert_eq!(meta.raised_errors, vec!["IllegalArgumentException"]);
        assert_eq!(
            meta.source_path.as_deref(),
            Some(Path::new("src/main/java/com/shop/Inventory.java"))
        );
    }

    #[tokio::test]
    async fn bug_reports_are_retrievable_by_tag() {
        let kb = KnowledgeBase::new(&config(true), "run").unwrap();
        let report = bugs::parse_bug_report(
            Path::new("BUG-002.md"),
            "---\ntags: [boundary]\n---\n## Problem\n\nQuantity zero slips through the check.\n",
        );
        kb.index_bug_reports(&[report]).await;

        let hits = kb
            .retrieve(
                "boundary flipped on quantity",
                &RetrievalFilters {
                    kind: Some(ChunkKind::BugReport),
                    target_class: None,
                    tags_any: vec!["boundary".into()],
                },
                3,
            )
            .await;
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("Quantity zero"));
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let kb = KnowledgeBase::new(&config(true), "run").unwrap();
        kb.index_source(&sample_target()).await;
        kb.clear();
        kb.clear();
        assert_eq!(kb.chunk_count(), 0);
    }
}

//! The retrieval backend interface.
//!
//! The embedded vector store and document ingestion live outside this
//! system; the pipeline only depends on this trait. The in-memory
//! implementation exists for tests and for the forced-RAG development mode.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub page_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Document {
    pub fn new(page_content: impl Into<String>) -> Self {
        Self {
            page_content: page_content.into(),
            source: None,
        }
    }
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Top-k documents for a similarity query.
    async fn retrieve(&self, query: &str, k: usize) -> Vec<Document>;
}

/// Naive term-overlap scorer over a fixed document set.
#[derive(Default)]
pub struct InMemoryKnowledge {
    documents: Vec<Document>,
}

impl InMemoryKnowledge {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    pub fn add(&mut self, document: Document) {
        self.documents.push(document);
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledge {
    async fn retrieve(&self, query: &str, k: usize) -> Vec<Document> {
        let query_terms: Vec<String> = query
            .split_whitespace()
            .map(|term| term.to_lowercase())
            .collect();

        let mut scored: Vec<(usize, &Document)> = self
            .documents
            .iter()
            .map(|document| {
                let haystack = document.page_content.to_lowercase();
                let score = query_terms
                    .iter()
                    .filter(|term| haystack.contains(term.as_str()))
                    .count();
                (score, document)
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(k)
            .map(|(_, document)| document.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retrieval_prefers_documents_sharing_terms() {
        let knowledge = InMemoryKnowledge::new(vec![
            Document::new("the sky is blue"),
            Document::new("compilers lower IR to machine code"),
        ]);

        let docs = knowledge.retrieve("why is the sky blue", 1).await;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].page_content, "the sky is blue");
    }
}

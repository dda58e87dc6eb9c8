use async_trait::async_trait;

use crate::core::errors::ChatError;

/// A long-term memory fragment retrieved for the current turn.
#[derive(Debug, Clone)]
pub struct MemoryFragment {
    pub content: String,
    pub relevance: f32,
    pub source: String,
}

/// Optional hook for vector-retrieved long-term memory (tier 3).
///
/// No retriever ships by default; when none is wired in, the memory tier is
/// simply skipped.
#[async_trait]
pub trait MemoryRetriever: Send + Sync {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<MemoryFragment>, ChatError>;
}

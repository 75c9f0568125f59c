//! Retrieval boundary used for persona guidance injection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;

/// A chunk of a reference document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: u64,
    /// Name of the document this fragment came from
    pub document: String,
    pub content: String,
}

/// Embedding plus similarity search over reference documents.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Embed a query string.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;

    /// Ranked fragment ids, most similar first, restricted to `documents`.
    async fn search(
        &self,
        vector: &[f32],
        documents: &[String],
        limit: usize,
    ) -> Result<Vec<u64>, RetrievalError>;

    /// Load fragments by id, in the order given.
    async fn fragments(&self, ids: &[u64]) -> Result<Vec<Fragment>, RetrievalError>;
}

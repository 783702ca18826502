use crate::error::StoreError;
use crate::models::{Chunk, Document, DocumentRef, DocumentStatus, RetrievalCandidate, Visibility};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Binary storage keyed by a boundary-resolved reference.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn fetch(&self, document: &DocumentRef) -> Result<Vec<u8>, StoreError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, visibility: Visibility, id: Uuid) -> Result<Document, StoreError>;

    /// Compare-and-set: moves `id` from `expected` to `next` and reports
    /// whether the write happened. Refuses transitions the state machine
    /// does not sanction.
    async fn transition_status(
        &self,
        visibility: Visibility,
        id: Uuid,
        expected: DocumentStatus,
        next: DocumentStatus,
    ) -> Result<bool, StoreError>;

    async fn store_extraction(
        &self,
        visibility: Visibility,
        id: Uuid,
        text: &str,
        page_boundaries: &[usize],
    ) -> Result<(), StoreError>;

    async fn mark_error(
        &self,
        visibility: Visibility,
        id: Uuid,
        detail: &str,
    ) -> Result<(), StoreError>;

    async fn schedule_retry(
        &self,
        visibility: Visibility,
        id: Uuid,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Documents awaiting chunking: status `extracted`, cooldown elapsed,
    /// oldest-updated first.
    async fn list_chunk_pending(
        &self,
        visibility: Visibility,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;

    /// Documents awaiting embeddings: status `chunked`, cooldown elapsed,
    /// oldest-updated first.
    async fn list_embed_pending(
        &self,
        visibility: Visibility,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<(), StoreError>;

    async fn count_for_document(
        &self,
        visibility: Visibility,
        document_id: Uuid,
    ) -> Result<usize, StoreError>;

    /// Chunks still lacking an embedding, in `chunk_index` order. This is
    /// the retry selector: a partially-embedded document re-enters here.
    async fn chunks_missing_embedding(
        &self,
        visibility: Visibility,
        document_id: Uuid,
    ) -> Result<Vec<Chunk>, StoreError>;

    /// Persist one chunk's vector. Independent of its siblings; a set
    /// embedding is immutable.
    async fn store_embedding(
        &self,
        visibility: Visibility,
        chunk_id: &str,
        embedding: &[f32],
    ) -> Result<(), StoreError>;

    /// Ranked nearest-neighbor candidates for a query vector, most
    /// relevant first. The index itself is an external service.
    async fn similarity_search(
        &self,
        visibility: Visibility,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<RetrievalCandidate>, StoreError>;
}

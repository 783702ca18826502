use crate::error::StoreError;
use crate::models::{
    Chunk, Document, DocumentRef, DocumentStatus, RetrievalCandidate, Visibility,
};
use crate::traits::{BlobStore, ChunkStore, DocumentStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// In-process implementation of every store boundary. Backs the test
/// suite and offline runs; the REST store speaks to the real services.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    blobs: HashMap<(Visibility, String), Vec<u8>>,
    documents: HashMap<(Visibility, Uuid), Document>,
    chunks: HashMap<(Visibility, Uuid), Vec<Chunk>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_blob(&self, visibility: Visibility, storage_key: &str, bytes: Vec<u8>) {
        let mut state = self.inner.lock().await;
        state
            .blobs
            .insert((visibility, storage_key.to_string()), bytes);
    }

    pub async fn insert_document(&self, document: Document) {
        let mut state = self.inner.lock().await;
        state
            .documents
            .insert((document.visibility, document.id), document);
    }

    pub async fn document(&self, visibility: Visibility, id: Uuid) -> Option<Document> {
        let state = self.inner.lock().await;
        state.documents.get(&(visibility, id)).cloned()
    }

    pub async fn chunks(&self, visibility: Visibility, document_id: Uuid) -> Vec<Chunk> {
        let state = self.inner.lock().await;
        state
            .chunks
            .get(&(visibility, document_id))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlobStore for MemoryStateStore {
    async fn fetch(&self, document: &DocumentRef) -> Result<Vec<u8>, StoreError> {
        let state = self.inner.lock().await;
        state
            .blobs
            .get(&(document.visibility, document.storage_key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("blob {}", document.storage_key)))
    }
}

#[async_trait]
impl DocumentStore for MemoryStateStore {
    async fn get(&self, visibility: Visibility, id: Uuid) -> Result<Document, StoreError> {
        let state = self.inner.lock().await;
        state
            .documents
            .get(&(visibility, id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))
    }

    async fn transition_status(
        &self,
        visibility: Visibility,
        id: Uuid,
        expected: DocumentStatus,
        next: DocumentStatus,
    ) -> Result<bool, StoreError> {
        if !expected.can_transition_to(next) {
            return Ok(false);
        }

        let mut state = self.inner.lock().await;
        let document = state
            .documents
            .get_mut(&(visibility, id))
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))?;

        if document.status != expected {
            return Ok(false);
        }

        document.status = next;
        document.updated_at = Utc::now();
        if expected == DocumentStatus::Error {
            document.error_detail = None;
        }
        if matches!(
            next,
            DocumentStatus::Extracted | DocumentStatus::Chunked | DocumentStatus::Embedded
        ) {
            document.retry_count = 0;
            document.next_attempt_at = None;
        }

        Ok(true)
    }

    async fn store_extraction(
        &self,
        visibility: Visibility,
        id: Uuid,
        text: &str,
        page_boundaries: &[usize],
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let document = state
            .documents
            .get_mut(&(visibility, id))
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))?;

        document.extracted_text = Some(text.to_string());
        document.page_boundaries = page_boundaries.to_vec();
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_error(
        &self,
        visibility: Visibility,
        id: Uuid,
        detail: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let document = state
            .documents
            .get_mut(&(visibility, id))
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))?;

        document.status = DocumentStatus::Error;
        document.error_detail = Some(detail.to_string());
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn schedule_retry(
        &self,
        visibility: Visibility,
        id: Uuid,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let document = state
            .documents
            .get_mut(&(visibility, id))
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))?;

        document.retry_count = retry_count;
        document.next_attempt_at = Some(next_attempt_at);
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn list_chunk_pending(
        &self,
        visibility: Visibility,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.list_by_status(visibility, DocumentStatus::Extracted, now, limit)
            .await
    }

    async fn list_embed_pending(
        &self,
        visibility: Visibility,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.list_by_status(visibility, DocumentStatus::Chunked, now, limit)
            .await
    }
}

impl MemoryStateStore {
    async fn list_by_status(
        &self,
        visibility: Visibility,
        status: DocumentStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let state = self.inner.lock().await;
        let mut matching: Vec<Document> = state
            .documents
            .values()
            .filter(|document| {
                document.visibility == visibility
                    && document.status == status
                    && document.ready_at(now)
            })
            .cloned()
            .collect();

        matching.sort_by_key(|document| document.updated_at);
        matching.truncate(limit);
        Ok(matching)
    }
}

#[async_trait]
impl ChunkStore for MemoryStateStore {
    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        for chunk in chunks {
            state
                .chunks
                .entry((chunk.visibility, chunk.document_id))
                .or_default()
                .push(chunk.clone());
        }
        Ok(())
    }

    async fn count_for_document(
        &self,
        visibility: Visibility,
        document_id: Uuid,
    ) -> Result<usize, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .chunks
            .get(&(visibility, document_id))
            .map_or(0, Vec::len))
    }

    async fn chunks_missing_embedding(
        &self,
        visibility: Visibility,
        document_id: Uuid,
    ) -> Result<Vec<Chunk>, StoreError> {
        let state = self.inner.lock().await;
        let mut missing: Vec<Chunk> = state
            .chunks
            .get(&(visibility, document_id))
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|chunk| chunk.embedding.is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        missing.sort_by_key(|chunk| chunk.chunk_index);
        Ok(missing)
    }

    async fn store_embedding(
        &self,
        visibility: Visibility,
        chunk_id: &str,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        for chunks in state.chunks.values_mut() {
            if let Some(chunk) = chunks
                .iter_mut()
                .find(|chunk| chunk.visibility == visibility && chunk.id == chunk_id)
            {
                // once set, an embedding is immutable
                if chunk.embedding.is_none() {
                    chunk.embedding = Some(embedding.to_vec());
                }
                return Ok(());
            }
        }
        Err(StoreError::NotFound(format!("chunk {chunk_id}")))
    }

    async fn similarity_search(
        &self,
        visibility: Visibility,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<RetrievalCandidate>, StoreError> {
        let state = self.inner.lock().await;
        let mut candidates: Vec<RetrievalCandidate> = state
            .chunks
            .iter()
            .filter(|((chunk_visibility, _), _)| *chunk_visibility == visibility)
            .flat_map(|(_, chunks)| chunks.iter())
            .filter_map(|chunk| {
                chunk.embedding.as_ref().map(|embedding| RetrievalCandidate {
                    chunk: chunk.clone(),
                    relevance_score: cosine(query_vector, embedding),
                })
            })
            .collect();

        candidates.sort_by(|left, right| {
            right
                .relevance_score
                .total_cmp(&left.relevance_score)
        });
        candidates.truncate(limit);
        Ok(candidates)
    }
}

fn cosine(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm: f32 = left.iter().map(|a| a * a).sum::<f32>().sqrt();
    let right_norm: f32 = right.iter().map(|b| b * b).sum::<f32>().sqrt();

    if left_norm == 0.0 || right_norm == 0.0 {
        0.0
    } else {
        dot / (left_norm * right_norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transition_is_a_compare_and_set() {
        let store = MemoryStateStore::new();
        let document = Document::new(Visibility::Private, "docs/a.pdf");
        let id = document.id;
        store.insert_document(document).await;

        let moved = store
            .transition_status(
                Visibility::Private,
                id,
                DocumentStatus::Pending,
                DocumentStatus::Extracting,
            )
            .await
            .expect("store reachable");
        assert!(moved);

        // stale expectation loses the race
        let stale = store
            .transition_status(
                Visibility::Private,
                id,
                DocumentStatus::Pending,
                DocumentStatus::Extracting,
            )
            .await
            .expect("store reachable");
        assert!(!stale);

        // Extracting -> Pending is the sanctioned failure drop
        let failure_drop = store
            .transition_status(
                Visibility::Private,
                id,
                DocumentStatus::Extracting,
                DocumentStatus::Pending,
            )
            .await
            .expect("store reachable");
        assert!(failure_drop);

        let really_backward = store
            .transition_status(
                Visibility::Private,
                id,
                DocumentStatus::Pending,
                DocumentStatus::Pending,
            )
            .await
            .expect("store reachable");
        assert!(!really_backward);
    }

    #[tokio::test]
    async fn embeddings_are_write_once() {
        let store = MemoryStateStore::new();
        let document_id = Uuid::new_v4();
        let chunk = Chunk {
            id: "c1".to_string(),
            document_id,
            visibility: Visibility::Public,
            chunk_index: 0,
            content: "text".to_string(),
            token_count: 1,
            embedding: None,
            section_title: String::new(),
            summary: String::new(),
            keywords: Vec::new(),
            start_char: 0,
            end_char: 4,
            page_number: None,
        };
        store.insert_chunks(&[chunk]).await.expect("insert");

        store
            .store_embedding(Visibility::Public, "c1", &[1.0, 0.0])
            .await
            .expect("first write");
        store
            .store_embedding(Visibility::Public, "c1", &[0.0, 1.0])
            .await
            .expect("second write is a no-op");

        let chunks = store.chunks(Visibility::Public, document_id).await;
        assert_eq!(chunks[0].embedding, Some(vec![1.0, 0.0]));
    }

    #[tokio::test]
    async fn similarity_search_ranks_by_cosine() {
        let store = MemoryStateStore::new();
        let document_id = Uuid::new_v4();
        let base = Chunk {
            id: String::new(),
            document_id,
            visibility: Visibility::Private,
            chunk_index: 0,
            content: String::new(),
            token_count: 1,
            embedding: None,
            section_title: String::new(),
            summary: String::new(),
            keywords: Vec::new(),
            start_char: 0,
            end_char: 0,
            page_number: None,
        };

        let mut aligned = base.clone();
        aligned.id = "aligned".to_string();
        aligned.embedding = Some(vec![1.0, 0.0]);
        let mut oblique = base.clone();
        oblique.id = "oblique".to_string();
        oblique.chunk_index = 1;
        oblique.embedding = Some(vec![0.7, 0.7]);
        let mut unembedded = base;
        unembedded.id = "unembedded".to_string();
        unembedded.chunk_index = 2;

        store
            .insert_chunks(&[aligned, oblique, unembedded])
            .await
            .expect("insert");

        let hits = store
            .similarity_search(Visibility::Private, &[1.0, 0.0], 10)
            .await
            .expect("search");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "aligned");
        assert!(hits[0].relevance_score > hits[1].relevance_score);
    }

    #[tokio::test]
    async fn pending_lists_respect_cooldown_and_order() {
        let store = MemoryStateStore::new();
        let now = Utc::now();

        let mut stale = Document::new(Visibility::Private, "docs/stale.pdf");
        stale.status = DocumentStatus::Extracted;
        stale.updated_at = now - chrono::Duration::minutes(10);
        let stale_id = stale.id;

        let mut fresh = Document::new(Visibility::Private, "docs/fresh.pdf");
        fresh.status = DocumentStatus::Extracted;
        fresh.updated_at = now - chrono::Duration::minutes(1);

        let mut cooling = Document::new(Visibility::Private, "docs/cooling.pdf");
        cooling.status = DocumentStatus::Extracted;
        cooling.updated_at = now - chrono::Duration::minutes(30);
        cooling.next_attempt_at = Some(now + chrono::Duration::minutes(5));

        store.insert_document(stale).await;
        store.insert_document(fresh).await;
        store.insert_document(cooling).await;

        let pending = store
            .list_chunk_pending(Visibility::Private, now, 10)
            .await
            .expect("list");

        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, stale_id);
    }
}

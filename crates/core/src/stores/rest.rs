use crate::error::StoreError;
use crate::models::{
    Chunk, Document, DocumentRef, DocumentStatus, RetrievalCandidate, Visibility,
};
use crate::traits::{BlobStore, ChunkStore, DocumentStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// JSON-over-HTTP state store speaking a PostgREST-compatible dialect:
/// one documents table and one chunks table per visibility class, filters
/// in the query string, and a stored procedure for similarity search.
#[derive(Clone)]
pub struct RestStateStore {
    endpoint: String,
    service_key: Option<String>,
    client: reqwest::Client,
}

impl RestStateStore {
    pub fn new(
        endpoint: &str,
        service_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let parsed = Url::parse(endpoint)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: parsed.as_str().trim_end_matches('/').to_string(),
            service_key,
            client,
        })
    }

    fn documents_table(visibility: Visibility) -> &'static str {
        match visibility {
            Visibility::Private => "private_documents",
            Visibility::Public => "public_documents",
        }
    }

    fn chunks_table(visibility: Visibility) -> &'static str {
        match visibility {
            Visibility::Private => "private_chunks",
            Visibility::Public => "public_chunks",
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.endpoint)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.service_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    fn cooldown_filter(now: DateTime<Utc>) -> String {
        format!(
            "(next_attempt_at.is.null,next_attempt_at.lte.{})",
            now.to_rfc3339()
        )
    }

    async fn list_pending(
        &self,
        visibility: Visibility,
        status: DocumentStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let response = self
            .authorize(self.client.get(self.url(Self::documents_table(visibility))))
            .query(&[
                ("status", format!("eq.{status}")),
                ("or", Self::cooldown_filter(now)),
                ("order", "updated_at.asc".to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;

        let response = ensure_success(response, "state-store")?;
        Ok(response.json().await?)
    }

    async fn patch_document(
        &self,
        visibility: Visibility,
        id: Uuid,
        body: serde_json::Value,
    ) -> Result<(), StoreError> {
        let response = self
            .authorize(self.client.patch(self.url(Self::documents_table(visibility))))
            .query(&[("id", format!("eq.{id}"))])
            .header("prefer", "return=representation")
            .json(&body)
            .send()
            .await?;

        let response = ensure_success(response, "state-store")?;
        let rows: Vec<serde_json::Value> = response.json().await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(format!("document {id}")));
        }
        Ok(())
    }
}

fn ensure_success(
    response: reqwest::Response,
    backend: &str,
) -> Result<reqwest::Response, StoreError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StoreError::Denied(format!(
            "{backend} rejected the credential"
        ))),
        StatusCode::NOT_FOUND => Err(StoreError::NotFound(backend.to_string())),
        status => Err(StoreError::BackendResponse {
            backend: backend.to_string(),
            details: status.to_string(),
        }),
    }
}

#[async_trait]
impl DocumentStore for RestStateStore {
    async fn get(&self, visibility: Visibility, id: Uuid) -> Result<Document, StoreError> {
        let response = self
            .authorize(self.client.get(self.url(Self::documents_table(visibility))))
            .query(&[("id", format!("eq.{id}")), ("limit", "1".to_string())])
            .send()
            .await?;

        let response = ensure_success(response, "state-store")?;
        let mut rows: Vec<Document> = response.json().await?;
        rows.pop()
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

        let mut body = json!({
            "status": next,
            "updated_at": Utc::now(),
        });
        if expected == DocumentStatus::Error {
            body["error_detail"] = serde_json::Value::Null;
        }
        if matches!(
            next,
            DocumentStatus::Extracted | DocumentStatus::Chunked | DocumentStatus::Embedded
        ) {
            body["retry_count"] = json!(0);
            body["next_attempt_at"] = serde_json::Value::Null;
        }

        // the status filter makes this a compare-and-set: zero matched
        // rows means another invocation got there first
        let response = self
            .authorize(self.client.patch(self.url(Self::documents_table(visibility))))
            .query(&[
                ("id", format!("eq.{id}")),
                ("status", format!("eq.{expected}")),
            ])
            .header("prefer", "return=representation")
            .json(&body)
            .send()
            .await?;

        let response = ensure_success(response, "state-store")?;
        let rows: Vec<serde_json::Value> = response.json().await?;
        Ok(rows.len() == 1)
    }

    async fn store_extraction(
        &self,
        visibility: Visibility,
        id: Uuid,
        text: &str,
        page_boundaries: &[usize],
    ) -> Result<(), StoreError> {
        self.patch_document(
            visibility,
            id,
            json!({
                "extracted_text": text,
                "page_boundaries": page_boundaries,
                "updated_at": Utc::now(),
            }),
        )
        .await
    }

    async fn mark_error(
        &self,
        visibility: Visibility,
        id: Uuid,
        detail: &str,
    ) -> Result<(), StoreError> {
        self.patch_document(
            visibility,
            id,
            json!({
                "status": DocumentStatus::Error,
                "error_detail": detail,
                "updated_at": Utc::now(),
            }),
        )
        .await
    }

    async fn schedule_retry(
        &self,
        visibility: Visibility,
        id: Uuid,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.patch_document(
            visibility,
            id,
            json!({
                "retry_count": retry_count,
                "next_attempt_at": next_attempt_at,
                "updated_at": Utc::now(),
            }),
        )
        .await
    }

    async fn list_chunk_pending(
        &self,
        visibility: Visibility,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.list_pending(visibility, DocumentStatus::Extracted, now, limit)
            .await
    }

    async fn list_embed_pending(
        &self,
        visibility: Visibility,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.list_pending(visibility, DocumentStatus::Chunked, now, limit)
            .await
    }
}

#[derive(Debug, Deserialize)]
struct MatchRow {
    id: String,
    document_id: Uuid,
    #[serde(default)]
    chunk_index: u32,
    content: String,
    #[serde(default)]
    token_count: u32,
    #[serde(default)]
    section_title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    start_char: usize,
    #[serde(default)]
    end_char: usize,
    #[serde(default)]
    page_number: Option<u32>,
    similarity: f32,
}

#[async_trait]
impl ChunkStore for RestStateStore {
    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<(), StoreError> {
        let Some(first) = chunks.first() else {
            return Ok(());
        };

        let response = self
            .authorize(
                self.client
                    .post(self.url(Self::chunks_table(first.visibility))),
            )
            .header("prefer", "return=minimal")
            .json(chunks)
            .send()
            .await?;

        ensure_success(response, "state-store")?;
        Ok(())
    }

    async fn count_for_document(
        &self,
        visibility: Visibility,
        document_id: Uuid,
    ) -> Result<usize, StoreError> {
        let response = self
            .authorize(self.client.get(self.url(Self::chunks_table(visibility))))
            .query(&[
                ("document_id", format!("eq.{document_id}")),
                ("select", "id".to_string()),
            ])
            .header("prefer", "count=exact")
            .header("range", "0-0")
            .send()
            .await?;

        let response = ensure_success(response, "state-store")?;
        let content_range = response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        match content_range.as_deref().and_then(parse_range_total) {
            Some(total) => Ok(total),
            None => Err(StoreError::BackendResponse {
                backend: "state-store".to_string(),
                details: "missing or malformed content-range header".to_string(),
            }),
        }
    }

    async fn chunks_missing_embedding(
        &self,
        visibility: Visibility,
        document_id: Uuid,
    ) -> Result<Vec<Chunk>, StoreError> {
        let response = self
            .authorize(self.client.get(self.url(Self::chunks_table(visibility))))
            .query(&[
                ("document_id", format!("eq.{document_id}")),
                ("embedding", "is.null".to_string()),
                ("order", "chunk_index.asc".to_string()),
            ])
            .send()
            .await?;

        let response = ensure_success(response, "state-store")?;
        Ok(response.json().await?)
    }

    async fn store_embedding(
        &self,
        visibility: Visibility,
        chunk_id: &str,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        // the is-null filter keeps a set embedding immutable: the update
        // silently matches zero rows on a retry that lost the race
        let response = self
            .authorize(self.client.patch(self.url(Self::chunks_table(visibility))))
            .query(&[
                ("id", format!("eq.{chunk_id}")),
                ("embedding", "is.null".to_string()),
            ])
            .header("prefer", "return=minimal")
            .json(&json!({ "embedding": embedding }))
            .send()
            .await?;

        ensure_success(response, "state-store")?;
        Ok(())
    }

    async fn similarity_search(
        &self,
        visibility: Visibility,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<RetrievalCandidate>, StoreError> {
        let response = self
            .authorize(self.client.post(self.url("rpc/match_chunks")))
            .json(&json!({
                "query_embedding": query_vector,
                "match_count": limit,
                "visibility": visibility,
            }))
            .send()
            .await?;

        let response = ensure_success(response, "state-store")?;
        let rows: Vec<MatchRow> = response.json().await?;

        Ok(rows
            .into_iter()
            .map(|row| RetrievalCandidate {
                chunk: Chunk {
                    id: row.id,
                    document_id: row.document_id,
                    visibility,
                    chunk_index: row.chunk_index,
                    content: row.content,
                    token_count: row.token_count,
                    embedding: None,
                    section_title: row.section_title,
                    summary: row.summary,
                    keywords: row.keywords,
                    start_char: row.start_char,
                    end_char: row.end_char,
                    page_number: row.page_number,
                },
                relevance_score: row.similarity,
            })
            .collect())
    }
}

fn parse_range_total(content_range: &str) -> Option<usize> {
    content_range.rsplit('/').next()?.trim().parse().ok()
}

/// Binary storage client. Buckets are partitioned by visibility the same
/// way the tables are.
#[derive(Clone)]
pub struct RestBlobStore {
    endpoint: String,
    service_key: Option<String>,
    client: reqwest::Client,
}

impl RestBlobStore {
    pub fn new(
        endpoint: &str,
        service_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let parsed = Url::parse(endpoint)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: parsed.as_str().trim_end_matches('/').to_string(),
            service_key,
            client,
        })
    }

    fn bucket(visibility: Visibility) -> &'static str {
        match visibility {
            Visibility::Private => "private-documents",
            Visibility::Public => "public-documents",
        }
    }
}

#[async_trait]
impl BlobStore for RestBlobStore {
    async fn fetch(&self, document: &DocumentRef) -> Result<Vec<u8>, StoreError> {
        let url = format!(
            "{}/object/{}/{}",
            self.endpoint,
            Self::bucket(document.visibility),
            document.storage_key
        );

        let mut request = self.client.get(url);
        if let Some(key) = &self.service_key {
            request = request.bearer_auth(key);
        }

        let response = ensure_success(request.send().await?, "blob-store")?;
        Ok(response.bytes().await?.to_vec())
    }
}

use crate::chunking::{assemble_chunk, ChunkingStrategy};
use crate::completion::CompletionClient;
use crate::embeddings::EmbeddingClient;
use crate::error::{PipelineError, StoreError};
use crate::extractor::TextExtractor;
use crate::models::{
    Chunk, ContextBudget, Document, DocumentStatus, PipelineOptions, Visibility,
};
use crate::retrieval::{build_context, select_context};
use crate::traits::{BlobStore, ChunkStore, DocumentStore};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

const ANSWER_SYSTEM_PROMPT: &str = "Answer the question using only the provided context. Cite \
the bracketed fragment numbers you relied on. Say so plainly when the context does not contain \
the answer.";

#[derive(Debug, Serialize)]
pub struct ExtractOutcome {
    pub document_id: Uuid,
    pub chars: usize,
    pub pages: usize,
}

#[derive(Debug, Serialize)]
pub struct ChunkOutcome {
    pub document_id: Uuid,
    pub new_chunks: usize,
    pub dropped_blocks: usize,
    pub already_chunked: bool,
}

#[derive(Debug, Serialize)]
pub struct EmbedOutcome {
    pub document_id: Uuid,
    pub embedded: usize,
    pub remaining: usize,
}

#[derive(Debug, Serialize)]
pub struct StageFailure {
    pub document_id: Uuid,
    pub stage: String,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub chunked: Vec<Uuid>,
    pub embedded: Vec<Uuid>,
    pub failed: Vec<StageFailure>,
}

#[derive(Debug, Serialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<String>,
    pub context_chunks: usize,
}

/// The operations the trigger surface exposes, kept behind a trait so the
/// HTTP layer can be driven with stubs.
#[async_trait]
pub trait PipelineApi: Send + Sync {
    async fn extract(&self, visibility: Visibility, id: Uuid)
        -> Result<ExtractOutcome, PipelineError>;
    async fn chunk(&self, visibility: Visibility, id: Uuid) -> Result<ChunkOutcome, PipelineError>;
    async fn embed(&self, visibility: Visibility, id: Uuid) -> Result<EmbedOutcome, PipelineError>;
    async fn continue_processing(&self) -> Result<RunSummary, PipelineError>;
    async fn answer(
        &self,
        visibility: Visibility,
        question: &str,
        top_k: usize,
    ) -> Result<Answer, PipelineError>;
}

/// Drives documents through extract, chunk and embed. Every client is an
/// injected dependency; nothing is constructed at module load.
pub struct PipelineOrchestrator<B, D, C>
where
    B: BlobStore,
    D: DocumentStore,
    C: ChunkStore,
{
    blobs: B,
    documents: D,
    chunks: C,
    extractor: Box<dyn TextExtractor>,
    strategy: Box<dyn ChunkingStrategy>,
    embedder: Box<dyn EmbeddingClient>,
    completion: Box<dyn CompletionClient>,
    options: PipelineOptions,
    budget: ContextBudget,
}

impl<B, D, C> PipelineOrchestrator<B, D, C>
where
    B: BlobStore,
    D: DocumentStore,
    C: ChunkStore,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        blobs: B,
        documents: D,
        chunks: C,
        extractor: Box<dyn TextExtractor>,
        strategy: Box<dyn ChunkingStrategy>,
        embedder: Box<dyn EmbeddingClient>,
        completion: Box<dyn CompletionClient>,
    ) -> Self {
        Self {
            blobs,
            documents,
            chunks,
            extractor,
            strategy,
            embedder,
            completion,
            options: PipelineOptions::default(),
            budget: ContextBudget::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_budget(mut self, budget: ContextBudget) -> Self {
        self.budget = budget;
        self
    }

    pub async fn extract_document(
        &self,
        visibility: Visibility,
        id: Uuid,
    ) -> Result<ExtractOutcome, PipelineError> {
        let document = self.get_document(visibility, id).await?;
        ensure_stage_entry(
            "extraction",
            document.status,
            &[
                DocumentStatus::Pending,
                DocumentStatus::Extracting,
                DocumentStatus::Error,
            ],
        )?;
        self.enter_stage(&document, DocumentStatus::Extracting).await?;

        match self.run_extraction(&document).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                self.settle_failure(
                    &document,
                    DocumentStatus::Extracting,
                    DocumentStatus::Pending,
                    &error,
                )
                .await;
                Err(error)
            }
        }
    }

    async fn run_extraction(&self, document: &Document) -> Result<ExtractOutcome, PipelineError> {
        let bytes = self
            .blobs
            .fetch(&document.doc_ref())
            .await
            .map_err(blob_error)?;
        let extraction = self.extractor.extract(&bytes)?;

        self.documents
            .store_extraction(
                document.visibility,
                document.id,
                &extraction.text,
                &extraction.page_boundaries,
            )
            .await?;
        self.complete_stage(document, DocumentStatus::Extracting, DocumentStatus::Extracted)
            .await;

        let chars = extraction.text.chars().count();
        let pages = extraction.page_boundaries.len();
        info!(document_id = %document.id, chars, pages, "extraction complete");
        Ok(ExtractOutcome {
            document_id: document.id,
            chars,
            pages,
        })
    }

    pub async fn chunk_document(
        &self,
        visibility: Visibility,
        id: Uuid,
    ) -> Result<ChunkOutcome, PipelineError> {
        let document = self.get_document(visibility, id).await?;
        ensure_stage_entry(
            "chunking",
            document.status,
            &[
                DocumentStatus::Extracted,
                DocumentStatus::Chunking,
                DocumentStatus::Chunked,
                DocumentStatus::Error,
            ],
        )?;

        // chunking is write-once per document: a second invocation must
        // not accumulate duplicates
        let existing = self.chunks.count_for_document(visibility, id).await?;
        if existing > 0 {
            if document.status != DocumentStatus::Chunked {
                self.complete_stage(&document, document.status, DocumentStatus::Chunked)
                    .await;
            }
            info!(document_id = %id, existing, "chunks already present; skipping re-chunk");
            return Ok(ChunkOutcome {
                document_id: id,
                new_chunks: 0,
                dropped_blocks: 0,
                already_chunked: true,
            });
        }

        let Some(text) = document.extracted_text.clone() else {
            return Err(PipelineError::InvalidArgument(format!(
                "document {id} has no extracted text"
            )));
        };
        self.enter_stage(&document, DocumentStatus::Chunking).await?;

        match self.run_chunking(&document, &text).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                self.settle_failure(
                    &document,
                    DocumentStatus::Chunking,
                    DocumentStatus::Extracted,
                    &error,
                )
                .await;
                Err(error)
            }
        }
    }

    async fn run_chunking(
        &self,
        document: &Document,
        text: &str,
    ) -> Result<ChunkOutcome, PipelineError> {
        let outcome = self
            .strategy
            .chunk(text, &document.page_boundaries)
            .await?;

        let chunks: Vec<Chunk> = outcome
            .drafts
            .into_iter()
            .enumerate()
            .map(|(index, draft)| {
                assemble_chunk(draft, document.id, document.visibility, index as u32)
            })
            .collect();

        if !chunks.is_empty() {
            self.chunks.insert_chunks(&chunks).await?;
        }

        // a document with nothing to chunk has nothing to embed either
        let completed = if chunks.is_empty() {
            DocumentStatus::Embedded
        } else {
            DocumentStatus::Chunked
        };
        self.complete_stage(document, DocumentStatus::Chunking, completed)
            .await;

        info!(
            document_id = %document.id,
            chunks = chunks.len(),
            dropped_blocks = outcome.dropped_blocks,
            "chunking complete"
        );
        Ok(ChunkOutcome {
            document_id: document.id,
            new_chunks: chunks.len(),
            dropped_blocks: outcome.dropped_blocks,
            already_chunked: false,
        })
    }

    pub async fn embed_document(
        &self,
        visibility: Visibility,
        id: Uuid,
    ) -> Result<EmbedOutcome, PipelineError> {
        let document = self.get_document(visibility, id).await?;
        ensure_stage_entry(
            "embedding",
            document.status,
            &[
                DocumentStatus::Chunked,
                DocumentStatus::Embedding,
                DocumentStatus::Error,
            ],
        )?;

        let pending = self.chunks.chunks_missing_embedding(visibility, id).await?;
        if pending.is_empty() {
            let total = self.chunks.count_for_document(visibility, id).await?;
            if total == 0 {
                return Err(PipelineError::NoChunksFound(id));
            }
            self.complete_stage(&document, document.status, DocumentStatus::Embedded)
                .await;
            info!(document_id = %id, total, "all chunks already embedded");
            return Ok(EmbedOutcome {
                document_id: id,
                embedded: 0,
                remaining: 0,
            });
        }

        self.enter_stage(&document, DocumentStatus::Embedding).await?;

        let total = pending.len();
        let mut stored = 0usize;
        let mut failed = 0usize;

        for batch in pending.chunks(self.options.embed_batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.content.clone()).collect();
            match self.embedder.embed_batch(&texts).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    // vectors are persisted per chunk: one failed write
                    // never rolls back its siblings
                    for (chunk, vector) in batch.iter().zip(vectors) {
                        match self
                            .chunks
                            .store_embedding(visibility, &chunk.id, &vector)
                            .await
                        {
                            Ok(()) => stored += 1,
                            Err(error) => {
                                warn!(chunk_id = %chunk.id, %error, "embedding persistence failed");
                                failed += 1;
                            }
                        }
                    }
                }
                Ok(vectors) => {
                    warn!(
                        expected = batch.len(),
                        received = vectors.len(),
                        "embedding batch size mismatch"
                    );
                    failed += batch.len();
                }
                Err(error) => {
                    warn!(%error, batch_size = batch.len(), "embedding batch failed");
                    failed += batch.len();
                }
            }
        }

        if failed == 0 {
            self.complete_stage(&document, DocumentStatus::Embedding, DocumentStatus::Embedded)
                .await;
            info!(document_id = %id, embedded = stored, "embedding complete");
            Ok(EmbedOutcome {
                document_id: id,
                embedded: stored,
                remaining: 0,
            })
        } else {
            let error = PipelineError::PartialEmbeddingFailure { failed, total };
            self.settle_failure(
                &document,
                DocumentStatus::Embedding,
                DocumentStatus::Chunked,
                &error,
            )
            .await;
            Err(error)
        }
    }

    /// One stateless batch pass: up to `batch_limit` chunk-pending
    /// documents, then up to `batch_limit` embed-pending documents,
    /// oldest-updated first. Each document is its own failure domain.
    pub async fn run_continue_processing(&self) -> Result<RunSummary, PipelineError> {
        let now = Utc::now();
        let mut summary = RunSummary::default();

        let mut chunk_batch: Vec<Document> = Vec::new();
        for visibility in Visibility::ALL {
            let remaining = self.options.batch_limit.saturating_sub(chunk_batch.len());
            if remaining == 0 {
                break;
            }
            chunk_batch.extend(
                self.documents
                    .list_chunk_pending(visibility, now, remaining)
                    .await?,
            );
        }
        for document in chunk_batch {
            match self.chunk_document(document.visibility, document.id).await {
                Ok(_) => summary.chunked.push(document.id),
                Err(error) => summary.failed.push(StageFailure {
                    document_id: document.id,
                    stage: "chunk".to_string(),
                    reason: error.to_string(),
                }),
            }
        }

        let mut embed_batch: Vec<Document> = Vec::new();
        for visibility in Visibility::ALL {
            let remaining = self.options.batch_limit.saturating_sub(embed_batch.len());
            if remaining == 0 {
                break;
            }
            embed_batch.extend(
                self.documents
                    .list_embed_pending(visibility, now, remaining)
                    .await?,
            );
        }
        for document in embed_batch {
            match self.embed_document(document.visibility, document.id).await {
                Ok(_) => summary.embedded.push(document.id),
                Err(error) => summary.failed.push(StageFailure {
                    document_id: document.id,
                    stage: "embed".to_string(),
                    reason: error.to_string(),
                }),
            }
        }

        info!(
            chunked = summary.chunked.len(),
            embedded = summary.embedded.len(),
            failed = summary.failed.len(),
            "processing run complete"
        );
        Ok(summary)
    }

    /// Retrieval-time read path: embed the question, gather ranked
    /// candidates, pack a token-budgeted context and generate an answer.
    pub async fn answer_question(
        &self,
        visibility: Visibility,
        question: &str,
        top_k: usize,
    ) -> Result<Answer, PipelineError> {
        if question.trim().is_empty() {
            return Err(PipelineError::InvalidArgument("question is empty".to_string()));
        }

        let vectors = self.embedder.embed_batch(&[question.to_string()]).await?;
        let query_vector = vectors.into_iter().next().ok_or_else(|| {
            PipelineError::EmbeddingFailed("no vector returned for the question".to_string())
        })?;

        let candidates = self
            .chunks
            .similarity_search(visibility, &query_vector, top_k)
            .await?;
        let selected = select_context(candidates, &self.budget);
        let sources: Vec<String> = selected
            .iter()
            .map(|candidate| candidate.chunk.id.clone())
            .collect();
        let context = build_context(&selected);

        let text = self
            .completion
            .complete(
                ANSWER_SYSTEM_PROMPT,
                &format!("Context:\n{context}\n\nQuestion: {question}"),
            )
            .await?;

        info!(context_chunks = selected.len(), "answer generated");
        Ok(Answer {
            text,
            sources,
            context_chunks: selected.len(),
        })
    }

    async fn get_document(
        &self,
        visibility: Visibility,
        id: Uuid,
    ) -> Result<Document, PipelineError> {
        self.documents.get(visibility, id).await.map_err(|error| match error {
            StoreError::NotFound(_) => PipelineError::DocumentNotFound(id),
            other => PipelineError::Store(other),
        })
    }

    async fn enter_stage(
        &self,
        document: &Document,
        stage: DocumentStatus,
    ) -> Result<(), PipelineError> {
        if document.status == stage {
            // a previous invocation died mid-stage; take over
            return Ok(());
        }
        let entered = self
            .documents
            .transition_status(document.visibility, document.id, document.status, stage)
            .await?;
        if !entered {
            return Err(PipelineError::StageInProgress(document.id));
        }
        Ok(())
    }

    async fn complete_stage(&self, document: &Document, from: DocumentStatus, to: DocumentStatus) {
        match self
            .documents
            .transition_status(document.visibility, document.id, from, to)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(document_id = %document.id, %from, %to, "status advanced elsewhere; leaving it");
            }
            Err(error) => {
                warn!(document_id = %document.id, %error, "failed to persist status transition");
            }
        }
    }

    /// Fatal errors park the document in `error`; transient ones re-arm
    /// the stage and schedule an exponential cooldown so a persistently
    /// failing document stops consuming batch slots.
    async fn settle_failure(
        &self,
        document: &Document,
        in_progress: DocumentStatus,
        fallback: DocumentStatus,
        error: &PipelineError,
    ) {
        if error.is_fatal_for_document() {
            if let Err(store_error) = self
                .documents
                .mark_error(document.visibility, document.id, &error.to_string())
                .await
            {
                warn!(document_id = %document.id, %store_error, "failed to record error status");
            }
            return;
        }

        self.complete_stage(document, in_progress, fallback).await;

        let retries = document.retry_count + 1;
        let cooldown = cooldown_secs(retries, &self.options);
        let next_attempt = Utc::now() + chrono::Duration::seconds(cooldown);
        if let Err(store_error) = self
            .documents
            .schedule_retry(document.visibility, document.id, retries, next_attempt)
            .await
        {
            warn!(document_id = %document.id, %store_error, "failed to schedule retry");
        }
        warn!(
            document_id = %document.id,
            retries,
            cooldown_secs = cooldown,
            %error,
            "stage failed; retry scheduled"
        );
    }
}

#[async_trait]
impl<B, D, C> PipelineApi for PipelineOrchestrator<B, D, C>
where
    B: BlobStore,
    D: DocumentStore,
    C: ChunkStore,
{
    async fn extract(
        &self,
        visibility: Visibility,
        id: Uuid,
    ) -> Result<ExtractOutcome, PipelineError> {
        self.extract_document(visibility, id).await
    }

    async fn chunk(&self, visibility: Visibility, id: Uuid) -> Result<ChunkOutcome, PipelineError> {
        self.chunk_document(visibility, id).await
    }

    async fn embed(&self, visibility: Visibility, id: Uuid) -> Result<EmbedOutcome, PipelineError> {
        self.embed_document(visibility, id).await
    }

    async fn continue_processing(&self) -> Result<RunSummary, PipelineError> {
        self.run_continue_processing().await
    }

    async fn answer(
        &self,
        visibility: Visibility,
        question: &str,
        top_k: usize,
    ) -> Result<Answer, PipelineError> {
        self.answer_question(visibility, question, top_k).await
    }
}

fn ensure_stage_entry(
    stage: &str,
    status: DocumentStatus,
    allowed: &[DocumentStatus],
) -> Result<(), PipelineError> {
    if allowed.contains(&status) {
        Ok(())
    } else {
        Err(PipelineError::InvalidArgument(format!(
            "document is not eligible for {stage} (status: {status})"
        )))
    }
}

fn blob_error(error: StoreError) -> PipelineError {
    match error {
        StoreError::NotFound(detail) | StoreError::Denied(detail) => {
            PipelineError::StorageDenied(detail)
        }
        other => PipelineError::Store(other),
    }
}

fn cooldown_secs(attempt: u32, options: &PipelineOptions) -> i64 {
    let exponent = attempt.saturating_sub(1).min(16);
    options
        .retry_base_cooldown_secs
        .saturating_mul(1i64 << exponent)
        .min(options.retry_max_cooldown_secs)
}

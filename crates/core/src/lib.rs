pub mod chunking;
pub mod completion;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod models;
pub mod orchestrator;
pub mod retrieval;
pub mod stores;
pub mod traits;

pub use chunking::{
    assemble_chunk, estimate_tokens, ChunkingOutcome, ChunkingStrategy, FixedWindowStrategy,
    SemanticStrategy,
};
pub use completion::{CompletionClient, CompletionConfig, HttpCompletionClient};
pub use embeddings::{
    EmbeddingClient, EmbeddingConfig, HashEmbedder, HttpEmbeddingClient,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{PipelineError, StoreError};
pub use extractor::{infer_page_number, Extraction, PdfTextExtractor, TextExtractor};
pub use models::{
    Chunk, ChunkDraft, ChunkMetadata, ContextBudget, Document, DocumentRef, DocumentStatus,
    PipelineOptions, RetrievalCandidate, Visibility,
};
pub use orchestrator::{
    Answer, ChunkOutcome, EmbedOutcome, ExtractOutcome, PipelineApi, PipelineOrchestrator,
    RunSummary, StageFailure,
};
pub use retrieval::{build_context, select_context};
pub use stores::{MemoryStateStore, RestBlobStore, RestStateStore};
pub use traits::{BlobStore, ChunkStore, DocumentStore};

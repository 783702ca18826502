use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
}

impl Visibility {
    pub const ALL: [Visibility; 2] = [Visibility::Private, Visibility::Public];

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
        }
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "private" => Ok(Visibility::Private),
            "public" => Ok(Visibility::Public),
            other => Err(format!("unknown visibility: {other}")),
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage pointer resolved once at the boundary so pipeline stages never
/// branch on visibility themselves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DocumentRef {
    pub visibility: Visibility,
    pub storage_key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Extracting,
    Extracted,
    Chunking,
    Chunked,
    Embedding,
    Embedded,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Extracting => "extracting",
            DocumentStatus::Extracted => "extracted",
            DocumentStatus::Chunking => "chunking",
            DocumentStatus::Chunked => "chunked",
            DocumentStatus::Embedding => "embedding",
            DocumentStatus::Embedded => "embedded",
            DocumentStatus::Error => "error",
        }
    }

    fn walk_position(self) -> Option<u8> {
        match self {
            DocumentStatus::Pending => Some(0),
            DocumentStatus::Extracting => Some(1),
            DocumentStatus::Extracted => Some(2),
            DocumentStatus::Chunking => Some(3),
            DocumentStatus::Chunked => Some(4),
            DocumentStatus::Embedding => Some(5),
            DocumentStatus::Embedded => Some(6),
            DocumentStatus::Error => None,
        }
    }

    /// Statuses only ever move forward through the walk, with three
    /// exceptions: entering `Error`, leaving `Error` on a retry, and an
    /// in-progress stage dropping back to its predecessor after a failed
    /// attempt so the next run can re-arm it.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        match (self, next) {
            (DocumentStatus::Extracting, DocumentStatus::Pending)
            | (DocumentStatus::Chunking, DocumentStatus::Extracted)
            | (DocumentStatus::Embedding, DocumentStatus::Chunked) => true,
            (DocumentStatus::Error, _) => true,
            (_, DocumentStatus::Error) => true,
            (current, next) => match (current.walk_position(), next.walk_position()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub visibility: Visibility,
    pub storage_key: String,
    pub status: DocumentStatus,
    pub extracted_text: Option<String>,
    pub page_boundaries: Vec<usize>,
    pub error_detail: Option<String>,
    pub retry_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(visibility: Visibility, storage_key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            visibility,
            storage_key: storage_key.into(),
            status: DocumentStatus::Pending,
            extracted_text: None,
            page_boundaries: Vec::new(),
            error_detail: None,
            retry_count: 0,
            next_attempt_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn doc_ref(&self) -> DocumentRef {
        DocumentRef {
            visibility: self.visibility,
            storage_key: self.storage_key.clone(),
        }
    }

    /// A document is eligible for batch selection once its cooldown, if
    /// any, has elapsed.
    pub fn ready_at(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub section_title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub start_char: usize,
    pub end_char: usize,
    pub page_number: Option<u32>,
}

/// A chunk as produced by a chunking strategy, before it is assigned an
/// index and persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub content: String,
    pub token_count: u32,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: Uuid,
    pub visibility: Visibility,
    pub chunk_index: u32,
    pub content: String,
    pub token_count: u32,
    pub embedding: Option<Vec<f32>>,
    pub section_title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub start_char: usize,
    pub end_char: usize,
    pub page_number: Option<u32>,
}

/// A chunk paired with its similarity score for one query. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalCandidate {
    pub chunk: Chunk,
    pub relevance_score: f32,
}

/// Ceilings applied while assembling a generation context. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextBudget {
    pub token_limit: u32,
    pub max_chunk_tokens: u32,
    pub relevance_ceiling: f32,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            token_limit: 3_000,
            max_chunk_tokens: 800,
            relevance_ceiling: 2.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub chunk_window_chars: usize,
    pub semantic_block_chars: usize,
    pub min_extracted_chars: usize,
    pub embed_batch_size: usize,
    pub batch_limit: usize,
    pub retry_base_cooldown_secs: i64,
    pub retry_max_cooldown_secs: i64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunk_window_chars: 1_000,
            semantic_block_chars: 12_000,
            min_extracted_chars: 20,
            embed_batch_size: 32,
            batch_limit: 10,
            retry_base_cooldown_secs: 30,
            retry_max_cooldown_secs: 3_600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_walk_is_forward_only() {
        assert!(DocumentStatus::Pending.can_transition_to(DocumentStatus::Extracting));
        assert!(DocumentStatus::Extracted.can_transition_to(DocumentStatus::Chunked));
        assert!(!DocumentStatus::Chunked.can_transition_to(DocumentStatus::Extracted));
        assert!(!DocumentStatus::Embedded.can_transition_to(DocumentStatus::Pending));
    }

    #[test]
    fn failed_stages_may_drop_back_to_their_predecessor() {
        assert!(DocumentStatus::Extracting.can_transition_to(DocumentStatus::Pending));
        assert!(DocumentStatus::Chunking.can_transition_to(DocumentStatus::Extracted));
        assert!(DocumentStatus::Embedding.can_transition_to(DocumentStatus::Chunked));
        assert!(!DocumentStatus::Embedding.can_transition_to(DocumentStatus::Extracted));
    }

    #[test]
    fn error_state_is_reachable_and_leavable() {
        assert!(DocumentStatus::Extracting.can_transition_to(DocumentStatus::Error));
        assert!(DocumentStatus::Error.can_transition_to(DocumentStatus::Extracting));
        assert!(DocumentStatus::Error.can_transition_to(DocumentStatus::Chunked));
    }

    #[test]
    fn cooldown_gates_readiness() {
        let now = Utc::now();
        let mut document = Document::new(Visibility::Private, "docs/a.pdf");
        assert!(document.ready_at(now));

        document.next_attempt_at = Some(now + chrono::Duration::seconds(60));
        assert!(!document.ready_at(now));
        assert!(document.ready_at(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn visibility_parses_case_insensitively() {
        assert_eq!("Private".parse::<Visibility>(), Ok(Visibility::Private));
        assert_eq!("PUBLIC".parse::<Visibility>(), Ok(Visibility::Public));
        assert!("internal".parse::<Visibility>().is_err());
    }
}

use crate::completion::CompletionClient;
use crate::error::PipelineError;
use crate::extractor::infer_page_number;
use crate::models::{Chunk, ChunkDraft, ChunkMetadata, Visibility};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

const HEADING_PATTERN: &str = r"^\s*\d+(?:\.\d+)*\s+\S.*$";
const TITLE_WORDS: usize = 8;
const SUMMARY_CHARS: usize = 160;
const KEYWORD_LIMIT: usize = 6;

const STOPWORDS: [&str; 24] = [
    "about", "after", "also", "been", "before", "between", "both", "each", "from", "have",
    "into", "more", "other", "over", "same", "some", "such", "that", "their", "there", "these",
    "this", "which", "with",
];

/// Deterministic token estimate used everywhere a budget is enforced.
/// Roughly four characters per token; exact tokenizer parity is not a goal,
/// determinism is.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    ((chars + 3) / 4) as u32
}

#[derive(Debug, Default)]
pub struct ChunkingOutcome {
    pub drafts: Vec<ChunkDraft>,
    /// Semantic blocks whose segmentation response failed validation and
    /// was dropped. Non-fatal, but callers report it.
    pub dropped_blocks: usize,
}

#[async_trait]
pub trait ChunkingStrategy: Send + Sync {
    async fn chunk(
        &self,
        text: &str,
        page_boundaries: &[usize],
    ) -> Result<ChunkingOutcome, PipelineError>;
}

/// Fixed-size character windows, independent of semantic boundaries.
/// Cheap, always succeeds, the configured fallback.
pub struct FixedWindowStrategy {
    pub window_chars: usize,
}

impl Default for FixedWindowStrategy {
    fn default() -> Self {
        Self {
            window_chars: 1_000,
        }
    }
}

#[async_trait]
impl ChunkingStrategy for FixedWindowStrategy {
    async fn chunk(
        &self,
        text: &str,
        page_boundaries: &[usize],
    ) -> Result<ChunkingOutcome, PipelineError> {
        if text.trim().is_empty() {
            return Ok(ChunkingOutcome::default());
        }

        let heading_re = Regex::new(HEADING_PATTERN)?;
        let mut drafts = Vec::new();

        for (start_char, window) in char_windows(text, self.window_chars.max(1)) {
            if window.trim().is_empty() {
                continue;
            }
            let end_char = start_char + window.chars().count();
            drafts.push(ChunkDraft {
                content: window.to_string(),
                token_count: estimate_tokens(window),
                metadata: ChunkMetadata {
                    section_title: heuristic_title(window, &heading_re),
                    summary: heuristic_summary(window),
                    keywords: keyword_candidates(window, KEYWORD_LIMIT),
                    start_char,
                    end_char,
                    page_number: infer_page_number(page_boundaries, start_char),
                },
            });
        }

        Ok(ChunkingOutcome {
            drafts,
            dropped_blocks: 0,
        })
    }
}

const SECTION_SYSTEM_PROMPT: &str = "Split the provided text into self-contained sections of \
roughly 150-300 words. Respond with a JSON array only. Each element must be an object with \
exactly the keys title, content, start_char and end_char, where the offsets are character \
positions relative to the provided text.";

/// LLM-backed segmentation: the text is cut into large raw blocks to fit
/// the completion context window, then each block is segmented via a
/// strict-JSON completion call. A block whose response fails validation is
/// dropped and counted; the rest of the document is unaffected.
pub struct SemanticStrategy<C: CompletionClient> {
    completion: C,
    block_chars: usize,
}

impl<C: CompletionClient> SemanticStrategy<C> {
    pub fn new(completion: C) -> Self {
        Self {
            completion,
            block_chars: 12_000,
        }
    }

    pub fn with_block_chars(mut self, block_chars: usize) -> Self {
        self.block_chars = block_chars.max(1);
        self
    }

    async fn segment_block(&self, block: &str) -> Result<Vec<SectionDraft>, PipelineError> {
        let response = self
            .completion
            .complete(SECTION_SYSTEM_PROMPT, block)
            .await?;
        parse_sections(&response, block.chars().count())
    }
}

#[async_trait]
impl<C: CompletionClient> ChunkingStrategy for SemanticStrategy<C> {
    async fn chunk(
        &self,
        text: &str,
        page_boundaries: &[usize],
    ) -> Result<ChunkingOutcome, PipelineError> {
        if text.trim().is_empty() {
            return Ok(ChunkingOutcome::default());
        }

        let mut drafts = Vec::new();
        let mut dropped_blocks = 0usize;

        for (block_start, block) in char_windows(text, self.block_chars) {
            match self.segment_block(block).await {
                Ok(sections) => {
                    for section in sections {
                        let start_char = block_start + section.start_char;
                        let end_char = block_start + section.end_char;
                        drafts.push(ChunkDraft {
                            token_count: estimate_tokens(&section.content),
                            metadata: ChunkMetadata {
                                section_title: section.title,
                                summary: heuristic_summary(&section.content),
                                keywords: keyword_candidates(&section.content, KEYWORD_LIMIT),
                                start_char,
                                end_char,
                                page_number: infer_page_number(page_boundaries, start_char),
                            },
                            content: section.content,
                        });
                    }
                }
                Err(error) => {
                    warn!(block_start, %error, "dropping semantic block");
                    dropped_blocks += 1;
                }
            }
        }

        Ok(ChunkingOutcome {
            drafts,
            dropped_blocks,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SectionDraft {
    title: String,
    content: String,
    start_char: usize,
    end_char: usize,
}

fn parse_sections(raw: &str, block_chars: usize) -> Result<Vec<SectionDraft>, PipelineError> {
    let body = strip_code_fence(raw.trim());
    let sections: Vec<SectionDraft> = serde_json::from_str(body)
        .map_err(|error| PipelineError::MalformedSegmentation(error.to_string()))?;

    for section in &sections {
        if section.content.trim().is_empty() {
            return Err(PipelineError::MalformedSegmentation(
                "section content is empty".to_string(),
            ));
        }
        if section.start_char >= section.end_char || section.end_char > block_chars {
            return Err(PipelineError::MalformedSegmentation(format!(
                "section span [{}, {}) is outside the block of {} chars",
                section.start_char, section.end_char, block_chars
            )));
        }
    }

    Ok(sections)
}

fn strip_code_fence(raw: &str) -> &str {
    let Some(inner) = raw.strip_prefix("```") else {
        return raw;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Split `text` into consecutive windows of at most `window` characters,
/// returning each window's starting character offset. Slices always fall
/// on char boundaries.
pub(crate) fn char_windows(text: &str, window: usize) -> Vec<(usize, &str)> {
    let byte_offsets: Vec<usize> = text.char_indices().map(|(byte, _)| byte).collect();
    let total = byte_offsets.len();
    let mut windows = Vec::new();
    let mut start = 0usize;

    while start < total {
        let end = (start + window).min(total);
        let begin_byte = byte_offsets[start];
        let end_byte = if end == total {
            text.len()
        } else {
            byte_offsets[end]
        };
        windows.push((start, &text[begin_byte..end_byte]));
        start = end;
    }

    windows
}

fn heuristic_title(content: &str, heading_re: &Regex) -> String {
    let first_line = content
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(str::trim)
        .unwrap_or_default();

    if heading_re.is_match(first_line) && first_line.chars().count() <= 80 {
        return first_line.to_string();
    }

    content
        .split_whitespace()
        .take(TITLE_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

fn heuristic_summary(content: &str) -> String {
    let trimmed = content.trim();
    let mut summary = String::new();

    for sentence in trimmed.split_inclusive(['.', '!', '?']) {
        summary.push_str(sentence);
        if summary.chars().count() >= SUMMARY_CHARS {
            break;
        }
    }

    truncate_chars(summary.trim(), SUMMARY_CHARS + 80).to_string()
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

/// Stopword-filtered frequency count; ties break alphabetically so the
/// result is deterministic.
fn keyword_candidates(content: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();

    for word in content.split_whitespace() {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if cleaned.chars().count() <= 3 || STOPWORDS.contains(&cleaned.as_str()) {
            continue;
        }
        *counts.entry(cleaned).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|left, right| {
        right
            .1
            .cmp(&left.1)
            .then_with(|| left.0.cmp(&right.0))
    });

    ranked
        .into_iter()
        .take(limit)
        .map(|(word, _)| word)
        .collect()
}

/// Promote a draft to a persistable chunk. The id is content-addressed so
/// re-inserting the same draft for the same document is detectable.
pub fn assemble_chunk(
    draft: ChunkDraft,
    document_id: Uuid,
    visibility: Visibility,
    chunk_index: u32,
) -> Chunk {
    let id = make_chunk_id(document_id, chunk_index, &draft.content);
    Chunk {
        id,
        document_id,
        visibility,
        chunk_index,
        content: draft.content,
        token_count: draft.token_count,
        embedding: None,
        section_title: draft.metadata.section_title,
        summary: draft.metadata.summary,
        keywords: draft.metadata.keywords,
        start_char: draft.metadata.start_char,
        end_char: draft.metadata.end_char,
        page_number: draft.metadata.page_number,
    }
}

fn make_chunk_id(document_id: Uuid, chunk_index: u32, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(chunk_index.to_le_bytes());
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

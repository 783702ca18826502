use crate::models::{ContextBudget, RetrievalCandidate};

/// Token-budgeted greedy selection over pre-ranked candidates.
///
/// Candidates are consumed in the order supplied; callers present them
/// sorted by descending relevance and this function never re-sorts.
/// Oversized fragments are skipped outright, the first fragment that would
/// overflow the token budget ends the scan (hard cutoff, not best-fit),
/// and crossing the relevance ceiling ends the scan right after the
/// crossing candidate.
pub fn select_context(
    candidates: Vec<RetrievalCandidate>,
    budget: &ContextBudget,
) -> Vec<RetrievalCandidate> {
    let mut selected = Vec::new();
    let mut used_tokens = 0u64;
    let mut cumulative_relevance = 0f32;

    for candidate in candidates {
        if candidate.chunk.token_count > budget.max_chunk_tokens {
            continue;
        }
        if used_tokens + u64::from(candidate.chunk.token_count) > u64::from(budget.token_limit) {
            break;
        }

        used_tokens += u64::from(candidate.chunk.token_count);
        cumulative_relevance += candidate.relevance_score;
        selected.push(candidate);

        if cumulative_relevance > budget.relevance_ceiling {
            break;
        }
    }

    selected
}

/// Render the selected candidates into a single prompt context, preserving
/// selection order and labelling each fragment for citation.
pub fn build_context(selected: &[RetrievalCandidate]) -> String {
    let mut context = String::new();

    for (position, candidate) in selected.iter().enumerate() {
        let chunk = &candidate.chunk;
        if position > 0 {
            context.push_str("\n\n");
        }
        context.push_str(&format!("[{}] {}", position + 1, chunk.section_title));
        match chunk.page_number {
            Some(page) => context.push_str(&format!(" (page {page})\n")),
            None => context.push('\n'),
        }
        context.push_str(&chunk.content);
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, Visibility};
    use uuid::Uuid;

    fn candidate(index: u32, token_count: u32, relevance_score: f32) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk: Chunk {
                id: format!("chunk-{index}"),
                document_id: Uuid::nil(),
                visibility: Visibility::Private,
                chunk_index: index,
                content: format!("fragment {index}"),
                token_count,
                embedding: None,
                section_title: format!("section {index}"),
                summary: String::new(),
                keywords: Vec::new(),
                start_char: 0,
                end_char: 0,
                page_number: Some(1),
            },
            relevance_score,
        }
    }

    fn budget(token_limit: u32, max_chunk_tokens: u32, relevance_ceiling: f32) -> ContextBudget {
        ContextBudget {
            token_limit,
            max_chunk_tokens,
            relevance_ceiling,
        }
    }

    #[test]
    fn selection_never_exceeds_the_token_budget() {
        let candidates = vec![
            candidate(0, 400, 0.3),
            candidate(1, 400, 0.3),
            candidate(2, 400, 0.3),
        ];

        let selected = select_context(candidates, &budget(1_000, 800, 10.0));
        let total: u32 = selected.iter().map(|c| c.chunk.token_count).sum();

        assert_eq!(selected.len(), 2);
        assert!(total <= 1_000);
    }

    #[test]
    fn oversized_candidates_are_skipped_not_truncated() {
        let candidates = vec![
            candidate(0, 900, 0.5),
            candidate(1, 100, 0.5),
            candidate(2, 100, 0.5),
        ];

        let selected = select_context(candidates, &budget(1_000, 500, 10.0));
        let ids: Vec<u32> = selected.iter().map(|c| c.chunk.chunk_index).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn budget_overflow_is_a_hard_cutoff() {
        // candidate 2 would still fit after the overflow at candidate 1,
        // but the scan stops rather than continuing best-fit.
        let candidates = vec![
            candidate(0, 600, 0.1),
            candidate(1, 500, 0.1),
            candidate(2, 100, 0.9),
        ];

        let selected = select_context(candidates, &budget(1_000, 800, 10.0));
        let ids: Vec<u32> = selected.iter().map(|c| c.chunk.chunk_index).collect();
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn crossing_the_relevance_ceiling_stops_the_scan() {
        let candidates = vec![
            candidate(0, 10, 1.5),
            candidate(1, 10, 1.2),
            candidate(2, 10, 0.9),
        ];

        let selected = select_context(candidates, &budget(1_000, 800, 2.0));
        let ids: Vec<u32> = selected.iter().map(|c| c.chunk.chunk_index).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn output_is_a_subsequence_of_the_input() {
        let candidates = vec![
            candidate(4, 100, 0.1),
            candidate(2, 5_000, 0.1),
            candidate(7, 100, 0.1),
            candidate(1, 100, 0.1),
        ];

        let selected = select_context(candidates, &budget(10_000, 800, 10.0));
        let ids: Vec<u32> = selected.iter().map(|c| c.chunk.chunk_index).collect();
        assert_eq!(ids, vec![4, 7, 1]);
    }

    #[test]
    fn empty_input_selects_nothing() {
        assert!(select_context(Vec::new(), &ContextBudget::default()).is_empty());
    }

    #[test]
    fn context_lists_fragments_in_selection_order() {
        let selected = vec![candidate(0, 10, 0.5), candidate(1, 10, 0.4)];
        let context = build_context(&selected);

        assert!(context.starts_with("[1] section 0 (page 1)\nfragment 0"));
        assert!(context.contains("[2] section 1"));
        let first = context.find("fragment 0").expect("first fragment present");
        let second = context.find("fragment 1").expect("second fragment present");
        assert!(first < second);
    }
}

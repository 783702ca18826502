use crate::error::PipelineError;
use lopdf::Document as PdfDocument;

/// Concatenated plain text plus the cumulative character offset at the end
/// of each page. The boundary map is what lets chunk spans be traced back
/// to page numbers long after extraction ran.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub text: String,
    pub page_boundaries: Vec<usize>,
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<Extraction, PipelineError>;
}

pub struct PdfTextExtractor {
    pub min_chars: usize,
}

impl Default for PdfTextExtractor {
    fn default() -> Self {
        Self { min_chars: 20 }
    }
}

impl TextExtractor for PdfTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<Extraction, PipelineError> {
        let document = PdfDocument::load_mem(bytes)
            .map_err(|error| PipelineError::UnreadableDocument(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| PipelineError::UnreadableDocument(error.to_string()))?;
            pages.push(text);
        }

        let extraction = concat_pages(pages);
        let chars = extraction.text.chars().count();
        if chars < self.min_chars {
            return Err(PipelineError::ExtractedTextTooShort {
                chars,
                minimum: self.min_chars,
            });
        }

        Ok(extraction)
    }
}

/// Join page texts in order, recording the cumulative character count at
/// the end of each page. Empty pages still get a boundary so page numbers
/// stay aligned with the original pagination.
pub(crate) fn concat_pages(pages: Vec<String>) -> Extraction {
    let mut text = String::new();
    let mut page_boundaries = Vec::with_capacity(pages.len());
    let mut cumulative = 0usize;

    for page in pages {
        cumulative += page.chars().count();
        text.push_str(&page);
        page_boundaries.push(cumulative);
    }

    Extraction {
        text,
        page_boundaries,
    }
}

/// 1-indexed page containing `start_char`: the first boundary whose
/// cumulative length exceeds the offset. `None` when the offset lies past
/// the final boundary.
pub fn infer_page_number(page_boundaries: &[usize], start_char: usize) -> Option<u32> {
    page_boundaries
        .iter()
        .position(|&end| end > start_char)
        .map(|index| (index + 1) as u32)
}

//! Page-span chunking of source documents

use crate::config::ConfigError;
use crate::error::PipelineError;
use formflow_domain::{plan_page_ranges, Chunk, SourceDocument};
use lopdf::Document;
use tracing::debug;

/// Splits source documents into fixed-span form chunks
///
/// Each chunk is a standalone PDF holding only its pages. Splitting is
/// deterministic: the same bytes and span always yield the same chunks,
/// byte for byte.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_span: u32,
}

impl Chunker {
    /// Create a chunker producing `chunk_span` pages per form
    pub fn new(chunk_span: u32) -> Result<Self, PipelineError> {
        if chunk_span == 0 {
            return Err(ConfigError::Invalid("chunk_span must be greater than 0".to_string()).into());
        }
        Ok(Self { chunk_span })
    }

    /// Pages per form
    pub fn chunk_span(&self) -> u32 {
        self.chunk_span
    }

    /// Count the pages of a document without splitting it
    pub fn page_count(&self, document: &SourceDocument) -> Result<u32, PipelineError> {
        let source = load(document)?;
        Self::checked_page_count(document, &source)
    }

    /// Split a document into chunks, ordered by form number
    pub fn split(&self, document: &SourceDocument) -> Result<Vec<Chunk>, PipelineError> {
        let source = load(document)?;
        let page_count = Self::checked_page_count(document, &source)?;

        let ranges = plan_page_ranges(page_count, self.chunk_span);
        let total_forms = ranges.len() as u32;
        let page_numbers: Vec<u32> = source.get_pages().keys().copied().collect();

        debug!(
            source_id = %document.source_id,
            page_count,
            total_forms,
            chunk_span = self.chunk_span,
            "Splitting document"
        );

        ranges
            .into_iter()
            .zip(1..)
            .map(|(page_range, form_number)| {
                let outside: Vec<u32> = page_numbers
                    .iter()
                    .copied()
                    .filter(|p| !page_range.contains(*p))
                    .collect();

                let mut part = source.clone();
                part.delete_pages(&outside);
                part.prune_objects();

                let mut bytes = Vec::new();
                part.save_to(&mut bytes).map_err(|e| {
                    PipelineError::InvalidDocument(format!(
                        "{}: cannot write pages {}: {}",
                        document.source_id, page_range, e
                    ))
                })?;

                Ok(Chunk {
                    source_id: document.source_id.clone(),
                    form_number,
                    total_forms,
                    page_range,
                    bytes,
                })
            })
            .collect()
    }

    fn checked_page_count(
        document: &SourceDocument,
        source: &Document,
    ) -> Result<u32, PipelineError> {
        let page_count = source.get_pages().len() as u32;
        if page_count == 0 {
            return Err(PipelineError::InvalidDocument(format!(
                "{}: document has no pages",
                document.source_id
            )));
        }
        if let Some(declared) = document.page_count {
            if declared != page_count {
                return Err(PipelineError::InvalidDocument(format!(
                    "{}: declared {} pages but found {}",
                    document.source_id, declared, page_count
                )));
            }
        }
        Ok(page_count)
    }
}

fn load(document: &SourceDocument) -> Result<Document, PipelineError> {
    if document.bytes.is_empty() {
        return Err(PipelineError::InvalidDocument(format!(
            "{}: document is empty",
            document.source_id
        )));
    }
    Document::load_mem(&document.bytes).map_err(|e| {
        PipelineError::InvalidDocument(format!("{}: not a readable PDF: {}", document.source_id, e))
    })
}

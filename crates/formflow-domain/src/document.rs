//! Source documents, page ranges and form chunks

use crate::record::source_tag;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A multi-page scanned document delivered by the trigger source
///
/// Immutable once constructed; the pipeline only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    /// Path or identifier of the document (also the record partition key)
    pub source_id: String,

    /// Raw document bytes
    pub bytes: Vec<u8>,

    /// Page count declared by the trigger, if it supplied one
    ///
    /// The chunker always derives the real count from `bytes` and rejects
    /// the document when a declared count disagrees.
    pub page_count: Option<u32>,
}

impl SourceDocument {
    /// Create a source document without a declared page count
    pub fn new(source_id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            source_id: source_id.into(),
            bytes,
            page_count: None,
        }
    }

    /// Attach the page count the trigger reported
    pub fn with_page_count(mut self, page_count: u32) -> Self {
        self.page_count = Some(page_count);
        self
    }

    /// File stem of the source id (last path segment without extension)
    ///
    /// # Examples
    ///
    /// ```
    /// use formflow_domain::SourceDocument;
    ///
    /// let doc = SourceDocument::new("incoming/2024/claims-batch.pdf", vec![]);
    /// assert_eq!(doc.stem(), "claims-batch");
    /// ```
    pub fn stem(&self) -> &str {
        source_stem(&self.source_id)
    }
}

fn source_stem(source_id: &str) -> &str {
    let name = source_id
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(source_id);
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

/// Inclusive, 1-indexed page range within a source document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRange {
    /// First page (1-indexed)
    pub start: u32,
    /// Last page (inclusive)
    pub end: u32,
}

impl PageRange {
    /// Create a page range
    ///
    /// # Panics
    /// Panics if `start` is 0 or `start > end`
    pub fn new(start: u32, end: u32) -> Self {
        assert!(start >= 1, "Page ranges are 1-indexed");
        assert!(start <= end, "Page range start must be <= end");
        Self { start, end }
    }

    /// Number of pages covered
    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    /// Ranges are never empty; provided for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check whether a page falls inside the range
    pub fn contains(&self, page: u32) -> bool {
        page >= self.start && page <= self.end
    }

    /// Iterate the page numbers in the range
    pub fn pages(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Plan the page ranges for splitting `page_count` pages into forms of
/// `chunk_span` pages each
///
/// Ranges are returned in page order and partition `[1, page_count]`; the
/// last range is shorter when `page_count` is not a multiple of `chunk_span`.
/// Returns an empty plan when either argument is zero.
///
/// # Examples
///
/// ```
/// use formflow_domain::plan_page_ranges;
///
/// let ranges: Vec<String> = plan_page_ranges(5, 2).iter().map(|r| r.to_string()).collect();
/// assert_eq!(ranges, vec!["1-2", "3-4", "5-5"]);
/// ```
pub fn plan_page_ranges(page_count: u32, chunk_span: u32) -> Vec<PageRange> {
    if page_count == 0 || chunk_span == 0 {
        return Vec::new();
    }

    let total_forms = page_count.div_ceil(chunk_span);
    (0..total_forms)
        .map(|i| {
            let start = i * chunk_span + 1;
            let end = std::cmp::min(start + chunk_span - 1, page_count);
            PageRange { start, end }
        })
        .collect()
}

/// One form cut out of a source document
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Source document identifier
    pub source_id: String,

    /// Position of this form in page order (1-indexed)
    pub form_number: u32,

    /// Number of forms the source was split into (same for every chunk)
    pub total_forms: u32,

    /// Pages of the source this chunk covers
    pub page_range: PageRange,

    /// Bytes of the standalone chunk document
    pub bytes: Vec<u8>,
}

impl Chunk {
    /// Name to store the chunk artifact under
    ///
    /// The file stem keeps names readable; the source tag keeps sources
    /// with the same file name in different folders apart.
    ///
    /// # Examples
    ///
    /// ```
    /// use formflow_domain::{source_tag, Chunk, PageRange};
    ///
    /// let chunk = Chunk {
    ///     source_id: "scans/intake.pdf".to_string(),
    ///     form_number: 2,
    ///     total_forms: 3,
    ///     page_range: PageRange::new(3, 4),
    ///     bytes: vec![],
    /// };
    /// assert_eq!(
    ///     chunk.suggested_name(),
    ///     format!("intake_{}_form_2_of_3.pdf", source_tag("scans/intake.pdf"))
    /// );
    /// ```
    pub fn suggested_name(&self) -> String {
        format!(
            "{}_{}_form_{}_of_{}.pdf",
            source_stem(&self.source_id),
            source_tag(&self.source_id),
            self.form_number,
            self.total_forms
        )
    }
}

// Chunk bytes can be large; keep Debug output readable.
impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("source_id", &self.source_id)
            .field("form_number", &self.form_number)
            .field("total_forms", &self.total_forms)
            .field("page_range", &self.page_range)
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .finish()
    }
}

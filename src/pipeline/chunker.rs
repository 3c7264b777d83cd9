//! Chunk planning: split documents into bounded, order-preserving segments.
//!
//! Multi-document input is joined with one marker line per document so the
//! model can attribute what it reads. Cuts prefer the strongest boundary in
//! the last fifth of the window: document marker, paragraph, line, sentence,
//! then whitespace. With no boundary in the window the cut is hard.

use std::ops::Range;

use super::types::{Chunk, Document};
use super::PipelineError;
use crate::pipeline_config::ChunkingConfig;

/// Format of the boundary line placed before each document.
pub fn document_marker(n: usize, total: usize, doc: &Document) -> String {
    format!("=== DOCUMENT {n}/{total}: {} [{}] ===", doc.source_id, doc.role)
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    max_chunk_chars: usize,
    overlap_chars: usize,
}

/// Planned text with char-indexed marker and document regions.
struct Layout {
    chars: Vec<char>,
    /// Marker line ranges (without the trailing newline). Atomic.
    markers: Vec<Range<usize>>,
    /// Region owned by each source: its marker plus its text.
    regions: Vec<(String, Range<usize>)>,
}

impl ChunkPlanner {
    pub fn new(max_chunk_chars: usize, overlap_chars: usize) -> Result<Self, PipelineError> {
        if max_chunk_chars == 0 || overlap_chars >= max_chunk_chars {
            return Err(PipelineError::InvalidConfig(format!(
                "max_chunk_chars ({max_chunk_chars}) must be greater than overlap_chars ({overlap_chars})"
            )));
        }
        Ok(Self {
            max_chunk_chars,
            overlap_chars,
        })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self, PipelineError> {
        Self::new(config.max_chunk_chars, config.overlap_chars)
    }

    pub fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }

    /// The exact text that chunk spans index into.
    pub fn planned_text(&self, documents: &[Document]) -> Result<String, PipelineError> {
        Ok(layout(documents)?.chars.into_iter().collect())
    }

    pub fn plan(&self, documents: &[Document]) -> Result<Vec<Chunk>, PipelineError> {
        let layout = layout(documents)?;
        let len = layout.chars.len();

        if len <= self.max_chunk_chars {
            return Ok(vec![Chunk {
                index: 0,
                total: 1,
                text: layout.chars.iter().collect(),
                char_span: 0..len,
                sources: layout.regions.iter().map(|(id, _)| id.clone()).collect(),
            }]);
        }

        for (marker, (source_id, _)) in layout.markers.iter().zip(&layout.regions) {
            if marker.len() > self.max_chunk_chars {
                return Err(PipelineError::DocumentTooLarge {
                    source_id: source_id.clone(),
                    chars: marker.len(),
                    max_chunk_chars: self.max_chunk_chars,
                });
            }
        }

        let tolerance = self.max_chunk_chars / 5;
        let mut spans = Vec::new();
        let mut start = 0;

        loop {
            if len - start <= self.max_chunk_chars {
                spans.push(start..len);
                break;
            }

            let limit = start + self.max_chunk_chars;
            let window_lo = (limit - tolerance).max(start + 1);
            let end = find_break(&layout, start, window_lo, limit);
            spans.push(start..end);

            let mut next = end.saturating_sub(self.overlap_chars).max(start + 1);
            if let Some(marker) = marker_containing(&layout.markers, next) {
                // Overlap may not begin mid-marker; start after it instead.
                next = marker.end;
            }
            start = next;
        }

        let total = spans.len();
        tracing::debug!(
            chunks = total,
            planned_chars = len,
            max_chunk_chars = self.max_chunk_chars,
            "Planned chunks"
        );

        Ok(spans
            .into_iter()
            .enumerate()
            .map(|(index, span)| Chunk {
                index,
                total,
                text: layout.chars[span.clone()].iter().collect(),
                sources: sources_for(&layout.regions, &span),
                char_span: span,
            })
            .collect())
    }
}

/// Convenience wrapper over [`ChunkPlanner`].
pub fn plan(
    documents: &[Document],
    max_chunk_chars: usize,
    overlap_chars: usize,
) -> Result<Vec<Chunk>, PipelineError> {
    ChunkPlanner::new(max_chunk_chars, overlap_chars)?.plan(documents)
}

fn layout(documents: &[Document]) -> Result<Layout, PipelineError> {
    let docs: Vec<&Document> = documents
        .iter()
        .filter(|d| !d.text.trim().is_empty())
        .collect();

    if docs.is_empty() {
        return Err(PipelineError::InvalidInput(
            "no document with non-empty text was supplied".into(),
        ));
    }

    if let [doc] = docs.as_slice() {
        let chars: Vec<char> = doc.text.chars().collect();
        let len = chars.len();
        return Ok(Layout {
            chars,
            markers: Vec::new(),
            regions: vec![(doc.source_id.clone(), 0..len)],
        });
    }

    let total = docs.len();
    let mut chars = Vec::new();
    let mut markers = Vec::with_capacity(total);
    let mut regions = Vec::with_capacity(total);

    for (i, doc) in docs.iter().enumerate() {
        if i > 0 {
            chars.extend("\n\n".chars());
        }
        let region_start = chars.len();
        chars.extend(document_marker(i + 1, total, doc).chars());
        markers.push(region_start..chars.len());
        chars.push('\n');
        chars.extend(doc.text.chars());
        regions.push((doc.source_id.clone(), region_start..chars.len()));
    }

    Ok(Layout {
        chars,
        markers,
        regions,
    })
}

fn marker_containing(markers: &[Range<usize>], pos: usize) -> Option<&Range<usize>> {
    markers.iter().find(|m| m.start < pos && pos < m.end)
}

/// Choose a cut in `[lo, hi]`, scanning backwards from `hi` per boundary kind.
fn find_break(layout: &Layout, start: usize, lo: usize, hi: usize) -> usize {
    let chars = &layout.chars;
    let allowed = |p: usize| marker_containing(&layout.markers, p).is_none();

    if let Some(m) = layout
        .markers
        .iter()
        .rev()
        .find(|m| m.start >= lo && m.start <= hi)
    {
        return m.start;
    }

    let preferences: [&dyn Fn(usize) -> bool; 4] = [
        &|p: usize| p >= 2 && chars[p - 1] == '\n' && chars[p - 2] == '\n',
        &|p: usize| chars[p - 1] == '\n',
        &|p: usize| {
            p >= 2 && chars[p - 1].is_whitespace() && matches!(chars[p - 2], '.' | '!' | '?')
        },
        &|p: usize| chars[p - 1].is_whitespace(),
    ];

    for is_boundary in preferences {
        if let Some(p) = (lo..=hi).rev().find(|&p| allowed(p) && is_boundary(p)) {
            return p;
        }
    }

    // Hard cut, pulled back to a marker start if it would split one.
    match marker_containing(&layout.markers, hi) {
        Some(m) if m.start > start => m.start,
        _ => hi,
    }
}

fn sources_for(regions: &[(String, Range<usize>)], span: &Range<usize>) -> Vec<String> {
    regions
        .iter()
        .filter(|(_, r)| r.start < span.end && span.start < r.end)
        .map(|(id, _)| id.clone())
        .collect()
}

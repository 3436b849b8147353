//! C6 — Processor registry: file-extension -> extractor yielding text and
//! structured metadata. Wraps the teacher's `processing::parser::DocumentParser`
//! (which already dispatches PDF/Office/image extraction by extension)
//! behind the `can_process`/`process` contract. Extractor failures are
//! non-fatal: they fall back to plain-text extraction for that file.

use crate::chunking::{Chunk, SizeBasedChunker};
use crate::processing::parser::{DocumentParser, ParsedDocument};
use crate::types::DocumentSection;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

pub struct ProcessResult {
    pub status: ProcessStatus,
    pub text: String,
    pub title: String,
    pub metadata: HashMap<String, String>,
    pub structured_sections: Vec<DocumentSection>,
    /// Pre-chunked output for formats whose structure (page, sheet, table)
    /// is worth preserving as chunk metadata. `None` means the caller must
    /// still run the chunker over `text` (§4.5 step 4).
    pub chunks: Option<Vec<Chunk>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Ok,
    FellBackToText,
}

/// Extensions the registry recognizes as "real" formats it knows how to
/// extract specially. Anything else falls through to the generic
/// plain-text extractor, matching §4.4.
const KNOWN_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "xlsx", "xls", "ods", "xlsm", "xlsb", "pptx", "html", "htm", "png", "jpg",
    "jpeg", "bmp", "tiff", "tif", "txt", "md", "markdown", "json", "csv",
];

pub struct ProcessorRegistry {
    parser: DocumentParser,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::with_chunk_budget(1750, 200)
    }

    /// `chunk_size`/`chunk_overlap` bound the text any single pre-chunked
    /// structural section (a PDF page, a spreadsheet sheet) is split into,
    /// matching the chunker's own budget (§4.3) when sections run long.
    pub fn with_chunk_budget(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            parser: DocumentParser::new(),
            chunk_size,
            chunk_overlap,
        }
    }

    pub fn can_process(&self, path: &Path) -> bool {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        KNOWN_EXTENSIONS.contains(&ext.as_str()) || true // generic text fallback always applies
    }

    /// Extract text and structured metadata from `path`. On any processor
    /// failure, falls back to a raw plain-text read (lossy for non-UTF8
    /// bytes) and reports `ProcessStatus::FellBackToText`.
    pub fn process(&self, path: &Path) -> ProcessResult {
        match self.parser.parse_file(path) {
            Ok(ParsedDocument {
                content,
                title,
                metadata,
                structured_sections,
                ..
            }) => {
                let chunks = self.chunks_from_sections(&structured_sections);
                ProcessResult {
                    status: ProcessStatus::Ok,
                    text: content,
                    title,
                    metadata,
                    structured_sections,
                    chunks,
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "processor failed, falling back to plain text");
                let text = std::fs::read(path)
                    .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
                    .unwrap_or_default();
                let title = path
                    .file_stem()
                    .and_then(|n| n.to_str())
                    .unwrap_or("untitled")
                    .to_string();
                ProcessResult {
                    status: ProcessStatus::FellBackToText,
                    text,
                    title,
                    metadata: HashMap::new(),
                    structured_sections: Vec::new(),
                    chunks: None,
                }
            }
        }
    }

    /// Turns structural sections (PDF pages, form fields, spreadsheet
    /// sheets) into pre-chunked output carrying page/sheet/table metadata,
    /// per §4.4's "a processor's `chunks[]` already carries structural
    /// metadata" contract. Returns `None` when there is nothing structural
    /// to preserve, so the caller falls back to chunking the flat text.
    fn chunks_from_sections(&self, sections: &[DocumentSection]) -> Option<Vec<Chunk>> {
        if sections.is_empty() {
            return None;
        }

        let splitter = SizeBasedChunker::new(self.chunk_size, self.chunk_overlap);
        let mut chunks = Vec::new();

        let mut push_piece = |text: String, extra: Map<String, Value>| {
            for piece in splitter.chunk(&text) {
                let mut meta = extra.clone();
                meta.insert(
                    "chunking_method".to_string(),
                    Value::String("structured".to_string()),
                );
                for (k, v) in piece.metadata {
                    meta.entry(k).or_insert(v);
                }
                let index = chunks.len();
                chunks.push(Chunk {
                    text: piece.text,
                    chunk_index: index,
                    metadata: meta,
                });
            }
        };

        for section in sections {
            match section {
                DocumentSection::Text { content, page, heading } => {
                    if content.trim().is_empty() {
                        continue;
                    }
                    let mut extra = Map::new();
                    extra.insert("page".to_string(), Value::Number((*page as u64).into()));
                    extra.insert("section_type".to_string(), Value::String("text".to_string()));
                    if let Some(h) = heading {
                        extra.insert("heading".to_string(), Value::String(h.clone()));
                    }
                    push_piece(content.clone(), extra);
                }
                DocumentSection::FormFields { fields, page } => {
                    if fields.is_empty() {
                        continue;
                    }
                    let text = fields
                        .iter()
                        .map(|(k, v)| format!("{k}: {v}"))
                        .collect::<Vec<_>>()
                        .join("\n");
                    let mut extra = Map::new();
                    extra.insert("page".to_string(), Value::Number((*page as u64).into()));
                    extra.insert(
                        "section_type".to_string(),
                        Value::String("form_fields".to_string()),
                    );
                    push_piece(text, extra);
                }
                DocumentSection::Table { headers, rows, page, caption } => {
                    if rows.is_empty() {
                        continue;
                    }
                    let mut text = headers.join(" | ");
                    for row in rows {
                        text.push('\n');
                        text.push_str(&row.join(" | "));
                    }
                    let mut extra = Map::new();
                    extra.insert("page".to_string(), Value::Number((*page as u64).into()));
                    extra.insert("sheet".to_string(), Value::Number((*page as u64).into()));
                    extra.insert("section_type".to_string(), Value::String("table".to_string()));
                    if let Some(c) = caption {
                        extra.insert("caption".to_string(), Value::String(c.clone()));
                    }
                    push_piece(text, extra);
                }
                DocumentSection::Relationships { content } => {
                    if content.trim().is_empty() {
                        continue;
                    }
                    let mut extra = Map::new();
                    extra.insert(
                        "section_type".to_string(),
                        Value::String("relationships".to_string()),
                    );
                    push_piece(content.clone(), extra);
                }
            }
        }

        if chunks.is_empty() {
            None
        } else {
            Some(chunks)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn plain_text_file_processes_directly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "hello world").unwrap();

        let registry = ProcessorRegistry::new();
        assert!(registry.can_process(&path));
        let result = registry.process(&path);
        assert_eq!(result.status, ProcessStatus::Ok);
        assert!(result.text.contains("hello world"));
    }

    #[test]
    fn unreadable_file_falls_back_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.pdf");
        let registry = ProcessorRegistry::new();
        let result = registry.process(&path);
        assert_eq!(result.status, ProcessStatus::FellBackToText);
    }

    #[test]
    fn plain_text_has_no_pre_chunked_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "hello world").unwrap();
        let registry = ProcessorRegistry::new();
        let result = registry.process(&path);
        assert!(result.chunks.is_none());
    }

    #[test]
    fn structured_sections_become_pre_chunked_output_with_page_metadata() {
        let registry = ProcessorRegistry::with_chunk_budget(1750, 200);
        let sections = vec![
            DocumentSection::Text {
                content: "Paris is the capital of France.".to_string(),
                page: 1,
                heading: None,
            },
            DocumentSection::Table {
                headers: vec!["City".to_string(), "Country".to_string()],
                rows: vec![vec!["Paris".to_string(), "France".to_string()]],
                page: 2,
                caption: Some("Capitals".to_string()),
            },
        ];
        let chunks = registry.chunks_from_sections(&sections).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata.get("page").and_then(|v| v.as_u64()), Some(1));
        assert_eq!(
            chunks[0].metadata.get("section_type").and_then(|v| v.as_str()),
            Some("text")
        );
        assert_eq!(
            chunks[1].metadata.get("caption").and_then(|v| v.as_str()),
            Some("Capitals")
        );
        assert_eq!(
            chunks[1].metadata.get("section_type").and_then(|v| v.as_str()),
            Some("table")
        );
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
        }
    }

    #[test]
    fn empty_sections_yield_no_pre_chunked_output() {
        let registry = ProcessorRegistry::new();
        assert!(registry.chunks_from_sections(&[]).is_none());
    }
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum DocumentFormat {
    TXT,
    MD,
    HTML,
    JSON,
    PDF,
    CSV,
    Spreadsheet,
    Presentation,
    Code,
}

impl DocumentFormat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "txt" => Self::TXT,
            "md" | "markdown" => Self::MD,
            "html" | "htm" => Self::HTML,
            "json" => Self::JSON,
            "pdf" => Self::PDF,
            "csv" => Self::CSV,
            "xlsx" | "xls" | "ods" | "xlsm" | "xlsb" => Self::Spreadsheet,
            "pptx" | "ppt" | "odp" => Self::Presentation,
            "rs" | "py" | "js" | "ts" | "jsx" | "tsx" | "go" | "java" | "c" | "cpp" | "h"
            | "hpp" | "cs" | "rb" | "php" | "swift" | "kt" | "scala" | "r" | "sql" | "sh"
            | "bash" | "zsh" | "fish" | "ps1" | "bat" | "cmd" | "yaml" | "yml" | "toml" | "xml"
            | "ini" | "cfg" | "conf" | "env" | "dockerfile" | "makefile" => Self::Code,
            _ => Self::TXT,
        }
    }
}

/// Structured section extracted from a document (PDF form, table, etc.).
/// Used to produce high-quality, relationship-preserving chunks.
#[derive(Debug, Clone)]
pub enum DocumentSection {
    /// Narrative text from a page.
    Text {
        content: String,
        page: usize,
        heading: Option<String>,
    },
    /// Form field key-value pairs (AcroForm, annotations).
    FormFields {
        fields: Vec<(String, String)>,
        page: usize,
    },
    /// Tabular data.
    Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
        page: usize,
        caption: Option<String>,
    },
    /// Synthesized relationship text from form data + annotations.
    Relationships { content: String },
}

/// Internal chunk record for storage operations
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub doc_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub title: String,
    pub source: String,
    pub heading: String,
    pub vector: Vec<f32>,
    pub space_id: String,
    pub metadata_json: String,
    pub citation_json: String,
    pub created_at: i64,
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Text,
    Pdf,
}

impl FileType {
    /// Map a file extension (without the dot, any case) to a supported type.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" => Some(FileType::Text),
            "pdf" => Some(FileType::Pdf),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileType::Text => write!(f, "txt"),
            FileType::Pdf => write!(f, "pdf"),
        }
    }
}

/// A bounded slice of a source document, the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub content: String,
    pub source_path: String,
    pub file_type: FileType,
    /// Position of this chunk within its source file, starting at 0.
    pub chunk_index: usize,
    pub origin_filename: String,
}

impl DocumentChunk {
    pub fn new(content: String, source: &Path, file_type: FileType, chunk_index: usize) -> Self {
        let origin_filename = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.display().to_string());

        Self {
            content,
            source_path: source.display().to_string(),
            file_type,
            chunk_index,
            origin_filename,
        }
    }
}

//! Document Loader
//!
//! Reads `.txt` and `.pdf` files from a flat knowledge-base directory and
//! splits them into overlapping chunks.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::document::{DocumentChunk, FileType};
use super::splitter::TextSplitter;
use crate::{Error, Result};

/// Loader for a flat directory of runbooks and operating procedures
#[derive(Debug, Clone)]
pub struct DocumentLoader {
    dir: PathBuf,
    splitter: TextSplitter,
}

impl DocumentLoader {
    pub fn new(dir: impl Into<PathBuf>, splitter: TextSplitter) -> Self {
        Self {
            dir: dir.into(),
            splitter,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every supported file in the directory.
    ///
    /// Subdirectories are not visited and unknown extensions are ignored. A
    /// file that cannot be read or parsed is logged and skipped; it never
    /// aborts the rest of the load.
    pub fn load_all(&self) -> Vec<DocumentChunk> {
        if !self.dir.is_dir() {
            warn!("Knowledge-base directory does not exist: {}", self.dir.display());
            return Vec::new();
        }

        let mut files = match self.list_files() {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to list knowledge-base directory {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };
        files.sort();

        let mut all_chunks = Vec::new();

        for path in files {
            let Some(file_type) = FileType::from_path(&path) else {
                debug!("Skipping unsupported file: {}", path.display());
                continue;
            };

            info!("Loading {} file: {}", file_type, path.display());
            let result = match file_type {
                FileType::Text => self.load_text_file(&path),
                FileType::Pdf => self.load_pdf_file(&path),
            };

            match result {
                Ok(chunks) if chunks.is_empty() => {
                    warn!("No extractable text in {}, skipping", path.display());
                }
                Ok(chunks) => {
                    info!("Loaded {} chunks from {}", chunks.len(), path.display());
                    all_chunks.extend(chunks);
                }
                Err(e) => {
                    warn!("Failed to load {}: {}", path.display(), e);
                }
            }
        }

        info!("Loaded {} chunks in total from {}", all_chunks.len(), self.dir.display());
        all_chunks
    }

    fn list_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    pub fn load_text_file(&self, path: &Path) -> Result<Vec<DocumentChunk>> {
        let text = std::fs::read_to_string(path)?;
        Ok(self.chunk_text(&text, path, FileType::Text))
    }

    pub fn load_pdf_file(&self, path: &Path) -> Result<Vec<DocumentChunk>> {
        // pdf-extract panics on some malformed inputs instead of returning an error.
        let text = std::panic::catch_unwind(|| pdf_extract::extract_text(path))
            .map_err(|_| Error::Document(format!("PDF parser panicked on {}", path.display())))?
            .map_err(|e| Error::Document(format!("failed to extract text from {}: {}", path.display(), e)))?;
        Ok(self.chunk_text(&text, path, FileType::Pdf))
    }

    fn chunk_text(&self, text: &str, path: &Path, file_type: FileType) -> Vec<DocumentChunk> {
        self.splitter
            .split_text(text)
            .into_iter()
            .enumerate()
            .map(|(i, content)| DocumentChunk::new(content, path, file_type, i))
            .collect()
    }
}

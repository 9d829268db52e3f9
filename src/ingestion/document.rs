//! Document text extraction.
//!
//! PDF parsing happens outside this crate; anything that can turn a file into
//! text plus layout hints plugs in through [`DocumentExtractor`]. The bundled
//! [`PlainTextExtractor`] reads `.txt` and `.md` files, such as the output of
//! `pdftotext`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::segmenter::LayoutHints;

/// Errors that can occur while reading a document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// Missing, encrypted, binary or otherwise unreadable input
    #[error("Unreadable document {path}: {reason}")]
    UnreadableDocument { path: PathBuf, reason: String },

    #[error("Unsupported document type: {0}")]
    Unsupported(PathBuf),
}

/// Result type for document extraction.
pub type DocumentResult<T> = Result<T, DocumentError>;

/// Text and layout of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub text: String,
    pub hints: LayoutHints,
}

/// Turns a file into text the segmenter can work on.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    /// Read `path` and return its normalized text with layout hints.
    ///
    /// # Errors
    /// Returns `DocumentError::UnreadableDocument` for input that cannot be
    /// read or decoded
    async fn extract(&self, path: &Path) -> DocumentResult<ExtractedDocument>;

    /// Whether this extractor handles files like `path`.
    fn supports(&self, path: &Path) -> bool;
}

/// Extractor for UTF-8 text and Markdown files.
#[derive(Debug, Clone, Default)]
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    const EXTENSIONS: [&'static str; 3] = ["txt", "md", "markdown"];
}

/// Normalize extracted text.
///
/// Line endings become `\n`, whitespace runs inside a line collapse to one
/// space, and runs of blank lines collapse to a single paragraph break.
pub fn normalize_whitespace(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank = false;

    for line in unified.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            if !blank {
                out.push('\n');
            }
            blank = true;
            continue;
        }
        blank = false;
        out.push_str(&collapsed);
        out.push('\n');
    }
    out.trim().to_string()
}

#[async_trait]
impl DocumentExtractor for PlainTextExtractor {
    async fn extract(&self, path: &Path) -> DocumentResult<ExtractedDocument> {
        if !self.supports(path) {
            return Err(DocumentError::Unsupported(path.to_path_buf()));
        }

        let unreadable = |reason: String| DocumentError::UnreadableDocument {
            path: path.to_path_buf(),
            reason,
        };

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| unreadable(e.to_string()))?;
        if bytes.contains(&0) {
            return Err(unreadable("file contains binary data".to_string()));
        }
        let raw = String::from_utf8(bytes).map_err(|e| unreadable(format!("not valid UTF-8: {}", e)))?;

        let text = normalize_whitespace(&raw);
        let hints = LayoutHints::infer(&text);
        debug!(
            path = %path.display(),
            bytes = text.len(),
            headings = hints.headings.len(),
            equations = hints.equations.len(),
            "Extracted plain text"
        );
        Ok(ExtractedDocument { text, hints })
    }

    fn supports(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                Self::EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }
}

/// Expand the given paths into the documents to process.
///
/// Directories contribute their supported files (not recursively), sorted by
/// name; files are kept as given, so unsupported ones still fail loudly.
pub fn collect_documents(
    paths: &[PathBuf],
    extractor: &dyn DocumentExtractor,
) -> std::io::Result<Vec<PathBuf>> {
    let mut documents = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && extractor.supports(p))
                .collect();
            found.sort();
            documents.extend(found);
        } else {
            documents.push(path.clone());
        }
    }
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_whitespace() {
        let raw = "  Title   line\r\n\r\n\r\n\tBody\x0ctext  here \n\n\nEnd";
        assert_eq!(normalize_whitespace(raw), "Title line\n\nBody text here\n\nEnd");
    }

    #[tokio::test]
    async fn test_extract_text_file_with_inferred_headings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paper.txt");
        std::fs::write(
            &path,
            "A Study of Sparse Attention Patterns\n\n1 Introduction\n\nWe study   sparse attention.\n",
        )
        .unwrap();

        let doc = PlainTextExtractor.extract(&path).await.unwrap();
        assert!(doc.text.contains("We study sparse attention."));
        assert_eq!(doc.hints.title.as_deref(), Some("A Study of Sparse Attention Patterns"));
        assert_eq!(doc.hints.headings[0].title, "1 Introduction");
    }

    #[tokio::test]
    async fn test_binary_and_missing_files_are_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.txt");
        std::fs::write(&path, [0x25, 0x50, 0x00, 0xff]).unwrap();

        assert!(matches!(
            PlainTextExtractor.extract(&path).await,
            Err(DocumentError::UnreadableDocument { .. })
        ));
        assert!(matches!(
            PlainTextExtractor.extract(&dir.path().join("absent.md")).await,
            Err(DocumentError::UnreadableDocument { .. })
        ));
        assert!(matches!(
            PlainTextExtractor.extract(&dir.path().join("paper.pdf")).await,
            Err(DocumentError::Unsupported(_))
        ));
    }

    #[test]
    fn test_collect_documents_expands_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.md"), "a").unwrap();
        std::fs::write(dir.path().join("c.pdf"), "c").unwrap();

        let found = collect_documents(&[dir.path().to_path_buf()], &PlainTextExtractor).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.md", "b.txt"]);
    }
}

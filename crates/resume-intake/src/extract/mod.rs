//! Text extraction from resume attachments.

pub mod docx;
pub mod pdf;
pub mod text;

use std::path::Path;

use crate::error::ExtractError;

/// Stored as a resume's raw text when the document has no text layer.
pub const NO_TEXT_LAYER_SENTINEL: &str = "[NO_TEXT_LAYER]";

/// Stored as a resume's raw text when its format cannot be read.
pub const UNSUPPORTED_SENTINEL: &str = "[UNSUPPORTED]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Text(String),
    /// The format is recognised as a document but not readable here.
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Text,
}

impl DocumentFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" | "text" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.split(';').next().unwrap_or_default().trim() {
            "application/pdf" => Some(Self::Pdf),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(Self::Docx)
            }
            "text/plain" => Some(Self::Text),
            _ => None,
        }
    }

    /// Extension first, then the declared MIME type.
    pub fn detect(filename: &str, mime: Option<&str>) -> Option<Self> {
        Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
            .or_else(|| mime.and_then(Self::from_mime))
    }
}

/// Extracts plain text from document bytes.
///
/// Returns [`ExtractError::NoTextLayer`] for documents that parse but carry
/// no text (scanned images); callers treat that as a poison condition.
pub trait TextExtractor: Send + Sync {
    fn extract(
        &self,
        bytes: &[u8],
        filename: &str,
        mime: Option<&str>,
    ) -> Result<Extracted, ExtractError>;
}

/// Routes to the PDF, DOCX or plain-text reader by detected format.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentExtractor;

impl DocumentExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl TextExtractor for DocumentExtractor {
    fn extract(
        &self,
        bytes: &[u8],
        filename: &str,
        mime: Option<&str>,
    ) -> Result<Extracted, ExtractError> {
        let Some(format) = DocumentFormat::detect(filename, mime) else {
            let kind = mime
                .map(str::to_string)
                .or_else(|| mime_guess::from_path(filename).first().map(|m| m.to_string()))
                .unwrap_or_else(|| "unknown".to_string());
            return Ok(Extracted::Unsupported(kind));
        };

        let text = match format {
            DocumentFormat::Pdf => pdf::extract_text(bytes)?,
            DocumentFormat::Docx => docx::extract_text(bytes)?,
            DocumentFormat::Text => text::extract_text(bytes),
        };
        Ok(Extracted::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_prefers_extension() {
        assert_eq!(
            DocumentFormat::detect("cv.PDF", Some("text/plain")),
            Some(DocumentFormat::Pdf)
        );
        assert_eq!(
            DocumentFormat::detect("cv", Some("application/pdf; name=cv")),
            Some(DocumentFormat::Pdf)
        );
        assert_eq!(DocumentFormat::detect("cv.doc", None), None);
    }

    #[test]
    fn test_unsupported_format_is_not_an_error() {
        let result = DocumentExtractor::new()
            .extract(b"{\\rtf1 hello}", "resume.rtf", None)
            .unwrap();
        assert!(matches!(result, Extracted::Unsupported(_)));
    }

    #[test]
    fn test_plain_text_routes() {
        let result = DocumentExtractor::new()
            .extract(b"Jane Doe\nEngineer", "resume.txt", None)
            .unwrap();
        assert_eq!(result, Extracted::Text("Jane Doe\nEngineer".to_string()));
    }
}

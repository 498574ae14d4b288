use crate::error::ExtractError;

/// Marker lopdf emits for CID fonts it cannot decode.
const IDENTITY_H_PATTERN: &str = "?Identity-H Unimplemented?";

/// Below this many characters the alphanumeric ratio is not checked.
const MIN_TOTAL_CHARS: usize = 50;

const MIN_ALPHANUMERIC_PERCENT: usize = 10;

/// Extracts the text layer of a PDF.
///
/// A PDF that loads but yields no usable text is reported as
/// [`ExtractError::NoTextLayer`]; an unparsable file as
/// [`ExtractError::PdfProcessing`].
pub fn extract_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let _span = tracing::info_span!("extract.pdf", bytes = bytes.len()).entered();

    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| ExtractError::PdfProcessing(format!("Failed to load PDF: {}", e)))?;

    let pages = doc.get_pages();
    let mut text = String::new();
    for page_num in pages.keys() {
        match doc.extract_text(&[*page_num]) {
            Ok(page_text) => {
                text.push_str(&page_text);
                text.push('\n');
            }
            Err(e) => tracing::debug!(page = page_num, error = %e, "Page text unreadable"),
        }
    }

    if lacks_text_layer(&text) {
        return Err(ExtractError::NoTextLayer(format!(
            "{} page(s) without extractable text",
            pages.len()
        )));
    }
    Ok(text.trim().to_string())
}

/// True for empty text, text made only of font-decoding markers, or text
/// that is mostly non-alphanumeric noise.
fn lacks_text_layer(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }

    let cleaned = trimmed
        .replace(IDENTITY_H_PATTERN, "")
        .replace(['\n', ' '], "");
    if cleaned.is_empty() {
        return true;
    }

    let total_chars = trimmed.chars().count();
    let alphanumeric_chars = trimmed.chars().filter(|c| c.is_alphanumeric()).count();
    total_chars > MIN_TOTAL_CHARS
        && alphanumeric_chars * 100 < total_chars * MIN_ALPHANUMERIC_PERCENT
}

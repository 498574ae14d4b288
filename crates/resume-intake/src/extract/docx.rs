use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::ExtractError;

/// Extracts paragraph text from `word/document.xml` of a DOCX archive.
pub fn extract_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractError::DocxProcessing(format!("Failed to open DOCX: {}", e)))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::DocxProcessing(format!("Failed to find document.xml: {}", e)))?
        .read_to_string(&mut xml)
        .map_err(|e| ExtractError::DocxProcessing(format!("Failed to read document.xml: {}", e)))?;

    let text = parse_document_xml(&xml)?;
    if text.trim().is_empty() {
        return Err(ExtractError::TextExtraction(
            "DOCX contains no text".to_string(),
        ));
    }
    Ok(text)
}

fn parse_document_xml(xml: &str) -> Result<String, ExtractError> {
    let mut reader = Reader::from_str(xml);

    let mut text = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => text.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"tab" => text.push('\t'),
                b"br" => text.push('\n'),
                _ => {}
            },
            Ok(Event::Text(ref e)) if in_text => {
                text.push_str(&unescape_entities(&String::from_utf8_lossy(e)));
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ExtractError::DocxProcessing(format!(
                    "XML parsing error: {}",
                    e
                )));
            }
            _ => {}
        }
    }

    Ok(text.trim_end().to_string())
}

fn unescape_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

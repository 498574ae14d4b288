/// Decodes plain text, replacing invalid UTF-8 and dropping a leading BOM.
pub fn extract_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

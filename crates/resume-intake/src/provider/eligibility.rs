//! Attachment eligibility: extension allow-list, size ceiling, real file.

use std::fmt;

use crate::config::EligibilityConfig;

use super::{AttachmentKind, AttachmentMeta};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligible {
    NotAFile,
    Inline,
    Extension(String),
    TooLarge { size: u64, limit: u64 },
    Empty,
}

impl fmt::Display for Ineligible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligible::NotAFile => write!(f, "not a file attachment"),
            Ineligible::Inline => write!(f, "inline attachment"),
            Ineligible::Extension(ext) => write!(f, "extension '{}' not allowed", ext),
            Ineligible::TooLarge { size, limit } => {
                write!(f, "{} bytes exceeds limit of {} bytes", size, limit)
            }
            Ineligible::Empty => write!(f, "empty attachment"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    allowed_extensions: Vec<String>,
    max_bytes: u64,
}

impl EligibilityFilter {
    pub fn new<I, S>(allowed_extensions: I, max_bytes: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            max_bytes,
        }
    }

    pub fn from_config(config: &EligibilityConfig) -> Self {
        Self::new(&config.allowed_extensions, config.max_attachment_bytes)
    }

    pub fn check(&self, attachment: &AttachmentMeta) -> Result<(), Ineligible> {
        if attachment.kind != AttachmentKind::File {
            return Err(Ineligible::NotAFile);
        }
        if attachment.is_inline {
            return Err(Ineligible::Inline);
        }

        let extension = extension_of(&attachment.name);
        if !self.allowed_extensions.iter().any(|e| *e == extension) {
            return Err(Ineligible::Extension(extension));
        }

        if attachment.size == 0 {
            return Err(Ineligible::Empty);
        }
        if attachment.size > self.max_bytes {
            return Err(Ineligible::TooLarge {
                size: attachment.size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Eligible attachments, in message order.
    pub fn eligible<'a>(&self, attachments: &'a [AttachmentMeta]) -> Vec<&'a AttachmentMeta> {
        attachments
            .iter()
            .filter(|a| match self.check(a) {
                Ok(()) => true,
                Err(reason) => {
                    tracing::debug!(attachment = %a.id, %reason, "Attachment ineligible");
                    false
                }
            })
            .collect()
    }
}

fn extension_of(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn file(name: &str, size: u64) -> AttachmentMeta {
        AttachmentMeta {
            id: format!("att-{}", name),
            name: name.to_string(),
            content_type: None,
            size,
            kind: AttachmentKind::File,
            is_inline: false,
        }
    }

    fn filter() -> EligibilityFilter {
        EligibilityFilter::from_config(&EligibilityConfig::default())
    }

    #[test]
    fn test_executable_rejected_at_any_size() {
        let f = filter();
        for size in [1, MB, 20 * MB] {
            assert_eq!(
                f.check(&file("resume.exe", size)),
                Err(Ineligible::Extension("exe".to_string()))
            );
        }
    }

    #[test]
    fn test_size_ceiling() {
        let f = EligibilityFilter::new(["pdf"], 10 * MB);
        assert!(matches!(
            f.check(&file("resume.pdf", 11 * MB)),
            Err(Ineligible::TooLarge { .. })
        ));
        assert_eq!(f.check(&file("resume.pdf", MB)), Ok(()));
        assert_eq!(f.check(&file("resume.pdf", 10 * MB)), Ok(()));
    }

    #[test]
    fn test_extension_is_case_insensitive() {
        let f = EligibilityFilter::new([".PDF"], 10 * MB);
        assert_eq!(f.check(&file("CV.Pdf", MB)), Ok(()));
        assert!(f.check(&file("resume", MB)).is_err());
    }

    #[test]
    fn test_real_file_check() {
        let f = filter();
        let mut item = file("forwarded.pdf", MB);
        item.kind = AttachmentKind::Item;
        assert_eq!(f.check(&item), Err(Ineligible::NotAFile));

        let mut inline = file("logo.pdf", MB);
        inline.is_inline = true;
        assert_eq!(f.check(&inline), Err(Ineligible::Inline));

        assert_eq!(f.check(&file("empty.pdf", 0)), Err(Ineligible::Empty));
    }

    #[test]
    fn test_eligible_keeps_order() {
        let f = filter();
        let attachments = vec![
            file("setup.exe", MB),
            file("resume.pdf", MB),
            file("cover.docx", MB),
        ];
        let names: Vec<_> = f.eligible(&attachments).iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["resume.pdf", "cover.docx"]);
    }
}

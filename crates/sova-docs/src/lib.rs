//! Sova Documents
//!
//! Text extraction from uploaded files and rendering of generated files

mod docx;
mod pdf;

pub use docx::{extract_docx_text, render_docx};
pub use pdf::{extract_pdf_text, render_pdf, EmbeddedFont, PdfLayout};

/// Extensions read as UTF-8 text.
pub const PLAIN_TEXT_EXTENSIONS: &[&str] = &["txt", "py", "html", "md", "json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Docx,
    Pdf,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("unsupported file format: {0}")]
    Unsupported(String),

    #[error("file is not valid UTF-8 text")]
    InvalidUtf8,

    #[error("failed to read {kind} document: {message}")]
    Extract { kind: &'static str, message: String },

    #[error("failed to render {kind} document: {message}")]
    Render { kind: &'static str, message: String },
}

fn extension(file_name: &str) -> Option<String> {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

/// How an uploaded file can be read, if at all.
pub fn readable_kind(file_name: &str) -> Option<DocumentKind> {
    match extension(file_name)?.as_str() {
        "docx" => Some(DocumentKind::Docx),
        "pdf" => Some(DocumentKind::Pdf),
        ext if PLAIN_TEXT_EXTENSIONS.contains(&ext) => Some(DocumentKind::PlainText),
        _ => None,
    }
}

/// How a generated file is rendered. Anything that is not docx or pdf is text.
pub fn output_kind(file_name: &str) -> DocumentKind {
    match extension(file_name).as_deref() {
        Some("docx") => DocumentKind::Docx,
        Some("pdf") => DocumentKind::Pdf,
        _ => DocumentKind::PlainText,
    }
}

pub fn extract_text(file_name: &str, bytes: &[u8]) -> Result<String, DocumentError> {
    let kind = readable_kind(file_name)
        .ok_or_else(|| DocumentError::Unsupported(file_name.to_string()))?;
    match kind {
        DocumentKind::PlainText => String::from_utf8(bytes.to_vec())
            .map(|text| text.trim_start_matches('\u{feff}').to_string())
            .map_err(|_| DocumentError::InvalidUtf8),
        DocumentKind::Docx => extract_docx_text(bytes),
        DocumentKind::Pdf => extract_pdf_text(bytes),
    }
}

pub fn render(file_name: &str, body: &str) -> Result<Vec<u8>, DocumentError> {
    render_with_layout(file_name, body, &PdfLayout::default())
}

/// Like [`render`], with the page setup and font used for PDFs.
pub fn render_with_layout(
    file_name: &str,
    body: &str,
    layout: &PdfLayout,
) -> Result<Vec<u8>, DocumentError> {
    match output_kind(file_name) {
        DocumentKind::Docx => render_docx(body),
        DocumentKind::Pdf => render_pdf(body, layout),
        DocumentKind::PlainText => Ok(body.as_bytes().to_vec()),
    }
}

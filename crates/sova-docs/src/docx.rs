use crate::DocumentError;
use quick_xml::escape::{escape, resolve_predefined_entity};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/></Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/></Relationships>"#;

const DOCUMENT_HEAD: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>"#;

const DOCUMENT_TAIL: &str = "<w:sectPr/></w:body></w:document>";

fn extract_error(message: impl ToString) -> DocumentError {
    DocumentError::Extract {
        kind: "docx",
        message: message.to_string(),
    }
}

fn render_error(message: impl ToString) -> DocumentError {
    DocumentError::Render {
        kind: "docx",
        message: message.to_string(),
    }
}

/// Text of `word/document.xml`: runs concatenated, one line per paragraph.
pub fn extract_docx_text(bytes: &[u8]) -> Result<String, DocumentError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(extract_error)?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(extract_error)?
        .read_to_string(&mut xml)
        .map_err(extract_error)?;

    let mut reader = Reader::from_str(&xml);
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut in_paragraph = false;

    loop {
        match reader.read_event().map_err(extract_error)? {
            Event::Start(e) => match e.name().as_ref() {
                b"w:p" => {
                    in_paragraph = true;
                    current.clear();
                }
                b"w:t" => in_text = true,
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"w:p" => paragraphs.push(String::new()),
                b"w:tab" if in_paragraph => current.push('\t'),
                b"w:br" if in_paragraph => current.push('\n'),
                _ => {}
            },
            Event::Text(e) if in_text => {
                current.push_str(&e.decode().map_err(extract_error)?);
            }
            Event::GeneralRef(e) if in_text => {
                if let Some(ch) = e.resolve_char_ref().map_err(extract_error)? {
                    current.push(ch);
                } else {
                    let name = e.decode().map_err(extract_error)?;
                    match resolve_predefined_entity(&name) {
                        Some(value) => current.push_str(value),
                        None => {
                            current.push('&');
                            current.push_str(&name);
                            current.push(';');
                        }
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => {
                    in_paragraph = false;
                    paragraphs.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(paragraphs.join("\n").trim_end().to_string())
}

/// Minimal word-processing document, one paragraph per input line.
pub fn render_docx(body: &str) -> Result<Vec<u8>, DocumentError> {
    let mut document = String::from(DOCUMENT_HEAD);
    for line in body.lines() {
        if line.is_empty() {
            document.push_str("<w:p/>");
        } else {
            document.push_str("<w:p><w:r><w:t xml:space=\"preserve\">");
            document.push_str(&escape(line));
            document.push_str("</w:t></w:r></w:p>");
        }
    }
    document.push_str(DOCUMENT_TAIL);

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, content) in [
        ("[Content_Types].xml", CONTENT_TYPES),
        ("_rels/.rels", ROOT_RELS),
        ("word/document.xml", document.as_str()),
    ] {
        zip.start_file(name, options).map_err(render_error)?;
        zip.write_all(content.as_bytes()).map_err(render_error)?;
    }

    Ok(zip.finish().map_err(render_error)?.into_inner())
}

use crate::DocumentError;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Glyph ids per `bfchar` block; PostScript CMaps cap blocks at 100 entries.
const CMAP_BLOCK: usize = 100;

/// A TrueType font embedded as a CID font so any script it covers renders.
pub struct EmbeddedFont {
    data: Vec<u8>,
}

impl fmt::Debug for EmbeddedFont {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedFont")
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl EmbeddedFont {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, DocumentError> {
        ttf_parser::Face::parse(&data, 0).map_err(render_error)?;
        Ok(Self { data })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| render_error(format!("{}: {}", path.display(), e)))?;
        Self::from_bytes(data)
    }

    fn face(&self) -> Result<ttf_parser::Face<'_>, DocumentError> {
        ttf_parser::Face::parse(&self.data, 0).map_err(render_error)
    }
}

/// Page geometry in points. Defaults to A4 with 50 pt margins.
#[derive(Debug, Clone)]
pub struct PdfLayout {
    pub page_width: f32,
    pub page_height: f32,
    pub margin: f32,
    pub font_size: f32,
    pub line_height: f32,
    pub paragraph_gap: f32,
    /// Without a font, text is set in Helvetica and limited to Latin-1.
    pub font: Option<Arc<EmbeddedFont>>,
}

impl Default for PdfLayout {
    fn default() -> Self {
        Self {
            page_width: 595.0,
            page_height: 842.0,
            margin: 50.0,
            font_size: 12.0,
            line_height: 15.0,
            paragraph_gap: 5.0,
            font: None,
        }
    }
}

impl PdfLayout {
    /// Characters per line, assuming an average glyph of half the font size.
    fn max_chars(&self) -> usize {
        let usable = (self.page_width - 2.0 * self.margin).max(self.font_size);
        ((usable / (self.font_size * 0.5)).floor() as usize).max(1)
    }

    pub fn with_font(mut self, font: Arc<EmbeddedFont>) -> Self {
        self.font = Some(font);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PlacedLine {
    y: f32,
    text: String,
}

fn render_error(message: impl ToString) -> DocumentError {
    DocumentError::Render {
        kind: "pdf",
        message: message.to_string(),
    }
}

fn wrap_paragraph(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in paragraph.split_whitespace() {
        let mut chars: Vec<char> = word.chars().collect();

        while chars.len() > max_chars {
            if current_len > 0 {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let rest = chars.split_off(max_chars);
            lines.push(chars.into_iter().collect());
            chars = rest;
        }

        let word_len = chars.len();
        if word_len == 0 {
            continue;
        }
        if current_len > 0 && current_len + 1 + word_len > max_chars {
            lines.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push(' ');
            current_len += 1;
        }
        current.extend(chars);
        current_len += word_len;
    }

    if current_len > 0 || lines.is_empty() {
        lines.push(current);
    }
    lines
}

/// Lines placed top-down, with a page break whenever the cursor drops
/// below the bottom margin.
fn layout_pages(body: &str, layout: &PdfLayout) -> Vec<Vec<PlacedLine>> {
    let top = layout.page_height - layout.margin;
    let max_chars = layout.max_chars();
    let mut pages = vec![Vec::new()];
    let mut y = top;

    for paragraph in body.lines() {
        for text in wrap_paragraph(paragraph, max_chars) {
            if y < layout.margin {
                pages.push(Vec::new());
                y = top;
            }
            if let Some(page) = pages.last_mut() {
                page.push(PlacedLine { y, text });
            }
            y -= layout.line_height;
        }
        y -= layout.paragraph_gap;
    }

    pages
}

/// Helvetica only covers WinAnsi; other characters become `?`.
fn encode_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
        .collect()
}

/// How line text turns into `Tj` operands for the page font.
enum TextEncoding {
    Latin1,
    /// Identity-H: two big-endian bytes of glyph id per character.
    Glyphs(BTreeMap<char, u16>),
}

impl TextEncoding {
    fn encode(&self, text: &str) -> Object {
        match self {
            TextEncoding::Latin1 => Object::string_literal(encode_latin1(text)),
            TextEncoding::Glyphs(glyphs) => {
                let bytes = text
                    .chars()
                    .flat_map(|c| glyphs.get(&c).copied().unwrap_or(0).to_be_bytes())
                    .collect();
                Object::String(bytes, StringFormat::Hexadecimal)
            }
        }
    }
}

fn add_helvetica(doc: &mut Document) -> ObjectId {
    doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    })
}

fn postscript_name(face: &ttf_parser::Face<'_>) -> String {
    let name: String = face
        .names()
        .into_iter()
        .filter(|name| name.name_id == ttf_parser::name_id::POST_SCRIPT_NAME)
        .find_map(|name| name.to_string())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if name.is_empty() {
        "SovaEmbedded".to_string()
    } else {
        name
    }
}

fn to_unicode_cmap(glyphs: &BTreeMap<char, u16>) -> Vec<u8> {
    let mut by_glyph: BTreeMap<u16, char> = BTreeMap::new();
    for (&c, &gid) in glyphs {
        by_glyph.entry(gid).or_insert(c);
    }
    let entries: Vec<(u16, char)> = by_glyph.into_iter().filter(|(gid, _)| *gid != 0).collect();

    let mut cmap = String::from(
        "/CIDInit /ProcSet findresource begin\n12 dict begin\nbegincmap\n\
         /CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def\n\
         /CMapName /Adobe-Identity-UCS def\n/CMapType 2 def\n\
         1 begincodespacerange\n<0000> <FFFF>\nendcodespacerange\n",
    );
    for block in entries.chunks(CMAP_BLOCK) {
        cmap.push_str(&format!("{} beginbfchar\n", block.len()));
        for (gid, c) in block {
            let mut units = [0u16; 2];
            let hex: String = c
                .encode_utf16(&mut units)
                .iter()
                .map(|unit| format!("{:04X}", unit))
                .collect();
            cmap.push_str(&format!("<{:04X}> <{}>\n", gid, hex));
        }
        cmap.push_str("endbfchar\n");
    }
    cmap.push_str("endcmap\nCMapName currentdict /defineresource pop\nend\nend\n");
    cmap.into_bytes()
}

/// Embeds `font` as a Type0/CIDFontType2 font covering the characters of
/// `text`. Characters the font has no glyph for render as `.notdef`.
fn add_embedded_font(
    doc: &mut Document,
    font: &EmbeddedFont,
    text: &str,
) -> Result<(ObjectId, BTreeMap<char, u16>), DocumentError> {
    let face = font.face()?;
    let scale = 1000.0 / f32::from(face.units_per_em().max(1));
    let to_pdf_units = |value: i16| (f32::from(value) * scale).round() as i64;

    let mut glyphs = BTreeMap::new();
    let mut missing = 0usize;
    for c in text.chars().filter(|c| !c.is_control()) {
        if glyphs.contains_key(&c) {
            continue;
        }
        let gid = match face.glyph_index(c) {
            Some(gid) => gid.0,
            None => {
                missing += 1;
                0
            }
        };
        glyphs.insert(c, gid);
    }
    if missing > 0 {
        warn!("PDF font has no glyph for {} distinct character(s)", missing);
    }

    let mut widths: BTreeMap<u16, i64> = BTreeMap::new();
    for &gid in glyphs.values() {
        let advance = face
            .glyph_hor_advance(ttf_parser::GlyphId(gid))
            .unwrap_or_default();
        widths.insert(gid, (f32::from(advance) * scale).round() as i64);
    }
    let w: Vec<Object> = widths
        .into_iter()
        .flat_map(|(gid, width)| [Object::from(i64::from(gid)), Object::Array(vec![width.into()])])
        .collect();

    let base_font = postscript_name(&face);
    let bbox = face.global_bounding_box();
    let ascent = to_pdf_units(face.ascender());

    let file_id = doc.add_object(Stream::new(
        dictionary! { "Length1" => font.data.len() as i64 },
        font.data.clone(),
    ));
    let descriptor_id = doc.add_object(dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => Object::Name(base_font.clone().into_bytes()),
        "Flags" => 32,
        "FontBBox" => vec![
            to_pdf_units(bbox.x_min).into(),
            to_pdf_units(bbox.y_min).into(),
            to_pdf_units(bbox.x_max).into(),
            to_pdf_units(bbox.y_max).into(),
        ],
        "ItalicAngle" => 0,
        "Ascent" => ascent,
        "Descent" => to_pdf_units(face.descender()),
        "CapHeight" => face.capital_height().map(to_pdf_units).unwrap_or(ascent),
        "StemV" => 80,
        "FontFile2" => file_id,
    });
    let cid_font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType2",
        "BaseFont" => Object::Name(base_font.clone().into_bytes()),
        "CIDSystemInfo" => dictionary! {
            "Registry" => Object::string_literal("Adobe"),
            "Ordering" => Object::string_literal("Identity"),
            "Supplement" => 0,
        },
        "FontDescriptor" => descriptor_id,
        "W" => w,
        "CIDToGIDMap" => "Identity",
    });
    let to_unicode_id = doc.add_object(Stream::new(Dictionary::new(), to_unicode_cmap(&glyphs)));
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => Object::Name(base_font.into_bytes()),
        "Encoding" => "Identity-H",
        "DescendantFonts" => vec![cid_font_id.into()],
        "ToUnicode" => to_unicode_id,
    });
    Ok((font_id, glyphs))
}

pub fn render_pdf(body: &str, layout: &PdfLayout) -> Result<Vec<u8>, DocumentError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let (font_id, encoding) = match &layout.font {
        Some(font) => {
            let (font_id, glyphs) = add_embedded_font(&mut doc, font, body)?;
            (font_id, TextEncoding::Glyphs(glyphs))
        }
        None => (add_helvetica(&mut doc), TextEncoding::Latin1),
    };
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids: Vec<Object> = Vec::new();
    for page in layout_pages(body, layout) {
        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), layout.font_size.into()]),
        ];
        for line in page {
            operations.push(Operation::new(
                "Tm",
                vec![
                    1.into(),
                    0.into(),
                    0.into(),
                    1.into(),
                    layout.margin.into(),
                    line.y.into(),
                ],
            ));
            operations.push(Operation::new("Tj", vec![encoding.encode(&line.text)]));
        }
        operations.push(Operation::new("ET", vec![]));

        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().map_err(render_error)?,
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => count,
        "Resources" => resources_id,
        "MediaBox" => vec![
            0.into(),
            0.into(),
            layout.page_width.into(),
            layout.page_height.into(),
        ],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).map_err(render_error)?;
    Ok(bytes)
}

/// Text of every page. Encrypted documents are refused up front.
pub fn extract_pdf_text(bytes: &[u8]) -> Result<String, DocumentError> {
    let extract_error = |message: String| DocumentError::Extract {
        kind: "pdf",
        message,
    };

    let doc = Document::load_mem(bytes).map_err(|e| extract_error(e.to_string()))?;
    if doc.is_encrypted() {
        return Err(extract_error("document is password protected".to_string()));
    }

    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| extract_error(e.to_string()))?;
    Ok(text.trim().to_string())
}

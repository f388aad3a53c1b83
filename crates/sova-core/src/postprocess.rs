//! Model answers to chat output: text, generated files and voice

use sova_docs::{DocumentKind, PdfLayout};
use sova_ipc::Messenger;
use sova_providers::SpeechSynthesizer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

const CREATING_FILE_NOTICE: &str = "⏳ Creating the file...";
const FALLBACK_FILE_NAME: &str = "document.txt";

const DIRECTIVE_OPEN: &str = "<GENERATE_FILE filename=\"";
const DIRECTIVE_NAME_END: &str = "\">";
const DIRECTIVE_CLOSE: &str = "</GENERATE_FILE>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDirective {
    pub filename: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub display_text: String,
    pub attachment: Option<FileDirective>,
}

/// The next complete directive at or after `from`: its byte range in
/// `text`, file name and body.
fn next_directive(text: &str, from: usize) -> Option<(usize, usize, &str, &str)> {
    let start = from + text[from..].find(DIRECTIVE_OPEN)?;
    let name_start = start + DIRECTIVE_OPEN.len();
    let name_end = name_start + text[name_start..].find(DIRECTIVE_NAME_END)?;
    let body_start = name_end + DIRECTIVE_NAME_END.len();
    let body_end = body_start + text[body_start..].find(DIRECTIVE_CLOSE)?;
    Some((
        start,
        body_end + DIRECTIVE_CLOSE.len(),
        &text[name_start..name_end],
        &text[body_start..body_end],
    ))
}

/// Split an answer into the text to show and the first file directive.
/// Every directive is removed from the display text; an unterminated tag
/// is left as plain text.
pub fn parse_response(text: &str) -> ParsedResponse {
    let mut display = String::with_capacity(text.len());
    let mut attachment = None;
    let mut cursor = 0;

    while let Some((start, end, filename, body)) = next_directive(text, cursor) {
        display.push_str(&text[cursor..start]);
        if attachment.is_none() {
            attachment = Some(FileDirective {
                filename: sanitize_file_name(filename),
                body: body.trim().to_string(),
            });
        }
        cursor = end;
    }
    display.push_str(&text[cursor..]);

    ParsedResponse {
        display_text: display.trim().to_string(),
        attachment,
    }
}

/// Last path component of a model-supplied file name.
fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .trim_start_matches('.');
    if base.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        base.to_string()
    }
}

/// Text handed to speech synthesis: markdown markers dropped, length capped.
pub fn speech_text(text: &str, max_chars: usize) -> String {
    text.chars()
        .filter(|c| !matches!(c, '*' | '_' | '`'))
        .take(max_chars)
        .collect()
}

fn document_caption(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Docx => "✅ Here is your document!",
        DocumentKind::Pdf => "✅ Here is your PDF!",
        DocumentKind::PlainText => "✅ The file is ready!",
    }
}

/// Delivers answers to a chat. Each artifact fails on its own: a broken
/// file or voice message never holds back the text before it.
pub struct PostProcessor {
    messenger: Arc<dyn Messenger>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    tmp_dir: PathBuf,
    max_speech_chars: usize,
    pdf_layout: PdfLayout,
}

impl PostProcessor {
    pub fn new(messenger: Arc<dyn Messenger>, tmp_dir: PathBuf) -> Self {
        Self {
            messenger,
            synthesizer: None,
            tmp_dir,
            max_speech_chars: 4000,
            pdf_layout: PdfLayout::default(),
        }
    }

    /// Page setup for generated PDFs, including the embedded font if any.
    pub fn with_pdf_layout(mut self, layout: PdfLayout) -> Self {
        self.pdf_layout = layout;
        self
    }

    pub fn with_synthesizer(
        mut self,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        max_chars: usize,
    ) -> Self {
        self.synthesizer = Some(synthesizer);
        self.max_speech_chars = max_chars.max(1);
        self
    }

    pub fn can_speak(&self) -> bool {
        self.synthesizer.is_some()
    }

    pub async fn deliver(&self, chat_id: i64, answer: &str, tts_mode: bool) {
        let parsed = parse_response(answer);

        if !parsed.display_text.is_empty() {
            if let Err(e) = self
                .messenger
                .send_text(chat_id, &parsed.display_text, None)
                .await
            {
                error!("Failed to send answer to chat {}: {}", chat_id, e);
            }
        }

        if let Some(directive) = parsed.attachment {
            self.send_file(chat_id, directive).await;
        }

        if tts_mode {
            self.send_speech(chat_id, &parsed.display_text).await;
        }
    }

    async fn send_file(&self, chat_id: i64, directive: FileDirective) {
        if let Err(e) = self
            .messenger
            .send_text(chat_id, CREATING_FILE_NOTICE, None)
            .await
        {
            debug!("Failed to send file notice to chat {}: {}", chat_id, e);
        }

        let kind = sova_docs::output_kind(&directive.filename);
        let FileDirective { filename, body } = directive;
        let name = filename.clone();
        let layout = self.pdf_layout.clone();
        let rendered = tokio::task::spawn_blocking(move || {
            sova_docs::render_with_layout(&name, &body, &layout)
        })
        .await;

        let outcome = match rendered {
            Ok(Ok(bytes)) => {
                info!(
                    "Sending generated file {} ({} bytes) to chat {}",
                    filename,
                    bytes.len(),
                    chat_id
                );
                self.messenger
                    .send_document(chat_id, &filename, bytes, Some(document_caption(kind)))
                    .await
            }
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(anyhow::anyhow!("render task failed: {}", e)),
        };

        if let Err(e) = outcome {
            error!("File generation failed for chat {}: {}", chat_id, e);
            let _ = self
                .messenger
                .send_text(
                    chat_id,
                    &format!("⚠️ Failed to create the file: {}", e),
                    None,
                )
                .await;
        }
    }

    async fn send_speech(&self, chat_id: i64, text: &str) {
        let Some(synthesizer) = &self.synthesizer else {
            debug!("Voice replies requested but no speech backend is configured");
            return;
        };

        let input = speech_text(text, self.max_speech_chars);
        if input.trim().is_empty() {
            return;
        }

        let audio = match synthesizer.synthesize(&input).await {
            Ok(audio) => audio,
            Err(e) => {
                error!("Speech synthesis failed for chat {}: {}", chat_id, e);
                return;
            }
        };

        let path = self
            .tmp_dir
            .join(format!("tts_{}_{}.mp3", chat_id, uuid::Uuid::new_v4()));
        if let Err(e) = write_temp_file(&path, &audio).await {
            error!("Failed to write voice file {}: {}", path.display(), e);
            return;
        }

        if let Err(e) = self.messenger.send_voice(chat_id, &path).await {
            error!("Failed to send voice reply to chat {}: {}", chat_id, e);
        }
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Failed to remove voice file {}: {}", path.display(), e);
        }
    }
}

async fn write_temp_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

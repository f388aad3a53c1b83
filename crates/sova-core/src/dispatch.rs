//! Per-event handling: commands, callbacks, inline queries and media

use crate::postprocess::PostProcessor;
use crate::router::{Router, TurnError, TurnOutcome};
use crate::search::{format_results, search_prompt, SearchEngine};
use anyhow::{anyhow, Result};
use base64::Engine;
use sova_ipc::{Envelope, InlineArticle, Messenger, MessageKind};
use sova_providers::Transcriber;
use sova_storage::{ContentPart, ImageUrl, MessageContent, Route, SessionStore};
use sova_telegram::keyboard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const TYPING_INTERVAL_SECS: u64 = 4;

const DEFAULT_DOCUMENT_PROMPT: &str = "Analyze this file.";
const DEFAULT_PHOTO_PROMPT: &str = "What is in this image?";
const THINKING_NOTICE: &str = "⏳ Thinking...";

const WELCOME_TEXT: &str = "Hi! I'm your AI assistant. I recognize voice, answer questions and draw pictures. Use /mode to choose a model.";

const HELP_TEXT: &str = "🤖 **What can I do?**\n\n\
🔹 **Chat:** I remember the context of our conversation. We can talk about anything!\n\
🔹 **Voice:** Send voice messages and I will turn them into text.\n\
🔹 **Photos:** In *Gemini* mode I can \"see\" pictures. Just send a photo.\n\
🔹 **Files:** Send files (.txt, .py, .html, .md, .json, .docx, .pdf) and I will read them.\n\
🔹 **Drawing:** In *Flux* mode I draw whatever you ask for.\n\
🔹 **Roles:** Use /system to give me a personality.\n\n\
⚙️ **Commands:**\n\
/mode - Choose a model\n\
/clear - Clear memory\n\
/search - Search the web\n\
/system - Set my role\n\
/tts - Toggle voice replies\n\
/profile - Your profile and referral link\n\
/donate - Support the author\n\
/feedback - Write to the developer";

const DEFAULT_DONATE_TEXT: &str = "✨ **A word from the creator**\n\n\
I put a lot of time into making this bot smart and useful for you. \
Your support pays for powerful models and new features.\n\n\
Every donation is a \"thank you\" that keeps the project going! 🚀\n\n\
Thank you for being here! 🤝";

/// Bot behaviour knobs taken from `[bot]` and `[telegram]`.
#[derive(Debug, Clone)]
pub struct BotSettings {
    pub admin_id: Option<i64>,
    pub max_document_bytes: u64,
    pub broadcast_delay: Duration,
    pub donate_text: String,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self::from_config(&sova_config::Config::default())
    }
}

impl BotSettings {
    pub fn from_config(config: &sova_config::Config) -> Self {
        Self {
            admin_id: config.telegram.admin_id,
            max_document_bytes: config.bot.max_document_bytes,
            broadcast_delay: Duration::from_millis(config.bot.broadcast_delay_ms),
            donate_text: config
                .bot
                .donate_text
                .clone()
                .filter(|text| !text.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DONATE_TEXT.to_string()),
        }
    }
}

/// Who an event came from and where replies go.
#[derive(Debug, Clone)]
struct Origin {
    user_id: i64,
    chat_id: i64,
    name: String,
    username: Option<String>,
}

/// Sends the `typing` action every few seconds until dropped.
struct TypingHeartbeat {
    stop: Arc<AtomicBool>,
}

impl TypingHeartbeat {
    fn start(messenger: Arc<dyn Messenger>, chat_id: i64) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        tokio::spawn(async move {
            while !stop_flag.load(Ordering::Relaxed) {
                if let Err(e) = messenger.send_chat_action(chat_id, "typing").await {
                    debug!("Typing action failed for chat {}: {}", chat_id, e);
                }
                tokio::time::sleep(Duration::from_secs(TYPING_INTERVAL_SECS)).await;
            }
        });

        Self { stop }
    }
}

impl Drop for TypingHeartbeat {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub struct Dispatcher {
    store: Arc<SessionStore>,
    router: Arc<Router>,
    messenger: Arc<dyn Messenger>,
    postprocess: PostProcessor,
    transcriber: Option<Arc<dyn Transcriber>>,
    search: Option<Arc<dyn SearchEngine>>,
    settings: BotSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<SessionStore>,
        router: Arc<Router>,
        messenger: Arc<dyn Messenger>,
        postprocess: PostProcessor,
        settings: BotSettings,
    ) -> Self {
        Self {
            store,
            router,
            messenger,
            postprocess,
            transcriber: None,
            search: None,
            settings,
        }
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn with_search(mut self, search: Arc<dyn SearchEngine>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn is_admin(&self, user_id: i64) -> bool {
        self.settings.admin_id == Some(user_id)
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.messenger.send_text(chat_id, text, None).await {
            error!("Failed to send reply to chat {}: {}", chat_id, e);
        }
    }

    async fn chat_action(&self, chat_id: i64, action: &str) {
        if let Err(e) = self.messenger.send_chat_action(chat_id, action).await {
            debug!("Chat action '{}' failed for chat {}: {}", action, chat_id, e);
        }
    }

    fn referral_link(&self, user_id: i64) -> Option<String> {
        self.messenger
            .bot_username()
            .map(|bot| format!("https://t.me/{}?start={}", bot, user_id))
    }

    pub async fn dispatch(&self, envelope: Envelope) -> Result<()> {
        let user_id = envelope
            .user_id
            .ok_or_else(|| anyhow!("event {} has no user id", envelope.trace_id))?;
        let origin = Origin {
            user_id,
            // Callbacks on inline results carry no chat; private chats share the user id.
            chat_id: envelope.chat_id.unwrap_or(user_id),
            name: envelope
                .payload_str("from_name")
                .map(str::to_string)
                .unwrap_or_else(|| user_id.to_string()),
            username: envelope.payload_str("username").map(str::to_string),
        };

        match envelope.kind {
            MessageKind::Command { name, args } => self.handle_command(&origin, &name, &args).await,
            MessageKind::Message { text, .. } => {
                self.handle_turn(&origin, MessageContent::Text(text)).await;
                Ok(())
            }
            MessageKind::Voice {
                file_id, mime_type, ..
            } => self.handle_voice(&origin, &file_id, mime_type.as_deref()).await,
            MessageKind::Document {
                file_id,
                file_name,
                file_size,
                caption,
            } => {
                self.handle_document(&origin, &file_id, &file_name, file_size, caption)
                    .await
            }
            MessageKind::Photo { file_id, caption } => {
                self.handle_photo(&origin, &file_id, caption).await
            }
            MessageKind::Callback { query_id, data } => {
                self.handle_callback(&origin, envelope.message_id, &query_id, &data)
                    .await
            }
            MessageKind::InlineQuery { query_id, .. } => {
                self.handle_inline_query(&origin, &query_id).await
            }
        }
    }

    async fn handle_command(&self, origin: &Origin, name: &str, args: &str) -> Result<()> {
        debug!("Command /{} from user {}", name, origin.user_id);
        match name {
            "start" => self.cmd_start(origin, args).await,
            "help" => {
                self.reply(origin.chat_id, HELP_TEXT).await;
                Ok(())
            }
            "mode" => {
                self.messenger
                    .send_text(origin.chat_id, "Choose a mode:", Some(self.model_keyboard()))
                    .await?;
                Ok(())
            }
            "clear" => {
                self.store
                    .update(origin.user_id, |s| s.clear_history())
                    .await?;
                self.reply(origin.chat_id, "🧹 Memory cleared.").await;
                Ok(())
            }
            "system" => self.cmd_system(origin, args).await,
            "tts" => self.cmd_tts(origin).await,
            "profile" => self.cmd_profile(origin).await,
            "donate" => {
                self.messenger
                    .send_text(
                        origin.chat_id,
                        &self.settings.donate_text,
                        Some(keyboard::donate_keyboard()),
                    )
                    .await?;
                Ok(())
            }
            "feedback" => self.cmd_feedback(origin, args).await,
            "search" => self.cmd_search(origin, args).await,
            "admin" if self.is_admin(origin.user_id) => self.cmd_admin(origin).await,
            "broadcast" if self.is_admin(origin.user_id) => self.cmd_broadcast(origin, args).await,
            "admin" | "broadcast" => {
                debug!("Ignoring /{} from non-admin {}", name, origin.user_id);
                Ok(())
            }
            other => {
                debug!("Ignoring unknown command /{}", other);
                Ok(())
            }
        }
    }

    fn model_keyboard(&self) -> sova_ipc::InlineKeyboard {
        keyboard::model_keyboard(
            self.router
                .registry()
                .entries()
                .iter()
                .map(|entry| (entry.label.as_str(), entry.id.as_str())),
        )
    }

    async fn cmd_start(&self, origin: &Origin, args: &str) -> Result<()> {
        let referrer = args.trim();
        if !referrer.is_empty()
            && referrer.chars().all(|c| c.is_ascii_digit())
            && !self.store.contains(origin.user_id).await
        {
            match referrer.parse::<i64>() {
                Ok(referrer_id) if referrer_id != origin.user_id => {
                    self.credit_referral(referrer_id, origin).await;
                }
                _ => {}
            }
        }

        self.store.reset(origin.user_id).await?;
        self.messenger
            .send_text(origin.chat_id, WELCOME_TEXT, Some(self.model_keyboard()))
            .await?;
        Ok(())
    }

    async fn credit_referral(&self, referrer_id: i64, origin: &Origin) {
        if let Err(e) = self
            .store
            .update(referrer_id, |s| s.referrals += 1)
            .await
        {
            error!("Failed to credit referral to {}: {}", referrer_id, e);
            return;
        }
        info!("User {} joined through referrer {}", origin.user_id, referrer_id);
        self.reply(
            referrer_id,
            &format!(
                "🎉 **You have a new referral!**\nUser {} joined through your link.",
                origin.name
            ),
        )
        .await;
    }

    async fn cmd_system(&self, origin: &Origin, args: &str) -> Result<()> {
        let prompt = args.trim();
        if prompt.is_empty() {
            let current = self.store.get(origin.user_id).await.system_prompt;
            self.reply(
                origin.chat_id,
                &format!(
                    "ℹ️ You can change how I behave by giving me a role. Current role:\n\n`{}`\n\n**Example:**\n`/system You are an experienced Paris tour guide`",
                    current
                ),
            )
            .await;
            return Ok(());
        }

        let prompt = prompt.to_string();
        let reply = format!("✅ New role set:\n\n_{}_", prompt);
        self.store
            .update(origin.user_id, |s| s.system_prompt = prompt)
            .await?;
        self.reply(origin.chat_id, &reply).await;
        Ok(())
    }

    async fn cmd_tts(&self, origin: &Origin) -> Result<()> {
        let mut enabled = false;
        self.store
            .update(origin.user_id, |s| enabled = s.toggle_tts())
            .await?;

        let mut text = format!(
            "🗣 **Voice replies:** {}",
            if enabled { "✅ On" } else { "❌ Off" }
        );
        if enabled && !self.postprocess.can_speak() {
            text.push_str("\n\n⚠️ Speech synthesis is not configured, so no audio will be sent.");
        }
        self.reply(origin.chat_id, &text).await;
        Ok(())
    }

    async fn cmd_profile(&self, origin: &Origin) -> Result<()> {
        let session = self.store.get(origin.user_id).await;
        let link = self
            .referral_link(origin.user_id)
            .unwrap_or_else(|| "unavailable".to_string());
        self.reply(
            origin.chat_id,
            &format!(
                "👤 **Your profile**\n\n🆔 ID: `{}`\n👥 Friends invited: **{}**\n\n🔗 **Your referral link:**\n`{}`",
                origin.user_id, session.referrals, link
            ),
        )
        .await;
        Ok(())
    }

    async fn cmd_feedback(&self, origin: &Origin, args: &str) -> Result<()> {
        let text = args.trim();
        if text.is_empty() {
            self.reply(
                origin.chat_id,
                "ℹ️ To write to the developer, type the command followed by your message:\n\n`/feedback I have an idea...`",
            )
            .await;
            return Ok(());
        }

        let Some(admin_id) = self.settings.admin_id else {
            warn!("Feedback from {} dropped: no admin configured", origin.user_id);
            self.reply(origin.chat_id, "⚠️ Feedback is not available right now.")
                .await;
            return Ok(());
        };

        self.messenger
            .send_text(
                admin_id,
                &format!(
                    "📩 **New feedback from** {} (ID: {}):\n\n{}",
                    origin.name, origin.user_id, text
                ),
                None,
            )
            .await?;
        self.reply(origin.chat_id, "✅ Message sent to the developer! Thank you.")
            .await;
        Ok(())
    }

    async fn cmd_admin(&self, origin: &Origin) -> Result<()> {
        let users = self.store.known_users().await?;
        self.reply(
            origin.chat_id,
            &format!("👑 **Admin panel**\n\n👥 Users: {}", users.len()),
        )
        .await;
        Ok(())
    }

    async fn cmd_broadcast(&self, origin: &Origin, args: &str) -> Result<()> {
        let text = args.trim();
        if text.is_empty() {
            self.reply(origin.chat_id, "⚠️ Usage: `/broadcast Message text`")
                .await;
            return Ok(());
        }

        let users = self.store.known_users().await?;
        let total = users.len();
        self.reply(
            origin.chat_id,
            &format!("🚀 Starting broadcast to {} users...", total),
        )
        .await;

        let message = format!("📢 **Bot news:**\n\n{}", text);
        let mut delivered = 0usize;
        for (index, user_id) in users.iter().enumerate() {
            match self.messenger.send_text(*user_id, &message, None).await {
                Ok(_) => delivered += 1,
                Err(e) => warn!("Broadcast to user {} failed: {}", user_id, e),
            }
            if index + 1 < total {
                tokio::time::sleep(self.settings.broadcast_delay).await;
            }
        }

        info!("Broadcast delivered to {} of {} users", delivered, total);
        self.reply(
            origin.chat_id,
            &format!(
                "✅ Broadcast finished. Delivered {} of {}",
                delivered, total
            ),
        )
        .await;
        Ok(())
    }

    async fn cmd_search(&self, origin: &Origin, args: &str) -> Result<()> {
        let query = args.trim();
        if query.is_empty() {
            self.reply(
                origin.chat_id,
                "🔎 **Web search**\n\nType the command followed by your question:\n`/search weather in London`\n`/search what is a capybara`",
            )
            .await;
            return Ok(());
        }
        let Some(search) = &self.search else {
            self.reply(origin.chat_id, "⚠️ Web search is not available.")
                .await;
            return Ok(());
        };

        self.chat_action(origin.chat_id, "typing").await;
        let status_id = self
            .messenger
            .send_text(
                origin.chat_id,
                &format!("🌍 Searching the web: «{}»...", query),
                None,
            )
            .await?;

        let results = match search.search(query).await {
            Ok(results) => results,
            Err(e) => {
                error!("Search error: {}", e);
                self.messenger
                    .edit_text(
                        origin.chat_id,
                        status_id,
                        &format!("⚠️ Search failed: {}", e),
                        None,
                    )
                    .await?;
                return Ok(());
            }
        };

        if results.is_empty() {
            self.messenger
                .edit_text(
                    origin.chat_id,
                    status_id,
                    "😔 Nothing found for your query.",
                    None,
                )
                .await?;
            return Ok(());
        }

        let results_text = format_results(&results);
        self.messenger
            .edit_text(
                origin.chat_id,
                status_id,
                &format!(
                    "🔎 **Search results:**\n\n{}⏳ _Analyzing..._",
                    results_text
                ),
                None,
            )
            .await?;

        let _typing = TypingHeartbeat::start(Arc::clone(&self.messenger), origin.chat_id);
        match self
            .router
            .answer_with_context(
                &self.store,
                origin.user_id,
                &search_prompt(query, &results_text),
                &format!("Search: {}", query),
            )
            .await
        {
            Ok(answer) => {
                let tts_mode = self.store.get(origin.user_id).await.tts_mode;
                self.postprocess
                    .deliver(origin.chat_id, &answer, tts_mode)
                    .await;
            }
            Err(e) => self.reply(origin.chat_id, &e.user_message()).await,
        }
        Ok(())
    }

    /// Route one turn and deliver whatever comes back. Failures are reported
    /// to the user and never propagate.
    async fn handle_turn(&self, origin: &Origin, input: MessageContent) {
        let session = self.store.get(origin.user_id).await;
        let is_image = matches!(
            self.router.route_for(&session),
            Route::ImageGeneration(_)
        );

        let mut notice = None;
        let _typing = if is_image {
            self.chat_action(origin.chat_id, "upload_photo").await;
            None
        } else {
            notice = self
                .messenger
                .send_text(origin.chat_id, THINKING_NOTICE, None)
                .await
                .ok();
            Some(TypingHeartbeat::start(
                Arc::clone(&self.messenger),
                origin.chat_id,
            ))
        };

        let result = self
            .router
            .handle_turn(&self.store, origin.user_id, input)
            .await;

        if let Some(message_id) = notice {
            if let Err(e) = self.messenger.delete_message(origin.chat_id, message_id).await {
                debug!("Failed to delete notice in chat {}: {}", origin.chat_id, e);
            }
        }

        match result {
            Ok(TurnOutcome::Reply(answer)) => {
                let tts_mode = self.store.get(origin.user_id).await.tts_mode;
                self.postprocess
                    .deliver(origin.chat_id, &answer, tts_mode)
                    .await;
            }
            Ok(TurnOutcome::Image { url, caption }) => {
                if let Err(e) = self
                    .messenger
                    .send_photo_url(origin.chat_id, &url, Some(&caption))
                    .await
                {
                    error!("Image delivery failed for chat {}: {}", origin.chat_id, e);
                    self.reply(
                        origin.chat_id,
                        &format!("⚠️ Could not create the image. Error: {}", e),
                    )
                    .await;
                }
            }
            Err(e) => self.reply(origin.chat_id, &e.user_message()).await,
        }
    }

    async fn handle_voice(
        &self,
        origin: &Origin,
        file_id: &str,
        mime_type: Option<&str>,
    ) -> Result<()> {
        let Some(transcriber) = &self.transcriber else {
            self.reply(origin.chat_id, "⚠️ Speech recognition is not configured.")
                .await;
            return Ok(());
        };

        self.chat_action(origin.chat_id, "typing").await;
        let transcript = async {
            let audio = self.messenger.download_file(file_id).await?;
            let text = transcriber
                .transcribe(audio, voice_file_name(mime_type))
                .await?;
            Ok::<_, anyhow::Error>(text)
        }
        .await;

        match transcript {
            Ok(text) if !text.trim().is_empty() => {
                let text = text.trim().to_string();
                self.reply(origin.chat_id, &format!("🎤 You said: «{}»", text))
                    .await;
                self.handle_turn(origin, MessageContent::Text(text)).await;
            }
            Ok(_) => {
                self.reply(origin.chat_id, "⚠️ I could not hear any speech in this message.")
                    .await;
            }
            Err(e) => {
                error!("Transcription failed for user {}: {}", origin.user_id, e);
                self.reply(
                    origin.chat_id,
                    &format!("⚠️ Speech recognition error: {}", e),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn handle_document(
        &self,
        origin: &Origin,
        file_id: &str,
        file_name: &str,
        file_size: Option<u64>,
        caption: Option<String>,
    ) -> Result<()> {
        let too_large = format!(
            "⚠️ The file is too large. Send text files up to {} KB.",
            self.settings.max_document_bytes / 1024
        );
        if file_size.unwrap_or(0) > self.settings.max_document_bytes {
            self.reply(origin.chat_id, &too_large).await;
            return Ok(());
        }
        if sova_docs::readable_kind(file_name).is_none() {
            self.reply(
                origin.chat_id,
                "⚠️ This file format is not supported. I can read .txt, .py, .html, .md, .json, .docx and .pdf.",
            )
            .await;
            return Ok(());
        }

        self.chat_action(origin.chat_id, "typing").await;
        let bytes = match self.messenger.download_file(file_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Document download failed: {}", e);
                self.reply(origin.chat_id, &format!("⚠️ Error reading the file: {}", e))
                    .await;
                return Ok(());
            }
        };
        if bytes.len() as u64 > self.settings.max_document_bytes {
            self.reply(origin.chat_id, &too_large).await;
            return Ok(());
        }

        let name = file_name.to_string();
        let extracted =
            tokio::task::spawn_blocking(move || sova_docs::extract_text(&name, &bytes)).await;
        let text = match extracted {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("Failed to read {}: {}", file_name, e);
                self.reply(origin.chat_id, &format!("⚠️ Error reading the file: {}", e))
                    .await;
                return Ok(());
            }
            Err(e) => {
                error!("Document extraction task failed for {}: {}", file_name, e);
                self.reply(origin.chat_id, "⚠️ Error reading the file.").await;
                return Ok(());
            }
        };

        let prompt = caption.unwrap_or_else(|| DEFAULT_DOCUMENT_PROMPT.to_string());
        let full_text = format!(
            "📄 **File:** {}\n\n{}\n\n---\n{}",
            file_name, prompt, text
        );
        self.handle_turn(origin, MessageContent::Text(full_text)).await;
        Ok(())
    }

    async fn handle_photo(
        &self,
        origin: &Origin,
        file_id: &str,
        caption: Option<String>,
    ) -> Result<()> {
        let session = self.store.get(origin.user_id).await;
        if !self.router.registry().supports_vision(&session.model) {
            self.reply(
                origin.chat_id,
                "To analyze images, choose a model with vision support (for example, ✨ Gemini 2.0 Flash) with /mode.",
            )
            .await;
            return Ok(());
        }
        if !self.router.has_gateway() {
            self.reply(origin.chat_id, &TurnError::GatewayUnavailable.user_message())
                .await;
            return Ok(());
        }

        let bytes = match self.messenger.download_file(file_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Photo download failed: {}", e);
                self.reply(
                    origin.chat_id,
                    &format!("⚠️ An error occurred while processing the image: {}", e),
                )
                .await;
                return Ok(());
            }
        };

        let data_url = format!(
            "data:{};base64,{}",
            image_mime_type(&bytes),
            base64::engine::general_purpose::STANDARD.encode(&bytes)
        );
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: caption.unwrap_or_else(|| DEFAULT_PHOTO_PROMPT.to_string()),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl { url: data_url },
            },
        ]);
        self.handle_turn(origin, content).await;
        Ok(())
    }

    async fn handle_callback(
        &self,
        origin: &Origin,
        message_id: Option<i64>,
        query_id: &str,
        data: &str,
    ) -> Result<()> {
        if let Some(model_id) = keyboard::parse_set_model(data) {
            let registry = self.router.registry();
            let selection = registry.resolve_or_primary(model_id);
            let label = registry
                .label_for(model_id)
                .unwrap_or("Unknown model")
                .to_string();
            self.store
                .update(origin.user_id, |s| s.select_model(selection))
                .await?;
            info!("User {} switched to model {}", origin.user_id, model_id);

            self.messenger.answer_callback(query_id, None).await?;
            if let Some(message_id) = message_id {
                self.messenger
                    .edit_text(
                        origin.chat_id,
                        message_id,
                        &format!("✅ Mode changed to: **{}**", label),
                        None,
                    )
                    .await?;
            }
            return Ok(());
        }

        if data == keyboard::DONATE_SENT {
            if let Some(admin_id) = self.settings.admin_id {
                let username = origin
                    .username
                    .as_deref()
                    .map(|u| format!("@{}", u))
                    .unwrap_or_else(|| "no username".to_string());
                self.reply(
                    admin_id,
                    &format!(
                        "💰 **You have a new donation!**\n\n👤 From: {} ({})\n🆔 ID: `{}`\nThe user reports having sent funds.",
                        origin.name, username, origin.user_id
                    ),
                )
                .await;
            }
            self.messenger
                .answer_callback(
                    query_id,
                    Some("Thank you so much! The author has been notified. ❤️"),
                )
                .await?;
            if let Some(message_id) = message_id {
                self.messenger
                    .remove_keyboard(origin.chat_id, message_id)
                    .await?;
            }
            return Ok(());
        }

        debug!("Unhandled callback data '{}'", data);
        self.messenger.answer_callback(query_id, None).await
    }

    async fn handle_inline_query(&self, origin: &Origin, query_id: &str) -> Result<()> {
        let Some(link) = self.referral_link(origin.user_id) else {
            warn!("Inline query ignored: bot username not known yet");
            return Ok(());
        };
        let article = InlineArticle {
            id: "1".to_string(),
            title: "🤖 Share the bot".to_string(),
            description: "Send a link to this smart assistant".to_string(),
            message_text: format!(
                "Hi! I'm using a great AI bot. It recognizes voice, draws pictures and works with files! Try it: {}",
                link
            ),
        };
        self.messenger
            .answer_inline_query(query_id, vec![article])
            .await
    }
}

fn voice_file_name(mime_type: Option<&str>) -> &'static str {
    match mime_type.unwrap_or_default() {
        "audio/mpeg" | "audio/mp3" => "voice.mp3",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "voice.m4a",
        "audio/wav" | "audio/x-wav" => "voice.wav",
        _ => "voice.ogg",
    }
}

/// MIME type from the leading magic bytes; JPEG when unknown.
fn image_mime_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

//! Sova Telegram Adapter
//!
//! Telegram Bot API long-polling with offset persistence, client recreation,
//! inline keyboards, multipart uploads, file downloads and message chunking

pub mod keyboard;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, ClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sova_config::TelegramConfig;
use sova_ipc::{Envelope, EventBus, InlineArticle, InlineKeyboard, MessageKind, Messenger};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};

const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;
const TELEGRAM_MAX_CAPTION_LEN: usize = 1024;
const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub callback_query: Option<TelegramCallbackQuery>,
    #[serde(default)]
    pub inline_query: Option<TelegramInlineQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TelegramPhotoSize>>,
    #[serde(default)]
    pub document: Option<TelegramDocument>,
    #[serde(default)]
    pub voice: Option<TelegramVoice>,
    #[serde(default)]
    pub audio: Option<TelegramVoice>,
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
    pub width: i64,
    pub height: i64,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramDocument {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramVoice {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub duration: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl TelegramUser {
    fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.first_name.clone())
            .unwrap_or_else(|| self.id.to_string())
    }

    /// First and last name, falling back to the username or id.
    pub fn full_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if name.is_empty() {
            self.display_name()
        } else {
            name
        }
    }

    fn sender_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "from_name": self.full_name(),
            "username": self.username,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    pub message: Option<TelegramMessage>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramInlineQuery {
    pub id: String,
    pub from: TelegramUser,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

pub struct TelegramAdapter {
    client: Client,
    bot_id: String,
    api_url: String,
    file_url: String,
    data_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    event_bus: Option<EventBus>,
    username: OnceLock<String>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig, data_dir: PathBuf) -> Result<Self> {
        let token = config.bot_token.trim();
        let base = config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/');
        let bot_id = token.split(':').next().unwrap_or("default").to_string();

        Ok(Self {
            client: Self::build_client()?,
            bot_id,
            api_url: format!("{}/bot{}", base, token),
            file_url: format!("{}/file/bot{}", base, token),
            data_dir,
            poll_timeout_secs: config.poll_timeout_secs.unwrap_or(60),
            client_recreate_interval_secs: config.client_recreate_interval_secs.unwrap_or(3600),
            event_bus: None,
            username: OnceLock::new(),
        })
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn build_client() -> Result<Client> {
        Ok(ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()?)
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.api_url, method)
    }

    fn offset_path(&self) -> PathBuf {
        self.data_dir
            .join("runtime")
            .join(format!("telegram.{}.offset", self.bot_id))
    }

    async fn read_offset(&self) -> Option<i64> {
        match fs::read_to_string(self.offset_path()).await {
            Ok(content) => content.trim().parse().ok(),
            Err(_) => None,
        }
    }

    async fn write_offset(&self, offset: i64) {
        let path = self.offset_path();
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        if let Err(e) = fs::write(&path, format!("{}\n", offset)).await {
            debug!("Failed to persist Telegram offset: {}", e);
        }
    }

    /// Plain JSON call returning the decoded `result`.
    async fn call<T: DeserializeOwned>(
        &self,
        client: &Client,
        method: &str,
        payload: &serde_json::Value,
    ) -> Result<T> {
        let resp = client
            .post(self.method_url(method))
            .json(payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", method, e))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("telegram {} HTTP {}: {}", method, status, body));
        }

        let parsed: ApiResponse<T> = serde_json::from_str(&body)
            .map_err(|e| anyhow!("telegram {} decode failed: {}", method, e))?;
        if !parsed.ok {
            return Err(anyhow!(
                "telegram {} returned ok=false: {}",
                method,
                parsed.description.unwrap_or_default()
            ));
        }
        parsed
            .result
            .ok_or_else(|| anyhow!("telegram {} returned no result", method))
    }

    pub async fn get_me(&self) -> Result<TelegramUser> {
        let me: TelegramUser = self
            .call(&self.client, "getMe", &serde_json::json!({}))
            .await?;
        if let Some(username) = &me.username {
            let _ = self.username.set(username.clone());
        }
        Ok(me)
    }

    /// Long polling only works once any webhook is removed.
    pub async fn delete_webhook(&self) -> Result<()> {
        let _: bool = self
            .call(
                &self.client,
                "deleteWebhook",
                &serde_json::json!({ "drop_pending_updates": false }),
            )
            .await?;
        Ok(())
    }

    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> Result<Vec<TelegramUpdate>> {
        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message", "callback_query", "inline_query"],
        });

        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }

        self.call(client, "getUpdates", &payload).await
    }

    /// Send `text`, split into chunks under the message limit. The keyboard
    /// is attached to the last chunk, whose id is returned.
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        inline_keyboard: Option<InlineKeyboard>,
    ) -> Result<i64> {
        let chunks = chunk_message(text);
        let url = self.method_url("sendMessage");
        let mut last_id = 0;

        for (i, chunk) in chunks.iter().enumerate() {
            let mut payload = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "Markdown",
            });

            if i == chunks.len() - 1 {
                if let Some(keyboard) = &inline_keyboard {
                    payload["reply_markup"] = keyboard_markup(keyboard);
                }
            }

            let result = self.send_with_markdown_fallback(&url, payload).await?;
            if let Ok(sent) = serde_json::from_value::<SentMessage>(result) {
                last_id = sent.message_id;
            }
        }

        Ok(last_id)
    }

    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        inline_keyboard: Option<InlineKeyboard>,
    ) -> Result<()> {
        // editMessageText cannot be split into chunks: fall back to a new message.
        if text.chars().count() > TELEGRAM_MAX_MESSAGE_LEN {
            self.send_message(chat_id, text, inline_keyboard).await?;
            return Ok(());
        }

        let mut payload = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "parse_mode": "Markdown",
        });

        if let Some(keyboard) = &inline_keyboard {
            payload["reply_markup"] = keyboard_markup(keyboard);
        }

        self.send_with_markdown_fallback(&self.method_url("editMessageText"), payload)
            .await
            .map(|_| ())
    }

    pub async fn edit_message_reply_markup(
        &self,
        chat_id: i64,
        message_id: i64,
        inline_keyboard: Option<InlineKeyboard>,
    ) -> Result<()> {
        let markup = match &inline_keyboard {
            Some(keyboard) => keyboard_markup(keyboard),
            None => serde_json::json!({ "inline_keyboard": [] }),
        };
        let _: serde_json::Value = self
            .call(
                &self.client,
                "editMessageReplyMarkup",
                &serde_json::json!({
                    "chat_id": chat_id,
                    "message_id": message_id,
                    "reply_markup": markup,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let _: bool = self
            .call(
                &self.client,
                "deleteMessage",
                &serde_json::json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }

    pub async fn answer_callback_query(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> Result<()> {
        let mut payload = serde_json::json!({
            "callback_query_id": callback_query_id,
        });

        if let Some(t) = text {
            payload["text"] = serde_json::json!(t);
        }

        let _ = self
            .client
            .post(self.method_url("answerCallbackQuery"))
            .json(&payload)
            .send()
            .await;
        Ok(())
    }

    pub async fn answer_inline_query(
        &self,
        inline_query_id: &str,
        articles: &[InlineArticle],
    ) -> Result<()> {
        let results: Vec<serde_json::Value> = articles
            .iter()
            .map(|article| {
                serde_json::json!({
                    "type": "article",
                    "id": article.id,
                    "title": article.title,
                    "description": article.description,
                    "input_message_content": { "message_text": article.message_text },
                })
            })
            .collect();

        let _: bool = self
            .call(
                &self.client,
                "answerInlineQuery",
                &serde_json::json!({
                    "inline_query_id": inline_query_id,
                    "results": results,
                    "cache_time": 0,
                    "is_personal": true,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "action": action,
        });
        let _ = self
            .client
            .post(self.method_url("sendChatAction"))
            .json(&payload)
            .send()
            .await;
        Ok(())
    }

    pub async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<()> {
        let part = Part::bytes(bytes).file_name(file_name.to_string());
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", part);
        if let Some(caption) = caption {
            form = form.text("caption", truncate_caption(caption));
        }
        self.send_multipart("sendDocument", form).await?;
        info!("Telegram document sent to {}: {}", chat_id, file_name);
        Ok(())
    }

    pub async fn send_voice(&self, chat_id: i64, path: &Path) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("voice.mp3")
            .to_string();
        let bytes = fs::read(path).await?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("voice", Part::bytes(bytes).file_name(file_name));
        self.send_multipart("sendVoice", form).await
    }

    /// Let Telegram fetch and render the image itself.
    pub async fn send_photo_url(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
    ) -> Result<()> {
        let mut payload = serde_json::json!({
            "chat_id": chat_id,
            "photo": url,
        });
        if let Some(caption) = caption {
            payload["caption"] = serde_json::json!(truncate_caption(caption));
        }
        let _: serde_json::Value = self.call(&self.client, "sendPhoto", &payload).await?;
        Ok(())
    }

    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let file: TelegramFile = self
            .call(
                &self.client,
                "getFile",
                &serde_json::json!({ "file_id": file_id }),
            )
            .await?;
        let file_path = file
            .file_path
            .ok_or_else(|| anyhow!("telegram getFile returned no file_path"))?;

        let resp = self
            .client
            .get(format!("{}/{}", self.file_url, file_path))
            .send()
            .await
            .map_err(|e| anyhow!("telegram file download failed: {}", e))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("telegram file download failed with HTTP {}", status.as_u16());
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn send_multipart(&self, method: &str, form: Form) -> Result<()> {
        let resp = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", method, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("telegram {} HTTP {}: {}", method, status, body);
        }
        Ok(())
    }

    async fn send_with_markdown_fallback(
        &self,
        url: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let endpoint = url.rsplit('/').next().unwrap_or("telegram");

        let first_resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", endpoint, e))?;

        if first_resp.status().is_success() {
            let parsed: ApiResponse<serde_json::Value> = first_resp
                .json()
                .await
                .map_err(|e| anyhow!("telegram {} decode failed: {}", endpoint, e))?;
            if parsed.ok {
                return Ok(parsed.result.unwrap_or_default());
            }
            warn!(
                "telegram {} returned ok=false with Markdown payload, retrying without parse_mode",
                endpoint
            );
        } else {
            let status = first_resp.status();
            let body = first_resp.text().await.unwrap_or_default();
            if is_not_modified(&body) {
                return Ok(serde_json::Value::Null);
            }
            warn!(
                "telegram {} HTTP {} with Markdown payload, retrying without parse_mode: {}",
                endpoint, status, body
            );
        }

        let mut fallback_payload = payload;
        if let Some(obj) = fallback_payload.as_object_mut() {
            obj.remove("parse_mode");
        }

        let fallback_resp = self
            .client
            .post(url)
            .json(&fallback_payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} fallback request failed: {}", endpoint, e))?;

        if !fallback_resp.status().is_success() {
            let status = fallback_resp.status();
            let body = fallback_resp.text().await.unwrap_or_default();
            if is_not_modified(&body) {
                return Ok(serde_json::Value::Null);
            }
            return Err(anyhow!(
                "telegram {} fallback HTTP {}: {}",
                endpoint,
                status,
                body
            ));
        }

        let parsed: ApiResponse<serde_json::Value> = fallback_resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram {} fallback decode failed: {}", endpoint, e))?;
        if !parsed.ok {
            return Err(anyhow!("telegram {} fallback returned ok=false", endpoint));
        }

        Ok(parsed.result.unwrap_or_default())
    }

    async fn sync_bot_commands(&self, client: &Client) -> Result<()> {
        let _: bool = self
            .call(
                client,
                "setMyCommands",
                &serde_json::json!({ "commands": keyboard::commands_payload() }),
            )
            .await?;
        Ok(())
    }

    pub async fn poll(&self) -> Result<()> {
        if let Err(err) = self.delete_webhook().await {
            warn!("Failed to delete Telegram webhook: {}", err);
        }
        match self.get_me().await {
            Ok(me) => info!(bot = ?me.username, "Telegram bot identity resolved"),
            Err(err) => warn!("Telegram getMe failed: {}", err),
        }

        let mut offset: Option<i64> = self.read_offset().await;

        info!(offset = ?offset, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        if let Err(err) = self.sync_bot_commands(&client).await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        } else {
            info!("Telegram bot commands synced");
        }

        loop {
            if Instant::now() >= client_recreate_at {
                info!("Recreating HTTP client to prevent stale connections");
                match Self::build_client() {
                    Ok(fresh) => client = fresh,
                    Err(err) => warn!("Failed to recreate HTTP client: {}", err),
                }
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1).await;
                self.handle_update(update);
            }
        }
    }

    fn handle_update(&self, update: TelegramUpdate) {
        let bot_username = self.username.get().map(String::as_str);
        let Some(envelope) = envelope_from_update(update, bot_username) else {
            return;
        };

        match &self.event_bus {
            Some(event_bus) => {
                if let Err(e) = event_bus.publish(envelope) {
                    warn!("Failed to publish update to event bus: {}", e);
                }
            }
            None => info!("No event bus configured, update not forwarded"),
        }
    }
}

#[async_trait]
impl Messenger for TelegramAdapter {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<i64> {
        self.send_message(chat_id, text, keyboard).await
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<()> {
        self.edit_message_text(chat_id, message_id, text, keyboard)
            .await
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        TelegramAdapter::delete_message(self, chat_id, message_id).await
    }

    async fn remove_keyboard(&self, chat_id: i64, message_id: i64) -> Result<()> {
        self.edit_message_reply_markup(chat_id, message_id, None)
            .await
    }

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> Result<()> {
        self.answer_callback_query(query_id, text).await
    }

    async fn answer_inline_query(&self, query_id: &str, articles: Vec<InlineArticle>) -> Result<()> {
        TelegramAdapter::answer_inline_query(self, query_id, &articles).await
    }

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        TelegramAdapter::send_chat_action(self, chat_id, action).await
    }

    async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<()> {
        TelegramAdapter::send_document(self, chat_id, file_name, bytes, caption).await
    }

    async fn send_voice(&self, chat_id: i64, path: &Path) -> Result<()> {
        TelegramAdapter::send_voice(self, chat_id, path).await
    }

    async fn send_photo_url(&self, chat_id: i64, url: &str, caption: Option<&str>) -> Result<()> {
        TelegramAdapter::send_photo_url(self, chat_id, url, caption).await
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        TelegramAdapter::download_file(self, file_id).await
    }

    fn bot_username(&self) -> Option<String> {
        self.username.get().cloned()
    }
}

/// Translate one update into an inbound envelope. Updates the bot does
/// not handle yield `None`.
pub fn envelope_from_update(update: TelegramUpdate, bot_username: Option<&str>) -> Option<Envelope> {
    if let Some(callback) = update.callback_query {
        let mut envelope = Envelope::new(
            "telegram",
            MessageKind::Callback {
                query_id: callback.id.clone(),
                data: callback.data.clone().unwrap_or_default(),
            },
        )
        .with_user_id(callback.from.id)
        .with_payload(callback.from.sender_payload());
        if let Some(message) = &callback.message {
            envelope = envelope
                .with_chat_id(message.chat.id)
                .with_message_id(message.message_id);
        }
        return Some(envelope);
    }

    if let Some(query) = update.inline_query {
        return Some(
            Envelope::new(
                "telegram",
                MessageKind::InlineQuery {
                    query_id: query.id,
                    query: query.query,
                },
            )
            .with_user_id(query.from.id)
            .with_payload(query.from.sender_payload()),
        );
    }

    let message = update.message?;
    let from = message.from.as_ref()?;
    if from.is_bot == Some(true) {
        return None;
    }

    let caption = message
        .caption
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    let kind = if let Some(text) = message.text.as_deref() {
        match parse_command(text, bot_username) {
            Some((name, args)) => MessageKind::Command { name, args },
            None => MessageKind::Message {
                from: from.display_name(),
                text: text.to_string(),
            },
        }
    } else if let Some(voice) = message.voice.as_ref().or(message.audio.as_ref()) {
        MessageKind::Voice {
            file_id: voice.file_id.clone(),
            mime_type: voice.mime_type.clone(),
            duration: voice.duration,
        }
    } else if let Some(document) = &message.document {
        MessageKind::Document {
            file_id: document.file_id.clone(),
            file_name: document
                .file_name
                .clone()
                .unwrap_or_else(|| "document".to_string()),
            file_size: document.file_size,
            caption,
        }
    } else if let Some(best) = message
        .photo
        .as_ref()
        .and_then(|sizes| sizes.iter().max_by_key(|s| s.width.saturating_mul(s.height)))
    {
        MessageKind::Photo {
            file_id: best.file_id.clone(),
            caption,
        }
    } else {
        debug!("Ignoring unsupported message {}", message.message_id);
        return None;
    };

    Some(
        Envelope::new("telegram", kind)
            .with_chat_id(message.chat.id)
            .with_message_id(message.message_id)
            .with_user_id(from.id)
            .with_payload({
                let mut payload = from.sender_payload();
                payload["chat_type"] = serde_json::json!(message.chat.chat_type);
                payload
            }),
    )
}

/// Split `/name@bot args` into a lowercase name and the trimmed remainder.
/// Commands addressed to another bot are not ours.
pub fn parse_command(text: &str, bot_username: Option<&str>) -> Option<(String, String)> {
    let rest = text.trim_start().strip_prefix('/')?;
    let (head, args) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim()),
        None => (rest, ""),
    };
    let (name, target) = match head.split_once('@') {
        Some((name, target)) => (name, Some(target)),
        None => (head, None),
    };
    if name.is_empty() {
        return None;
    }
    if let (Some(target), Some(me)) = (target, bot_username) {
        if !target.eq_ignore_ascii_case(me) {
            return None;
        }
    }
    Some((name.to_lowercase(), args.to_string()))
}

fn keyboard_markup(keyboard: &InlineKeyboard) -> serde_json::Value {
    serde_json::json!({
        "inline_keyboard": keyboard.iter().map(|row| {
            row.iter().map(|btn| serde_json::json!({
                "text": btn.text,
                "callback_data": btn.callback_data
            })).collect::<Vec<_>>()
        }).collect::<Vec<_>>()
    })
}

fn is_not_modified(body: &str) -> bool {
    body.to_ascii_lowercase().contains("message is not modified")
}

fn truncate_caption(caption: &str) -> String {
    if caption.chars().count() <= TELEGRAM_MAX_CAPTION_LEN {
        caption.to_string()
    } else {
        let mut truncated: String = caption.chars().take(TELEGRAM_MAX_CAPTION_LEN - 3).collect();
        truncated.push_str("...");
        truncated
    }
}

/// Split text into chunks of at most 4096 characters, preferring to break
/// after whitespace or sentence punctuation.
pub fn chunk_message(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= TELEGRAM_MAX_MESSAGE_LEN {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + TELEGRAM_MAX_MESSAGE_LEN).min(chars.len());

        if end < chars.len() {
            if let Some(i) = (start..end)
                .rev()
                .find(|&i| matches!(chars[i], '\n' | ' ' | '.' | '!' | '?'))
            {
                end = i + 1;
            }
        }

        chunks.push(chars[start..end].iter().collect::<String>());
        start = end;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: serde_json::Value) -> TelegramUpdate {
        serde_json::from_value(json).expect("valid update")
    }

    #[test]
    fn chunk_message_preserves_content_for_unicode_text() {
        let text = format!("{} {}", "😀".repeat(5000), "fine");
        let chunks = chunk_message(&text);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunk_message_respects_telegram_limit_by_characters() {
        let text = "abc😀".repeat(1500);
        let chunks = chunk_message(&text);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 4096));
    }

    #[test]
    fn chunk_message_breaks_after_whitespace() {
        let text = format!("{} {}", "a".repeat(4000), "b".repeat(200));
        let chunks = chunk_message(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with(' '));
        assert_eq!(chunks[1], "b".repeat(200));
    }

    #[test]
    fn parse_command_variants() {
        assert_eq!(
            parse_command("/start 12345", None),
            Some(("start".to_string(), "12345".to_string()))
        );
        assert_eq!(
            parse_command("/System@SovaBot  be a pirate ", Some("sovabot")),
            Some(("system".to_string(), "be a pirate".to_string()))
        );
        assert_eq!(parse_command("/help@OtherBot", Some("sovabot")), None);
        assert_eq!(parse_command("hello /start", None), None);
        assert_eq!(parse_command("/", None), None);
    }

    #[test]
    fn text_update_becomes_message() {
        let env = envelope_from_update(
            update(serde_json::json!({
                "update_id": 1,
                "message": {
                    "message_id": 10,
                    "text": "hi there",
                    "chat": { "id": 55, "type": "private" },
                    "from": { "id": 55, "username": "alice", "first_name": "Alice", "last_name": "Liddell" }
                }
            })),
            None,
        )
        .expect("envelope");
        assert_eq!(env.payload["from_name"], "Alice Liddell");
        assert_eq!(env.payload["username"], "alice");
        assert_eq!(env.payload["chat_type"], "private");
        assert_eq!(env.chat_id, Some(55));
        assert_eq!(env.user_id, Some(55));
        assert_eq!(env.message_id, Some(10));
        assert_eq!(
            env.kind,
            MessageKind::Message {
                from: "alice".to_string(),
                text: "hi there".to_string()
            }
        );
    }

    #[test]
    fn photo_update_picks_largest_size() {
        let env = envelope_from_update(
            update(serde_json::json!({
                "update_id": 2,
                "message": {
                    "message_id": 11,
                    "caption": " what is this ",
                    "photo": [
                        { "file_id": "small", "width": 90, "height": 90 },
                        { "file_id": "large", "width": 1280, "height": 960 },
                        { "file_id": "medium", "width": 320, "height": 240 }
                    ],
                    "chat": { "id": 1, "type": "private" },
                    "from": { "id": 1 }
                }
            })),
            None,
        )
        .expect("envelope");
        assert_eq!(
            env.kind,
            MessageKind::Photo {
                file_id: "large".to_string(),
                caption: Some("what is this".to_string())
            }
        );
    }

    #[test]
    fn document_and_voice_updates() {
        let doc = envelope_from_update(
            update(serde_json::json!({
                "update_id": 3,
                "message": {
                    "message_id": 12,
                    "document": { "file_id": "d1", "file_name": "a.pdf", "file_size": 2048 },
                    "chat": { "id": 1, "type": "private" },
                    "from": { "id": 1 }
                }
            })),
            None,
        )
        .expect("document");
        assert!(matches!(
            doc.kind,
            MessageKind::Document { ref file_name, file_size: Some(2048), caption: None, .. } if file_name == "a.pdf"
        ));

        let voice = envelope_from_update(
            update(serde_json::json!({
                "update_id": 4,
                "message": {
                    "message_id": 13,
                    "voice": { "file_id": "v1", "mime_type": "audio/ogg", "duration": 3 },
                    "chat": { "id": 1, "type": "private" },
                    "from": { "id": 1 }
                }
            })),
            None,
        )
        .expect("voice");
        assert!(matches!(voice.kind, MessageKind::Voice { ref file_id, .. } if file_id == "v1"));
    }

    #[test]
    fn callback_and_inline_updates() {
        let callback = envelope_from_update(
            update(serde_json::json!({
                "update_id": 5,
                "callback_query": {
                    "id": "q1",
                    "from": { "id": 7 },
                    "data": "set_model:codestral-latest",
                    "message": {
                        "message_id": 99,
                        "chat": { "id": 7, "type": "private" }
                    }
                }
            })),
            None,
        )
        .expect("callback");
        assert_eq!(callback.user_id, Some(7));
        assert_eq!(callback.message_id, Some(99));
        assert!(matches!(callback.kind, MessageKind::Callback { ref data, .. } if data == "set_model:codestral-latest"));

        let inline = envelope_from_update(
            update(serde_json::json!({
                "update_id": 6,
                "inline_query": { "id": "iq", "from": { "id": 8 }, "query": "" }
            })),
            None,
        )
        .expect("inline");
        assert_eq!(inline.user_id, Some(8));
        assert_eq!(inline.chat_id, None);
    }

    #[test]
    fn bot_and_unsupported_messages_are_ignored() {
        let from_bot = update(serde_json::json!({
            "update_id": 7,
            "message": {
                "message_id": 1,
                "text": "beep",
                "chat": { "id": 1, "type": "private" },
                "from": { "id": 2, "is_bot": true }
            }
        }));
        assert!(envelope_from_update(from_bot, None).is_none());

        let sticker = update(serde_json::json!({
            "update_id": 8,
            "message": {
                "message_id": 2,
                "chat": { "id": 1, "type": "private" },
                "from": { "id": 1 }
            }
        }));
        assert!(envelope_from_update(sticker, None).is_none());
    }

    #[test]
    fn caption_truncation_and_not_modified_detection() {
        let long = "x".repeat(2000);
        assert_eq!(truncate_caption(&long).chars().count(), 1024);
        assert!(is_not_modified(
            r#"{"ok":false,"description":"Bad Request: message is not modified"}"#
        ));
    }

    #[test]
    fn adapter_urls_from_config() {
        let config = TelegramConfig {
            bot_token: "123456:TESTTOKEN".to_string(),
            ..Default::default()
        };
        let adapter = TelegramAdapter::new(&config, std::env::temp_dir()).expect("adapter");
        assert_eq!(
            adapter.method_url("getMe"),
            "https://api.telegram.org/bot123456:TESTTOKEN/getMe"
        );
        assert!(adapter
            .offset_path()
            .ends_with("runtime/telegram.123456.offset"));
    }
}

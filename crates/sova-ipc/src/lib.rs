//! Sova IPC
//!
//! Inbound event bus (adapter to core) and the outbound messaging seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_schema_version() -> u16 {
    1
}

fn default_trace_id() -> String {
    generate_trace_id()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub channel: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub chat_id: Option<i64>,
    pub message_id: Option<i64>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageKind {
    #[serde(rename = "message")]
    Message { from: String, text: String },

    /// `args` is the raw remainder after the command name.
    #[serde(rename = "command")]
    Command { name: String, args: String },

    #[serde(rename = "voice")]
    Voice {
        file_id: String,
        mime_type: Option<String>,
        duration: Option<u32>,
    },

    #[serde(rename = "document")]
    Document {
        file_id: String,
        file_name: String,
        file_size: Option<u64>,
        caption: Option<String>,
    },

    #[serde(rename = "photo")]
    Photo {
        file_id: String,
        caption: Option<String>,
    },

    #[serde(rename = "callback")]
    Callback { query_id: String, data: String },

    #[serde(rename = "inline_query")]
    InlineQuery { query_id: String, query: String },
}

impl Envelope {
    pub fn new(channel: &str, kind: MessageKind) -> Self {
        Self {
            schema_version: default_schema_version(),
            trace_id: generate_trace_id(),
            channel: channel.to_string(),
            kind,
            payload: serde_json::json!({}),
            chat_id: None,
            message_id: None,
            user_id: None,
        }
    }

    pub fn with_chat_id(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn with_message_id(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// String field of the payload, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(serde_json::Value::as_str)
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { inbound: inbound_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.inbound.send(envelope)?;
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

pub type InlineKeyboard = Vec<Vec<InlineButton>>;

/// A shareable article returned for inline queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineArticle {
    pub id: String,
    pub title: String,
    pub description: String,
    pub message_text: String,
}

/// Outbound half of a chat platform. Every call reports its own outcome.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send text and return the id of the (last) sent message.
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> anyhow::Result<i64>;

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> anyhow::Result<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> anyhow::Result<()>;

    /// Drop the inline keyboard of a sent message.
    async fn remove_keyboard(&self, chat_id: i64, message_id: i64) -> anyhow::Result<()>;

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> anyhow::Result<()>;

    async fn answer_inline_query(
        &self,
        query_id: &str,
        articles: Vec<InlineArticle>,
    ) -> anyhow::Result<()>;

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> anyhow::Result<()>;

    async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn send_voice(&self, chat_id: i64, path: &std::path::Path) -> anyhow::Result<()>;

    async fn send_photo_url(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn download_file(&self, file_id: &str) -> anyhow::Result<Vec<u8>>;

    /// Public username of the bot, without `@`.
    fn bot_username(&self) -> Option<String>;
}

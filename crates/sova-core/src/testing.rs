//! In-process fakes shared by the runtime tests

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use sova_ipc::{InlineArticle, InlineKeyboard, Messenger};
use sova_providers::{ChatProvider, ChatResponse, ProviderError, SpeechSynthesizer, Transcriber};
use sova_storage::{
    ChatBackend, HistoryEntry, MemoryBackend, ModelSelection, Route, SessionDefaults, SessionStore,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

pub enum FakeReply {
    Text(String),
    Status(u16),
}

/// Chat backend that records every request.
pub struct RecordingProvider {
    name: String,
    reply: FakeReply,
    calls: Mutex<Vec<(String, Vec<HistoryEntry>)>>,
}

impl RecordingProvider {
    pub fn replying(name: &str, text: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reply: FakeReply::Text(text.to_string()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(name: &str, status: u16) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reply: FakeReply::Status(status),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> (String, Vec<HistoryEntry>) {
        self.calls
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("a recorded call")
    }
}

#[async_trait]
impl ChatProvider for RecordingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[HistoryEntry],
    ) -> Result<ChatResponse, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));
        match &self.reply {
            FakeReply::Text(text) => Ok(ChatResponse {
                content: text.clone(),
                model: model.to_string(),
                usage: None,
                finish_reason: Some("stop".to_string()),
            }),
            FakeReply::Status(status) => Err(ProviderError::from_status(
                &self.name,
                *status,
                &HeaderMap::new(),
                "boom",
            )),
        }
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

pub struct FakeTranscriber {
    pub text: Option<String>,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _audio: Vec<u8>, _file_name: &str) -> Result<String, ProviderError> {
        match &self.text {
            Some(text) => Ok(text.clone()),
            None => Err(ProviderError::from_status(
                "stt",
                500,
                &HeaderMap::new(),
                "down",
            )),
        }
    }
}

/// Synthesizer that echoes the requested text as audio bytes.
pub struct FakeSynthesizer {
    pub inputs: Mutex<Vec<String>>,
}

impl FakeSynthesizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inputs: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ProviderError> {
        self.inputs.lock().unwrap().push(text.to_string());
        Ok(text.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text {
        chat_id: i64,
        text: String,
        keyboard: Option<InlineKeyboard>,
    },
    Edit {
        chat_id: i64,
        message_id: i64,
        text: String,
    },
    Delete {
        chat_id: i64,
        message_id: i64,
    },
    RemoveKeyboard {
        chat_id: i64,
        message_id: i64,
    },
    Callback {
        query_id: String,
        text: Option<String>,
    },
    Inline {
        query_id: String,
        articles: Vec<InlineArticle>,
    },
    Action {
        chat_id: i64,
        action: String,
    },
    Document {
        chat_id: i64,
        file_name: String,
        bytes: Vec<u8>,
    },
    Voice {
        chat_id: i64,
        path: PathBuf,
        bytes: Vec<u8>,
    },
    Photo {
        chat_id: i64,
        url: String,
        caption: Option<String>,
    },
}

/// Messenger that records outbound calls instead of sending them.
#[derive(Default)]
pub struct FakeMessenger {
    sent: Mutex<Vec<Sent>>,
    files: HashMap<String, Vec<u8>>,
    unreachable: HashSet<i64>,
    next_id: AtomicI64,
}

impl FakeMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, file_id: &str, bytes: &[u8]) -> Self {
        self.files.insert(file_id.to_string(), bytes.to_vec());
        self
    }

    /// Sends to this chat fail.
    pub fn with_unreachable(mut self, chat_id: i64) -> Self {
        self.unreachable.insert(chat_id);
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Texts sent to a chat, in order. Chat actions are left out.
    pub fn texts_to(&self, chat_id: i64) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Text { chat_id: id, text, .. } if id == chat_id => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(&self, sent: Sent) {
        self.sent.lock().unwrap().push(sent);
    }

    fn check_reachable(&self, chat_id: i64) -> anyhow::Result<()> {
        if self.unreachable.contains(&chat_id) {
            anyhow::bail!("chat {} is unreachable", chat_id);
        }
        Ok(())
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> anyhow::Result<i64> {
        self.check_reachable(chat_id)?;
        self.record(Sent::Text {
            chat_id,
            text: text.to_string(),
            keyboard,
        });
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed) + 100)
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        _keyboard: Option<InlineKeyboard>,
    ) -> anyhow::Result<()> {
        self.record(Sent::Edit {
            chat_id,
            message_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> anyhow::Result<()> {
        self.record(Sent::Delete {
            chat_id,
            message_id,
        });
        Ok(())
    }

    async fn remove_keyboard(&self, chat_id: i64, message_id: i64) -> anyhow::Result<()> {
        self.record(Sent::RemoveKeyboard {
            chat_id,
            message_id,
        });
        Ok(())
    }

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> anyhow::Result<()> {
        self.record(Sent::Callback {
            query_id: query_id.to_string(),
            text: text.map(str::to_string),
        });
        Ok(())
    }

    async fn answer_inline_query(
        &self,
        query_id: &str,
        articles: Vec<InlineArticle>,
    ) -> anyhow::Result<()> {
        self.record(Sent::Inline {
            query_id: query_id.to_string(),
            articles,
        });
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> anyhow::Result<()> {
        self.record(Sent::Action {
            chat_id,
            action: action.to_string(),
        });
        Ok(())
    }

    async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        _caption: Option<&str>,
    ) -> anyhow::Result<()> {
        self.record(Sent::Document {
            chat_id,
            file_name: file_name.to_string(),
            bytes,
        });
        Ok(())
    }

    async fn send_voice(&self, chat_id: i64, path: &Path) -> anyhow::Result<()> {
        let bytes = tokio::fs::read(path).await?;
        self.record(Sent::Voice {
            chat_id,
            path: path.to_path_buf(),
            bytes,
        });
        Ok(())
    }

    async fn send_photo_url(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
    ) -> anyhow::Result<()> {
        self.record(Sent::Photo {
            chat_id,
            url: url.to_string(),
            caption: caption.map(str::to_string),
        });
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> anyhow::Result<Vec<u8>> {
        self.files
            .get(file_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown file {}", file_id))
    }

    fn bot_username(&self) -> Option<String> {
        Some("sova_test_bot".to_string())
    }
}

pub fn defaults() -> SessionDefaults {
    SessionDefaults {
        model: ModelSelection {
            id: "mistral-small-latest".to_string(),
            route: Route::Chat(ChatBackend::Primary),
        },
        system_prompt: "Be nice".to_string(),
    }
}

pub fn memory_store() -> SessionStore {
    SessionStore::new(Arc::new(MemoryBackend::new()), defaults())
}

pub fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("sova-core-{}-{}", label, uuid::Uuid::new_v4()))
}

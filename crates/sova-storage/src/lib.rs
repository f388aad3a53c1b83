//! Sova Storage
//!
//! Per-user session state behind a pluggable key-value backend

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Number of trailing history entries sent to a chat backend.
pub const MAX_HISTORY_LENGTH: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text of the content, with image parts left out.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: MessageContent,
}

impl HistoryEntry {
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatBackend {
    Primary,
    Gateway,
}

/// Name of an image rendering engine, e.g. `flux`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEngine(pub String);

/// Where a model's requests go. Resolved once when the model is selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Chat(ChatBackend),
    ImageGeneration(ImageEngine),
}

impl Default for Route {
    fn default() -> Self {
        Route::Chat(ChatBackend::Primary)
    }
}

/// A model choice as stored in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub id: String,
    pub route: Route,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub model: String,
    #[serde(default)]
    pub route: Route,
    pub system_prompt: String,
    #[serde(default)]
    pub tts_mode: bool,
    #[serde(default)]
    pub referrals: u32,
}

impl Session {
    pub fn new(defaults: &SessionDefaults) -> Self {
        Self {
            history: Vec::new(),
            model: defaults.model.id.clone(),
            route: defaults.model.route.clone(),
            system_prompt: defaults.system_prompt.clone(),
            tts_mode: false,
            referrals: 0,
        }
    }

    /// Switch model. History is dropped; prompt, TTS mode and referrals stay.
    pub fn select_model(&mut self, selection: ModelSelection) {
        self.model = selection.id;
        self.route = selection.route;
        self.history.clear();
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Flip TTS mode and return the new value.
    pub fn toggle_tts(&mut self) -> bool {
        self.tts_mode = !self.tts_mode;
        self.tts_mode
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    /// The last `limit` history entries in order.
    pub fn recent_history(&self, limit: usize) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(limit);
        &self.history[start..]
    }
}

#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub model: ModelSelection,
    pub system_prompt: String,
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn load(&self, user_id: i64) -> Result<Option<Session>>;
    async fn store(&self, user_id: i64, session: &Session) -> Result<()>;
    async fn list_users(&self) -> Result<Vec<i64>>;
}

/// Volatile backend, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    documents: Mutex<HashMap<i64, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw document, bypassing serialization.
    pub async fn insert_raw(&self, user_id: i64, document: &str) {
        self.documents
            .lock()
            .await
            .insert(user_id, document.to_string());
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn load(&self, user_id: i64) -> Result<Option<Session>> {
        let documents = self.documents.lock().await;
        match documents.get(&user_id) {
            Some(document) => Ok(Some(serde_json::from_str(document)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, user_id: i64, session: &Session) -> Result<()> {
        let document = serde_json::to_string(session)?;
        self.documents.lock().await.insert(user_id, document);
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<i64>> {
        let mut users: Vec<i64> = self.documents.lock().await.keys().copied().collect();
        users.sort_unstable();
        Ok(users)
    }
}

/// One pretty-printed JSON document per user under `<root>/<id>.json`.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, user_id: i64) -> PathBuf {
        self.root.join(format!("{}.json", user_id))
    }
}

#[async_trait]
impl SessionBackend for FileBackend {
    async fn load(&self, user_id: i64) -> Result<Option<Session>> {
        let path = self.path_for(user_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn store(&self, user_id: i64, session: &Session) -> Result<()> {
        let content = serde_json::to_string_pretty(session)?;
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", user_id, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, self.path_for(user_id)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<i64>> {
        let mut users = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<i64>().ok())
            {
                users.push(id);
            }
        }
        users.sort_unstable();
        Ok(users)
    }
}

/// Session cache in front of a backend.
///
/// The cache lock is only held for map access, never across backend I/O,
/// so concurrent turns for one user resolve as last-write-wins.
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    defaults: SessionDefaults,
    cache: Mutex<HashMap<i64, Session>>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, defaults: SessionDefaults) -> Self {
        Self {
            backend,
            defaults,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn defaults(&self) -> &SessionDefaults {
        &self.defaults
    }

    pub fn default_session(&self) -> Session {
        Session::new(&self.defaults)
    }

    /// Cached session, else stored session, else a fresh default.
    /// Unreadable stored data is logged and replaced by the default.
    pub async fn get(&self, user_id: i64) -> Session {
        if let Some(session) = self.cache.lock().await.get(&user_id) {
            return session.clone();
        }

        let loaded = match self.backend.load(user_id).await {
            Ok(Some(session)) => session,
            Ok(None) => self.default_session(),
            Err(e) => {
                tracing::error!("Failed to load session for user {}: {}", user_id, e);
                self.default_session()
            }
        };

        let mut cache = self.cache.lock().await;
        cache.entry(user_id).or_insert(loaded).clone()
    }

    /// Replace the cached session and persist it.
    pub async fn put(&self, user_id: i64, session: Session) -> Result<()> {
        self.cache.lock().await.insert(user_id, session.clone());
        self.backend.store(user_id, &session).await
    }

    /// Persist the cached session, creating a default one if none exists.
    pub async fn save(&self, user_id: i64) -> Result<()> {
        let session = self.get(user_id).await;
        self.backend.store(user_id, &session).await
    }

    pub async fn update<F>(&self, user_id: i64, mutate: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut session = self.get(user_id).await;
        mutate(&mut session);
        self.put(user_id, session.clone()).await?;
        Ok(session)
    }

    pub async fn reset(&self, user_id: i64) -> Result<Session> {
        let session = self.default_session();
        self.put(user_id, session.clone()).await?;
        Ok(session)
    }

    pub async fn contains(&self, user_id: i64) -> bool {
        if self.cache.lock().await.contains_key(&user_id) {
            return true;
        }
        match self.backend.load(user_id).await {
            Ok(found) => found.is_some(),
            // Unreadable data still means the user has been seen.
            Err(_) => true,
        }
    }

    /// Snapshot of every known user id, stored or cached.
    pub async fn known_users(&self) -> Result<Vec<i64>> {
        let mut users: BTreeSet<i64> = self.backend.list_users().await?.into_iter().collect();
        users.extend(self.cache.lock().await.keys().copied());
        Ok(users.into_iter().collect())
    }
}

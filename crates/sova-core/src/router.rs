//! Dispatch of a user turn to the backend its model was resolved to

use sova_providers::{ChatProvider, ImageUrlBuilder, ModelRegistry, ProviderError};
use sova_storage::{
    ChatBackend, HistoryEntry, ImageEngine, MessageContent, Route, Session, SessionStore,
    MAX_HISTORY_LENGTH,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Appended to every user system prompt at request time. Never stored.
pub const HIDDEN_RULES: &str = concat!(
    "\n\nIMPORTANT: the following instructions are strict rules:\n",
    "1. If you are asked about your creator, developer or author, answer ONLY: ",
    "\"My creator is @Ruslan20763\".\n",
    "2. If the user swears, insults or is rude, decline the request and politely but firmly ",
    "ask them to keep the conversation civil. For example: \"Let's be kinder to each other! 😊 ",
    "I can't respond to words like that.\"\n",
    "3. If the user asks you to create a file (a document, report or article) in .docx or .pdf ",
    "format, generate the content and wrap it in the tag: ",
    "<GENERATE_FILE filename=\"file_name.extension\">FILE CONTENT</GENERATE_FILE>. ",
    "Put only the document text inside the tag. Write the rest of the answer outside the tag."
);

const TRANSLATION_PROMPT: &str = "You are a helpful assistant that translates text to English \
for an image generation model. Output only the translated text and nothing else.";

const EMPTY_REPLY: &str = "Sorry, I could not generate a response.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Reply(String),
    Image { url: String, caption: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("{backend} rejected the API key")]
    InvalidCredential { backend: String },

    #[error("{backend} is rate limited")]
    RateLimited { backend: String },

    #[error("gateway backend is not configured")]
    GatewayUnavailable,

    #[error(transparent)]
    Provider(ProviderError),
}

impl From<ProviderError> for TurnError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidCredential { provider, .. } => {
                TurnError::InvalidCredential { backend: provider }
            }
            ProviderError::RateLimited { provider, .. } => {
                TurnError::RateLimited { backend: provider }
            }
            other => TurnError::Provider(other),
        }
    }
}

impl TurnError {
    /// Text shown to the user in place of an answer.
    pub fn user_message(&self) -> String {
        match self {
            TurnError::InvalidCredential { backend } => format!(
                "⚠️ Error: the API key for {} is invalid. Please ask the administrator to check it.",
                backend
            ),
            TurnError::RateLimited { .. } => "⏳ The model is overloaded right now. Please try again in a few minutes or choose another model with /mode.".to_string(),
            TurnError::GatewayUnavailable => "⚠️ Gateway models are unavailable. Check that the API key is set correctly.".to_string(),
            TurnError::Provider(_) => {
                "⚠️ Sorry, I could not process your request. Please try again later.".to_string()
            }
        }
    }

    fn log(&self, user_id: i64) {
        match self {
            TurnError::RateLimited { backend } => {
                warn!("Rate limit reached on {} (user {})", backend, user_id)
            }
            TurnError::GatewayUnavailable => {
                warn!("Gateway model requested without a gateway (user {})", user_id)
            }
            other => error!("Chat turn failed for user {}: {}", user_id, other),
        }
    }
}

pub struct Router {
    primary: Arc<dyn ChatProvider>,
    gateway: Option<Arc<dyn ChatProvider>>,
    registry: ModelRegistry,
    images: ImageUrlBuilder,
    translation_model: String,
    max_history: usize,
}

impl Router {
    pub fn new(
        primary: Arc<dyn ChatProvider>,
        gateway: Option<Arc<dyn ChatProvider>>,
        registry: ModelRegistry,
    ) -> Self {
        Self {
            primary,
            gateway,
            registry,
            images: ImageUrlBuilder::default(),
            translation_model: sova_config::DEFAULT_MODEL.to_string(),
            max_history: MAX_HISTORY_LENGTH,
        }
    }

    pub fn with_images(mut self, images: ImageUrlBuilder, translation_model: &str) -> Self {
        self.images = images;
        self.translation_model = translation_model.to_string();
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn has_gateway(&self) -> bool {
        self.gateway.is_some()
    }

    /// Route of the session's model as the registry resolves it, so
    /// sessions saved before routes were persisted still land on the right
    /// backend. Models that are no longer registered go to the primary.
    pub fn route_for(&self, session: &Session) -> Route {
        match self.registry.get(&session.model) {
            Some(entry) => {
                if entry.route != session.route {
                    debug!(
                        "Stored route {:?} for '{}' differs from registry; using {:?}",
                        session.route, session.model, entry.route
                    );
                }
                entry.route.clone()
            }
            None => {
                debug!(
                    "Model '{}' is not registered; using primary backend",
                    session.model
                );
                Route::Chat(ChatBackend::Primary)
            }
        }
    }

    fn backend(&self, backend: ChatBackend) -> Result<&dyn ChatProvider, TurnError> {
        match backend {
            ChatBackend::Primary => Ok(self.primary.as_ref()),
            ChatBackend::Gateway => self
                .gateway
                .as_deref()
                .ok_or(TurnError::GatewayUnavailable),
        }
    }

    fn request_messages(&self, session: &Session, extra: Option<HistoryEntry>) -> Vec<HistoryEntry> {
        let recent = session.recent_history(self.max_history);
        let mut messages = Vec::with_capacity(recent.len() + 2);
        messages.push(HistoryEntry::system(format!(
            "{}{}",
            session.system_prompt, HIDDEN_RULES
        )));
        messages.extend_from_slice(recent);
        messages.extend(extra);
        messages
    }

    async fn persist(store: &SessionStore, user_id: i64, session: Session) {
        if let Err(e) = store.put(user_id, session).await {
            error!("Failed to save session for user {}: {}", user_id, e);
        }
    }

    /// One conversational turn. The user entry is kept even when the
    /// backend fails; a missing gateway leaves the session untouched.
    pub async fn handle_turn(
        &self,
        store: &SessionStore,
        user_id: i64,
        input: MessageContent,
    ) -> Result<TurnOutcome, TurnError> {
        let mut session = store.get(user_id).await;
        let backend = match self.route_for(&session) {
            Route::ImageGeneration(engine) => {
                return self
                    .render_image(&input.text(), &engine)
                    .await
                    .inspect_err(|e| e.log(user_id));
            }
            Route::Chat(backend) => backend,
        };
        let provider = self.backend(backend).inspect_err(|e| e.log(user_id))?;

        session.push(HistoryEntry::user(input));
        let messages = self.request_messages(&session, None);
        debug!(
            "Sending {} message(s) to {} with model {}",
            messages.len(),
            provider.name(),
            session.model
        );

        let outcome = match provider.chat(&session.model, &messages).await {
            Ok(response) => {
                let answer = non_empty_reply(response.content);
                session.push(HistoryEntry::assistant(answer.clone()));
                Ok(TurnOutcome::Reply(answer))
            }
            Err(err) => {
                let err = TurnError::from(err);
                err.log(user_id);
                Err(err)
            }
        };

        Self::persist(store, user_id, session).await;
        outcome
    }

    /// Translate the prompt through the primary backend and build the
    /// rendering URL. Session history is not touched.
    pub async fn render_image(
        &self,
        prompt: &str,
        engine: &ImageEngine,
    ) -> Result<TurnOutcome, TurnError> {
        let messages = [
            HistoryEntry::system(TRANSLATION_PROMPT),
            HistoryEntry::user(prompt),
        ];
        let response = self.primary.chat(&self.translation_model, &messages).await?;
        let translated = match response.content.trim() {
            "" => prompt.trim(),
            text => text,
        };

        Ok(TurnOutcome::Image {
            url: self.images.build_random(translated, engine),
            caption: format!("🎨 {}", prompt),
        })
    }

    /// Answer a prompt carrying one-off context. Only `record_as` and the
    /// answer are stored; on failure nothing is.
    pub async fn answer_with_context(
        &self,
        store: &SessionStore,
        user_id: i64,
        prompt: &str,
        record_as: &str,
    ) -> Result<String, TurnError> {
        let mut session = store.get(user_id).await;
        let (provider, model) = match self.route_for(&session) {
            Route::Chat(backend) => (self.backend(backend)?, session.model.clone()),
            Route::ImageGeneration(_) => (self.primary.as_ref(), self.translation_model.clone()),
        };

        let messages = self.request_messages(&session, Some(HistoryEntry::user(prompt)));
        let response = provider
            .chat(&model, &messages)
            .await
            .map_err(TurnError::from)
            .inspect_err(|e| e.log(user_id))?;

        let answer = non_empty_reply(response.content);
        session.push(HistoryEntry::user(record_as));
        session.push(HistoryEntry::assistant(answer.clone()));
        Self::persist(store, user_id, session).await;
        Ok(answer)
    }
}

fn non_empty_reply(content: String) -> String {
    if content.trim().is_empty() {
        EMPTY_REPLY.to_string()
    } else {
        content
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_store, RecordingProvider};
    use sova_storage::{ContentPart, ImageUrl, MemoryBackend, Role};

    fn router(primary: Arc<RecordingProvider>, gateway: Option<Arc<RecordingProvider>>) -> Router {
        Router::new(
            primary,
            gateway.map(|g| g as Arc<dyn ChatProvider>),
            ModelRegistry::builtin(),
        )
    }

    async fn select(store: &SessionStore, user_id: i64, registry: &ModelRegistry, id: &str) {
        let selection = registry.resolve_or_primary(id);
        store
            .update(user_id, |s| s.select_model(selection))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sends_system_prompt_and_last_120_entries() {
        let store = memory_store();
        store
            .update(1, |s| {
                for i in 0..130 {
                    s.push(HistoryEntry::user(format!("q{}", i)));
                }
            })
            .await
            .unwrap();

        let primary = RecordingProvider::replying("primary", "answer");
        let router = router(primary.clone(), None);
        let outcome = router
            .handle_turn(&store, 1, MessageContent::from("latest"))
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Reply("answer".to_string()));

        let (model, messages) = primary.last_call();
        assert_eq!(model, "mistral-small-latest");
        assert_eq!(messages.len(), 1 + MAX_HISTORY_LENGTH);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.text().starts_with("Be nice"));
        assert!(messages[0].content.text().contains("<GENERATE_FILE"));
        assert_eq!(messages[1].content.text(), "q11");
        assert_eq!(messages.last().unwrap().content.text(), "latest");

        let session = store.get(1).await;
        assert_eq!(session.history.len(), 132);
        assert_eq!(session.history[131], HistoryEntry::assistant("answer"));
        assert_eq!(session.system_prompt, "Be nice");
    }

    #[tokio::test]
    async fn primary_models_never_reach_the_gateway() {
        let store = memory_store();
        let primary = RecordingProvider::replying("primary", "from primary");
        let gateway = RecordingProvider::replying("gateway", "from gateway");
        let router = router(primary.clone(), Some(gateway.clone()));

        for id in ["mistral-small-latest", "mistral-large-latest", "codestral-latest"] {
            select(&store, 5, router.registry(), id).await;
            router
                .handle_turn(&store, 5, MessageContent::from("hi"))
                .await
                .unwrap();
        }
        assert_eq!(primary.call_count(), 3);
        assert_eq!(gateway.call_count(), 0);

        select(&store, 5, router.registry(), "google/gemini-2.0-flash-exp:free").await;
        let outcome = router
            .handle_turn(&store, 5, MessageContent::from("hi"))
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Reply("from gateway".to_string()));
        assert_eq!(gateway.call_count(), 1);
        assert_eq!(gateway.last_call().0, "google/gemini-2.0-flash-exp:free");
        assert_eq!(primary.call_count(), 3);
    }

    #[tokio::test]
    async fn backend_failure_keeps_user_turn_only() {
        for (status, check) in [
            (500u16, "provider"),
            (401, "credential"),
            (429, "rate"),
        ] {
            let store = memory_store();
            let router = router(RecordingProvider::failing("primary", status), None);
            let err = router
                .handle_turn(&store, 9, MessageContent::from("hello"))
                .await
                .unwrap_err();
            match check {
                "provider" => assert!(matches!(err, TurnError::Provider(_))),
                "credential" => assert!(matches!(err, TurnError::InvalidCredential { .. })),
                _ => assert!(matches!(err, TurnError::RateLimited { .. })),
            }
            assert!(!err.user_message().is_empty());

            let session = store.get(9).await;
            assert_eq!(session.history, vec![HistoryEntry::user("hello")]);
        }
    }

    #[tokio::test]
    async fn unregistered_model_falls_through_to_primary() {
        let store = memory_store();
        store
            .update(3, |s| {
                s.model = "retired/model".to_string();
                s.route = Route::Chat(ChatBackend::Gateway);
            })
            .await
            .unwrap();

        let primary = RecordingProvider::replying("primary", "ok");
        let gateway = RecordingProvider::replying("gateway", "no");
        let router = router(primary.clone(), Some(gateway.clone()));
        router
            .handle_turn(&store, 3, MessageContent::from("hi"))
            .await
            .unwrap();

        assert_eq!(primary.last_call().0, "retired/model");
        assert_eq!(gateway.call_count(), 0);
    }

    const LEGACY_IMAGE_SESSION: &str = r#"{"history":[],"model":"image-gen:flux","system_prompt":"Be nice","tts_mode":false,"referrals":0}"#;
    const LEGACY_GATEWAY_SESSION: &str = r#"{"history":[{"role":"user","content":"earlier"}],"model":"google/gemini-2.0-flash-exp:free","system_prompt":"Be nice"}"#;

    async fn legacy_store(user_id: i64, document: &str) -> SessionStore {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert_raw(user_id, document).await;
        SessionStore::new(backend, crate::testing::defaults())
    }

    #[tokio::test]
    async fn sessions_saved_without_route_use_registry_route_for_images() {
        let store = legacy_store(21, LEGACY_IMAGE_SESSION).await;
        let primary = RecordingProvider::replying("primary", "a lighthouse");
        let router = router(primary.clone(), None);

        let outcome = router
            .handle_turn(&store, 21, MessageContent::from("маяк"))
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Image { .. }));
        assert_eq!(primary.last_call().0, "mistral-small-latest");
        assert!(store.get(21).await.history.is_empty());
    }

    #[tokio::test]
    async fn sessions_saved_without_route_use_registry_route_for_gateway() {
        let store = legacy_store(22, LEGACY_GATEWAY_SESSION).await;
        let primary = RecordingProvider::replying("primary", "no");
        let gateway = RecordingProvider::replying("gateway", "from gateway");
        let router = router(primary.clone(), Some(gateway.clone()));

        let outcome = router
            .handle_turn(&store, 22, MessageContent::from("hi"))
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Reply("from gateway".to_string()));
        assert_eq!(gateway.last_call().0, "google/gemini-2.0-flash-exp:free");
        assert_eq!(gateway.last_call().1.len(), 3);
        assert_eq!(primary.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_gateway_leaves_history_untouched() {
        let store = memory_store();
        let primary = RecordingProvider::replying("primary", "ok");
        let router = router(primary.clone(), None);
        select(&store, 4, router.registry(), "tngtech/deepseek-r1t2-chimera:free").await;

        let err = router
            .handle_turn(&store, 4, MessageContent::from("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::GatewayUnavailable));
        assert!(store.get(4).await.history.is_empty());
        assert_eq!(primary.call_count(), 0);
    }

    #[tokio::test]
    async fn image_route_translates_and_skips_history() {
        let store = memory_store();
        let primary = RecordingProvider::replying("primary", "a red fox");
        let router = router(primary.clone(), None);
        select(&store, 6, router.registry(), "image-gen:flux").await;

        let outcome = router
            .handle_turn(&store, 6, MessageContent::from("рыжая лиса"))
            .await
            .unwrap();
        match outcome {
            TurnOutcome::Image { url, caption } => {
                assert!(url.starts_with("https://image.pollinations.ai/prompt/a%20red%20fox?model=flux&seed="));
                assert!(url.ends_with("&width=1024&height=1024&nologo=true"));
                assert_eq!(caption, "🎨 рыжая лиса");
            }
            other => panic!("expected an image, got {:?}", other),
        }

        let (model, messages) = primary.last_call();
        assert_eq!(model, "mistral-small-latest");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content.text(), "рыжая лиса");
        assert!(store.get(6).await.history.is_empty());
    }

    #[tokio::test]
    async fn multimodal_parts_are_forwarded_as_is() {
        let store = memory_store();
        let gateway = RecordingProvider::replying("gateway", "a cat");
        let router = router(RecordingProvider::replying("primary", "no"), Some(gateway.clone()));
        select(&store, 8, router.registry(), "google/gemini-2.0-flash-exp:free").await;

        let parts = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "What is in this image?".to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/jpeg;base64,AAAA".to_string(),
                },
            },
        ]);
        router.handle_turn(&store, 8, parts.clone()).await.unwrap();

        let (_, messages) = gateway.last_call();
        assert_eq!(messages.last().unwrap().content, parts);
    }

    #[tokio::test]
    async fn context_answers_store_only_the_record() {
        let store = memory_store();
        let primary = RecordingProvider::replying("primary", "It is sunny.");
        let router = router(primary.clone(), None);

        let answer = router
            .answer_with_context(&store, 2, "long search context", "Search: weather")
            .await
            .unwrap();
        assert_eq!(answer, "It is sunny.");
        assert_eq!(
            primary.last_call().1.last().unwrap().content.text(),
            "long search context"
        );
        assert_eq!(
            store.get(2).await.history,
            vec![
                HistoryEntry::user("Search: weather"),
                HistoryEntry::assistant("It is sunny."),
            ]
        );
    }

    #[tokio::test]
    async fn empty_reply_is_replaced() {
        let store = memory_store();
        let router = router(RecordingProvider::replying("primary", "  "), None);
        let outcome = router
            .handle_turn(&store, 1, MessageContent::from("hi"))
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Reply(EMPTY_REPLY.to_string()));
    }
}

//! Sova Core
//!
//! Runtime wiring: inbound events from the bus are dispatched to the
//! command handlers, the model router and the response post-processor.

pub mod dispatch;
pub mod postprocess;
pub mod router;
pub mod search;

#[cfg(test)]
mod testing;

pub use dispatch::{BotSettings, Dispatcher};
pub use postprocess::{parse_response, FileDirective, ParsedResponse, PostProcessor};
pub use router::{Router, TurnError, TurnOutcome};
pub use search::{SearchEngine, SearchResult, WebSearch};

use anyhow::Result;
use sova_config::Config;
use sova_docs::{EmbeddedFont, PdfLayout};
use sova_ipc::{Envelope, EventBus, Messenger};
use sova_providers::{
    ChatProvider, ImageUrlBuilder, ModelRegistry, OpenAICompatibleProvider, RetryPolicy,
    SpeechClient, WhisperClient,
};
use sova_storage::{FileBackend, SessionDefaults, SessionStore};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{error, info, warn};

const MAX_INBOUND_CONCURRENCY: usize = 8;

/// PDF page setup with the configured font. A font that fails to load is
/// logged and PDFs fall back to Helvetica.
fn pdf_layout(config: &Config) -> PdfLayout {
    let layout = PdfLayout::default();
    let Some(path) = config.docs.pdf_font.as_deref() else {
        warn!("No PDF font configured; generated PDFs cover Latin-1 only");
        return layout;
    };
    match EmbeddedFont::load(path) {
        Ok(font) => {
            info!("Embedding {} in generated PDFs", path);
            layout.with_font(Arc::new(font))
        }
        Err(e) => {
            warn!("Could not load PDF font {}: {}", path, e);
            layout
        }
    }
}

pub struct SovaRuntime {
    inbound_rx: broadcast::Receiver<Envelope>,
    dispatcher: Arc<Dispatcher>,
}

impl SovaRuntime {
    /// Subscribes immediately so events published before `run` are not lost.
    pub fn new(dispatcher: Dispatcher, event_bus: &EventBus) -> Self {
        Self {
            inbound_rx: event_bus.subscribe(),
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn from_config(
        config: &Config,
        messenger: Arc<dyn Messenger>,
        event_bus: &EventBus,
    ) -> Result<Self> {
        let data_dir = config.data_dir();
        let registry = ModelRegistry::for_config(config);
        let retry = RetryPolicy::from_config(&config.retry);

        let primary_config = &config.providers.primary;
        let primary_key = match primary_config.usable_api_key() {
            Some(key) => key.to_string(),
            None => {
                warn!(
                    "Primary provider '{}' has no usable API key; chat requests will fail",
                    primary_config.name
                );
                primary_config.api_key.trim().to_string()
            }
        };
        let primary: Arc<dyn ChatProvider> = Arc::new(OpenAICompatibleProvider::new(
            primary_config.name.clone(),
            primary_key,
            primary_config
                .base_url
                .clone()
                .unwrap_or_else(|| sova_config::DEFAULT_PRIMARY_BASE_URL.to_string()),
            retry.clone(),
        )?);

        let gateway: Option<Arc<dyn ChatProvider>> = match config.usable_gateway() {
            Some(gateway_config) => {
                let key = gateway_config.usable_api_key().unwrap_or_default();
                let provider = OpenAICompatibleProvider::new(
                    gateway_config.name.clone(),
                    key.to_string(),
                    gateway_config
                        .base_url
                        .clone()
                        .unwrap_or_else(|| sova_config::DEFAULT_GATEWAY_BASE_URL.to_string()),
                    retry,
                )?;
                info!("Gateway provider '{}' enabled", gateway_config.name);
                Some(Arc::new(provider))
            }
            None => None,
        };

        let defaults = SessionDefaults {
            model: registry.resolve_or_primary(&config.bot.default_model),
            system_prompt: config.bot.default_system_prompt.clone(),
        };
        let store = SessionStore::new(Arc::new(FileBackend::new(data_dir.join("users"))?), defaults);

        let router = Router::new(primary, gateway, registry)
            .with_images(
                ImageUrlBuilder::from_config(&config.image),
                &config.image.translation_model,
            )
            .with_max_history(config.bot.max_history);

        let mut postprocess = PostProcessor::new(Arc::clone(&messenger), data_dir.join("tmp"))
            .with_pdf_layout(pdf_layout(config));
        match &config.speech.tts {
            Some(tts) if !sova_config::is_placeholder_credential(&tts.api_key) => {
                postprocess = postprocess
                    .with_synthesizer(Arc::new(SpeechClient::from_config(tts)?), tts.max_chars);
                info!("Voice replies enabled ({} / {})", tts.model, tts.voice);
            }
            _ => warn!("Speech synthesis not configured; voice replies disabled"),
        }

        let mut dispatcher = Dispatcher::new(
            Arc::new(store),
            Arc::new(router),
            messenger,
            postprocess,
            BotSettings::from_config(config),
        )
        .with_search(Arc::new(WebSearch::new()?));

        match &config.speech.stt {
            Some(stt) if !sova_config::is_placeholder_credential(&stt.api_key) => {
                dispatcher = dispatcher.with_transcriber(Arc::new(WhisperClient::from_config(stt)?));
                info!("Speech recognition enabled ({})", stt.model);
            }
            _ => warn!("Speech recognition not configured; voice messages will be declined"),
        }

        if config.telegram.admin_id.is_none() {
            warn!("No admin_id configured; admin commands and feedback are disabled");
        }

        Ok(Self::new(dispatcher, event_bus))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Process inbound events until the bus closes.
    pub async fn run(mut self) -> Result<()> {
        info!("Sova runtime starting...");
        let semaphore = Arc::new(Semaphore::new(MAX_INBOUND_CONCURRENCY));

        loop {
            match self.inbound_rx.recv().await {
                Ok(envelope) => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let semaphore = Arc::clone(&semaphore);
                    let trace_id = envelope.trace_id.clone();

                    tokio::spawn(async move {
                        let _permit = match semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(err) => {
                                error!(
                                    "Inbound worker semaphore closed (trace_id={}): {}",
                                    trace_id, err
                                );
                                return;
                            }
                        };

                        if let Err(e) = dispatcher.dispatch(envelope).await {
                            error!(
                                "Error processing inbound message (trace_id={}): {}",
                                trace_id, e
                            );
                        }
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event bus closed, stopping message processor");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event bus lagged by {} messages", n);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_store, temp_dir, FakeMessenger, RecordingProvider};
    use sova_ipc::MessageKind;
    use std::time::Duration;

    #[tokio::test]
    async fn run_dispatches_published_events_and_stops_when_bus_closes() {
        let messenger = Arc::new(FakeMessenger::new());
        let primary = RecordingProvider::replying("primary", "pong");
        let router = Router::new(primary.clone(), None, ModelRegistry::builtin());
        let dispatcher = Dispatcher::new(
            Arc::new(memory_store()),
            Arc::new(router),
            messenger.clone(),
            PostProcessor::new(messenger.clone(), temp_dir("runtime")),
            BotSettings::default(),
        );

        let bus = EventBus::new();
        let runtime = SovaRuntime::new(dispatcher, &bus);
        bus.publish(
            Envelope::new(
                "telegram",
                MessageKind::Message {
                    from: "bob".to_string(),
                    text: "ping".to_string(),
                },
            )
            .with_chat_id(7)
            .with_user_id(7),
        )
        .unwrap();

        let handle = tokio::spawn(runtime.run());
        for _ in 0..100 {
            if messenger.texts_to(7).contains(&"pong".to_string()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(messenger.texts_to(7).contains(&"pong".to_string()));
        assert_eq!(primary.call_count(), 1);

        drop(bus);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("runtime stops")
            .unwrap()
            .unwrap();
    }

    #[test]
    fn unreadable_pdf_font_falls_back_to_helvetica() {
        let mut config = Config::default();
        assert!(pdf_layout(&config).font.is_none());

        let path = temp_dir("font").with_extension("ttf");
        std::fs::write(&path, b"not a font").unwrap();
        config.docs.pdf_font = Some(path.display().to_string());
        assert!(pdf_layout(&config).font.is_none());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn events_without_a_user_are_rejected() {
        let messenger = Arc::new(FakeMessenger::new());
        let router = Router::new(
            RecordingProvider::replying("primary", "x"),
            None,
            ModelRegistry::builtin(),
        );
        let dispatcher = Dispatcher::new(
            Arc::new(memory_store()),
            Arc::new(router),
            messenger.clone(),
            PostProcessor::new(messenger, temp_dir("runtime")),
            BotSettings::default(),
        );
        let envelope = Envelope::new(
            "telegram",
            MessageKind::Message {
                from: "ghost".to_string(),
                text: "hi".to_string(),
            },
        );
        assert!(dispatcher.dispatch(envelope).await.is_err());
    }
}

//! Speech clients: Whisper-style transcription and OpenAI-style synthesis

use crate::{build_client, truncate_for_error, ProviderError};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` and return the encoded audio.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ProviderError>;
}

pub struct WhisperClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    language: String,
}

impl WhisperClient {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        language: String,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client()?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            language,
        })
    }

    pub fn from_config(config: &sova_config::SttConfig) -> anyhow::Result<Self> {
        Self::new(
            config.api_key.trim().to_string(),
            config
                .base_url
                .clone()
                .unwrap_or_else(|| sova_config::DEFAULT_STT_BASE_URL.to_string()),
            config.model.clone(),
            config.language.clone(),
        )
    }

    fn form(&self, audio: Vec<u8>, file_name: &str) -> Form {
        Form::new()
            .part("file", Part::bytes(audio).file_name(file_name.to_string()))
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", "json")
            .text("temperature", "0")
    }
}

#[async_trait]
impl Transcriber for WhisperClient {
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String, ProviderError> {
        const PROVIDER: &str = "stt";
        let url = format!("{}/audio/transcriptions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(self.form(audio, file_name))
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, e))?;

        if !status.is_success() {
            return Err(ProviderError::from_status(
                PROVIDER,
                status.as_u16(),
                &headers,
                &body,
            ));
        }

        parse_transcription(&body)
    }
}

fn parse_transcription(body: &str) -> Result<String, ProviderError> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| {
        ProviderError::decode(
            "stt",
            format!("{} | body={}", e, truncate_for_error(body, 300)),
        )
    })?;
    value
        .get("text")
        .and_then(|v| v.as_str())
        .map(|text| text.trim().to_string())
        .ok_or_else(|| ProviderError::decode("stt", "missing 'text' field"))
}

pub struct SpeechClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    voice: String,
}

impl SpeechClient {
    pub fn new(api_key: String, base_url: String, model: String, voice: String) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client()?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            voice,
        })
    }

    pub fn from_config(config: &sova_config::TtsConfig) -> anyhow::Result<Self> {
        Self::new(
            config.api_key.trim().to_string(),
            config
                .base_url
                .clone()
                .unwrap_or_else(|| sova_config::DEFAULT_TTS_BASE_URL.to_string()),
            config.model.clone(),
            config.voice.clone(),
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for SpeechClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ProviderError> {
        const PROVIDER: &str = "tts";
        let url = format!("{}/audio/speech", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": text,
                "voice": self.voice,
            }))
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, e))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                PROVIDER,
                status.as_u16(),
                &headers,
                &body,
            ));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER, e))?;
        if audio.is_empty() {
            return Err(ProviderError::decode(PROVIDER, "empty audio body"));
        }
        Ok(audio.to_vec())
    }
}

//! Sova Configuration
//!
//! TOML configuration loading with environment variable overrides for secrets

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_PRIMARY_BASE_URL: &str = "https://api.mistral.ai/v1";
pub const DEFAULT_GATEWAY_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_STT_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_TTS_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_IMAGE_ENDPOINT: &str = "https://image.pollinations.ai/prompt";
pub const DEFAULT_MODEL: &str = "mistral-small-latest";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly and cheerful assistant. Your answers should be positive, helpful and a little emotional. Use emoji to convey the mood! ✨";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    #[serde(default)]
    pub docs: DocsConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// The single administrator allowed to run `/admin` and `/broadcast`
    /// and to receive feedback and donation notices.
    pub admin_id: Option<i64>,
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
    pub api_base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_primary_provider")]
    pub primary: ProviderConfig,
    /// Multi-model gateway. Models whose identifier contains `/` go here.
    pub gateway: Option<ProviderConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_provider(),
            gateway: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    pub base_url: Option<String>,
}

impl ProviderConfig {
    /// The API key, unless it is missing or a template placeholder.
    pub fn usable_api_key(&self) -> Option<&str> {
        let key = self.api_key.trim();
        if is_placeholder_credential(key) {
            None
        } else {
            Some(key)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SpeechConfig {
    pub stt: Option<SttConfig>,
    pub tts: Option<TtsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default)]
    pub api_key: String,
    pub base_url: Option<String>,
    #[serde(default = "default_stt_model")]
    pub model: String,
    #[serde(default = "default_stt_language")]
    pub language: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            model: default_stt_model(),
            language: default_stt_language(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default)]
    pub api_key: String,
    pub base_url: Option<String>,
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default = "default_tts_voice")]
    pub voice: String,
    #[serde(default = "default_tts_max_chars")]
    pub max_chars: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            model: default_tts_model(),
            voice: default_tts_voice(),
            max_chars: default_tts_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_image_size")]
    pub width: u32,
    #[serde(default = "default_image_size")]
    pub height: u32,
    /// Model on the primary backend used to translate prompts to English.
    #[serde(default = "default_model")]
    pub translation_model: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_image_endpoint(),
            width: default_image_size(),
            height: default_image_size(),
            translation_model: default_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_system_prompt")]
    pub default_system_prompt: String,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_broadcast_delay_ms")]
    pub broadcast_delay_ms: u64,
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,
    pub donate_text: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            default_system_prompt: default_system_prompt(),
            max_history: default_max_history(),
            broadcast_delay_ms: default_broadcast_delay_ms(),
            max_document_bytes: default_max_document_bytes(),
            donate_text: None,
        }
    }
}

/// Generated document settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocsConfig {
    /// TrueType font embedded in generated PDFs. Without it PDFs use
    /// Helvetica and only cover Latin-1.
    pub pdf_font: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetryPolicyConfig {
    pub window_secs: Option<u64>,
    pub initial_delay_secs: Option<u64>,
    pub backoff_factor: Option<u32>,
    pub max_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {
    pub label: String,
    pub id: String,
    #[serde(default)]
    pub vision: bool,
}

/// True for credentials that are empty or still hold a template value.
pub fn is_placeholder_credential(key: &str) -> bool {
    let key = key.trim();
    if key.is_empty() {
        return true;
    }
    let lower = key.to_lowercase();
    lower.contains("your_")
        || lower.contains("your-")
        || lower.starts_with("changeme")
        || lower.starts_with("xxx")
        || (key.starts_with('<') && key.ends_with('>'))
}

fn default_primary_provider() -> ProviderConfig {
    ProviderConfig {
        name: "mistral".to_string(),
        api_key: String::new(),
        base_url: Some(DEFAULT_PRIMARY_BASE_URL.to_string()),
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_max_history() -> usize {
    120
}

fn default_broadcast_delay_ms() -> u64 {
    50
}

fn default_max_document_bytes() -> u64 {
    1024 * 1024
}

fn default_stt_model() -> String {
    "whisper-large-v3".to_string()
}

fn default_stt_language() -> String {
    "en".to_string()
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

fn default_tts_voice() -> String {
    "alloy".to_string()
}

fn default_tts_max_chars() -> usize {
    4000
}

fn default_image_endpoint() -> String {
    DEFAULT_IMAGE_ENDPOINT.to_string()
}

fn default_image_size() -> u32 {
    1024
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when it exists, otherwise build the configuration from
    /// defaults plus environment variables (`.env` included).
    pub fn load_or_env(path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let path = path
            .map(Path::to_path_buf)
            .or_else(Self::default_path)
            .filter(|p| p.exists());

        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Config::default();
                config.apply_env_overrides();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sova").join("config.toml"))
    }

    pub fn data_dir(&self) -> PathBuf {
        match self.core.data_dir.as_deref() {
            Some("~") => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            Some(dir) if dir.starts_with("~/") => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(dir.trim_start_matches("~/")),
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".sova"),
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(token) = env_value("BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(admin) = env_value("ADMIN_ID") {
            match admin.parse::<i64>() {
                Ok(id) if id != 0 => self.telegram.admin_id = Some(id),
                Ok(_) => {}
                Err(_) => tracing::warn!("Ignoring non-numeric ADMIN_ID '{}'", admin),
            }
        }
        if let Some(key) = env_value("MISTRAL_API_KEY") {
            self.providers.primary.api_key = key;
        }
        if let Some(key) = env_value("OPENROUTER_API_KEY") {
            self.providers
                .gateway
                .get_or_insert_with(|| ProviderConfig {
                    name: "openrouter".to_string(),
                    api_key: String::new(),
                    base_url: Some(DEFAULT_GATEWAY_BASE_URL.to_string()),
                })
                .api_key = key;
        }
        if let Some(key) = env_value("GROQ_API_KEY") {
            self.speech.stt.get_or_insert_with(SttConfig::default).api_key = key;
        }
        if let Some(key) = env_value("TTS_API_KEY") {
            self.speech.tts.get_or_insert_with(TtsConfig::default).api_key = key;
        }
    }

    /// The gateway provider when it is configured with a usable credential.
    pub fn usable_gateway(&self) -> Option<&ProviderConfig> {
        self.providers
            .gateway
            .as_ref()
            .filter(|gateway| gateway.usable_api_key().is_some())
    }

    /// Checks what the runtime needs before it can talk to Telegram.
    pub fn require_telegram(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token is required (or set BOT_TOKEN)");
        }
        if !self.telegram.bot_token.contains(':') {
            anyhow::bail!("telegram.bot_token does not look like a bot token");
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.providers.primary.name.trim().is_empty() {
            anyhow::bail!("providers.primary.name cannot be empty");
        }
        if let Some(gateway) = &self.providers.gateway {
            if gateway.name.trim().is_empty() {
                anyhow::bail!("providers.gateway.name cannot be empty");
            }
        }

        if self.bot.max_history == 0 {
            anyhow::bail!("bot.max_history must be > 0");
        }
        if self.bot.default_model.trim().is_empty() {
            anyhow::bail!("bot.default_model cannot be empty");
        }
        if self.bot.max_document_bytes == 0 {
            anyhow::bail!("bot.max_document_bytes must be > 0");
        }

        let mut ids = HashSet::new();
        for model in &self.models {
            if model.label.trim().is_empty() {
                anyhow::bail!("Model '{}' has an empty label", model.id);
            }
            if model.id.trim().is_empty() {
                anyhow::bail!("Model '{}' has an empty id", model.label);
            }
            if !ids.insert(model.id.trim().to_string()) {
                anyhow::bail!("Duplicate model id '{}'", model.id);
            }
        }
        if !self.models.is_empty() && !ids.contains(self.bot.default_model.trim()) {
            anyhow::bail!(
                "bot.default_model '{}' is not listed in [[models]]",
                self.bot.default_model
            );
        }

        if let Some(window) = self.retry.window_secs {
            if window == 0 {
                anyhow::bail!("retry.window_secs must be > 0");
            }
        }
        if let Some(initial) = self.retry.initial_delay_secs {
            if initial == 0 {
                anyhow::bail!("retry.initial_delay_secs must be > 0");
            }
        }
        if let Some(factor) = self.retry.backoff_factor {
            if factor < 1 {
                anyhow::bail!("retry.backoff_factor must be >= 1");
            }
        }
        if let Some(max_delay) = self.retry.max_delay_secs {
            if max_delay == 0 {
                anyhow::bail!("retry.max_delay_secs must be > 0");
            }
        }

        if let Some(tts) = &self.speech.tts {
            if tts.max_chars == 0 {
                anyhow::bail!("speech.tts.max_chars must be > 0");
            }
            if tts.voice.trim().is_empty() {
                anyhow::bail!("speech.tts.voice cannot be empty");
            }
        }

        if self.image.width == 0 || self.image.height == 0 {
            anyhow::bail!("image.width and image.height must be > 0");
        }

        if self.telegram.admin_id == Some(0) {
            anyhow::bail!("telegram.admin_id cannot be 0");
        }

        Ok(())
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{is_placeholder_credential, Config};

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = parse_config("");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.bot.default_model, "mistral-small-latest");
        assert_eq!(cfg.bot.max_history, 120);
        assert_eq!(cfg.bot.broadcast_delay_ms, 50);
        assert_eq!(cfg.providers.primary.name, "mistral");
        assert!(cfg.providers.gateway.is_none());
        assert_eq!(cfg.image.width, 1024);
        assert!(cfg.docs.pdf_font.is_none());
    }

    #[test]
    fn docs_section_sets_pdf_font() {
        let cfg = parse_config(
            r#"
[docs]
pdf_font = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"
"#,
        );
        assert_eq!(
            cfg.docs.pdf_font.as_deref(),
            Some("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf")
        );
    }

    #[test]
    fn validate_rejects_duplicate_model_ids() {
        let cfg = parse_config(
            r#"
[bot]
default_model = "a"

[[models]]
label = "A"
id = "a"

[[models]]
label = "A again"
id = "a"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_default_model_missing_from_models() {
        let cfg = parse_config(
            r#"
[bot]
default_model = "missing"

[[models]]
label = "Small"
id = "mistral-small-latest"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_full_configuration() {
        let cfg = parse_config(
            r#"
[core]
data_dir = "~/.sova"
log_level = "debug"

[telegram]
bot_token = "123:abc"
admin_id = 42

[providers.primary]
name = "mistral"
api_key = "k"

[providers.gateway]
name = "openrouter"
api_key = "k2"
base_url = "https://openrouter.ai/api/v1"

[speech.stt]
api_key = "gsk"
language = "ru"

[speech.tts]
api_key = "tts"
voice = "nova"

[bot]
default_model = "mistral-small-latest"
donate_text = "Thanks!"

[retry]
window_secs = 30
initial_delay_secs = 1
backoff_factor = 2
max_delay_secs = 8

[[models]]
label = "Small"
id = "mistral-small-latest"

[[models]]
label = "Gemini"
id = "google/gemini-2.0-flash-exp:free"
vision = true
"#,
        );
        assert!(cfg.validate().is_ok());
        assert!(cfg.require_telegram().is_ok());
        assert!(cfg.usable_gateway().is_some());
        assert_eq!(cfg.speech.stt.as_ref().map(|s| s.model.as_str()), Some("whisper-large-v3"));
        assert!(cfg.models[1].vision);
    }

    #[test]
    fn validate_rejects_zero_retry_window() {
        let cfg = parse_config(
            r#"
[retry]
window_secs = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn require_telegram_rejects_missing_token() {
        let cfg = parse_config("");
        assert!(cfg.require_telegram().is_err());
    }

    #[test]
    fn placeholder_gateway_key_is_not_usable() {
        let cfg = parse_config(
            r#"
[providers.gateway]
name = "openrouter"
api_key = "YOUR_OPENROUTER_KEY"
"#,
        );
        assert!(cfg.usable_gateway().is_none());
    }

    #[test]
    fn placeholder_detection() {
        assert!(is_placeholder_credential(""));
        assert!(is_placeholder_credential("   "));
        assert!(is_placeholder_credential("YOUR_API_KEY"));
        assert!(is_placeholder_credential("<openrouter-key>"));
        assert!(is_placeholder_credential("changeme"));
        assert!(!is_placeholder_credential("sk-or-v1-abcdef"));
    }

    #[test]
    fn data_dir_expands_home() {
        let cfg = parse_config(
            r#"
[core]
data_dir = "/var/lib/sova"
"#,
        );
        assert_eq!(cfg.data_dir(), std::path::PathBuf::from("/var/lib/sova"));
    }
}
